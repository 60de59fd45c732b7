//! Fleet command dispatch
//!
//! Start, stop, reset, and message delivery. None of these have a
//! packet-level acknowledgment; a command "succeeds" for a target when the
//! registry later shows the commanded status, fed by the target's periodic
//! status frames. The dispatcher therefore transmits, re-transmits on a
//! fixed cadence, and watches the registry until every target converged or
//! the deadline passed. Partial convergence is a normal result, not an
//! error.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use formic_core::{DeviceAddress, DeviceStatus, Packet, Position, BROADCAST_ADDRESS};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{self, Duration};
use tracing::{debug, info, warn};

use crate::adapter::{AdapterError, GatewayAdapter};
use crate::error::ControllerError;
use crate::registry::DeviceRegistry;

/// Per-target result of one dispatched command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandOutcome {
    /// Targets observed in the commanded state before the deadline. For
    /// messages, the targets the message was sent to.
    pub converged: Vec<DeviceAddress>,
    /// Targets that never showed the commanded state.
    pub missed: Vec<DeviceAddress>,
}

impl CommandOutcome {
    /// True when every resolved target converged.
    pub fn is_complete(&self) -> bool {
        self.missed.is_empty()
    }
}

/// Status transitions the dispatcher can command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Start,
    Stop,
}

impl Transition {
    fn name(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
        }
    }

    /// Status that proves the transition happened.
    fn desired(self) -> DeviceStatus {
        match self {
            Self::Start => DeviceStatus::Running,
            Self::Stop => DeviceStatus::Bootloader,
        }
    }

    /// Whether a device currently in `status` belongs to a broadcast of
    /// this transition. Devices already in the desired state converge
    /// trivially; devices the command cannot move are left out.
    fn addresses(self, status: DeviceStatus) -> bool {
        match self {
            Self::Start => matches!(status, DeviceStatus::Bootloader | DeviceStatus::Running),
            Self::Stop => true,
        }
    }

    fn request(self, device_id: DeviceAddress) -> Packet {
        match self {
            Self::Start => Packet::StartRequest { device_id },
            Self::Stop => Packet::StopRequest { device_id },
        }
    }
}

/// Frames a command or OTA handshake puts on the link, and keeps
/// re-sending while targets have not converged or acked.
pub(crate) enum Outgoing {
    /// A single frame addressed to everyone.
    Broadcast(Vec<u8>),
    /// One frame per target, re-sent only while that target is pending.
    PerTarget(HashMap<DeviceAddress, Vec<u8>>),
}

impl Outgoing {
    pub(crate) fn transmit(
        &self,
        gateway: &dyn GatewayAdapter,
        pending: &BTreeSet<DeviceAddress>,
    ) -> Result<(), AdapterError> {
        match self {
            Self::Broadcast(frame) => gateway.send(frame)?,
            Self::PerTarget(frames) => {
                for address in pending {
                    if let Some(frame) = frames.get(address) {
                        gateway.send(frame)?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Reject the broadcast address as an explicit target, and explicit
/// targets outside a configured (non-empty) device filter.
pub(crate) fn check_targets(
    filter: &BTreeSet<DeviceAddress>,
    targets: &[DeviceAddress],
) -> Result<(), ControllerError> {
    if targets.iter().any(|target| target.is_broadcast()) {
        return Err(ControllerError::BroadcastTarget);
    }
    if !filter.is_empty() {
        let outside: Vec<DeviceAddress> = targets
            .iter()
            .copied()
            .filter(|target| !filter.contains(target))
            .collect();
        if !outside.is_empty() {
            return Err(ControllerError::OutsideFilter(outside));
        }
    }
    Ok(())
}

struct CommandPlan {
    name: &'static str,
    desired: DeviceStatus,
    watched: BTreeSet<DeviceAddress>,
    outgoing: Outgoing,
}

/// Issues fleet commands and waits for registry-observed convergence.
pub(crate) struct CommandDispatcher {
    registry: Arc<DeviceRegistry>,
    gateway: Arc<dyn GatewayAdapter>,
    filter: BTreeSet<DeviceAddress>,
    attempt_delay: Duration,
    shutdown: watch::Receiver<bool>,
}

impl CommandDispatcher {
    pub(crate) fn new(
        registry: Arc<DeviceRegistry>,
        gateway: Arc<dyn GatewayAdapter>,
        filter: impl IntoIterator<Item = DeviceAddress>,
        attempt_delay: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            registry,
            gateway,
            filter: filter.into_iter().collect(),
            attempt_delay,
            shutdown,
        }
    }

    /// Command `targets` (or the whole eligible fleet) into the Running
    /// state, waiting up to `timeout` for convergence.
    pub(crate) async fn start(
        &self,
        targets: Option<Vec<DeviceAddress>>,
        timeout: Duration,
    ) -> Result<CommandOutcome, ControllerError> {
        let plan = self.plan_transition(Transition::Start, targets).await?;
        self.drive(plan, timeout).await
    }

    /// Command `targets` (or the whole fleet) back into the bootloader.
    pub(crate) async fn stop(
        &self,
        targets: Option<Vec<DeviceAddress>>,
        timeout: Duration,
    ) -> Result<CommandOutcome, ControllerError> {
        let plan = self.plan_transition(Transition::Stop, targets).await?;
        self.drive(plan, timeout).await
    }

    /// Send each bootloader device in `locations` back to its assigned
    /// position. Devices in any other state cannot take a reset and are
    /// reported missed without a frame ever being sent.
    pub(crate) async fn reset(
        &self,
        locations: &BTreeMap<DeviceAddress, Position>,
        timeout: Duration,
    ) -> Result<CommandOutcome, ControllerError> {
        let targets: Vec<DeviceAddress> = locations.keys().copied().collect();
        check_targets(&self.filter, &targets)?;

        let mut frames = HashMap::new();
        let mut ineligible = Vec::new();
        for (&device_id, &position) in locations {
            if self.registry.status_of(device_id).await == Some(DeviceStatus::Bootloader) {
                let frame = Packet::ResetRequest { device_id, position }.encode();
                frames.insert(device_id, frame);
            } else {
                warn!(device = %device_id, "Reset skipped, device is not in the bootloader");
                ineligible.push(device_id);
            }
        }

        let plan = CommandPlan {
            name: "reset",
            desired: DeviceStatus::Resetting,
            watched: frames.keys().copied().collect(),
            outgoing: Outgoing::PerTarget(frames),
        };
        let mut outcome = self.drive(plan, timeout).await?;
        outcome.missed.extend(ineligible);
        outcome.missed.sort_unstable();
        Ok(outcome)
    }

    /// Deliver `text` to every running device in scope. Fire and forget:
    /// one send, no convergence wait, no retry.
    pub(crate) async fn send_message(&self, text: &str) -> Result<CommandOutcome, ControllerError> {
        if text.len() > u8::MAX as usize {
            return Err(ControllerError::MessageTooLong(text.len()));
        }
        let running = self.registry.by_status(DeviceStatus::Running).await;

        let delivered: Vec<DeviceAddress> = if self.filter.is_empty() {
            // Unfiltered: one broadcast frame reaches every running node,
            // non-running nodes cannot process it and drop it.
            let frame = Packet::MessageRequest {
                device_id: BROADCAST_ADDRESS,
                message: text.as_bytes().to_vec(),
            }
            .encode();
            self.gateway.send(&frame)?;
            running
        } else {
            let scoped: Vec<DeviceAddress> = running
                .into_iter()
                .filter(|address| self.filter.contains(address))
                .collect();
            for &device_id in &scoped {
                let frame = Packet::MessageRequest {
                    device_id,
                    message: text.as_bytes().to_vec(),
                }
                .encode();
                self.gateway.send(&frame)?;
            }
            scoped
        };

        info!(targets = delivered.len(), bytes = text.len(), "Message sent");
        Ok(CommandOutcome {
            converged: delivered,
            missed: Vec::new(),
        })
    }

    /// Build the target set and frames for a start/stop command.
    async fn plan_transition(
        &self,
        transition: Transition,
        targets: Option<Vec<DeviceAddress>>,
    ) -> Result<CommandPlan, ControllerError> {
        let explicit = match targets {
            Some(list) => {
                check_targets(&self.filter, &list)?;
                Some(list)
            }
            // Without explicit targets a configured filter is the target
            // set; otherwise the command goes out as a single broadcast.
            None if !self.filter.is_empty() => Some(self.filter.iter().copied().collect()),
            None => None,
        };

        let (watched, outgoing) = match explicit {
            Some(list) => {
                let watched: BTreeSet<DeviceAddress> = list.into_iter().collect();
                let frames: HashMap<DeviceAddress, Vec<u8>> = watched
                    .iter()
                    .map(|&device_id| (device_id, transition.request(device_id).encode()))
                    .collect();
                (watched, Outgoing::PerTarget(frames))
            }
            None => {
                // Snapshot the audience now; devices appearing later are
                // not part of this command's report.
                let watched: BTreeSet<DeviceAddress> = self
                    .registry
                    .snapshot()
                    .await
                    .values()
                    .filter(|record| transition.addresses(record.status))
                    .map(|record| record.address)
                    .collect();
                let frame = transition.request(BROADCAST_ADDRESS).encode();
                (watched, Outgoing::Broadcast(frame))
            }
        };

        Ok(CommandPlan {
            name: transition.name(),
            desired: transition.desired(),
            watched,
            outgoing,
        })
    }

    /// Transmit, then re-transmit every `attempt_delay` until every watched
    /// target shows the desired status or `timeout` passes. Wakes on
    /// registry changes rather than polling.
    async fn drive(
        &self,
        plan: CommandPlan,
        timeout: Duration,
    ) -> Result<CommandOutcome, ControllerError> {
        let mut changes = self.registry.subscribe();
        let mut shutdown = self.shutdown.clone();
        let deadline = time::Instant::now() + timeout;

        let mut pending = plan.watched;
        let mut converged: Vec<DeviceAddress> = Vec::new();

        info!(command = plan.name, targets = pending.len(), "Dispatching command");
        plan.outgoing.transmit(self.gateway.as_ref(), &pending)?;
        self.prune_converged(&mut pending, &mut converged, plan.desired).await;

        let mut resend = time::interval_at(time::Instant::now() + self.attempt_delay, self.attempt_delay);
        resend.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        while !pending.is_empty() {
            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = resend.tick() => {
                    plan.outgoing.transmit(self.gateway.as_ref(), &pending)?;
                }
                _ = time::sleep_until(deadline) => break,
                _ = wait_for_shutdown(&mut shutdown) => {
                    return Err(ControllerError::Terminated);
                }
            }
            self.prune_converged(&mut pending, &mut converged, plan.desired).await;
        }

        // One last look, in case a status frame landed right at the deadline.
        self.prune_converged(&mut pending, &mut converged, plan.desired).await;

        let missed: Vec<DeviceAddress> = pending.into_iter().collect();
        converged.sort_unstable();
        if missed.is_empty() {
            info!(command = plan.name, converged = converged.len(), "Command converged");
        } else {
            warn!(
                command = plan.name,
                converged = converged.len(),
                missed = missed.len(),
                "Command deadline passed with unconverged targets"
            );
        }
        Ok(CommandOutcome { converged, missed })
    }

    async fn prune_converged(
        &self,
        pending: &mut BTreeSet<DeviceAddress>,
        converged: &mut Vec<DeviceAddress>,
        desired: DeviceStatus,
    ) {
        if pending.is_empty() {
            return;
        }
        let records = self.registry.snapshot().await;
        let done: Vec<DeviceAddress> = pending
            .iter()
            .copied()
            .filter(|address| {
                records
                    .get(address)
                    .is_some_and(|record| record.status == desired)
            })
            .collect();
        for address in done {
            pending.remove(&address);
            debug!(device = %address, status = %desired, "Target converged");
            converged.push(address);
        }
    }
}

/// Resolves when the controller is shutting down. A dropped sender counts
/// as shutdown.
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
