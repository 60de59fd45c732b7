//! Controller composition root
//!
//! A [`Controller`] owns one gateway link, the device registry, the
//! command dispatcher, and the OTA engine, and runs the two background
//! loops the whole design leans on: the inbound consumer, which is the
//! only writer of device state, and the periodic liveness sweeper.
//! Public operations resolve when their protocol finished, timed out, or
//! the controller was terminated; partial fleet convergence comes back as
//! data, not as an error.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use formic_core::{
    DeviceAddress, DeviceRecord, DeviceStatus, FirmwareImage, Packet, Position, BROADCAST_ADDRESS,
};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::{debug, info, warn};

use crate::adapter::{GatewayAdapter, LinkEvent};
use crate::dispatch::{wait_for_shutdown, CommandDispatcher, CommandOutcome};
use crate::error::ControllerError;
use crate::ota::{AckWaiters, OtaEngine, StartOtaReport, TransferOutcome};
use crate::registry::DeviceRegistry;
use crate::settings::ControllerSettings;

/// Something observable happened on the testbed.
#[derive(Debug, Clone)]
pub enum FleetEvent {
    /// A device appeared on the link.
    Joined(DeviceAddress),
    /// A device left the link explicitly.
    Left(DeviceAddress),
    /// A device reported a different status than before.
    StatusChanged {
        device: DeviceAddress,
        status: DeviceStatus,
    },
    /// A device was silent past the inactivity threshold and was swept.
    TimedOut(DeviceAddress),
    /// Application-defined event payload from a running device.
    DeviceEvent {
        device: DeviceAddress,
        timestamp_ms: u32,
        data: Vec<u8>,
    },
    /// Free-form text from a running device.
    DeviceMessage { device: DeviceAddress, text: String },
}

impl FleetEvent {
    /// The device this event is about.
    pub fn device(&self) -> DeviceAddress {
        match self {
            Self::Joined(device)
            | Self::Left(device)
            | Self::TimedOut(device)
            | Self::StatusChanged { device, .. }
            | Self::DeviceEvent { device, .. }
            | Self::DeviceMessage { device, .. } => *device,
        }
    }
}

/// Fleet controller for one gateway link.
pub struct Controller {
    settings: ControllerSettings,
    filter: BTreeSet<DeviceAddress>,
    registry: Arc<DeviceRegistry>,
    gateway: Arc<dyn GatewayAdapter>,
    waiters: Arc<AckWaiters>,
    dispatcher: CommandDispatcher,
    ota: OtaEngine,
    events: broadcast::Sender<FleetEvent>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Controller {
    /// Bring up a controller over `adapter`. Fails if the adapter cannot
    /// initialize its link; every later adapter problem is recovered or
    /// reported per operation instead. Must be called from within a Tokio
    /// runtime; the consumer and sweeper loops are spawned here and run
    /// until [`Controller::terminate`] or drop.
    pub fn new<A>(mut adapter: A, settings: ControllerSettings) -> Result<Self, ControllerError>
    where
        A: GatewayAdapter + 'static,
    {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        adapter.init(link_tx)?;
        let gateway: Arc<dyn GatewayAdapter> = Arc::new(adapter);
        info!(adapter = gateway.name(), "Gateway link up");

        let filter: BTreeSet<DeviceAddress> = settings.devices.iter().copied().collect();
        if !filter.is_empty() {
            info!(devices = filter.len(), "Device filter active");
        }

        let registry = Arc::new(DeviceRegistry::new());
        let waiters = Arc::new(AckWaiters::default());
        let (events, _) = broadcast::channel(100);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let dispatcher = CommandDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&gateway),
            filter.iter().copied(),
            settings.attempt_delay(),
            shutdown_rx.clone(),
        );
        let ota = OtaEngine::new(
            Arc::clone(&registry),
            Arc::clone(&gateway),
            Arc::clone(&waiters),
            filter.iter().copied(),
            settings.command_timeout(),
            settings.attempt_delay(),
            shutdown_rx.clone(),
        );

        let consumer = Inbound {
            registry: Arc::clone(&registry),
            waiters: Arc::clone(&waiters),
            events: events.clone(),
        };
        let consumer = tokio::spawn(consumer.run(link_rx, shutdown_rx.clone()));
        let sweeper = tokio::spawn(run_sweeper(
            Arc::clone(&registry),
            events.clone(),
            settings.inactivity_timeout(),
            shutdown_rx,
        ));

        Ok(Self {
            settings,
            filter,
            registry,
            gateway,
            waiters,
            dispatcher,
            ota,
            events,
            shutdown,
            tasks: Mutex::new(vec![consumer, sweeper]),
        })
    }

    /// All devices currently in the registry, regardless of any filter.
    pub async fn known_devices(&self) -> Vec<DeviceAddress> {
        self.registry.known().await
    }

    /// Devices in the bootloader, scoped to the filter.
    pub async fn ready_devices(&self) -> Vec<DeviceAddress> {
        self.in_scope(self.registry.by_status(DeviceStatus::Bootloader).await)
    }

    /// Devices running the user application, scoped to the filter.
    pub async fn running_devices(&self) -> Vec<DeviceAddress> {
        self.in_scope(self.registry.by_status(DeviceStatus::Running).await)
    }

    /// Devices moving back to their assigned position, scoped to the filter.
    pub async fn resetting_devices(&self) -> Vec<DeviceAddress> {
        self.in_scope(self.registry.by_status(DeviceStatus::Resetting).await)
    }

    /// Start the user application on `targets`, or on every eligible
    /// device when `targets` is `None`. Waits up to `timeout` (default:
    /// the configured command timeout) for each target to report Running.
    pub async fn start(
        &self,
        targets: Option<Vec<DeviceAddress>>,
        timeout: Option<Duration>,
    ) -> Result<CommandOutcome, ControllerError> {
        self.ensure_live()?;
        let timeout = timeout.unwrap_or_else(|| self.settings.command_timeout());
        self.dispatcher.start(targets, timeout).await
    }

    /// Stop the user application on `targets` (default: the whole fleet),
    /// waiting for each to report Bootloader.
    pub async fn stop(
        &self,
        targets: Option<Vec<DeviceAddress>>,
        timeout: Option<Duration>,
    ) -> Result<CommandOutcome, ControllerError> {
        self.ensure_live()?;
        let timeout = timeout.unwrap_or_else(|| self.settings.command_timeout());
        self.dispatcher.stop(targets, timeout).await
    }

    /// Send each bootloader device in `locations` back to the given
    /// position. Devices not currently in the bootloader are reported
    /// missed without being commanded.
    pub async fn reset(
        &self,
        locations: &BTreeMap<DeviceAddress, Position>,
        timeout: Option<Duration>,
    ) -> Result<CommandOutcome, ControllerError> {
        self.ensure_live()?;
        let timeout = timeout.unwrap_or_else(|| self.settings.command_timeout());
        self.dispatcher.reset(locations, timeout).await
    }

    /// Deliver `text` to every running device in scope, fire and forget.
    pub async fn send_message(&self, text: &str) -> Result<CommandOutcome, ControllerError> {
        self.ensure_live()?;
        self.dispatcher.send_message(text).await
    }

    /// Announce a firmware image and collect start acknowledgments. The
    /// returned report partitions targets into `acked` (ready for
    /// [`Controller::transfer`]) and `missed`.
    pub async fn start_ota(
        &self,
        firmware: &[u8],
        targets: Option<Vec<DeviceAddress>>,
    ) -> Result<StartOtaReport, ControllerError> {
        self.ensure_live()?;
        let image = FirmwareImage::new(firmware.to_vec())?;
        self.ota.start_ota(&image, targets).await
    }

    /// Stream a firmware image to `targets`, returning a per-device
    /// outcome. Targets should be the `acked` set of a preceding
    /// [`Controller::start_ota`].
    pub async fn transfer(
        &self,
        firmware: &[u8],
        targets: &[DeviceAddress],
        chunk_timeout: Option<Duration>,
        max_chunk_retries: Option<u32>,
    ) -> Result<BTreeMap<DeviceAddress, TransferOutcome>, ControllerError> {
        self.ensure_live()?;
        let image = FirmwareImage::new(firmware.to_vec())?;
        let chunk_timeout = chunk_timeout.unwrap_or_else(|| self.settings.chunk_timeout());
        let max_chunk_retries = max_chunk_retries.unwrap_or(self.settings.max_chunk_retries);
        self.ota.transfer(&image, targets, chunk_timeout, max_chunk_retries).await
    }

    /// Ask the whole testbed to report in, wait out the collection window
    /// (default: the configured status timeout), and return the registry
    /// contents.
    pub async fn status(
        &self,
        window: Option<Duration>,
    ) -> Result<BTreeMap<DeviceAddress, DeviceRecord>, ControllerError> {
        self.ensure_live()?;
        let window = window.unwrap_or_else(|| self.settings.status_timeout());
        let frame = Packet::StatusRequest {
            device_id: BROADCAST_ADDRESS,
        }
        .encode();
        self.gateway.send(&frame)?;

        let mut shutdown = self.shutdown.subscribe();
        tokio::select! {
            _ = time::sleep(window) => {}
            _ = wait_for_shutdown(&mut shutdown) => return Err(ControllerError::Terminated),
        }
        Ok(self.registry.snapshot().await)
    }

    /// Log fleet events for devices in scope, for `window` or, when
    /// `None`, until the controller terminates.
    pub async fn monitor(&self, window: Option<Duration>) {
        let mut events = self.events.subscribe();
        let mut shutdown = self.shutdown.subscribe();
        let deadline = window.map(|window| time::Instant::now() + window);
        info!("Monitoring fleet events");

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => {
                        if self.filter.is_empty() || self.filter.contains(&event.device()) {
                            log_fleet_event(&event);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Monitor fell behind fleet events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = maybe_deadline(deadline) => break,
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }
    }

    /// Subscribe to the raw fleet event stream, unscoped by the filter.
    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.events.subscribe()
    }

    /// Stop the consumer and sweeper, abort in-flight operations, and
    /// release the gateway. Idempotent; operations after this return
    /// [`ControllerError::Terminated`].
    pub async fn terminate(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        info!("Terminating controller");
        self.waiters.clear().await;
        self.gateway.close();
        let mut tasks = self.tasks.lock().await;
        while let Some(task) = tasks.pop() {
            let _ = task.await;
        }
    }

    fn ensure_live(&self) -> Result<(), ControllerError> {
        if *self.shutdown.borrow() {
            return Err(ControllerError::Terminated);
        }
        Ok(())
    }

    fn in_scope(&self, devices: Vec<DeviceAddress>) -> Vec<DeviceAddress> {
        if self.filter.is_empty() {
            return devices;
        }
        devices
            .into_iter()
            .filter(|device| self.filter.contains(device))
            .collect()
    }
}

/// Sleeps until `deadline`, or forever when there is none.
async fn maybe_deadline(deadline: Option<time::Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn log_fleet_event(event: &FleetEvent) {
    match event {
        FleetEvent::Joined(device) => info!(device = %device, "Joined"),
        FleetEvent::Left(device) => info!(device = %device, "Left"),
        FleetEvent::TimedOut(device) => info!(device = %device, "Timed out"),
        FleetEvent::StatusChanged { device, status } => {
            info!(device = %device, status = %status, "Status changed");
        }
        FleetEvent::DeviceEvent { device, timestamp_ms, data } => {
            info!(device = %device, timestamp_ms, data = %hex::encode(data), "Device event");
        }
        FleetEvent::DeviceMessage { device, text } => {
            info!(device = %device, text = %text, "Device message");
        }
    }
}

/// The single writer of device state: consumes every link event, updates
/// the registry, and resolves pending OTA acknowledgments.
struct Inbound {
    registry: Arc<DeviceRegistry>,
    waiters: Arc<AckWaiters>,
    events: broadcast::Sender<FleetEvent>,
}

impl Inbound {
    async fn run(
        self,
        mut link_events: mpsc::UnboundedReceiver<LinkEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = link_events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    // The adapter dropped its side of the channel.
                    None => break,
                },
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }
        debug!("Inbound consumer stopped");
    }

    async fn handle(&self, event: LinkEvent) {
        match event {
            LinkEvent::Joined(address) => {
                if self.registry.mark_joined(address, Instant::now()).await {
                    self.emit(FleetEvent::Joined(address));
                }
            }
            LinkEvent::Left(address) => {
                if self.registry.remove(address).await {
                    self.emit(FleetEvent::Left(address));
                }
            }
            LinkEvent::Frame { source, payload } => match Packet::decode(&payload) {
                Ok(packet) => self.apply(source, packet).await,
                Err(err) => {
                    warn!(device = %source, error = %err, bytes = payload.len(), "Dropped malformed frame");
                }
            },
        }
    }

    /// Apply one decoded frame from `source`. Attribution follows the
    /// link-level source address, not the packet's device id field.
    async fn apply(&self, source: DeviceAddress, packet: Packet) {
        // Any decodable frame proves the node exists.
        if self.registry.mark_joined(source, Instant::now()).await {
            self.emit(FleetEvent::Joined(source));
        }
        match packet {
            Packet::StatusNotification {
                status,
                battery_millivolts,
                device_type,
                position,
                ..
            } => {
                let changed = self
                    .registry
                    .apply_status(
                        source,
                        status,
                        device_type,
                        battery_millivolts,
                        Some(position),
                        Instant::now(),
                    )
                    .await;
                if changed {
                    self.emit(FleetEvent::StatusChanged { device: source, status });
                }
            }
            Packet::OtaStartAck { .. } => {
                if !self.waiters.resolve_start(source).await {
                    debug!(device = %source, "OTA start ack with no waiter");
                }
            }
            Packet::OtaChunkAck { index, hashes_match, .. } => {
                if !self.waiters.resolve_chunk(source, index, hashes_match).await {
                    debug!(device = %source, chunk = index, "Chunk ack with no waiter");
                }
            }
            Packet::EventNotification { timestamp_ms, data, .. } => {
                debug!(device = %source, timestamp_ms, bytes = data.len(), "Device event");
                self.emit(FleetEvent::DeviceEvent {
                    device: source,
                    timestamp_ms,
                    data,
                });
            }
            Packet::MessageNotification { message, .. } => {
                let text = String::from_utf8_lossy(&message).into_owned();
                debug!(device = %source, text = %text, "Device message");
                self.emit(FleetEvent::DeviceMessage { device: source, text });
            }
            // Requests travel controller-to-device; one arriving here means
            // another controller shares the link.
            _ => debug!(device = %source, "Ignoring request frame seen on the link"),
        }
    }

    fn emit(&self, event: FleetEvent) {
        let _ = self.events.send(event);
    }
}

/// Periodically forgets devices that have gone silent.
async fn run_sweeper(
    registry: Arc<DeviceRegistry>,
    events: broadcast::Sender<FleetEvent>,
    inactivity: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    // Half the threshold bounds how long a dead device can overstay.
    let mut ticker = time::interval(inactivity / 2);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for address in registry.sweep(Instant::now(), inactivity).await {
                    let _ = events.send(FleetEvent::TimedOut(address));
                }
            }
            _ = wait_for_shutdown(&mut shutdown) => break,
        }
    }
    debug!("Liveness sweeper stopped");
}
