//! Over-the-air firmware transfer
//!
//! Two phases. The start handshake announces the image (length, chunk
//! count, digest) and partitions targets into acked and missed; the
//! chunked transfer then runs once per acked device, each device
//! independent of the others. Unlike fleet commands, both phases have
//! real packet-level acknowledgments, delivered to the in-flight call
//! through per-device oneshot channels that the controller's inbound
//! consumer resolves.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use formic_core::{DeviceAddress, DeviceStatus, FirmwareImage, Packet, BROADCAST_ADDRESS};
use serde::Serialize;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::{self, Duration};
use tracing::{debug, info, warn};

use crate::adapter::GatewayAdapter;
use crate::dispatch::{check_targets, wait_for_shutdown, Outgoing};
use crate::error::ControllerError;
use crate::registry::DeviceRegistry;

/// Result of the OTA start handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartOtaReport {
    /// Targets that acknowledged and may receive chunks.
    pub acked: Vec<DeviceAddress>,
    /// Targets that never acknowledged; excluded from the transfer.
    pub missed: Vec<DeviceAddress>,
    /// Hex digest of the announced image.
    pub sha256: String,
    /// Number of chunks the transfer will send.
    pub chunk_count: u32,
}

/// Per-device result of a chunked transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransferOutcome {
    /// Every chunk was acknowledged within the retry budget.
    pub success: bool,
    /// The device-side digest of the reassembled image matched the
    /// announced one. Only meaningful when `success` is true.
    pub hashes_match: bool,
}

impl TransferOutcome {
    fn aborted() -> Self {
        Self {
            success: false,
            hashes_match: false,
        }
    }
}

/// Pending acknowledgments, keyed by device (and chunk index). An OTA
/// call registers interest before sending; the inbound consumer resolves
/// the matching entry when the ack frame arrives. Registering twice for
/// the same key replaces the stale waiter.
#[derive(Debug, Default)]
pub(crate) struct AckWaiters {
    start: Mutex<HashMap<DeviceAddress, oneshot::Sender<()>>>,
    chunk: Mutex<HashMap<(DeviceAddress, u32), oneshot::Sender<bool>>>,
}

impl AckWaiters {
    pub(crate) async fn expect_start(&self, device: DeviceAddress) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.start.lock().await.insert(device, tx);
        rx
    }

    pub(crate) async fn expect_chunk(
        &self,
        device: DeviceAddress,
        index: u32,
    ) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        self.chunk.lock().await.insert((device, index), tx);
        rx
    }

    /// Resolve a start-handshake waiter. Returns false when nobody was
    /// waiting on `device`.
    pub(crate) async fn resolve_start(&self, device: DeviceAddress) -> bool {
        match self.start.lock().await.remove(&device) {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// Resolve a chunk waiter for exactly `(device, index)`.
    pub(crate) async fn resolve_chunk(
        &self,
        device: DeviceAddress,
        index: u32,
        hashes_match: bool,
    ) -> bool {
        match self.chunk.lock().await.remove(&(device, index)) {
            Some(tx) => tx.send(hashes_match).is_ok(),
            None => false,
        }
    }

    pub(crate) async fn forget_start(&self, device: DeviceAddress) {
        self.start.lock().await.remove(&device);
    }

    pub(crate) async fn forget_chunk(&self, device: DeviceAddress, index: u32) {
        self.chunk.lock().await.remove(&(device, index));
    }

    /// Drop every waiter. In-flight calls observe their channel closing
    /// and abort.
    pub(crate) async fn clear(&self) {
        self.start.lock().await.clear();
        self.chunk.lock().await.clear();
    }
}

/// Runs OTA handshakes and chunked transfers against the fleet.
pub(crate) struct OtaEngine {
    registry: Arc<DeviceRegistry>,
    gateway: Arc<dyn GatewayAdapter>,
    waiters: Arc<AckWaiters>,
    filter: BTreeSet<DeviceAddress>,
    command_timeout: Duration,
    attempt_delay: Duration,
    shutdown: watch::Receiver<bool>,
}

impl OtaEngine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        registry: Arc<DeviceRegistry>,
        gateway: Arc<dyn GatewayAdapter>,
        waiters: Arc<AckWaiters>,
        filter: impl IntoIterator<Item = DeviceAddress>,
        command_timeout: Duration,
        attempt_delay: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            registry,
            gateway,
            waiters,
            filter: filter.into_iter().collect(),
            command_timeout,
            attempt_delay,
            shutdown,
        }
    }

    /// Announce `image` to `targets` (or every bootloader device) and wait
    /// for start acknowledgments, retransmitting until the deadline.
    pub(crate) async fn start_ota(
        &self,
        image: &FirmwareImage,
        targets: Option<Vec<DeviceAddress>>,
    ) -> Result<StartOtaReport, ControllerError> {
        let explicit = match targets {
            Some(list) => {
                check_targets(&self.filter, &list)?;
                Some(list)
            }
            None if !self.filter.is_empty() => Some(self.filter.iter().copied().collect()),
            None => None,
        };

        let (audience, outgoing) = match explicit {
            Some(list) => {
                let audience: BTreeSet<DeviceAddress> = list.into_iter().collect();
                let frames: HashMap<DeviceAddress, Vec<u8>> = audience
                    .iter()
                    .map(|&device| (device, start_request(image, device).encode()))
                    .collect();
                (audience, Outgoing::PerTarget(frames))
            }
            None => {
                // Only bootloader devices can take an update; snapshot them
                // as the audience for the broadcast announcement.
                let audience: BTreeSet<DeviceAddress> = self
                    .registry
                    .by_status(DeviceStatus::Bootloader)
                    .await
                    .into_iter()
                    .collect();
                let frame = start_request(image, BROADCAST_ADDRESS).encode();
                (audience, Outgoing::Broadcast(frame))
            }
        };

        let mut pending = audience.clone();
        let mut acked: Vec<DeviceAddress> = Vec::new();
        let mut handshakes = JoinSet::new();
        for &device in &audience {
            let rx = self.waiters.expect_start(device).await;
            handshakes.spawn(async move { (device, rx.await.is_ok()) });
        }

        info!(
            targets = pending.len(),
            bytes = image.len(),
            chunks = image.chunk_count(),
            sha256 = %image.sha256_hex(),
            "Announcing firmware image"
        );
        if let Err(err) = outgoing.transmit(self.gateway.as_ref(), &pending) {
            self.forget_pending_starts(&pending).await;
            return Err(err.into());
        }

        let deadline = time::Instant::now() + self.command_timeout;
        let mut resend = time::interval_at(time::Instant::now() + self.attempt_delay, self.attempt_delay);
        resend.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        let mut shutdown = self.shutdown.clone();

        while !pending.is_empty() {
            tokio::select! {
                Some(joined) = handshakes.join_next() => {
                    if let Ok((device, true)) = joined {
                        if pending.remove(&device) {
                            debug!(device = %device, "OTA start acknowledged");
                            acked.push(device);
                        }
                    }
                }
                _ = resend.tick() => {
                    if let Err(err) = outgoing.transmit(self.gateway.as_ref(), &pending) {
                        self.forget_pending_starts(&pending).await;
                        return Err(err.into());
                    }
                }
                _ = time::sleep_until(deadline) => break,
                _ = wait_for_shutdown(&mut shutdown) => {
                    self.forget_pending_starts(&pending).await;
                    return Err(ControllerError::Terminated);
                }
            }
        }

        self.forget_pending_starts(&pending).await;
        acked.sort_unstable();
        let missed: Vec<DeviceAddress> = pending.into_iter().collect();
        if missed.is_empty() {
            info!(acked = acked.len(), "OTA handshake complete");
        } else {
            warn!(
                acked = acked.len(),
                missed = missed.len(),
                "OTA handshake deadline passed with unacked targets"
            );
        }
        Ok(StartOtaReport {
            acked,
            missed,
            sha256: image.sha256_hex(),
            chunk_count: image.chunk_count(),
        })
    }

    /// Stream `image` chunk by chunk to every device in `targets`,
    /// concurrently across devices and strictly in order within each.
    pub(crate) async fn transfer(
        &self,
        image: &FirmwareImage,
        targets: &[DeviceAddress],
        chunk_timeout: Duration,
        max_chunk_retries: u32,
    ) -> Result<BTreeMap<DeviceAddress, TransferOutcome>, ControllerError> {
        check_targets(&self.filter, targets)?;
        let image = Arc::new(image.clone());
        let unique: BTreeSet<DeviceAddress> = targets.iter().copied().collect();

        info!(
            targets = unique.len(),
            chunks = image.chunk_count(),
            "Starting chunked transfer"
        );
        let mut transfers = JoinSet::new();
        for &device in &unique {
            let gateway = Arc::clone(&self.gateway);
            let waiters = Arc::clone(&self.waiters);
            let image = Arc::clone(&image);
            let shutdown = self.shutdown.clone();
            transfers.spawn(async move {
                let outcome = device_transfer(
                    gateway,
                    waiters,
                    image,
                    device,
                    chunk_timeout,
                    max_chunk_retries,
                    shutdown,
                )
                .await;
                (device, outcome)
            });
        }

        let mut outcomes = BTreeMap::new();
        while let Some(joined) = transfers.join_next().await {
            match joined {
                Ok((device, outcome)) => {
                    if outcome.success {
                        info!(
                            device = %device,
                            hashes_match = outcome.hashes_match,
                            "Transfer finished"
                        );
                    } else {
                        warn!(device = %device, "Transfer aborted");
                    }
                    outcomes.insert(device, outcome);
                }
                Err(err) => warn!(error = %err, "Transfer task failed"),
            }
        }
        Ok(outcomes)
    }

    async fn forget_pending_starts(&self, pending: &BTreeSet<DeviceAddress>) {
        for &device in pending {
            self.waiters.forget_start(device).await;
        }
    }
}

fn start_request(image: &FirmwareImage, device_id: DeviceAddress) -> Packet {
    Packet::OtaStartRequest {
        device_id,
        fw_length: image.len(),
        chunk_count: image.chunk_count(),
        sha256: *image.sha256(),
    }
}

/// Push every chunk to one device, in order, resending on ack timeout.
/// Exhausting the retry budget for any chunk aborts this device only.
async fn device_transfer(
    gateway: Arc<dyn GatewayAdapter>,
    waiters: Arc<AckWaiters>,
    image: Arc<FirmwareImage>,
    device: DeviceAddress,
    chunk_timeout: Duration,
    max_chunk_retries: u32,
    mut shutdown: watch::Receiver<bool>,
) -> TransferOutcome {
    let mut hashes_match = false;
    for (index, data) in image.chunks() {
        let frame = Packet::OtaChunkRequest {
            device_id: device,
            index,
            data: data.to_vec(),
        }
        .encode();
        // The waiter stays armed across resends, so an ack raced against
        // a timeout still lands on the next attempt.
        let mut rx = waiters.expect_chunk(device, index).await;
        let mut acked = None;

        // Total sends per chunk: the initial one plus max_chunk_retries.
        'attempts: for attempt in 0..=max_chunk_retries {
            if let Err(err) = gateway.send(&frame) {
                warn!(device = %device, chunk = index, error = %err, "Chunk send failed");
                waiters.forget_chunk(device, index).await;
                return TransferOutcome::aborted();
            }
            tokio::select! {
                ack = &mut rx => {
                    if let Ok(matched) = ack {
                        acked = Some(matched);
                    }
                    // Err means the waiter was cleared underneath us;
                    // fall through to the abort path.
                    break 'attempts;
                }
                _ = time::sleep(chunk_timeout) => {
                    if attempt < max_chunk_retries {
                        debug!(device = %device, chunk = index, attempt = attempt + 1, "Chunk ack timed out, resending");
                    }
                }
                _ = wait_for_shutdown(&mut shutdown) => {
                    waiters.forget_chunk(device, index).await;
                    return TransferOutcome::aborted();
                }
            }
        }

        match acked {
            Some(matched) => hashes_match = matched,
            None => {
                warn!(device = %device, chunk = index, "No chunk ack within retry budget, aborting transfer");
                waiters.forget_chunk(device, index).await;
                return TransferOutcome::aborted();
            }
        }
    }
    TransferOutcome {
        success: true,
        hashes_match,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::adapter::{AdapterError, LinkEvent};

    /// Gateway that acks OTA frames like a healthy device would, after
    /// optionally swallowing the first `drop_sends` chunk requests.
    #[derive(Debug)]
    struct AckingGateway {
        waiters: Arc<AckWaiters>,
        ack_for: Vec<DeviceAddress>,
        drop_sends: AtomicU32,
        sent: StdMutex<Vec<Packet>>,
    }

    impl AckingGateway {
        fn new(waiters: Arc<AckWaiters>, ack_for: Vec<DeviceAddress>) -> Self {
            Self {
                waiters,
                ack_for,
                drop_sends: AtomicU32::new(0),
                sent: StdMutex::new(Vec::new()),
            }
        }

        fn drop_first(self, count: u32) -> Self {
            self.drop_sends.store(count, Ordering::SeqCst);
            self
        }
    }

    impl GatewayAdapter for AckingGateway {
        fn name(&self) -> &'static str {
            "acking"
        }

        fn init(
            &mut self,
            _events: tokio::sync::mpsc::UnboundedSender<LinkEvent>,
        ) -> Result<(), AdapterError> {
            Ok(())
        }

        fn send(&self, frame: &[u8]) -> Result<(), AdapterError> {
            let packet = Packet::decode(frame).map_err(|err| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string())
            })?;
            self.sent.lock().unwrap().push(packet.clone());
            match packet {
                Packet::OtaStartRequest { device_id, .. } => {
                    for &device in &self.ack_for {
                        if device_id == device || device_id.is_broadcast() {
                            let waiters = Arc::clone(&self.waiters);
                            tokio::spawn(async move {
                                waiters.resolve_start(device).await;
                            });
                        }
                    }
                }
                Packet::OtaChunkRequest { device_id, index, .. } => {
                    if self
                        .drop_sends
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                        .is_ok()
                    {
                        return Ok(());
                    }
                    for &device in &self.ack_for {
                        if device_id == device {
                            let waiters = Arc::clone(&self.waiters);
                            tokio::spawn(async move {
                                waiters.resolve_chunk(device, index, true).await;
                            });
                        }
                    }
                }
                _ => {}
            }
            Ok(())
        }

        fn close(&self) {}
    }

    fn engine(
        gateway: Arc<dyn GatewayAdapter>,
        waiters: Arc<AckWaiters>,
    ) -> (OtaEngine, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let engine = OtaEngine::new(
            Arc::new(DeviceRegistry::new()),
            gateway,
            waiters,
            Vec::new(),
            Duration::from_millis(100),
            Duration::from_millis(20),
            shutdown_rx,
        );
        (engine, shutdown_tx)
    }

    fn image(len: usize) -> FirmwareImage {
        FirmwareImage::new(vec![0xA5; len]).unwrap()
    }

    #[tokio::test]
    async fn test_ack_waiters_resolve_and_clear() {
        let waiters = AckWaiters::default();
        let device = DeviceAddress(0x7);

        let start_rx = waiters.expect_start(device).await;
        assert!(waiters.resolve_start(device).await);
        assert!(start_rx.await.is_ok());
        assert!(!waiters.resolve_start(device).await);

        let chunk_rx = waiters.expect_chunk(device, 3).await;
        // An ack for a different index must not resolve this waiter.
        assert!(!waiters.resolve_chunk(device, 2, true).await);
        assert!(waiters.resolve_chunk(device, 3, true).await);
        assert_eq!(chunk_rx.await, Ok(true));

        let doomed = waiters.expect_chunk(device, 4).await;
        waiters.clear().await;
        assert!(doomed.await.is_err());
    }

    #[tokio::test]
    async fn test_start_ota_partitions_acked_and_missed() {
        let waiters = Arc::new(AckWaiters::default());
        let responsive = DeviceAddress(0xA);
        let silent = DeviceAddress(0xB);
        let gateway = Arc::new(AckingGateway::new(Arc::clone(&waiters), vec![responsive]));
        let (engine, _shutdown) = engine(gateway, Arc::clone(&waiters));

        let report = engine
            .start_ota(&image(300), Some(vec![responsive, silent]))
            .await
            .unwrap();
        assert_eq!(report.acked, vec![responsive]);
        assert_eq!(report.missed, vec![silent]);
        assert_eq!(report.chunk_count, 3);
        assert_eq!(report.sha256, image(300).sha256_hex());
    }

    #[tokio::test]
    async fn test_device_transfer_happy_path() {
        let waiters = Arc::new(AckWaiters::default());
        let device = DeviceAddress(0xA);
        let gateway = Arc::new(AckingGateway::new(Arc::clone(&waiters), vec![device]));
        let (engine, _shutdown) = engine(gateway, Arc::clone(&waiters));

        let outcomes = engine
            .transfer(&image(300), &[device], Duration::from_millis(50), 3)
            .await
            .unwrap();
        assert_eq!(
            outcomes.get(&device),
            Some(&TransferOutcome { success: true, hashes_match: true }),
        );
    }

    #[tokio::test]
    async fn test_device_transfer_recovers_from_lost_sends() {
        let waiters = Arc::new(AckWaiters::default());
        let device = DeviceAddress(0xA);
        let gateway = Arc::new(
            AckingGateway::new(Arc::clone(&waiters), vec![device]).drop_first(2),
        );
        let (engine, _shutdown) =
            engine(Arc::clone(&gateway) as Arc<dyn GatewayAdapter>, Arc::clone(&waiters));

        let outcomes = engine
            .transfer(&image(200), &[device], Duration::from_millis(20), 3)
            .await
            .unwrap();
        assert_eq!(
            outcomes.get(&device),
            Some(&TransferOutcome { success: true, hashes_match: true }),
        );
        // Chunk zero went out three times before it was finally acked.
        let first_chunk_sends = gateway
            .sent
            .lock()
            .unwrap()
            .iter()
            .filter(|packet| matches!(packet, Packet::OtaChunkRequest { index: 0, .. }))
            .count();
        assert_eq!(first_chunk_sends, 3);
    }

    #[tokio::test]
    async fn test_device_transfer_retry_exhaustion() {
        let waiters = Arc::new(AckWaiters::default());
        let device = DeviceAddress(0xA);
        // Acks for nobody: every chunk send is ignored.
        let gateway = Arc::new(AckingGateway::new(Arc::clone(&waiters), Vec::new()));
        let (engine, _shutdown) = engine(gateway, Arc::clone(&waiters));

        let outcomes = engine
            .transfer(&image(64), &[device], Duration::from_millis(10), 2)
            .await
            .unwrap();
        assert_eq!(outcomes.get(&device), Some(&TransferOutcome::aborted()));
    }
}
