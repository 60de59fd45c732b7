//! In-memory registry of live testbed devices
//!
//! The registry is the single source of truth for which devices exist and
//! what they last reported. All writes happen on the controller's inbound
//! consumer task and the liveness sweeper; everything else reads snapshots.
//! Every mutation bumps a generation counter on a watch channel, which is
//! what the dispatch and OTA loops block on instead of polling.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use formic_core::{DeviceAddress, DeviceRecord, DeviceStatus, DeviceType, Position};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info};

/// Registry of devices currently considered present on the testbed.
#[derive(Debug)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<DeviceAddress, DeviceRecord>>,
    generation: watch::Sender<u64>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            devices: RwLock::new(HashMap::new()),
            generation,
        }
    }

    /// Subscribe to registry changes. The receiver wakes whenever any
    /// record is inserted, updated, or removed; the value itself is just a
    /// change counter.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    fn bump(&self) {
        self.generation.send_modify(|generation| *generation += 1);
    }

    /// Make sure `address` has a record, creating a fresh bootloader entry
    /// if it was unknown. Returns true when the device is new. A join for
    /// an already-known device changes nothing; only status frames refresh
    /// `last_seen`.
    pub(crate) async fn mark_joined(&self, address: DeviceAddress, now: Instant) -> bool {
        let mut devices = self.devices.write().await;
        if devices.contains_key(&address) {
            return false;
        }
        devices.insert(address, DeviceRecord::joined(address, now));
        drop(devices);
        info!(device = %address, "Device joined");
        self.bump();
        true
    }

    /// Apply a status report from `address`, creating the record if needed.
    /// Returns true when the reported status differs from the recorded one.
    pub(crate) async fn apply_status(
        &self,
        address: DeviceAddress,
        status: DeviceStatus,
        device_type: DeviceType,
        battery_millivolts: u16,
        position: Option<Position>,
        now: Instant,
    ) -> bool {
        let mut devices = self.devices.write().await;
        let record = devices
            .entry(address)
            .or_insert_with(|| DeviceRecord::joined(address, now));
        let changed = record.status != status;
        if changed {
            debug!(device = %address, from = %record.status, to = %status, "Device status changed");
        }
        record.status = status;
        record.device_type = device_type;
        record.battery_millivolts = battery_millivolts;
        if position.is_some() {
            record.position = position;
        }
        record.last_seen = now;
        drop(devices);
        self.bump();
        changed
    }

    /// Forget `address` immediately. Returns true if a record was removed.
    pub(crate) async fn remove(&self, address: DeviceAddress) -> bool {
        let removed = self.devices.write().await.remove(&address).is_some();
        if removed {
            info!(device = %address, "Device left");
            self.bump();
        }
        removed
    }

    /// Drop every record silent for longer than `threshold`, returning the
    /// swept addresses.
    pub(crate) async fn sweep(&self, now: Instant, threshold: Duration) -> Vec<DeviceAddress> {
        let mut devices = self.devices.write().await;
        let stale: Vec<DeviceAddress> = devices
            .values()
            .filter(|record| record.is_stale(now, threshold))
            .map(|record| record.address)
            .collect();
        for address in &stale {
            devices.remove(address);
        }
        drop(devices);
        if !stale.is_empty() {
            for address in &stale {
                info!(device = %address, "Device timed out, removed from registry");
            }
            self.bump();
        }
        stale
    }

    /// Ordered snapshot of every record, for display and reporting.
    pub async fn snapshot(&self) -> BTreeMap<DeviceAddress, DeviceRecord> {
        self.devices
            .read()
            .await
            .iter()
            .map(|(address, record)| (*address, record.clone()))
            .collect()
    }

    /// Record for one device, if present.
    pub async fn get(&self, address: DeviceAddress) -> Option<DeviceRecord> {
        self.devices.read().await.get(&address).cloned()
    }

    /// All known addresses, sorted.
    pub async fn known(&self) -> Vec<DeviceAddress> {
        let mut addresses: Vec<DeviceAddress> = self.devices.read().await.keys().copied().collect();
        addresses.sort_unstable();
        addresses
    }

    /// Addresses currently in `status`, sorted.
    pub async fn by_status(&self, status: DeviceStatus) -> Vec<DeviceAddress> {
        let mut addresses: Vec<DeviceAddress> = self
            .devices
            .read()
            .await
            .values()
            .filter(|record| record.status == status)
            .map(|record| record.address)
            .collect();
        addresses.sort_unstable();
        addresses
    }

    /// Current status of one device, if known.
    pub async fn status_of(&self, address: DeviceAddress) -> Option<DeviceStatus> {
        self.devices.read().await.get(&address).map(|record| record.status)
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
