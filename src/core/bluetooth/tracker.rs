//! Advertisement tracking for unconnected devices
//! Filters raw advertisements by name, keeps one record per passing device and
//! ages records out when their advertisements stop.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info};
use regex::Regex;
use tokio::time::Instant;

use crate::core::bluetooth::registry::ConnectionRegistry;
use crate::core::bluetooth::types::{
    AdvertisementRecord, DeviceId, DeviceSummary, RawAdvertisement,
};
use crate::utils::lock;

/// Advertised-name filter for supported peripherals
#[derive(Debug, Clone)]
pub struct NameFilter(Regex);

impl NameFilter {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self(Regex::new(pattern)?))
    }

    /// Nameless advertisements never pass.
    pub fn matches(&self, name: Option<&str>) -> bool {
        name.map(|name| self.0.is_match(name)).unwrap_or(false)
    }
}

/// Auto-connect settings, read fresh from shared state on every call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoConnectPolicy {
    pub enabled: bool,
    pub threshold_dbm: i16,
}

impl AutoConnectPolicy {
    pub fn admits(&self, rssi: i16) -> bool {
        self.enabled && rssi >= self.threshold_dbm
    }
}

/// What one batch of advertisements changed
#[derive(Debug, Default)]
pub struct Observation {
    pub discovered: Vec<DeviceSummary>,
    pub updated: Vec<DeviceSummary>,
    /// Devices the session manager should connect to
    pub connect: Vec<DeviceId>,
}

#[derive(Clone)]
pub struct AdvertisementTracker {
    records: Arc<Mutex<HashMap<DeviceId, AdvertisementRecord>>>,
    filter: NameFilter,
    registry: ConnectionRegistry,
    stability_window: Duration,
    miss_threshold: u32,
}

impl AdvertisementTracker {
    pub fn new(
        filter: NameFilter,
        registry: ConnectionRegistry,
        stability_window: Duration,
        miss_threshold: u32,
    ) -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
            filter,
            registry,
            stability_window,
            miss_threshold,
        }
    }

    pub fn observe(&self, advertisements: &[RawAdvertisement], policy: AutoConnectPolicy) -> Observation {
        self.observe_at(advertisements, policy, Instant::now())
    }

    pub fn observe_at(
        &self,
        advertisements: &[RawAdvertisement],
        policy: AutoConnectPolicy,
        now: Instant,
    ) -> Observation {
        let mut observation = Observation::default();
        let mut records = lock(&self.records);

        for adv in advertisements {
            if !self.filter.matches(adv.name.as_deref()) {
                continue;
            }
            let connected = self.registry.contains(&adv.id);

            let record = match records.entry(adv.id.clone()) {
                Entry::Occupied(occupied) => {
                    let record = occupied.into_mut();
                    let rssi_changed = record.rssi != adv.rssi;
                    record.sighted(adv, now);
                    if rssi_changed {
                        observation.updated.push(record.summary(connected));
                    }
                    record
                }
                Entry::Vacant(vacant) => {
                    info!(
                        "Found device {} ({:?}), RSSI: {}",
                        adv.id, adv.name, adv.rssi
                    );
                    let record = vacant.insert(AdvertisementRecord::first_sighting(adv, now));
                    observation.discovered.push(record.summary(connected));
                    record
                }
            };

            if record.connect_armed && !connected && policy.admits(adv.rssi) {
                debug!("Auto-connect candidate {} at {} dBm", adv.id, adv.rssi);
                record.connect_armed = false;
                observation.connect.push(adv.id.clone());
            }
        }

        observation
    }

    /// One presence cycle. Returns the identities evicted by it.
    pub fn age_tick(&self) -> Vec<DeviceId> {
        self.age_tick_at(Instant::now())
    }

    pub fn age_tick_at(&self, now: Instant) -> Vec<DeviceId> {
        let mut evicted = Vec::new();
        let mut records = lock(&self.records);

        records.retain(|id, record| {
            // Registry lookups happen under the tracker lock so a device
            // cannot connect between the check and the eviction.
            if self.registry.contains(id) {
                return true;
            }
            if now.saturating_duration_since(record.last_seen) > self.stability_window {
                record.miss_streak += 1;
            }
            if record.miss_streak >= self.miss_threshold {
                info!("Device {} stopped advertising, removing it", id);
                evicted.push(id.clone());
                false
            } else {
                true
            }
        });

        evicted
    }

    /// Tracked, unconnected devices that qualify under `policy`. Marks them
    /// as signalled so a concurrent sighting does not connect them twice.
    pub fn claim_candidates(&self, policy: AutoConnectPolicy) -> Vec<DeviceId> {
        let mut records = lock(&self.records);
        let mut candidates: Vec<DeviceId> = records
            .values_mut()
            .filter(|record| !self.registry.contains(&record.id) && policy.admits(record.rssi))
            .map(|record| {
                record.connect_armed = false;
                record.id.clone()
            })
            .collect();
        candidates.sort();
        candidates
    }

    /// Lets the next qualifying sighting auto-connect the device again.
    pub fn rearm(&self, id: &DeviceId) {
        if let Some(record) = lock(&self.records).get_mut(id) {
            record.connect_armed = true;
        }
    }

    pub fn get(&self, id: &DeviceId) -> Option<AdvertisementRecord> {
        lock(&self.records).get(id).cloned()
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        lock(&self.records).contains_key(id)
    }

    pub fn summaries(&self) -> Vec<DeviceSummary> {
        let mut summaries: Vec<DeviceSummary> = lock(&self.records)
            .values()
            .map(|record| record.summary(self.registry.contains(&record.id)))
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }
}
