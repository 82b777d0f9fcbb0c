//! Connected-device registry
//! The single authoritative map from device identity to connection state.
//! Every mutation is one locked step; nothing here awaits.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::core::bluetooth::commands::LightMode;
use crate::core::bluetooth::serializer::WriteQueue;
use crate::core::bluetooth::types::{CharacteristicRef, ConnectionStatus, DeviceId};
use crate::utils::lock;

/// Snapshot of one device's connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub id: DeviceId,
    pub status: ConnectionStatus,
    /// Distinguishes this connection from earlier ones to the same device
    pub epoch: u64,
    pub subscribed: HashSet<CharacteristicRef>,
    /// Mode to write once the device becomes ready
    pub pending_auto_command: Option<LightMode>,
    pub rssi: Option<i16>,
}

struct Entry {
    state: ConnectionState,
    /// Tail of the device's write FIFO, created on first write
    write_queue: Option<WriteQueue>,
}

/// Shared handle to the registry. Clones see the same map.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    entries: Arc<Mutex<HashMap<DeviceId, Entry>>>,
    next_epoch: Arc<AtomicU64>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts a connect request. Returns the new epoch, or `None` when the
    /// device already has an entry (the request is a no-op).
    pub fn insert(&self, id: &DeviceId, pending_auto_command: Option<LightMode>) -> Option<u64> {
        let mut entries = lock(&self.entries);
        if entries.contains_key(id) {
            return None;
        }
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed) + 1;
        entries.insert(
            id.clone(),
            Entry {
                state: ConnectionState {
                    id: id.clone(),
                    status: ConnectionStatus::Connecting,
                    epoch,
                    subscribed: HashSet::new(),
                    pending_auto_command,
                    rssi: None,
                },
                write_queue: None,
            },
        );
        Some(epoch)
    }

    pub fn get(&self, id: &DeviceId) -> Option<ConnectionState> {
        lock(&self.entries).get(id).map(|entry| entry.state.clone())
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        lock(&self.entries).contains_key(id)
    }

    pub fn all(&self) -> HashSet<DeviceId> {
        lock(&self.entries).keys().cloned().collect()
    }

    /// Devices whose link is established, with the epoch observed.
    pub fn ready(&self) -> Vec<(DeviceId, u64)> {
        lock(&self.entries)
            .values()
            .filter(|entry| entry.state.status == ConnectionStatus::Ready)
            .map(|entry| (entry.state.id.clone(), entry.state.epoch))
            .collect()
    }

    pub fn ready_ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.ready().into_iter().map(|(id, _)| id).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    pub fn remove(&self, id: &DeviceId) -> Option<ConnectionState> {
        lock(&self.entries).remove(id).map(|entry| entry.state)
    }

    /// Removes the entry only if it still belongs to `epoch`.
    pub fn remove_if_epoch(&self, id: &DeviceId, epoch: u64) -> Option<ConnectionState> {
        let mut entries = lock(&self.entries);
        match entries.get(id) {
            Some(entry) if entry.state.epoch == epoch => entries.remove(id).map(|entry| entry.state),
            _ => None,
        }
    }

    /// `Connecting` -> `Ready`. False if the entry was torn down meanwhile.
    pub fn mark_ready(&self, id: &DeviceId, epoch: u64) -> bool {
        self.update(id, Some(epoch), |state| {
            if state.status == ConnectionStatus::Connecting {
                state.status = ConnectionStatus::Ready;
                true
            } else {
                false
            }
        })
        .unwrap_or(false)
    }

    /// Moves the entry to `Disconnecting`. Returns its epoch and the status
    /// it had before.
    pub fn begin_disconnect(&self, id: &DeviceId) -> Option<(u64, ConnectionStatus)> {
        self.update(id, None, |state| {
            let previous = std::mem::replace(&mut state.status, ConnectionStatus::Disconnecting);
            (state.epoch, previous)
        })
    }

    pub fn record_subscription(&self, id: &DeviceId, epoch: u64, target: CharacteristicRef) {
        self.update(id, Some(epoch), |state| {
            state.subscribed.insert(target);
        });
    }

    pub fn set_rssi(&self, id: &DeviceId, epoch: u64, rssi: i16) {
        self.update(id, Some(epoch), |state| state.rssi = Some(rssi));
    }

    pub fn take_pending_auto_command(&self, id: &DeviceId, epoch: u64) -> Option<LightMode> {
        self.update(id, Some(epoch), |state| state.pending_auto_command.take())
            .flatten()
    }

    /// Runs `f` against the device's write-queue slot while the registry is
    /// locked, so queue creation and enqueue cannot race a removal.
    /// `None` unless the device is `Ready`.
    pub(crate) fn with_write_queue<R>(
        &self,
        id: &DeviceId,
        f: impl FnOnce(&mut Option<WriteQueue>, u64) -> R,
    ) -> Option<R> {
        let mut entries = lock(&self.entries);
        let entry = entries
            .get_mut(id)
            .filter(|entry| entry.state.status == ConnectionStatus::Ready)?;
        let epoch = entry.state.epoch;
        Some(f(&mut entry.write_queue, epoch))
    }

    fn update<R>(
        &self,
        id: &DeviceId,
        epoch: Option<u64>,
        f: impl FnOnce(&mut ConnectionState) -> R,
    ) -> Option<R> {
        let mut entries = lock(&self.entries);
        let entry = entries.get_mut(id)?;
        if epoch.is_some_and(|epoch| epoch != entry.state.epoch) {
            return None;
        }
        Some(f(&mut entry.state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> DeviceId {
        DeviceId::from(s)
    }

    #[test]
    fn second_insert_is_a_no_op() {
        let registry = ConnectionRegistry::new();
        let epoch = registry.insert(&id("D1"), None).expect("first insert");
        assert_eq!(registry.insert(&id("D1"), Some(LightMode::Static)), None);

        let state = registry.get(&id("D1")).expect("entry");
        assert_eq!(state.epoch, epoch);
        assert_eq!(state.status, ConnectionStatus::Connecting);
        assert_eq!(state.pending_auto_command, None);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn only_ready_devices_are_listed_as_ready() {
        let registry = ConnectionRegistry::new();
        let e1 = registry.insert(&id("D1"), None).unwrap();
        registry.insert(&id("D2"), None).unwrap();
        assert!(registry.mark_ready(&id("D1"), e1));

        assert_eq!(registry.ready(), vec![(id("D1"), e1)]);
        assert_eq!(registry.all().len(), 2);
    }

    #[test]
    fn stale_epoch_does_not_touch_new_connection() {
        let registry = ConnectionRegistry::new();
        let old = registry.insert(&id("D1"), None).unwrap();
        registry.remove(&id("D1"));
        let new = registry.insert(&id("D1"), None).unwrap();
        assert_ne!(old, new);

        assert!(registry.remove_if_epoch(&id("D1"), old).is_none());
        assert!(!registry.mark_ready(&id("D1"), old));
        assert!(registry.contains(&id("D1")));
        assert!(registry.remove_if_epoch(&id("D1"), new).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn mark_ready_fails_once_disconnecting() {
        let registry = ConnectionRegistry::new();
        let epoch = registry.insert(&id("D1"), None).unwrap();
        assert_eq!(
            registry.begin_disconnect(&id("D1")),
            Some((epoch, ConnectionStatus::Connecting))
        );
        assert!(!registry.mark_ready(&id("D1"), epoch));
    }

    #[test]
    fn write_queue_is_only_reachable_when_ready() {
        let registry = ConnectionRegistry::new();
        let epoch = registry.insert(&id("D1"), None).unwrap();
        assert_eq!(registry.with_write_queue(&id("D1"), |_, e| e), None);

        assert!(registry.mark_ready(&id("D1"), epoch));
        assert_eq!(registry.with_write_queue(&id("D1"), |_, e| e), Some(epoch));

        registry.begin_disconnect(&id("D1"));
        assert_eq!(registry.with_write_queue(&id("D1"), |_, e| e), None);
    }

    #[test]
    fn pending_command_is_taken_once() {
        let registry = ConnectionRegistry::new();
        let epoch = registry.insert(&id("D1"), Some(LightMode::Rainbow)).unwrap();
        assert_eq!(
            registry.take_pending_auto_command(&id("D1"), epoch),
            Some(LightMode::Rainbow)
        );
        assert_eq!(registry.take_pending_auto_command(&id("D1"), epoch), None);
    }
}
