// src/volume/data_manager.rs
//! Volume data manager
//!
//! Owns the set of loaded volumes and tells interested parties when it
//! changes. Two notification paths are offered: closure listeners invoked
//! synchronously on the mutating thread, and channel subscriptions for
//! consumers living on another thread (a UI refreshing its iso-value range,
//! for example).

use super::{Volume, VolumeId};
use crate::error::{Result, VolumeRenderError};
use crossbeam_channel::{Receiver, Sender};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Kind of mutation that produced a [`VolumeDataEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeChange {
    Added,
    Replaced,
    Removed,
}

/// Notification pushed after every mutation of the manager
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeDataEvent {
    pub id: VolumeId,
    pub change: VolumeChange,
    /// Global maximum after the mutation, for refreshing dependent ranges
    pub global_max_volume_value: f32,
}

/// Handle returned by [`VolumeDataManager::add_listener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Box<dyn Fn(&VolumeDataEvent) + Send + Sync>;

struct VolumeEntry {
    volume: Arc<Volume>,
    revision: u64,
}

/// Mapping from [`VolumeId`] to loaded volumes
pub struct VolumeDataManager {
    volumes: BTreeMap<VolumeId, VolumeEntry>,
    listeners: Vec<(ListenerId, Listener)>,
    subscribers: Vec<Sender<VolumeDataEvent>>,
    next_listener: u64,
    generation: u64,
    value_range: Option<(f32, f32)>,
}

impl VolumeDataManager {
    pub fn new() -> Self {
        Self {
            volumes: BTreeMap::new(),
            listeners: Vec::new(),
            subscribers: Vec::new(),
            next_listener: 0,
            generation: 0,
            value_range: None,
        }
    }

    /// Add a volume under a new identifier
    pub fn add_volume(&mut self, id: VolumeId, volume: Volume) -> Result<()> {
        if self.volumes.contains_key(&id) {
            return Err(VolumeRenderError::VolumeAlreadyExists(id));
        }
        log::info!("Adding {} '{}' {:?}", id, volume.label(), volume.dimensions());
        self.insert(id, volume);
        self.notify(id, VolumeChange::Added);
        Ok(())
    }

    /// Swap the volume stored under an existing identifier
    pub fn replace_volume(&mut self, id: VolumeId, volume: Volume) -> Result<()> {
        if !self.volumes.contains_key(&id) {
            return Err(VolumeRenderError::VolumeNotFound(id));
        }
        log::info!("Replacing {} with '{}'", id, volume.label());
        self.insert(id, volume);
        self.notify(id, VolumeChange::Replaced);
        Ok(())
    }

    /// Remove a volume, returning it
    pub fn remove_volume(&mut self, id: VolumeId) -> Result<Arc<Volume>> {
        let entry = self
            .volumes
            .remove(&id)
            .ok_or(VolumeRenderError::VolumeNotFound(id))?;
        log::info!("Removed {}", id);
        self.generation += 1;
        self.recompute_range();
        self.notify(id, VolumeChange::Removed);
        Ok(entry.volume)
    }

    pub fn get(&self, id: VolumeId) -> Option<&Arc<Volume>> {
        self.volumes.get(&id).map(|entry| &entry.volume)
    }

    pub fn contains(&self, id: VolumeId) -> bool {
        self.volumes.contains_key(&id)
    }

    /// Identifiers in ascending order
    pub fn ids(&self) -> Vec<VolumeId> {
        self.volumes.keys().copied().collect()
    }

    /// Loaded volumes in ascending identifier order
    pub fn iter(&self) -> impl Iterator<Item = (VolumeId, &Arc<Volume>)> {
        self.volumes.iter().map(|(id, entry)| (*id, &entry.volume))
    }

    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }

    /// Generation at which the volume under `id` was last stored
    pub fn revision_of(&self, id: VolumeId) -> Option<u64> {
        self.volumes.get(&id).map(|entry| entry.revision)
    }

    /// Counter bumped by every mutation
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Maximum scalar value over all loaded volumes, `0.0` when empty
    pub fn global_max_volume_value(&self) -> f32 {
        self.value_range.map_or(0.0, |(_, hi)| hi)
    }

    /// Minimum scalar value over all loaded volumes, `0.0` when empty
    pub fn global_min_volume_value(&self) -> f32 {
        self.value_range.map_or(0.0, |(lo, _)| lo)
    }

    /// Union of the value ranges of all loaded volumes
    pub fn global_value_range(&self) -> Option<(f32, f32)> {
        self.value_range
    }

    /// Register a callback run synchronously after every mutation
    pub fn add_listener<F>(&mut self, listener: F) -> ListenerId
    where
        F: Fn(&VolumeDataEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    /// Unregister a callback. Returns `false` if it was not registered.
    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(listener_id, _)| *listener_id != id);
        self.listeners.len() != before
    }

    /// Subscribe to mutation events through a channel
    pub fn subscribe(&mut self) -> Receiver<VolumeDataEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers.push(tx);
        rx
    }

    fn insert(&mut self, id: VolumeId, volume: Volume) {
        self.generation += 1;
        self.volumes.insert(
            id,
            VolumeEntry {
                volume: Arc::new(volume),
                revision: self.generation,
            },
        );
        self.recompute_range();
    }

    fn recompute_range(&mut self) {
        self.value_range = self
            .volumes
            .values()
            .map(|entry| entry.volume.value_range())
            .reduce(|(lo_a, hi_a), (lo_b, hi_b)| (lo_a.min(lo_b), hi_a.max(hi_b)));
    }

    fn notify(&mut self, id: VolumeId, change: VolumeChange) {
        let event = VolumeDataEvent {
            id,
            change,
            global_max_volume_value: self.global_max_volume_value(),
        };
        for (_, listener) in &self.listeners {
            listener(&event);
        }
        // Dropped receivers are pruned here.
        self.subscribers.retain(|tx| tx.send(event).is_ok());
    }
}

impl Default for VolumeDataManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::{Matrix4, SquareMatrix};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn constant(value: f32) -> Volume {
        Volume::scalar("constant", [2, 2, 2], vec![value; 8], Matrix4::identity()).expect("valid volume")
    }

    #[test]
    fn test_add_replace_remove() {
        let mut manager = VolumeDataManager::new();
        manager.add_volume(VolumeId(1), constant(1.0)).expect("add");
        assert!(matches!(
            manager.add_volume(VolumeId(1), constant(2.0)),
            Err(VolumeRenderError::VolumeAlreadyExists(VolumeId(1)))
        ));

        let before = manager.revision_of(VolumeId(1));
        manager.replace_volume(VolumeId(1), constant(3.0)).expect("replace");
        assert_ne!(manager.revision_of(VolumeId(1)), before);
        assert_eq!(manager.global_max_volume_value(), 3.0);

        assert!(matches!(
            manager.replace_volume(VolumeId(9), constant(1.0)),
            Err(VolumeRenderError::VolumeNotFound(VolumeId(9)))
        ));
        assert!(manager.remove_volume(VolumeId(9)).is_err());

        manager.remove_volume(VolumeId(1)).expect("remove");
        assert!(manager.is_empty());
        assert_eq!(manager.global_max_volume_value(), 0.0);
    }

    #[test]
    fn test_listeners_and_subscribers_receive_events() {
        let mut manager = VolumeDataManager::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let listener = manager.add_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let rx = manager.subscribe();

        manager.add_volume(VolumeId(4), constant(7.5)).expect("add");
        let event = rx.try_recv().expect("event delivered");
        assert_eq!(event.id, VolumeId(4));
        assert_eq!(event.change, VolumeChange::Added);
        assert_eq!(event.global_max_volume_value, 7.5);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(manager.remove_listener(listener));
        assert!(!manager.remove_listener(listener));
        manager.remove_volume(VolumeId(4)).expect("remove");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(rx.try_recv().expect("event delivered").change, VolumeChange::Removed);
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let mut manager = VolumeDataManager::new();
        drop(manager.subscribe());
        manager.add_volume(VolumeId(0), constant(1.0)).expect("add");
        assert!(manager.subscribers.is_empty());
    }

    #[test]
    fn test_global_max_tracks_random_sequences() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut manager = VolumeDataManager::new();
        let mut reference: BTreeMap<u32, f32> = BTreeMap::new();

        for _ in 0..500 {
            let id = rng.random_range(0..12u32);
            if rng.random_bool(0.6) {
                let value = rng.random_range(-50.0f32..50.0);
                if reference.contains_key(&id) {
                    manager.replace_volume(VolumeId(id), constant(value)).expect("replace");
                } else {
                    manager.add_volume(VolumeId(id), constant(value)).expect("add");
                }
                reference.insert(id, value);
            } else {
                let removed = manager.remove_volume(VolumeId(id)).is_ok();
                assert_eq!(removed, reference.remove(&id).is_some());
            }

            let expected = reference.values().copied().fold(None, |acc: Option<f32>, v| {
                Some(acc.map_or(v, |m| m.max(v)))
            });
            assert_eq!(manager.global_max_volume_value(), expected.unwrap_or(0.0));
            assert_eq!(manager.len(), reference.len());
        }
    }
}
