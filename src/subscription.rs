//! Subscription registry: per-simulation fan-out groups.
//!
//! Each group maps one [`SimulationId`] to the subscribers currently
//! following it. All mutation goes through one registry-wide lock; the
//! subscriber callbacks themselves always run after the lock is released,
//! so a slow or re-entrant subscriber can never stall other groups.
//!
//! A subscriber added while [`SubscriptionRegistry::close`] is running may
//! land in a fresh group and miss that close notification. This window is
//! accepted.

use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;

use crate::ids::SimulationId;
use crate::util::sync::lock;

/// Live update pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Frames `0..frame_count` are available (0 after a reload).
    NewFrame {
        /// Number of committed frames.
        frame_count: u64,
    },
    /// The shape list changed.
    NewShape,
    /// The worker reported a fatal error.
    Error {
        /// Diagnostic text.
        message: String,
    },
    /// The simulation instance closed.
    Stopped,
}

/// Receiver of group notifications. Delivery must be fast and must not
/// block.
pub trait Subscriber: Send + Sync {
    /// Deliver one broadcast notification.
    fn deliver(&self, notification: &Notification);

    /// The group was closed and this subscriber removed from it.
    fn group_closed(&self) {
        self.deliver(&Notification::Stopped);
    }
}

/// [`Subscriber`] forwarding into an mpsc channel.
#[derive(Debug, Clone)]
pub struct ChannelSubscriber {
    tx: Sender<Notification>,
}

impl ChannelSubscriber {
    /// Subscriber sending into `tx`.
    #[must_use]
    pub fn new(tx: Sender<Notification>) -> Self {
        Self { tx }
    }
}

impl Subscriber for ChannelSubscriber {
    fn deliver(&self, notification: &Notification) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.tx.send(notification.clone());
    }
}

type Group = Vec<Arc<dyn Subscriber>>;

/// Registry of fan-out groups keyed by simulation.
#[derive(Default)]
pub struct SubscriptionRegistry {
    groups: Mutex<FxHashMap<SimulationId, Group>>,
}

impl SubscriptionRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure a (possibly empty) group exists for `key`.
    pub fn create_group(&self, key: SimulationId) {
        let _ = lock(&self.groups).entry(key).or_default();
    }

    /// Add `subscriber` to the group of `key`, creating it if needed.
    pub fn add(&self, key: SimulationId, subscriber: Arc<dyn Subscriber>) {
        lock(&self.groups).entry(key).or_default().push(subscriber);
    }

    /// Remove `subscriber` from the group of `key`. The group is deleted
    /// once its last subscriber leaves.
    pub fn remove(&self, key: SimulationId, subscriber: &Arc<dyn Subscriber>) {
        let mut groups = lock(&self.groups);
        let Some(group) = groups.get_mut(&key) else {
            return;
        };
        group.retain(|s| !Arc::ptr_eq(s, subscriber));
        if group.is_empty() {
            drop(groups.remove(&key));
        }
    }

    /// Deliver `notification` to every current member of `key`'s group.
    /// An unknown key is a no-op.
    pub fn broadcast(&self, key: SimulationId, notification: &Notification) {
        let members = lock(&self.groups).get(&key).cloned();
        for subscriber in members.iter().flatten() {
            subscriber.deliver(notification);
        }
    }

    /// Remove `key`'s group and notify its members of the closure.
    pub fn close(&self, key: SimulationId) {
        let members = lock(&self.groups).remove(&key);
        let members = members.unwrap_or_default();
        log::debug!("closing group {key} with {} subscribers", members.len());
        for subscriber in members {
            subscriber.group_closed();
        }
    }

    /// Number of members of `key`'s group, `None` if no group exists.
    #[must_use]
    pub fn group_len(&self, key: SimulationId) -> Option<usize> {
        lock(&self.groups).get(&key).map(Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::{self, Receiver};

    use super::*;

    fn subscriber() -> (Arc<dyn Subscriber>, Receiver<Notification>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(ChannelSubscriber::new(tx)), rx)
    }

    #[test]
    fn broadcast_reaches_current_members_only() {
        let registry = SubscriptionRegistry::new();
        let key = SimulationId::new();
        let (a, a_rx) = subscriber();
        let (b, b_rx) = subscriber();
        let (c, c_rx) = subscriber();
        registry.add(key, Arc::clone(&a));
        registry.add(key, Arc::clone(&b));
        registry.add(key, Arc::clone(&c));
        registry.remove(key, &b);

        registry.broadcast(key, &Notification::NewFrame { frame_count: 1 });

        assert_eq!(
            a_rx.try_recv(),
            Ok(Notification::NewFrame { frame_count: 1 })
        );
        assert!(b_rx.try_recv().is_err());
        assert_eq!(
            c_rx.try_recv(),
            Ok(Notification::NewFrame { frame_count: 1 })
        );
    }

    #[test]
    fn broadcast_to_unknown_group_is_a_no_op() {
        let registry = SubscriptionRegistry::new();
        registry.broadcast(SimulationId::new(), &Notification::NewShape);
    }

    #[test]
    fn removing_last_member_deletes_group() {
        let registry = SubscriptionRegistry::new();
        let key = SimulationId::new();
        let (a, _rx) = subscriber();
        registry.add(key, Arc::clone(&a));
        assert_eq!(registry.group_len(key), Some(1));

        registry.remove(key, &a);

        assert_eq!(registry.group_len(key), None);
    }

    #[test]
    fn close_notifies_then_forgets_members() {
        let registry = SubscriptionRegistry::new();
        let key = SimulationId::new();
        let (a, a_rx) = subscriber();
        registry.add(key, a);

        registry.close(key);
        let (late, late_rx) = subscriber();
        registry.add(key, late);
        registry.broadcast(key, &Notification::NewShape);

        assert_eq!(a_rx.try_recv(), Ok(Notification::Stopped));
        assert!(a_rx.try_recv().is_err());
        assert_eq!(late_rx.try_recv(), Ok(Notification::NewShape));
        assert!(late_rx.try_recv().is_err());
        assert_eq!(registry.group_len(key), Some(1));
    }

    #[test]
    fn created_group_exists_without_members() {
        let registry = SubscriptionRegistry::new();
        let key = SimulationId::new();
        registry.create_group(key);
        assert_eq!(registry.group_len(key), Some(0));
        registry.close(key);
        assert_eq!(registry.group_len(key), None);
    }
}
