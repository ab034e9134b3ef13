//! Actor bookkeeping: mailbox depth per actor and process-wide counters.
//!
//! Each actor kind has mailbox depth limits. Depth above `elevated` is logged at
//! debug once per excursion; depth above `critical` is logged at warn on
//! every enqueue.
//!
//! | Actor Type | Elevated | Critical |
//! |------------|----------|----------|
//! | Hub        | 100      | 500      |
//! | Device     | 16       | 48       |

use crate::observability::metrics as prom;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxLimits {
    pub elevated: usize,
    pub critical: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    Hub,
    Device,
}

impl ActorType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ActorType::Hub => "hub",
            ActorType::Device => "device",
        }
    }

    /// The hub fans in from every device, socket and the control link, so it
    /// gets the larger limits.
    #[must_use]
    pub const fn limits(&self) -> MailboxLimits {
        match self {
            ActorType::Hub => MailboxLimits {
                elevated: 100,
                critical: 500,
            },
            ActorType::Device => MailboxLimits {
                elevated: 16,
                critical: 48,
            },
        }
    }
}

/// Queue depth of one actor mailbox.
///
/// Handles call [`record_enqueue`](Self::record_enqueue) after a successful
/// send; the actor calls [`record_dequeue`](Self::record_dequeue) per message.
#[derive(Debug)]
pub struct MailboxMonitor {
    actor_type: ActorType,
    owner: String,
    queued: AtomicUsize,
    high_water: AtomicUsize,
    handled: AtomicU64,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new(actor_type: ActorType, owner: impl Into<String>) -> Self {
        Self {
            actor_type,
            owner: owner.into(),
            queued: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
            handled: AtomicU64::new(0),
        }
    }

    pub fn record_enqueue(&self) {
        let depth = self.queued.fetch_add(1, Ordering::Relaxed) + 1;
        self.high_water.fetch_max(depth, Ordering::Relaxed);

        let limits = self.actor_type.limits();
        if depth > limits.critical {
            warn!(
                target: "gw.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                owner = %self.owner,
                depth,
                "Mailbox backed up"
            );
        } else if depth == limits.elevated + 1 {
            debug!(
                target: "gw.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                owner = %self.owner,
                depth,
                "Mailbox depth elevated"
            );
        }
    }

    pub fn record_dequeue(&self) {
        // A dequeue can land before the sender records its enqueue
        let _ = self
            .queued
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| {
                Some(d.saturating_sub(1))
            });
        self.handled.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_backed_up(&self) -> bool {
        self.depth() > self.actor_type.limits().critical
    }
}

/// Gateway-wide counters. Every change is mirrored into the Prometheus gauges
/// so tests can read the numbers without a recorder installed.
#[derive(Debug, Default)]
pub struct ActorMetrics {
    devices: AtomicUsize,
    observers: AtomicUsize,
    signaling: AtomicUsize,
    panics: AtomicU64,
    messages: AtomicU64,
}

impl ActorMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn device_started(&self) {
        prom::set_devices_active(increment(&self.devices));
    }

    pub fn device_stopped(&self) {
        prom::set_devices_active(decrement(&self.devices));
    }

    /// The hub owns the observer table, so it reports the absolute count.
    pub fn set_observers(&self, count: usize) {
        self.observers.store(count, Ordering::Relaxed);
        prom::set_status_observers(count);
    }

    pub fn signaling_opened(&self) {
        prom::set_signaling_sessions(increment(&self.signaling));
    }

    pub fn signaling_closed(&self) {
        prom::set_signaling_sessions(decrement(&self.signaling));
    }

    pub fn record_panic(&self, actor_type: ActorType) {
        let total = self.panics.fetch_add(1, Ordering::Relaxed) + 1;
        prom::record_actor_panic(actor_type.as_str());
        error!(
            target: "gw.actor.panic",
            actor_type = actor_type.as_str(),
            total,
            "Handler panicked, message dropped"
        );
    }

    pub fn record_message_processed(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn device_count(&self) -> usize {
        self.devices.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.observers.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn signaling_count(&self) -> usize {
        self.signaling.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn panic_count(&self) -> u64 {
        self.panics.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }
}

fn increment(counter: &AtomicUsize) -> usize {
    counter.fetch_add(1, Ordering::Relaxed) + 1
}

fn decrement(counter: &AtomicUsize) -> usize {
    counter
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
            Some(c.saturating_sub(1))
        })
        .map_or(0, |previous| previous.saturating_sub(1))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_hub_limits_are_larger() {
        let hub = ActorType::Hub.limits();
        let device = ActorType::Device.limits();
        assert!(hub.elevated > device.elevated);
        assert!(hub.critical > device.critical);
        assert!(device.elevated < device.critical);
    }

    #[test]
    fn test_depth_and_high_water() {
        let monitor = MailboxMonitor::new(ActorType::Device, "cam1");
        monitor.record_enqueue();
        monitor.record_enqueue();
        monitor.record_dequeue();

        assert_eq!(monitor.depth(), 1);
        assert_eq!(monitor.high_water(), 2);
        assert_eq!(monitor.messages_processed(), 1);
    }

    #[test]
    fn test_early_dequeue_saturates() {
        let monitor = MailboxMonitor::new(ActorType::Hub, "hub");
        monitor.record_dequeue();
        assert_eq!(monitor.depth(), 0);
    }

    #[test]
    fn test_backed_up_past_critical() {
        let monitor = MailboxMonitor::new(ActorType::Device, "cam1");
        for _ in 0..ActorType::Device.limits().critical {
            monitor.record_enqueue();
        }
        assert!(!monitor.is_backed_up());

        monitor.record_enqueue();
        assert!(monitor.is_backed_up());
    }

    #[test]
    fn test_gateway_counters() {
        let metrics = ActorMetrics::new();

        metrics.device_started();
        metrics.device_started();
        metrics.device_stopped();
        assert_eq!(metrics.device_count(), 1);

        metrics.set_observers(3);
        assert_eq!(metrics.observer_count(), 3);

        metrics.signaling_opened();
        metrics.signaling_closed();
        metrics.signaling_closed();
        assert_eq!(metrics.signaling_count(), 0);

        metrics.record_panic(ActorType::Device);
        metrics.record_message_processed();
        assert_eq!(metrics.panic_count(), 1);
        assert_eq!(metrics.messages_processed(), 1);
    }
}
