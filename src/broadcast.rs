use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{info, warn};

/// One attached subscriber. Kept as a trait object so the hub doesn't need
/// to know about axum's WebSocket type directly — `api::ws` supplies the
/// concrete sender.
pub trait Subscriber: Send + Sync {
    fn id(&self) -> u64;
    /// Attempt delivery; `Err` means the subscriber is considered dead and
    /// will be detached.
    fn send(&self, frame: &str) -> Result<(), ()>;
}

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_subscriber_id() -> u64 {
    NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Local broadcast registry: attach/detach/send_one/broadcast/count.
/// Rebuilt from the original `ConnectionManager`, with a plain mutex in
/// place of an `asyncio.Lock` — delivery never happens while a lock
/// protecting a future send is held across an await point, since `send`
/// here is synchronous (the underlying transport buffers it).
pub struct BroadcastHub {
    subscribers: Mutex<Vec<Arc<dyn Subscriber>>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        BroadcastHub {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn attach(&self, sub: Arc<dyn Subscriber>) {
        self.subscribers.lock().push(sub);
        info!(count = self.count(), "subscriber attached");
    }

    pub fn detach(&self, id: u64) {
        let mut subs = self.subscribers.lock();
        subs.retain(|s| s.id() != id);
    }

    pub fn send_one(&self, id: u64, frame: &Value) {
        let message = frame.to_string();
        let mut to_detach = None;
        {
            let subs = self.subscribers.lock();
            if let Some(sub) = subs.iter().find(|s| s.id() == id) {
                if sub.send(&message).is_err() {
                    to_detach = Some(id);
                }
            }
        }
        if let Some(id) = to_detach {
            self.detach(id);
        }
    }

    /// Serializes once, attempts delivery to every subscriber, then
    /// detaches the failures after the iteration — never mutates the
    /// subscriber set while iterating it.
    pub fn broadcast(&self, frame: &Value) {
        let message = frame.to_string();
        let mut failed = Vec::new();
        {
            let subs = self.subscribers.lock();
            for sub in subs.iter() {
                if sub.send(&message).is_err() {
                    warn!(subscriber_id = sub.id(), "failed to deliver frame, will detach");
                    failed.push(sub.id());
                }
            }
        }
        if !failed.is_empty() {
            let mut subs = self.subscribers.lock();
            subs.retain(|s| !failed.contains(&s.id()));
        }
    }

    pub fn count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct TestSub {
        id: u64,
        fail: AtomicBool,
        received: Mutex<Vec<String>>,
    }

    impl Subscriber for TestSub {
        fn id(&self) -> u64 {
            self.id
        }
        fn send(&self, frame: &str) -> Result<(), ()> {
            if self.fail.load(Ordering::Relaxed) {
                Err(())
            } else {
                self.received.lock().push(frame.to_string());
                Ok(())
            }
        }
    }

    fn sub(id: u64, fail: bool) -> Arc<TestSub> {
        Arc::new(TestSub {
            id,
            fail: AtomicBool::new(fail),
            received: Mutex::new(Vec::new()),
        })
    }

    #[test]
    fn broadcast_reaches_every_healthy_subscriber() {
        let hub = BroadcastHub::new();
        let s1 = sub(1, false);
        let s2 = sub(2, false);
        hub.attach(s1.clone());
        hub.attach(s2.clone());

        hub.broadcast(&serde_json::json!({"x": 1}));

        assert_eq!(s1.received.lock().len(), 1);
        assert_eq!(s2.received.lock().len(), 1);
        assert_eq!(hub.count(), 2);
    }

    #[test]
    fn failed_subscriber_is_detached_after_broadcast() {
        let hub = BroadcastHub::new();
        let healthy = sub(1, false);
        let broken = sub(2, true);
        hub.attach(healthy.clone());
        hub.attach(broken.clone());

        hub.broadcast(&serde_json::json!({"type": "lighter_update", "data": {"x": 1}}));

        assert_eq!(healthy.received.lock().len(), 1);
        assert_eq!(hub.count(), 1);
    }

    #[test]
    fn detach_unknown_subscriber_is_a_no_op() {
        let hub = BroadcastHub::new();
        hub.attach(sub(1, false));
        hub.detach(999);
        assert_eq!(hub.count(), 1);
    }

    #[test]
    fn send_one_targets_a_single_subscriber() {
        let hub = BroadcastHub::new();
        let s1 = sub(1, false);
        let s2 = sub(2, false);
        hub.attach(s1.clone());
        hub.attach(s2.clone());

        hub.send_one(1, &serde_json::json!({"x": 1}));

        assert_eq!(s1.received.lock().len(), 1);
        assert_eq!(s2.received.lock().len(), 0);
    }
}
