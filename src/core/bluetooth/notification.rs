//! Notification routing for a connected session
//! This module maps unsolicited value-change events to the callback
//! registered for the characteristic that produced them.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use log::{debug, error, info};

/// Callback invoked with the characteristic handle and the new value.
/// Runs on the session's event pump and must not block it.
pub type NotifyCallback = Arc<dyn Fn(u16, &[u8]) + Send + Sync>;

/// Routes value-change events by exact characteristic handle.
#[derive(Default)]
pub struct NotificationRouter {
    callbacks: HashMap<u16, NotifyCallback>,
}

impl NotificationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` for `handle`. The last registration wins.
    pub fn register(&mut self, handle: u16, callback: NotifyCallback) -> bool {
        let replaced = self.callbacks.insert(handle, callback).is_some();
        if replaced {
            info!("Replaced notification callback for handle 0x{:04x}", handle);
        }
        replaced
    }

    pub fn unregister(&mut self, handle: u16) -> bool {
        self.callbacks.remove(&handle).is_some()
    }

    pub fn handles(&self) -> Vec<u16> {
        let mut handles: Vec<u16> = self.callbacks.keys().copied().collect();
        handles.sort_unstable();
        handles
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Drops every registration, returning the handles that were registered.
    pub fn clear(&mut self) -> Vec<u16> {
        let handles = self.handles();
        self.callbacks.clear();
        handles
    }

    /// Looks up the callback for `handle`. The returned delivery is run
    /// after the caller releases whatever lock guards the router.
    pub fn route(&self, handle: u16) -> Option<Delivery> {
        match self.callbacks.get(&handle) {
            Some(callback) => Some(Delivery {
                handle,
                callback: callback.clone(),
            }),
            None => {
                debug!("No subscriber for notification on handle 0x{:04x}, dropping", handle);
                None
            }
        }
    }
}

/// A notification matched to its subscriber.
pub struct Delivery {
    handle: u16,
    callback: NotifyCallback,
}

impl Delivery {
    /// Invokes the callback, containing any panic so the event pump survives.
    /// Returns true when the callback ran to completion.
    pub fn run(&self, value: &[u8]) -> bool {
        match catch_unwind(AssertUnwindSafe(|| (self.callback)(self.handle, value))) {
            Ok(()) => true,
            Err(_) => {
                error!("Notification callback for handle 0x{:04x} panicked", self.handle);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn dispatch(router: &NotificationRouter, handle: u16, value: &[u8]) -> bool {
        router.route(handle).is_some_and(|delivery| delivery.run(value))
    }

    fn recorder() -> (NotifyCallback, Arc<Mutex<Vec<(u16, Vec<u8>)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: NotifyCallback = Arc::new(move |handle: u16, value: &[u8]| {
            sink.lock().unwrap().push((handle, value.to_vec()));
        });
        (callback, seen)
    }

    #[test]
    fn test_route_matches_exact_handle() {
        let mut router = NotificationRouter::new();
        let (callback, seen) = recorder();
        router.register(0x0b, callback);

        assert!(dispatch(&router, 0x0b, &[1, 2]));
        assert!(!dispatch(&router, 0x0c, &[3]));
        assert_eq!(*seen.lock().unwrap(), vec![(0x0b, vec![1, 2])]);
    }

    #[test]
    fn test_last_registration_wins() {
        let mut router = NotificationRouter::new();
        let (old, old_seen) = recorder();
        let (new, new_seen) = recorder();
        assert!(!router.register(7, old));
        assert!(router.register(7, new));
        dispatch(&router, 7, &[9]);
        assert!(old_seen.lock().unwrap().is_empty());
        assert_eq!(new_seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_events_keep_delivery_order() {
        let mut router = NotificationRouter::new();
        let (callback, seen) = recorder();
        router.register(3, callback);
        for i in 0..10u8 {
            dispatch(&router, 3, &[i]);
        }
        let values: Vec<u8> = seen.lock().unwrap().iter().map(|(_, v)| v[0]).collect();
        assert_eq!(values, (0..10).collect::<Vec<u8>>());
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let mut router = NotificationRouter::new();
        fn explode(_: u16, _: &[u8]) {
            panic!("boom");
        }
        router.register(1, Arc::new(explode));
        let (callback, seen) = recorder();
        router.register(2, callback);

        assert!(!dispatch(&router, 1, &[0]));
        assert!(dispatch(&router, 2, &[0]));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_clear_returns_handles() {
        let mut router = NotificationRouter::new();
        router.register(9, recorder().0);
        router.register(4, recorder().0);
        assert_eq!(router.clear(), vec![4, 9]);
        assert!(router.is_empty());
        assert!(!router.unregister(4));
    }
}
