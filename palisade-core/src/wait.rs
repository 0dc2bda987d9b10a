//! Correlates a pending request id to its asynchronously delivered result.
//!
//! The gateway registers an id before proposing; the apply engine triggers
//! the slot when the corresponding entry commits. A slot is removed from
//! the map before its value is sent, so a second trigger for the same id is
//! a no-op and a value is delivered at most once. Request ids come from the
//! [`crate::id::Generator`] and are never reused within a process, so a
//! live id is registered at most once.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::error::PalisadeResult;
use crate::types::Response;

/// Value delivered through a wait slot.
#[derive(Debug)]
pub enum WaitValue {
    /// Outcome of a request entry applied to the store.
    Request(PalisadeResult<Response>),
    /// Outcome of a membership change entry.
    ConfChange(PalisadeResult<()>),
}

#[derive(Default)]
pub struct WaitRegistry {
    slots: Mutex<HashMap<u64, oneshot::Sender<WaitValue>>>,
}

impl WaitRegistry {
    pub fn new() -> Self {
        WaitRegistry::default()
    }

    /// Install a delivery slot for `id` and return its receiving half.
    pub fn register(&self, id: u64) -> oneshot::Receiver<WaitValue> {
        let (tx, rx) = oneshot::channel();
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.insert(id, tx);
        rx
    }

    /// Deliver `value` to the slot registered for `id`, if any. The slot is
    /// removed before delivery; returns whether a slot existed. Never
    /// blocks.
    pub fn trigger(&self, id: u64, value: WaitValue) -> bool {
        let sender = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.remove(&id)
        };
        match sender {
            // A dropped receiver means the waiter gave up. The value is
            // discarded; the entry was applied regardless.
            Some(tx) => {
                let _ = tx.send(value);
                true
            }
            None => false,
        }
    }

    /// Discard the slot for `id` without delivering anything. Called by the
    /// gateway on timeout so an abandoned registration does not leak.
    pub fn abandon(&self, id: u64) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.remove(&id);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PalisadeError;

    #[tokio::test]
    async fn test_trigger_delivers_exactly_once() {
        let w = WaitRegistry::new();
        let rx = w.register(7);

        assert!(w.trigger(7, WaitValue::ConfChange(Ok(()))));
        match rx.await {
            Ok(WaitValue::ConfChange(Ok(()))) => {}
            other => panic!("unexpected delivery: {:?}", other),
        }

        // The slot is gone; a second trigger finds nothing.
        assert!(!w.trigger(7, WaitValue::ConfChange(Ok(()))));
        assert_eq!(w.len(), 0);
    }

    #[tokio::test]
    async fn test_trigger_unregistered_is_noop() {
        let w = WaitRegistry::new();
        assert!(!w.trigger(42, WaitValue::ConfChange(Ok(()))));
    }

    #[tokio::test]
    async fn test_abandon_closes_receiver() {
        let w = WaitRegistry::new();
        let rx = w.register(9);
        w.abandon(9);
        assert!(rx.await.is_err());
        assert_eq!(w.len(), 0);
    }

    #[tokio::test]
    async fn test_register_after_trigger_yields_fresh_slot() {
        let w = WaitRegistry::new();
        let rx1 = w.register(3);
        w.trigger(
            3,
            WaitValue::ConfChange(Err(PalisadeError::MemberNotFound)),
        );
        assert!(matches!(
            rx1.await,
            Ok(WaitValue::ConfChange(Err(PalisadeError::MemberNotFound)))
        ));

        let rx2 = w.register(3);
        w.trigger(3, WaitValue::ConfChange(Ok(())));
        assert!(matches!(rx2.await, Ok(WaitValue::ConfChange(Ok(())))));
    }
}
