//! Single-resolution result slot

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Slot that accepts exactly one value
///
/// Several writers may race to resolve it; the first wins and later writes
/// get their value back. The reader awaits the receiver returned by
/// [`ResolutionSlot::new`].
pub struct ResolutionSlot<T> {
    resolved: AtomicBool,
    sender: Mutex<Option<oneshot::Sender<T>>>,
}

impl<T> ResolutionSlot<T> {
    pub fn new() -> (Arc<Self>, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        let slot = ResolutionSlot {
            resolved: AtomicBool::new(false),
            sender: Mutex::new(Some(tx)),
        };
        (Arc::new(slot), rx)
    }

    /// Deliver a value; `Err(value)` when the slot was already resolved or
    /// the reader is gone
    pub fn resolve(&self, value: T) -> Result<(), T> {
        if self.resolved.swap(true, Ordering::AcqRel) {
            return Err(value);
        }
        match self.sender.lock().take() {
            Some(tx) => tx.send(value),
            None => Err(value),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_writer_wins() {
        let (slot, rx) = ResolutionSlot::new();
        assert!(!slot.is_resolved());
        assert_eq!(slot.resolve(1), Ok(()));
        assert_eq!(slot.resolve(2), Err(2));
        assert!(slot.is_resolved());
        assert_eq!(rx.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_writers_deliver_once() {
        let (slot, rx) = ResolutionSlot::new();
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let slot = slot.clone();
                tokio::spawn(async move { slot.resolve(i).is_ok() })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert!(rx.await.is_ok());
    }

    #[test]
    fn test_dropped_reader_returns_value() {
        let (slot, rx) = ResolutionSlot::new();
        drop(rx);
        assert_eq!(slot.resolve("late"), Err("late"));
    }
}
