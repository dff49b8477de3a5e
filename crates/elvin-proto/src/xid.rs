//! Transaction ids for request/reply correlation.

use std::sync::atomic::{AtomicI32, Ordering};

/// Transaction id carried by request packets and echoed in replies.
///
/// Always positive. Zero is never issued, so replies to a packet that carried
/// no transaction (for example a Nack to a NotifyEmit) can use it.
pub type Xid = i32;

/// Issues transaction ids.
///
/// Owned by whatever builds requests and shared through an `Arc` when several
/// tasks build them. Ids start at 1 and wrap from `i32::MAX` back to 1.
#[derive(Debug)]
pub struct XidSource {
    next: AtomicI32,
}

impl XidSource {
    /// Source whose first id is 1.
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Source whose first id is `first` (clamped to at least 1).
    pub fn starting_at(first: Xid) -> Self {
        Self { next: AtomicI32::new(first.max(1)) }
    }

    /// Take the next id.
    pub fn next_xid(&self) -> Xid {
        let mut current = self.next.load(Ordering::Relaxed);
        loop {
            let following = if current == i32::MAX { 1 } else { current + 1 };
            match self.next.compare_exchange_weak(
                current,
                following,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return current,
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for XidSource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn ids_are_sequential_from_one() {
        let source = XidSource::new();
        assert_eq!(source.next_xid(), 1);
        assert_eq!(source.next_xid(), 2);
    }

    #[test]
    fn wraps_to_one() {
        let source = XidSource::starting_at(i32::MAX);
        assert_eq!(source.next_xid(), i32::MAX);
        assert_eq!(source.next_xid(), 1);
    }

    #[test]
    fn shared_source_never_repeats() {
        let source = Arc::new(XidSource::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let source = Arc::clone(&source);
                std::thread::spawn(move || (0..250).map(|_| source.next_xid()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<Xid> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 1000);
    }
}
