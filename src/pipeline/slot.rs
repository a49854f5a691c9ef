//! Single-slot, latest-only handoff between the capture and encode threads

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;
use crossbeam::sync::{Parker, Unparker};
use crossbeam::utils::CachePadded;

/// Create a connected producer/consumer pair sharing one slot
pub fn frame_slot<T>() -> (SlotProducer<T>, SlotConsumer<T>) {
    let slot = Arc::new(FrameSlot {
        cell: ArrayQueue::new(1),
        closed: AtomicBool::new(false),
        stats: CachePadded::new(Stats::default()),
    });
    let parker = Parker::new();
    let unparker = parker.unparker().clone();

    (
        SlotProducer {
            slot: Arc::clone(&slot),
            unparker,
        },
        SlotConsumer { slot, parker },
    )
}

/// Holds at most one item; a new offer replaces whatever was not taken yet
struct FrameSlot<T> {
    cell: ArrayQueue<T>,
    closed: AtomicBool,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    offered: AtomicUsize,
    taken: AtomicUsize,
    overwritten: AtomicUsize,
}

/// Snapshot of slot counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotStats {
    pub offered: usize,
    pub taken: usize,
    pub overwritten: usize,
}

impl<T> FrameSlot<T> {
    fn stats(&self) -> SlotStats {
        SlotStats {
            offered: self.stats.offered.load(Ordering::Relaxed),
            taken: self.stats.taken.load(Ordering::Relaxed),
            overwritten: self.stats.overwritten.load(Ordering::Relaxed),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Producer side. Never blocks.
pub struct SlotProducer<T> {
    slot: Arc<FrameSlot<T>>,
    unparker: Unparker,
}

impl<T> SlotProducer<T> {
    /// Put `item` in the slot, discarding an unconsumed one.
    ///
    /// Returns `true` if an older item was discarded.
    pub fn offer(&self, item: T) -> bool {
        let replaced = self.slot.cell.force_push(item).is_some();

        self.slot.stats.offered.fetch_add(1, Ordering::Relaxed);
        if replaced {
            self.slot.stats.overwritten.fetch_add(1, Ordering::Relaxed);
        }

        self.unparker.unpark();
        replaced
    }

    /// Wake the consumer and make every further `take` return `None`
    pub fn close(&self) {
        self.slot.close();
        self.unparker.unpark();
    }

    pub fn stats(&self) -> SlotStats {
        self.slot.stats()
    }
}

impl<T> Drop for SlotProducer<T> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Consumer side, owned by exactly one thread
pub struct SlotConsumer<T> {
    slot: Arc<FrameSlot<T>>,
    parker: Parker,
}

impl<T> SlotConsumer<T> {
    /// Block until an item is available and return it.
    ///
    /// Returns `None` once the slot is closed.
    pub fn take(&self) -> Option<T> {
        loop {
            if let Some(item) = self.poll() {
                return item;
            }
            self.parker.park();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.slot.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> SlotStats {
        self.slot.stats()
    }

    // Some(None) = closed, None = nothing yet
    fn poll(&self) -> Option<Option<T>> {
        if self.is_closed() {
            return Some(None);
        }
        let item = self.slot.cell.pop()?;
        self.slot.stats.taken.fetch_add(1, Ordering::Relaxed);
        Some(Some(item))
    }
}
