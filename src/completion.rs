//! Transfer completion tracking (C6): the 128-entry device-side slot pool,
//! the 4096-entry legacy host-flag queue, and the tagged [`RequestHandle`]
//! that demultiplexes between them.
//!
//! Grounded in `original_source/src/hixl/cs/complete_pool.h`
//! (`CompletePool`, `kMaxSlots=128`, LIFO free list, ref-counted
//! `AddRef`/`Release`) and in Design Note "Request handle tagging", which
//! asks for a tagged sum rather than the original's magic-number-prefixed
//! `void*`.

use crate::error::{EngineError, Result};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

pub const MAX_SLOTS: usize = 128;
pub const MAX_LEGACY_QUEUE: usize = 4096;

/// A completion flag: `0` means not-yet-complete, `1` means complete. A
/// real device writes this from kernel space; the loopback transport's
/// spawned completion task writes it directly, which is the whole point of
/// keeping this a flag rather than a channel (Design Note "Concurrency
/// primitives" — the writer is not in user-thread space).
pub type CompletionFlag = Arc<AtomicU8>;

fn new_flag() -> CompletionFlag {
    Arc::new(AtomicU8::new(0))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Armed,
    Posted,
    Completed,
}

struct Slot {
    state: SlotState,
    flag: CompletionFlag,
}

/// The 128-slot device-side completion pool. Represents the bundle of
/// device context/stream/thread/notify/flag resources the spec describes
/// as a single opaque unit; this crate's loopback backing needs only the
/// flag, so the other fields from `complete_pool.h`'s `Slot` struct are not
/// modeled — there is nothing for them to do without a device runtime.
pub struct CompletionPool {
    slots: Mutex<Vec<Slot>>,
    free: Mutex<Vec<u16>>,
}

impl Default for CompletionPool {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionPool {
    pub fn new() -> Self {
        let slots = (0..MAX_SLOTS)
            .map(|_| Slot {
                state: SlotState::Free,
                flag: new_flag(),
            })
            .collect();
        let free = (0..MAX_SLOTS as u16).rev().collect();
        Self {
            slots: Mutex::new(slots),
            free: Mutex::new(free),
        }
    }

    pub async fn acquire(&self) -> Result<(u16, CompletionFlag)> {
        let mut free = self.free.lock().await;
        let index = free
            .pop()
            .ok_or_else(|| EngineError::ResourceExhausted("completion slot pool exhausted".into()))?;
        let mut slots = self.slots.lock().await;
        let slot = &mut slots[index as usize];
        slot.state = SlotState::Armed;
        Ok((index, slot.flag.clone()))
    }

    pub async fn mark_posted(&self, index: u16) {
        self.slots.lock().await[index as usize].state = SlotState::Posted;
    }

    pub async fn poll(&self, index: u16) -> bool {
        let mut slots = self.slots.lock().await;
        let slot = &mut slots[index as usize];
        if slot.flag.load(Ordering::Acquire) == 1 {
            slot.state = SlotState::Completed;
            true
        } else {
            false
        }
    }

    pub async fn release(&self, index: u16) {
        let mut slots = self.slots.lock().await;
        let slot = &mut slots[index as usize];
        slot.flag.store(0, Ordering::Release);
        slot.state = SlotState::Free;
        drop(slots);
        self.free.lock().await.push(index);
    }

    pub async fn in_use_count(&self) -> usize {
        MAX_SLOTS - self.free.lock().await.len()
    }
}

/// The fixed-size host-pinned flag queue backing the legacy (host) request
/// path — simpler than the device pool because there is no device context
/// to own, just a flag and an address.
pub struct LegacyFlagQueue {
    flags: Mutex<Vec<CompletionFlag>>,
    free: Mutex<Vec<u32>>,
}

impl Default for LegacyFlagQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl LegacyFlagQueue {
    pub fn new() -> Self {
        let flags = (0..MAX_LEGACY_QUEUE).map(|_| new_flag()).collect();
        let free = (0..MAX_LEGACY_QUEUE as u32).rev().collect();
        Self {
            flags: Mutex::new(flags),
            free: Mutex::new(free),
        }
    }

    pub async fn acquire(&self) -> Result<(u32, CompletionFlag)> {
        let mut free = self.free.lock().await;
        let index = free
            .pop()
            .ok_or_else(|| EngineError::ResourceExhausted("legacy flag queue exhausted".into()))?;
        let flag = self.flags.lock().await[index as usize].clone();
        Ok((index, flag))
    }

    pub async fn release(&self, index: u32) {
        self.flags.lock().await[index as usize].store(0, Ordering::Release);
        self.free.lock().await.push(index);
    }
}

/// One outstanding completion, tagged by which path produced it (Design
/// Note "Request handle tagging"). The magic-number demux from the wire
/// format has no reason to exist in-memory once Rust gives us a real enum;
/// it would only matter again if this handle crossed an FFI boundary.
#[derive(Clone)]
pub enum RequestHandle {
    Legacy { queue_index: u32, flag: CompletionFlag },
    Device { slot_index: u16, flag: CompletionFlag },
}

impl RequestHandle {
    pub fn is_complete(&self) -> bool {
        let flag = match self {
            RequestHandle::Legacy { flag, .. } => flag,
            RequestHandle::Device { flag, .. } => flag,
        };
        flag.load(Ordering::Acquire) == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn slot_pool_round_trips_through_acquire_release() {
        let pool = CompletionPool::new();
        let (index, flag) = pool.acquire().await.unwrap();
        assert_eq!(pool.in_use_count().await, 1);
        flag.store(1, Ordering::Release);
        assert!(pool.poll(index).await);
        pool.release(index).await;
        assert_eq!(pool.in_use_count().await, 0);
        assert_eq!(flag.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn slot_pool_exhausts_at_128() {
        let pool = CompletionPool::new();
        let mut handles = Vec::new();
        for _ in 0..MAX_SLOTS {
            handles.push(pool.acquire().await.unwrap());
        }
        assert!(matches!(
            pool.acquire().await,
            Err(EngineError::ResourceExhausted(_))
        ));
        for (index, _) in handles {
            pool.release(index).await;
        }
        assert!(pool.acquire().await.is_ok());
    }
}
