//! Fixed set of reusable slots that bounds how many connections are buffered at once.
//!
//! # Slot States
//!
//! A slot is either vacant or occupied (holds a [ConnectionBuffer]) and, independently, either
//! locked or unlocked. A slot is free when it is vacant and unlocked. The acceptor locks a free
//! slot before accepting, populates it, and unlocks it. The drain task locks the occupied slot
//! for each read, then vacates and unlocks it once the connection is done.
//!
//! Locks are released when a [SlotHandle] is dropped, so every exit path releases exactly once.
//! Releasing a vacant slot wakes any task waiting in [SlotPool::acquire].

use crate::{Connection, ConnectionBuffer, Error};
use async_lock::{Mutex, MutexGuardArc};
use bytes::Bytes;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tokio::sync::Notify;

type Guard<C> = MutexGuardArc<Option<ConnectionBuffer<C>>>;

/// State shared by every slot in a pool.
#[derive(Default)]
struct Shared {
    released: Notify,
    occupied: AtomicUsize,
}

/// A single unit of connection capacity.
pub struct Slot<C: Connection> {
    index: usize,
    buffer: Arc<Mutex<Option<ConnectionBuffer<C>>>>,
    shared: Arc<Shared>,
}

impl<C: Connection> Clone for Slot<C> {
    fn clone(&self) -> Self {
        Self {
            index: self.index,
            buffer: self.buffer.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<C: Connection> Slot<C> {
    /// Returns the position of the slot in its pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Lock the slot, waiting for the current holder (if any) to release it.
    pub async fn lock(&self) -> SlotHandle<C> {
        let guard = self.buffer.lock_arc().await;
        SlotHandle::new(self.clone(), guard)
    }

    /// Lock the slot if no one else holds it.
    pub fn try_lock(&self) -> Option<SlotHandle<C>> {
        let guard = self.buffer.try_lock_arc()?;
        Some(SlotHandle::new(self.clone(), guard))
    }

    /// Copy out the bytes in the inclusive range `[lo, hi]` of the slot's buffer.
    ///
    /// Waits for any in-progress read into the buffer to complete.
    pub async fn extract_range(&self, lo: usize, hi: usize) -> Result<Bytes, Error> {
        let handle = self.lock().await;
        handle
            .buffer()
            .ok_or(Error::SlotVacant)?
            .extract_range(lo, hi)
    }
}

/// Exclusive access to a [Slot], released on drop.
pub struct SlotHandle<C: Connection> {
    slot: Slot<C>,
    // Always populated until drop (taken there so the lock is released before waking waiters)
    guard: Option<Guard<C>>,
}

impl<C: Connection> SlotHandle<C> {
    fn new(slot: Slot<C>, guard: Guard<C>) -> Self {
        Self {
            slot,
            guard: Some(guard),
        }
    }

    /// Returns the slot this handle locks.
    pub fn slot(&self) -> &Slot<C> {
        &self.slot
    }

    /// Returns the position of the slot in its pool.
    pub fn index(&self) -> usize {
        self.slot.index
    }

    /// Returns true if the slot holds no buffer.
    pub fn is_vacant(&self) -> bool {
        self.buffer().is_none()
    }

    /// Returns the slot's buffer, if occupied.
    pub fn buffer(&self) -> Option<&ConnectionBuffer<C>> {
        self.guard.as_ref().and_then(|guard| (**guard).as_ref())
    }

    /// Returns the slot's buffer for mutation, if occupied.
    pub fn buffer_mut(&mut self) -> Option<&mut ConnectionBuffer<C>> {
        self.guard.as_mut().and_then(|guard| (**guard).as_mut())
    }

    /// Place `buffer` in the slot, returning the buffer it replaced (if any).
    pub fn populate(&mut self, buffer: ConnectionBuffer<C>) -> Option<ConnectionBuffer<C>> {
        let guard = self.guard.as_mut()?;
        let previous = guard.replace(buffer);
        if previous.is_none() {
            self.slot.shared.occupied.fetch_add(1, Ordering::Relaxed);
        }
        previous
    }

    /// Remove the slot's buffer, leaving it vacant.
    pub fn vacate(&mut self) -> Option<ConnectionBuffer<C>> {
        let buffer = self.guard.as_mut()?.take();
        if buffer.is_some() {
            self.slot.shared.occupied.fetch_sub(1, Ordering::Relaxed);
        }
        buffer
    }

    /// Release the slot's lock.
    pub fn release(self) {
        drop(self);
    }
}

impl<C: Connection> Drop for SlotHandle<C> {
    fn drop(&mut self) {
        let vacant = self.is_vacant();
        drop(self.guard.take());
        if vacant {
            self.slot.shared.released.notify_waiters();
        }
    }
}

/// A fixed-size collection of [Slot]s.
pub struct SlotPool<C: Connection> {
    slots: Arc<[Slot<C>]>,
    shared: Arc<Shared>,
}

impl<C: Connection> Clone for SlotPool<C> {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<C: Connection> SlotPool<C> {
    /// Create a pool of `count` vacant slots.
    pub fn new(count: usize) -> Self {
        let shared = Arc::new(Shared::default());
        let slots = (0..count)
            .map(|index| Slot {
                index,
                buffer: Arc::new(Mutex::new(None)),
                shared: shared.clone(),
            })
            .collect();
        Self { slots, shared }
    }

    /// Returns the number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if the pool has no slots.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Returns the number of slots that currently hold a buffer.
    pub fn occupied(&self) -> usize {
        self.shared.occupied.load(Ordering::Relaxed)
    }

    /// Returns the slot at `index`.
    pub fn slot(&self, index: usize) -> Option<Slot<C>> {
        self.slots.get(index).cloned()
    }

    /// Lock the first free slot without waiting.
    ///
    /// Returns `None` if every slot is occupied or locked.
    pub fn try_acquire_free_slot(&self) -> Option<SlotHandle<C>> {
        self.slots.iter().find_map(|slot| {
            // An occupied handle is dropped here without waking anyone
            slot.try_lock().filter(SlotHandle::is_vacant)
        })
    }

    /// Vacate every slot, closing the connections they hold, and return how many were occupied.
    ///
    /// Waits for each slot's current holder to release it.
    pub async fn vacate_all(&self) -> usize {
        let mut vacated = 0;
        for slot in self.slots.iter() {
            let mut handle = slot.lock().await;
            if handle.vacate().is_some() {
                vacated += 1;
            }
        }
        vacated
    }

    /// Lock the first free slot, waiting for one to be released if none is free.
    pub async fn acquire(&self) -> SlotHandle<C> {
        loop {
            // Register interest before scanning so a release that lands in between is seen
            let released = self.shared.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if let Some(handle) = self.try_acquire_free_slot() {
                return handle;
            }
            released.await;
        }
    }
}
