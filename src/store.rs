//! Buffer store interface.
//!
//! Sample buffers are owned by the host's shared store; this engine only
//! mutates slot contents under the store's locking discipline. The trait
//! models the narrow surface the engine needs: paired, locked read/write
//! access to a time slot and its companion value slot.

use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

/// Index of one slot in the store.
pub type SlotIndex = usize;

/// The pair of store slots backing one curve: timestamps and values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRef {
    pub x: SlotIndex,
    pub y: SlotIndex,
}

impl BufferRef {
    pub fn new(x: SlotIndex, y: SlotIndex) -> Self {
        Self { x, y }
    }
}

/// Attribute metadata carried next to a slot's data.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SlotMeta {
    /// Backend that served the last update.
    pub backend: String,
    pub connected: bool,
    pub read_access: bool,
    pub write_access: bool,
    /// Incremented on every delivered update.
    pub monitor_count: u64,
}

/// One store slot: a data array plus its metadata.
#[derive(Debug, Clone, Default)]
pub struct Slot {
    pub data: Vec<f64>,
    pub meta: SlotMeta,
}

/// Errors from slot access.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// No slot registered at the given index.
    #[error("no slot at index {0}")]
    MissingSlot(SlotIndex),

    /// The time and value references point at the same slot.
    #[error("buffer pair aliases slot {0}")]
    AliasedPair(SlotIndex),
}

/// Locked access to paired slots in the host's buffer store.
///
/// `with_pair` runs the closure with both slots of a [`BufferRef`] locked so
/// the paired (time, value) arrays are updated atomically with respect to the
/// store's readers. The lock is held only for the closure's duration.
pub trait BufferStore: Send + Sync {
    fn with_pair(
        &self,
        buf: BufferRef,
        f: &mut dyn FnMut(&mut Slot, &mut Slot),
    ) -> Result<(), StoreError>;

    /// Snapshot one slot, if present.
    fn read(&self, index: SlotIndex) -> Option<Slot>;
}

/// In-memory buffer store for embedding and tests.
#[derive(Default)]
pub struct MemoryBufferStore {
    slots: Mutex<HashMap<SlotIndex, Slot>>,
}

impl MemoryBufferStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a slot.
    pub fn insert(&self, index: SlotIndex, slot: Slot) {
        self.slots.lock().expect("store lock poisoned").insert(index, slot);
    }
}

impl BufferStore for MemoryBufferStore {
    fn with_pair(
        &self,
        buf: BufferRef,
        f: &mut dyn FnMut(&mut Slot, &mut Slot),
    ) -> Result<(), StoreError> {
        if buf.x == buf.y {
            return Err(StoreError::AliasedPair(buf.x));
        }
        let mut slots = self.slots.lock().expect("store lock poisoned");
        // Take both slots out so we can hand out two disjoint mutable
        // references; they are reinserted before the map lock is released.
        let mut x_slot = slots.remove(&buf.x).ok_or(StoreError::MissingSlot(buf.x))?;
        let mut y_slot = match slots.remove(&buf.y) {
            Some(slot) => slot,
            None => {
                slots.insert(buf.x, x_slot);
                return Err(StoreError::MissingSlot(buf.y));
            }
        };
        f(&mut x_slot, &mut y_slot);
        slots.insert(buf.x, x_slot);
        slots.insert(buf.y, y_slot);
        Ok(())
    }

    fn read(&self, index: SlotIndex) -> Option<Slot> {
        self.slots.lock().expect("store lock poisoned").get(&index).cloned()
    }
}
