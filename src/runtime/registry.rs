//! Generation-checked arena of weak handles
//!
//! Used for live-object diagnostics. Entries are weak, so the registry never
//! keeps anything alive; a stale [`Handle`] (slot reused or object dropped)
//! simply resolves to `None`.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use super::lock;

/// Index into a [`Registry`] plus the generation of the slot it was issued for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    entry: Option<Weak<T>>,
}

impl<T> Slot<T> {
    fn is_vacant(&self) -> bool {
        self.entry.as_ref().is_none_or(|weak| weak.strong_count() == 0)
    }
}

pub struct Registry<T> {
    slots: Mutex<Vec<Slot<T>>>,
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
        }
    }

    /// Build an object that knows its own handle and register it.
    ///
    /// `build` runs with the registry locked and must not call back into it.
    pub fn insert_with(&self, build: impl FnOnce(Handle) -> Arc<T>) -> Arc<T> {
        let mut slots = lock(&self.slots);
        let index = match slots.iter().position(Slot::is_vacant) {
            Some(index) => {
                let slot = &mut slots[index];
                if slot.entry.take().is_some() {
                    slot.generation = slot.generation.wrapping_add(1);
                }
                index
            }
            None => {
                slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                slots.len() - 1
            }
        };
        let handle = Handle {
            index: index as u32,
            generation: slots[index].generation,
        };
        let object = build(handle);
        slots[index].entry = Some(Arc::downgrade(&object));
        object
    }

    pub fn get(&self, handle: Handle) -> Option<Arc<T>> {
        let slots = lock(&self.slots);
        let slot = slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_ref()?.upgrade()
    }

    /// Forget `handle`; returns false if it was already stale
    pub fn remove(&self, handle: Handle) -> bool {
        let mut slots = lock(&self.slots);
        match slots.get_mut(handle.index as usize) {
            Some(slot) if slot.generation == handle.generation && slot.entry.is_some() => {
                slot.entry = None;
                slot.generation = slot.generation.wrapping_add(1);
                true
            }
            _ => false,
        }
    }

    /// Every object still alive
    pub fn live(&self) -> Vec<Arc<T>> {
        lock(&self.slots)
            .iter()
            .filter_map(|slot| slot.entry.as_ref()?.upgrade())
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.slots).iter().filter(|slot| !slot.is_vacant()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}
