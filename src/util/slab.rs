//! Slot storage with generation-checked keys.
//!
//! [`Slab`] backs the per-cell request set and the per-signal callback list.
//! Both need O(1) removal by a key handed out at insertion time, and both must
//! tolerate stale keys: a key whose slot was already vacated (or drained and
//! reused) never removes the new occupant.
//!
//! # Design
//!
//! - Elements live in a `Vec` of slots with a generation counter each
//! - Vacated slots form an intrusive free list and are reused
//! - Every vacate bumps the generation, so old keys stop matching

use core::fmt;

/// A key into a [`Slab`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey {
    index: u32,
    generation: u32,
}

impl SlotKey {
    #[cfg(test)]
    const fn index(self) -> u32 {
        self.index
    }

    #[cfg(test)]
    const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SlotKey({}:{})", self.index, self.generation)
    }
}

#[derive(Debug)]
enum Slot<T> {
    Occupied { value: T, generation: u32 },
    Vacant { next_free: Option<u32>, generation: u32 },
}

/// Dense slot storage with stable, generation-checked keys.
#[derive(Debug)]
pub struct Slab<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    len: usize,
}

impl<T> Default for Slab<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Slab<T> {
    /// Creates an empty slab.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            len: 0,
        }
    }

    /// Returns the number of occupied slots.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no slot is occupied.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Stores `value` and returns its key.
    pub fn insert(&mut self, value: T) -> SlotKey {
        self.len += 1;

        if let Some(free_index) = self.free_head {
            let slot = &mut self.slots[free_index as usize];
            let Slot::Vacant {
                next_free,
                generation,
            } = *slot
            else {
                unreachable!("free list pointed to occupied slot");
            };
            self.free_head = next_free;
            *slot = Slot::Occupied { value, generation };
            return SlotKey {
                index: free_index,
                generation,
            };
        }

        let index = u32::try_from(self.slots.len()).expect("slab overflow");
        self.slots.push(Slot::Occupied {
            value,
            generation: 0,
        });
        SlotKey {
            index,
            generation: 0,
        }
    }

    /// Removes and returns the value stored under `key`.
    ///
    /// Returns `None` for stale or foreign keys.
    pub fn remove(&mut self, key: SlotKey) -> Option<T> {
        let slot = self.slots.get_mut(key.index as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == key.generation => {
                let vacant = Slot::Vacant {
                    next_free: self.free_head,
                    generation: generation.wrapping_add(1),
                };
                let Slot::Occupied { value, .. } = core::mem::replace(slot, vacant) else {
                    unreachable!();
                };
                self.free_head = Some(key.index);
                self.len -= 1;
                Some(value)
            }
            _ => None,
        }
    }

    /// Returns true if `key` refers to a live value.
    #[must_use]
    pub fn contains(&self, key: SlotKey) -> bool {
        matches!(
            self.slots.get(key.index as usize),
            Some(Slot::Occupied { generation, .. }) if *generation == key.generation
        )
    }

    /// Vacates every slot and returns the values in slot order.
    ///
    /// Slots stay allocated with bumped generations, so keys issued before
    /// the drain never match anything inserted afterwards.
    pub fn take_all(&mut self) -> Vec<T> {
        let mut values = Vec::with_capacity(self.len);
        let mut free_head = None;

        for (index, slot) in self.slots.iter_mut().enumerate().rev() {
            let generation = match slot {
                Slot::Occupied { generation, .. } => generation.wrapping_add(1),
                Slot::Vacant { generation, .. } => *generation,
            };
            let old = core::mem::replace(
                slot,
                Slot::Vacant {
                    next_free: free_head,
                    generation,
                },
            );
            if let Slot::Occupied { value, .. } = old {
                values.push(value);
            }
            free_head = u32::try_from(index).ok();
        }

        values.reverse();
        self.free_head = free_head;
        self.len = 0;
        values
    }

    #[cfg(test)]
    fn values(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Occupied { value, .. } => Some(value),
            Slot::Vacant { .. } => None,
        })
    }
}
