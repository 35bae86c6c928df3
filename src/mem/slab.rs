//! Generational arena backing every kernel object table.
//!
//! Tasks, primitives, timers and work items live in slabs and refer to each
//! other by handle. A handle carries the generation of the slot it was issued
//! for, so a handle to a destroyed object never resolves to whatever reused
//! the slot.

use alloc::vec::Vec;
use core::fmt;
use core::marker::PhantomData;

/// Raw slot address: index plus generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key {
    index: u32,
    generation: u32,
}

impl Key {
    /// Slot index, stable for the lifetime of the object.
    pub fn index(self) -> u32 {
        self.index
    }

    /// Generation of the slot when the handle was issued.
    pub fn generation(self) -> u32 {
        self.generation
    }
}

/// A typed handle into a [`Slab`].
pub trait Handle: Copy + Eq {
    /// Wrap a raw key.
    fn from_key(key: Key) -> Self;
    /// Unwrap to the raw key.
    fn key(self) -> Key;
}

/// Declare a typed kernel handle.
macro_rules! kernel_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name($crate::mem::slab::Key);

        impl $crate::mem::slab::Handle for $name {
            fn from_key(key: $crate::mem::slab::Key) -> Self {
                Self(key)
            }

            fn key(self) -> $crate::mem::slab::Key {
                self.0
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}#{}", self.0.index(), self.0.generation())
            }
        }
    };
}
pub(crate) use kernel_handle;

enum Slot<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32 },
}

/// Fixed-limit generational arena.
pub struct Slab<H, T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
    limit: usize,
    _handle: PhantomData<H>,
}

impl<H: Handle, T> Slab<H, T> {
    /// Create an empty slab holding at most `limit` live objects.
    pub const fn with_limit(limit: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            limit,
            _handle: PhantomData,
        }
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert a value, or hand it back if the slab is at its limit.
    pub fn insert(&mut self, value: T) -> Result<H, T> {
        if self.len >= self.limit {
            return Err(value);
        }

        let reused = self.free.pop().and_then(|index| match self.slots.get(index as usize) {
            Some(Slot::Vacant { generation }) => Some((index, generation.wrapping_add(1))),
            _ => None,
        });

        let key = match reused {
            Some((index, generation)) => {
                self.slots[index as usize] = Slot::Occupied { generation, value };
                Key { index, generation }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot::Occupied {
                    generation: 0,
                    value,
                });
                Key {
                    index,
                    generation: 0,
                }
            }
        };

        self.len += 1;
        Ok(H::from_key(key))
    }

    pub fn get(&self, handle: H) -> Option<&T> {
        let key = handle.key();
        match self.slots.get(key.index as usize) {
            Some(Slot::Occupied { generation, value }) if *generation == key.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: H) -> Option<&mut T> {
        let key = handle.key();
        match self.slots.get_mut(key.index as usize) {
            Some(Slot::Occupied { generation, value }) if *generation == key.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    pub fn contains(&self, handle: H) -> bool {
        self.get(handle).is_some()
    }

    /// Remove and return the value behind `handle`.
    pub fn remove(&mut self, handle: H) -> Option<T> {
        let key = handle.key();
        let slot = self.slots.get_mut(key.index as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == key.generation => {}
            _ => return None,
        }

        let old = core::mem::replace(
            slot,
            Slot::Vacant {
                generation: key.generation,
            },
        );
        self.free.push(key.index);
        self.len -= 1;
        match old {
            Slot::Occupied { value, .. } => Some(value),
            Slot::Vacant { .. } => None,
        }
    }

    /// Iterate live objects with their handles.
    pub fn iter(&self) -> impl Iterator<Item = (H, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied { generation, value } => Some((
                    H::from_key(Key {
                        index: index as u32,
                        generation: *generation,
                    }),
                    value,
                )),
                Slot::Vacant { .. } => None,
            })
    }
}

impl<H, T> fmt::Debug for Slab<H, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slab")
            .field("len", &self.len)
            .field("limit", &self.limit)
            .finish()
    }
}
