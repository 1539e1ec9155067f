//! Generation-checked slot table.
use crate::prelude::*;
use crate::util::BitMap;

/// The ID of a slot in a `SlotTable`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId {
    index: u32,
    gen: u32,
}

impl SlotId {
    /// The null ID, which never refers to an allocated slot.
    pub const NULL: SlotId = SlotId { index: 0, gen: 0 };

    /// Returns the index of the slot.
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Returns the generation of the slot when the ID was issued.
    pub const fn gen(&self) -> u32 {
        self.gen
    }

    /// Returns whether this is the null ID.
    pub const fn is_null(&self) -> bool {
        self.index == 0
    }
}

impl Debug for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.gen)
    }
}

struct Slot<T> {
    gen: u32,
    value: Option<T>,
}

/// A fixed-capacity table of slots.
///
/// All memory is reserved upfront; `alloc` never grows the table and
/// returns `None` once every slot is taken.
pub struct SlotTable<T> {
    slots: Vec<Slot<T>>,
    // Free slot indices, popped from the back.
    free: Vec<u32>,
    // Which slots currently hold a value.
    allocated: BitMap,
    name: &'static str,
}

impl<T> SlotTable<T> {
    /// Creates a table of `capacity` slots.
    ///
    /// Fails with `OutOfMemory` if the memory cannot be reserved.
    pub fn with_capacity(name: &'static str, capacity: usize) -> Result<Self> {
        if capacity == 0 || capacity >= u32::MAX as usize {
            return_errno_with_msg!(InvalidArgs, "slot table capacity out of range");
        }

        // Slot 0 is reserved.
        let nslots = capacity + 1;
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(nslots)
            .map_err(|_| Error::with_msg(OutOfMemory, "slot table allocation failed"))?;
        let mut free = Vec::new();
        free.try_reserve_exact(capacity)
            .map_err(|_| Error::with_msg(OutOfMemory, "slot table allocation failed"))?;
        let allocated = BitMap::try_zeroed(nslots)?;

        for _ in 0..nslots {
            slots.push(Slot {
                gen: 0,
                value: None,
            });
        }
        // Lowest indices get handed out first.
        free.extend((1..nslots as u32).rev());

        Ok(Self {
            slots,
            free,
            allocated,
            name,
        })
    }

    /// Stores `value` in a free slot, returning its ID, or gives the value
    /// back if the table is full.
    pub fn alloc(&mut self, value: T) -> core::result::Result<SlotId, T> {
        let Some(index) = self.free.pop() else {
            return Err(value);
        };
        let slot = &mut self.slots[index as usize];
        debug_assert!(slot.value.is_none());
        slot.value = Some(value);
        self.allocated.set_bit(index as usize);
        Ok(SlotId {
            index,
            gen: slot.gen,
        })
    }

    /// Takes the value out of a slot and returns the slot to the free list.
    ///
    /// # Panics
    ///
    /// Freeing an ID that is not currently allocated (a double free or a
    /// stale ID) is a logic error and panics.
    pub fn free(&mut self, id: SlotId) -> T {
        let index = id.index as usize;
        if index == 0 || index >= self.slots.len() || !self.allocated.test_bit(index) {
            panic!("{}: double free of slot {:?}", self.name, id);
        }
        let slot = &mut self.slots[index];
        if slot.gen != id.gen {
            panic!(
                "{}: stale free of slot {:?} (current generation {})",
                self.name, id, slot.gen
            );
        }

        self.allocated.clear_bit(index);
        slot.gen = slot.gen.wrapping_add(1);
        let value = slot.value.take().expect("allocated slot must hold a value");
        self.free.push(id.index);
        value
    }

    /// Returns the value of a live slot.
    pub fn get(&self, id: SlotId) -> Option<&T> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        slot.value.as_ref()
    }

    /// Returns the mutable value of a live slot.
    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut T> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        slot.value.as_mut()
    }

    /// Returns whether the ID refers to a live slot.
    pub fn contains(&self, id: SlotId) -> bool {
        self.get(id).is_some()
    }

    /// Returns the total number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    /// Returns the number of free slots.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Returns the number of slots in use.
    pub fn in_use(&self) -> usize {
        debug_assert_eq!(self.allocated.count_ones(), self.capacity() - self.free_count());
        self.capacity() - self.free_count()
    }

    /// Iterates over the live slots.
    pub fn iter(&self) -> impl Iterator<Item = (SlotId, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|value| {
                (
                    SlotId {
                        index: index as u32,
                        gen: slot.gen,
                    },
                    value,
                )
            })
        })
    }
}

impl<T> Debug for SlotTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotTable")
            .field("name", &self.name)
            .field("capacity", &self.capacity())
            .field("free", &self.free_count())
            .finish()
    }
}
