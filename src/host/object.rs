//! Host object heap.
//!
//! Objects live in generational slots; an [`ObjectId`] is a slot index plus
//! the generation it was issued for. Resolving an id whose slot has been
//! reused (or freed) yields `None`, which is how every stale-handle path in
//! the bridge degrades instead of touching dead memory.

use rustc_hash::FxHashMap;

use crate::host::memory::{ParamBuffer, ValuePtr};
use crate::host::reflection::TypeKey;

/// Handle to an object in the host heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId {
    index: u32,
    generation: u32,
}

impl ObjectId {
    pub fn new(index: u32, generation: u32) -> ObjectId {
        ObjectId { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

struct Slot {
    generation: u32,
    body: Option<ObjectBody>,
}

/// Raw storage of one object: its class and a class-laid-out byte buffer.
pub struct ObjectBody {
    class: TypeKey,
    data: ParamBuffer,
}

impl ObjectBody {
    pub fn class(&self) -> TypeKey {
        self.class
    }

    pub fn ptr(&self) -> ValuePtr {
        self.data.ptr()
    }

    pub fn size(&self) -> usize {
        self.data.size()
    }
}

/// Generational slot heap for host objects.
#[derive(Default)]
pub struct HostHeap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    names: FxHashMap<ObjectId, String>,
}

impl HostHeap {
    pub fn new() -> HostHeap {
        HostHeap::default()
    }

    /// Allocates a zero-initialized body for `class`. Field construction
    /// (strings, containers) is driven by the class's property descriptors
    /// from the bridge side.
    pub fn allocate(&mut self, class: TypeKey, size: usize, align: usize) -> ObjectId {
        let body = ObjectBody {
            class,
            data: ParamBuffer::zeroed(size, align),
        };
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.body = Some(body);
            ObjectId {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                body: Some(body),
            });
            ObjectId {
                index,
                generation: 0,
            }
        }
    }

    pub fn is_valid(&self, id: ObjectId) -> bool {
        self.slot(id).is_some()
    }

    fn slot(&self, id: ObjectId) -> Option<&Slot> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation || slot.body.is_none() {
            return None;
        }
        Some(slot)
    }

    /// Base address of the object's body, or `None` for a dead id.
    pub fn resolve(&self, id: ObjectId) -> Option<ValuePtr> {
        self.slot(id).and_then(|s| s.body.as_ref()).map(|b| b.ptr())
    }

    pub fn class_of(&self, id: ObjectId) -> Option<TypeKey> {
        self.slot(id).and_then(|s| s.body.as_ref()).map(|b| b.class)
    }

    /// Detaches the body from the slot and bumps the generation. The body
    /// is returned so the caller can run field destructors before the bytes
    /// are reclaimed.
    pub fn free(&mut self, id: ObjectId) -> Option<ObjectBody> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let body = slot.body.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.names.remove(&id);
        Some(body)
    }

    pub fn set_name(&mut self, id: ObjectId, name: impl Into<String>) {
        if self.is_valid(id) {
            self.names.insert(id, name.into());
        }
    }

    pub fn name_of(&self, id: ObjectId) -> Option<&str> {
        self.names.get(&id).map(String::as_str)
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.body.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::reflection::TypeKey;

    fn key(v: u32) -> TypeKey {
        TypeKey::from_raw(v)
    }

    #[test]
    fn allocate_and_resolve() {
        let mut heap = HostHeap::new();
        let id = heap.allocate(key(1), 24, 8);
        assert!(heap.is_valid(id));
        assert_eq!(heap.class_of(id), Some(key(1)));
        let ptr = heap.resolve(id).unwrap();
        ptr.write::<u64>(99);
        assert_eq!(heap.resolve(id).unwrap().read::<u64>(), 99);
    }

    #[test]
    fn freed_id_goes_stale() {
        let mut heap = HostHeap::new();
        let id = heap.allocate(key(1), 8, 8);
        assert!(heap.free(id).is_some());
        assert!(!heap.is_valid(id));
        assert!(heap.resolve(id).is_none());
        assert!(heap.free(id).is_none());
    }

    #[test]
    fn slot_reuse_bumps_generation() {
        let mut heap = HostHeap::new();
        let a = heap.allocate(key(1), 8, 8);
        heap.free(a);
        let b = heap.allocate(key(2), 8, 8);
        assert_eq!(a.index(), b.index());
        assert_ne!(a.generation(), b.generation());
        assert!(!heap.is_valid(a));
        assert!(heap.is_valid(b));
    }

    #[test]
    fn names_follow_lifetime() {
        let mut heap = HostHeap::new();
        let id = heap.allocate(key(1), 8, 8);
        heap.set_name(id, "Player_0");
        assert_eq!(heap.name_of(id), Some("Player_0"));
        heap.free(id);
        assert_eq!(heap.name_of(id), None);
    }
}
