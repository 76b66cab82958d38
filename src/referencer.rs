//! Keeps host objects alive while script holds handles to them.
//!
//! Every userdata handed to script adds a reference here; the garbage
//! collection hook on the script side releases it. The candidate sweep in
//! the context consults this before letting the heap reclaim an object.

use rustc_hash::FxHashMap;

use crate::host::object::ObjectId;

#[derive(Default)]
pub struct ObjectReferencer {
    refs: FxHashMap<ObjectId, u32>,
}

impl ObjectReferencer {
    pub fn new() -> ObjectReferencer {
        ObjectReferencer::default()
    }

    pub fn add_ref(&mut self, id: ObjectId) {
        *self.refs.entry(id).or_insert(0) += 1;
    }

    /// Drops one reference. Returns true when the object is no longer
    /// referenced at all.
    pub fn release(&mut self, id: ObjectId) -> bool {
        match self.refs.get_mut(&id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.refs.remove(&id);
                true
            }
            None => true,
        }
    }

    /// Forgets the object entirely, however many references it held.
    pub fn clear_object(&mut self, id: ObjectId) {
        self.refs.remove(&id);
    }

    pub fn is_referenced(&self, id: ObjectId) -> bool {
        self.refs.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    pub fn clear(&mut self) {
        self.refs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_nest() {
        let mut refs = ObjectReferencer::new();
        let id = ObjectId::new(1, 0);
        refs.add_ref(id);
        refs.add_ref(id);
        assert!(!refs.release(id));
        assert!(refs.is_referenced(id));
        assert!(refs.release(id));
        assert!(!refs.is_referenced(id));
    }

    #[test]
    fn clear_object_drops_all_counts() {
        let mut refs = ObjectReferencer::new();
        let id = ObjectId::new(2, 1);
        refs.add_ref(id);
        refs.add_ref(id);
        refs.clear_object(id);
        assert!(refs.is_empty());
        assert!(refs.release(id));
    }
}
