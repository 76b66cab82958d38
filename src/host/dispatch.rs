//! Function dispatch table.
//!
//! Every registered function key maps to a thunk: either a native body or a
//! trampoline into a script override. Overriding swaps the variant and
//! saves the original, so teardown is a table diff rather than code
//! patching, and "call the overridden original" is a lookup in the saved
//! map.

use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::error::Result;
use crate::host::memory::ValuePtr;
use crate::host::object::ObjectId;
use crate::host::reflection::FunctionKey;
use crate::registry::FunctionDescId;

/// Type-erased native function body. Receives the bridge, the target
/// object and the parameter frame laid out by the function's reflection.
#[derive(Clone)]
pub struct NativeFn {
    inner: Rc<dyn Fn(&mut crate::context::BridgeContext, ObjectId, ValuePtr) -> Result<()>>,
}

impl NativeFn {
    pub fn new<F>(f: F) -> NativeFn
    where
        F: Fn(&mut crate::context::BridgeContext, ObjectId, ValuePtr) -> Result<()> + 'static,
    {
        NativeFn { inner: Rc::new(f) }
    }

    pub fn call(
        &self,
        ctx: &mut crate::context::BridgeContext,
        target: ObjectId,
        frame: ValuePtr,
    ) -> Result<()> {
        (self.inner)(ctx, target, frame)
    }
}

impl std::fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NativeFn(..)")
    }
}

/// What executes when a function key is invoked.
#[derive(Clone, Debug)]
pub enum Thunk {
    Native(NativeFn),
    /// Trampoline into the script function pinned by this descriptor.
    Script(FunctionDescId),
}

#[derive(Default)]
pub struct DispatchTable {
    thunks: FxHashMap<FunctionKey, Thunk>,
    saved: FxHashMap<FunctionKey, Thunk>,
}

impl DispatchTable {
    pub fn new() -> DispatchTable {
        DispatchTable::default()
    }

    pub fn register_native(&mut self, key: FunctionKey, body: NativeFn) {
        self.thunks.insert(key, Thunk::Native(body));
    }

    pub fn thunk(&self, key: FunctionKey) -> Option<Thunk> {
        self.thunks.get(&key).cloned()
    }

    /// Points `key` at a script trampoline, saving the previous thunk the
    /// first time. Re-pointing an already-redirected key just updates the
    /// trampoline target.
    pub fn redirect_to_script(&mut self, key: FunctionKey, desc: FunctionDescId) {
        if let Some(prev) = self.thunks.insert(key, Thunk::Script(desc)) {
            if matches!(prev, Thunk::Native(_)) {
                self.saved.entry(key).or_insert(prev);
            }
        }
    }

    pub fn is_redirected(&self, key: FunctionKey) -> bool {
        matches!(self.thunks.get(&key), Some(Thunk::Script(_)))
    }

    /// The native thunk saved when `key` was redirected, if any.
    pub fn original(&self, key: FunctionKey) -> Option<Thunk> {
        self.saved.get(&key).cloned()
    }

    /// Restores the saved thunk. Returns false when `key` was never
    /// redirected.
    pub fn restore(&mut self, key: FunctionKey) -> bool {
        match self.saved.remove(&key) {
            Some(original) => {
                self.thunks.insert(key, original);
                true
            }
            None => false,
        }
    }

    /// Drops every trace of `key` (duplicated functions on teardown).
    pub fn remove(&mut self, key: FunctionKey) {
        self.thunks.remove(&key);
        self.saved.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::FunctionDescId;

    fn key(v: u32) -> FunctionKey {
        FunctionKey::from_raw(v)
    }

    #[test]
    fn redirect_saves_original_once() {
        let mut table = DispatchTable::new();
        let k = key(1);
        table.register_native(k, NativeFn::new(|_, _, _| Ok(())));
        assert!(!table.is_redirected(k));

        table.redirect_to_script(k, FunctionDescId::from_raw(10));
        assert!(table.is_redirected(k));
        assert!(matches!(table.original(k), Some(Thunk::Native(_))));

        // Second redirect keeps the first saved original.
        table.redirect_to_script(k, FunctionDescId::from_raw(11));
        assert!(matches!(table.original(k), Some(Thunk::Native(_))));
        assert!(matches!(table.thunk(k), Some(Thunk::Script(d)) if d.raw() == 11));
    }

    #[test]
    fn restore_round_trip() {
        let mut table = DispatchTable::new();
        let k = key(2);
        table.register_native(k, NativeFn::new(|_, _, _| Ok(())));
        table.redirect_to_script(k, FunctionDescId::from_raw(1));
        assert!(table.restore(k));
        assert!(!table.is_redirected(k));
        assert!(matches!(table.thunk(k), Some(Thunk::Native(_))));
        assert!(!table.restore(k));
    }

    #[test]
    fn remove_clears_both_maps() {
        let mut table = DispatchTable::new();
        let k = key(3);
        table.register_native(k, NativeFn::new(|_, _, _| Ok(())));
        table.redirect_to_script(k, FunctionDescId::from_raw(1));
        table.remove(k);
        assert!(table.thunk(k).is_none());
        assert!(table.original(k).is_none());
    }
}
