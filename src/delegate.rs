//! Delegate bridge bookkeeping.
//!
//! Delegate-typed fields live inside native objects as slots. A
//! single-binding slot is a plain (object, function) pair; a multicast
//! slot owns an invocation list. Script callbacks bound to slots are
//! materialized as generated functions on the owning class; the registry
//! here tracks the slot→signature association, the callback→function map
//! and the per-function signature state (binding count, in-flight call
//! count, deferred teardown flag).

use std::cell::Cell;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::host::memory::ValuePtr;
use crate::host::object::ObjectId;
use crate::host::reflection::{FunctionKey, TypeKey};
use crate::registry::FunctionDescId;
use crate::script::runtime::ScriptRef;

/// In-memory layout of a single-binding delegate field.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DelegateSlot {
    object: Option<ObjectId>,
    function: Option<FunctionKey>,
}

impl DelegateSlot {
    pub fn is_bound(&self) -> bool {
        self.object.is_some() && self.function.is_some()
    }

    pub fn binding(&self) -> Option<(ObjectId, FunctionKey)> {
        Some((self.object?, self.function?))
    }

    pub fn bind(&mut self, object: ObjectId, function: FunctionKey) {
        self.object = Some(object);
        self.function = Some(function);
    }

    pub fn unbind(&mut self) {
        self.object = None;
        self.function = None;
    }
}

/// One entry of a multicast invocation list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DelegateBinding {
    pub object: ObjectId,
    pub function: FunctionKey,
}

/// In-memory layout of a multicast delegate field.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MulticastSlot {
    invocation_list: Vec<DelegateBinding>,
}

impl MulticastSlot {
    pub fn bindings(&self) -> &[DelegateBinding] {
        &self.invocation_list
    }

    pub fn contains(&self, object: ObjectId, function: FunctionKey) -> bool {
        self.invocation_list
            .iter()
            .any(|b| b.object == object && b.function == function)
    }

    /// Adds a binding; duplicates are ignored.
    pub fn add(&mut self, object: ObjectId, function: FunctionKey) {
        if !self.contains(object, function) {
            self.invocation_list.push(DelegateBinding { object, function });
        }
    }

    pub fn remove(&mut self, object: ObjectId, function: FunctionKey) -> bool {
        let before = self.invocation_list.len();
        self.invocation_list
            .retain(|b| !(b.object == object && b.function == function));
        self.invocation_list.len() != before
    }

    pub fn remove_object(&mut self, object: ObjectId) {
        self.invocation_list.retain(|b| b.object != object);
    }

    pub fn clear(&mut self) {
        self.invocation_list.clear();
    }

    pub fn len(&self) -> usize {
        self.invocation_list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.invocation_list.is_empty()
    }
}

/// Identity of one script callback bound to a delegate: the owning class,
/// the owning object and the script function's id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallbackDesc {
    pub class: TypeKey,
    pub object: ObjectId,
    pub callback: u64,
}

/// State shared by every binding of one generated callback function.
pub struct SignatureDesc {
    desc: FunctionDescId,
    callback_ref: ScriptRef,
    num_bindings: Cell<u32>,
    num_calls: Cell<u32>,
    pending_kill: Cell<bool>,
}

impl SignatureDesc {
    pub fn new(desc: FunctionDescId, callback_ref: ScriptRef) -> SignatureDesc {
        SignatureDesc {
            desc,
            callback_ref,
            num_bindings: Cell::new(1),
            num_calls: Cell::new(0),
            pending_kill: Cell::new(false),
        }
    }

    pub fn desc(&self) -> FunctionDescId {
        self.desc
    }

    pub fn callback_ref(&self) -> ScriptRef {
        self.callback_ref
    }

    pub fn add_binding(&self) -> u32 {
        let v = self.num_bindings.get() + 1;
        self.num_bindings.set(v);
        v
    }

    /// Drops one binding. Returns the remaining count; at zero the caller
    /// tears the generated function down (or defers, see `mark_pending_kill`).
    pub fn remove_binding(&self) -> u32 {
        let v = self.num_bindings.get().saturating_sub(1);
        self.num_bindings.set(v);
        v
    }

    pub fn num_bindings(&self) -> u32 {
        self.num_bindings.get()
    }

    pub fn begin_call(&self) {
        self.num_calls.set(self.num_calls.get() + 1);
    }

    pub fn end_call(&self) {
        self.num_calls.set(self.num_calls.get().saturating_sub(1));
    }

    pub fn in_call(&self) -> bool {
        self.num_calls.get() > 0
    }

    /// Teardown requested while a call through this signature is on the
    /// stack. The last `end_call` checks the flag and finishes the job.
    pub fn mark_pending_kill(&self) {
        self.pending_kill.set(true);
    }

    pub fn is_pending_kill(&self) -> bool {
        self.pending_kill.get()
    }
}

/// Cross-maps between slots, script callbacks and generated functions.
#[derive(Default)]
pub struct DelegateRegistry {
    /// Slot address → signature function of the delegate type.
    slot_signatures: FxHashMap<usize, FunctionKey>,
    /// Single-binding slot address → the generated function last bound
    /// there. Survives `DelegateSlot::unbind` so repeated binds of the
    /// same callback can be released one unbind at a time.
    slot_functions: FxHashMap<usize, FunctionKey>,
    /// Script callback → the function generated for it.
    callbacks: FxHashMap<CallbackDesc, FunctionKey>,
    /// Generated function → shared signature state.
    signatures: FxHashMap<FunctionKey, Rc<SignatureDesc>>,
    /// Generated functions grafted onto each class, for bulk teardown.
    class_functions: FxHashMap<TypeKey, Vec<FunctionKey>>,
}

impl DelegateRegistry {
    pub fn new() -> DelegateRegistry {
        DelegateRegistry::default()
    }

    // ---- slot association -----------------------------------------------

    /// Remembers which signature a delegate slot at `addr` carries. Called
    /// whenever a delegate field surfaces to script.
    pub fn associate_slot(&mut self, addr: ValuePtr, signature: FunctionKey) {
        self.slot_signatures.insert(addr.addr(), signature);
    }

    pub fn slot_signature(&self, addr: usize) -> Option<FunctionKey> {
        self.slot_signatures.get(&addr).copied()
    }

    pub fn forget_slot(&mut self, addr: usize) {
        self.slot_signatures.remove(&addr);
        self.slot_functions.remove(&addr);
    }

    pub fn set_slot_function(&mut self, addr: usize, function: FunctionKey) {
        self.slot_functions.insert(addr, function);
    }

    pub fn slot_function(&self, addr: usize) -> Option<FunctionKey> {
        self.slot_functions.get(&addr).copied()
    }

    pub fn clear_slot_function(&mut self, addr: usize) {
        self.slot_functions.remove(&addr);
    }

    // ---- callback / generated function maps ------------------------------

    pub fn find_callback_function(&self, callback: &CallbackDesc) -> Option<FunctionKey> {
        self.callbacks.get(callback).copied()
    }

    pub fn register_callback(
        &mut self,
        callback: CallbackDesc,
        function: FunctionKey,
        signature: SignatureDesc,
    ) {
        self.callbacks.insert(callback, function);
        self.signatures.insert(function, Rc::new(signature));
        self.class_functions
            .entry(callback.class)
            .or_default()
            .push(function);
    }

    pub fn signature_of(&self, function: FunctionKey) -> Option<Rc<SignatureDesc>> {
        self.signatures.get(&function).cloned()
    }

    pub fn is_generated(&self, function: FunctionKey) -> bool {
        self.signatures.contains_key(&function)
    }

    /// Removes every trace of one generated function and hands its
    /// signature state back for the caller to unpin and unregister.
    pub fn remove_function(&mut self, function: FunctionKey) -> Option<Rc<SignatureDesc>> {
        let signature = self.signatures.remove(&function)?;
        self.callbacks.retain(|_, f| *f != function);
        self.slot_functions.retain(|_, f| *f != function);
        for functions in self.class_functions.values_mut() {
            functions.retain(|f| *f != function);
        }
        Some(signature)
    }

    /// Generated functions whose callbacks were bound on `object`.
    pub fn functions_of_object(&self, object: ObjectId) -> Vec<FunctionKey> {
        self.callbacks
            .iter()
            .filter(|(cb, _)| cb.object == object)
            .map(|(_, f)| *f)
            .collect()
    }

    pub fn functions_of_class(&self, class: TypeKey) -> Vec<FunctionKey> {
        self.class_functions.get(&class).cloned().unwrap_or_default()
    }

    pub fn all_generated(&self) -> Vec<FunctionKey> {
        self.signatures.keys().copied().collect()
    }

    /// Drains everything, returning the signature states for unpinning.
    pub fn clear(&mut self) -> Vec<Rc<SignatureDesc>> {
        self.slot_signatures.clear();
        self.slot_functions.clear();
        self.callbacks.clear();
        self.class_functions.clear();
        self.signatures.drain().map(|(_, s)| s).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(index: u32) -> ObjectId {
        ObjectId::new(index, 0)
    }

    #[test]
    fn slot_bind_unbind() {
        let mut slot = DelegateSlot::default();
        assert!(!slot.is_bound());
        slot.bind(object(1), FunctionKey::from_raw(2));
        assert_eq!(slot.binding(), Some((object(1), FunctionKey::from_raw(2))));
        slot.unbind();
        assert!(slot.binding().is_none());
    }

    #[test]
    fn multicast_dedupes() {
        let mut slot = MulticastSlot::default();
        slot.add(object(1), FunctionKey::from_raw(2));
        slot.add(object(1), FunctionKey::from_raw(2));
        slot.add(object(2), FunctionKey::from_raw(2));
        assert_eq!(slot.len(), 2);
        assert!(slot.remove(object(1), FunctionKey::from_raw(2)));
        assert!(!slot.remove(object(1), FunctionKey::from_raw(2)));
        slot.remove_object(object(2));
        assert!(slot.is_empty());
    }

    #[test]
    fn signature_call_and_binding_counts() {
        let sig = SignatureDesc::new(FunctionDescId::from_raw(1), ScriptRef::from_raw(3));
        assert_eq!(sig.num_bindings(), 1);
        assert_eq!(sig.add_binding(), 2);
        assert_eq!(sig.remove_binding(), 1);
        sig.begin_call();
        assert!(sig.in_call());
        sig.mark_pending_kill();
        sig.end_call();
        assert!(!sig.in_call());
        assert!(sig.is_pending_kill());
    }

    #[test]
    fn registry_cross_maps() {
        let mut reg = DelegateRegistry::new();
        let cb = CallbackDesc {
            class: TypeKey::from_raw(1),
            object: object(4),
            callback: 99,
        };
        let generated = FunctionKey::from_raw(50);
        reg.register_callback(
            cb,
            generated,
            SignatureDesc::new(FunctionDescId::from_raw(1), ScriptRef::from_raw(0)),
        );
        assert_eq!(reg.find_callback_function(&cb), Some(generated));
        assert_eq!(reg.functions_of_object(object(4)), vec![generated]);
        assert_eq!(reg.functions_of_class(TypeKey::from_raw(1)), vec![generated]);
        assert!(reg.remove_function(generated).is_some());
        assert!(reg.find_callback_function(&cb).is_none());
        assert!(reg.functions_of_object(object(4)).is_empty());
    }
}
