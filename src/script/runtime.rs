//! The embedded interpreter state, at the surface the bridge touches: a
//! value stack, globals, a pin registry that keeps values alive across
//! native frames, and coroutine bookkeeping.
//!
//! Script functions are modeled as fallible native closures so tests drive
//! the bridge exactly the way interpreter-compiled functions would: they
//! read arguments from the stack, push results, and return how many.

use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::error::ScriptError;
use crate::script::coroutine::CoroutineTable;
use crate::script::coroutine::ThreadId;
use crate::script::stack::ScriptStack;
use crate::script::value::ScriptValue;

/// A callable script function.
///
/// Identity is the `id`: two clones of the same function compare equal,
/// two separately created functions never do. Callback deduplication in the
/// delegate bridge depends on this.
#[derive(Clone)]
pub struct ScriptFunction {
    id: u64,
    body: Rc<dyn Fn(&mut crate::context::BridgeContext) -> Result<usize, ScriptError>>,
}

impl ScriptFunction {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn call(
        &self,
        ctx: &mut crate::context::BridgeContext,
    ) -> Result<usize, ScriptError> {
        (self.body)(ctx)
    }
}

impl PartialEq for ScriptFunction {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl std::fmt::Debug for ScriptFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ScriptFunction#{}", self.id)
    }
}

/// Pin-registry slot handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ScriptRef(u32);

impl ScriptRef {
    pub fn from_raw(v: u32) -> ScriptRef {
        ScriptRef(v)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

#[derive(Default)]
pub struct ScriptRuntime {
    pub stack: ScriptStack,
    pub coroutines: CoroutineTable,
    current: ThreadId,
    registry: Vec<Option<ScriptValue>>,
    registry_free: Vec<u32>,
    globals: FxHashMap<String, ScriptValue>,
    frame_bases: Vec<usize>,
    next_function_id: u64,
}

impl ScriptRuntime {
    pub fn new() -> ScriptRuntime {
        ScriptRuntime::default()
    }

    pub fn make_function<F>(&mut self, body: F) -> ScriptFunction
    where
        F: Fn(&mut crate::context::BridgeContext) -> Result<usize, ScriptError> + 'static,
    {
        let id = self.next_function_id;
        self.next_function_id += 1;
        ScriptFunction {
            id,
            body: Rc::new(body),
        }
    }

    // ---- pin registry ---------------------------------------------------

    /// Pins a value so it survives independent of the stack.
    pub fn pin(&mut self, value: ScriptValue) -> ScriptRef {
        if let Some(slot) = self.registry_free.pop() {
            self.registry[slot as usize] = Some(value);
            ScriptRef(slot)
        } else {
            self.registry.push(Some(value));
            ScriptRef(self.registry.len() as u32 - 1)
        }
    }

    pub fn pinned(&self, r: ScriptRef) -> Option<ScriptValue> {
        self.registry.get(r.0 as usize)?.clone()
    }

    pub fn unpin(&mut self, r: ScriptRef) {
        if let Some(slot) = self.registry.get_mut(r.0 as usize) {
            if slot.take().is_some() {
                self.registry_free.push(r.0);
            }
        }
    }

    pub fn pinned_count(&self) -> usize {
        self.registry.iter().filter(|s| s.is_some()).count()
    }

    // ---- globals --------------------------------------------------------

    pub fn set_global(&mut self, name: impl Into<String>, value: ScriptValue) {
        self.globals.insert(name.into(), value);
    }

    pub fn global(&self, name: &str) -> Option<&ScriptValue> {
        self.globals.get(name)
    }

    pub fn remove_global(&mut self, name: &str) -> Option<ScriptValue> {
        self.globals.remove(name)
    }

    // ---- call frames ----------------------------------------------------
    //
    // The protected-call wrapper on the context records the frame base here
    // so callee code can address its arguments relative to it.

    pub fn push_frame(&mut self, nargs: usize) -> usize {
        let base = self.stack.top() - nargs.min(self.stack.top());
        self.frame_bases.push(base);
        base
    }

    pub fn pop_frame(&mut self) {
        self.frame_bases.pop();
    }

    pub fn frame_base(&self) -> usize {
        self.frame_bases.last().copied().unwrap_or(0)
    }

    /// Argument `i` (1-based) of the current frame.
    pub fn frame_arg(&self, i: usize) -> Option<&ScriptValue> {
        self.stack.value((self.frame_base() + i) as i32)
    }

    pub fn frame_arg_count(&self) -> usize {
        self.stack.top().saturating_sub(self.frame_base())
    }

    // ---- threads --------------------------------------------------------

    pub fn current_thread(&self) -> ThreadId {
        self.current
    }

    pub fn set_current_thread(&mut self, thread: ThreadId) -> ThreadId {
        std::mem::replace(&mut self.current, thread)
    }

    pub fn reset(&mut self) {
        self.stack.truncate(0);
        self.registry.clear();
        self.registry_free.clear();
        self.globals.clear();
        self.frame_bases.clear();
        self.coroutines.clear();
        self.current = ThreadId::Primary;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_registry_reuses_slots() {
        let mut rt = ScriptRuntime::new();
        let a = rt.pin(ScriptValue::Int(1));
        let b = rt.pin(ScriptValue::Int(2));
        assert_eq!(rt.pinned(a), Some(ScriptValue::Int(1)));
        rt.unpin(a);
        assert_eq!(rt.pinned(a), None);
        let c = rt.pin(ScriptValue::Int(3));
        assert_eq!(c.raw(), a.raw());
        assert_eq!(rt.pinned(b), Some(ScriptValue::Int(2)));
        assert_eq!(rt.pinned_count(), 2);
    }

    #[test]
    fn double_unpin_is_harmless() {
        let mut rt = ScriptRuntime::new();
        let a = rt.pin(ScriptValue::Bool(true));
        rt.unpin(a);
        rt.unpin(a);
        assert_eq!(rt.registry_free.len(), 1);
    }

    #[test]
    fn function_identity_is_per_creation() {
        let mut rt = ScriptRuntime::new();
        let f = rt.make_function(|_| Ok(0));
        let g = rt.make_function(|_| Ok(0));
        assert_eq!(f, f.clone());
        assert_ne!(f, g);
    }

    #[test]
    fn frame_args_address_relative_to_base() {
        let mut rt = ScriptRuntime::new();
        rt.stack.push(ScriptValue::Int(99)); // unrelated
        rt.stack.push(ScriptValue::Int(1));
        rt.stack.push(ScriptValue::Int(2));
        rt.push_frame(2);
        assert_eq!(rt.frame_arg_count(), 2);
        assert_eq!(rt.frame_arg(1), Some(&ScriptValue::Int(1)));
        assert_eq!(rt.frame_arg(2), Some(&ScriptValue::Int(2)));
        rt.pop_frame();
    }
}
