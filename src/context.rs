//! The bridge context: one value owning every subsystem, with the
//! orchestration that ties them together.
//!
//! Descriptors are handed out as `Rc` clones so operations can re-enter
//! the context mutably while a call is in flight. Class descriptors are
//! lock-guarded around calls; a release requested mid-call parks until the
//! outermost unlock.

use std::rc::Rc;
use std::sync::Mutex;

use log::{error, warn};
use rustc_hash::FxHashMap;

use crate::class_desc::FieldDesc;
use crate::delegate::{CallbackDesc, DelegateRegistry, DelegateSlot, MulticastSlot, SignatureDesc};
use crate::error::{BridgeError, Result, ScriptError};
use crate::function::FunctionDesc;
use crate::host::dispatch::{DispatchTable, Thunk};
use crate::host::memory::ValuePtr;
use crate::host::object::{HostHeap, ObjectId};
use crate::host::reflection::{FunctionKey, HostReflection, NativeKind, TypeKey};
use crate::injection::OverrideInjector;
use crate::registry::{ClassDescId, FunctionDescId, ReflectionRegistry};
use crate::script::runtime::{ScriptFunction, ScriptRuntime};
use crate::script::coroutine::{ContinuationToken, CoroutineId, CoroutineStatus, ThreadId};
use crate::script::value::ScriptValue;
use crate::userdata::{ContainerUserdata, OpaqueHandle, UserdataCache};

pub struct BridgeContext {
    reflection: HostReflection,
    heap: HostHeap,
    dispatch: DispatchTable,
    registry: ReflectionRegistry,
    delegates: DelegateRegistry,
    overrides: OverrideInjector,
    userdata: UserdataCache,
    referencer: crate::referencer::ObjectReferencer,
    runtime: ScriptRuntime,
    /// Objects whose last script reference dropped; swept by
    /// `collect_garbage`. Host-side deletion callbacks may push from other
    /// threads, so this one crosses the lock.
    candidates: Mutex<Vec<ObjectId>>,
    default_objects: FxHashMap<TypeKey, ObjectId>,
    bound_classes: FxHashMap<String, ClassDescId>,
}

impl BridgeContext {
    pub fn new(reflection: HostReflection) -> BridgeContext {
        BridgeContext {
            reflection,
            heap: HostHeap::new(),
            dispatch: DispatchTable::new(),
            registry: ReflectionRegistry::new(),
            delegates: DelegateRegistry::new(),
            overrides: OverrideInjector::new(),
            userdata: UserdataCache::new(),
            referencer: crate::referencer::ObjectReferencer::new(),
            runtime: ScriptRuntime::new(),
            candidates: Mutex::new(Vec::new()),
            default_objects: FxHashMap::default(),
            bound_classes: FxHashMap::default(),
        }
    }

    // ---- subsystem access ------------------------------------------------

    pub fn reflection(&self) -> &HostReflection {
        &self.reflection
    }

    pub fn reflection_mut(&mut self) -> &mut HostReflection {
        &mut self.reflection
    }

    pub fn heap(&self) -> &HostHeap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut HostHeap {
        &mut self.heap
    }

    pub fn dispatch(&self) -> &DispatchTable {
        &self.dispatch
    }

    pub fn dispatch_mut(&mut self) -> &mut DispatchTable {
        &mut self.dispatch
    }

    pub fn registry(&self) -> &ReflectionRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ReflectionRegistry {
        &mut self.registry
    }

    pub fn delegates(&self) -> &DelegateRegistry {
        &self.delegates
    }

    pub fn delegates_mut(&mut self) -> &mut DelegateRegistry {
        &mut self.delegates
    }

    pub fn runtime(&self) -> &ScriptRuntime {
        &self.runtime
    }

    pub fn runtime_mut(&mut self) -> &mut ScriptRuntime {
        &mut self.runtime
    }

    pub fn referencer(&self) -> &crate::referencer::ObjectReferencer {
        &self.referencer
    }

    // ---- handles ---------------------------------------------------------

    /// Wraps a live object for script, sharing one nullable cell per object
    /// and counting the reference.
    pub fn wrap_object(&mut self, id: ObjectId) -> OpaqueHandle {
        self.referencer.add_ref(id);
        self.userdata.wrap_object(id)
    }

    /// Handle for the native container at `addr`, cached per address.
    pub fn wrap_container(
        &mut self,
        addr: ValuePtr,
        make: impl FnOnce(&HostReflection) -> ContainerUserdata,
    ) -> OpaqueHandle {
        if let Some(handle) = self.userdata.cached_container(addr) {
            return handle;
        }
        let handle = OpaqueHandle::container(Rc::new(make(&self.reflection)));
        self.userdata.cache_container(addr, handle.clone());
        handle
    }

    /// Script dropped its last use of `handle`. Objects become sweep
    /// candidates once unreferenced; struct copies run their destructors.
    pub fn release_handle(&mut self, handle: &OpaqueHandle) {
        if let Some(id) = handle.object_id() {
            if self.referencer.release(id) && self.registry.is_in_gc_set(id) {
                self.push_candidate(id);
            }
        } else if handle.as_struct().is_some() {
            self.release_struct(handle);
        }
    }

    /// Runs field destructors on a script-owned struct copy. Idempotent.
    pub fn release_struct(&mut self, handle: &OpaqueHandle) {
        if let Some(ud) = handle.as_struct() {
            if ud.mark_released() {
                let kind = NativeKind::Struct(ud.type_key());
                self.reflection.destroy_value(&kind, ud.ptr());
            }
        }
    }

    // ---- object lifecycle ------------------------------------------------

    /// Allocates an object of the named class, runs its field initializers
    /// and records it as script-created.
    pub fn spawn_object(&mut self, class_name: &str) -> Result<ObjectId> {
        let (key, size, align) = {
            let class = self
                .reflection
                .class_by_name(class_name)
                .ok_or_else(|| BridgeError::unknown_type(class_name))?;
            (class.key, class.size, class.align)
        };
        let id = self.heap.allocate(key, size, align.max(1));
        self.init_object_fields(id);
        self.registry.add_to_gc_set(id);
        if let Some(cid) = self.registry.register_class_by_key(&self.reflection, key) {
            self.registry.add_ref_chain(&self.reflection, cid);
        }
        Ok(id)
    }

    fn init_object_fields(&mut self, id: ObjectId) {
        let Some(base) = self.heap.resolve(id) else {
            return;
        };
        let mut current = self.heap.class_of(id);
        while let Some(key) = current {
            let Some(class) = self.reflection.class(key) else {
                break;
            };
            for field in &class.fields {
                self.reflection
                    .init_value(&field.kind, base.offset(field.offset));
            }
            current = class.super_key;
        }
    }

    /// Destroys an object: delegate callbacks torn down, script handles
    /// nulled, container views invalidated, field destructors run, then the
    /// class descriptor chain released.
    pub fn destroy_object(&mut self, id: ObjectId) -> bool {
        let Some(class_key) = self.heap.class_of(id) else {
            return false;
        };

        for function in self.delegates.functions_of_object(id) {
            self.teardown_generated_function(function);
        }
        self.registry.notify_object_deleted(id);
        self.userdata.on_object_destroyed(id);
        self.referencer.clear_object(id);

        let Some(body) = self.heap.free(id) else {
            return false;
        };
        let mut current = Some(class_key);
        while let Some(key) = current {
            let Some(class) = self.reflection.class(key) else {
                break;
            };
            for field in &class.fields {
                let addr = body.ptr().offset(field.offset);
                if matches!(
                    field.kind,
                    NativeKind::Array(_)
                        | NativeKind::Set(_)
                        | NativeKind::Map(_, _)
                        | NativeKind::Delegate(_)
                        | NativeKind::Multicast(_)
                ) {
                    self.userdata.invalidate_container(addr);
                    self.delegates.forget_slot(addr.addr());
                }
                self.reflection.destroy_value(&field.kind, addr);
            }
            current = class.super_key;
        }

        if let Some(cid) = self.registry.find_class_by_key(class_key) {
            for released in self.registry.sub_ref_chain(&self.reflection, cid) {
                self.try_release_class(released);
            }
        }
        true
    }

    /// The shared default instance of `class`, created on first use. Static
    /// calls dispatch against it.
    pub fn default_object(&mut self, class: TypeKey) -> Result<ObjectId> {
        if let Some(id) = self.default_objects.get(&class) {
            if self.heap.is_valid(*id) {
                return Ok(*id);
            }
        }
        let (size, align) = {
            let meta = self
                .reflection
                .class(class)
                .ok_or_else(|| BridgeError::unknown_type(format!("type#{}", class.raw())))?;
            (meta.size, meta.align)
        };
        let id = self.heap.allocate(class, size, align.max(1));
        self.init_object_fields(id);
        self.default_objects.insert(class, id);
        Ok(id)
    }

    /// One pass over deferred-release candidates: anything script-created,
    /// unreferenced and still alive is destroyed.
    pub fn collect_garbage(&mut self) -> usize {
        let drained: Vec<ObjectId> = match self.candidates.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        let mut destroyed = 0;
        for id in drained {
            if self.heap.is_valid(id)
                && !self.referencer.is_referenced(id)
                && self.registry.is_in_gc_set(id)
            {
                if self.destroy_object(id) {
                    destroyed += 1;
                }
            }
        }
        destroyed
    }

    pub fn push_candidate(&self, id: ObjectId) {
        if let Ok(mut guard) = self.candidates.lock() {
            guard.push(id);
        }
    }

    // ---- class binding ---------------------------------------------------

    /// Binds a class for script access under its own name, falling back to
    /// `<module>_<class>` when the global is already taken.
    pub fn bind_class(&mut self, class_name: &str, module: &str) -> Result<ClassDescId> {
        let id = self
            .registry
            .register_class(&self.reflection, class_name)
            .ok_or_else(|| BridgeError::unknown_type(class_name))?;
        if self.bound_classes.contains_key(class_name) {
            // A later module binding the same class is recorded under a
            // disambiguated global; the first binding stays primary.
            let shadow = format!("{module}_{class_name}");
            warn!("class '{class_name}' is already bound, recording module '{module}' as '{shadow}'");
            self.runtime
                .set_global(shadow, ScriptValue::str(class_name));
            return Ok(id);
        }
        self.registry.add_ref_chain(&self.reflection, id);

        let global_name = if self.runtime.global(class_name).is_some() {
            let shadow = format!("{module}_{class_name}");
            warn!("global '{class_name}' is taken, binding class as '{shadow}'");
            shadow
        } else {
            class_name.to_string()
        };
        self.runtime
            .set_global(global_name, ScriptValue::str(class_name));
        self.bound_classes.insert(class_name.to_string(), id);
        Ok(id)
    }

    pub fn unbind_class(&mut self, class_name: &str) -> bool {
        let Some(id) = self.bound_classes.remove(class_name) else {
            return false;
        };
        self.runtime.remove_global(class_name);
        for released in self.registry.sub_ref_chain(&self.reflection, id) {
            self.try_release_class(released);
        }
        true
    }

    fn try_release_class(&mut self, id: ClassDescId) {
        let Some(desc) = self.registry.class(id) else {
            return;
        };
        if desc.ref_count() > 0 {
            return;
        }
        if desc.is_locked() {
            // Parks the descriptor for release at the outermost unlock.
            self.registry.try_unregister_class(id);
            return;
        }
        let type_key = desc.type_key();
        // Dispatch entries go back to native before the descriptor dies.
        self.overrides.restore_class(
            &mut self.reflection,
            &mut self.dispatch,
            &mut self.registry,
            &mut self.runtime,
            type_key,
        );
        self.registry.try_unregister_class(id);
    }

    // ---- field access ----------------------------------------------------

    /// Resolves `name` on the object's class: a property reads out as a
    /// script value, a function reads out as a callable trampoline.
    pub fn object_get_field(&mut self, id: ObjectId, name: &str) -> Result<ScriptValue> {
        let field = self.resolve_field(id, name)?;
        if field.is_property() {
            let prop = self
                .registry
                .field_property(field)
                .ok_or(BridgeError::StaleDescriptor { what: "property" })?;
            let base = self
                .heap
                .resolve(id)
                .ok_or(BridgeError::StaleDescriptor { what: "object" })?;
            prop.get_value(self, base)
        } else {
            let desc_id = self
                .registry
                .class(field.outer)
                .and_then(|c| c.function(field.index))
                .ok_or(BridgeError::StaleDescriptor { what: "function" })?;
            let f = self.runtime.make_function(move |ctx| {
                let nargs = ctx.runtime().frame_arg_count();
                let first = ctx.runtime().frame_base() + 1;
                let desc = ctx
                    .registry()
                    .function(desc_id)
                    .ok_or_else(|| ScriptError::runtime("stale function descriptor"))?;
                desc.call_native(ctx, nargs, first)
                    .map_err(|e| ScriptError::runtime(e.to_string()))
            });
            Ok(ScriptValue::Function(f))
        }
    }

    pub fn object_set_field(
        &mut self,
        id: ObjectId,
        name: &str,
        value: &ScriptValue,
    ) -> Result<()> {
        let field = self.resolve_field(id, name)?;
        if !field.is_property() {
            return Err(BridgeError::failed(format!(
                "'{name}' is a function and cannot be assigned"
            )));
        }
        let prop = self
            .registry
            .field_property(field)
            .ok_or(BridgeError::StaleDescriptor { what: "property" })?;
        let base = self
            .heap
            .resolve(id)
            .ok_or(BridgeError::StaleDescriptor { what: "object" })?;
        prop.set_value(self, base, value)?;
        Ok(())
    }

    fn resolve_field(&mut self, id: ObjectId, name: &str) -> Result<FieldDesc> {
        let class_key = self
            .heap
            .class_of(id)
            .ok_or(BridgeError::StaleDescriptor { what: "object" })?;
        let cid = self
            .registry
            .register_class_by_key(&self.reflection, class_key)
            .ok_or_else(|| BridgeError::unknown_type(name))?;
        self.registry
            .register_field(&self.reflection, cid, name)
            .ok_or_else(|| {
                let owner = self
                    .registry
                    .class(cid)
                    .map(|c| c.name().to_string())
                    .unwrap_or_default();
                BridgeError::unknown_function(name, owner)
            })
    }

    // ---- calls -----------------------------------------------------------

    /// Calls through a function descriptor with the top `num_args` stack
    /// values as arguments. Arguments are removed; results remain on top.
    /// The owning class chain is locked for the duration so descriptor
    /// releases triggered mid-call park until we return.
    pub fn call_function(&mut self, desc_id: FunctionDescId, num_args: usize) -> Result<usize> {
        let desc = self
            .registry
            .function(desc_id)
            .ok_or(BridgeError::StaleDescriptor { what: "function" })?;
        let class_id = self.registry.find_class_by_key(desc.owner());
        if let Some(cid) = class_id {
            self.registry.lock_chain(&self.reflection, cid);
        }

        let top = self.runtime.stack.top();
        let first = top.saturating_sub(num_args) + 1;
        let result = desc.call_native(self, num_args, first);

        if let Some(cid) = class_id {
            for ready in self.registry.unlock_chain(&self.reflection, cid) {
                self.try_release_class(ready);
            }
        }

        let pushed = result?;
        self.runtime.stack.remove_span(first, num_args);
        Ok(pushed)
    }

    /// Protected call: pushes a frame, runs `f`, and normalizes the stack so
    /// exactly the results sit above the pre-call base. On failure the stack
    /// is restored to the base and the error propagates.
    pub fn pcall(&mut self, f: &ScriptFunction, nargs: usize) -> Result<usize> {
        let base = self.runtime.push_frame(nargs);
        let outcome = f.call(self);
        self.runtime.pop_frame();
        match outcome {
            Ok(nresults) => {
                let top = self.runtime.stack.top();
                let results_start = top.saturating_sub(nresults);
                if results_start > base {
                    self.runtime.stack.remove_span(base + 1, results_start - base);
                }
                Ok(nresults)
            }
            Err(e) => {
                self.runtime.stack.truncate(base);
                warn!("script call failed: {e}");
                Err(e.into())
            }
        }
    }

    /// Dispatches `key` against `target` with a prepared parameter frame.
    /// Generated delegate callbacks get their signature call counting and
    /// deferred teardown here.
    pub fn invoke_function_key(
        &mut self,
        key: FunctionKey,
        target: ObjectId,
        frame: ValuePtr,
    ) -> Result<()> {
        let thunk = self
            .dispatch
            .thunk(key)
            .ok_or_else(|| BridgeError::unknown_function(format!("function#{}", key.raw()), ""))?;
        match thunk {
            Thunk::Native(body) => body.call(self, target, frame),
            Thunk::Script(desc_id) => {
                let desc = self
                    .registry
                    .function(desc_id)
                    .ok_or(BridgeError::StaleDescriptor { what: "function" })?;
                let signature = self.delegates.signature_of(key);
                if let Some(sig) = &signature {
                    sig.begin_call();
                }
                let ok = desc.call_script(self, target, frame);
                if let Some(sig) = signature {
                    sig.end_call();
                    if sig.is_pending_kill() && !sig.in_call() && sig.num_bindings() == 0 {
                        self.teardown_generated_function(key);
                    }
                }
                if ok {
                    Ok(())
                } else {
                    Err(BridgeError::failed("script callback failed"))
                }
            }
        }
    }

    /// Runs the script override pinned by `desc_id` against `target`.
    pub fn invoke_script_override(
        &mut self,
        desc_id: FunctionDescId,
        target: ObjectId,
        frame: ValuePtr,
    ) -> Result<()> {
        let desc = self
            .registry
            .function(desc_id)
            .ok_or(BridgeError::StaleDescriptor { what: "function" })?;
        if desc.call_script(self, target, frame) {
            Ok(())
        } else {
            Err(BridgeError::failed("script override failed"))
        }
    }

    // ---- overrides -------------------------------------------------------

    pub fn override_function(
        &mut self,
        class: TypeKey,
        name: &str,
        callback: ScriptFunction,
    ) -> Result<FunctionKey> {
        self.overrides.override_function(
            &mut self.reflection,
            &mut self.dispatch,
            &mut self.registry,
            &mut self.runtime,
            class,
            name,
            callback,
        )
    }

    pub fn restore_override(&mut self, key: FunctionKey) -> bool {
        self.overrides.restore_function(
            &mut self.reflection,
            &mut self.dispatch,
            &mut self.registry,
            &mut self.runtime,
            key,
        )
    }

    pub fn restore_class_overrides(&mut self, class: TypeKey) -> usize {
        self.overrides.restore_class(
            &mut self.reflection,
            &mut self.dispatch,
            &mut self.registry,
            &mut self.runtime,
            class,
        )
    }

    pub fn overrides(&self) -> &OverrideInjector {
        &self.overrides
    }

    // ---- delegates -------------------------------------------------------

    fn resolve_delegate(&self, handle: &OpaqueHandle) -> Result<(ValuePtr, FunctionKey)> {
        let container = handle
            .as_container()
            .ok_or_else(|| BridgeError::failed("not a delegate handle"))?;
        let addr = container
            .resolve()
            .ok_or(BridgeError::StaleDescriptor { what: "container" })?;
        let signature = self
            .delegates
            .slot_signature(addr.addr())
            .ok_or(BridgeError::UnboundDelegate)?;
        Ok((addr, signature))
    }

    fn signature_desc(&mut self, signature: FunctionKey) -> Result<Rc<FunctionDesc>> {
        let id = self
            .registry
            .register_function(&self.reflection, signature, None)
            .ok_or(BridgeError::StaleDescriptor { what: "function" })?;
        self.registry
            .function(id)
            .ok_or(BridgeError::StaleDescriptor { what: "function" })
    }

    /// Points a single-binding delegate slot at a script callback. The
    /// callback is materialized as a generated function on the target's
    /// class, one per distinct (class, object, callback).
    pub fn bind_delegate(
        &mut self,
        handle: &OpaqueHandle,
        target: ObjectId,
        callback: ScriptFunction,
    ) -> Result<()> {
        let (addr, signature) = self.resolve_delegate(handle)?;
        let function = self.ensure_callback_function(target, signature, callback)?;
        let slot = addr.as_mut::<DelegateSlot>();
        if let Some((_, previous)) = slot.binding() {
            if previous != function {
                self.release_callback_function(previous);
            }
        }
        slot.bind(target, function);
        self.delegates.set_slot_function(addr.addr(), function);
        Ok(())
    }

    /// Drops one binding. Binding the same callback N times takes N
    /// unbinds before the generated function is torn down; the slot
    /// itself is cleared by the first.
    pub fn unbind_delegate(&mut self, handle: &OpaqueHandle) -> Result<()> {
        let (addr, _) = self.resolve_delegate(handle)?;
        let slot = addr.as_mut::<DelegateSlot>();
        let function = match slot.binding() {
            Some((_, function)) => {
                slot.unbind();
                Some(function)
            }
            // Already-cleared slot: earlier binds of the same callback
            // may still hold the generated function.
            None => self.delegates.slot_function(addr.addr()),
        };
        if let Some(function) = function {
            self.release_callback_function(function);
            if !self.delegates.is_generated(function) {
                self.delegates.clear_slot_function(addr.addr());
            }
        }
        Ok(())
    }

    /// Fires a single-binding delegate with the top `num_args` stack values.
    /// Arguments are removed; out values and the return land on top.
    pub fn execute_delegate(&mut self, handle: &OpaqueHandle, num_args: usize) -> Result<usize> {
        let (addr, signature) = self.resolve_delegate(handle)?;
        let desc = self.signature_desc(signature)?;
        let top = self.runtime.stack.top();
        let first = top.saturating_sub(num_args) + 1;
        let pushed = desc.execute_delegate(self, num_args, first, addr)?;
        self.runtime.stack.remove_span(first, num_args);
        Ok(pushed)
    }

    pub fn add_multicast(
        &mut self,
        handle: &OpaqueHandle,
        target: ObjectId,
        callback: ScriptFunction,
    ) -> Result<()> {
        let (addr, signature) = self.resolve_delegate(handle)?;
        let function = self.ensure_callback_function(target, signature, callback)?;
        addr.as_mut::<MulticastSlot>().add(target, function);
        Ok(())
    }

    pub fn remove_multicast(
        &mut self,
        handle: &OpaqueHandle,
        target: ObjectId,
        callback: &ScriptFunction,
    ) -> Result<()> {
        let (addr, _) = self.resolve_delegate(handle)?;
        let class = self
            .heap
            .class_of(target)
            .ok_or(BridgeError::StaleDescriptor { what: "object" })?;
        let cb = CallbackDesc {
            class,
            object: target,
            callback: callback.id(),
        };
        let Some(function) = self.delegates.find_callback_function(&cb) else {
            return Ok(());
        };
        if addr.as_mut::<MulticastSlot>().remove(target, function) {
            self.release_callback_function(function);
        }
        Ok(())
    }

    pub fn clear_multicast(&mut self, handle: &OpaqueHandle) -> Result<()> {
        let (addr, _) = self.resolve_delegate(handle)?;
        let slot = addr.as_mut::<MulticastSlot>();
        let bindings: Vec<FunctionKey> = slot.bindings().iter().map(|b| b.function).collect();
        slot.clear();
        for function in bindings {
            if self.delegates.is_generated(function) {
                self.release_callback_function(function);
            }
        }
        Ok(())
    }

    /// Fires every live binding of a multicast delegate. No results.
    pub fn broadcast(&mut self, handle: &OpaqueHandle, num_args: usize) -> Result<()> {
        let (addr, signature) = self.resolve_delegate(handle)?;
        let desc = self.signature_desc(signature)?;
        let top = self.runtime.stack.top();
        let first = top.saturating_sub(num_args) + 1;
        desc.broadcast_delegate(self, num_args, first, addr)?;
        self.runtime.stack.remove_span(first, num_args);
        Ok(())
    }

    /// Generated function backing `callback` on `target`, created on first
    /// bind and refcounted per binding afterwards.
    fn ensure_callback_function(
        &mut self,
        target: ObjectId,
        signature: FunctionKey,
        callback: ScriptFunction,
    ) -> Result<FunctionKey> {
        let class = self
            .heap
            .class_of(target)
            .ok_or(BridgeError::StaleDescriptor { what: "object" })?;
        let cb = CallbackDesc {
            class,
            object: target,
            callback: callback.id(),
        };
        if let Some(existing) = self.delegates.find_callback_function(&cb) {
            if let Some(sig) = self.delegates.signature_of(existing) {
                sig.add_binding();
            }
            return Ok(existing);
        }

        let name = {
            let sig_meta = self
                .reflection
                .function(signature)
                .ok_or(BridgeError::StaleDescriptor { what: "function" })?;
            format!("{}_Callback_{:x}", sig_meta.name, callback.id())
        };
        let generated = self
            .reflection
            .duplicate_function(signature, class, name)
            .ok_or(BridgeError::StaleDescriptor { what: "function" })?;
        let script_ref = self.runtime.pin(ScriptValue::Function(callback));
        let Some(desc_id) =
            self.registry
                .register_function(&self.reflection, generated, Some(script_ref))
        else {
            self.runtime.unpin(script_ref);
            self.reflection.remove_function(generated);
            return Err(BridgeError::StaleDescriptor { what: "function" });
        };
        self.dispatch.redirect_to_script(generated, desc_id);
        self.delegates
            .register_callback(cb, generated, SignatureDesc::new(desc_id, script_ref));
        Ok(generated)
    }

    /// Drops one binding of a generated callback function; the last binding
    /// tears it down, deferred while a call through it is in flight.
    fn release_callback_function(&mut self, function: FunctionKey) {
        let Some(sig) = self.delegates.signature_of(function) else {
            return;
        };
        if sig.remove_binding() > 0 {
            return;
        }
        if sig.in_call() {
            sig.mark_pending_kill();
        } else {
            self.teardown_generated_function(function);
        }
    }

    fn teardown_generated_function(&mut self, function: FunctionKey) {
        let Some(sig) = self.delegates.remove_function(function) else {
            return;
        };
        if let Some(desc) = self.registry.unregister_function(function) {
            if let Some(r) = desc.script_ref() {
                self.runtime.unpin(r);
            }
        } else {
            self.runtime.unpin(sig.callback_ref());
        }
        self.dispatch.remove(function);
        self.reflection.remove_function(function);
    }

    // ---- latent calls and coroutines -------------------------------------

    /// Issues a continuation token for a latent call. Latent functions are
    /// only legal inside a coroutine.
    pub fn begin_latent(&mut self, function: &str) -> Result<u64> {
        match self.runtime.current_thread() {
            ThreadId::Coroutine(id) => Ok(self.runtime.coroutines.issue_token(id).raw()),
            ThreadId::Primary => {
                error!("latent function '{function}' called outside a coroutine");
                Err(BridgeError::latent_on_primary_thread(function))
            }
        }
    }

    pub fn suspend_current_coroutine(&mut self) {
        if let ThreadId::Coroutine(id) = self.runtime.current_thread() {
            self.runtime.coroutines.suspend(id);
        }
    }

    /// Runs `body` on a fresh coroutine. `resume` fires when a latent call
    /// issued from the body completes.
    pub fn run_coroutine(
        &mut self,
        body: ScriptFunction,
        resume: Option<ScriptFunction>,
        nargs: usize,
    ) -> Result<CoroutineId> {
        let id = self.runtime.coroutines.spawn(resume);
        let previous = self.runtime.set_current_thread(ThreadId::Coroutine(id));
        let outcome = self.pcall(&body, nargs);
        self.runtime.set_current_thread(previous);
        match outcome {
            Ok(nresults) => self.runtime.stack.pop(nresults),
            Err(e) => warn!("coroutine body failed: {e}"),
        }
        if self.runtime.coroutines.status(id) == CoroutineStatus::Running {
            self.runtime.coroutines.finish(id);
        }
        Ok(id)
    }

    /// Host signals a latent call finished. Consumes the token and resumes
    /// the suspended coroutine's hook.
    pub fn complete_latent(&mut self, token: u64) -> Result<()> {
        let token = ContinuationToken::from_raw(token);
        let Some(id) = self.runtime.coroutines.take_pending(token) else {
            return Err(BridgeError::failed("unknown continuation token"));
        };
        let Some(hook) = self.runtime.coroutines.resume_hook(id) else {
            self.runtime.coroutines.finish(id);
            return Ok(());
        };
        let previous = self.runtime.set_current_thread(ThreadId::Coroutine(id));
        let outcome = self.pcall(&hook, 0);
        self.runtime.set_current_thread(previous);
        match outcome {
            Ok(nresults) => self.runtime.stack.pop(nresults),
            Err(e) => warn!("latent resume failed: {e}"),
        }
        if self.runtime.coroutines.status(id) == CoroutineStatus::Running {
            self.runtime.coroutines.finish(id);
        }
        Ok(())
    }

    // ---- teardown --------------------------------------------------------

    /// Tears the whole bridge down in dependency order: delegate callbacks,
    /// overrides, function descriptors, then the script-side caches.
    pub fn shutdown(&mut self) {
        for function in self.delegates.all_generated() {
            self.teardown_generated_function(function);
        }
        self.delegates.clear();
        self.overrides.restore_all(
            &mut self.reflection,
            &mut self.dispatch,
            &mut self.registry,
            &mut self.runtime,
        );
        for key in self.registry.all_function_keys() {
            if let Some(desc) = self.registry.unregister_function(key) {
                if let Some(r) = desc.script_ref() {
                    self.runtime.unpin(r);
                }
            }
        }
        self.registry.clear();
        self.bound_classes.clear();
        self.default_objects.clear();
        self.userdata.clear();
        self.runtime.reset();
        if let Ok(mut guard) = self.candidates.lock() {
            guard.clear();
        }
    }
}
