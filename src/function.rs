//! Function descriptors and call marshaling, both directions.
//!
//! A descriptor caches the parameter layout of one reflected function and
//! drives every crossing: script→native (`call_native`), native→script
//! (`call_script`), and delegate firing (`execute_delegate` /
//! `broadcast_delegate`) which reuse the same pre-call/post-call pair.
//!
//! The parameter frame is a raw buffer laid out by reflection. When no
//! call through this descriptor is in flight and the signature has no
//! delegate-typed parameter, the frame is a persistent buffer reused
//! across calls; every other case allocates fresh.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use log::warn;

use crate::class_desc::ParamCollection;
use crate::context::BridgeContext;
use crate::delegate::{DelegateSlot, MulticastSlot};
use crate::error::{BridgeError, Result};
use crate::host::dispatch::Thunk;
use crate::host::memory::{ParamBuffer, ValuePtr};
use crate::host::object::ObjectId;
use crate::host::reflection::{
    ClassKind, FuncFlags, FunctionKey, HostReflection, LATENT_PARAM_NAME, NativeKind, TypeKey,
};
use crate::property::PropertyDesc;
use crate::registry::FunctionDescId;
use crate::script::runtime::{ScriptFunction, ScriptRef};
use crate::script::value::ScriptValue;

pub struct FunctionDesc {
    id: FunctionDescId,
    key: FunctionKey,
    name: String,
    owner: TypeKey,
    flags: FuncFlags,
    /// Parameter descriptors in declared order, return (if any) last.
    params: Vec<Rc<PropertyDesc>>,
    /// Non-const reference parameters, excluding the return value.
    out_indices: Vec<usize>,
    return_index: Option<usize>,
    latent_index: Option<usize>,
    num_ref_params: u8,
    parms_size: usize,
    parms_align: usize,
    is_static: bool,
    is_interface: bool,
    has_delegate_params: bool,
    default_params: Option<Rc<ParamCollection>>,
    script_ref: Cell<Option<ScriptRef>>,
    num_calls: Cell<u8>,
    persistent: RefCell<Option<ParamBuffer>>,
}

impl FunctionDesc {
    pub fn new(
        refl: &HostReflection,
        id: FunctionDescId,
        key: FunctionKey,
        default_params: Option<Rc<ParamCollection>>,
        script_ref: Option<ScriptRef>,
    ) -> Option<FunctionDesc> {
        let meta = refl.function(key)?;
        let is_interface = refl
            .class(meta.owner)
            .is_some_and(|c| c.kind == ClassKind::Interface);

        let params: Vec<Rc<PropertyDesc>> = meta
            .params
            .iter()
            .map(|f| Rc::new(PropertyDesc::new(refl, f)))
            .collect();
        let return_index = params.iter().position(|p| p.is_return_parameter());
        let latent_index = meta.params.iter().position(|f| f.name == LATENT_PARAM_NAME);
        let out_indices: Vec<usize> = params
            .iter()
            .enumerate()
            .filter(|(i, p)| {
                p.is_out_parameter() && !p.is_const_parameter() && Some(*i) != latent_index
            })
            .map(|(i, _)| i)
            .collect();
        let num_ref_params = params.iter().filter(|p| p.is_reference_parameter()).count() as u8;
        let has_delegate_params = params.iter().any(|p| {
            matches!(p.kind(), NativeKind::Delegate(_) | NativeKind::Multicast(_))
        });

        Some(FunctionDesc {
            id,
            key,
            name: meta.name.clone(),
            owner: meta.owner,
            flags: meta.flags,
            params,
            out_indices,
            return_index,
            latent_index,
            num_ref_params,
            parms_size: meta.parms_size,
            parms_align: meta.parms_align,
            is_static: meta.is_static(),
            is_interface,
            has_delegate_params,
            default_params,
            script_ref: Cell::new(script_ref),
            num_calls: Cell::new(0),
            persistent: RefCell::new(None),
        })
    }

    pub fn id(&self) -> FunctionDescId {
        self.id
    }

    pub fn key(&self) -> FunctionKey {
        self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> TypeKey {
        self.owner
    }

    pub fn is_valid(&self, refl: &HostReflection) -> bool {
        refl.function(self.key).is_some()
    }

    pub fn has_return(&self) -> bool {
        self.return_index.is_some()
    }

    pub fn is_latent(&self) -> bool {
        self.latent_index.is_some()
    }

    pub fn is_static(&self) -> bool {
        self.is_static
    }

    pub fn num_properties(&self) -> usize {
        self.params.len()
    }

    pub fn num_out_properties(&self) -> usize {
        self.out_indices.len() + usize::from(self.return_index.is_some())
    }

    pub fn num_ref_properties(&self) -> u8 {
        self.num_ref_params
    }

    pub fn script_ref(&self) -> Option<ScriptRef> {
        self.script_ref.get()
    }

    pub fn set_script_ref(&self, r: Option<ScriptRef>) {
        self.script_ref.set(r);
    }

    /// Position of parameter `i` among the script-visible arguments.
    fn script_position(&self, i: usize) -> usize {
        self.params[..i]
            .iter()
            .enumerate()
            .filter(|(j, p)| !p.is_return_parameter() && Some(*j) != self.latent_index)
            .count()
    }

    // ---- frame management ----------------------------------------------

    fn acquire_frame(&self) -> ParamBuffer {
        if !self.has_delegate_params {
            // Reentrant calls find the slot empty and allocate fresh.
            if let Some(buffer) = self.persistent.borrow_mut().take() {
                return buffer;
            }
        }
        ParamBuffer::zeroed(self.parms_size, self.parms_align)
    }

    fn release_frame(&self, buffer: ParamBuffer) {
        if !self.has_delegate_params && self.num_calls.get() == 0 {
            let mut slot = self.persistent.borrow_mut();
            if slot.is_none() {
                *slot = Some(buffer);
            }
        }
    }

    // ---- script → native ------------------------------------------------

    /// Calls the native function with arguments from the script stack.
    ///
    /// `num_args` values sit at absolute indices starting at `first_index`;
    /// the first is the target object unless the function is static.
    /// Returns the number of values pushed (out parameters in declared
    /// order, then the return value).
    pub fn call_native(
        &self,
        ctx: &mut BridgeContext,
        num_args: usize,
        first_index: usize,
    ) -> Result<usize> {
        if !self.is_valid(ctx.reflection()) {
            return Err(BridgeError::StaleDescriptor { what: "function" });
        }

        let (target, first_param, num_params) = if self.is_static {
            (ctx.default_object(self.owner)?, first_index, num_args)
        } else {
            let id = ctx
                .runtime()
                .stack
                .value(first_index as i32)
                .and_then(|v| v.as_userdata())
                .and_then(|u| u.object_id())
                .filter(|id| ctx.heap().is_valid(*id));
            let Some(id) = id else {
                warn!("null or dead target object calling '{}'", self.name);
                return Err(BridgeError::invalid_target(&self.name));
            };
            (id, first_index + 1, num_args.saturating_sub(1))
        };

        // Interface functions dispatch on the concrete class of the target.
        let mut key = self.key;
        if self.is_interface {
            if let Some(class) = ctx.heap().class_of(target) {
                if let Some(resolved) = ctx.reflection().find_function(class, &self.name) {
                    key = resolved;
                }
            }
        }

        // A script-overridden function called from script runs the
        // preserved original body, not the override.
        let thunk = ctx
            .dispatch()
            .original(key)
            .or_else(|| {
                ctx.registry().find_overridden(key).and_then(|orig| {
                    ctx.dispatch().original(orig).or_else(|| ctx.dispatch().thunk(orig))
                })
            })
            .or_else(|| ctx.dispatch().thunk(key));
        let Some(thunk) = thunk else {
            return Err(BridgeError::unknown_function(&self.name, ""));
        };

        let latent_token = if self.latent_index.is_some() {
            Some(ctx.begin_latent(&self.name)?)
        } else {
            None
        };

        let mut cleanup = vec![false; self.params.len()];
        let frame = self.pre_call(ctx, num_params, first_param, &mut cleanup, latent_token)?;

        let outcome = match thunk {
            Thunk::Native(body) => body.call(ctx, target, frame.ptr()),
            Thunk::Script(desc) => ctx.invoke_script_override(desc, target, frame.ptr()),
        };
        if let Err(e) = outcome {
            warn!("'{}' native body failed: {e}", self.name);
        }

        if latent_token.is_some() {
            ctx.suspend_current_coroutine();
        }

        self.post_call(ctx, num_params, first_param, frame, &cleanup)
    }

    /// Initializes the parameter frame and fills it from `num_args` script
    /// values starting at `first_index`. Missing arguments fall back to the
    /// registered default, then to the type's zero value. Mismatched
    /// arguments warn and leave the default in place.
    fn pre_call(
        &self,
        ctx: &mut BridgeContext,
        num_args: usize,
        first_index: usize,
        cleanup: &mut [bool],
        latent_token: Option<u64>,
    ) -> Result<ParamBuffer> {
        let frame = self.acquire_frame();
        self.num_calls.set(self.num_calls.get().saturating_add(1));
        let base = frame.ptr();

        let mut script_pos = 0usize;
        for (i, prop) in self.params.iter().enumerate() {
            prop.initialize(ctx.reflection(), base);
            cleanup[i] = !prop.is_trivially_destructible();

            if Some(i) == self.return_index {
                continue;
            }
            if Some(i) == self.latent_index {
                if let Some(token) = latent_token {
                    // LatentActionInfo's linkage field sits at offset 0.
                    base.offset(prop.offset()).write::<u64>(token);
                }
                continue;
            }

            let addr = base.offset(prop.offset());
            if script_pos < num_args {
                let value = ctx
                    .runtime()
                    .stack
                    .value((first_index + script_pos) as i32)
                    .cloned()
                    .unwrap_or(ScriptValue::Nil);
                match prop.check_value(&value) {
                    Ok(()) => {
                        if let Err(e) = prop.from_script(ctx, addr, &value) {
                            warn!("'{}' parameter #{}: {e}", self.name, script_pos + 1);
                        }
                    }
                    Err(e) => {
                        warn!("'{}' parameter #{}: {e}", self.name, script_pos + 1);
                    }
                }
            } else if let Some(defaults) = &self.default_params {
                if let Some(default) = defaults.get(prop.name()) {
                    let value = default.to_script_value();
                    if let Err(e) = prop.from_script(ctx, addr, &value) {
                        warn!("'{}' default for '{}': {e}", self.name, prop.name());
                    }
                }
            }
            script_pos += 1;
        }
        Ok(frame)
    }

    /// Pushes results back to script and destroys the frame: out parameters
    /// in declared order (copied back in place into addressable argument
    /// userdata where possible), then the return value.
    fn post_call(
        &self,
        ctx: &mut BridgeContext,
        num_args: usize,
        first_index: usize,
        frame: ParamBuffer,
        cleanup: &[bool],
    ) -> Result<usize> {
        let base = frame.ptr();
        let mut pushed = 0usize;

        for &i in &self.out_indices {
            let prop = Rc::clone(&self.params[i]);
            let addr = base.offset(prop.offset());
            let script_pos = self.script_position(i);
            let copied_back = if script_pos < num_args {
                let target = ctx
                    .runtime()
                    .stack
                    .value((first_index + script_pos) as i32)
                    .cloned();
                match target {
                    Some(v) => prop.copy_back(ctx, addr, &v),
                    None => false,
                }
            } else {
                false
            };
            if !copied_back {
                let value = prop.to_script(ctx, addr)?;
                ctx.runtime_mut().stack.push(value);
                pushed += 1;
            }
        }

        if let Some(r) = self.return_index {
            let prop = Rc::clone(&self.params[r]);
            let value = prop.to_script(ctx, base.offset(prop.offset()))?;
            ctx.runtime_mut().stack.push(value);
            pushed += 1;
        }

        for (i, prop) in self.params.iter().enumerate() {
            if cleanup[i] {
                prop.destroy(ctx.reflection(), base);
            }
        }

        self.num_calls.set(self.num_calls.get().saturating_sub(1));
        self.release_frame(frame);
        Ok(pushed)
    }

    // ---- native → script ------------------------------------------------

    /// Invokes the script function bound to this descriptor with the values
    /// in `frame`. Out parameters and the return value are read back from
    /// the script results (outs in declared order, return last). A script
    /// failure is reported and leaves the frame untouched; native state is
    /// never corrupted by a failed override.
    pub fn call_script(&self, ctx: &mut BridgeContext, target: ObjectId, frame: ValuePtr) -> bool {
        let Some(func) = self.resolve_script_function(ctx) else {
            warn!("no script function bound for '{}'", self.name);
            return false;
        };

        let handle = ctx.wrap_object(target);
        ctx.runtime_mut().stack.push(ScriptValue::Userdata(handle));
        let mut nargs = 1usize;
        for (i, prop) in self.params.iter().enumerate() {
            if Some(i) == self.return_index || Some(i) == self.latent_index {
                continue;
            }
            let prop = Rc::clone(prop);
            let value = match prop.to_script(ctx, frame.offset(prop.offset())) {
                Ok(v) => v,
                Err(e) => {
                    warn!("'{}' argument for script: {e}", self.name);
                    ScriptValue::Nil
                }
            };
            ctx.runtime_mut().stack.push(value);
            nargs += 1;
        }

        let base = ctx.runtime().stack.top() - nargs;
        match ctx.pcall(&func, nargs) {
            Ok(nresults) => {
                let mut consumed = 0usize;
                for &i in &self.out_indices {
                    if consumed >= nresults {
                        warn!(
                            "'{}' script override returned {} values, expected {}",
                            self.name,
                            nresults,
                            self.num_out_properties()
                        );
                        break;
                    }
                    let prop = Rc::clone(&self.params[i]);
                    let value = ctx
                        .runtime()
                        .stack
                        .value((base + 1 + consumed) as i32)
                        .cloned()
                        .unwrap_or(ScriptValue::Nil);
                    if let Err(e) = prop.from_script(ctx, frame.offset(prop.offset()), &value) {
                        warn!("'{}' out parameter from script: {e}", self.name);
                    }
                    consumed += 1;
                }
                if let Some(r) = self.return_index {
                    let prop = Rc::clone(&self.params[r]);
                    if consumed < nresults {
                        let value = ctx
                            .runtime()
                            .stack
                            .value((base + 1 + consumed) as i32)
                            .cloned()
                            .unwrap_or(ScriptValue::Nil);
                        if let Err(e) = prop.from_script(ctx, frame.offset(prop.offset()), &value)
                        {
                            warn!("'{}' return value from script: {e}", self.name);
                        }
                    } else {
                        warn!("'{}' script override returned no value", self.name);
                    }
                }
                ctx.runtime_mut().stack.pop(nresults);
                true
            }
            Err(e) => {
                warn!("script override of '{}' failed: {e}", self.name);
                false
            }
        }
    }

    fn resolve_script_function(&self, ctx: &BridgeContext) -> Option<ScriptFunction> {
        if let Some(r) = self.script_ref.get() {
            if let Some(ScriptValue::Function(f)) = ctx.runtime().pinned(r) {
                return Some(f);
            }
        }
        if let Some(ScriptValue::Function(f)) = ctx.runtime().global(&self.name) {
            return Some(f.clone());
        }
        if self.flags.contains(FuncFlags::NET) {
            let rpc_name = format!("{}_RPC", self.name);
            if let Some(ScriptValue::Function(f)) = ctx.runtime().global(&rpc_name) {
                return Some(f.clone());
            }
        }
        None
    }

    // ---- delegates -------------------------------------------------------

    /// Fires a single-binding delegate slot using this signature. Arguments
    /// start at `first_index` (no target argument; the binding carries it).
    pub fn execute_delegate(
        &self,
        ctx: &mut BridgeContext,
        num_args: usize,
        first_index: usize,
        slot: ValuePtr,
    ) -> Result<usize> {
        let binding = slot.read::<DelegateSlot>();
        let Some((object, function)) = binding.binding() else {
            return Err(BridgeError::UnboundDelegate);
        };
        if !ctx.heap().is_valid(object) {
            return Err(BridgeError::UnboundDelegate);
        }
        let mut cleanup = vec![false; self.params.len()];
        let frame = self.pre_call(ctx, num_args, first_index, &mut cleanup, None)?;
        if let Err(e) = ctx.invoke_function_key(function, object, frame.ptr()) {
            warn!("delegate '{}' invocation failed: {e}", self.name);
        }
        self.post_call(ctx, num_args, first_index, frame, &cleanup)
    }

    /// Fires every live binding of a multicast slot. Multicast signatures
    /// have no return value; nothing is pushed.
    pub fn broadcast_delegate(
        &self,
        ctx: &mut BridgeContext,
        num_args: usize,
        first_index: usize,
        slot: ValuePtr,
    ) -> Result<()> {
        let bindings = slot.as_ref::<MulticastSlot>().bindings().to_vec();
        let mut cleanup = vec![false; self.params.len()];
        let frame = self.pre_call(ctx, num_args, first_index, &mut cleanup, None)?;
        for binding in bindings {
            if !ctx.heap().is_valid(binding.object) {
                continue;
            }
            if let Err(e) = ctx.invoke_function_key(binding.function, binding.object, frame.ptr())
            {
                warn!("multicast '{}' binding failed: {e}", self.name);
            }
        }
        let pushed = self.post_call(ctx, num_args, first_index, frame, &cleanup)?;
        ctx.runtime_mut().stack.pop(pushed);
        Ok(())
    }
}
