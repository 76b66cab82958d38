//! Bidirectional bridge between an embedded scripting runtime and a host
//! reflection system.
//!
//! The bridge keeps lazy descriptor caches over the host's reflected
//! classes, properties and functions, marshals calls in both directions
//! through reflection-laid-out parameter frames, injects script overrides
//! into the host's dispatch table, and bridges delegate fields to script
//! callbacks. [`context::BridgeContext`] owns every subsystem and is the
//! entry point.

pub mod class_desc;
pub mod containers;
pub mod context;
pub mod delegate;
pub mod error;
pub mod function;
pub mod host;
pub mod injection;
pub mod property;
pub mod referencer;
pub mod registry;
pub mod script;
pub mod userdata;

pub mod prelude {
    pub use crate::class_desc::{ClassDesc, DefaultValue, FieldDesc, ParamCollection};
    pub use crate::context::BridgeContext;
    pub use crate::delegate::{DelegateRegistry, DelegateSlot, MulticastSlot};
    pub use crate::error::{BridgeError, ConversionError, Result, ScriptError};
    pub use crate::function::FunctionDesc;
    pub use crate::host::dispatch::{DispatchTable, NativeFn, Thunk};
    pub use crate::host::memory::{ParamBuffer, ValuePtr};
    pub use crate::host::object::{HostHeap, ObjectId};
    pub use crate::host::reflection::{
        ClassBuilder, ClassKind, FuncFlags, FunctionBuilder, FunctionKey, HostReflection,
        NativeKind, PropFlags, TypeKey,
    };
    pub use crate::injection::{OverrideInjector, is_overridable, overridable_functions};
    pub use crate::property::{PropertyDesc, PropertyTag};
    pub use crate::registry::{ClassDescId, FunctionDescId, ReflectionRegistry};
    pub use crate::script::runtime::{ScriptFunction, ScriptRef, ScriptRuntime};
    pub use crate::script::value::ScriptValue;
    pub use crate::userdata::{OpaqueHandle, UserdataTag};
}
