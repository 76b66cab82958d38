//! Script-override injection.
//!
//! Overriding points a host function's dispatch entry at a script
//! trampoline. A function declared on the bound class is redirected in
//! place with its native thunk saved; an inherited function first gets a
//! same-signature duplicate grafted onto the subclass so the superclass
//! keeps its behavior, and the duplicate is linked back to the original
//! through the registry's overridden map.

use log::warn;
use rustc_hash::FxHashMap;

use crate::error::{BridgeError, Result};
use crate::host::dispatch::DispatchTable;
use crate::host::reflection::{FuncFlags, FunctionKey, HostReflection, PropFlags, TypeKey};
use crate::registry::{FunctionDescId, ReflectionRegistry};
use crate::script::runtime::{ScriptFunction, ScriptRuntime};
use crate::script::value::ScriptValue;

/// Prefix of replication-notify callback functions.
const REP_NOTIFY_PREFIX: &str = "OnRep_";

/// Whether a host function accepts a script override: events, and
/// replication-notify callbacks matched to a `REP_NOTIFY` field.
pub fn is_overridable(refl: &HostReflection, key: FunctionKey) -> bool {
    let Some(func) = refl.function(key) else {
        return false;
    };
    let mask = FuncFlags::NATIVE | FuncFlags::EVENT | FuncFlags::NET;
    if func.flags & mask == FuncFlags::NATIVE | FuncFlags::EVENT {
        return true;
    }
    is_rep_notify_target(refl, func.owner, &func.name)
}

fn is_rep_notify_target(refl: &HostReflection, owner: TypeKey, name: &str) -> bool {
    let Some(field_name) = name.strip_prefix(REP_NOTIFY_PREFIX) else {
        return false;
    };
    let mut current = Some(owner);
    while let Some(key) = current {
        let Some(class) = refl.class(key) else {
            return false;
        };
        if class
            .fields
            .iter()
            .any(|f| f.flags.contains(PropFlags::REP_NOTIFY) && f.name == field_name)
        {
            return true;
        }
        current = class.super_key;
    }
    false
}

/// Every overridable function visible on `class`, most-derived declaration
/// winning for shadowed names.
pub fn overridable_functions(refl: &HostReflection, class: TypeKey) -> Vec<FunctionKey> {
    let mut seen: Vec<&str> = Vec::new();
    let mut result = Vec::new();
    let mut current = Some(class);
    while let Some(key) = current {
        let Some(c) = refl.class(key) else {
            break;
        };
        for fk in &c.functions {
            let Some(func) = refl.function(*fk) else {
                continue;
            };
            if seen.iter().any(|n| *n == func.name) {
                continue;
            }
            seen.push(&func.name);
            if is_overridable(refl, *fk) {
                result.push(*fk);
            }
        }
        current = c.super_key;
    }
    result
}

/// One live override: the dispatch key that was redirected, its function
/// descriptor, and whether the key is a duplicate grafted for an inherited
/// function (and must be deleted, not restored, on teardown).
#[derive(Clone, Copy, Debug)]
pub struct OverrideRecord {
    pub function: FunctionKey,
    pub desc: FunctionDescId,
    pub duplicated: bool,
}

#[derive(Default)]
pub struct OverrideInjector {
    records: FxHashMap<FunctionKey, OverrideRecord>,
    by_class: FxHashMap<TypeKey, Vec<FunctionKey>>,
}

impl OverrideInjector {
    pub fn new() -> OverrideInjector {
        OverrideInjector::default()
    }

    pub fn is_overridden(&self, key: FunctionKey) -> bool {
        self.records.contains_key(&key)
    }

    pub fn record(&self, key: FunctionKey) -> Option<OverrideRecord> {
        self.records.get(&key).copied()
    }

    pub fn overrides_of(&self, class: TypeKey) -> Vec<FunctionKey> {
        self.by_class.get(&class).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Installs `callback` as the override of `name` on `class`.
    ///
    /// Overriding the same function twice updates the bound callback in
    /// place; no second duplicate is created for inherited functions since
    /// the first graft shadows the inherited name.
    pub fn override_function(
        &mut self,
        refl: &mut HostReflection,
        dispatch: &mut DispatchTable,
        registry: &mut ReflectionRegistry,
        runtime: &mut ScriptRuntime,
        class: TypeKey,
        name: &str,
        callback: ScriptFunction,
    ) -> Result<FunctionKey> {
        let found = refl
            .find_function(class, name)
            .ok_or_else(|| BridgeError::unknown_function(name, ""))?;
        if !is_overridable(refl, found) {
            return Err(BridgeError::not_overridable(name));
        }
        let owner = match refl.function(found) {
            Some(f) => f.owner,
            None => return Err(BridgeError::unknown_function(name, "")),
        };

        let key = if owner == class {
            found
        } else {
            let dup = refl
                .duplicate_function(found, class, name)
                .ok_or_else(|| BridgeError::unknown_function(name, ""))?;
            registry.add_overridden(dup, found);
            dup
        };

        // Re-binding drops the previously pinned callback.
        if let Some(existing) = registry.find_function_desc(key).and_then(|id| registry.function(id))
        {
            if let Some(old) = existing.script_ref() {
                runtime.unpin(old);
            }
        }
        let script_ref = runtime.pin(ScriptValue::Function(callback));
        let Some(desc) = registry.register_function(refl, key, Some(script_ref)) else {
            runtime.unpin(script_ref);
            return Err(BridgeError::unknown_function(name, ""));
        };
        dispatch.redirect_to_script(key, desc);

        let fresh = !self.records.contains_key(&key);
        self.records.insert(
            key,
            OverrideRecord {
                function: key,
                desc,
                duplicated: owner != class,
            },
        );
        if fresh {
            self.by_class.entry(class).or_default().push(key);
        }
        Ok(key)
    }

    /// Removes one override: restores the saved dispatch entry (or deletes
    /// the grafted duplicate), unpins the callback and drops the function
    /// descriptor.
    pub fn restore_function(
        &mut self,
        refl: &mut HostReflection,
        dispatch: &mut DispatchTable,
        registry: &mut ReflectionRegistry,
        runtime: &mut ScriptRuntime,
        key: FunctionKey,
    ) -> bool {
        let Some(record) = self.records.remove(&key) else {
            return false;
        };
        for functions in self.by_class.values_mut() {
            functions.retain(|k| *k != key);
        }

        if let Some(desc) = registry.unregister_function(key) {
            if let Some(r) = desc.script_ref() {
                runtime.unpin(r);
            }
        }

        if record.duplicated {
            registry.remove_overridden(key);
            dispatch.remove(key);
            if !refl.remove_function(key) {
                warn!("duplicated override function was already gone");
            }
        } else {
            dispatch.restore(key);
        }
        true
    }

    /// Restores every override installed on `class`. Dispatch entries go
    /// back before any descriptor release so no window dispatches into a
    /// dead trampoline.
    pub fn restore_class(
        &mut self,
        refl: &mut HostReflection,
        dispatch: &mut DispatchTable,
        registry: &mut ReflectionRegistry,
        runtime: &mut ScriptRuntime,
        class: TypeKey,
    ) -> usize {
        let keys = self.by_class.remove(&class).unwrap_or_default();
        let mut restored = 0;
        for key in keys {
            if self.restore_function(refl, dispatch, registry, runtime, key) {
                restored += 1;
            }
        }
        restored
    }

    pub fn restore_all(
        &mut self,
        refl: &mut HostReflection,
        dispatch: &mut DispatchTable,
        registry: &mut ReflectionRegistry,
        runtime: &mut ScriptRuntime,
    ) {
        let classes: Vec<TypeKey> = self.by_class.keys().copied().collect();
        for class in classes {
            self.restore_class(refl, dispatch, registry, runtime, class);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::dispatch::NativeFn;
    use crate::host::reflection::{ClassBuilder, FunctionBuilder, NativeKind};

    struct Fixture {
        refl: HostReflection,
        dispatch: DispatchTable,
        registry: ReflectionRegistry,
        runtime: ScriptRuntime,
        actor: TypeKey,
        pawn: TypeKey,
    }

    fn fixture() -> Fixture {
        let mut refl = HostReflection::new();
        let actor = refl.register_class(
            ClassBuilder::class("Actor")
                .field_with_flags("Health", NativeKind::Float, PropFlags::REP_NOTIFY)
                .function(
                    FunctionBuilder::new("ReceiveBeginPlay")
                        .flags(FuncFlags::NATIVE | FuncFlags::EVENT),
                )
                .function(
                    FunctionBuilder::new("OnRep_Health").flags(FuncFlags::NATIVE),
                )
                .function(
                    FunctionBuilder::new("ServerMove")
                        .flags(FuncFlags::NATIVE | FuncFlags::EVENT | FuncFlags::NET),
                )
                .function(FunctionBuilder::new("GetName").returns(NativeKind::Str)),
        );
        let pawn = refl.register_class(ClassBuilder::class("Pawn").extends("Actor"));
        let mut dispatch = DispatchTable::new();
        for class in [actor, pawn] {
            for key in refl.class(class).unwrap().functions.clone() {
                dispatch.register_native(key, NativeFn::new(|_, _, _| Ok(())));
            }
        }
        Fixture {
            refl,
            dispatch,
            registry: ReflectionRegistry::new(),
            runtime: ScriptRuntime::new(),
            actor,
            pawn,
        }
    }

    #[test]
    fn overridability_rules() {
        let f = fixture();
        let begin_play = f.refl.find_function(f.actor, "ReceiveBeginPlay").unwrap();
        let rep_notify = f.refl.find_function(f.actor, "OnRep_Health").unwrap();
        let rpc = f.refl.find_function(f.actor, "ServerMove").unwrap();
        let plain = f.refl.find_function(f.actor, "GetName").unwrap();
        assert!(is_overridable(&f.refl, begin_play));
        assert!(is_overridable(&f.refl, rep_notify));
        assert!(!is_overridable(&f.refl, rpc));
        assert!(!is_overridable(&f.refl, plain));

        let names: Vec<String> = overridable_functions(&f.refl, f.pawn)
            .into_iter()
            .filter_map(|k| f.refl.function(k).map(|f| f.name.clone()))
            .collect();
        assert!(names.contains(&"ReceiveBeginPlay".to_string()));
        assert!(!names.contains(&"GetName".to_string()));
    }

    #[test]
    fn own_function_redirects_in_place() {
        let mut f = fixture();
        let cb = f.runtime.make_function(|_| Ok(0));
        let mut injector = OverrideInjector::new();
        let key = injector
            .override_function(
                &mut f.refl,
                &mut f.dispatch,
                &mut f.registry,
                &mut f.runtime,
                f.actor,
                "ReceiveBeginPlay",
                cb,
            )
            .unwrap();
        assert_eq!(Some(key), f.refl.find_function(f.actor, "ReceiveBeginPlay"));
        assert!(f.dispatch.is_redirected(key));
        assert!(f.dispatch.original(key).is_some());
        assert!(f.registry.find_overridden(key).is_none());
        assert_eq!(f.runtime.pinned_count(), 1);
    }

    #[test]
    fn inherited_function_gets_duplicate() {
        let mut f = fixture();
        let original = f.refl.find_function(f.actor, "ReceiveBeginPlay").unwrap();
        let cb = f.runtime.make_function(|_| Ok(0));
        let mut injector = OverrideInjector::new();
        let key = injector
            .override_function(
                &mut f.refl,
                &mut f.dispatch,
                &mut f.registry,
                &mut f.runtime,
                f.pawn,
                "ReceiveBeginPlay",
                cb,
            )
            .unwrap();
        assert_ne!(key, original);
        assert_eq!(f.refl.function(key).unwrap().owner, f.pawn);
        assert_eq!(f.registry.find_overridden(key), Some(original));
        // The superclass dispatch entry is untouched.
        assert!(!f.dispatch.is_redirected(original));
    }

    #[test]
    fn repeat_override_updates_in_place() {
        let mut f = fixture();
        let mut injector = OverrideInjector::new();
        let cb1 = f.runtime.make_function(|_| Ok(0));
        let cb2 = f.runtime.make_function(|_| Ok(0));
        let k1 = injector
            .override_function(
                &mut f.refl,
                &mut f.dispatch,
                &mut f.registry,
                &mut f.runtime,
                f.pawn,
                "ReceiveBeginPlay",
                cb1,
            )
            .unwrap();
        let k2 = injector
            .override_function(
                &mut f.refl,
                &mut f.dispatch,
                &mut f.registry,
                &mut f.runtime,
                f.pawn,
                "ReceiveBeginPlay",
                cb2,
            )
            .unwrap();
        assert_eq!(k1, k2);
        assert_eq!(injector.len(), 1);
        // Old callback is unpinned when re-bound.
        assert_eq!(f.runtime.pinned_count(), 1);
    }

    #[test]
    fn restore_tears_down_both_shapes() {
        let mut f = fixture();
        let mut injector = OverrideInjector::new();
        let cb_own = f.runtime.make_function(|_| Ok(0));
        let own = injector
            .override_function(
                &mut f.refl,
                &mut f.dispatch,
                &mut f.registry,
                &mut f.runtime,
                f.actor,
                "ReceiveBeginPlay",
                cb_own,
            )
            .unwrap();
        let cb = f.runtime.make_function(|_| Ok(0));
        let dup = injector
            .override_function(
                &mut f.refl,
                &mut f.dispatch,
                &mut f.registry,
                &mut f.runtime,
                f.pawn,
                "OnRep_Health",
                cb,
            )
            .unwrap();

        assert_eq!(
            injector.restore_class(
                &mut f.refl,
                &mut f.dispatch,
                &mut f.registry,
                &mut f.runtime,
                f.pawn,
            ),
            1
        );
        // Duplicate is gone from reflection; the in-place override survives.
        assert!(f.refl.function(dup).is_none());
        assert!(f.dispatch.is_redirected(own));

        assert!(injector.restore_function(
            &mut f.refl,
            &mut f.dispatch,
            &mut f.registry,
            &mut f.runtime,
            own,
        ));
        assert!(!f.dispatch.is_redirected(own));
        assert_eq!(f.runtime.pinned_count(), 0);
        assert!(injector.is_empty());
    }
}
