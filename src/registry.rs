//! The descriptor cache.
//!
//! Classes, functions and enums get bridge-side descriptors created on
//! first use and indexed by never-reused ids, so "is this descriptor still
//! valid" is an id-liveness check against the maps here. Field resolution
//! recurses up the inheritance chain and caches at the declaring class,
//! with reference counts flowing from querying class to declaring class so
//! teardown order is safe.

use std::rc::Rc;

use log::debug;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::class_desc::{ClassDesc, FieldDesc, generated_display_name};
use crate::function::FunctionDesc;
use crate::host::object::ObjectId;
use crate::host::reflection::{FunctionKey, HostReflection, NativeKind, TypeKey};
use crate::property::PropertyDesc;
use crate::script::runtime::ScriptRef;

macro_rules! desc_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u32);

        impl $name {
            pub fn from_raw(raw: u32) -> $name {
                $name(raw)
            }

            pub fn raw(&self) -> u32 {
                self.0
            }
        }
    };
}

desc_id!(
    /// Id of a live class descriptor. Never reused.
    ClassDescId
);
desc_id!(
    /// Id of a live function descriptor. Never reused.
    FunctionDescId
);
desc_id!(
    /// Id of a live enum descriptor. Never reused.
    EnumDescId
);

pub struct EnumDesc {
    pub id: EnumDescId,
    pub key: crate::host::reflection::EnumKey,
    pub name: String,
}

#[derive(Default)]
pub struct ReflectionRegistry {
    classes: FxHashMap<ClassDescId, Rc<ClassDesc>>,
    class_by_name: FxHashMap<String, ClassDescId>,
    class_by_key: FxHashMap<TypeKey, ClassDescId>,
    functions: FxHashMap<FunctionDescId, Rc<FunctionDesc>>,
    function_by_key: FxHashMap<FunctionKey, FunctionDescId>,
    enums: FxHashMap<EnumDescId, Rc<EnumDesc>>,
    enum_by_name: FxHashMap<String, EnumDescId>,
    /// Redirected or duplicated function → the function whose native body
    /// still holds the original behavior.
    overridden: FxHashMap<FunctionKey, FunctionKey>,
    /// Objects created from script, pending host-side collection.
    gc_set: FxHashSet<ObjectId>,
    /// Descriptors that hit refcount zero while locked by a call in flight.
    pending_release: FxHashSet<ClassDescId>,
    next_class: u32,
    next_function: u32,
    next_enum: u32,
}

impl ReflectionRegistry {
    pub fn new() -> ReflectionRegistry {
        ReflectionRegistry::default()
    }

    // ---- classes --------------------------------------------------------

    /// Descriptor for the named class, created on first use.
    pub fn register_class(
        &mut self,
        refl: &HostReflection,
        name: &str,
    ) -> Option<ClassDescId> {
        if let Some(id) = self.class_by_name.get(name) {
            return Some(*id);
        }
        let class = refl.class_by_name(name)?;
        Some(self.insert_class(class))
    }

    pub fn register_class_by_key(
        &mut self,
        refl: &HostReflection,
        key: TypeKey,
    ) -> Option<ClassDescId> {
        if let Some(id) = self.class_by_key.get(&key) {
            return Some(*id);
        }
        let class = refl.class(key)?;
        Some(self.insert_class(class))
    }

    fn insert_class(&mut self, class: &crate::host::reflection::NativeClass) -> ClassDescId {
        let id = ClassDescId(self.next_class);
        self.next_class += 1;
        let desc = ClassDesc::new(id, class.key, &class.name, class.kind, class.size, class.align);
        self.class_by_name.insert(class.name.clone(), id);
        self.class_by_key.insert(class.key, id);
        self.classes.insert(id, Rc::new(desc));
        debug!("registered class descriptor {} for '{}'", id.raw(), class.name);
        id
    }

    pub fn class(&self, id: ClassDescId) -> Option<Rc<ClassDesc>> {
        self.classes.get(&id).cloned()
    }

    pub fn find_class(&self, name: &str) -> Option<ClassDescId> {
        self.class_by_name.get(name).copied()
    }

    pub fn find_class_by_key(&self, key: TypeKey) -> Option<ClassDescId> {
        self.class_by_key.get(&key).copied()
    }

    pub fn is_class_valid(&self, id: ClassDescId) -> bool {
        self.classes.contains_key(&id)
    }

    /// Unregisters when nothing holds it: refcount zero and no call in
    /// flight through it. A locked descriptor is parked for release at
    /// unlock time instead.
    pub fn try_unregister_class(&mut self, id: ClassDescId) -> bool {
        let Some(desc) = self.classes.get(&id) else {
            return false;
        };
        if desc.ref_count() > 0 {
            return false;
        }
        if desc.is_locked() {
            self.pending_release.insert(id);
            return false;
        }
        let desc = self.classes.remove(&id).expect("checked above");
        self.class_by_name.remove(desc.name());
        self.class_by_key.remove(&desc.type_key());
        self.pending_release.remove(&id);
        debug!("unregistered class descriptor {} ('{}')", id.raw(), desc.name());
        true
    }

    // ---- inheritance chain / cascades -----------------------------------

    /// Ancestor descriptors of `id`, nearest first, registering them as
    /// needed and caching the result on the descriptor.
    pub fn inheritance_chain(
        &mut self,
        refl: &HostReflection,
        id: ClassDescId,
    ) -> Rc<Vec<ClassDescId>> {
        let Some(desc) = self.classes.get(&id).cloned() else {
            return Rc::new(Vec::new());
        };
        if let Some(chain) = desc.cached_chain() {
            return chain;
        }
        let mut chain = Vec::new();
        let mut current = refl.super_of(desc.type_key());
        while let Some(key) = current {
            if let Some(ancestor) = self.register_class_by_key(refl, key) {
                chain.push(ancestor);
            }
            current = refl.super_of(key);
        }
        desc.cache_chain(chain)
    }

    pub fn add_ref_chain(&mut self, refl: &HostReflection, id: ClassDescId) {
        if let Some(desc) = self.classes.get(&id) {
            desc.add_ref();
        }
        for ancestor in self.inheritance_chain(refl, id).iter() {
            if let Some(desc) = self.classes.get(ancestor) {
                desc.add_ref();
            }
        }
    }

    /// Drops one reference from `id` and its chain; returns the descriptors
    /// that reached zero and can be torn down now.
    pub fn sub_ref_chain(&mut self, refl: &HostReflection, id: ClassDescId) -> Vec<ClassDescId> {
        let chain = self.inheritance_chain(refl, id);
        let mut released = Vec::new();
        for target in std::iter::once(id).chain(chain.iter().copied()) {
            if let Some(desc) = self.classes.get(&target) {
                if desc.sub_ref() <= 0 {
                    released.push(target);
                }
            }
        }
        released
    }

    pub fn lock_chain(&mut self, refl: &HostReflection, id: ClassDescId) {
        if let Some(desc) = self.classes.get(&id) {
            desc.lock();
        }
        for ancestor in self.inheritance_chain(refl, id).iter() {
            if let Some(desc) = self.classes.get(ancestor) {
                desc.lock();
            }
        }
    }

    /// Unlocks `id` and its chain; returns parked descriptors that are now
    /// free to tear down.
    pub fn unlock_chain(&mut self, refl: &HostReflection, id: ClassDescId) -> Vec<ClassDescId> {
        let chain = self.inheritance_chain(refl, id);
        let mut ready = Vec::new();
        for target in std::iter::once(id).chain(chain.iter().copied()) {
            if let Some(desc) = self.classes.get(&target) {
                desc.unlock();
                if self.pending_release.contains(&target)
                    && !desc.is_locked()
                    && desc.ref_count() <= 0
                {
                    ready.push(target);
                }
            }
        }
        ready
    }

    // ---- fields ---------------------------------------------------------

    /// Resolves `name` on `class`, walking ancestors and caching the result
    /// at every level. Inherited hits add a reference from the querying
    /// descriptor to the declaring one.
    pub fn register_field(
        &mut self,
        refl: &HostReflection,
        class: ClassDescId,
        name: &str,
    ) -> Option<FieldDesc> {
        let desc = self.classes.get(&class).cloned()?;
        if let Some(field) = desc.cached_field(name) {
            return Some(field);
        }

        // Field declared on this class.
        let type_key = desc.type_key();
        let own = refl.find_own_field(type_key, name).cloned().or_else(|| {
            // Generated struct fields carry a mangled suffix.
            let class_meta = refl.class(type_key)?;
            if class_meta.native {
                return None;
            }
            class_meta
                .fields
                .iter()
                .find(|f| generated_display_name(&f.name) == Some(name))
                .cloned()
        });
        if let Some(field) = own {
            let index = desc.push_property(Rc::new(PropertyDesc::new(refl, &field)));
            let resolved = FieldDesc {
                query: class,
                outer: class,
                index,
            };
            desc.cache_field(name, resolved);
            return Some(resolved);
        }

        // Function declared on this class.
        let own_function = refl.class(type_key).and_then(|c| {
            c.functions
                .iter()
                .copied()
                .find(|fk| refl.function(*fk).is_some_and(|f| f.name == name))
        });
        if let Some(fk) = own_function {
            let func_desc = self.register_function(refl, fk, None)?;
            let index = desc.push_function(func_desc);
            let resolved = FieldDesc {
                query: class,
                outer: class,
                index,
            };
            desc.cache_field(name, resolved);
            return Some(resolved);
        }

        // Recurse into the declaring ancestor.
        let super_key = refl.super_of(type_key)?;
        let super_id = self.register_class_by_key(refl, super_key)?;
        let inherited = self.register_field(refl, super_id, name)?;
        let resolved = FieldDesc {
            query: class,
            outer: inherited.outer,
            index: inherited.index,
        };
        desc.cache_field(name, resolved);
        if let Some(outer) = self.classes.get(&inherited.outer) {
            outer.add_ref();
        }
        Some(resolved)
    }

    /// The property descriptor a resolved field handle points at.
    pub fn field_property(&self, field: FieldDesc) -> Option<Rc<PropertyDesc>> {
        self.classes.get(&field.outer)?.property(field.index)
    }

    pub fn field_function(&self, field: FieldDesc) -> Option<Rc<FunctionDesc>> {
        let id = self.classes.get(&field.outer)?.function(field.index)?;
        self.functions.get(&id).cloned()
    }

    // ---- functions ------------------------------------------------------

    /// Descriptor for a function key, created on first use. Defaults come
    /// from the owning class descriptor's default-parameter table.
    pub fn register_function(
        &mut self,
        refl: &HostReflection,
        key: FunctionKey,
        script_ref: Option<ScriptRef>,
    ) -> Option<FunctionDescId> {
        if let Some(id) = self.function_by_key.get(&key) {
            let desc = self.functions.get(id).cloned();
            if let (Some(desc), Some(r)) = (desc, script_ref) {
                desc.set_script_ref(Some(r));
            }
            return Some(*id);
        }
        let meta = refl.function(key)?;
        let defaults = self
            .class_by_key
            .get(&meta.owner)
            .and_then(|id| self.classes.get(id))
            .and_then(|c| c.default_params(&meta.name));
        let id = FunctionDescId(self.next_function);
        self.next_function += 1;
        let desc = FunctionDesc::new(refl, id, key, defaults, script_ref)?;
        self.function_by_key.insert(key, id);
        self.functions.insert(id, Rc::new(desc));
        Some(id)
    }

    pub fn function(&self, id: FunctionDescId) -> Option<Rc<FunctionDesc>> {
        self.functions.get(&id).cloned()
    }

    pub fn find_function_desc(&self, key: FunctionKey) -> Option<FunctionDescId> {
        self.function_by_key.get(&key).copied()
    }

    pub fn is_function_valid(&self, id: FunctionDescId) -> bool {
        self.functions.contains_key(&id)
    }

    /// Removes the descriptor, returning it so the caller can unpin its
    /// script reference.
    pub fn unregister_function(&mut self, key: FunctionKey) -> Option<Rc<FunctionDesc>> {
        let id = self.function_by_key.remove(&key)?;
        self.functions.remove(&id)
    }

    // ---- overridden-function map ----------------------------------------

    pub fn add_overridden(&mut self, function: FunctionKey, original: FunctionKey) {
        self.overridden.insert(function, original);
    }

    pub fn find_overridden(&self, function: FunctionKey) -> Option<FunctionKey> {
        self.overridden.get(&function).copied()
    }

    pub fn remove_overridden(&mut self, function: FunctionKey) -> Option<FunctionKey> {
        self.overridden.remove(&function)
    }

    // ---- enums ----------------------------------------------------------

    pub fn register_enum(&mut self, refl: &HostReflection, name: &str) -> Option<EnumDescId> {
        if let Some(id) = self.enum_by_name.get(name) {
            return Some(*id);
        }
        let meta = refl.enum_by_name(name)?;
        let id = EnumDescId(self.next_enum);
        self.next_enum += 1;
        self.enums.insert(
            id,
            Rc::new(EnumDesc {
                id,
                key: meta.key,
                name: meta.name.clone(),
            }),
        );
        self.enum_by_name.insert(meta.name.clone(), id);
        Some(id)
    }

    pub fn enum_desc(&self, id: EnumDescId) -> Option<Rc<EnumDesc>> {
        self.enums.get(&id).cloned()
    }

    pub fn find_enum(&self, name: &str) -> Option<EnumDescId> {
        self.enum_by_name.get(name).copied()
    }

    // ---- script-created object set --------------------------------------

    pub fn add_to_gc_set(&mut self, id: ObjectId) {
        self.gc_set.insert(id);
    }

    pub fn is_in_gc_set(&self, id: ObjectId) -> bool {
        self.gc_set.contains(&id)
    }

    pub fn notify_object_deleted(&mut self, id: ObjectId) {
        self.gc_set.remove(&id);
    }

    // ---- teardown -------------------------------------------------------

    /// Every live function key, for whole-bridge teardown.
    pub fn all_function_keys(&self) -> Vec<FunctionKey> {
        self.function_by_key.keys().copied().collect()
    }

    pub fn clear(&mut self) {
        self.classes.clear();
        self.class_by_name.clear();
        self.class_by_key.clear();
        self.functions.clear();
        self.function_by_key.clear();
        self.enums.clear();
        self.enum_by_name.clear();
        self.overridden.clear();
        self.gc_set.clear();
        self.pending_release.clear();
    }

    /// Whether a property of this kind keeps descriptors alive that the
    /// registry must outlive; used when deciding what a field release must
    /// cascade through.
    pub fn kind_references_class(kind: &NativeKind) -> bool {
        matches!(
            kind,
            NativeKind::Object(_) | NativeKind::Interface(_) | NativeKind::Struct(_)
        )
    }
}
