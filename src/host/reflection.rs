//! Host reflection model.
//!
//! Classes, structs, enums and functions with computed memory layout. The
//! bridge reads this metadata to build its descriptors; the only mutation
//! paths after registration are function duplication and removal, which the
//! override-injection and delegate layers use.
//!
//! Value semantics for every native kind live here too: default
//! construction, destruction, copy, equality and hashing over raw memory.
//! Property descriptors delegate to these instead of re-deriving layout.

use bitflags::bitflags;
use rustc_hash::FxHashMap;
use xxhash_rust::xxh32::xxh32;

use crate::containers::{NativeArray, NativeMap};
use crate::delegate::{DelegateSlot, MulticastSlot};
use crate::host::memory::{ValuePtr, align_up};
use crate::host::object::ObjectId;

macro_rules! key_type {
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

key_type!(
    /// Key of a registered class or struct.
    TypeKey
);
key_type!(
    /// Key of a registered function.
    FunctionKey
);
key_type!(
    /// Key of a registered enum.
    EnumKey
);
key_type!(
    /// Interned name id. Equal ids mean equal strings.
    NameId
);

impl NameId {
    pub const NONE: NameId = NameId(0);
}

bitflags! {
    /// Flags on a native field or parameter.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct PropFlags: u32 {
        const PARM           = 1 << 0;
        const OUT_PARM       = 1 << 1;
        const CONST_PARM     = 1 << 2;
        const RETURN_PARM    = 1 << 3;
        const REFERENCE_PARM = 1 << 4;
        const REP_NOTIFY     = 1 << 5;
    }
}

bitflags! {
    /// Flags on a native function.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct FuncFlags: u32 {
        const NATIVE = 1 << 0;
        const EVENT  = 1 << 1;
        const NET    = 1 << 2;
        const STATIC = 1 << 3;
    }
}

/// Memory kind of a native value.
#[derive(Clone, Debug, PartialEq)]
pub enum NativeKind {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float,
    Double,
    Bool,
    /// Heap string, stored in place as a `String`.
    Str,
    /// Interned name, stored as a [`NameId`].
    Name,
    /// Localizable text; same storage as `Str`, distinct kind tag.
    Text,
    /// Reference to a heap object, stored as `Option<ObjectId>`.
    Object(TypeKey),
    /// Like `Object` but the target must implement the interface type.
    Interface(TypeKey),
    /// Inline struct value laid out by its type.
    Struct(TypeKey),
    Array(Box<NativeKind>),
    Set(Box<NativeKind>),
    Map(Box<NativeKind>, Box<NativeKind>),
    /// Single-binding delegate slot over the signature function.
    Delegate(FunctionKey),
    /// Multicast delegate slot over the signature function.
    Multicast(FunctionKey),
    /// Enum value, stored as `i64`.
    Enum(EnumKey),
}

/// A field of a class/struct, or a parameter of a function.
#[derive(Clone, Debug)]
pub struct NativeField {
    pub name: String,
    pub kind: NativeKind,
    pub offset: usize,
    pub flags: PropFlags,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClassKind {
    Class,
    Struct,
    Interface,
}

pub struct NativeClass {
    pub key: TypeKey,
    pub name: String,
    pub kind: ClassKind,
    pub super_key: Option<TypeKey>,
    pub fields: Vec<NativeField>,
    pub functions: Vec<FunctionKey>,
    pub interfaces: Vec<TypeKey>,
    pub size: usize,
    pub align: usize,
    /// False for generated (script-compiled) types, whose field names carry
    /// a mangled suffix.
    pub native: bool,
}

#[derive(Clone)]
pub struct NativeFunction {
    pub key: FunctionKey,
    pub name: String,
    pub owner: TypeKey,
    /// Parameters in declared order; the return value, if any, is the
    /// single entry flagged `RETURN_PARM` (always last).
    pub params: Vec<NativeField>,
    pub parms_size: usize,
    pub parms_align: usize,
    pub flags: FuncFlags,
}

impl NativeFunction {
    pub fn is_static(&self) -> bool {
        self.flags.contains(FuncFlags::STATIC)
    }
}

pub struct NativeEnum {
    pub key: EnumKey,
    pub name: String,
    pub entries: Vec<(String, i64)>,
}

impl NativeEnum {
    pub fn value_of(&self, entry: &str) -> Option<i64> {
        self.entries
            .iter()
            .find(|(name, _)| name == entry)
            .map(|(_, v)| *v)
    }

    pub fn entry_of(&self, value: i64) -> Option<&str> {
        self.entries
            .iter()
            .find(|(_, v)| *v == value)
            .map(|(name, _)| name.as_str())
    }
}

/// Builder for one function on a class being registered.
pub struct FunctionBuilder {
    name: String,
    flags: FuncFlags,
    params: Vec<(String, NativeKind, PropFlags)>,
    ret: Option<NativeKind>,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>) -> FunctionBuilder {
        FunctionBuilder {
            name: name.into(),
            flags: FuncFlags::NATIVE,
            params: Vec::new(),
            ret: None,
        }
    }

    pub fn flags(mut self, flags: FuncFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn param(mut self, name: impl Into<String>, kind: NativeKind) -> Self {
        self.params.push((name.into(), kind, PropFlags::PARM));
        self
    }

    /// Non-const reference parameter: visible to the callee and copied back
    /// out after the call.
    pub fn out_param(mut self, name: impl Into<String>, kind: NativeKind) -> Self {
        self.params.push((
            name.into(),
            kind,
            PropFlags::PARM | PropFlags::OUT_PARM | PropFlags::REFERENCE_PARM,
        ));
        self
    }

    pub fn const_ref_param(mut self, name: impl Into<String>, kind: NativeKind) -> Self {
        self.params.push((
            name.into(),
            kind,
            PropFlags::PARM | PropFlags::CONST_PARM | PropFlags::REFERENCE_PARM,
        ));
        self
    }

    pub fn returns(mut self, kind: NativeKind) -> Self {
        self.ret = Some(kind);
        self
    }
}

/// Builder for a class, struct or interface registration.
pub struct ClassBuilder {
    name: String,
    kind: ClassKind,
    super_name: Option<String>,
    native: bool,
    fields: Vec<(String, NativeKind, PropFlags)>,
    functions: Vec<FunctionBuilder>,
    interfaces: Vec<String>,
}

impl ClassBuilder {
    pub fn class(name: impl Into<String>) -> ClassBuilder {
        ClassBuilder::new(name, ClassKind::Class)
    }

    pub fn strukt(name: impl Into<String>) -> ClassBuilder {
        ClassBuilder::new(name, ClassKind::Struct)
    }

    pub fn interface(name: impl Into<String>) -> ClassBuilder {
        ClassBuilder::new(name, ClassKind::Interface)
    }

    fn new(name: impl Into<String>, kind: ClassKind) -> ClassBuilder {
        ClassBuilder {
            name: name.into(),
            kind,
            super_name: None,
            native: true,
            fields: Vec::new(),
            functions: Vec::new(),
            interfaces: Vec::new(),
        }
    }

    pub fn extends(mut self, super_name: impl Into<String>) -> Self {
        self.super_name = Some(super_name.into());
        self
    }

    pub fn implements(mut self, interface_name: impl Into<String>) -> Self {
        self.interfaces.push(interface_name.into());
        self
    }

    /// Marks the type as generated rather than native; its field names get
    /// the generated mangling (`<name>_<index>_<guid>`).
    pub fn generated(mut self) -> Self {
        self.native = false;
        self
    }

    pub fn field(mut self, name: impl Into<String>, kind: NativeKind) -> Self {
        self.fields.push((name.into(), kind, PropFlags::empty()));
        self
    }

    pub fn field_with_flags(
        mut self,
        name: impl Into<String>,
        kind: NativeKind,
        flags: PropFlags,
    ) -> Self {
        self.fields.push((name.into(), kind, flags));
        self
    }

    pub fn function(mut self, builder: FunctionBuilder) -> Self {
        self.functions.push(builder);
        self
    }
}

/// The reflected host: every class, struct, enum and function the bridge
/// can see, plus value semantics over raw memory.
pub struct HostReflection {
    classes: FxHashMap<TypeKey, NativeClass>,
    class_names: FxHashMap<String, TypeKey>,
    functions: FxHashMap<FunctionKey, NativeFunction>,
    enums: FxHashMap<EnumKey, NativeEnum>,
    enum_names: FxHashMap<String, EnumKey>,
    names: Vec<String>,
    name_ids: FxHashMap<String, NameId>,
    next_type: u32,
    next_function: u32,
    next_enum: u32,
    latent_struct: TypeKey,
}

/// Parameter name that marks a function as latent.
pub const LATENT_PARAM_NAME: &str = "LatentInfo";

impl HostReflection {
    pub fn new() -> HostReflection {
        let mut refl = HostReflection {
            classes: FxHashMap::default(),
            class_names: FxHashMap::default(),
            functions: FxHashMap::default(),
            enums: FxHashMap::default(),
            enum_names: FxHashMap::default(),
            names: vec![String::new()],
            name_ids: FxHashMap::default(),
            next_type: 1,
            next_function: 1,
            next_enum: 1,
            latent_struct: TypeKey(0),
        };
        refl.name_ids.insert(String::new(), NameId::NONE);
        refl.latent_struct = refl.register_class(
            ClassBuilder::strukt("LatentActionInfo").field("Linkage", NativeKind::UInt64),
        );
        refl
    }

    /// Struct type written into a latent function's `LatentInfo` parameter.
    pub fn latent_struct(&self) -> TypeKey {
        self.latent_struct
    }

    // ---- registration ---------------------------------------------------

    pub fn register_class(&mut self, builder: ClassBuilder) -> TypeKey {
        let key = TypeKey(self.next_type);
        self.next_type += 1;

        let super_key = builder
            .super_name
            .as_deref()
            .and_then(|n| self.class_names.get(n).copied());
        let (mut cursor, mut align) = match super_key.and_then(|k| self.classes.get(&k)) {
            Some(sup) => (sup.size, sup.align),
            None => (0, 1),
        };

        let mut fields = Vec::with_capacity(builder.fields.len());
        for (name, kind, flags) in builder.fields {
            let (size, falign) = self.kind_layout(&kind);
            let offset = align_up(cursor, falign);
            cursor = offset + size;
            align = align.max(falign);
            fields.push(NativeField {
                name,
                kind,
                offset,
                flags,
            });
        }
        let size = align_up(cursor, align);

        let mut function_keys = Vec::with_capacity(builder.functions.len());
        for fb in builder.functions {
            function_keys.push(self.register_function_on(key, fb));
        }
        let interfaces = builder
            .interfaces
            .iter()
            .filter_map(|n| self.class_names.get(n.as_str()).copied())
            .collect();

        let class = NativeClass {
            key,
            name: builder.name.clone(),
            kind: builder.kind,
            super_key,
            fields,
            functions: function_keys,
            interfaces,
            size,
            align,
            native: builder.native,
        };
        self.class_names.insert(builder.name, key);
        self.classes.insert(key, class);
        key
    }

    fn register_function_on(&mut self, owner: TypeKey, builder: FunctionBuilder) -> FunctionKey {
        let key = FunctionKey(self.next_function);
        self.next_function += 1;

        let mut cursor = 0usize;
        let mut parms_align = 1usize;
        let mut params = Vec::with_capacity(builder.params.len() + 1);
        let mut declared = builder.params;
        if let Some(ret) = builder.ret {
            declared.push((
                "ReturnValue".to_string(),
                ret,
                PropFlags::PARM | PropFlags::OUT_PARM | PropFlags::RETURN_PARM,
            ));
        }
        for (name, kind, flags) in declared {
            let (size, falign) = self.kind_layout(&kind);
            let offset = align_up(cursor, falign);
            cursor = offset + size;
            parms_align = parms_align.max(falign);
            params.push(NativeField {
                name,
                kind,
                offset,
                flags,
            });
        }
        let parms_size = align_up(cursor, parms_align);

        self.functions.insert(
            key,
            NativeFunction {
                key,
                name: builder.name,
                owner,
                params,
                parms_size,
                parms_align,
                flags: builder.flags,
            },
        );
        key
    }

    /// Registers an extra function on an already-registered class.
    pub fn add_function(&mut self, class: TypeKey, builder: FunctionBuilder) -> FunctionKey {
        let key = self.register_function_on(class, builder);
        if let Some(c) = self.classes.get_mut(&class) {
            c.functions.push(key);
        }
        key
    }

    /// Clones `template`'s signature onto `owner` under `name`. Used when an
    /// inherited function gets a script override, and when a delegate
    /// callback needs a host-visible function of the signature's shape.
    pub fn duplicate_function(
        &mut self,
        template: FunctionKey,
        owner: TypeKey,
        name: impl Into<String>,
    ) -> Option<FunctionKey> {
        let src = self.functions.get(&template)?.clone();
        let key = FunctionKey(self.next_function);
        self.next_function += 1;
        self.functions.insert(
            key,
            NativeFunction {
                key,
                name: name.into(),
                owner,
                ..src
            },
        );
        if let Some(c) = self.classes.get_mut(&owner) {
            c.functions.push(key);
        }
        Some(key)
    }

    pub fn remove_function(&mut self, key: FunctionKey) -> bool {
        let Some(func) = self.functions.remove(&key) else {
            return false;
        };
        if let Some(c) = self.classes.get_mut(&func.owner) {
            c.functions.retain(|k| *k != key);
        }
        true
    }

    pub fn register_enum(
        &mut self,
        name: impl Into<String>,
        entries: Vec<(String, i64)>,
    ) -> EnumKey {
        let key = EnumKey(self.next_enum);
        self.next_enum += 1;
        let name = name.into();
        self.enum_names.insert(name.clone(), key);
        self.enums.insert(key, NativeEnum { key, name, entries });
        key
    }

    // ---- lookup ---------------------------------------------------------

    pub fn class(&self, key: TypeKey) -> Option<&NativeClass> {
        self.classes.get(&key)
    }

    pub fn class_by_name(&self, name: &str) -> Option<&NativeClass> {
        self.class_names.get(name).and_then(|k| self.classes.get(k))
    }

    pub fn function(&self, key: FunctionKey) -> Option<&NativeFunction> {
        self.functions.get(&key)
    }

    pub fn enum_by_key(&self, key: EnumKey) -> Option<&NativeEnum> {
        self.enums.get(&key)
    }

    pub fn enum_by_name(&self, name: &str) -> Option<&NativeEnum> {
        self.enum_names.get(name).and_then(|k| self.enums.get(k))
    }

    /// Finds a function by name on `class` or any ancestor.
    pub fn find_function(&self, class: TypeKey, name: &str) -> Option<FunctionKey> {
        let mut current = Some(class);
        while let Some(key) = current {
            let c = self.classes.get(&key)?;
            for fk in &c.functions {
                if self.functions.get(fk).is_some_and(|f| f.name == name) {
                    return Some(*fk);
                }
            }
            current = c.super_key;
        }
        None
    }

    /// Finds a field declared directly on `class` (no ancestor walk; the
    /// bridge's descriptor cache owns inheritance resolution).
    pub fn find_own_field<'a>(&'a self, class: TypeKey, name: &str) -> Option<&'a NativeField> {
        self.classes
            .get(&class)?
            .fields
            .iter()
            .find(|f| f.name == name)
    }

    pub fn super_of(&self, class: TypeKey) -> Option<TypeKey> {
        self.classes.get(&class).and_then(|c| c.super_key)
    }

    /// True when `class` (or an ancestor) declares `interface`.
    pub fn class_implements(&self, class: TypeKey, interface: TypeKey) -> bool {
        let mut current = Some(class);
        while let Some(key) = current {
            let Some(c) = self.classes.get(&key) else {
                return false;
            };
            if c.interfaces.contains(&interface) {
                return true;
            }
            current = c.super_key;
        }
        false
    }

    pub fn is_a(&self, child: TypeKey, ancestor: TypeKey) -> bool {
        let mut current = Some(child);
        while let Some(key) = current {
            if key == ancestor {
                return true;
            }
            current = self.super_of(key);
        }
        false
    }

    // ---- names ----------------------------------------------------------

    pub fn intern_name(&mut self, name: &str) -> NameId {
        if let Some(id) = self.name_ids.get(name) {
            return *id;
        }
        let id = NameId(self.names.len() as u32);
        self.names.push(name.to_string());
        self.name_ids.insert(name.to_string(), id);
        id
    }

    pub fn resolve_name(&self, id: NameId) -> &str {
        self.names
            .get(id.raw() as usize)
            .map(String::as_str)
            .unwrap_or("")
    }

    // ---- layout ---------------------------------------------------------

    /// `(size, align)` of a value of `kind`.
    pub fn kind_layout(&self, kind: &NativeKind) -> (usize, usize) {
        use std::mem::{align_of, size_of};
        match kind {
            NativeKind::Int8 | NativeKind::UInt8 => (1, 1),
            NativeKind::Int16 | NativeKind::UInt16 => (2, 2),
            NativeKind::Int32 | NativeKind::UInt32 => (4, 4),
            NativeKind::Int64 | NativeKind::UInt64 | NativeKind::Enum(_) => (8, 8),
            NativeKind::Float => (4, 4),
            NativeKind::Double => (8, 8),
            NativeKind::Bool => (1, 1),
            NativeKind::Str | NativeKind::Text => (size_of::<String>(), align_of::<String>()),
            NativeKind::Name => (size_of::<NameId>(), align_of::<NameId>()),
            NativeKind::Object(_) | NativeKind::Interface(_) => (
                size_of::<Option<ObjectId>>(),
                align_of::<Option<ObjectId>>(),
            ),
            NativeKind::Struct(key) => self
                .classes
                .get(key)
                .map(|c| (c.size, c.align))
                .unwrap_or((0, 1)),
            NativeKind::Array(_) | NativeKind::Set(_) => {
                (size_of::<NativeArray>(), align_of::<NativeArray>())
            }
            NativeKind::Map(..) => (size_of::<NativeMap>(), align_of::<NativeMap>()),
            NativeKind::Delegate(_) => (size_of::<DelegateSlot>(), align_of::<DelegateSlot>()),
            NativeKind::Multicast(_) => (size_of::<MulticastSlot>(), align_of::<MulticastSlot>()),
        }
    }

    /// Layout of one key/value pair inside a map's element storage:
    /// `(pair_size, pair_align, value_offset)`.
    pub fn map_pair_layout(&self, key: &NativeKind, value: &NativeKind) -> (usize, usize, usize) {
        let (ksize, kalign) = self.kind_layout(key);
        let (vsize, valign) = self.kind_layout(value);
        let pair_align = kalign.max(valign);
        let value_offset = align_up(ksize, valign);
        let pair_size = align_up(value_offset + vsize, pair_align);
        (pair_size, pair_align, value_offset)
    }

    /// True when raw byte copy is a correct copy and no destructor runs.
    pub fn kind_is_pod(&self, kind: &NativeKind) -> bool {
        match kind {
            NativeKind::Str
            | NativeKind::Text
            | NativeKind::Array(_)
            | NativeKind::Set(_)
            | NativeKind::Map(..)
            | NativeKind::Multicast(_) => false,
            NativeKind::Struct(key) => self
                .classes
                .get(key)
                .is_some_and(|c| c.fields.iter().all(|f| self.kind_is_pod(&f.kind))),
            _ => true,
        }
    }

    // ---- value semantics over raw memory --------------------------------

    /// Default-constructs a value of `kind` at `addr`, overwriting whatever
    /// bytes are there.
    pub fn init_value(&self, kind: &NativeKind, addr: ValuePtr) {
        match kind {
            NativeKind::Int8 => addr.write(0i8),
            NativeKind::UInt8 => addr.write(0u8),
            NativeKind::Int16 => addr.write(0i16),
            NativeKind::UInt16 => addr.write(0u16),
            NativeKind::Int32 => addr.write(0i32),
            NativeKind::UInt32 => addr.write(0u32),
            NativeKind::Int64 => addr.write(0i64),
            NativeKind::UInt64 => addr.write(0u64),
            NativeKind::Enum(_) => addr.write(0i64),
            NativeKind::Float => addr.write(0f32),
            NativeKind::Double => addr.write(0f64),
            NativeKind::Bool => addr.write(false),
            NativeKind::Str | NativeKind::Text => addr.write(String::new()),
            NativeKind::Name => addr.write(NameId::NONE),
            NativeKind::Object(_) | NativeKind::Interface(_) => {
                addr.write::<Option<ObjectId>>(None)
            }
            NativeKind::Struct(key) => {
                if let Some(class) = self.classes.get(key) {
                    for field in &class.fields {
                        self.init_value(&field.kind, addr.offset(field.offset));
                    }
                }
            }
            NativeKind::Array(_) | NativeKind::Set(_) => addr.write(NativeArray::new()),
            NativeKind::Map(..) => addr.write(NativeMap::new()),
            NativeKind::Delegate(_) => addr.write(DelegateSlot::default()),
            NativeKind::Multicast(_) => addr.write(MulticastSlot::default()),
        }
    }

    /// Destroys the value at `addr`. POD kinds are a no-op.
    pub fn destroy_value(&self, kind: &NativeKind, addr: ValuePtr) {
        match kind {
            NativeKind::Str | NativeKind::Text => addr.drop_in_place::<String>(),
            NativeKind::Struct(key) => {
                if let Some(class) = self.classes.get(key) {
                    for field in &class.fields {
                        self.destroy_value(&field.kind, addr.offset(field.offset));
                    }
                }
            }
            NativeKind::Array(elem) | NativeKind::Set(elem) => {
                let (esize, _) = self.kind_layout(elem);
                addr.as_mut::<NativeArray>().clear_with(esize, |p| {
                    self.destroy_value(elem, p);
                });
                addr.drop_in_place::<NativeArray>();
            }
            NativeKind::Map(key, value) => {
                let (psize, _, voff) = self.map_pair_layout(key, value);
                addr.as_mut::<NativeMap>().clear_with(psize, |p| {
                    self.destroy_value(key, p);
                    self.destroy_value(value, p.offset(voff));
                });
                addr.drop_in_place::<NativeMap>();
            }
            NativeKind::Multicast(_) => addr.drop_in_place::<MulticastSlot>(),
            _ => {}
        }
    }

    /// Copies `src` into an already-initialized `dst`.
    pub fn copy_value(&self, kind: &NativeKind, dst: ValuePtr, src: ValuePtr) {
        if dst == src {
            return;
        }
        match kind {
            NativeKind::Str | NativeKind::Text => {
                dst.as_mut::<String>().clone_from(src.as_ref::<String>());
            }
            NativeKind::Struct(key) => {
                if let Some(class) = self.classes.get(key) {
                    for field in &class.fields {
                        self.copy_value(
                            &field.kind,
                            dst.offset(field.offset),
                            src.offset(field.offset),
                        );
                    }
                }
            }
            NativeKind::Array(elem) | NativeKind::Set(elem) => {
                let (esize, ealign) = self.kind_layout(elem);
                self.destroy_value(kind, dst);
                dst.write(NativeArray::new());
                let src_arr = src.as_ref::<NativeArray>();
                let dst_arr = dst.as_mut::<NativeArray>();
                for i in 0..src_arr.len() {
                    let slot = dst_arr.push_uninit(esize, ealign);
                    self.init_value(elem, slot);
                    self.copy_value(elem, slot, src_arr.element(i, esize));
                }
            }
            NativeKind::Map(key, value) => {
                let (psize, palign, voff) = self.map_pair_layout(key, value);
                self.destroy_value(kind, dst);
                dst.write(NativeMap::new());
                let src_map = src.as_ref::<NativeMap>();
                let dst_map = dst.as_mut::<NativeMap>();
                for i in 0..src_map.len() {
                    let spair = src_map.pair(i, psize);
                    let dpair = dst_map.push_uninit(psize, palign);
                    self.init_value(key, dpair);
                    self.init_value(value, dpair.offset(voff));
                    self.copy_value(key, dpair, spair);
                    self.copy_value(value, dpair.offset(voff), spair.offset(voff));
                }
            }
            NativeKind::Delegate(_) => {
                dst.write(*src.as_ref::<DelegateSlot>());
            }
            NativeKind::Multicast(_) => {
                dst.as_mut::<MulticastSlot>()
                    .clone_from(src.as_ref::<MulticastSlot>());
            }
            _ => {
                let (size, _) = self.kind_layout(kind);
                dst.copy_bytes_from(src, size);
            }
        }
    }

    pub fn values_identical(&self, kind: &NativeKind, a: ValuePtr, b: ValuePtr) -> bool {
        match kind {
            NativeKind::Str | NativeKind::Text => a.as_ref::<String>() == b.as_ref::<String>(),
            NativeKind::Name => a.read::<NameId>() == b.read::<NameId>(),
            NativeKind::Float => a.read::<f32>() == b.read::<f32>(),
            NativeKind::Double => a.read::<f64>() == b.read::<f64>(),
            NativeKind::Object(_) | NativeKind::Interface(_) => {
                a.read::<Option<ObjectId>>() == b.read::<Option<ObjectId>>()
            }
            NativeKind::Struct(key) => match self.classes.get(key) {
                Some(class) => class.fields.iter().all(|f| {
                    self.values_identical(&f.kind, a.offset(f.offset), b.offset(f.offset))
                }),
                None => false,
            },
            NativeKind::Array(elem) => {
                let (esize, _) = self.kind_layout(elem);
                let (ar, br) = (a.as_ref::<NativeArray>(), b.as_ref::<NativeArray>());
                ar.len() == br.len()
                    && (0..ar.len()).all(|i| {
                        self.values_identical(elem, ar.element(i, esize), br.element(i, esize))
                    })
            }
            NativeKind::Set(elem) => {
                let (esize, _) = self.kind_layout(elem);
                let (ar, br) = (a.as_ref::<NativeArray>(), b.as_ref::<NativeArray>());
                if ar.len() != br.len() {
                    return false;
                }
                // One-to-one matching; duplicate elements must pair up.
                let mut matched = vec![false; br.len()];
                (0..ar.len()).all(|i| {
                    let hit = (0..br.len()).find(|&j| {
                        !matched[j]
                            && self.values_identical(elem, ar.element(i, esize), br.element(j, esize))
                    });
                    match hit {
                        Some(j) => {
                            matched[j] = true;
                            true
                        }
                        None => false,
                    }
                })
            }
            NativeKind::Map(key, value) => {
                let (psize, _, voff) = self.map_pair_layout(key, value);
                let (ar, br) = (a.as_ref::<NativeMap>(), b.as_ref::<NativeMap>());
                if ar.len() != br.len() {
                    return false;
                }
                let mut matched = vec![false; br.len()];
                (0..ar.len()).all(|i| {
                    let apair = ar.pair(i, psize);
                    let hit = (0..br.len()).find(|&j| {
                        let bpair = br.pair(j, psize);
                        !matched[j]
                            && self.values_identical(key, apair, bpair)
                            && self.values_identical(value, apair.offset(voff), bpair.offset(voff))
                    });
                    match hit {
                        Some(j) => {
                            matched[j] = true;
                            true
                        }
                        None => false,
                    }
                })
            }
            NativeKind::Delegate(_) => {
                a.as_ref::<DelegateSlot>() == b.as_ref::<DelegateSlot>()
            }
            NativeKind::Multicast(_) => {
                a.as_ref::<MulticastSlot>() == b.as_ref::<MulticastSlot>()
            }
            _ => {
                let (size, _) = self.kind_layout(kind);
                a.bytes(size) == b.bytes(size)
            }
        }
    }

    /// 32-bit hash of the value at `addr`; equal values hash equal.
    pub fn hash_value(&self, kind: &NativeKind, addr: ValuePtr) -> u32 {
        match kind {
            NativeKind::Str | NativeKind::Text => xxh32(addr.as_ref::<String>().as_bytes(), 0),
            NativeKind::Object(_) | NativeKind::Interface(_) => {
                match addr.read::<Option<ObjectId>>() {
                    Some(id) => xxh32(&id.index().to_le_bytes(), id.generation()),
                    None => 0,
                }
            }
            NativeKind::Struct(key) => match self.classes.get(key) {
                Some(class) => class.fields.iter().fold(17u32, |acc, f| {
                    acc.wrapping_mul(31)
                        .wrapping_add(self.hash_value(&f.kind, addr.offset(f.offset)))
                }),
                None => 0,
            },
            NativeKind::Array(elem) | NativeKind::Set(elem) => {
                let (esize, _) = self.kind_layout(elem);
                let arr = addr.as_ref::<NativeArray>();
                (0..arr.len()).fold(17u32, |acc, i| {
                    acc.wrapping_mul(31)
                        .wrapping_add(self.hash_value(elem, arr.element(i, esize)))
                })
            }
            NativeKind::Map(key, value) => {
                let (psize, _, voff) = self.map_pair_layout(key, value);
                let map = addr.as_ref::<NativeMap>();
                (0..map.len()).fold(17u32, |acc, i| {
                    let pair = map.pair(i, psize);
                    acc.wrapping_add(
                        self.hash_value(key, pair)
                            .wrapping_mul(31)
                            .wrapping_add(self.hash_value(value, pair.offset(voff))),
                    )
                })
            }
            NativeKind::Delegate(_) | NativeKind::Multicast(_) => 0,
            _ => {
                let (size, _) = self.kind_layout(kind);
                xxh32(addr.bytes(size), 0)
            }
        }
    }
}

impl Default for HostReflection {
    fn default() -> Self {
        HostReflection::new()
    }
}
