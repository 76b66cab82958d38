//! Class descriptors and field handles.
//!
//! A `ClassDesc` caches what the bridge has learned about one reflected
//! class: resolved fields, the property/function descriptor storage behind
//! them, the inheritance chain, a reference count and a teardown lock.
//! Field lookups resolve lazily and cache at the *declaring* class, with a
//! signed index into that class's storage: positive for properties,
//! negative for functions.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::host::reflection::{ClassKind, TypeKey};
use crate::property::PropertyDesc;
use crate::registry::{ClassDescId, FunctionDescId};
use crate::script::value::ScriptValue;
use crate::userdata::calc_userdata_padding;

/// Default value for one parameter, registered per class + function.
#[derive(Clone, Debug, PartialEq)]
pub enum DefaultValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl DefaultValue {
    pub fn to_script_value(&self) -> ScriptValue {
        match self {
            DefaultValue::Int(v) => ScriptValue::Int(*v),
            DefaultValue::Float(v) => ScriptValue::Float(*v),
            DefaultValue::Bool(v) => ScriptValue::Bool(*v),
            DefaultValue::Str(v) => ScriptValue::str(v),
        }
    }
}

/// Parameter name → default value for one function.
pub type ParamCollection = FxHashMap<String, DefaultValue>;

/// Resolved field handle: which class descriptor answered the query, which
/// one declares the field, and a signed index into the declaring
/// descriptor's storage (positive 1-based property, negative 1-based
/// function).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldDesc {
    pub query: ClassDescId,
    pub outer: ClassDescId,
    pub index: i32,
}

impl FieldDesc {
    pub fn is_property(&self) -> bool {
        self.index > 0
    }

    pub fn is_function(&self) -> bool {
        self.index < 0
    }

    pub fn is_inherited(&self) -> bool {
        self.query != self.outer
    }
}

pub struct ClassDesc {
    id: ClassDescId,
    type_key: TypeKey,
    name: String,
    kind: ClassKind,
    size: usize,
    userdata_padding: u8,
    ref_count: Cell<i32>,
    locked: Cell<u32>,
    fields: RefCell<FxHashMap<String, FieldDesc>>,
    properties: RefCell<Vec<Rc<PropertyDesc>>>,
    functions: RefCell<Vec<FunctionDescId>>,
    chain: RefCell<Option<Rc<Vec<ClassDescId>>>>,
    default_params: RefCell<FxHashMap<String, Rc<ParamCollection>>>,
}

impl ClassDesc {
    pub fn new(
        id: ClassDescId,
        type_key: TypeKey,
        name: impl Into<String>,
        kind: ClassKind,
        size: usize,
        align: usize,
    ) -> ClassDesc {
        ClassDesc {
            id,
            type_key,
            name: name.into(),
            kind,
            size,
            userdata_padding: calc_userdata_padding(align),
            ref_count: Cell::new(0),
            locked: Cell::new(0),
            fields: RefCell::new(FxHashMap::default()),
            properties: RefCell::new(Vec::new()),
            functions: RefCell::new(Vec::new()),
            chain: RefCell::new(None),
            default_params: RefCell::new(FxHashMap::default()),
        }
    }

    pub fn id(&self) -> ClassDescId {
        self.id
    }

    pub fn type_key(&self) -> TypeKey {
        self.type_key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ClassKind {
        self.kind
    }

    pub fn is_struct(&self) -> bool {
        self.kind == ClassKind::Struct
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn userdata_padding(&self) -> u8 {
        self.userdata_padding
    }

    // ---- ref count / lock ----------------------------------------------

    pub fn add_ref(&self) {
        self.ref_count.set(self.ref_count.get() + 1);
    }

    pub fn sub_ref(&self) -> i32 {
        let v = self.ref_count.get() - 1;
        self.ref_count.set(v);
        v
    }

    pub fn ref_count(&self) -> i32 {
        self.ref_count.get()
    }

    /// Locks guard a descriptor against teardown while a call through it is
    /// on the stack; they nest.
    pub fn lock(&self) {
        self.locked.set(self.locked.get() + 1);
    }

    pub fn unlock(&self) {
        let v = self.locked.get();
        debug_assert!(v > 0);
        self.locked.set(v.saturating_sub(1));
    }

    pub fn is_locked(&self) -> bool {
        self.locked.get() > 0
    }

    // ---- field / descriptor storage ------------------------------------

    pub fn cached_field(&self, name: &str) -> Option<FieldDesc> {
        self.fields.borrow().get(name).copied()
    }

    pub fn cache_field(&self, name: impl Into<String>, field: FieldDesc) {
        self.fields.borrow_mut().insert(name.into(), field);
    }

    /// Stores a property descriptor, returning its positive 1-based index.
    pub fn push_property(&self, desc: Rc<PropertyDesc>) -> i32 {
        let mut props = self.properties.borrow_mut();
        props.push(desc);
        props.len() as i32
    }

    /// Stores a function descriptor id, returning its negative index.
    pub fn push_function(&self, desc: FunctionDescId) -> i32 {
        let mut funcs = self.functions.borrow_mut();
        funcs.push(desc);
        -(funcs.len() as i32)
    }

    pub fn property(&self, index: i32) -> Option<Rc<PropertyDesc>> {
        if index <= 0 {
            return None;
        }
        self.properties.borrow().get(index as usize - 1).cloned()
    }

    pub fn function(&self, index: i32) -> Option<FunctionDescId> {
        if index >= 0 {
            return None;
        }
        self.functions.borrow().get((-index) as usize - 1).copied()
    }

    pub fn function_descs(&self) -> Vec<FunctionDescId> {
        self.functions.borrow().clone()
    }

    pub fn properties(&self) -> Vec<Rc<PropertyDesc>> {
        self.properties.borrow().clone()
    }

    // ---- inheritance chain ----------------------------------------------

    pub fn cached_chain(&self) -> Option<Rc<Vec<ClassDescId>>> {
        self.chain.borrow().clone()
    }

    pub fn cache_chain(&self, chain: Vec<ClassDescId>) -> Rc<Vec<ClassDescId>> {
        let chain = Rc::new(chain);
        *self.chain.borrow_mut() = Some(Rc::clone(&chain));
        chain
    }

    // ---- default parameters ---------------------------------------------

    pub fn set_default_params(&self, function: impl Into<String>, params: ParamCollection) {
        self.default_params
            .borrow_mut()
            .insert(function.into(), Rc::new(params));
    }

    pub fn default_params(&self, function: &str) -> Option<Rc<ParamCollection>> {
        self.default_params.borrow().get(function).cloned()
    }
}

/// Recovers the display name of a generated field.
///
/// Generated types mangle field names as `<display>_<index>_<32 hex
/// digits>`; lookups by display name fall back to a prefix match through
/// this.
pub fn generated_display_name(mangled: &str) -> Option<&str> {
    let head_len = mangled.len().checked_sub(33)?;
    let (head, guid) = mangled.split_at(head_len);
    let mut guid_chars = guid.chars();
    if guid_chars.next() != Some('_') || !guid_chars.all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let idx = head.rfind('_')?;
    let (display, index) = head.split_at(idx);
    if display.is_empty() || index.len() < 2 || !index[1..].chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(display)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::reflection::{HostReflection, NativeKind};

    fn class_desc() -> ClassDesc {
        ClassDesc::new(
            ClassDescId::from_raw(1),
            TypeKey::from_raw(1),
            "Actor",
            ClassKind::Class,
            32,
            8,
        )
    }

    #[test]
    fn signed_index_storage() {
        let refl = HostReflection::new();
        let desc = class_desc();
        let p = desc.push_property(Rc::new(PropertyDesc::inline(&refl, NativeKind::Int32)));
        let f = desc.push_function(FunctionDescId::from_raw(7));
        assert_eq!(p, 1);
        assert_eq!(f, -1);
        assert!(desc.property(p).is_some());
        assert_eq!(desc.function(f), Some(FunctionDescId::from_raw(7)));
        assert!(desc.property(f).is_none());
        assert!(desc.function(p).is_none());
    }

    #[test]
    fn field_cache_round_trip() {
        let desc = class_desc();
        let field = FieldDesc {
            query: ClassDescId::from_raw(1),
            outer: ClassDescId::from_raw(2),
            index: 3,
        };
        assert!(desc.cached_field("Health").is_none());
        desc.cache_field("Health", field);
        let got = desc.cached_field("Health").unwrap();
        assert!(got.is_property());
        assert!(got.is_inherited());
    }

    #[test]
    fn locks_nest() {
        let desc = class_desc();
        desc.lock();
        desc.lock();
        desc.unlock();
        assert!(desc.is_locked());
        desc.unlock();
        assert!(!desc.is_locked());
    }

    #[test]
    fn padding_follows_alignment() {
        let desc = ClassDesc::new(
            ClassDescId::from_raw(1),
            TypeKey::from_raw(1),
            "Aligned",
            ClassKind::Struct,
            64,
            16,
        );
        assert_eq!(desc.userdata_padding(), 8);
    }

    #[test]
    fn generated_name_demangling() {
        assert_eq!(
            generated_display_name("Health_3_9C2A7B11D4E8F06355AA419E8D3FBC10"),
            Some("Health")
        );
        assert_eq!(
            generated_display_name("My_Field_12_9C2A7B11D4E8F06355AA419E8D3FBC10"),
            Some("My_Field")
        );
        assert_eq!(generated_display_name("Health"), None);
        assert_eq!(
            generated_display_name("Health_x_9C2A7B11D4E8F06355AA419E8D3FBC10"),
            None
        );
    }
}
