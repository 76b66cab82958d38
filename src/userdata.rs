//! Opaque handles: how native state appears inside script values.
//!
//! A handle carries tag bits describing its encoding. Object handles are
//! two-level: script holds an `Rc<ObjectCell>` whose inner id is nulled
//! when the native object dies, so every stale access degrades to nil
//! instead of touching freed memory. Struct handles own a padded copy of
//! the struct bytes. Container handles point at a native container in
//! place and are cached per address so repeated access to the same field
//! yields the same handle.

use std::cell::Cell;
use std::rc::Rc;

use bitflags::bitflags;
use rustc_hash::FxHashMap;

use crate::host::memory::{ParamBuffer, ValuePtr, align_up};
use crate::host::object::ObjectId;
use crate::host::reflection::TypeKey;
use crate::property::PropertyDesc;

bitflags! {
    /// Encoding tag of an opaque handle.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct UserdataTag: u8 {
        /// Handle created by the bridge (vs foreign userdata).
        const VARIANT          = 1 << 7;
        /// Two-level indirection: payload is a nullable cell.
        const TWO_LEVEL_PTR    = 1 << 5;
        /// Payload addresses a native container in place.
        const SCRIPT_CONTAINER = 1 << 4;
    }
}

/// Padding needed ahead of a struct body when the allocator guarantees
/// 8-byte alignment only.
pub fn calc_userdata_padding(align: usize) -> u8 {
    if align <= 8 { 0 } else { (align - 8) as u8 }
}

/// Shared nullable reference to a host object.
#[derive(Debug)]
pub struct ObjectCell(Cell<Option<ObjectId>>);

impl ObjectCell {
    pub fn new(id: ObjectId) -> ObjectCell {
        ObjectCell(Cell::new(Some(id)))
    }

    pub fn get(&self) -> Option<ObjectId> {
        self.0.get()
    }

    pub fn clear(&self) {
        self.0.set(None);
    }
}

/// Script-owned copy of a struct value.
///
/// The body is destroyed through `BridgeContext::release_struct`; dropping
/// the handle without it reclaims the bytes but skips field destructors.
pub struct StructUserdata {
    type_key: TypeKey,
    buffer: ParamBuffer,
    padding: u8,
    align: usize,
    released: Cell<bool>,
}

impl StructUserdata {
    pub fn alloc(type_key: TypeKey, size: usize, align: usize) -> StructUserdata {
        let padding = calc_userdata_padding(align);
        StructUserdata {
            type_key,
            buffer: ParamBuffer::zeroed(size + padding as usize, align.max(8)),
            padding,
            align,
            released: Cell::new(false),
        }
    }

    pub fn type_key(&self) -> TypeKey {
        self.type_key
    }

    pub fn padding(&self) -> u8 {
        self.padding
    }

    /// Address of the struct body, past any alignment padding.
    pub fn ptr(&self) -> ValuePtr {
        ValuePtr::from_addr(align_up(self.buffer.addr(), self.align))
    }

    pub fn mark_released(&self) -> bool {
        !self.released.replace(true)
    }
}

/// In-place view of a native container field.
pub struct ContainerUserdata {
    addr: Cell<usize>,
    elem: Rc<PropertyDesc>,
    value_elem: Option<Rc<PropertyDesc>>,
}

impl ContainerUserdata {
    pub fn new(
        addr: ValuePtr,
        elem: Rc<PropertyDesc>,
        value_elem: Option<Rc<PropertyDesc>>,
    ) -> ContainerUserdata {
        ContainerUserdata {
            addr: Cell::new(addr.addr()),
            elem,
            value_elem,
        }
    }

    /// Address of the native container, or `None` once invalidated.
    pub fn resolve(&self) -> Option<ValuePtr> {
        match self.addr.get() {
            0 => None,
            addr => Some(ValuePtr::from_addr(addr)),
        }
    }

    pub fn invalidate(&self) {
        self.addr.set(0);
    }

    /// Element descriptor; for maps this is the key descriptor.
    pub fn elem(&self) -> Rc<PropertyDesc> {
        Rc::clone(&self.elem)
    }

    pub fn value_elem(&self) -> Option<Rc<PropertyDesc>> {
        self.value_elem.as_ref().map(Rc::clone)
    }

    pub fn elem_layout(&self, ctx: &crate::context::BridgeContext) -> (usize, usize) {
        ctx.reflection().kind_layout(self.elem.kind())
    }

    /// `(pair_size, pair_align, value_offset)`; keys-only containers get a
    /// degenerate pair equal to the element layout.
    pub fn pair_layout(&self, ctx: &crate::context::BridgeContext) -> (usize, usize, usize) {
        match &self.value_elem {
            Some(v) => ctx
                .reflection()
                .map_pair_layout(self.elem.kind(), v.kind()),
            None => {
                let (size, align) = self.elem_layout(ctx);
                (size, align, size)
            }
        }
    }
}

#[derive(Clone)]
enum Payload {
    Object(Rc<ObjectCell>),
    Struct(Rc<StructUserdata>),
    Container(Rc<ContainerUserdata>),
}

/// A tagged, reference-counted handle crossing into script.
#[derive(Clone)]
pub struct OpaqueHandle {
    tag: UserdataTag,
    payload: Payload,
}

impl OpaqueHandle {
    pub fn object(cell: Rc<ObjectCell>) -> OpaqueHandle {
        OpaqueHandle {
            tag: UserdataTag::VARIANT | UserdataTag::TWO_LEVEL_PTR,
            payload: Payload::Object(cell),
        }
    }

    pub fn strukt(data: Rc<StructUserdata>) -> OpaqueHandle {
        OpaqueHandle {
            tag: UserdataTag::VARIANT,
            payload: Payload::Struct(data),
        }
    }

    pub fn container(data: Rc<ContainerUserdata>) -> OpaqueHandle {
        OpaqueHandle {
            tag: UserdataTag::VARIANT | UserdataTag::SCRIPT_CONTAINER,
            payload: Payload::Container(data),
        }
    }

    pub fn tag(&self) -> UserdataTag {
        self.tag
    }

    pub fn is_two_level(&self) -> bool {
        self.tag.contains(UserdataTag::TWO_LEVEL_PTR)
    }

    pub fn is_container(&self) -> bool {
        self.tag.contains(UserdataTag::SCRIPT_CONTAINER)
    }

    /// Current object id, nil-safe: `None` after native destruction.
    pub fn object_id(&self) -> Option<ObjectId> {
        match &self.payload {
            Payload::Object(cell) => cell.get(),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&Rc<StructUserdata>> {
        match &self.payload {
            Payload::Struct(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_container(&self) -> Option<&Rc<ContainerUserdata>> {
        match &self.payload {
            Payload::Container(c) => Some(c),
            _ => None,
        }
    }

    pub fn padding(&self) -> u8 {
        match &self.payload {
            Payload::Struct(s) => s.padding(),
            _ => 0,
        }
    }
}

impl PartialEq for OpaqueHandle {
    fn eq(&self, other: &Self) -> bool {
        match (&self.payload, &other.payload) {
            (Payload::Object(a), Payload::Object(b)) => Rc::ptr_eq(a, b),
            (Payload::Struct(a), Payload::Struct(b)) => Rc::ptr_eq(a, b),
            (Payload::Container(a), Payload::Container(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl std::fmt::Debug for OpaqueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.payload {
            Payload::Object(_) => "object",
            Payload::Struct(_) => "struct",
            Payload::Container(_) => "container",
        };
        write!(f, "OpaqueHandle({kind}, tag={:#x})", self.tag.bits())
    }
}

/// Handle caches: one object cell per live object, one container handle per
/// native container address.
#[derive(Default)]
pub struct UserdataCache {
    object_cells: FxHashMap<ObjectId, Rc<ObjectCell>>,
    containers: FxHashMap<usize, OpaqueHandle>,
}

impl UserdataCache {
    pub fn new() -> UserdataCache {
        UserdataCache::default()
    }

    /// Returns the shared handle for `id`, creating the cell on first wrap.
    pub fn wrap_object(&mut self, id: ObjectId) -> OpaqueHandle {
        let cell = self
            .object_cells
            .entry(id)
            .or_insert_with(|| Rc::new(ObjectCell::new(id)));
        OpaqueHandle::object(Rc::clone(cell))
    }

    pub fn has_object(&self, id: ObjectId) -> bool {
        self.object_cells.contains_key(&id)
    }

    /// Nulls every script-visible reference to `id`.
    pub fn on_object_destroyed(&mut self, id: ObjectId) {
        if let Some(cell) = self.object_cells.remove(&id) {
            cell.clear();
        }
    }

    pub fn cached_container(&self, addr: ValuePtr) -> Option<OpaqueHandle> {
        self.containers.get(&addr.addr()).cloned()
    }

    pub fn cache_container(&mut self, addr: ValuePtr, handle: OpaqueHandle) {
        self.containers.insert(addr.addr(), handle);
    }

    /// Invalidates and evicts the handle for a container living at `addr`.
    pub fn invalidate_container(&mut self, addr: ValuePtr) {
        if let Some(handle) = self.containers.remove(&addr.addr()) {
            if let Some(c) = handle.as_container() {
                c.invalidate();
            }
        }
    }

    pub fn clear(&mut self) {
        for cell in self.object_cells.values() {
            cell.clear();
        }
        self.object_cells.clear();
        for handle in self.containers.values() {
            if let Some(c) = handle.as_container() {
                c.invalidate();
            }
        }
        self.containers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_for_overaligned_structs() {
        assert_eq!(calc_userdata_padding(4), 0);
        assert_eq!(calc_userdata_padding(8), 0);
        assert_eq!(calc_userdata_padding(16), 8);
        assert_eq!(calc_userdata_padding(32), 24);
    }

    #[test]
    fn struct_userdata_body_is_aligned() {
        let s = StructUserdata::alloc(TypeKey::from_raw(1), 24, 32);
        assert_eq!(s.ptr().addr() % 32, 0);
        assert_eq!(s.padding(), 24);
        s.ptr().write(7u64);
        assert_eq!(s.ptr().read::<u64>(), 7);
    }

    #[test]
    fn object_handles_share_one_cell() {
        let mut cache = UserdataCache::new();
        let mut heap = crate::host::object::HostHeap::new();
        let id = heap.allocate(TypeKey::from_raw(1), 8, 8);
        let a = cache.wrap_object(id);
        let b = cache.wrap_object(id);
        assert_eq!(a, b);
        assert!(a.is_two_level());
        assert_eq!(a.object_id(), Some(id));

        cache.on_object_destroyed(id);
        assert_eq!(a.object_id(), None);
        assert_eq!(b.object_id(), None);
    }

    #[test]
    fn tag_bits_identify_encoding() {
        let mut cache = UserdataCache::new();
        let mut heap = crate::host::object::HostHeap::new();
        let id = heap.allocate(TypeKey::from_raw(1), 8, 8);
        let obj = cache.wrap_object(id);
        assert!(obj.tag().contains(UserdataTag::VARIANT));
        assert!(obj.tag().contains(UserdataTag::TWO_LEVEL_PTR));
        assert!(!obj.is_container());

        let s = OpaqueHandle::strukt(Rc::new(StructUserdata::alloc(TypeKey::from_raw(2), 8, 8)));
        assert!(s.tag().contains(UserdataTag::VARIANT));
        assert!(!s.is_two_level());
    }
}
