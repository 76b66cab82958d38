//! Native dynamic containers.
//!
//! Arrays, sets and maps store their elements in raw, element-aligned byte
//! storage; the element layout is supplied by the caller on every call
//! because it lives in reflection metadata, not in the container. Element
//! construction and destruction are the owner's job (via
//! `HostReflection::{init,destroy}_value`), the container only moves bytes.
//!
//! The script-facing operations at the bottom convert elements through
//! property descriptors and use 1-based indices at the boundary.

use std::alloc::{self, Layout};

use log::warn;

use crate::context::BridgeContext;
use crate::error::{BridgeError, Result};
use crate::host::memory::ValuePtr;
use crate::script::value::ScriptValue;
use crate::userdata::ContainerUserdata;

/// Growable raw storage for same-sized elements.
struct ElementStorage {
    ptr: *mut u8,
    cap_bytes: usize,
    align: usize,
}

impl ElementStorage {
    const fn empty() -> ElementStorage {
        ElementStorage {
            ptr: std::ptr::null_mut(),
            cap_bytes: 0,
            align: 1,
        }
    }

    fn reserve(&mut self, needed_bytes: usize, align: usize) {
        if needed_bytes <= self.cap_bytes {
            return;
        }
        let new_cap = needed_bytes.max(self.cap_bytes * 2).max(align.max(16) * 4);
        let align = align.max(self.align);
        let new_layout = Layout::from_size_align(new_cap, align).unwrap();
        // Safety: layout is non-zero sized.
        let new_ptr = unsafe { alloc::alloc(new_layout) };
        if new_ptr.is_null() {
            alloc::handle_alloc_error(new_layout);
        }
        if !self.ptr.is_null() {
            unsafe {
                std::ptr::copy_nonoverlapping(self.ptr, new_ptr, self.cap_bytes);
                alloc::dealloc(
                    self.ptr,
                    Layout::from_size_align(self.cap_bytes, self.align).unwrap(),
                );
            }
        }
        self.ptr = new_ptr;
        self.cap_bytes = new_cap;
        self.align = align;
    }
}

impl Drop for ElementStorage {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                alloc::dealloc(
                    self.ptr,
                    Layout::from_size_align(self.cap_bytes, self.align).unwrap(),
                );
            }
        }
    }
}

/// Dynamic array of reflected elements.
///
/// Dropping the array frees the byte storage only; non-POD elements must be
/// destroyed first with [`NativeArray::clear_with`].
pub struct NativeArray {
    storage: ElementStorage,
    len: usize,
}

/// Sets share the array's storage shape; uniqueness is enforced by the
/// operations, not the layout.
pub type NativeSet = NativeArray;

impl NativeArray {
    pub fn new() -> NativeArray {
        NativeArray {
            storage: ElementStorage::empty(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn element(&self, index: usize, elem_size: usize) -> ValuePtr {
        assert!(index < self.len, "container index {index} out of range");
        ValuePtr::new(unsafe { self.storage.ptr.add(index * elem_size) })
    }

    /// Appends an uninitialized slot and returns its address. The caller
    /// must initialize it before any other container operation.
    pub fn push_uninit(&mut self, elem_size: usize, elem_align: usize) -> ValuePtr {
        self.storage.reserve((self.len + 1) * elem_size, elem_align);
        let ptr = ValuePtr::new(unsafe { self.storage.ptr.add(self.len * elem_size) });
        self.len += 1;
        ptr
    }

    /// Opens an uninitialized slot at `index`, shifting later elements up.
    pub fn insert_uninit(&mut self, index: usize, elem_size: usize, elem_align: usize) -> ValuePtr {
        assert!(index <= self.len, "container insert {index} out of range");
        self.storage.reserve((self.len + 1) * elem_size, elem_align);
        unsafe {
            let base = self.storage.ptr.add(index * elem_size);
            std::ptr::copy(base, base.add(elem_size), (self.len - index) * elem_size);
        }
        self.len += 1;
        ValuePtr::new(unsafe { self.storage.ptr.add(index * elem_size) })
    }

    /// Removes the slot at `index`, shifting later elements down. The
    /// element must already have been destroyed.
    pub fn remove(&mut self, index: usize, elem_size: usize) {
        assert!(index < self.len, "container remove {index} out of range");
        unsafe {
            let base = self.storage.ptr.add(index * elem_size);
            std::ptr::copy(
                base.add(elem_size),
                base,
                (self.len - index - 1) * elem_size,
            );
        }
        self.len -= 1;
    }

    /// Runs `destroy` on every element, then empties the container.
    pub fn clear_with(&mut self, elem_size: usize, mut destroy: impl FnMut(ValuePtr)) {
        for i in 0..self.len {
            destroy(ValuePtr::new(unsafe { self.storage.ptr.add(i * elem_size) }));
        }
        self.len = 0;
    }
}

impl Default for NativeArray {
    fn default() -> Self {
        NativeArray::new()
    }
}

/// Map over pair-sized elements: key at offset 0, value at the pair layout's
/// value offset.
pub struct NativeMap {
    pairs: NativeArray,
}

impl NativeMap {
    pub fn new() -> NativeMap {
        NativeMap {
            pairs: NativeArray::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn pair(&self, index: usize, pair_size: usize) -> ValuePtr {
        self.pairs.element(index, pair_size)
    }

    pub fn push_uninit(&mut self, pair_size: usize, pair_align: usize) -> ValuePtr {
        self.pairs.push_uninit(pair_size, pair_align)
    }

    pub fn remove(&mut self, index: usize, pair_size: usize) {
        self.pairs.remove(index, pair_size)
    }

    pub fn clear_with(&mut self, pair_size: usize, destroy: impl FnMut(ValuePtr)) {
        self.pairs.clear_with(pair_size, destroy)
    }
}

impl Default for NativeMap {
    fn default() -> Self {
        NativeMap::new()
    }
}

// ---- script-facing operations ------------------------------------------
//
// All indices crossing the boundary are 1-based. Out-of-range access warns
// and degrades (nil result / no-op) instead of failing hard.

fn resolve_array<'a>(c: &ContainerUserdata) -> Result<&'a mut NativeArray> {
    let addr = c
        .resolve()
        .ok_or(BridgeError::StaleDescriptor { what: "container" })?;
    Ok(addr.as_mut::<NativeArray>())
}

fn resolve_map<'a>(c: &ContainerUserdata) -> Result<&'a mut NativeMap> {
    let addr = c
        .resolve()
        .ok_or(BridgeError::StaleDescriptor { what: "container" })?;
    Ok(addr.as_mut::<NativeMap>())
}

pub fn array_num(c: &ContainerUserdata) -> Result<i64> {
    Ok(resolve_array(c)?.len() as i64)
}

pub fn array_get(ctx: &mut BridgeContext, c: &ContainerUserdata, index: i64) -> Result<ScriptValue> {
    let elem = c.elem();
    let (esize, _) = c.elem_layout(ctx);
    let arr = resolve_array(c)?;
    if index < 1 || index as usize > arr.len() {
        warn!("array index {index} out of range (1..{})", arr.len());
        return Ok(ScriptValue::Nil);
    }
    elem.to_script(ctx, arr.element(index as usize - 1, esize))
}

pub fn array_set(
    ctx: &mut BridgeContext,
    c: &ContainerUserdata,
    index: i64,
    value: &ScriptValue,
) -> Result<()> {
    let elem = c.elem();
    let (esize, _) = c.elem_layout(ctx);
    let arr = resolve_array(c)?;
    if index < 1 || index as usize > arr.len() {
        warn!("array index {index} out of range (1..{})", arr.len());
        return Ok(());
    }
    elem.from_script(ctx, arr.element(index as usize - 1, esize), value)?;
    Ok(())
}

/// Appends `value`; returns the new 1-based index.
pub fn array_add(
    ctx: &mut BridgeContext,
    c: &ContainerUserdata,
    value: &ScriptValue,
) -> Result<i64> {
    let elem = c.elem();
    let (esize, ealign) = c.elem_layout(ctx);
    let arr = resolve_array(c)?;
    let slot = arr.push_uninit(esize, ealign);
    ctx.reflection().init_value(elem.kind(), slot);
    elem.from_script(ctx, slot, value)?;
    Ok(resolve_array(c)?.len() as i64)
}

pub fn array_insert(
    ctx: &mut BridgeContext,
    c: &ContainerUserdata,
    index: i64,
    value: &ScriptValue,
) -> Result<()> {
    let elem = c.elem();
    let (esize, ealign) = c.elem_layout(ctx);
    let arr = resolve_array(c)?;
    if index < 1 || index as usize > arr.len() + 1 {
        warn!("array insert {index} out of range (1..{})", arr.len() + 1);
        return Ok(());
    }
    let slot = arr.insert_uninit(index as usize - 1, esize, ealign);
    ctx.reflection().init_value(elem.kind(), slot);
    elem.from_script(ctx, slot, value)?;
    Ok(())
}

pub fn array_remove(ctx: &mut BridgeContext, c: &ContainerUserdata, index: i64) -> Result<()> {
    let elem = c.elem();
    let (esize, _) = c.elem_layout(ctx);
    let arr = resolve_array(c)?;
    if index < 1 || index as usize > arr.len() {
        warn!("array remove {index} out of range (1..{})", arr.len());
        return Ok(());
    }
    let i = index as usize - 1;
    ctx.reflection().destroy_value(elem.kind(), arr.element(i, esize));
    arr.remove(i, esize);
    Ok(())
}

/// 1-based index of the first element equal to `value`, or 0.
pub fn array_find(
    ctx: &mut BridgeContext,
    c: &ContainerUserdata,
    value: &ScriptValue,
) -> Result<i64> {
    let elem = c.elem();
    let (esize, ealign) = c.elem_layout(ctx);
    // Convert once into scratch native storage, then compare natively.
    let scratch = crate::host::memory::ParamBuffer::zeroed(esize, ealign);
    ctx.reflection().init_value(elem.kind(), scratch.ptr());
    elem.from_script(ctx, scratch.ptr(), value)?;
    let arr = resolve_array(c)?;
    let mut found = 0i64;
    for i in 0..arr.len() {
        if ctx
            .reflection()
            .values_identical(elem.kind(), arr.element(i, esize), scratch.ptr())
        {
            found = i as i64 + 1;
            break;
        }
    }
    ctx.reflection().destroy_value(elem.kind(), scratch.ptr());
    Ok(found)
}

pub fn array_clear(ctx: &mut BridgeContext, c: &ContainerUserdata) -> Result<()> {
    let elem = c.elem();
    let (esize, _) = c.elem_layout(ctx);
    let arr = resolve_array(c)?;
    let refl = ctx.reflection();
    arr.clear_with(esize, |p| refl.destroy_value(elem.kind(), p));
    Ok(())
}

/// Copies the whole array out as script values. The only copying path.
pub fn array_to_table(ctx: &mut BridgeContext, c: &ContainerUserdata) -> Result<Vec<ScriptValue>> {
    let elem = c.elem();
    let (esize, _) = c.elem_layout(ctx);
    let len = resolve_array(c)?.len();
    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        let p = resolve_array(c)?.element(i, esize);
        out.push(elem.to_script(ctx, p)?);
    }
    Ok(out)
}

pub fn set_num(c: &ContainerUserdata) -> Result<i64> {
    array_num(c)
}

/// Adds `value` if no equal element exists; returns true when added.
pub fn set_add(ctx: &mut BridgeContext, c: &ContainerUserdata, value: &ScriptValue) -> Result<bool> {
    if array_find(ctx, c, value)? != 0 {
        return Ok(false);
    }
    array_add(ctx, c, value)?;
    Ok(true)
}

pub fn set_contains(
    ctx: &mut BridgeContext,
    c: &ContainerUserdata,
    value: &ScriptValue,
) -> Result<bool> {
    Ok(array_find(ctx, c, value)? != 0)
}

pub fn set_remove(
    ctx: &mut BridgeContext,
    c: &ContainerUserdata,
    value: &ScriptValue,
) -> Result<bool> {
    let index = array_find(ctx, c, value)?;
    if index == 0 {
        return Ok(false);
    }
    array_remove(ctx, c, index)?;
    Ok(true)
}

pub fn set_clear(ctx: &mut BridgeContext, c: &ContainerUserdata) -> Result<()> {
    array_clear(ctx, c)
}

pub fn set_to_table(ctx: &mut BridgeContext, c: &ContainerUserdata) -> Result<Vec<ScriptValue>> {
    array_to_table(ctx, c)
}

fn map_find_index(
    ctx: &mut BridgeContext,
    c: &ContainerUserdata,
    key: &ScriptValue,
) -> Result<Option<usize>> {
    let kdesc = c.elem();
    let (psize, palign, _) = c.pair_layout(ctx);
    let scratch = crate::host::memory::ParamBuffer::zeroed(psize, palign);
    ctx.reflection().init_value(kdesc.kind(), scratch.ptr());
    kdesc.from_script(ctx, scratch.ptr(), key)?;
    let map = resolve_map(c)?;
    let mut found = None;
    for i in 0..map.len() {
        if ctx
            .reflection()
            .values_identical(kdesc.kind(), map.pair(i, psize), scratch.ptr())
        {
            found = Some(i);
            break;
        }
    }
    ctx.reflection().destroy_value(kdesc.kind(), scratch.ptr());
    Ok(found)
}

pub fn map_num(c: &ContainerUserdata) -> Result<i64> {
    Ok(resolve_map(c)?.len() as i64)
}

pub fn map_find(
    ctx: &mut BridgeContext,
    c: &ContainerUserdata,
    key: &ScriptValue,
) -> Result<ScriptValue> {
    let vdesc = c
        .value_elem()
        .ok_or_else(|| BridgeError::failed("not a map container"))?;
    let (psize, _, voff) = c.pair_layout(ctx);
    match map_find_index(ctx, c, key)? {
        Some(i) => {
            let pair = resolve_map(c)?.pair(i, psize);
            vdesc.to_script(ctx, pair.offset(voff))
        }
        None => Ok(ScriptValue::Nil),
    }
}

/// Inserts or overwrites the entry for `key`.
pub fn map_add(
    ctx: &mut BridgeContext,
    c: &ContainerUserdata,
    key: &ScriptValue,
    value: &ScriptValue,
) -> Result<()> {
    let kdesc = c.elem();
    let vdesc = c
        .value_elem()
        .ok_or_else(|| BridgeError::failed("not a map container"))?;
    let (psize, palign, voff) = c.pair_layout(ctx);
    if let Some(i) = map_find_index(ctx, c, key)? {
        let pair = resolve_map(c)?.pair(i, psize);
        vdesc.from_script(ctx, pair.offset(voff), value)?;
        return Ok(());
    }
    let map = resolve_map(c)?;
    let pair = map.push_uninit(psize, palign);
    ctx.reflection().init_value(kdesc.kind(), pair);
    ctx.reflection().init_value(vdesc.kind(), pair.offset(voff));
    kdesc.from_script(ctx, pair, key)?;
    vdesc.from_script(ctx, pair.offset(voff), value)?;
    Ok(())
}

pub fn map_remove(ctx: &mut BridgeContext, c: &ContainerUserdata, key: &ScriptValue) -> Result<bool> {
    let kdesc = c.elem();
    let vdesc = c
        .value_elem()
        .ok_or_else(|| BridgeError::failed("not a map container"))?;
    let (psize, _, voff) = c.pair_layout(ctx);
    match map_find_index(ctx, c, key)? {
        Some(i) => {
            let map = resolve_map(c)?;
            let pair = map.pair(i, psize);
            ctx.reflection().destroy_value(kdesc.kind(), pair);
            ctx.reflection().destroy_value(vdesc.kind(), pair.offset(voff));
            map.remove(i, psize);
            Ok(true)
        }
        None => Ok(false),
    }
}

pub fn map_clear(ctx: &mut BridgeContext, c: &ContainerUserdata) -> Result<()> {
    let kdesc = c.elem();
    let vdesc = c
        .value_elem()
        .ok_or_else(|| BridgeError::failed("not a map container"))?;
    let (psize, _, voff) = c.pair_layout(ctx);
    let map = resolve_map(c)?;
    let refl = ctx.reflection();
    map.clear_with(psize, |p| {
        refl.destroy_value(kdesc.kind(), p);
        refl.destroy_value(vdesc.kind(), p.offset(voff));
    });
    Ok(())
}

/// Copies all entries out as key/value script pairs.
pub fn map_pairs(
    ctx: &mut BridgeContext,
    c: &ContainerUserdata,
) -> Result<Vec<(ScriptValue, ScriptValue)>> {
    let kdesc = c.elem();
    let vdesc = c
        .value_elem()
        .ok_or_else(|| BridgeError::failed("not a map container"))?;
    let (psize, _, voff) = c.pair_layout(ctx);
    let len = resolve_map(c)?.len();
    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        let pair = resolve_map(c)?.pair(i, psize);
        let k = kdesc.to_script(ctx, pair)?;
        let v = vdesc.to_script(ctx, pair.offset(voff))?;
        out.push((k, v));
    }
    Ok(out)
}
