//! Raw, aligned memory for native values.
//!
//! Object bodies and call-parameter frames are plain byte buffers laid out
//! by reflection metadata. [`ValuePtr`] is the typed window into such a
//! buffer: it asserts non-null and alignment on every access, then reads or
//! writes through the raw pointer.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// Rounds `value` up to the next multiple of `align` (power of two).
pub fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Heap buffer for a parameter frame or object body.
///
/// Always at least 16-byte aligned so any scalar parameter layout fits;
/// over-aligned types request more. Zero-initialized on allocation so an
/// unwritten POD parameter reads as its zero value.
pub struct ParamBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl ParamBuffer {
    pub fn zeroed(size: usize, align: usize) -> ParamBuffer {
        let align = align.max(16);
        if size == 0 {
            return ParamBuffer {
                ptr: NonNull::dangling(),
                layout: Layout::from_size_align(0, align).unwrap(),
            };
        }
        let layout = Layout::from_size_align(size, align).unwrap();
        // Safety: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = match NonNull::new(raw) {
            Some(p) => p,
            None => alloc::handle_alloc_error(layout),
        };
        ParamBuffer { ptr, layout }
    }

    pub fn size(&self) -> usize {
        self.layout.size()
    }

    pub fn ptr(&self) -> ValuePtr {
        ValuePtr::new(self.ptr.as_ptr())
    }

    /// Address of the buffer base; stable for the buffer's lifetime.
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }
}

impl Drop for ParamBuffer {
    fn drop(&mut self) {
        if self.layout.size() > 0 {
            // Safety: allocated with this exact layout in `zeroed`.
            unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
        }
    }
}

impl std::fmt::Debug for ParamBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParamBuffer")
            .field("addr", &self.addr())
            .field("size", &self.layout.size())
            .finish()
    }
}

/// Typed window into raw native memory.
///
/// Copyable and untracked; validity is the caller's contract (a `ValuePtr`
/// taken from a live [`ParamBuffer`] or object body stays valid while that
/// owner is alive and unmoved). All accessors assert alignment.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ValuePtr(*mut u8);

impl ValuePtr {
    pub fn new(ptr: *mut u8) -> ValuePtr {
        ValuePtr(ptr)
    }

    pub fn null() -> ValuePtr {
        ValuePtr(std::ptr::null_mut())
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }

    pub fn addr(&self) -> usize {
        self.0 as usize
    }

    pub fn from_addr(addr: usize) -> ValuePtr {
        ValuePtr(addr as *mut u8)
    }

    pub fn offset(&self, bytes: usize) -> ValuePtr {
        debug_assert!(!self.is_null());
        ValuePtr(unsafe { self.0.add(bytes) })
    }

    fn check<T>(&self) {
        assert!(!self.is_null(), "access through null value pointer");
        assert_eq!(
            self.addr() % std::mem::align_of::<T>(),
            0,
            "misaligned access: {} requires {}-byte alignment",
            std::any::type_name::<T>(),
            std::mem::align_of::<T>()
        );
    }

    /// Reads a `Copy` value at this address.
    pub fn read<T: Copy>(&self) -> T {
        self.check::<T>();
        unsafe { *(self.0 as *const T) }
    }

    /// Writes a value at this address without dropping the previous bytes.
    pub fn write<T>(&self, value: T) {
        self.check::<T>();
        unsafe { std::ptr::write(self.0 as *mut T, value) };
    }

    /// Borrows the value at this address. The lifetime is the caller's
    /// claim: the underlying buffer must outlive the borrow.
    pub fn as_ref<'a, T>(&self) -> &'a T {
        self.check::<T>();
        unsafe { &*(self.0 as *const T) }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn as_mut<'a, T>(&self) -> &'a mut T {
        self.check::<T>();
        unsafe { &mut *(self.0 as *mut T) }
    }

    /// Runs `T`'s destructor on the bytes at this address.
    pub fn drop_in_place<T>(&self) {
        self.check::<T>();
        unsafe { std::ptr::drop_in_place(self.0 as *mut T) };
    }

    /// Raw byte copy, no destructor interaction.
    pub fn copy_bytes_from(&self, src: ValuePtr, len: usize) {
        assert!(!self.is_null() && !src.is_null());
        unsafe { std::ptr::copy_nonoverlapping(src.0, self.0, len) };
    }

    pub fn bytes(&self, len: usize) -> &[u8] {
        assert!(!self.is_null());
        unsafe { std::slice::from_raw_parts(self.0, len) }
    }
}

impl std::fmt::Debug for ValuePtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ValuePtr({:#x})", self.addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeroed_buffer_reads_zero() {
        let buf = ParamBuffer::zeroed(32, 8);
        assert_eq!(buf.ptr().read::<u64>(), 0);
        assert_eq!(buf.ptr().offset(24).read::<i32>(), 0);
    }

    #[test]
    fn typed_round_trip() {
        let buf = ParamBuffer::zeroed(16, 16);
        buf.ptr().write::<f64>(42.5);
        assert_eq!(buf.ptr().read::<f64>(), 42.5);
        buf.ptr().offset(8).write::<i32>(-7);
        assert_eq!(buf.ptr().offset(8).read::<i32>(), -7);
    }

    #[test]
    fn non_trivial_write_and_drop() {
        let buf = ParamBuffer::zeroed(
            std::mem::size_of::<String>(),
            std::mem::align_of::<String>(),
        );
        buf.ptr().write(String::from("hello"));
        assert_eq!(buf.ptr().as_ref::<String>(), "hello");
        buf.ptr().drop_in_place::<String>();
    }

    #[test]
    fn align_up_rounds() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(17, 16), 32);
    }

    #[test]
    #[should_panic(expected = "null value pointer")]
    fn null_access_asserts() {
        ValuePtr::null().read::<u32>();
    }
}
