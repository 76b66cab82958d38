//! Property descriptors.
//!
//! One descriptor per reflected field, function parameter, or container
//! element. A descriptor knows the field's kind, offset and flags, and owns
//! the conversions in both directions plus the native value operations
//! (initialize/destroy/copy/identical/hash) at any address.

use std::rc::Rc;

use log::warn;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::context::BridgeContext;
use crate::error::{ConversionError, Result};
use crate::host::memory::ValuePtr;
use crate::host::object::ObjectId;
use crate::host::reflection::{HostReflection, NativeField, NativeKind, PropFlags};
use crate::script::value::ScriptValue;
use crate::userdata::{ContainerUserdata, OpaqueHandle, StructUserdata};

/// Integer tag of a property kind; stable across the bridge boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PropertyTag {
    Int8 = 1,
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
    Str,
    Name,
    Text,
    Object,
    Interface,
    Struct,
    Array,
    Set,
    Map,
    Delegate,
    Multicast,
    Enum,
}

pub struct PropertyDesc {
    name: String,
    kind: NativeKind,
    offset: usize,
    size: usize,
    flags: PropFlags,
    pod: bool,
}

impl PropertyDesc {
    /// Descriptor for a class field or function parameter.
    pub fn new(refl: &HostReflection, field: &NativeField) -> PropertyDesc {
        let (size, _) = refl.kind_layout(&field.kind);
        PropertyDesc {
            name: field.name.clone(),
            kind: field.kind.clone(),
            offset: field.offset,
            size,
            flags: field.flags,
            pod: refl.kind_is_pod(&field.kind),
        }
    }

    /// Offset-less descriptor for a container element.
    pub fn inline(refl: &HostReflection, kind: NativeKind) -> PropertyDesc {
        let (size, _) = refl.kind_layout(&kind);
        PropertyDesc {
            name: String::new(),
            kind: kind.clone(),
            offset: 0,
            size,
            flags: PropFlags::empty(),
            pod: refl.kind_is_pod(&kind),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &NativeKind {
        &self.kind
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn flags(&self) -> PropFlags {
        self.flags
    }

    pub fn tag(&self) -> PropertyTag {
        match &self.kind {
            NativeKind::Int8 => PropertyTag::Int8,
            NativeKind::Int16 => PropertyTag::Int16,
            NativeKind::Int32 => PropertyTag::Int32,
            NativeKind::Int64 => PropertyTag::Int64,
            NativeKind::UInt8 => PropertyTag::UInt8,
            NativeKind::UInt16 => PropertyTag::UInt16,
            NativeKind::UInt32 => PropertyTag::UInt32,
            NativeKind::UInt64 => PropertyTag::UInt64,
            NativeKind::Float => PropertyTag::Float,
            NativeKind::Double => PropertyTag::Double,
            NativeKind::Bool => PropertyTag::Bool,
            NativeKind::Str => PropertyTag::Str,
            NativeKind::Name => PropertyTag::Name,
            NativeKind::Text => PropertyTag::Text,
            NativeKind::Object(_) => PropertyTag::Object,
            NativeKind::Interface(_) => PropertyTag::Interface,
            NativeKind::Struct(_) => PropertyTag::Struct,
            NativeKind::Array(_) => PropertyTag::Array,
            NativeKind::Set(_) => PropertyTag::Set,
            NativeKind::Map(..) => PropertyTag::Map,
            NativeKind::Delegate(_) => PropertyTag::Delegate,
            NativeKind::Multicast(_) => PropertyTag::Multicast,
            NativeKind::Enum(_) => PropertyTag::Enum,
        }
    }

    pub fn is_parameter(&self) -> bool {
        self.flags.contains(PropFlags::PARM)
    }

    pub fn is_out_parameter(&self) -> bool {
        self.flags.contains(PropFlags::OUT_PARM) && !self.flags.contains(PropFlags::RETURN_PARM)
    }

    pub fn is_const_parameter(&self) -> bool {
        self.flags.contains(PropFlags::CONST_PARM)
    }

    pub fn is_return_parameter(&self) -> bool {
        self.flags.contains(PropFlags::RETURN_PARM)
    }

    pub fn is_reference_parameter(&self) -> bool {
        self.flags.contains(PropFlags::REFERENCE_PARM)
    }

    /// Raw byte copies suffice and no destructor ever runs.
    pub fn is_pod(&self) -> bool {
        self.pod
    }

    pub fn is_trivially_destructible(&self) -> bool {
        self.pod
    }

    // ---- native value operations ---------------------------------------

    // Every operation here addresses the containing object; the field
    // offset is applied internally.

    pub fn initialize(&self, refl: &HostReflection, container: ValuePtr) {
        refl.init_value(&self.kind, container.offset(self.offset));
    }

    pub fn destroy(&self, refl: &HostReflection, container: ValuePtr) {
        if !self.pod {
            refl.destroy_value(&self.kind, container.offset(self.offset));
        }
    }

    pub fn copy(&self, refl: &HostReflection, dst: ValuePtr, src: ValuePtr) {
        refl.copy_value(&self.kind, dst.offset(self.offset), src.offset(self.offset));
    }

    pub fn identical(&self, refl: &HostReflection, a: ValuePtr, b: ValuePtr) -> bool {
        refl.values_identical(&self.kind, a.offset(self.offset), b.offset(self.offset))
    }

    pub fn hash(&self, refl: &HostReflection, container: ValuePtr) -> u32 {
        refl.hash_value(&self.kind, container.offset(self.offset))
    }

    // ---- script conversions --------------------------------------------

    /// Cheap pre-marshal shape check; the caller logs the mismatch with
    /// function name and parameter index.
    pub fn check_value(&self, value: &ScriptValue) -> std::result::Result<(), ConversionError> {
        let ok = match &self.kind {
            NativeKind::Bool => true,
            NativeKind::Int8
            | NativeKind::Int16
            | NativeKind::Int32
            | NativeKind::Int64
            | NativeKind::UInt8
            | NativeKind::UInt16
            | NativeKind::UInt32
            | NativeKind::UInt64 => value.as_int().is_some(),
            NativeKind::Enum(_) => value.as_int().is_some() || value.as_str().is_some(),
            NativeKind::Float | NativeKind::Double => value.as_float().is_some(),
            NativeKind::Str | NativeKind::Text | NativeKind::Name => {
                value.as_str().is_some() || value.as_float().is_some()
            }
            NativeKind::Object(_) | NativeKind::Interface(_) => {
                value.is_nil() || value.as_userdata().is_some_and(|u| u.is_two_level())
            }
            NativeKind::Struct(_) => value
                .as_userdata()
                .is_some_and(|u| u.as_struct().is_some()),
            NativeKind::Array(_)
            | NativeKind::Set(_)
            | NativeKind::Map(..)
            | NativeKind::Delegate(_)
            | NativeKind::Multicast(_) => {
                value.as_userdata().is_some_and(|u| u.is_container())
            }
        };
        if ok {
            Ok(())
        } else {
            Err(ConversionError::type_mismatch(
                self.expected_name(),
                value.type_name(),
            ))
        }
    }

    fn expected_name(&self) -> &'static str {
        match &self.kind {
            NativeKind::Bool => "boolean",
            NativeKind::Float | NativeKind::Double | NativeKind::Enum(_) => "number",
            NativeKind::Str | NativeKind::Text | NativeKind::Name => "string",
            NativeKind::Object(_) | NativeKind::Interface(_) => "object",
            NativeKind::Struct(_) => "struct userdata",
            NativeKind::Array(_) | NativeKind::Set(_) | NativeKind::Map(..) => "container",
            NativeKind::Delegate(_) | NativeKind::Multicast(_) => "delegate",
            _ => "integer",
        }
    }

    /// Converts the native value at `addr` into a script value. Object
    /// kinds register with the referencer; containers come from the
    /// per-address handle cache.
    pub fn to_script(&self, ctx: &mut BridgeContext, addr: ValuePtr) -> Result<ScriptValue> {
        let value = match &self.kind {
            NativeKind::Int8 => ScriptValue::Int(addr.read::<i8>() as i64),
            NativeKind::Int16 => ScriptValue::Int(addr.read::<i16>() as i64),
            NativeKind::Int32 => ScriptValue::Int(addr.read::<i32>() as i64),
            NativeKind::Int64 => ScriptValue::Int(addr.read::<i64>()),
            NativeKind::UInt8 => ScriptValue::Int(addr.read::<u8>() as i64),
            NativeKind::UInt16 => ScriptValue::Int(addr.read::<u16>() as i64),
            NativeKind::UInt32 => ScriptValue::Int(addr.read::<u32>() as i64),
            NativeKind::UInt64 => ScriptValue::Int(addr.read::<u64>() as i64),
            NativeKind::Enum(_) => ScriptValue::Int(addr.read::<i64>()),
            NativeKind::Float => ScriptValue::Float(addr.read::<f32>() as f64),
            NativeKind::Double => ScriptValue::Float(addr.read::<f64>()),
            NativeKind::Bool => ScriptValue::Bool(addr.read::<bool>()),
            NativeKind::Str | NativeKind::Text => ScriptValue::str(addr.as_ref::<String>()),
            NativeKind::Name => {
                let id = addr.read::<crate::host::reflection::NameId>();
                ScriptValue::str(ctx.reflection().resolve_name(id))
            }
            NativeKind::Object(_) | NativeKind::Interface(_) => {
                match addr.read::<Option<ObjectId>>() {
                    Some(id) if ctx.heap().is_valid(id) => {
                        ScriptValue::Userdata(ctx.wrap_object(id))
                    }
                    _ => ScriptValue::Nil,
                }
            }
            NativeKind::Struct(type_key) => {
                let (size, align) = ctx.reflection().kind_layout(&self.kind);
                let ud = StructUserdata::alloc(*type_key, size, align);
                ctx.reflection().init_value(&self.kind, ud.ptr());
                ctx.reflection().copy_value(&self.kind, ud.ptr(), addr);
                ScriptValue::Userdata(OpaqueHandle::strukt(Rc::new(ud)))
            }
            NativeKind::Array(elem) | NativeKind::Set(elem) => {
                let elem = (**elem).clone();
                let handle = ctx.wrap_container(addr, |refl| {
                    ContainerUserdata::new(addr, Rc::new(PropertyDesc::inline(refl, elem)), None)
                });
                ScriptValue::Userdata(handle)
            }
            NativeKind::Map(key, value) => {
                let (key, value) = ((**key).clone(), (**value).clone());
                let handle = ctx.wrap_container(addr, |refl| {
                    ContainerUserdata::new(
                        addr,
                        Rc::new(PropertyDesc::inline(refl, key)),
                        Some(Rc::new(PropertyDesc::inline(refl, value))),
                    )
                });
                ScriptValue::Userdata(handle)
            }
            NativeKind::Delegate(signature) | NativeKind::Multicast(signature) => {
                let signature = *signature;
                let kind = self.kind.clone();
                let handle = ctx.wrap_container(addr, |refl| {
                    ContainerUserdata::new(addr, Rc::new(PropertyDesc::inline(refl, kind)), None)
                });
                ctx.delegates_mut().associate_slot(addr, signature);
                ScriptValue::Userdata(handle)
            }
        };
        Ok(value)
    }

    /// Writes `value` into the native slot at `addr`. Returns true when the
    /// write left non-trivial state the caller must destroy.
    pub fn from_script(
        &self,
        ctx: &mut BridgeContext,
        addr: ValuePtr,
        value: &ScriptValue,
    ) -> Result<bool> {
        match &self.kind {
            NativeKind::Int8 => addr.write(self.to_signed::<1>(value)? as i8),
            NativeKind::Int16 => addr.write(self.to_signed::<2>(value)? as i16),
            NativeKind::Int32 => addr.write(self.to_signed::<4>(value)? as i32),
            NativeKind::Int64 => addr.write(self.to_signed::<8>(value)?),
            NativeKind::UInt8 => addr.write(self.to_unsigned::<1>(value)? as u8),
            NativeKind::UInt16 => addr.write(self.to_unsigned::<2>(value)? as u16),
            NativeKind::UInt32 => addr.write(self.to_unsigned::<4>(value)? as u32),
            NativeKind::UInt64 => addr.write(self.to_unsigned::<8>(value)?),
            NativeKind::Float => {
                let v = value
                    .as_float()
                    .ok_or_else(|| ConversionError::type_mismatch("number", value.type_name()))?;
                addr.write(v as f32);
            }
            NativeKind::Double => {
                let v = value
                    .as_float()
                    .ok_or_else(|| ConversionError::type_mismatch("number", value.type_name()))?;
                addr.write(v);
            }
            NativeKind::Bool => addr.write(value.truthy()),
            NativeKind::Str | NativeKind::Text => {
                let s = coerce_str(value)?;
                *addr.as_mut::<String>() = s;
                return Ok(true);
            }
            NativeKind::Name => {
                let s = coerce_str(value)?;
                let id = ctx.reflection_mut().intern_name(&s);
                addr.write(id);
            }
            NativeKind::Enum(enum_key) => {
                let v = match value {
                    ScriptValue::Str(s) => {
                        let e = ctx.reflection().enum_by_key(*enum_key).ok_or(
                            crate::error::BridgeError::StaleDescriptor { what: "enum" },
                        )?;
                        e.value_of(s).ok_or_else(|| ConversionError::UnknownEnumEntry {
                            enum_name: e.name.clone(),
                            entry: s.to_string(),
                        })?
                    }
                    other => other.as_int().ok_or_else(|| {
                        ConversionError::type_mismatch("number", other.type_name())
                    })?,
                };
                addr.write(v);
            }
            NativeKind::Object(class) | NativeKind::Interface(class) => {
                let id = self.object_from_script(ctx, *class, value)?;
                addr.write(id);
            }
            NativeKind::Struct(type_key) => {
                let ud = value
                    .as_userdata()
                    .and_then(|u| u.as_struct())
                    .ok_or_else(|| self.struct_mismatch(ctx, *type_key))?;
                if ud.type_key() != *type_key {
                    return Err(self.struct_mismatch(ctx, *type_key).into());
                }
                ctx.reflection().copy_value(&self.kind, addr, ud.ptr());
                return Ok(!self.pod);
            }
            NativeKind::Array(_)
            | NativeKind::Set(_)
            | NativeKind::Map(..)
            | NativeKind::Delegate(_)
            | NativeKind::Multicast(_) => {
                let src = value
                    .as_userdata()
                    .and_then(|u| u.as_container())
                    .and_then(|c| c.resolve())
                    .ok_or_else(|| {
                        ConversionError::type_mismatch(self.expected_name(), value.type_name())
                    })?;
                ctx.reflection().copy_value(&self.kind, addr, src);
                return Ok(!self.pod);
            }
        }
        Ok(false)
    }

    fn to_signed<const BYTES: u32>(&self, value: &ScriptValue) -> Result<i64> {
        let v = value
            .as_int()
            .ok_or_else(|| ConversionError::type_mismatch("integer", value.type_name()))?;
        if BYTES < 8 {
            let bits = BYTES * 8;
            let min = -(1i64 << (bits - 1));
            let max = (1i64 << (bits - 1)) - 1;
            if v < min || v > max {
                return Err(ConversionError::integer_overflow(v, int_name::<BYTES>(true)).into());
            }
        }
        Ok(v)
    }

    fn to_unsigned<const BYTES: u32>(&self, value: &ScriptValue) -> Result<u64> {
        let v = value
            .as_int()
            .ok_or_else(|| ConversionError::type_mismatch("integer", value.type_name()))?;
        if v < 0 {
            return Err(ConversionError::integer_overflow(v, int_name::<BYTES>(false)).into());
        }
        if BYTES < 8 {
            let max = (1i64 << (BYTES * 8)) - 1;
            if v > max {
                return Err(ConversionError::integer_overflow(v, int_name::<BYTES>(false)).into());
            }
        }
        Ok(v as u64)
    }

    fn object_from_script(
        &self,
        ctx: &BridgeContext,
        class: crate::host::reflection::TypeKey,
        value: &ScriptValue,
    ) -> Result<Option<ObjectId>> {
        let id = match value {
            ScriptValue::Nil => return Ok(None),
            ScriptValue::Userdata(u) if u.is_two_level() => match u.object_id() {
                Some(id) => id,
                // Stale handle degrades to null rather than failing the call.
                None => return Ok(None),
            },
            other => {
                return Err(
                    ConversionError::type_mismatch("object", other.type_name()).into(),
                );
            }
        };
        let Some(actual) = ctx.heap().class_of(id) else {
            return Ok(None);
        };
        let compatible = match &self.kind {
            NativeKind::Interface(_) => ctx.reflection().class_implements(actual, class),
            _ => ctx.reflection().is_a(actual, class),
        };
        if !compatible {
            let expected = ctx
                .reflection()
                .class(class)
                .map(|c| c.name.clone())
                .unwrap_or_default();
            warn!("object of wrong class passed where {expected} was expected");
            return Err(ConversionError::null_object("object").into());
        }
        Ok(Some(id))
    }

    fn struct_mismatch(
        &self,
        ctx: &BridgeContext,
        type_key: crate::host::reflection::TypeKey,
    ) -> ConversionError {
        let expected = ctx
            .reflection()
            .class(type_key)
            .map(|c| c.name.clone())
            .unwrap_or_default();
        ConversionError::struct_mismatch(expected)
    }

    /// Copies the native value at `src` back into the storage an argument
    /// userdata points at (mutation in place for non-const reference
    /// parameters). Returns false for kinds with no addressable script-side
    /// storage; the caller pushes the value instead.
    pub fn copy_back(&self, ctx: &mut BridgeContext, src: ValuePtr, target: &ScriptValue) -> bool {
        match (&self.kind, target) {
            (NativeKind::Struct(type_key), ScriptValue::Userdata(u)) => match u.as_struct() {
                Some(ud) if ud.type_key() == *type_key => {
                    ctx.reflection().copy_value(&self.kind, ud.ptr(), src);
                    true
                }
                _ => false,
            },
            (
                NativeKind::Array(_) | NativeKind::Set(_) | NativeKind::Map(..),
                ScriptValue::Userdata(u),
            ) => match u.as_container().and_then(|c| c.resolve()) {
                Some(dst) => {
                    ctx.reflection().copy_value(&self.kind, dst, src);
                    true
                }
                None => false,
            },
            _ => false,
        }
    }

    // ---- offset-applying convenience ------------------------------------

    pub fn get_value(&self, ctx: &mut BridgeContext, container: ValuePtr) -> Result<ScriptValue> {
        self.to_script(ctx, container.offset(self.offset))
    }

    pub fn set_value(
        &self,
        ctx: &mut BridgeContext,
        container: ValuePtr,
        value: &ScriptValue,
    ) -> Result<bool> {
        self.from_script(ctx, container.offset(self.offset), value)
    }
}

fn coerce_str(value: &ScriptValue) -> Result<String> {
    match value {
        ScriptValue::Str(s) => Ok(s.to_string()),
        ScriptValue::Int(v) => Ok(v.to_string()),
        ScriptValue::Float(v) => Ok(v.to_string()),
        other => Err(ConversionError::type_mismatch("string", other.type_name()).into()),
    }
}

fn int_name<const BYTES: u32>(signed: bool) -> &'static str {
    match (BYTES, signed) {
        (1, true) => "i8",
        (2, true) => "i16",
        (4, true) => "i32",
        (8, true) => "i64",
        (1, false) => "u8",
        (2, false) => "u16",
        (4, false) => "u32",
        _ => "u64",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::ParamBuffer;
    use crate::host::reflection::{ClassBuilder, HostReflection};

    fn desc(refl: &HostReflection, kind: NativeKind) -> PropertyDesc {
        PropertyDesc::inline(refl, kind)
    }

    #[test]
    fn tag_round_trips_through_num_enum() {
        let refl = HostReflection::new();
        let d = desc(&refl, NativeKind::Double);
        let raw: u8 = d.tag().into();
        assert_eq!(PropertyTag::try_from(raw).unwrap(), PropertyTag::Double);
    }

    #[test]
    fn parameter_predicates_from_flags() {
        let refl = HostReflection::new();
        let field = NativeField {
            name: "Out".into(),
            kind: NativeKind::Int32,
            offset: 0,
            flags: PropFlags::PARM | PropFlags::OUT_PARM | PropFlags::REFERENCE_PARM,
        };
        let d = PropertyDesc::new(&refl, &field);
        assert!(d.is_parameter());
        assert!(d.is_out_parameter());
        assert!(d.is_reference_parameter());
        assert!(!d.is_return_parameter());
        assert!(!d.is_const_parameter());
    }

    #[test]
    fn value_ops_apply_the_field_offset() {
        let refl = HostReflection::new();
        let field = NativeField {
            name: "B".into(),
            kind: NativeKind::Int32,
            offset: 4,
            flags: PropFlags::empty(),
        };
        let d = PropertyDesc::new(&refl, &field);
        let a = ParamBuffer::zeroed(8, 4);
        let b = ParamBuffer::zeroed(8, 4);
        a.ptr().offset(4).write::<i32>(7);
        b.ptr().offset(4).write::<i32>(7);
        // Bytes outside the field must not influence the comparison.
        a.ptr().write::<i32>(1);
        assert!(d.identical(&refl, a.ptr(), b.ptr()));
        assert_eq!(d.hash(&refl, a.ptr()), d.hash(&refl, b.ptr()));
        b.ptr().offset(4).write::<i32>(8);
        assert!(!d.identical(&refl, a.ptr(), b.ptr()));
    }

    #[test]
    fn pod_detection_covers_nested_structs() {
        let mut refl = HostReflection::new();
        let pod = refl.register_class(
            ClassBuilder::strukt("Vec3")
                .field("X", NativeKind::Float)
                .field("Y", NativeKind::Float)
                .field("Z", NativeKind::Float),
        );
        let stringy = refl.register_class(
            ClassBuilder::strukt("Labeled")
                .field("Pos", NativeKind::Struct(pod))
                .field("Label", NativeKind::Str),
        );
        assert!(desc(&refl, NativeKind::Struct(pod)).is_pod());
        assert!(!desc(&refl, NativeKind::Struct(stringy)).is_pod());
        assert!(!desc(&refl, NativeKind::Array(Box::new(NativeKind::Int32))).is_pod());
    }

    #[test]
    fn check_value_shapes() {
        let refl = HostReflection::new();
        assert!(desc(&refl, NativeKind::Int32)
            .check_value(&ScriptValue::Int(5))
            .is_ok());
        assert!(desc(&refl, NativeKind::Int32)
            .check_value(&ScriptValue::str("x"))
            .is_err());
        assert!(desc(&refl, NativeKind::Bool)
            .check_value(&ScriptValue::Nil)
            .is_ok());
        assert!(desc(&refl, NativeKind::Str)
            .check_value(&ScriptValue::Int(3))
            .is_ok());
    }
}
