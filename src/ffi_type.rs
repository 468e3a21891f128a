//! Conversion from the registry's [`TypeTag`] to the `libffi`
//! `middle::Type` description used to build a `Cif` or a callback
//! signature.

use crate::types::{Primitive, TypeTag};
use libffi::middle::Type;

/// The ABI-level type to hand to `libffi` for a given tag. Strings,
/// buffers, pointers and callbacks are always passed as a machine
/// word (an address); only named aggregates get their own structure
/// layout built recursively so libffi can pass/return them by value.
pub fn ffi_type_of(tag: &TypeTag) -> Type {
    match tag {
        TypeTag::Primitive(p) => primitive_ffi_type(*p),
        TypeTag::Struct(def) => Type::structure(def.members.iter().map(|m| ffi_type_of(&m.ty))),
    }
}

fn primitive_ffi_type(p: Primitive) -> Type {
    use Primitive::*;
    match p {
        Void => Type::void(),
        Int8 => Type::i8(),
        UInt8 | Bool => Type::u8(),
        Int16 => Type::i16(),
        UInt16 => Type::u16(),
        Int32 => Type::i32(),
        UInt32 => Type::u32(),
        Int64 => Type::i64(),
        UInt64 => Type::u64(),
        Float => Type::f32(),
        Double => Type::f64(),
        Pointer | String | Buffer | Callback => Type::pointer(),
    }
}
