//! The Value Marshaller: JSON tagged values in, native call-frame
//! bytes out, and back again for `out`/`inout` readback. Every
//! transient byte region this module allocates comes from the current
//! call's [`CallArena`] and must not escape it.

use crate::arena::CallArena;
use crate::callback::CallbackPool;
use crate::error::{ExecutorError, Result};
use crate::types::{parse_target_type, Primitive, StructDef, TypeRegistry, TypeTag};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde_json::{Map, Value};
use std::ffi::c_void;
use std::sync::Arc;

/// Direction of an argument, as carried by its descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
    InOut,
}

impl Direction {
    fn parse(s: Option<&str>) -> Direction {
        match s {
            Some("out") => Direction::Out,
            Some("inout") => Direction::InOut,
            _ => Direction::In,
        }
    }

    fn is_output(self) -> bool {
        matches!(self, Direction::Out | Direction::InOut)
    }
}

/// What to do, after the call returns, to re-encode one `out`/`inout`
/// argument's readback storage into the response's `out_params`.
enum OutBinding {
    Buffer { ptr: *mut u8, capacity: usize },
    Scalar { ptr: *mut u8, ty: TypeTag },
}

pub struct PendingOut {
    index: usize,
    binding: OutBinding,
}

/// One decoded argument: its ABI type, the address the call frame
/// should pass (into the arena), and how to read it back afterwards.
pub struct DecodedArgument {
    pub ffi_type: libffi::middle::Type,
    pub storage: *mut c_void,
    out: Option<PendingOut>,
}

/// Decodes every argument descriptor in `args`, in order, allocating
/// all transient storage from `arena`.
pub fn decode_arguments(
    args: &[Value],
    registry: &TypeRegistry,
    callbacks: &CallbackPool,
    arena: &CallArena,
) -> Result<Vec<DecodedArgument>> {
    args.iter()
        .enumerate()
        .map(|(index, descriptor)| decode_argument(index, descriptor, registry, callbacks, arena))
        .collect()
}

fn obj<'a>(value: &'a Value) -> Result<&'a Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| ExecutorError::MalformedArgument("argument descriptor must be an object".into()))
}

/// Resolves a value's own type tag (an argument's `type`, a pointer's
/// `target_type`, an inline pointer value's nested `type`) during
/// marshalling. Unlike a struct *definition*'s member types — where an
/// unresolvable name is `unknown_member_type` (§4.B) — an unresolvable
/// type tag on a value being marshalled is `unknown_type_tag` (§7).
fn resolve_value_type(registry: &TypeRegistry, type_tag: &str) -> Result<TypeTag> {
    registry
        .resolve(type_tag)
        .map_err(|_| ExecutorError::UnknownTypeTag(type_tag.to_string()))
}

fn decode_argument(
    index: usize,
    descriptor: &Value,
    registry: &TypeRegistry,
    callbacks: &CallbackPool,
    arena: &CallArena,
) -> Result<DecodedArgument> {
    let map = obj(descriptor)?;
    let type_tag = map
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ExecutorError::MissingField("type"))?;
    let direction = Direction::parse(map.get("direction").and_then(Value::as_str));
    let value = map.get("value");

    if type_tag == "buffer" {
        return decode_buffer_argument(index, map, direction, arena);
    }
    if type_tag == "pointer" {
        return decode_pointer_argument(index, map, direction, registry, callbacks, arena);
    }
    if type_tag == "callback" {
        let id = value
            .and_then(Value::as_str)
            .ok_or(ExecutorError::MissingField("value"))?;
        let code_ptr = callbacks.code_pointer(id)?;
        let slot = arena.alloc_zeroed(std::mem::size_of::<usize>());
        unsafe { (slot as *mut usize).write(code_ptr as usize) };
        return Ok(DecodedArgument {
            ffi_type: libffi::middle::Type::pointer(),
            storage: slot as *mut c_void,
            out: None,
        });
    }

    let ty = resolve_value_type(registry, type_tag)?;
    let ffi_type = crate::ffi_type::ffi_type_of(&ty);
    let slot = arena.alloc_zeroed(ty.size());
    if let Some(v) = value {
        decode_into(slot, &ty, v, registry, callbacks, arena)?;
    }
    Ok(DecodedArgument {
        ffi_type,
        storage: slot as *mut c_void,
        out: None,
    })
}

fn decode_buffer_argument(
    index: usize,
    map: &Map<String, Value>,
    direction: Direction,
    arena: &CallArena,
) -> Result<DecodedArgument> {
    let size = map
        .get("size")
        .and_then(Value::as_u64)
        .ok_or(ExecutorError::MissingField("size"))? as usize;
    let region = arena.alloc_zeroed(size);

    if direction != Direction::Out {
        if let Some(Value::String(b64)) = map.get("value") {
            let bytes = BASE64
                .decode(b64)
                .map_err(|e| ExecutorError::MalformedArgument(e.to_string()))?;
            if bytes.len() > size {
                return Err(ExecutorError::BufferOverflow);
            }
            unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), region, bytes.len()) };
        }
    }

    // A `buffer` argument is passed as the address of its own region
    // directly (an `unsigned char*` parameter), not a pointer-to-pointer.
    let out = direction.is_output().then(|| PendingOut {
        index,
        binding: OutBinding::Buffer {
            ptr: region,
            capacity: size,
        },
    });

    Ok(DecodedArgument {
        ffi_type: libffi::middle::Type::pointer(),
        storage: region as *mut c_void,
        out,
    })
}

fn decode_pointer_argument(
    index: usize,
    map: &Map<String, Value>,
    direction: Direction,
    registry: &TypeRegistry,
    callbacks: &CallbackPool,
    arena: &CallArena,
) -> Result<DecodedArgument> {
    let value = map.get("value");
    let target_type = map.get("target_type").and_then(Value::as_str);

    // Case 1: opaque machine word.
    if target_type.is_none() {
        let word = match value {
            Some(Value::Number(n)) => n
                .as_u64()
                .or_else(|| n.as_i64().map(|i| i as u64))
                .ok_or_else(|| ExecutorError::ValueOutOfRange("pointer".into()))?,
            Some(Value::Object(_)) => {
                // Case 2: `{type, value}` — a nested aggregate, passed by
                // address of an arena-allocated copy.
                return decode_pointer_to_inline_struct(map, registry, callbacks, arena);
            }
            None => 0,
            _ => return Err(ExecutorError::MalformedArgument("pointer value".into())),
        };
        let slot = arena.alloc_zeroed(std::mem::size_of::<usize>());
        unsafe { (slot as *mut usize).write(word as usize) };
        return Ok(DecodedArgument {
            ffi_type: libffi::middle::Type::pointer(),
            storage: slot as *mut c_void,
            out: None,
        });
    }

    let target_type = target_type.unwrap();
    let (base, is_array) = parse_target_type(target_type);
    let ty = resolve_value_type(registry, base)?;

    if is_array {
        let elements = value
            .and_then(Value::as_array)
            .ok_or_else(|| ExecutorError::MalformedArgument("array pointer value".into()))?;
        let stride = ty.size();
        let region = arena.alloc_zeroed(stride * elements.len());
        for (i, element) in elements.iter().enumerate() {
            let elem_ptr = unsafe { region.add(i * stride) };
            decode_into(elem_ptr, &ty, element, registry, callbacks, arena)?;
        }
        let ptr_slot = arena.alloc_zeroed(std::mem::size_of::<usize>());
        unsafe { (ptr_slot as *mut usize).write(region as usize) };
        return Ok(DecodedArgument {
            ffi_type: libffi::middle::Type::pointer(),
            storage: ptr_slot as *mut c_void,
            out: None,
        });
    }

    // Case 3/4: pointer to a single scalar or struct element, optionally
    // `out`/`inout`.
    let region = arena.alloc_zeroed(ty.size());
    if direction != Direction::Out {
        if let Some(v) = value {
            decode_into(region, &ty, v, registry, callbacks, arena)?;
        }
    }
    let ptr_slot = arena.alloc_zeroed(std::mem::size_of::<usize>());
    unsafe { (ptr_slot as *mut usize).write(region as usize) };

    let out = direction.is_output().then(|| PendingOut {
        index,
        binding: OutBinding::Scalar { ptr: region, ty: ty.clone() },
    });

    Ok(DecodedArgument {
        ffi_type: libffi::middle::Type::pointer(),
        storage: ptr_slot as *mut c_void,
        out,
    })
}

fn decode_pointer_to_inline_struct(
    map: &Map<String, Value>,
    registry: &TypeRegistry,
    callbacks: &CallbackPool,
    arena: &CallArena,
) -> Result<DecodedArgument> {
    let inline = map
        .get("value")
        .and_then(Value::as_object)
        .ok_or_else(|| ExecutorError::MalformedArgument("inline pointer value".into()))?;
    let type_name = inline
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ExecutorError::MissingField("type"))?;
    let inner_value = inline.get("value").ok_or(ExecutorError::MissingField("value"))?;
    let ty = resolve_value_type(registry, type_name)?;
    let region = arena.alloc_zeroed(ty.size());
    decode_into(region, &ty, inner_value, registry, callbacks, arena)?;
    let ptr_slot = arena.alloc_zeroed(std::mem::size_of::<usize>());
    unsafe { (ptr_slot as *mut usize).write(region as usize) };
    Ok(DecodedArgument {
        ffi_type: libffi::middle::Type::pointer(),
        storage: ptr_slot as *mut c_void,
        out: None,
    })
}

/// Writes `value` at `ptr`, which must point at `size_of(ty)` writable
/// bytes (an arena slot or a struct member's offset within one).
fn decode_into(
    ptr: *mut u8,
    ty: &TypeTag,
    value: &Value,
    registry: &TypeRegistry,
    callbacks: &CallbackPool,
    arena: &CallArena,
) -> Result<()> {
    match ty {
        TypeTag::Primitive(p) => decode_primitive(ptr, *p, value, callbacks, arena),
        TypeTag::Struct(def) => decode_struct(ptr, def, value, registry, callbacks, arena),
    }
}

fn decode_primitive(
    ptr: *mut u8,
    p: Primitive,
    value: &Value,
    callbacks: &CallbackPool,
    arena: &CallArena,
) -> Result<()> {
    use Primitive::*;
    macro_rules! int_range {
        ($t:ty) => {{
            let n = value
                .as_i64()
                .ok_or_else(|| ExecutorError::ValueOutOfRange(p.tag().to_string()))?;
            let v = <$t>::try_from(n).map_err(|_| ExecutorError::ValueOutOfRange(p.tag().to_string()))?;
            unsafe { (ptr as *mut $t).write_unaligned(v) };
        }};
    }
    macro_rules! uint_range {
        ($t:ty) => {{
            let n = value
                .as_u64()
                .ok_or_else(|| ExecutorError::ValueOutOfRange(p.tag().to_string()))?;
            let v = <$t>::try_from(n).map_err(|_| ExecutorError::ValueOutOfRange(p.tag().to_string()))?;
            unsafe { (ptr as *mut $t).write_unaligned(v) };
        }};
    }
    match p {
        Void => {}
        Int8 => int_range!(i8),
        Int16 => int_range!(i16),
        Int32 => int_range!(i32),
        Int64 => int_range!(i64),
        UInt8 => uint_range!(u8),
        UInt16 => uint_range!(u16),
        UInt32 => uint_range!(u32),
        UInt64 => uint_range!(u64),
        Bool => {
            let b = value
                .as_bool()
                .ok_or_else(|| ExecutorError::MalformedArgument("expected bool".into()))?;
            unsafe { (ptr as *mut u8).write(b as u8) };
        }
        Float => {
            let f = value
                .as_f64()
                .ok_or_else(|| ExecutorError::ValueOutOfRange("float".into()))? as f32;
            unsafe { (ptr as *mut f32).write_unaligned(f) };
        }
        Double => {
            let f = value
                .as_f64()
                .ok_or_else(|| ExecutorError::ValueOutOfRange("double".into()))?;
            unsafe { (ptr as *mut f64).write_unaligned(f) };
        }
        Pointer => {
            let word = value
                .as_u64()
                .ok_or_else(|| ExecutorError::ValueOutOfRange("pointer".into()))?;
            unsafe { (ptr as *mut usize).write_unaligned(word as usize) };
        }
        String => {
            let s = value
                .as_str()
                .ok_or_else(|| ExecutorError::InvalidString("expected string".into()))?;
            if s.as_bytes().contains(&0) {
                return Err(ExecutorError::InvalidString("embedded nul".into()));
            }
            let addr = arena.alloc_cstring(s);
            unsafe { (ptr as *mut usize).write_unaligned(addr as usize) };
        }
        Buffer => {
            return Err(ExecutorError::MalformedArgument(
                "buffer cannot appear as a nested value".into(),
            ))
        }
        Callback => {
            let id = value
                .as_str()
                .ok_or_else(|| ExecutorError::MalformedArgument("expected callback id".into()))?;
            let code_ptr = callbacks.code_pointer(id)?;
            unsafe { (ptr as *mut usize).write_unaligned(code_ptr as usize) };
        }
    }
    Ok(())
}

fn decode_struct(
    base: *mut u8,
    def: &Arc<StructDef>,
    value: &Value,
    registry: &TypeRegistry,
    callbacks: &CallbackPool,
    arena: &CallArena,
) -> Result<()> {
    let obj = value
        .as_object()
        .ok_or_else(|| ExecutorError::MalformedArgument(format!("{} requires an object", def.name)))?;
    for member in &def.members {
        let Some(v) = obj.get(&member.name) else {
            continue;
        };
        let member_ptr = unsafe { base.add(member.offset) };
        decode_into(member_ptr, &member.ty, v, registry, callbacks, arena)?;
    }
    Ok(())
}

// ---- Encoding -----------------------------------------------------

/// Encodes a value of `ty` read from `ptr` as `{"type": ..., "value":
/// ...}`, the tagged value form used throughout the wire protocol.
pub fn encode_tagged(ty: &TypeTag, ptr: *const u8) -> Result<Value> {
    let mut out = Map::new();
    out.insert("type".to_string(), Value::String(ty.name()));
    out.insert("value".to_string(), encode_typed(ty, ptr)?);
    Ok(Value::Object(out))
}

fn encode_typed(ty: &TypeTag, ptr: *const u8) -> Result<Value> {
    match ty {
        TypeTag::Primitive(p) => encode_primitive(*p, ptr),
        TypeTag::Struct(def) => encode_struct(def, ptr),
    }
}

fn encode_primitive(p: Primitive, ptr: *const u8) -> Result<Value> {
    use Primitive::*;
    let v = match p {
        Void => Value::Null,
        Int8 => Value::from(unsafe { (ptr as *const i8).read_unaligned() }),
        Int16 => Value::from(unsafe { (ptr as *const i16).read_unaligned() }),
        Int32 => Value::from(unsafe { (ptr as *const i32).read_unaligned() }),
        Int64 => Value::from(unsafe { (ptr as *const i64).read_unaligned() }),
        UInt8 => Value::from(unsafe { ptr.read() }),
        UInt16 => Value::from(unsafe { (ptr as *const u16).read_unaligned() }),
        UInt32 => Value::from(unsafe { (ptr as *const u32).read_unaligned() }),
        UInt64 => Value::from(unsafe { (ptr as *const u64).read_unaligned() }),
        Bool => Value::from(unsafe { ptr.read() } != 0),
        Float => Value::from(unsafe { (ptr as *const f32).read_unaligned() } as f64),
        Double => Value::from(unsafe { (ptr as *const f64).read_unaligned() }),
        Pointer => Value::from(unsafe { (ptr as *const usize).read_unaligned() } as u64),
        String => {
            let addr = unsafe { (ptr as *const usize).read_unaligned() } as *const std::os::raw::c_char;
            if addr.is_null() {
                Value::Null
            } else {
                let cstr = unsafe { std::ffi::CStr::from_ptr(addr) };
                Value::String(cstr.to_string_lossy().into_owned())
            }
        }
        Buffer => {
            return Err(ExecutorError::MalformedArgument(
                "buffer return/member values must use out_params encoding".into(),
            ))
        }
        Callback => Value::from(unsafe { (ptr as *const usize).read_unaligned() } as u64),
    };
    Ok(v)
}

fn encode_struct(def: &Arc<StructDef>, base: *const u8) -> Result<Value> {
    let mut obj = Map::new();
    for member in &def.members {
        let member_ptr = unsafe { base.add(member.offset) };
        obj.insert(member.name.clone(), encode_typed(&member.ty, member_ptr)?);
    }
    Ok(Value::Object(obj))
}

/// Encodes a `buffer` readback as base64.
pub fn encode_buffer(bytes: &[u8]) -> Value {
    Value::String(BASE64.encode(bytes))
}

/// After the call returns, re-encodes every `out`/`inout` argument into
/// the response's `out_params` array.
pub fn encode_out_params(decoded: &[DecodedArgument]) -> Result<Vec<Value>> {
    let mut out = Vec::new();
    for (index, arg) in decoded.iter().enumerate() {
        let Some(pending) = &arg.out else { continue };
        let mut entry = Map::new();
        entry.insert("index".to_string(), Value::from(index as u64));
        match &pending.binding {
            OutBinding::Buffer { ptr, capacity } => {
                let bytes = unsafe { crate::arena::read_bytes(*ptr, *capacity) };
                entry.insert("type".to_string(), Value::String("buffer".to_string()));
                entry.insert("value".to_string(), encode_buffer(&bytes));
            }
            OutBinding::Scalar { ptr, ty } => {
                entry.insert("type".to_string(), Value::String(ty.name()));
                entry.insert("value".to_string(), encode_typed(ty, *ptr)?);
            }
        }
        out.push(Value::Object(entry));
    }
    Ok(out)
}
