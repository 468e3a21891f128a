//! The Call Dispatcher: resolves a library symbol, builds a
//! `libffi` call interface from the declared argument/return types, and
//! performs the actual foreign call against arena-owned storage.

use crate::arena::CallArena;
use crate::callback::CallbackPool;
use crate::error::{ExecutorError, Result};
use crate::ffi_type::ffi_type_of;
use crate::library::LibraryRegistry;
use crate::types::{Primitive, StructDef, TypeRegistry, TypeTag};
use crate::value::{decode_arguments, encode_out_params, encode_tagged, DecodedArgument};
use libffi::low;
use libffi::middle::{Arg, Cif, CodePtr};
use serde_json::{Map, Value};
use std::ffi::c_void;
use std::sync::Arc;

pub struct CallRequest<'a> {
    pub library_id: &'a str,
    pub function_name: &'a str,
    pub return_type: &'a str,
    pub args: &'a [Value],
}

/// `call_function`: the one operation that actually crosses into
/// foreign code. Every byte it touches on the native side lives in a
/// fresh [`CallArena`], freed when this function returns.
pub fn call_function(
    request: CallRequest,
    types: &TypeRegistry,
    libraries: &LibraryRegistry,
    callbacks: &CallbackPool,
) -> Result<Value> {
    let (symbol, _call_guard) = libraries.resolve_symbol(request.library_id, request.function_name)?;
    let return_tag = types.resolve(request.return_type)?;

    let arena = CallArena::new();
    let decoded = decode_arguments(request.args, types, callbacks, &arena)?;

    let cif = Cif::new(
        decoded.iter().map(|d| d.ffi_type.clone()),
        ffi_type_of(&return_tag),
    );
    let code_ptr = CodePtr::from_ptr(symbol);

    let response_value = unsafe { invoke(&cif, code_ptr, &decoded, &return_tag, &arena) }?;

    let out_params = encode_out_params(&decoded)?;
    let mut envelope = Map::new();
    envelope.insert("return".to_string(), response_value);
    envelope.insert("out_params".to_string(), Value::Array(out_params));
    Ok(Value::Object(envelope))
}

/// Performs the call and encodes the result as a tagged value.
///
/// # Safety
/// `cif` must describe `code_ptr`'s real signature and every decoded
/// argument's storage must match that signature; this is exactly what
/// [`call_function`] arranges via the type registry and arena.
unsafe fn invoke(
    cif: &Cif,
    code_ptr: CodePtr,
    decoded: &[DecodedArgument],
    return_tag: &TypeTag,
    arena: &CallArena,
) -> Result<Value> {
    let call_args: Vec<Arg> = decoded
        .iter()
        .map(|d| Arg::new(&*(d.storage as *const u8)))
        .collect();

    macro_rules! call_as {
        ($t:ty) => {{
            let result: $t = cif.call(code_ptr, &call_args);
            let bytes = result.to_ne_bytes();
            encode_tagged(return_tag, bytes.as_ptr())?
        }};
    }

    let value = match return_tag {
        TypeTag::Primitive(Primitive::Void) => {
            let (): () = cif.call(code_ptr, &call_args);
            Value::Null
        }
        TypeTag::Primitive(Primitive::Int8) => call_as!(i8),
        TypeTag::Primitive(Primitive::UInt8) => call_as!(u8),
        TypeTag::Primitive(Primitive::Bool) => call_as!(u8),
        TypeTag::Primitive(Primitive::Int16) => call_as!(i16),
        TypeTag::Primitive(Primitive::UInt16) => call_as!(u16),
        TypeTag::Primitive(Primitive::Int32) => call_as!(i32),
        TypeTag::Primitive(Primitive::UInt32) => call_as!(u32),
        TypeTag::Primitive(Primitive::Int64) => call_as!(i64),
        TypeTag::Primitive(Primitive::UInt64) => call_as!(u64),
        TypeTag::Primitive(Primitive::Float) => call_as!(f32),
        TypeTag::Primitive(Primitive::Double) => call_as!(f64),
        TypeTag::Primitive(Primitive::Pointer)
        | TypeTag::Primitive(Primitive::String)
        | TypeTag::Primitive(Primitive::Callback) => call_as!(usize),
        TypeTag::Primitive(Primitive::Buffer) => {
            return Err(ExecutorError::InvocationFailed(
                "buffer is not a valid return type".into(),
            ))
        }
        TypeTag::Struct(def) => call_struct_return(code_ptr, decoded, return_tag, def, arena)?,
    };
    Ok(value)
}

/// Calls a function whose return type is a registry-defined aggregate.
///
/// `libffi::middle::Cif::call` is generic over a `CType`-implementing
/// return type, and `CType::reify()` is a static, type-level function —
/// it cannot describe a struct whose layout is only known at request
/// time, so that path can never carry an arbitrary registered struct
/// correctly. Instead this builds the call's `ffi_cif` directly from
/// the registry-derived argument/result `ffi_type`s and invokes via
/// `libffi::low::ffi_call`, which writes the return value through a
/// caller-supplied buffer sized from the cif's own result type — an
/// arena allocation of exactly `def.size` bytes, aligned to `def.align`.
///
/// # Safety
/// Same preconditions as [`invoke`]: `code_ptr` must be callable with
/// the signature implied by `decoded`'s argument types and `def`'s
/// layout.
unsafe fn call_struct_return(
    code_ptr: CodePtr,
    decoded: &[DecodedArgument],
    return_tag: &TypeTag,
    def: &Arc<StructDef>,
    arena: &CallArena,
) -> Result<Value> {
    let result_type = ffi_type_of(return_tag);
    let mut arg_raw_types: Vec<*mut low::ffi_type> =
        decoded.iter().map(|d| d.ffi_type.as_raw_ptr()).collect();

    let mut raw_cif: low::ffi_cif = std::mem::zeroed();
    low::prep_cif(
        &mut raw_cif,
        low::ffi_abi_FFI_DEFAULT_ABI,
        arg_raw_types.len(),
        result_type.as_raw_ptr(),
        arg_raw_types.as_mut_ptr(),
    )
    .map_err(|err| ExecutorError::SignatureBuildFailed(format!("{}: {:?}", def.name, err)))?;

    let result_ptr = arena.alloc_zeroed_aligned(def.size.max(1), def.align.max(1));
    let mut arg_ptrs: Vec<*mut c_void> = decoded.iter().map(|d| d.storage).collect();
    let fn_ptr: unsafe extern "C" fn() = std::mem::transmute(code_ptr.as_ptr());

    low::ffi_call(
        &mut raw_cif,
        Some(fn_ptr),
        result_ptr as *mut c_void,
        arg_ptrs.as_mut_ptr(),
    );

    encode_tagged(return_tag, result_ptr as *const u8)
}
