//! The Callback Trampoline Pool turns a JSON-described function
//! signature into a real, callable C function pointer. Native code that
//! invokes one of these pointers causes an `invoke_callback` event to
//! be written back to the owning connection; no value is returned to
//! the caller beyond the ABI-mandated `void`.
//!
//! Built the same way the dispatcher's forward calls are (`libffi`
//! `middle::Cif`/`Closure`), mirrored from the trampoline pattern in
//! the Deno FFI extension: a generic `extern "C"` entry point reads its
//! untyped `*const *const c_void` argument array against a shape table
//! captured in the closure's userdata.

use crate::error::{ExecutorError, Result};
use libffi::low::ffi_cif;
use libffi::middle::{Cif, Closure, CodePtr, Type};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::ffi::{c_void, CStr};
use std::os::raw::c_char;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// How to read one argument out of a fired callback's raw frame.
#[derive(Debug, Clone)]
pub enum ArgShape {
    Primitive(crate::types::Primitive),
    /// `{"type": "buffer_ptr", "size_arg_index": n}` — length taken
    /// from another argument at call time, read back as `size_arg_type`
    /// (the referenced argument's own declared integer primitive).
    BufferPtrSized {
        size_arg_index: usize,
        size_arg_type: crate::types::Primitive,
    },
    /// `{"type": "buffer_ptr", "fixed_size": n}` — a constant length.
    BufferPtrFixed { fixed_size: usize },
}

/// An `ArgShape` still missing the sibling-argument lookup that only a
/// full signature, not one descriptor in isolation, can resolve.
enum UnresolvedArgShape {
    Primitive(crate::types::Primitive),
    BufferPtrSized { size_arg_index: usize },
    BufferPtrFixed { fixed_size: usize },
}

impl UnresolvedArgShape {
    fn from_json(value: &Value) -> Result<UnresolvedArgShape> {
        if let Some(tag) = value.as_str() {
            let p = crate::types::Primitive::from_tag(tag)
                .ok_or_else(|| ExecutorError::UnsupportedCallbackShape(tag.to_string()))?;
            return Ok(UnresolvedArgShape::Primitive(p));
        }
        let obj = value
            .as_object()
            .ok_or_else(|| ExecutorError::UnsupportedCallbackShape("argument shape".into()))?;
        match obj.get("type").and_then(Value::as_str) {
            Some("buffer_ptr") => {
                if let Some(idx) = obj.get("size_arg_index").and_then(Value::as_u64) {
                    Ok(UnresolvedArgShape::BufferPtrSized {
                        size_arg_index: idx as usize,
                    })
                } else if let Some(size) = obj.get("fixed_size").and_then(Value::as_u64) {
                    Ok(UnresolvedArgShape::BufferPtrFixed {
                        fixed_size: size as usize,
                    })
                } else {
                    Err(ExecutorError::UnsupportedCallbackShape(
                        "buffer_ptr needs size_arg_index or fixed_size".into(),
                    ))
                }
            }
            Some("pointer") => Ok(UnresolvedArgShape::Primitive(crate::types::Primitive::Pointer)),
            Some("string") => Ok(UnresolvedArgShape::Primitive(crate::types::Primitive::String)),
            Some(other) => Err(ExecutorError::UnsupportedCallbackShape(other.to_string())),
            None => Err(ExecutorError::MissingField("type")),
        }
    }
}

/// Parses a callback's whole `args_type` array. A `buffer_ptr` entry's
/// `size_arg_index` is resolved against its sibling's own declared
/// primitive here, at registration time, rather than guessed at the
/// width of the pointed-to call frame when the callback actually fires.
pub fn parse_arg_shapes(values: &[Value]) -> Result<Vec<ArgShape>> {
    let unresolved = values
        .iter()
        .map(UnresolvedArgShape::from_json)
        .collect::<Result<Vec<_>>>()?;

    unresolved
        .iter()
        .map(|shape| match shape {
            UnresolvedArgShape::Primitive(p) => Ok(ArgShape::Primitive(*p)),
            UnresolvedArgShape::BufferPtrFixed { fixed_size } => {
                Ok(ArgShape::BufferPtrFixed { fixed_size: *fixed_size })
            }
            UnresolvedArgShape::BufferPtrSized { size_arg_index } => {
                let size_arg_type = match unresolved.get(*size_arg_index) {
                    Some(UnresolvedArgShape::Primitive(p)) if p.is_integer() => *p,
                    _ => {
                        return Err(ExecutorError::UnsupportedCallbackShape(format!(
                            "size_arg_index {size_arg_index} must reference an integer argument"
                        )))
                    }
                };
                Ok(ArgShape::BufferPtrSized {
                    size_arg_index: *size_arg_index,
                    size_arg_type,
                })
            }
        })
        .collect()
}

impl ArgShape {
    fn ffi_type(&self) -> Type {
        match self {
            ArgShape::Primitive(p) => crate::ffi_type::ffi_type_of(&crate::types::TypeTag::Primitive(*p)),
            ArgShape::BufferPtrSized { .. } | ArgShape::BufferPtrFixed { .. } => Type::pointer(),
        }
    }
}

/// Sink a fired callback's event is written to. Implemented by the
/// connection that registered it.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &str, payload: Value);
}

struct CallbackContext {
    id: String,
    shapes: Vec<ArgShape>,
    sink: Arc<dyn EventSink>,
    in_flight: Arc<AtomicUsize>,
}

struct CallbackEntry {
    // Keeps the closure's executable trampoline page alive; never read
    // directly again once `code_ptr` has been handed out.
    _closure: Closure<'static>,
    code_ptr: CodePtr,
    context: *mut CallbackContext,
    in_flight: Arc<AtomicUsize>,
    /// The connection this handle belongs to, kept alongside the
    /// context copy so disconnect cleanup can find
    /// every handle a worker owns without reaching into the context.
    owner: Arc<dyn EventSink>,
}

// SAFETY: `CallbackEntry` is only ever touched behind the pool's lock;
// the raw `context` pointer is never aliased mutably while shared.
unsafe impl Send for CallbackEntry {}
unsafe impl Sync for CallbackEntry {}

/// Process-wide table of live callback trampolines, keyed by the id
/// minted on `register_callback`.
#[derive(Default)]
pub struct CallbackPool {
    entries: RwLock<HashMap<String, CallbackEntry>>,
}

impl CallbackPool {
    pub fn new() -> Self {
        CallbackPool {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// `register_callback(signature)`: builds a `Cif` for
    /// `(shapes) -> void`, boxes a context describing how to decode a
    /// fired call's raw frame, and builds an FFI closure bound to the
    /// generic trampoline. Returns the new callback's id.
    pub fn register(&self, shapes: Vec<ArgShape>, sink: Arc<dyn EventSink>) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let in_flight = Arc::new(AtomicUsize::new(0));

        let context = Box::new(CallbackContext {
            id: id.clone(),
            shapes: shapes.clone(),
            sink: sink.clone(),
            in_flight: in_flight.clone(),
        });
        let context_ptr = Box::into_raw(context);

        let cif = Cif::new(shapes.iter().map(ArgShape::ffi_type), Type::void());
        // SAFETY: `context_ptr` stays alive for exactly as long as this
        // entry does; it is freed in `unregister` after the closure
        // (which borrows it) is dropped.
        let closure = unsafe { Closure::new(cif, trampoline, &*context_ptr) };
        let code_ptr = closure.code_ptr();
        // Extend the closure's borrow to 'static: it is owned by this
        // pool and dropped (which invalidates `code_ptr`) only when the
        // entry is removed in `unregister`.
        let closure: Closure<'static> = unsafe { std::mem::transmute(closure) };

        self.entries.write().insert(
            id.clone(),
            CallbackEntry {
                _closure: closure,
                code_ptr,
                context: context_ptr,
                in_flight,
                owner: sink,
            },
        );
        Ok(id)
    }

    /// `unregister_callback(id)`: refuses while the trampoline
    /// is actively firing an event, to avoid freeing its context out
    /// from under an in-flight invocation.
    pub fn unregister(&self, id: &str) -> Result<()> {
        let mut entries = self.entries.write();
        let entry = entries
            .get(id)
            .ok_or_else(|| ExecutorError::CallbackNotFound(id.to_string()))?;
        if entry.in_flight.load(Ordering::SeqCst) > 0 {
            return Err(ExecutorError::CallbackInUse(id.to_string()));
        }
        let entry = entries.remove(id).unwrap();
        drop(entry._closure);
        // SAFETY: no invocation is in flight (checked above) and the
        // closure borrowing this context has just been dropped.
        unsafe { drop(Box::from_raw(entry.context)) };
        Ok(())
    }

    /// Releases every handle owned by `owner`, e.g. when its connection
    /// disconnects. A handle whose trampoline happens to be firing at
    /// that exact moment is left in place rather than freed out from
    /// under it — best-effort cleanup.
    pub fn release_owned_by(&self, owner: &Arc<dyn EventSink>) {
        let ids: Vec<String> = {
            let entries = self.entries.read();
            entries
                .iter()
                .filter(|(_, entry)| Arc::ptr_eq(&entry.owner, owner))
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in ids {
            if let Err(err) = self.unregister(&id) {
                log::warn!("leaving callback {id} registered on disconnect: {err}");
            }
        }
    }

    /// The executable address to pass as a `callback`-typed argument's
    /// value.
    pub fn code_pointer(&self, id: &str) -> Result<*const c_void> {
        let entries = self.entries.read();
        let entry = entries
            .get(id)
            .ok_or_else(|| ExecutorError::CallbackNotFound(id.to_string()))?;
        Ok(entry.code_ptr.as_fun() as *const c_void)
    }
}

unsafe extern "C" fn trampoline(
    _cif: &ffi_cif,
    _result: &mut c_void,
    args: *const *const c_void,
    context: &CallbackContext,
) {
    context.in_flight.fetch_add(1, Ordering::SeqCst);
    let args = std::slice::from_raw_parts(args, context.shapes.len());
    let mut out = Vec::with_capacity(context.shapes.len());
    for (i, shape) in context.shapes.iter().enumerate() {
        out.push(decode_fired_argument(shape, args, i));
    }
    let mut payload = Map::new();
    payload.insert("callback_id".to_string(), Value::String(context.id.clone()));
    payload.insert("args".to_string(), Value::Array(out));
    context.sink.emit("invoke_callback", Value::Object(payload));
    context.in_flight.fetch_sub(1, Ordering::SeqCst);
}

/// Encodes one fired argument as the same `{type, value}` tagged shape
/// every other value on the wire uses; a `buffer_ptr` carries its
/// observed length as an extra `size` field alongside.
unsafe fn decode_fired_argument(shape: &ArgShape, args: &[*const c_void], index: usize) -> Value {
    let mut entry = Map::new();
    match shape {
        ArgShape::Primitive(p) => {
            entry.insert("type".to_string(), Value::String(p.tag().to_string()));
            entry.insert("value".to_string(), decode_fired_primitive(*p, args[index]));
        }
        ArgShape::BufferPtrFixed { fixed_size } => {
            let addr = *(args[index] as *const *const u8);
            entry.insert("type".to_string(), Value::String("buffer_ptr".to_string()));
            entry.insert("size".to_string(), Value::from(*fixed_size as u64));
            entry.insert("value".to_string(), read_buffer(addr, *fixed_size));
        }
        ArgShape::BufferPtrSized { size_arg_index, size_arg_type } => {
            let size = read_integer_arg(*size_arg_type, args[*size_arg_index]) as usize;
            let addr = *(args[index] as *const *const u8);
            entry.insert("type".to_string(), Value::String("buffer_ptr".to_string()));
            entry.insert("size".to_string(), Value::from(size as u64));
            entry.insert("value".to_string(), read_buffer(addr, size));
        }
    }
    Value::Object(entry)
}

/// Reads a `size_arg_index` argument's raw value at its declared
/// integer width, rather than assuming a fixed width for all of them.
unsafe fn read_integer_arg(ty: crate::types::Primitive, raw: *const c_void) -> i64 {
    use crate::types::Primitive::*;
    match ty {
        Int8 => *(raw as *const i8) as i64,
        UInt8 => *(raw as *const u8) as i64,
        Int16 => *(raw as *const i16) as i64,
        UInt16 => *(raw as *const u16) as i64,
        Int32 => *(raw as *const i32) as i64,
        UInt32 => *(raw as *const u32) as i64,
        Int64 => *(raw as *const i64),
        UInt64 => *(raw as *const u64) as i64,
        _ => unreachable!("size_arg_type is validated to be an integer primitive at registration"),
    }
}

unsafe fn read_buffer(addr: *const u8, size: usize) -> Value {
    if addr.is_null() || size == 0 {
        return crate::value::encode_buffer(&[]);
    }
    let bytes = std::slice::from_raw_parts(addr, size).to_vec();
    crate::value::encode_buffer(&bytes)
}

unsafe fn decode_fired_primitive(p: crate::types::Primitive, raw: *const c_void) -> Value {
    use crate::types::Primitive::*;
    match p {
        Void => Value::Null,
        Int8 => Value::from(*(raw as *const i8)),
        UInt8 => Value::from(*(raw as *const u8)),
        Int16 => Value::from(*(raw as *const i16)),
        UInt16 => Value::from(*(raw as *const u16)),
        Int32 => Value::from(*(raw as *const i32)),
        UInt32 => Value::from(*(raw as *const u32)),
        Int64 => Value::from(*(raw as *const i64)),
        UInt64 => Value::from(*(raw as *const u64)),
        Bool => Value::from(*(raw as *const u8) != 0),
        Float => Value::from(*(raw as *const f32) as f64),
        Double => Value::from(*(raw as *const f64)),
        Pointer | Callback => Value::from(*(raw as *const usize) as u64),
        String => {
            let addr = *(raw as *const *const c_char);
            if addr.is_null() {
                Value::Null
            } else {
                Value::String(CStr::from_ptr(addr).to_string_lossy().into_owned())
            }
        }
        Buffer => Value::Null,
    }
}
