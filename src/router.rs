//! The Command Router: a static dispatch table over the seven
//! control-channel commands. An unknown command or a malformed payload
//! produces an error response, never a disconnect — only framing
//! failures are fatal to the connection.

use crate::callback::{parse_arg_shapes, EventSink};
use crate::dispatch::{call_function, CallRequest};
use crate::error::{ExecutorError, Result};
use crate::protocol::{Request, Response};
use crate::state::ExecutorState;
use serde_json::{Map, Value};
use std::sync::Arc;

pub fn dispatch(request: Request, state: &ExecutorState, sink: Arc<dyn EventSink>) -> Response {
    let request_id = request.request_id.clone();
    match handle(&request, state, sink) {
        Ok(data) => Response::ok(request_id, data),
        Err(err) => Response::error(request_id, err.to_string()),
    }
}

fn handle(request: &Request, state: &ExecutorState, sink: Arc<dyn EventSink>) -> Result<Value> {
    let payload = request
        .payload
        .as_object()
        .ok_or_else(|| ExecutorError::MalformedArgument("payload must be an object".into()))?;

    match request.command.as_str() {
        "load_library" => load_library(payload, state),
        "unload_library" => unload_library(payload, state),
        "register_struct" => register_struct(payload, state),
        "unregister_struct" => unregister_struct(payload, state),
        "register_callback" => register_callback(payload, state, sink),
        "unregister_callback" => unregister_callback(payload, state),
        "call_function" => call_function_command(payload, state),
        other => Err(ExecutorError::UnknownCommand(other.to_string())),
    }
}

fn string_field<'a>(payload: &'a Map<String, Value>, field: &'static str) -> Result<&'a str> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .ok_or(ExecutorError::MissingField(field))
}

fn load_library(payload: &Map<String, Value>, state: &ExecutorState) -> Result<Value> {
    let path = string_field(payload, "path")?;
    let id = state.libraries.load(path)?;
    Ok(object(&[("library_id", Value::String(id))]))
}

fn unload_library(payload: &Map<String, Value>, state: &ExecutorState) -> Result<Value> {
    let id = string_field(payload, "library_id")?;
    state.libraries.unload(id)?;
    Ok(Value::Object(Map::new()))
}

fn register_struct(payload: &Map<String, Value>, state: &ExecutorState) -> Result<Value> {
    let name = string_field(payload, "struct_name")?;
    let members = payload
        .get("definition")
        .and_then(Value::as_array)
        .ok_or(ExecutorError::MissingField("definition"))?;
    let mut definition = Vec::with_capacity(members.len());
    for member in members {
        let obj = member
            .as_object()
            .ok_or_else(|| ExecutorError::MalformedArgument("struct member must be an object".into()))?;
        let member_name = string_field(obj, "name")?.to_string();
        let member_type = string_field(obj, "type")?.to_string();
        definition.push((member_name, member_type));
    }
    let def = state.types.register_struct(name, &definition)?;
    Ok(object(&[
        ("size", Value::from(def.size as u64)),
        ("alignment", Value::from(def.align as u64)),
    ]))
}

fn unregister_struct(payload: &Map<String, Value>, state: &ExecutorState) -> Result<Value> {
    let name = string_field(payload, "struct_name")?;
    state.types.unregister_struct(name)?;
    Ok(Value::Object(Map::new()))
}

fn register_callback(payload: &Map<String, Value>, state: &ExecutorState, sink: Arc<dyn EventSink>) -> Result<Value> {
    // `return_type` is accepted but the trampoline is fire-and-forget
    // and void-return-only; it is not otherwise consulted.
    let args = payload
        .get("args_type")
        .and_then(Value::as_array)
        .ok_or(ExecutorError::MissingField("args_type"))?;
    let shapes = parse_arg_shapes(args)?;
    let id = state.callbacks.register(shapes, sink)?;
    Ok(object(&[("callback_id", Value::String(id))]))
}

fn unregister_callback(payload: &Map<String, Value>, state: &ExecutorState) -> Result<Value> {
    let id = string_field(payload, "callback_id")?;
    state.callbacks.unregister(id)?;
    Ok(Value::Object(Map::new()))
}

fn call_function_command(payload: &Map<String, Value>, state: &ExecutorState) -> Result<Value> {
    let library_id = string_field(payload, "library_id")?;
    let function_name = string_field(payload, "function_name")?;
    let return_type = string_field(payload, "return_type")?;
    let args = payload
        .get("args")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    call_function(
        CallRequest {
            library_id,
            function_name,
            return_type,
            args: &args,
        },
        &state.types,
        &state.libraries,
        &state.callbacks,
    )
}

fn object(fields: &[(&str, Value)]) -> Value {
    let mut map = Map::new();
    for (k, v) in fields {
        map.insert(k.to_string(), v.clone());
    }
    Value::Object(map)
}
