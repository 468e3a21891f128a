//! End-to-end exercise of the command router against `libfixture.so`,
//! built by `build.rs` from `tests/fixtures/fixture.c`. Tests that need
//! the fixture skip gracefully if no C toolchain was available to
//! build it.

use parking_lot::Mutex;
use rpc_executor::callback::EventSink;
use rpc_executor::protocol::{Request, Status};
use rpc_executor::router;
use rpc_executor::state::ExecutorState;
use rpc_executor::testing::fixture_library_path;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<(String, Value)>>,
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &str, payload: Value) {
        self.events.lock().push((event.to_string(), payload));
    }
}

fn request(command: &str, request_id: &str, payload: Value) -> Request {
    serde_json::from_value(json!({
        "command": command,
        "request_id": request_id,
        "payload": payload,
    }))
    .unwrap()
}

fn load_fixture(state: &ExecutorState, sink: Arc<dyn EventSink>) -> Option<String> {
    let path = fixture_library_path()?;
    let response = router::dispatch(
        request("load_library", "load", json!({"path": path.to_string_lossy()})),
        state,
        sink,
    );
    assert_eq!(response.status, Status::Ok, "{:?}", response.error_message);
    Some(response.data.unwrap()["library_id"].as_str().unwrap().to_string())
}

#[test]
fn load_unknown_library_is_reported_as_an_error_response_not_a_panic() {
    let state = ExecutorState::new();
    let sink: Arc<dyn EventSink> = Arc::new(RecordingSink::default());
    let response = router::dispatch(
        request("load_library", "r1", json!({"path": "/no/such/library.so"})),
        &state,
        sink,
    );
    assert_eq!(response.status, Status::Error);
    assert!(response.error_message.unwrap().starts_with("load_failed"));
}

#[test]
fn unknown_command_is_an_error_response() {
    let state = ExecutorState::new();
    let sink: Arc<dyn EventSink> = Arc::new(RecordingSink::default());
    let response = router::dispatch(request("levitate", "r1", json!({})), &state, sink);
    assert_eq!(response.status, Status::Error);
    assert!(response.error_message.unwrap().starts_with("unknown_command"));
}

#[test]
fn register_call_and_unregister_struct_round_trip() {
    let state = ExecutorState::new();
    let sink: Arc<dyn EventSink> = Arc::new(RecordingSink::default());

    let register = router::dispatch(
        request(
            "register_struct",
            "r1",
            json!({
                "struct_name": "Point",
                "definition": [
                    {"name": "x", "type": "int32"},
                    {"name": "y", "type": "int32"},
                ],
            }),
        ),
        &state,
        sink.clone(),
    );
    assert_eq!(register.status, Status::Ok);
    assert_eq!(register.data.unwrap()["size"], 8);

    let conflict = router::dispatch(
        request(
            "register_struct",
            "r2",
            json!({
                "struct_name": "Point",
                "definition": [{"name": "x", "type": "double"}],
            }),
        ),
        &state,
        sink.clone(),
    );
    assert_eq!(conflict.status, Status::Error);
    assert!(conflict.error_message.unwrap().starts_with("type_exists"));

    let unregister = router::dispatch(request("unregister_struct", "r3", json!({"struct_name": "Point"})), &state, sink);
    assert_eq!(unregister.status, Status::Ok);
}

#[test]
fn call_function_marshals_scalar_arguments_and_return() {
    let state = ExecutorState::new();
    let sink: Arc<dyn EventSink> = Arc::new(RecordingSink::default());
    let Some(library_id) = load_fixture(&state, sink.clone()) else { return };

    let call = router::dispatch(
        request(
            "call_function",
            "call",
            json!({
                "library_id": library_id,
                "function_name": "add_ints",
                "return_type": "int32",
                "args": [
                    {"type": "int32", "value": 3},
                    {"type": "int32", "value": 4},
                ],
            }),
        ),
        &state,
        sink,
    );
    assert_eq!(call.status, Status::Ok);
    let data = call.data.unwrap();
    assert_eq!(data["return"]["value"], 7);
    assert_eq!(data["out_params"], json!([]));
}

#[test]
fn call_function_marshals_struct_arguments_and_return() {
    let state = ExecutorState::new();
    let sink: Arc<dyn EventSink> = Arc::new(RecordingSink::default());
    let Some(library_id) = load_fixture(&state, sink.clone()) else { return };

    let register = router::dispatch(
        request(
            "register_struct",
            "struct",
            json!({
                "struct_name": "Point",
                "definition": [
                    {"name": "x", "type": "int32"},
                    {"name": "y", "type": "int32"},
                ],
            }),
        ),
        &state,
        sink.clone(),
    );
    assert_eq!(register.status, Status::Ok);

    let make_point = router::dispatch(
        request(
            "call_function",
            "make_point",
            json!({
                "library_id": library_id,
                "function_name": "make_point",
                "return_type": "Point",
                "args": [
                    {"type": "int32", "value": 5},
                    {"type": "int32", "value": 9},
                ],
            }),
        ),
        &state,
        sink.clone(),
    );
    assert_eq!(make_point.status, Status::Ok);
    let point = make_point.data.unwrap()["return"]["value"].clone();
    assert_eq!(point["x"], 5);
    assert_eq!(point["y"], 9);

    let sum = router::dispatch(
        request(
            "call_function",
            "point_sum",
            json!({
                "library_id": library_id,
                "function_name": "point_sum",
                "return_type": "int32",
                "args": [{"type": "Point", "value": {"x": 5, "y": 9}}],
            }),
        ),
        &state,
        sink,
    );
    assert_eq!(sum.status, Status::Ok);
    assert_eq!(sum.data.unwrap()["return"]["value"], 14);
}

#[test]
fn call_function_reports_inout_buffer_and_pointer_readback() {
    let state = ExecutorState::new();
    let sink: Arc<dyn EventSink> = Arc::new(RecordingSink::default());
    let Some(library_id) = load_fixture(&state, sink.clone()) else { return };

    let call = router::dispatch(
        request(
            "call_function",
            "call",
            json!({
                "library_id": library_id,
                "function_name": "uppercase_buffer",
                "return_type": "void",
                "args": [
                    {
                        "type": "buffer",
                        "direction": "inout",
                        "size": 5,
                        "value": base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b"hello"),
                    },
                    {
                        "type": "pointer",
                        "target_type": "int32",
                        "direction": "inout",
                        "value": 5,
                    },
                ],
            }),
        ),
        &state,
        sink,
    );
    assert_eq!(call.status, Status::Ok);
    let out_params = call.data.unwrap()["out_params"].clone();
    let buffer_entry = out_params
        .as_array()
        .unwrap()
        .iter()
        .find(|e| e["type"] == "buffer")
        .unwrap();
    let decoded = base64::Engine::decode(
        &base64::engine::general_purpose::STANDARD,
        buffer_entry["value"].as_str().unwrap(),
    )
    .unwrap();
    assert_eq!(decoded, b"HELLO");
}

#[test]
fn call_function_marshals_string_argument_and_return() {
    let state = ExecutorState::new();
    let sink: Arc<dyn EventSink> = Arc::new(RecordingSink::default());
    let Some(library_id) = load_fixture(&state, sink.clone()) else { return };

    let call = router::dispatch(
        request(
            "call_function",
            "call",
            json!({
                "library_id": library_id,
                "function_name": "greet",
                "return_type": "string",
                "args": [{"type": "string", "value": "World"}],
            }),
        ),
        &state,
        sink,
    );
    assert_eq!(call.status, Status::Ok);
    assert_eq!(call.data.unwrap()["return"]["value"], "Hello, World");
}

#[test]
fn call_function_marshals_nested_struct_return() {
    let state = ExecutorState::new();
    let sink: Arc<dyn EventSink> = Arc::new(RecordingSink::default());
    let Some(library_id) = load_fixture(&state, sink.clone()) else { return };

    let register_point = router::dispatch(
        request(
            "register_struct",
            "point",
            json!({
                "struct_name": "Point",
                "definition": [
                    {"name": "x", "type": "int32"},
                    {"name": "y", "type": "int32"},
                ],
            }),
        ),
        &state,
        sink.clone(),
    );
    assert_eq!(register_point.status, Status::Ok);

    let register_line = router::dispatch(
        request(
            "register_struct",
            "line",
            json!({
                "struct_name": "Line",
                "definition": [
                    {"name": "p1", "type": "Point"},
                    {"name": "p2", "type": "Point"},
                ],
            }),
        ),
        &state,
        sink.clone(),
    );
    assert_eq!(register_line.status, Status::Ok);

    let call = router::dispatch(
        request(
            "call_function",
            "call",
            json!({
                "library_id": library_id,
                "function_name": "create_line",
                "return_type": "Line",
                "args": [
                    {"type": "int32", "value": 10},
                    {"type": "int32", "value": 11},
                    {"type": "int32", "value": 12},
                    {"type": "int32", "value": 13},
                ],
            }),
        ),
        &state,
        sink,
    );
    assert_eq!(call.status, Status::Ok);
    let line = call.data.unwrap()["return"]["value"].clone();
    assert_eq!(line["p1"]["x"], 10);
    assert_eq!(line["p1"]["y"], 11);
    assert_eq!(line["p2"]["x"], 12);
    assert_eq!(line["p2"]["y"], 13);
}

#[test]
fn call_function_reports_an_out_only_buffer_and_its_written_length() {
    let state = ExecutorState::new();
    let sink: Arc<dyn EventSink> = Arc::new(RecordingSink::default());
    let Some(library_id) = load_fixture(&state, sink.clone()) else { return };

    let call = router::dispatch(
        request(
            "call_function",
            "call",
            json!({
                "library_id": library_id,
                "function_name": "write_out_buff",
                "return_type": "int32",
                "args": [
                    {"type": "buffer", "direction": "out", "size": 64},
                    {
                        "type": "pointer",
                        "target_type": "int32",
                        "direction": "inout",
                        "value": 64,
                    },
                ],
            }),
        ),
        &state,
        sink,
    );
    assert_eq!(call.status, Status::Ok, "{:?}", call.error_message);
    let data = call.data.unwrap();
    assert_eq!(data["return"]["value"], 0);
    let out_params = data["out_params"].as_array().unwrap();
    let buffer_entry = out_params.iter().find(|e| e["type"] == "buffer").unwrap();
    let decoded = base64::Engine::decode(
        &base64::engine::general_purpose::STANDARD,
        buffer_entry["value"].as_str().unwrap(),
    )
    .unwrap();
    assert!(decoded.starts_with(b"Hello from writeOutBuff!"));
    let size_entry = out_params.iter().find(|e| e["index"] == 1).unwrap();
    assert_eq!(size_entry["value"], 24);
}

#[test]
fn callback_invoked_multiple_times_emits_events_in_invocation_order() {
    let state = ExecutorState::new();
    let sink = Arc::new(RecordingSink::default());
    let event_sink: Arc<dyn EventSink> = sink.clone();
    let Some(library_id) = load_fixture(&state, event_sink.clone()) else { return };

    let register = router::dispatch(
        request(
            "register_callback",
            "reg",
            json!({"return_type": "void", "args_type": ["string", "int32"]}),
        ),
        &state,
        event_sink.clone(),
    );
    assert_eq!(register.status, Status::Ok);
    let callback_id = register.data.unwrap()["callback_id"].as_str().unwrap().to_string();

    let call = router::dispatch(
        request(
            "call_function",
            "call",
            json!({
                "library_id": library_id,
                "function_name": "call_multi_callbacks",
                "return_type": "void",
                "args": [
                    {"type": "callback", "value": callback_id},
                    {"type": "int32", "value": 3},
                ],
            }),
        ),
        &state,
        event_sink,
    );
    assert_eq!(call.status, Status::Ok);

    let events = sink.events.lock();
    assert_eq!(events.len(), 3);
    for (i, (event, payload)) in events.iter().enumerate() {
        let i = i as i64 + 1;
        assert_eq!(event, "invoke_callback");
        assert_eq!(payload["args"][1]["value"], i);
        assert_eq!(
            payload["args"][0]["value"],
            format!("Message from native code, call {i}")
        );
    }
}

#[test]
fn registered_callback_fires_an_invoke_callback_event() {
    let state = ExecutorState::new();
    let sink = Arc::new(RecordingSink::default());
    let event_sink: Arc<dyn EventSink> = sink.clone();
    let Some(library_id) = load_fixture(&state, event_sink.clone()) else { return };

    let register = router::dispatch(
        request("register_callback", "reg", json!({"return_type": "void", "args_type": ["int32"]})),
        &state,
        event_sink.clone(),
    );
    assert_eq!(register.status, Status::Ok);
    let callback_id = register.data.unwrap()["callback_id"].as_str().unwrap().to_string();

    let call = router::dispatch(
        request(
            "call_function",
            "call",
            json!({
                "library_id": library_id,
                "function_name": "fire_callback",
                "return_type": "void",
                "args": [
                    {"type": "callback", "value": callback_id},
                    {"type": "int32", "value": 42},
                ],
            }),
        ),
        &state,
        event_sink,
    );
    assert_eq!(call.status, Status::Ok);

    let events = sink.events.lock();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, "invoke_callback");
    assert_eq!(events[0].1["args"][0]["type"], "int32");
    assert_eq!(events[0].1["args"][0]["value"], 42);
}
