//! Error kinds surfaced to the controller as `error_message` strings.
//!
//! One closed enum covers the whole taxonomy described in the wire
//! protocol: protocol framing, the type/library registries, value
//! marshalling and invocation, and the callback pool. `Display` prints
//! the exact snake_case kind the controller matches against.

use std::fmt;

#[derive(Debug)]
pub enum ExecutorError {
    // Protocol
    BadJson(String),
    MissingField(&'static str),
    UnknownCommand(String),
    FrameTooLarge { declared: u32, ceiling: u32 },

    // Registry
    TypeExists(String),
    TypeNotFound(String),
    TypeInUse(String),
    UnknownMemberType(String),
    EmptyDefinition,

    // Library
    LoadFailed(String),
    LibraryNotFound(String),
    LibraryBusy(String),
    SymbolNotFound(String),

    // Marshalling
    ValueOutOfRange(String),
    InvalidString(String),
    BufferOverflow,
    UnknownTypeTag(String),
    MalformedArgument(String),

    // Invocation
    SignatureBuildFailed(String),
    InvocationFailed(String),

    // Callbacks
    CallbackNotFound(String),
    CallbackInUse(String),
    UnsupportedCallbackShape(String),

    Io(std::io::Error),
}

impl fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use ExecutorError::*;
        match self {
            BadJson(msg) => write!(f, "bad_json: {msg}"),
            MissingField(name) => write!(f, "missing_field: {name}"),
            UnknownCommand(cmd) => write!(f, "unknown_command: {cmd}"),
            FrameTooLarge { declared, ceiling } => write!(
                f,
                "frame_too_large: declared {declared} bytes exceeds ceiling {ceiling}"
            ),

            TypeExists(name) => write!(f, "type_exists: {name}"),
            TypeNotFound(name) => write!(f, "type_not_found: {name}"),
            TypeInUse(name) => write!(f, "type_in_use: {name}"),
            UnknownMemberType(name) => write!(f, "unknown_member_type: {name}"),
            EmptyDefinition => write!(f, "empty_definition"),

            LoadFailed(msg) => write!(f, "load_failed: {msg}"),
            LibraryNotFound(id) => write!(f, "library_not_found: {id}"),
            LibraryBusy(id) => write!(f, "library_busy: {id}"),
            SymbolNotFound(name) => write!(f, "symbol_not_found: {name}"),

            ValueOutOfRange(msg) => write!(f, "value_out_of_range: {msg}"),
            InvalidString(msg) => write!(f, "invalid_string: {msg}"),
            BufferOverflow => write!(f, "buffer_overflow"),
            UnknownTypeTag(tag) => write!(f, "unknown_type_tag: {tag}"),
            MalformedArgument(msg) => write!(f, "malformed_argument: {msg}"),

            SignatureBuildFailed(msg) => write!(f, "signature_build_failed: {msg}"),
            InvocationFailed(msg) => write!(f, "invocation_failed: {msg}"),

            CallbackNotFound(id) => write!(f, "callback_not_found: {id}"),
            CallbackInUse(id) => write!(f, "callback_in_use: {id}"),
            UnsupportedCallbackShape(msg) => write!(f, "unsupported_callback_shape: {msg}"),

            Io(err) => write!(f, "io_error: {err}"),
        }
    }
}

impl std::error::Error for ExecutorError {}

impl From<std::io::Error> for ExecutorError {
    fn from(value: std::io::Error) -> Self {
        ExecutorError::Io(value)
    }
}

impl From<serde_json::Error> for ExecutorError {
    fn from(value: serde_json::Error) -> Self {
        ExecutorError::BadJson(value.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ExecutorError>;
