//! The Connection Supervisor: binds the control-channel Unix
//! domain socket, accepts connections, and runs each on its own OS
//! thread — a thread-per-connection server rather than an async
//! runtime, the same model favored elsewhere in this codebase for
//! comparably low-fanout worker loops.

use crate::callback::EventSink;
use crate::protocol::{Event, Response};
use crate::router;
use crate::state::ExecutorState;
use crate::transport::{max_frame_bytes, read_frame, write_frame};
use parking_lot::Mutex;
use serde_json::Value;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag;
use std::io::BufReader;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// Writes events to one connection's socket, serialising against the
/// response writer on the same stream with a per-connection write
/// mutex shared between the request/response path and the
/// asynchronous callback-event path.
struct ConnectionSink {
    stream: Mutex<UnixStream>,
}

impl EventSink for ConnectionSink {
    fn emit(&self, event: &str, payload: Value) {
        let frame = Event {
            event: event.to_string(),
            payload,
        };
        let Ok(bytes) = serde_json::to_vec(&frame) else {
            log::error!("failed to encode {event} event");
            return;
        };
        let mut stream = self.stream.lock();
        if let Err(err) = write_frame(&mut *stream, &bytes) {
            log::warn!("dropping {event} event, write failed: {err}");
        }
    }
}

/// Runs the accept loop on `socket_path` until a SIGINT/SIGTERM is
/// received, then closes the listener and removes the socket file.
pub fn run(socket_path: &str, state: ExecutorState) -> Result<(), std::io::Error> {
    if Path::new(socket_path).exists() {
        std::fs::remove_file(socket_path)?;
    }
    let listener = UnixListener::bind(socket_path)?;
    listener.set_nonblocking(true)?;
    log::info!("listening on {socket_path}");

    let shutdown = Arc::new(AtomicBool::new(false));
    flag::register(SIGINT, shutdown.clone())?;
    flag::register(SIGTERM, shutdown.clone())?;

    let mut workers = Vec::new();
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _addr)) => {
                stream.set_nonblocking(false).ok();
                let state = state.clone();
                workers.push(thread::spawn(move || serve_connection(stream, state)));
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(std::time::Duration::from_millis(50));
            }
            Err(err) => {
                log::error!("accept failed: {err}");
                break;
            }
        }
        workers.retain(|handle| !handle.is_finished());
    }

    log::info!("shutting down, removing {socket_path}");
    drop(listener);
    let _ = std::fs::remove_file(socket_path);
    for worker in workers {
        let _ = worker.join();
    }
    Ok(())
}

fn serve_connection(stream: UnixStream, state: ExecutorState) {
    let write_half = match stream.try_clone() {
        Ok(s) => s,
        Err(err) => {
            log::error!("failed to clone connection stream: {err}");
            return;
        }
    };
    let sink: Arc<ConnectionSink> = Arc::new(ConnectionSink {
        stream: Mutex::new(write_half),
    });
    let event_sink: Arc<dyn EventSink> = sink.clone();
    let mut reader = BufReader::new(stream);
    let ceiling = max_frame_bytes();

    loop {
        let frame = match read_frame(&mut reader, ceiling) {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(err) => {
                log::warn!("closing connection: {err}");
                break;
            }
        };

        // A frame that doesn't even parse as a request envelope carries
        // no `request_id` to answer with, so there is no response to
        // send; this is fatal for the connection, same as a framing
        // violation.
        let request: crate::protocol::Request = match serde_json::from_slice(&frame) {
            Ok(r) => r,
            Err(err) => {
                log::warn!("closing connection, malformed request frame: {err}");
                break;
            }
        };

        let response: Response = router::dispatch(request, &state, event_sink.clone());
        let Ok(bytes) = serde_json::to_vec(&response) else {
            log::error!("failed to encode response for {}", response.request_id);
            continue;
        };
        let mut guard = sink.stream.lock();
        if let Err(err) = write_frame(&mut *guard, &bytes) {
            log::warn!("closing connection, write failed: {err}");
            break;
        }
        drop(guard);
    }

    // A worker owns its callback handles and releases them when its
    // connection drops. The process-wide type/library registries are
    // left untouched.
    state.callbacks.release_owned_by(&event_sink);
}

/// Default per-connection socket path under `/tmp`.
pub fn default_socket_path(name: &str) -> PathBuf {
    PathBuf::from("/tmp").join(name)
}
