use rpc_executor::state::ExecutorState;
use rpc_executor::supervisor;
use std::env;
use std::process::ExitCode;

fn main() -> ExitCode {
    env_logger::init();

    let mut args = env::args().skip(1);
    let socket_name = match args.next() {
        Some(name) => name,
        None => {
            eprintln!("usage: rpc-executor <socket-name>");
            return ExitCode::FAILURE;
        }
    };

    let socket_path = if socket_name.contains('/') {
        socket_name
    } else {
        supervisor::default_socket_path(&socket_name)
            .to_string_lossy()
            .into_owned()
    };

    let state = ExecutorState::new();
    if let Err(err) = supervisor::run(&socket_path, state) {
        log::error!("executor terminated: {err}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
