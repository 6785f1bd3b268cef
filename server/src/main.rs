//! `vt-server` binary (§6 CLI surface): layers CLI flags over `Config::from_env()`,
//! initializes structured logging, and runs the HTTP/WebSocket server until shutdown.
//! Exit codes: 0 normal, 1 configuration error, 2 bind failure, 3 fatal runtime error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use common::config::{AuthMode, Config};
use tracing_subscriber::EnvFilter;

use server::RunError;

const HELP: &str = "\
vt-server: remote terminal multiplexing service

USAGE:
    vt-server [OPTIONS]

OPTIONS:
    --port <N>                TCP port to bind (default 4022, or $PORT)
    --bind <ADDR>              Address to bind (default 127.0.0.1, or $BIND_ADDR)
    --no-auth                  Disable bearer-token authentication
    --recordings-dir <PATH>    Transcript storage root (default ./recordings, or $RECORDINGS_DIR)
    --max-sessions <N>         Hard cap on concurrent sessions (default 64, or $MAX_SESSIONS)
    --help                     Print this help and exit
    --version                  Print the version and exit
";

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut config = Config::from_env();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--help" => {
                print!("{HELP}");
                return ExitCode::SUCCESS;
            }
            "--version" => {
                println!("vt-server {}", env!("CARGO_PKG_VERSION"));
                return ExitCode::SUCCESS;
            }
            "--no-auth" => {
                config.auth_mode = AuthMode::None;
                i += 1;
            }
            "--port" => {
                let Some(port) = args.get(i + 1).and_then(|v| v.parse().ok()) else {
                    eprintln!("--port requires a numeric argument");
                    return ExitCode::from(1);
                };
                config.port = port;
                i += 2;
            }
            "--bind" => {
                let Some(addr) = args.get(i + 1) else {
                    eprintln!("--bind requires an argument");
                    return ExitCode::from(1);
                };
                config.bind_addr = addr.clone();
                i += 2;
            }
            "--recordings-dir" => {
                let Some(path) = args.get(i + 1) else {
                    eprintln!("--recordings-dir requires an argument");
                    return ExitCode::from(1);
                };
                config.recordings_dir = PathBuf::from(path);
                i += 2;
            }
            "--max-sessions" => {
                let Some(n) = args.get(i + 1).and_then(|v| v.parse().ok()) else {
                    eprintln!("--max-sessions requires a numeric argument");
                    return ExitCode::from(1);
                };
                config.max_sessions = n;
                i += 2;
            }
            other => {
                eprintln!("unrecognized argument: {other}");
                eprint!("{HELP}");
                return ExitCode::from(1);
            }
        }
    }

    init_logging();
    config.log_startup();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start async runtime: {e}");
            return ExitCode::from(3);
        }
    };

    match rt.block_on(server::run_server(Arc::new(config))) {
        Ok(()) => ExitCode::SUCCESS,
        Err(RunError::Config(msg)) => {
            eprintln!("configuration error: {msg}");
            ExitCode::from(1)
        }
        Err(RunError::Bind(e)) => {
            eprintln!("failed to bind: {e}");
            ExitCode::from(2)
        }
        Err(RunError::Runtime(e)) => {
            eprintln!("fatal runtime error: {e}");
            ExitCode::from(3)
        }
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();
}
