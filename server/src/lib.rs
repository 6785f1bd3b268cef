//! vt-server: the Axum HTTP control surface and WebSocket v3 transport (§4.6, §4.7) over
//! the session registry defined in `common` (the core crate). No domain logic lives here;
//! handlers validate, call into `common::registry::Registry`, and serialize the response.

mod rate_limit;
mod web_server;
mod ws;

pub use web_server::{build_router, run_server, AppState, RunError};
