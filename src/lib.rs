#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! acp-sessiond library — exposes the core building blocks of the session
//! server:
//! - `config` — configuration loading
//! - `error` — typed session error taxonomy
//! - `sessions` — agent subprocess lifecycle, event store, session registry
//! - `routes` — REST API route handlers
//! - `ws` — per-session and global WebSocket protocol handling
//! - `state` — shared application state

pub mod config;
pub mod error;
pub mod routes;
pub mod sessions;
pub mod state;
pub mod util;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use error::SessionError;
pub use sessions::SessionManager;
pub use state::AppState;
