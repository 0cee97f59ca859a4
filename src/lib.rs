//! Reel - deterministic HTTP/WebSocket record-replay engine
//!
//! Interactions are recorded into named cassettes and replayed from them.
//! A [`mode::ModeController`] runs one cassette session; a
//! [`session::SessionStack`] nests them.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::cargo)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::field_reassign_with_default,
    clippy::multiple_crate_versions
)]

pub mod cassette;
pub mod config;
pub mod error;
pub mod filter;
pub mod fingerprint;
pub mod matcher;
pub mod mode;
pub mod session;
pub mod storage;
pub mod upstream;

pub use cassette::{Cassette, HttpRequest, HttpResponse, Interaction, InteractionKind};
pub use config::{EngineConfig, Mode, SessionOptions};
pub use error::{ReelError, Result};
pub use mode::{ModeController, ModeState};
pub use session::{SessionHandle, SessionStack};
pub use storage::CassetteStore;
pub use upstream::{HttpUpstream, Upstream};
