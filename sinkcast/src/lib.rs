//! # sinkcast
//!
//! Streams the local machine's audio output to a network speaker.
//!
//! **Purpose:** Create a virtual combined sink, transcode its monitor into a
//! FLAC stream served over HTTP, keep the speaker awake with near-silent
//! noise, and point the speaker at the stream. Every acquired resource is
//! released when the session ends, however it ends.
//!
//! **Architecture:** One foreground session state machine
//! ([`session::Orchestrator`]) plus one background task
//! ([`pump::OutputPump`]) draining the transcoder's output.

pub mod command;
pub mod config;
pub mod error;
pub mod keepalive;
pub mod net;
pub mod process;
pub mod pump;
pub mod session;
pub mod sink;
pub mod speaker;
pub mod transcoder;

pub use error::{Error, Result};
pub use session::{Orchestrator, SessionOutcome, SessionPhase, SessionReport};
