//! Centralized error handling.
//!
//! All failure conditions are represented as `Result` values; the library
//! contains no `unwrap()` or `panic!()` calls (enforced by clippy lints in
//! `lib.rs`). Errors are `Clone` so they can be stored by a transport layer
//! and resurfaced later without losing the original cause.
//!
//! ## Error Categories
//!
//! - **I/O Errors** ([`Bp5Error::Io`]): reported by a transport feeding data in
//! - **Invalid Argument** ([`Bp5Error::InvalidArgument`]): a bad call that left
//!   engine state untouched (wrong dimension count, unknown variable, step
//!   selection beyond the available steps)
//! - **Logic Errors** ([`Bp5Error::Logic`]): protocol violations such as
//!   `marshal` before `init_step`; these are fatal for the engine instance
//! - **Format Errors** ([`Bp5Error::Format`]): corrupt or unrecognizable
//!   metadata (unknown format ID, unparseable field name); fatal
//! - **Operator Errors** ([`Bp5Error::Operator`]): a compression codec failed;
//!   aborts the affected block only
//! - **End of Stream** ([`Bp5Error::EndOfStream`]): advisory, surfaced by the
//!   transport when streaming step acquisition terminates

use std::fmt;
use std::io;
use std::sync::Arc;

/// A specialized `Result` type for engine operations.
pub type Result<T> = std::result::Result<T, Bp5Error>;

/// The master error enum covering all failure domains.
///
/// I/O errors wrap the underlying `io::Error` in an `Arc` so the enum stays
/// `Clone`; everything else carries a diagnostic message.
#[derive(Debug, Clone)]
pub enum Bp5Error {
    /// Low-level I/O failure reported by the transport.
    Io(Arc<io::Error>),

    /// A call with arguments the engine cannot honor. The call has no side
    /// effects: pending queues and step state are unchanged.
    InvalidArgument(String),

    /// Protocol violation (e.g. `marshal` without a prior `init_step`,
    /// `close_timestep` without a prior `init_step`). Fatal for the engine.
    Logic(String),

    /// The incoming metadata is corrupt, truncated, or uses a format this
    /// reader has never been given the schema for. Fatal for the engine.
    Format(String),

    /// A compression or decompression operator reported failure. Only the
    /// affected block's put/get is aborted.
    Operator(String),

    /// Advisory: the stream has no further steps. Not a failure.
    EndOfStream,
}

impl fmt::Display for Bp5Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O Error: {e}"),
            Self::InvalidArgument(s) => write!(f, "Invalid Argument: {s}"),
            Self::Logic(s) => write!(f, "Logic Error: {s}"),
            Self::Format(s) => write!(f, "Format Error: {s}"),
            Self::Operator(s) => write!(f, "Operator Error: {s}"),
            Self::EndOfStream => write!(f, "End of stream"),
        }
    }
}

impl std::error::Error for Bp5Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for Bp5Error {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}
