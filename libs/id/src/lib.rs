//! # jumpgate-id
//!
//! Session identifiers for the jumpgate TCP jump-proxy.
//!
//! ## ID Format
//!
//! A session id is 7 bytes of a SHA-256 digest rendered as 14 lowercase hex
//! characters, for example `3fa94c0e1b2d77`.
//!
//! The digest input is a nanosecond timestamp plus a process-wide sequence
//! number, so two sessions accepted within the same clock tick still get
//! distinct inputs. The output is truncated, so uniqueness is best-effort:
//! ids label log lines and roster entries, nothing keys correctness on them
//! beyond the lifetime of a single session.

mod error;
mod types;

pub use error::IdError;
pub use types::SessionId;
