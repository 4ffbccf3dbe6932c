//! # stratavisor Common
//!
//! Shared utilities for the stratavisor components.
//!
//! - [`logging`]: tracing subscriber initialization (pretty and JSON).
//! - [`units`]: the size parser shared by every size/quota field in the
//!   system. Accepts decimal (`kB`, `MB`, ...) and binary (`KiB`, `MiB`, ...)
//!   byte suffixes as well as the analogous bit suffixes.

pub mod logging;
pub mod units;

pub use logging::{init_logging, init_logging_json};
pub use units::{format_bytes, parse_byte_size, SizeParseError};
