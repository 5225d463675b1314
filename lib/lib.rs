//! gatefs shared library.

/// Admission control for `open`.
pub mod access;
pub mod delivery;
/// Passthrough filesystem and its FUSE adapter.
pub mod fs;
pub mod otp;
pub mod prompt;
/// Credential and permission records.
pub mod store;
