//! Programmer errors: option misuse, a picture argument that
//! doesn't type-check, a reactor timer limit exceeded. These are bugs, not
//! runtime conditions, so they are not part of [`crate::error::Result`] —
//! they abort the program at one localised panic point, per the Design
//! Notes' instruction to keep the source's exception-based assertions but
//! localise them so tests can intercept a single place.

/// Abort with a diagnostic. Never returns.
#[track_caller]
pub fn fatal(msg: impl std::fmt::Display) -> ! {
    panic!("qmq: fatal: {msg}");
}
