//! General utilities shared across the application.

/// Largest multiple of `unit` not exceeding `len`.
///
/// Used to size outgoing chunks to the largest multiple of the MPEG-TS
/// packet size not exceeding the configured preferred chunk size.
#[must_use]
pub fn largest_multiple_at_most(len: usize, unit: usize) -> usize {
    (len / unit) * unit
}
