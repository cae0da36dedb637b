//! The size rule deciding whether a payload travels inline.

use claimcheck_types::{MAX_MESSAGE_SIZE, MessageType};

/// Returns `true` if a serialized body of `len` bytes may be enqueued as-is.
///
/// The comparison is strict: a body of exactly [`MAX_MESSAGE_SIZE`] bytes is offloaded.
pub const fn fits_inline(len: usize) -> bool {
    len < MAX_MESSAGE_SIZE
}

/// Picks the route for a serialized body of `len` bytes.
pub const fn route(len: usize) -> MessageType {
    if fits_inline(len) {
        MessageType::Inline
    } else {
        MessageType::Offloaded
    }
}
