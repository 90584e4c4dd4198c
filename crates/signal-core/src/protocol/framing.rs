//! Byte-level framing for the signal link.
//!
//! Wire format (both directions):
//! ```text
//! [payload:N][0x00]
//! ```
//! A frame is complete once its NUL terminator has arrived.  The payload is
//! opaque to this module: bytes are compared as raw single-byte values and are
//! never decoded through a character set.
//!
//! # Acknowledgements (for beginners)
//!
//! The signal is a small microcontroller with very little buffer space.  To
//! keep it from being flooded, the server sends exactly one command and then
//! waits for the signal to reply with [`ACK_MESSAGE`] before sending the next.
//! The keep-alive ping reuses the same frame: the signal acks it like any
//! other command, which proves the link is still alive.

/// Byte that ends every frame on the wire.
pub const TERMINATOR: u8 = 0x00;

/// Frame the signal sends back after accepting a command.
pub const ACK_MESSAGE: &[u8] = b"ACK\0";

/// Frame the server sends periodically to detect a silently dead link.
///
/// Identical to [`ACK_MESSAGE`]; the signal answers it with an ack.
pub const PING_MESSAGE: &[u8] = ACK_MESSAGE;

/// Rules the server uses to interpret bytes read back from the signal.
///
/// The server never inspects response bytes itself; it only asks these two
/// questions, which keeps the link engine independent of the command set.
pub trait MessageFraming: Send + Sync {
    /// Returns `true` once `bytes` holds at least one complete frame.
    fn is_terminated(&self, bytes: &[u8]) -> bool;

    /// Returns `true` if the first complete frame in `bytes` is an ack.
    fn is_ack(&self, bytes: &[u8]) -> bool;

    /// The ack frame expected from the signal.
    fn ack_message(&self) -> &[u8];

    /// The keep-alive frame sent to the signal.
    fn ping_message(&self) -> &[u8];
}

/// The default framing: NUL-terminated frames, `ACK\0` as the acknowledgement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NullTerminatedFraming;

impl NullTerminatedFraming {
    /// Creates the default framing.
    pub fn new() -> Self {
        Self
    }
}

impl MessageFraming for NullTerminatedFraming {
    fn is_terminated(&self, bytes: &[u8]) -> bool {
        bytes.contains(&TERMINATOR)
    }

    fn is_ack(&self, bytes: &[u8]) -> bool {
        first_frame(bytes).is_some_and(|frame| frame == ACK_MESSAGE)
    }

    fn ack_message(&self) -> &[u8] {
        ACK_MESSAGE
    }

    fn ping_message(&self) -> &[u8] {
        PING_MESSAGE
    }
}

/// Returns the bytes up to and including the first terminator, if any.
fn first_frame(bytes: &[u8]) -> Option<&[u8]> {
    bytes
        .iter()
        .position(|&b| b == TERMINATOR)
        .map(|end| &bytes[..=end])
}

/// Turns an arbitrary payload into a wire frame.
///
/// Appends [`TERMINATOR`] unless the payload already ends with one, so
/// framing an already-framed message is a no-op.
///
/// # Examples
///
/// ```rust
/// use signal_core::frame_payload;
///
/// assert_eq!(frame_payload(b"R"), b"R\0".to_vec());
/// assert_eq!(frame_payload(b"R\0"), b"R\0".to_vec());
/// ```
pub fn frame_payload(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 1);
    frame.extend_from_slice(payload);
    if frame.last() != Some(&TERMINATOR) {
        frame.push(TERMINATOR);
    }
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_terminated_false_for_empty_buffer() {
        assert!(!NullTerminatedFraming.is_terminated(b""));
    }

    #[test]
    fn test_is_terminated_false_without_nul() {
        assert!(!NullTerminatedFraming.is_terminated(b"ACK"));
    }

    #[test]
    fn test_is_terminated_true_with_nul_anywhere() {
        assert!(NullTerminatedFraming.is_terminated(b"AC\0K"));
    }

    #[test]
    fn test_is_ack_accepts_exact_ack_frame() {
        assert!(NullTerminatedFraming.is_ack(ACK_MESSAGE));
    }

    #[test]
    fn test_is_ack_ignores_bytes_after_first_frame() {
        // Arrange: a trailing partial frame coalesced into the same read
        let buf = b"ACK\0garbage";

        // Act / Assert
        assert!(NullTerminatedFraming.is_ack(buf));
    }

    #[test]
    fn test_is_ack_rejects_unterminated_ack_text() {
        assert!(!NullTerminatedFraming.is_ack(b"ACK"));
    }

    #[test]
    fn test_is_ack_rejects_other_frame() {
        assert!(!NullTerminatedFraming.is_ack(b"NAK\0"));
    }

    #[test]
    fn test_is_ack_rejects_ack_preceded_by_noise() {
        // Only the first frame counts.
        assert!(!NullTerminatedFraming.is_ack(b"X\0ACK\0"));
    }

    #[test]
    fn test_ping_is_the_ack_frame() {
        let framing = NullTerminatedFraming::new();
        assert_eq!(framing.ping_message(), framing.ack_message());
    }

    #[test]
    fn test_frame_payload_appends_terminator() {
        assert_eq!(frame_payload(b"G"), vec![b'G', TERMINATOR]);
    }

    #[test]
    fn test_frame_payload_of_empty_is_bare_terminator() {
        assert_eq!(frame_payload(b""), vec![TERMINATOR]);
    }

    #[test]
    fn test_frame_payload_is_idempotent() {
        let once = frame_payload(b"Y");
        assert_eq!(frame_payload(&once), once);
    }
}
