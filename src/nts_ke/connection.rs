//! Shared pieces of the NTS-KE connection state machine: the fixed-capacity message buffer and
//! the state tag both the server accept loop and the client driver advance through.

use rustls::{Session, TLSError};

use crate::cookie::NTSKeys;

/// Capacity of a KE message buffer. Large enough for a full record burst without reallocating.
pub const MESSAGE_BUFFER_CAPACITY: usize = 16 * 1024;

/// States a connection passes through, shared by both the client and server drivers. Not every
/// state is reachable from every mode: `WaitConnect` is client-only (the server is handed an
/// already-connected socket by `accept`).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeState {
    WaitConnect,
    Handshake,
    Send,
    Receive,
    Shutdown,
    Closed,
}

/// Accumulates plaintext application data read from or to be written to a TLS session, tracking
/// how much of it has actually reached the peer.
///
/// Re-entrant sends resume from `sent` rather than re-serializing or reallocating.
pub struct MessageBuffer {
    data: Vec<u8>,
    length: usize,
    sent: usize,
    eof: bool,
}

impl MessageBuffer {
    pub fn new() -> MessageBuffer {
        MessageBuffer {
            data: Vec::with_capacity(MESSAGE_BUFFER_CAPACITY),
            length: 0,
            sent: 0,
            eof: false,
        }
    }

    /// Reset to a fresh, empty buffer, keeping the allocated capacity.
    pub fn reset(&mut self) {
        self.data.clear();
        self.length = 0;
        self.sent = 0;
        self.eof = false;
    }

    /// Load this buffer with bytes to send (a fully built response or request message).
    pub fn load(&mut self, bytes: Vec<u8>) {
        self.data = bytes;
        self.length = self.data.len();
        self.sent = 0;
        self.eof = false;
    }

    /// Append newly-received bytes, respecting the fixed capacity.
    pub fn extend_received(&mut self, bytes: &[u8]) -> bool {
        if self.length + bytes.len() > MESSAGE_BUFFER_CAPACITY {
            return false;
        }
        self.data.extend_from_slice(bytes);
        self.length += bytes.len();
        true
    }

    pub fn mark_eof(&mut self) {
        self.eof = true;
    }

    pub fn eof(&self) -> bool {
        self.eof
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.length]
    }

    pub fn unsent(&self) -> &[u8] {
        &self.data[self.sent..self.length]
    }

    pub fn advance_sent(&mut self, n: usize) {
        self.sent += n;
    }

    pub fn fully_sent(&self) -> bool {
        self.sent >= self.length
    }
}

impl Default for MessageBuffer {
    fn default() -> MessageBuffer {
        MessageBuffer::new()
    }
}

/// Derive the C2S/S2C pair from a completed TLS session via the RFC 5705 key exporter, per
/// `"EXPORTER-network-time-security/1"` with the NTS-specific 5-byte contexts.
pub fn derive_keys<S: Session>(session: &S) -> Result<NTSKeys, TLSError> {
    let mut keys = NTSKeys {
        c2s: [0; 32],
        s2c: [0; 32],
    };
    let c2s_context = [0, 0, 0, 0x0f, 0x00];
    let s2c_context = [0, 0, 0, 0x0f, 0x01];
    let label = b"EXPORTER-network-time-security/1";

    session.export_keying_material(&mut keys.c2s, label, Some(&c2s_context[..]))?;
    session.export_keying_material(&mut keys.s2c, label, Some(&s2c_context[..]))?;

    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_buffer_tracks_sent_cursor() {
        let mut buf = MessageBuffer::new();
        buf.load(vec![1, 2, 3, 4]);
        assert_eq!(buf.unsent(), &[1, 2, 3, 4]);
        buf.advance_sent(2);
        assert_eq!(buf.unsent(), &[3, 4]);
        assert!(!buf.fully_sent());
        buf.advance_sent(2);
        assert!(buf.fully_sent());
    }

    #[test]
    fn message_buffer_rejects_overflow() {
        let mut buf = MessageBuffer::new();
        assert!(buf.extend_received(&vec![0u8; MESSAGE_BUFFER_CAPACITY]));
        assert!(!buf.extend_received(&[0u8]));
    }
}
