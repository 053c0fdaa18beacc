//! NTS-KE record codec: the `type|critical`, big-endian length, body wire format.
//!
//! `append` and `validate` operate directly on a flat byte buffer so they can be driven by the
//! connection state machine's message buffer (see `nts_ke::connection::MessageBuffer`) without an
//! intermediate allocation per record.

use byteorder::{BigEndian, WriteBytesExt};

use std::error;
use std::fmt;

pub const MAX_BODY_SIZE: usize = 65535;
const HEADER_SIZE: usize = 4;
const CRIT_BIT: u16 = 0x8000;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecordType {
    EndOfMessage = 0,
    NextProtocol = 1,
    Error = 2,
    Warning = 3,
    AeadAlgorithm = 4,
    Cookie = 5,
    Server = 6,
    Port = 7,
}

impl RecordType {
    fn from_u16(n: u16) -> Option<RecordType> {
        use RecordType::*;
        match n {
            0 => Some(EndOfMessage),
            1 => Some(NextProtocol),
            2 => Some(Error),
            3 => Some(Warning),
            4 => Some(AeadAlgorithm),
            5 => Some(Cookie),
            6 => Some(Server),
            7 => Some(Port),
            _ => None,
        }
    }
}

/// A record as seen while walking an already-framed message: either a known type with its
/// payload, or an unrecognized type passed through with its critical bit intact.
#[derive(Clone, Debug)]
pub enum ParsedRecord {
    Known {
        critical: bool,
        record_type: RecordType,
        body: Vec<u8>,
    },
    Unknown {
        critical: bool,
        type_id: u16,
        body: Vec<u8>,
    },
}

impl ParsedRecord {
    pub fn critical(&self) -> bool {
        match self {
            ParsedRecord::Known { critical, .. } => *critical,
            ParsedRecord::Unknown { critical, .. } => *critical,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecordError {
    BodyTooLarge,
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RecordError::BodyTooLarge => write!(f, "record body exceeds 65535 bytes"),
        }
    }
}

impl error::Error for RecordError {}

/// Append one record to `buf`. The caller is responsible for not exceeding the message buffer's
/// capacity; this only rejects bodies too long to be framed at all.
pub fn append(
    buf: &mut Vec<u8>,
    critical: bool,
    record_type: RecordType,
    body: &[u8],
) -> Result<(), RecordError> {
    if body.len() > MAX_BODY_SIZE {
        return Err(RecordError::BodyTooLarge);
    }
    let mut type_field = record_type as u16;
    if critical {
        type_field |= CRIT_BIT;
    }
    buf.write_u16::<BigEndian>(type_field).unwrap();
    buf.write_u16::<BigEndian>(body.len() as u16).unwrap();
    buf.extend_from_slice(body);
    Ok(())
}

/// Outcome of framing-level validation of a (possibly still-growing) message buffer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Validation {
    /// The buffer holds exactly one complete, properly terminated message.
    Ok,
    /// More bytes are needed before a verdict can be reached; only meaningful while `!eof`.
    Incomplete,
    /// The buffer can never become a valid message, regardless of further bytes.
    Error,
}

/// Validate the framing of `data` assuming `eof` bytes will never be followed by more.
///
/// A buffer validates as `Ok` iff it is a non-empty sequence of well-framed records whose last
/// (and only last) record is a critical End-of-Message record with an empty body. While more bytes
/// could still arrive (`!eof`), a buffer that merely hasn't reached that state yet is `Incomplete`
/// rather than `Error`; once `eof` is set, the same condition is terminal.
pub fn validate(data: &[u8], eof: bool) -> Validation {
    if data.is_empty() {
        return Validation::Error;
    }

    let mut records: Vec<(bool, u16, usize)> = Vec::new();
    let mut pos = 0usize;

    loop {
        let remaining = &data[pos..];
        if remaining.is_empty() {
            break;
        }
        if remaining.len() < HEADER_SIZE {
            return if eof { Validation::Error } else { Validation::Incomplete };
        }

        let mut raw_type = ((remaining[0] as u16) << 8) | remaining[1] as u16;
        let critical = raw_type & CRIT_BIT != 0;
        raw_type &= !CRIT_BIT;
        let length = ((remaining[2] as usize) << 8) | remaining[3] as usize;

        if remaining.len() < HEADER_SIZE + length {
            return if eof { Validation::Error } else { Validation::Incomplete };
        }

        records.push((critical, raw_type, length));
        pos += HEADER_SIZE + length;
    }

    // A record past the first End-of-Message violates "no trailing bytes" unconditionally.
    if let Some(eom_index) = records.iter().position(|(_, t, _)| *t == 0) {
        if eom_index != records.len() - 1 {
            return Validation::Error;
        }
    }

    match records.last() {
        Some((true, 0, 0)) => Validation::Ok,
        _ => {
            if eof {
                Validation::Error
            } else {
                Validation::Incomplete
            }
        }
    }
}

/// Walk a buffer already known to `validate` as `Ok` and return its records in order.
pub fn iterate(data: &[u8]) -> Vec<ParsedRecord> {
    let mut out = Vec::new();
    let mut pos = 0usize;

    while pos < data.len() {
        let remaining = &data[pos..];
        let mut raw_type = ((remaining[0] as u16) << 8) | remaining[1] as u16;
        let critical = raw_type & CRIT_BIT != 0;
        raw_type &= !CRIT_BIT;
        let length = ((remaining[2] as usize) << 8) | remaining[3] as usize;
        let body = remaining[HEADER_SIZE..HEADER_SIZE + length].to_vec();

        out.push(match RecordType::from_u16(raw_type) {
            Some(record_type) => ParsedRecord::Known {
                critical,
                record_type,
                body,
            },
            None => ParsedRecord::Unknown {
                critical,
                type_id: raw_type,
                body,
            },
        });
        pos += HEADER_SIZE + length;
    }

    out
}

/// Parse a two-byte-aligned list of big-endian `u16`s (used by Next-Protocol and AEAD-Algorithm
/// bodies, which may offer more than one value).
pub fn parse_u16s(body: &[u8]) -> Option<Vec<u16>> {
    if body.len() % 2 != 0 {
        return None;
    }
    Some(
        body.chunks_exact(2)
            .map(|c| ((c[0] as u16) << 8) | c[1] as u16)
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s1_incomplete_then_error() {
        let data = [0x00, 0x01, 0x00, 0x02, 0x00, 0x00];
        assert_eq!(validate(&data, false), Validation::Incomplete);
        assert_eq!(validate(&data, true), Validation::Error);
    }

    #[test]
    fn s2_lone_critical_eom_is_ok() {
        let data = [0x80, 0x00, 0x00, 0x00];
        assert_eq!(validate(&data, false), Validation::Ok);
        assert_eq!(validate(&data, true), Validation::Ok);
    }

    #[test]
    fn empty_buffer_is_always_error() {
        assert_eq!(validate(&[], false), Validation::Error);
        assert_eq!(validate(&[], true), Validation::Error);
    }

    #[test]
    fn trailing_bytes_after_eom_are_an_error() {
        let mut data = Vec::new();
        append(&mut data, true, RecordType::EndOfMessage, &[]).unwrap();
        append(&mut data, false, RecordType::Warning, &[0, 1]).unwrap();
        assert_eq!(validate(&data, false), Validation::Error);
        assert_eq!(validate(&data, true), Validation::Error);
    }

    #[test]
    fn append_then_iterate_roundtrips() {
        let mut data = Vec::new();
        append(&mut data, true, RecordType::NextProtocol, &[0, 0]).unwrap();
        append(&mut data, true, RecordType::AeadAlgorithm, &[0x0f, 0x01]).unwrap();
        append(&mut data, true, RecordType::EndOfMessage, &[]).unwrap();

        assert_eq!(validate(&data, true), Validation::Ok);

        let records = iterate(&data);
        assert_eq!(records.len(), 3);
        match &records[0] {
            ParsedRecord::Known {
                critical,
                record_type,
                body,
            } => {
                assert!(*critical);
                assert_eq!(*record_type, RecordType::NextProtocol);
                assert_eq!(body, &[0, 0]);
            }
            _ => panic!("expected a known record"),
        }
    }

    #[test]
    fn body_too_large_is_rejected() {
        let mut data = Vec::new();
        let huge = vec![0u8; MAX_BODY_SIZE + 1];
        assert_eq!(
            append(&mut data, false, RecordType::Cookie, &huge),
            Err(RecordError::BodyTooLarge)
        );
    }
}
