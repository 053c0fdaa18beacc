//! Request and response record logic for an NTS-KE exchange: what the server does with an
//! incoming request, and what both sides do with the records that come back out of it.

use byteorder::{BigEndian, WriteBytesExt};

use crate::cookie::{make_cookie, NTSKeys};
use crate::key_ring::KeyRing;
use crate::nts_ke::record::{self, ParsedRecord, RecordType};

pub const NTPV4_NEXT_PROTOCOL: u16 = 0;
pub const AES_SIV_CMAC_256: u16 = 15;
pub const NUM_COOKIES: usize = 8;
pub const MAX_COOKIE_LENGTH: usize = 256;

/// NTS-KE error codes (RFC 8915 section 4.3).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeErrorCode {
    UnrecognizedCriticalRecord = 0,
    BadRequest = 1,
    InternalServerError = 2,
}

/// Build the single-record error response for `code`, terminated by End-of-Message.
pub fn build_error_response(code: KeErrorCode) -> Vec<u8> {
    let mut out = Vec::new();
    let mut body = Vec::new();
    body.write_u16::<BigEndian>(code as u16).unwrap();
    record::append(&mut out, true, RecordType::Error, &body).unwrap();
    record::append(&mut out, true, RecordType::EndOfMessage, &[]).unwrap();
    out
}

/// Validate an already-framed request message, per the record-level rules of the negotiation:
/// Next-Protocol must be critical and offer NTPv4; AEAD-Algorithm must offer AES-SIV-CMAC-256;
/// an Error, Warning, or Cookie record in a request is malformed; an unrecognized critical record
/// is rejected with its own error code.
pub fn process_request(data: &[u8]) -> Result<(), KeErrorCode> {
    let mut have_next_protocol = false;
    let mut have_aead = false;

    for rec in record::iterate(data) {
        match rec {
            ParsedRecord::Known {
                critical,
                record_type,
                body,
            } => match record_type {
                RecordType::NextProtocol => {
                    if !critical {
                        return Err(KeErrorCode::BadRequest);
                    }
                    let offered = record::parse_u16s(&body).ok_or(KeErrorCode::BadRequest)?;
                    if offered.is_empty() {
                        return Err(KeErrorCode::BadRequest);
                    }
                    if offered.contains(&NTPV4_NEXT_PROTOCOL) {
                        have_next_protocol = true;
                    }
                }
                RecordType::AeadAlgorithm => {
                    let offered = record::parse_u16s(&body).ok_or(KeErrorCode::BadRequest)?;
                    if offered.is_empty() {
                        return Err(KeErrorCode::BadRequest);
                    }
                    if offered.contains(&AES_SIV_CMAC_256) {
                        have_aead = true;
                    }
                }
                RecordType::Error | RecordType::Warning | RecordType::Cookie => {
                    return Err(KeErrorCode::BadRequest);
                }
                RecordType::EndOfMessage | RecordType::Server | RecordType::Port => {}
            },
            ParsedRecord::Unknown { critical, .. } => {
                if critical {
                    return Err(KeErrorCode::UnrecognizedCriticalRecord);
                }
            }
        }
    }

    if !have_next_protocol || !have_aead {
        return Err(KeErrorCode::BadRequest);
    }

    Ok(())
}

/// Default NTP port assumed by a client unless a response overrides it.
pub const DEFAULT_NTP_PORT: u16 = 123;

/// Build a successful response: negotiated protocol/algorithm, an optional server override, an
/// optional port override (only advertised when it actually differs from 123), a batch of fresh
/// cookies sealed under the ring's current key, then End-of-Message.
pub fn build_response(
    keys: NTSKeys,
    ring: &KeyRing,
    server_override: Option<&str>,
    port_override: Option<u16>,
) -> Vec<u8> {
    let mut out = Vec::new();

    record::append(
        &mut out,
        true,
        RecordType::NextProtocol,
        &NTPV4_NEXT_PROTOCOL.to_be_bytes(),
    )
    .unwrap();
    record::append(
        &mut out,
        true,
        RecordType::AeadAlgorithm,
        &AES_SIV_CMAC_256.to_be_bytes(),
    )
    .unwrap();

    if let Some(server) = server_override {
        record::append(&mut out, true, RecordType::Server, server.as_bytes()).unwrap();
    }

    if let Some(port) = port_override.filter(|&port| port != DEFAULT_NTP_PORT) {
        record::append(&mut out, true, RecordType::Port, &port.to_be_bytes()).unwrap();
    }

    for _ in 0..NUM_COOKIES {
        let cookie = make_cookie(keys, ring);
        record::append(&mut out, false, RecordType::Cookie, &cookie).unwrap();
    }

    record::append(&mut out, true, RecordType::EndOfMessage, &[]).unwrap();
    out
}

/// What the client learns from a server's response.
#[derive(Clone, Debug, Default)]
pub struct KeResult {
    pub cookies: Vec<Vec<u8>>,
    pub server_override: Option<String>,
    pub port_override: Option<u16>,
}

/// Parse a response message on the client side. Rejects anything that doesn't name exactly our
/// negotiated protocol and algorithm, or that carries an Error/Warning record.
pub fn process_response(data: &[u8], max_cookies: usize) -> Result<KeResult, ()> {
    let mut result = KeResult::default();
    let mut seen_next_protocol = false;
    let mut seen_aead = false;

    for rec in record::iterate(data) {
        match rec {
            ParsedRecord::Known {
                critical,
                record_type,
                body,
            } => match record_type {
                RecordType::NextProtocol => {
                    if seen_next_protocol || !critical {
                        return Err(());
                    }
                    let offered = record::parse_u16s(&body).ok_or(())?;
                    if offered.len() != 1 || offered[0] != NTPV4_NEXT_PROTOCOL {
                        return Err(());
                    }
                    seen_next_protocol = true;
                }
                RecordType::AeadAlgorithm => {
                    if seen_aead {
                        return Err(());
                    }
                    let offered = record::parse_u16s(&body).ok_or(())?;
                    if offered.len() != 1 || offered[0] != AES_SIV_CMAC_256 {
                        return Err(());
                    }
                    seen_aead = true;
                }
                RecordType::Error | RecordType::Warning => return Err(()),
                RecordType::Cookie => {
                    if body.len() > MAX_COOKIE_LENGTH {
                        return Err(());
                    }
                    if result.cookies.len() < max_cookies {
                        result.cookies.push(body);
                    }
                }
                RecordType::Server => {
                    result.server_override = Some(String::from_utf8(body).map_err(|_| ())?);
                }
                RecordType::Port => {
                    if body.len() != 2 {
                        return Err(());
                    }
                    result.port_override = Some(((body[0] as u16) << 8) | body[1] as u16);
                }
                RecordType::EndOfMessage => {}
            },
            ParsedRecord::Unknown { critical, .. } => {
                if critical {
                    return Err(());
                }
            }
        }
    }

    if !seen_next_protocol || !seen_aead {
        return Err(());
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nts_ke::record::{self as rec, RecordType as RT};

    fn keys() -> NTSKeys {
        NTSKeys {
            c2s: [1; 32],
            s2c: [2; 32],
        }
    }

    #[test]
    fn full_exchange_roundtrips() {
        let mut request = Vec::new();
        rec::append(&mut request, true, RT::NextProtocol, &0u16.to_be_bytes()).unwrap();
        rec::append(&mut request, true, RT::AeadAlgorithm, &15u16.to_be_bytes()).unwrap();
        rec::append(&mut request, true, RT::EndOfMessage, &[]).unwrap();

        assert!(process_request(&request).is_ok());

        let ring = KeyRing::new();
        let response = build_response(keys(), &ring, None, None);
        let result = process_response(&response, NUM_COOKIES).unwrap();
        assert_eq!(result.cookies.len(), NUM_COOKIES);
        assert!(result.port_override.is_none());
    }

    #[test]
    fn port_override_of_123_is_not_advertised() {
        let ring = KeyRing::new();
        let response = build_response(keys(), &ring, None, Some(123));
        let result = process_response(&response, NUM_COOKIES).unwrap();
        assert!(result.port_override.is_none());
    }

    #[test]
    fn port_override_other_than_123_is_advertised() {
        let ring = KeyRing::new();
        let response = build_response(keys(), &ring, None, Some(4123));
        let result = process_response(&response, NUM_COOKIES).unwrap();
        assert_eq!(result.port_override, Some(4123));
    }

    #[test]
    fn server_override_is_advertised() {
        let ring = KeyRing::new();
        let response = build_response(keys(), &ring, Some("ntp.example.org"), None);
        let result = process_response(&response, NUM_COOKIES).unwrap();
        assert_eq!(result.server_override.as_deref(), Some("ntp.example.org"));
    }

    #[test]
    fn missing_next_protocol_is_bad_request() {
        let mut request = Vec::new();
        rec::append(&mut request, true, RT::AeadAlgorithm, &15u16.to_be_bytes()).unwrap();
        rec::append(&mut request, true, RT::EndOfMessage, &[]).unwrap();

        assert_eq!(process_request(&request), Err(KeErrorCode::BadRequest));
    }

    #[test]
    fn cookie_in_request_is_bad_request() {
        let mut request = Vec::new();
        rec::append(&mut request, true, RT::NextProtocol, &0u16.to_be_bytes()).unwrap();
        rec::append(&mut request, true, RT::AeadAlgorithm, &15u16.to_be_bytes()).unwrap();
        rec::append(&mut request, false, RT::Cookie, &[0; 4]).unwrap();
        rec::append(&mut request, true, RT::EndOfMessage, &[]).unwrap();

        assert_eq!(process_request(&request), Err(KeErrorCode::BadRequest));
    }

    #[test]
    fn unrecognized_critical_record_is_rejected() {
        let mut request = Vec::new();
        rec::append(&mut request, true, RT::NextProtocol, &0u16.to_be_bytes()).unwrap();
        rec::append(&mut request, true, RT::AeadAlgorithm, &15u16.to_be_bytes()).unwrap();
        // Raw unknown critical record, type 42.
        request.extend_from_slice(&[0x80 | 0x00, 42, 0x00, 0x00]);
        rec::append(&mut request, true, RT::EndOfMessage, &[]).unwrap();

        assert_eq!(
            process_request(&request),
            Err(KeErrorCode::UnrecognizedCriticalRecord)
        );
    }

    #[test]
    fn response_with_error_record_is_rejected_by_client() {
        let response = build_error_response(KeErrorCode::BadRequest);
        assert!(process_response(&response, NUM_COOKIES).is_err());
    }
}
