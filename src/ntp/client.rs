//! NTS-NTP client: turns a negotiated key-exchange result into a stream of authenticated NTP
//! requests, verifying each server response and replenishing its cookie supply as it goes.

use std::collections::VecDeque;
use std::io::{Error, ErrorKind};
use std::net::UdpSocket;
use std::time::SystemTime;

use rand::Rng;
use slog::info;

use crate::nts_ke::client::NtsKeResult;
use crate::ntp::aead::NtpAead;
use crate::ntp::packet::{
    self, padded, AuthenticatorBody, Extension, ExtensionType, LeapState, PacketHeader, PacketMode,
};

/// Cap on outstanding cookies the server will ever hand us in one go (§4.H: 8 per response).
const MAX_COOKIES: usize = 8;

pub struct NtpResult {
    pub stratum: u8,
    pub time_diff: f64,
}

/// Per-connection NTS-NTP authentication state: the AEAD contexts derived from the KE exchange,
/// the cookie supply, and the unique id/nonce pair covering the in-flight request.
pub struct NtsNtpClient {
    send_aead: NtpAead,
    recv_aead: NtpAead,
    cookies: VecDeque<Vec<u8>>,
    unique_id: [u8; 32],
    nonce: [u8; 16],
}

impl NtsNtpClient {
    pub fn new(ke_result: &NtsKeResult) -> NtsNtpClient {
        let mut unique_id = [0u8; 32];
        rand::thread_rng().fill(&mut unique_id[..]);
        let mut nonce = [0u8; 16];
        rand::thread_rng().fill(&mut nonce[..]);

        NtsNtpClient {
            send_aead: NtpAead::new(&ke_result.keys.c2s),
            recv_aead: NtpAead::new(&ke_result.keys.s2c),
            cookies: ke_result.cookies.clone().into(),
            unique_id,
            nonce,
        }
    }

    /// Ensure a fresh unique-id/nonce pair is ready for the next request and report whether a
    /// cookie is available to spend.
    pub fn prepare_for_auth(&mut self) -> bool {
        rand::thread_rng().fill(&mut self.unique_id[..]);
        rand::thread_rng().fill(&mut self.nonce[..]);
        !self.cookies.is_empty()
    }

    /// Build an authenticated request packet around `header`. Consumes one cookie from the ring.
    pub fn generate_request_auth(&mut self, header: PacketHeader) -> Result<Vec<u8>, Error> {
        let cookie = self
            .cookies
            .pop_front()
            .ok_or_else(|| Error::new(ErrorKind::Other, "no cookie available to spend"))?;
        let cookie_len = cookie.len();

        let mut plain_exts = vec![
            Extension {
                ext_type: ExtensionType::UniqueIdentifier,
                contents: self.unique_id.to_vec(),
            },
            Extension {
                ext_type: ExtensionType::NtsCookie,
                contents: cookie,
            },
        ];

        let placeholders_needed = MAX_COOKIES.saturating_sub(self.cookies.len() + 1);
        for _ in 0..placeholders_needed {
            plain_exts.push(Extension {
                ext_type: ExtensionType::NtsCookiePlaceholder,
                contents: vec![0; padded(cookie_len)],
            });
        }

        let mut wire = packet::serialize_header(header);
        wire.extend(packet::serialize_extensions(&plain_exts));

        let ciphertext = self.send_aead.encrypt(&self.nonce, &wire, &[]);
        let auth = AuthenticatorBody {
            nonce: self.nonce.to_vec(),
            ciphertext,
        };
        wire.extend(packet::serialize_extensions(&[Extension {
            ext_type: ExtensionType::NtsAuthenticator,
            contents: packet::serialize_authenticator(&auth),
        }]));

        Ok(wire)
    }

    /// Verify a server response against the unique id and S2C key of the in-flight request,
    /// absorbing any cookies it carries back into the ring.
    pub fn check_response_auth(&mut self, packet: &[u8]) -> Result<(), Error> {
        let header = packet::parse_header(packet)?;
        if header.mode != PacketMode::Server {
            return Err(Error::new(ErrorKind::InvalidData, "response is not in server mode"));
        }

        let exts = packet::parse_extensions(&packet[packet::HEADER_SIZE..])?;
        if exts.is_empty() {
            return Err(Error::new(ErrorKind::InvalidData, "response carries no extensions"));
        }

        let auth_index = exts
            .iter()
            .position(|e| e.ext_type == ExtensionType::NtsAuthenticator)
            .ok_or_else(|| Error::new(ErrorKind::InvalidData, "response missing an authenticator"))?;

        let unique_id = exts
            .iter()
            .find(|e| e.ext_type == ExtensionType::UniqueIdentifier)
            .ok_or_else(|| Error::new(ErrorKind::InvalidData, "response missing a unique id"))?;
        if unique_id.contents != self.unique_id {
            return Err(Error::new(ErrorKind::InvalidData, "unique id does not match the request"));
        }

        let mut ad = packet::serialize_header(header);
        ad.extend(packet::serialize_extensions(&exts[..auth_index]));

        let auth = packet::parse_authenticator(&exts[auth_index].contents)?;
        self.recv_aead
            .decrypt(&auth.nonce, &ad, &auth.ciphertext)
            .ok_or_else(|| Error::new(ErrorKind::InvalidData, "authenticator failed to verify"))?;

        for ext in &exts[..auth_index] {
            if ext.ext_type == ExtensionType::NtsCookie && self.cookies.len() < MAX_COOKIES {
                self.cookies.push_back(ext.contents.clone());
            }
        }

        Ok(())
    }
}

/// Send one authenticated request to the negotiated server/port and validate its response.
pub fn run_nts_ntp_client(logger: &slog::Logger, ke_result: NtsKeResult) -> Result<NtpResult, Error> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect((ke_result.next_server.as_str(), ke_result.next_port))?;

    let mut client = NtsNtpClient::new(&ke_result);
    if !client.prepare_for_auth() {
        return Err(Error::new(ErrorKind::Other, "no cookies available from key exchange"));
    }

    let header = PacketHeader {
        leap_indicator: LeapState::NoLeap,
        version: 4,
        mode: PacketMode::Client,
        stratum: 0,
        poll: 0,
        precision: 0x20,
        root_delay: 0,
        root_dispersion: 0,
        reference_id: 0,
        reference_timestamp: 0,
        origin_timestamp: 0,
        receive_timestamp: 0,
        transmit_timestamp: ntp_timestamp(SystemTime::now()),
    };

    let request = client.generate_request_auth(header)?;
    socket.send(&request)?;
    info!(logger, "transmitted NTS-NTP request");

    let mut buf = [0; 2048];
    let (size, _) = socket.recv_from(&mut buf)?;
    client.check_response_auth(&buf[..size])?;
    info!(logger, "verified NTS-NTP response");

    let response_header = packet::parse_header(&buf[..size])?;
    Ok(NtpResult {
        stratum: response_header.stratum,
        time_diff: 0.0,
    })
}

fn ntp_timestamp(time: SystemTime) -> u64 {
    let unix_time = time.duration_since(SystemTime::UNIX_EPOCH).unwrap();
    let epoch_time = unix_time + std::time::Duration::new(packet::UNIX_OFFSET, 0);
    let ts_secs = epoch_time.as_secs();
    let ts_frac = ((epoch_time.subsec_nanos() as f64 * packet::TWO_POW_32) / 1.0e9).round() as u32;
    (ts_secs << 32) + ts_frac as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cookie::NTSKeys;

    fn ke_result() -> NtsKeResult {
        NtsKeResult {
            cookies: vec![vec![1; 100], vec![2; 100]],
            keys: NTSKeys {
                c2s: [3; 32],
                s2c: [4; 32],
            },
            next_server: "127.0.0.1".to_string(),
            next_port: 123,
        }
    }

    fn header() -> PacketHeader {
        PacketHeader {
            leap_indicator: LeapState::NoLeap,
            version: 4,
            mode: PacketMode::Client,
            stratum: 0,
            poll: 0,
            precision: 0,
            root_delay: 0,
            root_dispersion: 0,
            reference_id: 0,
            reference_timestamp: 0,
            origin_timestamp: 0,
            receive_timestamp: 0,
            transmit_timestamp: 0,
        }
    }

    #[test]
    fn prepare_for_auth_reports_cookie_availability() {
        let mut client = NtsNtpClient::new(&ke_result());
        assert!(client.prepare_for_auth());
        client.cookies.clear();
        assert!(!client.prepare_for_auth());
    }

    #[test]
    fn generate_request_consumes_a_cookie() {
        let mut client = NtsNtpClient::new(&ke_result());
        let before = client.cookies.len();
        let request = client.generate_request_auth(header()).unwrap();
        assert_eq!(client.cookies.len(), before - 1);
        assert!(request.len() > packet::HEADER_SIZE);
    }

    #[test]
    fn request_without_cookies_fails() {
        let mut client = NtsNtpClient::new(&ke_result());
        client.cookies.clear();
        assert!(client.generate_request_auth(header()).is_err());
    }
}
