//! NTS-NTP server: validates authenticated requests, answers plain NTP queries passed through
//! unauthenticated, and issues a Kiss-of-Death when a client's cookie or authenticator can't be
//! honored.

use std::io::{Error, ErrorKind};
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::{Duration, SystemTime};

use crossbeam::sync::WaitGroup;
use rand::Rng;
use slog::{error, info};

use crate::cfsock;
use crate::config::NtpServerConfig;
use crate::cookie::{eat_cookie, get_keyid, make_cookie, NTSKeys};
use crate::key_ring::KeyRing;
use crate::metrics::{NTP_KOD_TOTAL, NTP_NTS_QUERIES_TOTAL, NTP_QUERIES_TOTAL};
use crate::ntp::aead::NtpAead;
use crate::ntp::packet::{
    self, AuthenticatorBody, Extension, ExtensionType, LeapState, PacketHeader, PacketMode,
    TWO_POW_32, UNIX_OFFSET,
};

const BUF_SIZE: usize = 1280;

/// Local reference-clock state, refreshed either once at startup (we are stratum 1) or
/// continuously from an upstream NTP server (§2.2).
#[derive(Clone, Copy, Debug)]
struct ServerState {
    leap: LeapState,
    stratum: u8,
    poll: i8,
    precision: i8,
    root_delay: u32,
    root_dispersion: u32,
    refid: u32,
    refstamp: u64,
}

fn ntp_timestamp(time: SystemTime) -> u64 {
    let unix_time = time.duration_since(SystemTime::UNIX_EPOCH).unwrap();
    let epoch_time = unix_time + Duration::new(UNIX_OFFSET, 0);
    let ts_secs = epoch_time.as_secs();
    let ts_frac = ((epoch_time.subsec_nanos() as f64 * TWO_POW_32) / 1.0e9).round() as u32;
    (ts_secs << 32) + ts_frac as u64
}

fn create_header(query: &PacketHeader, state: &ServerState, transmit: SystemTime) -> PacketHeader {
    PacketHeader {
        leap_indicator: state.leap,
        version: 4,
        mode: PacketMode::Server,
        stratum: state.stratum,
        poll: state.poll,
        precision: state.precision,
        root_delay: state.root_delay,
        root_dispersion: state.root_dispersion,
        reference_id: state.refid,
        reference_timestamp: state.refstamp,
        origin_timestamp: query.transmit_timestamp,
        receive_timestamp: ntp_timestamp(SystemTime::now()),
        transmit_timestamp: ntp_timestamp(transmit),
    }
}

/// Build a Kiss-of-Death response (stratum 0, reference id "NTSN"), echoing the client's
/// unique id in plaintext when the request carried one.
fn kiss_of_death(query: &PacketHeader, unique_id: Option<Extension>) -> Vec<u8> {
    NTP_KOD_TOTAL.inc();
    let kod_header = PacketHeader {
        leap_indicator: LeapState::Unknown,
        version: 4,
        mode: PacketMode::Server,
        stratum: 0,
        poll: 0,
        precision: 0,
        root_delay: 0,
        root_dispersion: 0,
        reference_id: 0x4e54534e, // "NTSN"
        reference_timestamp: 0,
        origin_timestamp: query.transmit_timestamp,
        receive_timestamp: 0,
        transmit_timestamp: 0,
    };
    let mut wire = packet::serialize_header(kod_header);
    if let Some(uid) = unique_id {
        wire.extend(packet::serialize_extensions(&[uid]));
    }
    wire
}

/// Validate an authenticated request: exactly one real cookie, a verifying authenticator. Returns
/// the negotiated keys and the plain extensions preceding the authenticator (needed to build the
/// response: the unique id to echo and the cookie/placeholder count to refill).
fn check_request_auth(
    header: PacketHeader,
    packet: &[u8],
    key_ring: &KeyRing,
) -> Result<(NTSKeys, Vec<Extension>), Error> {
    let exts = packet::parse_extensions(&packet[packet::HEADER_SIZE..])?;

    let auth_index = exts
        .iter()
        .position(|e| e.ext_type == ExtensionType::NtsAuthenticator)
        .ok_or_else(|| Error::new(ErrorKind::InvalidData, "request missing an authenticator"))?;

    let cookies: Vec<&Extension> = exts[..auth_index]
        .iter()
        .filter(|e| e.ext_type == ExtensionType::NtsCookie)
        .collect();
    if cookies.len() != 1 {
        return Err(Error::new(ErrorKind::InvalidData, "request must carry exactly one cookie"));
    }
    let cookie = cookies[0];
    if get_keyid(&cookie.contents).is_none() {
        return Err(Error::new(ErrorKind::InvalidData, "malformed cookie"));
    }
    let keys = eat_cookie(&cookie.contents, key_ring)
        .ok_or_else(|| Error::new(ErrorKind::InvalidData, "cookie could not be opened"))?;

    let mut ad = packet::serialize_header(header);
    ad.extend(packet::serialize_extensions(&exts[..auth_index]));

    let auth = packet::parse_authenticator(&exts[auth_index].contents)?;
    let mut aead = NtpAead::new(&keys.c2s);
    aead.decrypt(&auth.nonce, &ad, &auth.ciphertext)
        .ok_or_else(|| Error::new(ErrorKind::InvalidData, "authenticator failed to verify"))?;

    Ok((keys, exts[..auth_index].to_vec()))
}

/// Build an authenticated response: echo the unique id, refill one fresh cookie per cookie or
/// placeholder the request carried, then authenticate.
fn generate_response_auth(
    request_exts: &[Extension],
    keys: NTSKeys,
    key_ring: &KeyRing,
    header: PacketHeader,
) -> Vec<u8> {
    let mut resp_exts = Vec::new();
    if let Some(uid) = request_exts.iter().find(|e| e.ext_type == ExtensionType::UniqueIdentifier) {
        resp_exts.push(uid.clone());
    }

    let refill_count = request_exts
        .iter()
        .filter(|e| {
            e.ext_type == ExtensionType::NtsCookie || e.ext_type == ExtensionType::NtsCookiePlaceholder
        })
        .count();
    for _ in 0..refill_count.max(1) {
        resp_exts.push(Extension {
            ext_type: ExtensionType::NtsCookie,
            contents: make_cookie(keys, key_ring),
        });
    }

    let mut wire = packet::serialize_header(header);
    wire.extend(packet::serialize_extensions(&resp_exts));

    let mut nonce = [0u8; 16];
    rand::thread_rng().fill(&mut nonce);
    let mut send_aead = NtpAead::new(&keys.s2c);
    let ciphertext = send_aead.encrypt(&nonce, &wire, &[]);
    let auth = AuthenticatorBody {
        nonce: nonce.to_vec(),
        ciphertext,
    };
    wire.extend(packet::serialize_extensions(&[Extension {
        ext_type: ExtensionType::NtsAuthenticator,
        contents: packet::serialize_authenticator(&auth),
    }]));
    wire
}

fn response(
    query: &[u8],
    state: &ServerState,
    key_ring: &KeyRing,
    logger: &slog::Logger,
) -> Result<Vec<u8>, Error> {
    let query_header = packet::parse_header(query)?;
    NTP_QUERIES_TOTAL.inc();

    if query_header.mode != PacketMode::Client {
        return Err(Error::new(ErrorKind::InvalidData, "request is not in client mode"));
    }

    let resp_header = create_header(&query_header, state, SystemTime::now());
    let exts = packet::parse_extensions(&query[packet::HEADER_SIZE..])?;

    if exts.is_empty() {
        return Ok(packet::serialize_header(resp_header));
    }

    NTP_NTS_QUERIES_TOTAL.inc();
    let unique_id = exts.iter().find(|e| e.ext_type == ExtensionType::UniqueIdentifier).cloned();

    match check_request_auth(query_header, query, key_ring) {
        Ok((keys, request_exts)) => Ok(generate_response_auth(&request_exts, keys, key_ring, resp_header)),
        Err(err) => {
            error!(logger, "rejecting NTS-NTP request: {:?}", err);
            Ok(kiss_of_death(&query_header, unique_id))
        }
    }
}

fn run_server(socket: UdpSocket, key_ring: Arc<RwLock<KeyRing>>, state: Arc<RwLock<ServerState>>, logger: slog::Logger) {
    let mut buf = [0; BUF_SIZE];
    loop {
        let (size, src) = match socket.recv_from(&mut buf) {
            Ok(v) => v,
            Err(err) => {
                error!(logger, "error receiving packet: {:?}", err);
                continue;
            }
        };

        let resp = {
            let ring = key_ring.read().unwrap();
            let state = state.read().unwrap();
            response(&buf[..size], &state, &ring, &logger)
        };

        match resp {
            Ok(data) => {
                if let Err(err) = socket.send_to(&data, src) {
                    error!(logger, "error sending response: {:?}", err);
                }
            }
            Err(err) => {
                error!(logger, "dropping mangled packet: {:?}", err);
            }
        }
    }
}

/// Periodically query an upstream server and mirror its leap/stratum/poll/precision/dispersion
/// into our `ServerState`, the way a reference-clock-less relay keeps plausible values in its own
/// responses.
fn refresh_upstream(state: Arc<RwLock<ServerState>>, logger: slog::Logger, upstream: (String, u16)) {
    let socket = match UdpSocket::bind("0.0.0.0:0") {
        Ok(s) => s,
        Err(err) => {
            error!(logger, "cannot bind upstream refresh socket: {:?}", err);
            return;
        }
    };
    let _ = socket.set_read_timeout(Some(Duration::from_secs(1)));

    loop {
        let query_header = PacketHeader {
            leap_indicator: LeapState::Unknown,
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
            transmit_timestamp: ntp_timestamp(SystemTime::now()),
        };
        let wire = packet::serialize_header(query_header);

        if socket.connect((upstream.0.as_str(), upstream.1)).is_ok() && socket.send(&wire).is_ok() {
            let mut buf = [0; 128];
            if let Ok(size) = socket.recv(&mut buf) {
                if let Ok(resp_header) = packet::parse_header(&buf[..size]) {
                    let mut guard = state.write().unwrap();
                    guard.leap = resp_header.leap_indicator;
                    guard.stratum = resp_header.stratum.saturating_add(1);
                    guard.poll = resp_header.poll;
                    guard.precision = resp_header.precision;
                    guard.root_delay = resp_header.root_delay;
                    guard.root_dispersion = resp_header.root_dispersion;
                    guard.refid = resp_header.reference_id;
                    guard.refstamp = resp_header.reference_timestamp;
                    info!(logger, "refreshed reference state from upstream, stratum {}", guard.stratum);
                }
            }
        }

        thread::sleep(Duration::from_secs(64));
    }
}

/// Load configuration and run the NTS-NTP server until the process is killed.
pub fn start_ntp_server(config: NtpServerConfig, logger: slog::Logger) -> Result<(), Box<dyn std::error::Error>> {
    let key_ring = Arc::new(RwLock::new(KeyRing::new()));
    {
        let key_ring = key_ring.clone();
        let logger = logger.new(slog::o!("component" => "key_ring"));
        thread::spawn(move || loop {
            thread::sleep(crate::key_ring::ROTATION_PERIOD);
            key_ring.write().unwrap().rotate();
            info!(logger, "rotated NTS-NTP server key ring");
        });
    }

    let initial_state = ServerState {
        leap: LeapState::NoLeap,
        stratum: 1,
        poll: 7,
        precision: -18,
        root_delay: 0,
        root_dispersion: 0,
        refid: 0,
        refstamp: 0,
    };
    let state = Arc::new(RwLock::new(initial_state));

    if let Some(upstream) = config.upstream_addr.clone() {
        let state = state.clone();
        let logger = logger.new(slog::o!("component" => "upstream"));
        state.write().unwrap().stratum = 16;
        thread::spawn(move || refresh_upstream(state, logger, upstream));
    }

    if let Some(metrics_config) = config.metrics.clone() {
        let logger = logger.new(slog::o!("component" => "metrics"));
        thread::spawn(move || {
            if let Err(err) = crate::metrics::run_metrics(metrics_config) {
                error!(logger, "metrics server failed: {:?}", err);
            }
        });
    }

    let wg = WaitGroup::new();
    for addr in &config.addrs {
        let addr: SocketAddr = addr.to_socket_addrs()?.next().ok_or_else(|| {
            std::io::Error::new(ErrorKind::InvalidInput, "could not resolve listen address")
        })?;
        let socket = cfsock::udp_listen(&addr)?;
        info!(logger, "listening for NTS-NTP on {}", addr);

        let key_ring = key_ring.clone();
        let state = state.clone();
        let logger = logger.new(slog::o!("listen_addr" => format!("{}", addr)));
        let wg = wg.clone();
        thread::spawn(move || {
            run_server(socket, key_ring, state, logger);
            drop(wg);
        });
    }

    wg.wait();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_header(transmit: u64) -> PacketHeader {
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
            transmit_timestamp: transmit,
        }
    }

    fn server_state() -> ServerState {
        ServerState {
            leap: LeapState::NoLeap,
            stratum: 1,
            poll: 6,
            precision: -20,
            root_delay: 0,
            root_dispersion: 0,
            refid: 0,
            refstamp: 0,
        }
    }

    #[test]
    fn plain_request_gets_a_plain_response() {
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let ring = KeyRing::new();
        let state = server_state();

        let query = packet::serialize_header(client_header(42));
        let resp = response(&query, &state, &ring, &logger).unwrap();
        let resp_header = packet::parse_header(&resp).unwrap();
        assert_eq!(resp_header.mode, PacketMode::Server);
        assert_eq!(resp_header.origin_timestamp, 42);
    }

    #[test]
    fn authenticated_round_trip_refills_a_cookie() {
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let ring = KeyRing::new();
        let keys = NTSKeys { c2s: [5; 32], s2c: [6; 32] };
        let cookie = make_cookie(keys, &ring);

        let header = client_header(1);
        let plain_exts = vec![
            Extension {
                ext_type: ExtensionType::UniqueIdentifier,
                contents: vec![1; 32],
            },
            Extension {
                ext_type: ExtensionType::NtsCookie,
                contents: cookie,
            },
        ];
        let mut wire = packet::serialize_header(header);
        wire.extend(packet::serialize_extensions(&plain_exts));
        let mut send_aead = NtpAead::new(&keys.c2s);
        let nonce = [9u8; 16];
        let ciphertext = send_aead.encrypt(&nonce, &wire, &[]);
        let auth = AuthenticatorBody { nonce: nonce.to_vec(), ciphertext };
        wire.extend(packet::serialize_extensions(&[Extension {
            ext_type: ExtensionType::NtsAuthenticator,
            contents: packet::serialize_authenticator(&auth),
        }]));

        let state = server_state();
        let resp = response(&wire, &state, &ring, &logger).unwrap();
        let resp_header = packet::parse_header(&resp).unwrap();
        assert_eq!(resp_header.mode, PacketMode::Server);

        let resp_exts = packet::parse_extensions(&resp[packet::HEADER_SIZE..]).unwrap();
        assert!(resp_exts.iter().any(|e| e.ext_type == ExtensionType::NtsCookie));
        assert!(resp_exts.iter().any(|e| e.ext_type == ExtensionType::UniqueIdentifier));
    }

    #[test]
    fn tampered_cookie_yields_a_kiss_of_death() {
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let ring = KeyRing::new();
        let keys = NTSKeys { c2s: [5; 32], s2c: [6; 32] };
        let mut cookie = make_cookie(keys, &ring);
        cookie[50] ^= 0xff;

        let header = client_header(1);
        let plain_exts = vec![
            Extension {
                ext_type: ExtensionType::UniqueIdentifier,
                contents: vec![1; 32],
            },
            Extension {
                ext_type: ExtensionType::NtsCookie,
                contents: cookie,
            },
        ];
        let mut wire = packet::serialize_header(header);
        wire.extend(packet::serialize_extensions(&plain_exts));
        let mut send_aead = NtpAead::new(&keys.c2s);
        let nonce = [9u8; 16];
        let ciphertext = send_aead.encrypt(&nonce, &wire, &[]);
        let auth = AuthenticatorBody { nonce: nonce.to_vec(), ciphertext };
        wire.extend(packet::serialize_extensions(&[Extension {
            ext_type: ExtensionType::NtsAuthenticator,
            contents: packet::serialize_authenticator(&auth),
        }]));

        let state = server_state();
        let resp = response(&wire, &state, &ring, &logger).unwrap();
        let resp_header = packet::parse_header(&resp).unwrap();
        assert_eq!(resp_header.stratum, 0);
        assert_eq!(resp_header.reference_id, 0x4e54534e);
    }
}
