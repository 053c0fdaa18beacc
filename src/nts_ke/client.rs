//! NTS-KE client: a synchronous `rustls::ClientSession` driver that performs one request/response
//! exchange and hands back the negotiated keys and cookies to the NTS-NTP client.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;

use rustls::{ClientConfig, ClientSession, ProtocolVersion, Session};

use crate::config::NtsClientConfig;
use crate::cookie::NTSKeys;
use crate::nts_ke::connection::derive_keys;
use crate::nts_ke::exchange::{process_response, KeResult, AES_SIV_CMAC_256, NTPV4_NEXT_PROTOCOL, NUM_COOKIES};
use crate::nts_ke::record::{self, RecordType, Validation};

const DEFAULT_KE_PORT: &str = "4460";
const DEFAULT_NTP_PORT: u16 = 123;

#[derive(Clone, Debug)]
pub struct NtsKeResult {
    pub cookies: Vec<Vec<u8>>,
    pub keys: NTSKeys,
    pub next_server: String,
    pub next_port: u16,
}

/// Reorder a resolved address list toward the requested family, if any. Falls back to the
/// unfiltered list if the preferred family doesn't appear in it at all.
fn preferred_addrs(addrs: Vec<SocketAddr>, use_ipv4: Option<bool>) -> Vec<SocketAddr> {
    match use_ipv4 {
        Some(want_ipv4) => {
            let preferred: Vec<SocketAddr> = addrs
                .iter()
                .copied()
                .filter(|addr| addr.is_ipv4() == want_ipv4)
                .collect();
            if preferred.is_empty() {
                addrs
            } else {
                preferred
            }
        }
        None => addrs,
    }
}

/// Connect to `host:port`, preferring addresses of the requested family if one was given.
fn connect(host: &str, port: u16, use_ipv4: Option<bool>) -> std::io::Result<TcpStream> {
    let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
    let addrs = preferred_addrs(addrs, use_ipv4);
    TcpStream::connect(&addrs[..])
}

fn build_request() -> Vec<u8> {
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
    record::append(&mut out, true, RecordType::EndOfMessage, &[]).unwrap();
    out
}

/// Connect to the NTS-KE server named by `config`, exchange one request/response, and return the
/// negotiated keys, cookies, and any server/port override the response carried.
pub fn run_nts_ke_client(config: NtsClientConfig) -> Result<NtsKeResult, Box<dyn std::error::Error>> {
    let mut root_store = rustls::RootCertStore::empty();
    match &config.trusted_cert {
        Some(cert) => {
            root_store.add(cert)?;
        }
        None => {
            root_store.add_server_trust_anchors(&webpki_roots::TLS_SERVER_ROOTS);
        }
    }

    let mut tls_config = ClientConfig::new();
    tls_config.root_store = root_store;
    tls_config.versions = vec![ProtocolVersion::TLSv1_3, ProtocolVersion::TLSv1_2];
    tls_config.set_protocols(&[b"ntske/1".to_vec()]);
    let rc_config = Arc::new(tls_config);

    let dns_name = webpki::DNSNameRef::try_from_ascii_str(&config.host)
        .map_err(|_| "invalid server hostname")?;
    let mut session = ClientSession::new(&rc_config, dns_name);

    let port = config.port.clone().unwrap_or_else(|| DEFAULT_KE_PORT.to_string());
    let mut socket = connect(&config.host, port.parse::<u16>()?, config.use_ipv4)?;

    {
        let mut stream = rustls::Stream::new(&mut session, &mut socket);
        stream.write_all(&build_request())?;
    }

    let keys = derive_keys(&session)?;

    let mut received = Vec::new();
    loop {
        match record::validate(&received, false) {
            Validation::Ok => break,
            Validation::Error => return Err("malformed NTS-KE response".into()),
            Validation::Incomplete => {}
        }

        let mut stream = rustls::Stream::new(&mut session, &mut socket);
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            if record::validate(&received, true) != Validation::Ok {
                return Err("connection closed before a complete response arrived".into());
            }
            break;
        }
        received.extend_from_slice(&chunk[..n]);
    }

    let KeResult {
        cookies,
        server_override,
        port_override,
    } = process_response(&received, NUM_COOKIES).map_err(|()| "invalid NTS-KE response")?;

    Ok(NtsKeResult {
        cookies,
        keys,
        next_server: server_override.unwrap_or(config.host),
        next_port: port_override.unwrap_or(DEFAULT_NTP_PORT),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_offers_ntpv4_and_aes_siv_cmac_256() {
        let request = build_request();
        assert_eq!(record::validate(&request, true), Validation::Ok);
        let records = record::iterate(&request);
        assert_eq!(records.len(), 3);
    }

    fn v4(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn v6(port: u16) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0, 0, 0, 0, 1], port))
    }

    #[test]
    fn no_preference_keeps_every_address() {
        let addrs = vec![v4(123), v6(123)];
        assert_eq!(preferred_addrs(addrs.clone(), None), addrs);
    }

    #[test]
    fn ipv4_preference_filters_out_ipv6() {
        let addrs = vec![v4(123), v6(123)];
        assert_eq!(preferred_addrs(addrs, Some(true)), vec![v4(123)]);
    }

    #[test]
    fn preference_falls_back_when_family_is_absent() {
        let addrs = vec![v4(123)];
        assert_eq!(preferred_addrs(addrs.clone(), Some(false)), addrs);
    }
}
