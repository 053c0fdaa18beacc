//! NTP packet header and extension-field codec: RFC 5905 header plus the 4-byte-padded
//! extension-field framing RFC 7822 uses and NTS layers its authenticator onto.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use std::io::{Cursor, Error, ErrorKind, Read, Write};

use self::LeapState::*;
use self::PacketMode::*;

pub const UNIX_OFFSET: u64 = 2_208_988_800;
pub const TWO_POW_32: f64 = 4_294_967_296.0;

pub const HEADER_SIZE: usize = 48;

pub const EXT_UNIQUE_IDENTIFIER: u16 = 0x0104;
pub const EXT_NTS_COOKIE: u16 = 0x0204;
pub const EXT_NTS_COOKIE_PLACEHOLDER: u16 = 0x0304;
pub const EXT_NTS_AUTHENTICATOR: u16 = 0x0404;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LeapState {
    NoLeap = 0,
    Positive = 1,
    Negative = 2,
    Unknown = 3,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PacketMode {
    SymmetricActive = 1,
    SymmetricPassive = 2,
    Client = 3,
    Server = 4,
    Broadcast = 5,
    Invalid,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ExtensionType {
    UniqueIdentifier,
    NtsCookie,
    NtsCookiePlaceholder,
    NtsAuthenticator,
    Unknown(u16),
}

impl ExtensionType {
    fn wire(self) -> u16 {
        match self {
            ExtensionType::UniqueIdentifier => EXT_UNIQUE_IDENTIFIER,
            ExtensionType::NtsCookie => EXT_NTS_COOKIE,
            ExtensionType::NtsCookiePlaceholder => EXT_NTS_COOKIE_PLACEHOLDER,
            ExtensionType::NtsAuthenticator => EXT_NTS_AUTHENTICATOR,
            ExtensionType::Unknown(n) => n,
        }
    }

    fn from_wire(n: u16) -> ExtensionType {
        match n {
            EXT_UNIQUE_IDENTIFIER => ExtensionType::UniqueIdentifier,
            EXT_NTS_COOKIE => ExtensionType::NtsCookie,
            EXT_NTS_COOKIE_PLACEHOLDER => ExtensionType::NtsCookiePlaceholder,
            EXT_NTS_AUTHENTICATOR => ExtensionType::NtsAuthenticator,
            n => ExtensionType::Unknown(n),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacketHeader {
    pub leap_indicator: LeapState,
    pub version: u8,
    pub mode: PacketMode,
    pub stratum: u8,
    pub poll: i8,
    pub precision: i8,
    pub root_delay: u32,
    pub root_dispersion: u32,
    pub reference_id: u32,
    pub reference_timestamp: u64,
    pub origin_timestamp: u64,
    pub receive_timestamp: u64,
    pub transmit_timestamp: u64,
}

/// A plain extension field: type plus unpadded contents.
#[derive(Debug, Clone, PartialEq)]
pub struct Extension {
    pub ext_type: ExtensionType,
    pub contents: Vec<u8>,
}

/// Round `n` up to the next multiple of 4, per the padding rule in the extension-field codec.
pub fn padded(n: usize) -> usize {
    n + ((4 - (n % 4)) % 4)
}

fn parse_leap_indicator(first: u8) -> LeapState {
    match first >> 6 {
        0 => NoLeap,
        1 => Positive,
        2 => Negative,
        _ => LeapState::Unknown,
    }
}

fn parse_version(first: u8) -> u8 {
    (first & 0x38) >> 3
}

fn parse_mode(first: u8) -> PacketMode {
    match first & 0x07 {
        1 => SymmetricActive,
        2 => SymmetricPassive,
        3 => Client,
        4 => Server,
        5 => Broadcast,
        _ => Invalid,
    }
}

fn create_first(leap: LeapState, version: u8, mode: PacketMode) -> u8 {
    ((leap as u8) << 6) | ((version << 3) & 0x38) | ((mode as u8) & 0x07)
}

pub fn parse_header(packet: &[u8]) -> Result<PacketHeader, Error> {
    if packet.len() < HEADER_SIZE {
        return Err(Error::new(ErrorKind::InvalidInput, "packet shorter than an NTP header"));
    }
    let mut buf = Cursor::new(packet);
    let first = buf.read_u8()?;
    let stratum = buf.read_u8()?;
    let poll = buf.read_i8()?;
    let precision = buf.read_i8()?;
    let root_delay = buf.read_u32::<BigEndian>()?;
    let root_dispersion = buf.read_u32::<BigEndian>()?;
    let reference_id = buf.read_u32::<BigEndian>()?;
    let reference_timestamp = buf.read_u64::<BigEndian>()?;
    let origin_timestamp = buf.read_u64::<BigEndian>()?;
    let receive_timestamp = buf.read_u64::<BigEndian>()?;
    let transmit_timestamp = buf.read_u64::<BigEndian>()?;
    Ok(PacketHeader {
        leap_indicator: parse_leap_indicator(first),
        version: parse_version(first),
        mode: parse_mode(first),
        stratum,
        poll,
        precision,
        root_delay,
        root_dispersion,
        reference_id,
        reference_timestamp,
        origin_timestamp,
        receive_timestamp,
        transmit_timestamp,
    })
}

pub fn serialize_header(head: PacketHeader) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::with_capacity(HEADER_SIZE));
    buf.write_u8(create_first(head.leap_indicator, head.version, head.mode)).unwrap();
    buf.write_u8(head.stratum).unwrap();
    buf.write_i8(head.poll).unwrap();
    buf.write_i8(head.precision).unwrap();
    buf.write_u32::<BigEndian>(head.root_delay).unwrap();
    buf.write_u32::<BigEndian>(head.root_dispersion).unwrap();
    buf.write_u32::<BigEndian>(head.reference_id).unwrap();
    buf.write_u64::<BigEndian>(head.reference_timestamp).unwrap();
    buf.write_u64::<BigEndian>(head.origin_timestamp).unwrap();
    buf.write_u64::<BigEndian>(head.receive_timestamp).unwrap();
    buf.write_u64::<BigEndian>(head.transmit_timestamp).unwrap();
    buf.into_inner()
}

/// Parse plain (non-NTS) extension fields following the header: type, length (header-inclusive),
/// contents padded to a multiple of 4.
pub fn parse_extensions(buf: &[u8]) -> Result<Vec<Extension>, Error> {
    let mut reader = Cursor::new(buf);
    let mut out = Vec::new();
    while buf.len() - reader.position() as usize >= 4 {
        let ext_type = reader.read_u16::<BigEndian>()?;
        let ext_len = reader.read_u16::<BigEndian>()?;
        if ext_len < 4 || ext_len % 4 != 0 {
            return Err(Error::new(ErrorKind::InvalidInput, "malformed extension length"));
        }
        let mut contents = vec![0; (ext_len - 4) as usize];
        reader.read_exact(&mut contents)?;
        out.push(Extension {
            ext_type: ExtensionType::from_wire(ext_type),
            contents,
        });
    }
    Ok(out)
}

pub fn serialize_extensions(exts: &[Extension]) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    for ext in exts {
        if ext.contents.len() % 4 != 0 {
            panic!("extension contents are not word-aligned");
        }
        buf.write_u16::<BigEndian>(ext.ext_type.wire()).unwrap();
        buf.write_u16::<BigEndian>((ext.contents.len() + 4) as u16).unwrap();
        buf.write_all(&ext.contents).unwrap();
    }
    buf.into_inner()
}

/// An `NTS-Authenticator-and-Encrypted-EF` body, parsed or about to be serialized.
#[derive(Debug, Clone)]
pub struct AuthenticatorBody {
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

pub fn serialize_authenticator(auth: &AuthenticatorBody) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    buf.write_u16::<BigEndian>(auth.nonce.len() as u16).unwrap();
    buf.write_u16::<BigEndian>(auth.ciphertext.len() as u16).unwrap();
    buf.write_all(&auth.nonce).unwrap();
    for _ in 0..(padded(auth.nonce.len()) - auth.nonce.len()) {
        buf.write_u8(0).unwrap();
    }
    buf.write_all(&auth.ciphertext).unwrap();
    for _ in 0..(padded(auth.ciphertext.len()) - auth.ciphertext.len()) {
        buf.write_u8(0).unwrap();
    }
    buf.into_inner()
}

pub fn parse_authenticator(body: &[u8]) -> Result<AuthenticatorBody, Error> {
    if body.len() < 4 {
        return Err(Error::new(ErrorKind::InvalidInput, "authenticator body too short"));
    }
    let mut reader = Cursor::new(body);
    let nonce_len = reader.read_u16::<BigEndian>()? as usize;
    let ct_len = reader.read_u16::<BigEndian>()? as usize;
    let nonce_pad = padded(nonce_len);
    let ct_pad = padded(ct_len);
    if 4 + nonce_pad + ct_pad > body.len() {
        return Err(Error::new(ErrorKind::InvalidInput, "authenticator lengths exceed body"));
    }
    let nonce = body[4..4 + nonce_len].to_vec();
    let ciphertext = body[(4 + nonce_pad)..(4 + nonce_pad + ct_len)].to_vec();
    Ok(AuthenticatorBody { nonce, ciphertext })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> PacketHeader {
        PacketHeader {
            leap_indicator: NoLeap,
            version: 4,
            mode: Client,
            stratum: 0,
            poll: 6,
            precision: -20,
            root_delay: 0,
            root_dispersion: 0,
            reference_id: 0,
            reference_timestamp: 0,
            origin_timestamp: 0,
            receive_timestamp: 0,
            transmit_timestamp: 0xdeadbeef,
        }
    }

    #[test]
    fn header_roundtrips() {
        let h = header();
        let wire = serialize_header(h);
        assert_eq!(wire.len(), HEADER_SIZE);
        assert_eq!(parse_header(&wire).unwrap(), h);
    }

    #[test]
    fn padded_rounds_up_to_word_boundary() {
        assert_eq!(padded(0), 0);
        assert_eq!(padded(1), 4);
        assert_eq!(padded(4), 4);
        assert_eq!(padded(5), 8);
        assert_eq!(padded(32), 32);
    }

    #[test]
    fn authenticator_roundtrips_with_odd_length_nonce_and_ciphertext() {
        let auth = AuthenticatorBody {
            nonce: vec![1; 16],
            ciphertext: vec![2; 30],
        };
        let wire = serialize_authenticator(&auth);
        let parsed = parse_authenticator(&wire).unwrap();
        assert_eq!(parsed.nonce, auth.nonce);
        assert_eq!(parsed.ciphertext, auth.ciphertext);
    }

    #[test]
    fn extension_list_roundtrips() {
        let exts = vec![
            Extension {
                ext_type: ExtensionType::UniqueIdentifier,
                contents: vec![9; 32],
            },
            Extension {
                ext_type: ExtensionType::NtsCookie,
                contents: vec![8; 100],
            },
        ];
        let wire = serialize_extensions(&exts);
        let parsed = parse_extensions(&wire).unwrap();
        assert_eq!(parsed, exts);
    }
}
