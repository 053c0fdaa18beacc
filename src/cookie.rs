//! The NKE cookie wire format: `{ key_id: u32_be, nonce: 16 bytes, ciphertext: 80 bytes }`.
//!
//! Sealing and decryption are delegated to a `KeyRing`; this module owns only the fixed-offset
//! serialization the cookie presents on the wire.

use rand::Rng;

use std::convert::TryInto;

use crate::key_ring::KeyRing;

pub const COOKIE_SIZE: usize = 100;

#[derive(Debug, Copy, Clone)]
pub struct NTSKeys {
    pub c2s: [u8; 32],
    pub s2c: [u8; 32],
}

fn pack(keys: NTSKeys) -> [u8; 64] {
    let mut plaintext = [0; 64];
    plaintext[..32].copy_from_slice(&keys.c2s);
    plaintext[32..].copy_from_slice(&keys.s2c);
    plaintext
}

fn unpack(pt: &[u8]) -> Option<NTSKeys> {
    if pt.len() != 64 {
        return None;
    }
    let mut keys = NTSKeys {
        c2s: [0; 32],
        s2c: [0; 32],
    };
    keys.c2s.copy_from_slice(&pt[..32]);
    keys.s2c.copy_from_slice(&pt[32..64]);
    Some(keys)
}

/// Seal `keys` into a fresh cookie under the ring's current key.
pub fn make_cookie(keys: NTSKeys, ring: &KeyRing) -> Vec<u8> {
    let mut nonce = [0; 16];
    rand::thread_rng().fill(&mut nonce);

    let plaintext = pack(keys);
    let (key_id, ciphertext) = ring.seal(&nonce, &plaintext);

    let mut out = Vec::with_capacity(COOKIE_SIZE);
    out.extend(&key_id.to_be_bytes());
    out.extend(&nonce);
    out.extend(ciphertext);
    out
}

/// Extract the key id a cookie claims to be sealed under, without opening it.
pub fn get_keyid(cookie: &[u8]) -> Option<u32> {
    if cookie.len() < 4 {
        None
    } else {
        Some(u32::from_be_bytes(cookie[0..4].try_into().unwrap()))
    }
}

/// Open a cookie previously produced by `make_cookie`. Returns `None` if the key id is unknown to
/// the ring, the cookie is too short to be well-formed, or the AEAD tag fails to verify.
pub fn eat_cookie(cookie: &[u8], ring: &KeyRing) -> Option<NTSKeys> {
    if cookie.len() != COOKIE_SIZE {
        return None;
    }
    let key_id = get_keyid(cookie)?;
    let nonce: [u8; 16] = cookie[4..20].try_into().unwrap();
    let ciphertext = &cookie[20..];

    let plaintext = ring.open(key_id, &nonce, ciphertext)?;
    unpack(&plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_eq(a: NTSKeys, b: NTSKeys) {
        assert_eq!(a.c2s, b.c2s);
        assert_eq!(a.s2c, b.s2c);
    }

    #[test]
    fn roundtrips_through_the_ring() {
        let ring = KeyRing::new();
        let keys = NTSKeys {
            s2c: [9; 32],
            c2s: [10; 32],
        };

        let cookie = make_cookie(keys, &ring);
        assert_eq!(cookie.len(), COOKIE_SIZE);

        let opened = eat_cookie(&cookie, &ring).unwrap();
        check_eq(opened, keys);
    }

    #[test]
    fn tampered_cookie_fails_to_open() {
        let ring = KeyRing::new();
        let keys = NTSKeys {
            s2c: [1; 32],
            c2s: [2; 32],
        };

        let mut cookie = make_cookie(keys, &ring);
        cookie[50] ^= 0xff;

        assert!(eat_cookie(&cookie, &ring).is_none());
    }

    #[test]
    fn cookie_from_a_rotated_out_key_fails_to_open() {
        let mut ring = KeyRing::new();
        let keys = NTSKeys {
            s2c: [3; 32],
            c2s: [4; 32],
        };

        let cookie = make_cookie(keys, &ring);

        for _ in 0..crate::key_ring::RING_SIZE {
            ring.rotate();
        }

        assert!(eat_cookie(&cookie, &ring).is_none());
    }
}
