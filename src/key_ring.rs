// This file is part of nts-core.
// See LICENSE for licensing information.

//! The server key ring: a small rotating set of master keys used to seal and open cookies.
//!
//! Unlike the Memcached-backed key rotator this crate is descended from, the ring here is purely
//! local, in-process state. Sharing master keys across independent server processes is out of
//! scope (see DESIGN.md), so there is no network round trip on the hot path of sealing or opening
//! a cookie.

use lazy_static::lazy_static;

use miscreant::aead::{Aead, Aes128SivAead};

use prometheus::{opts, register_int_counter, IntCounter};

use rand::RngCore;

use std::time::Duration;

/// Number of slots in the ring. Must be a power of two; the low bits of a key id select a slot.
pub const RING_SIZE: usize = 4;

/// Bits of a key id that encode its slot index.
const KEY_ID_INDEX_BITS: u32 = 2;

/// How long a freshly-rotated key remains the active sealing key.
pub const ROTATION_PERIOD: Duration = Duration::from_secs(3600);

lazy_static! {
    static ref ROTATION_COUNTER: IntCounter =
        register_int_counter!(opts!("nts_key_rotations_total", "Number of key rotations")).unwrap();
}

/// A single slot in the ring: a SIV-256 key together with the id that currently identifies it.
struct Slot {
    id: u32,
    key: [u8; 32],
}

impl Slot {
    fn empty() -> Slot {
        Slot { id: 0, key: [0; 32] }
    }

    fn aead(&self) -> Aes128SivAead {
        Aes128SivAead::new(&self.key)
    }
}

/// Rotating ring of server keys used to seal and open NKE cookies.
///
/// `current` always names the slot used to seal new cookies; all four slots remain valid for
/// opening until they are themselves overwritten by a later rotation.
pub struct KeyRing {
    slots: [Slot; RING_SIZE],
    current: usize,
}

impl KeyRing {
    /// Build a ring with one freshly-rotated key installed. Call `rotate` again on a timer to
    /// keep it current; see `ROTATION_PERIOD`.
    pub fn new() -> KeyRing {
        let mut ring = KeyRing {
            slots: [Slot::empty(), Slot::empty(), Slot::empty(), Slot::empty()],
            current: usize::max_value(), // so the first `rotate` starts at slot 0
        };
        ring.rotate();
        ring
    }

    /// Rotate to the next slot, installing a freshly-drawn random key there.
    ///
    /// Steps, matching the reference procedure exactly:
    /// 1. advance `current` modulo the ring size;
    /// 2. draw 32 random bytes for the new SIV key;
    /// 3. draw a random `u32`, clear its low `KEY_ID_INDEX_BITS` bits, OR in the slot index.
    pub fn rotate(&mut self) {
        ROTATION_COUNTER.inc();

        self.current = (self.current.wrapping_add(1)) % RING_SIZE;

        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);

        let mask = !0u32 << KEY_ID_INDEX_BITS;
        let mut id = rand::thread_rng().next_u32();
        id = (id & mask) | (self.current as u32);

        self.slots[self.current] = Slot { id, key };
    }

    /// The id and key currently used to seal new cookies.
    fn current_slot(&self) -> &Slot {
        &self.slots[self.current]
    }

    /// Look a key id up in the ring. Returns `None` if the slot that the id's low bits select has
    /// since been recycled by a later rotation (the id stored there no longer matches).
    fn lookup(&self, key_id: u32) -> Option<&Slot> {
        let slot = &self.slots[(key_id as usize) % RING_SIZE];
        if slot.id == key_id {
            Some(slot)
        } else {
            None
        }
    }

    /// Seal `plaintext` (the 64-byte C2S||S2C concatenation) with the current key, with the given
    /// 16-byte nonce and empty associated data. Returns `(key_id, ciphertext)`.
    pub fn seal(&self, nonce: &[u8; 16], plaintext: &[u8]) -> (u32, Vec<u8>) {
        let slot = self.current_slot();
        let ciphertext = slot.aead().seal(nonce, &[], plaintext);
        (slot.id, ciphertext)
    }

    /// Open a ciphertext sealed by `seal` under `key_id`. Returns `None` if the key id is unknown
    /// (recycled) or the SIV tag fails to verify.
    pub fn open(&self, key_id: u32, nonce: &[u8; 16], ciphertext: &[u8]) -> Option<Vec<u8>> {
        let slot = self.lookup(key_id)?;
        slot.aead().open(nonce, &[], ciphertext).ok()
    }
}

impl Default for KeyRing {
    fn default() -> KeyRing {
        KeyRing::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_then_open_roundtrips() {
        let ring = KeyRing::new();
        let nonce = [7u8; 16];
        let plaintext = [9u8; 64];

        let (key_id, ciphertext) = ring.seal(&nonce, &plaintext);
        let opened = ring.open(key_id, &nonce, &ciphertext).unwrap();
        assert_eq!(opened, plaintext.to_vec());
    }

    #[test]
    fn four_rotations_invalidate_old_cookie() {
        let mut ring = KeyRing::new();
        let nonce = [1u8; 16];
        let plaintext = [2u8; 64];

        let (key_id, ciphertext) = ring.seal(&nonce, &plaintext);
        assert!(ring.open(key_id, &nonce, &ciphertext).is_some());

        for _ in 0..RING_SIZE {
            ring.rotate();
        }

        assert!(ring.open(key_id, &nonce, &ciphertext).is_none());
    }

    #[test]
    fn three_rotations_keep_the_cookie_openable() {
        let mut ring = KeyRing::new();
        let nonce = [3u8; 16];
        let plaintext = [4u8; 64];

        let (key_id, ciphertext) = ring.seal(&nonce, &plaintext);

        for _ in 0..RING_SIZE - 1 {
            ring.rotate();
        }

        assert!(ring.open(key_id, &nonce, &ciphertext).is_some());
    }

    #[test]
    fn tampered_ciphertext_fails_to_open() {
        let ring = KeyRing::new();
        let nonce = [5u8; 16];
        let plaintext = [6u8; 64];

        let (key_id, mut ciphertext) = ring.seal(&nonce, &plaintext);
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xff;

        assert!(ring.open(key_id, &nonce, &ciphertext).is_none());
    }
}
