//! Thin AES-SIV-CMAC-256 adapter for NTP-packet-level authentication. The associated data is the
//! packet bytes preceding the authenticator extension; `encrypt` grows ciphertext by the 16-byte
//! SIV tag, `decrypt` reports success or failure rather than panicking on a bad tag.

use miscreant::aead::{Aead, Aes128SivAead};

pub struct NtpAead {
    inner: Aes128SivAead,
}

impl NtpAead {
    pub fn new(key: &[u8; 32]) -> NtpAead {
        NtpAead {
            inner: Aes128SivAead::new(key),
        }
    }

    pub fn encrypt(&mut self, nonce: &[u8], associated_data: &[u8], plaintext: &[u8]) -> Vec<u8> {
        self.inner.seal(nonce, associated_data, plaintext)
    }

    pub fn decrypt(&mut self, nonce: &[u8], associated_data: &[u8], ciphertext: &[u8]) -> Option<Vec<u8>> {
        self.inner.open(nonce, associated_data, ciphertext).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_roundtrips() {
        let key = [7u8; 32];
        let mut aead = NtpAead::new(&key);
        let nonce = [1u8; 16];
        let ad = b"packet prefix";

        let ciphertext = aead.encrypt(&nonce, ad, &[]);
        assert_eq!(ciphertext.len(), 16);

        let plaintext = aead.decrypt(&nonce, ad, &ciphertext).unwrap();
        assert!(plaintext.is_empty());
    }

    #[test]
    fn wrong_associated_data_fails_to_decrypt() {
        let key = [3u8; 32];
        let mut aead = NtpAead::new(&key);
        let nonce = [2u8; 16];

        let ciphertext = aead.encrypt(&nonce, b"request up to here", &[]);
        assert!(aead.decrypt(&nonce, b"tampered prefix", &ciphertext).is_none());
    }
}
