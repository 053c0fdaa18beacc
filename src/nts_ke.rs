//! NTS-KE: the TLS-framed key-establishment protocol that negotiates the AEAD keys and initial
//! cookie supply an NTS-NTP exchange runs on.

pub mod client;
pub mod connection;
pub mod exchange;
pub mod record;
pub mod server;
pub mod timeout;
