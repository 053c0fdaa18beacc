//! NTS-NTP: the UDP side of Network Time Security, authenticating ordinary NTPv4 packets with
//! extension fields instead of a TLS connection.

pub mod aead;
pub mod client;
pub mod packet;
pub mod server;
