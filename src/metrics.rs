// Our goal is to shove data at prometheus in response to requests.
use lazy_static::lazy_static;
use prometheus::{
    self, labels, opts, register_int_counter, register_int_gauge, Encoder, IntCounter,
};
use std::io;
use std::io::Write;
use std::net;
use std::thread;

use crate::config;

const VERSION: &str = env!("CARGO_PKG_VERSION");

lazy_static! {
    static ref VERSION_INFO: prometheus::IntGauge = register_int_gauge!(opts!(
        "build_info",
        "Build and version information",
        labels! {
            "version" => VERSION,
        }
    ))
    .unwrap();
    pub static ref NTS_QUERIES_TOTAL: IntCounter = register_int_counter!(opts!(
        "nts_queries_total",
        "Number of NTS-KE requests handled"
    ))
    .unwrap();
    pub static ref NTS_ERRORS_TOTAL: IntCounter = register_int_counter!(opts!(
        "nts_errors_total",
        "Number of NTS-KE requests answered with an Error record"
    ))
    .unwrap();
    pub static ref NTS_TIMEOUTS_TOTAL: IntCounter = register_int_counter!(opts!(
        "nts_timeouts_total",
        "Number of NTS-KE connections closed by the per-connection timeout"
    ))
    .unwrap();
    pub static ref NTP_QUERIES_TOTAL: IntCounter = register_int_counter!(opts!(
        "ntp_queries_total",
        "Number of NTP requests handled (NTS and plain)"
    ))
    .unwrap();
    pub static ref NTP_NTS_QUERIES_TOTAL: IntCounter = register_int_counter!(opts!(
        "ntp_nts_queries_total",
        "Number of NTP requests authenticated via NTS"
    ))
    .unwrap();
    pub static ref NTP_KOD_TOTAL: IntCounter = register_int_counter!(opts!(
        "ntp_kod_total",
        "Number of Kiss-of-Death responses sent"
    ))
    .unwrap();
}

fn scrape_result() -> String {
    let mut buffer = Vec::new();
    let encoder = prometheus::TextEncoder::new();
    let families = prometheus::gather();
    encoder.encode(&families, &mut buffer).unwrap();
    "HTTP/1.1\r\nContent-Type: text/plain; version=0.0.4\r\n\r\n".to_owned()
        + &String::from_utf8(buffer).unwrap()
}

fn serve_metrics(mut dest: net::TcpStream) {
    let _ = dest.write(scrape_result().as_bytes());
    let _ = dest.shutdown(net::Shutdown::Write);
}

/// Runs the metric server on the address and port set in config.
pub fn run_metrics(conf: config::MetricsConfig) -> Result<(), std::io::Error> {
    VERSION_INFO.set(1);
    let accept = net::TcpListener::bind((conf.addr.as_str(), conf.port))?;
    for stream in accept.incoming() {
        match stream {
            Ok(conn) => {
                thread::spawn(move || {
                    serve_metrics(conn);
                });
            }
            Err(err) => return Err(err),
        }
    }
    Err(io::Error::new(io::ErrorKind::Other, "unreachable"))
}
