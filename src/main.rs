// This file is part of nts-core.
// See LICENSE for licensing information.

mod cfsock;
mod config;
mod cookie;
mod key_ring;
mod metrics;
mod ntp;
mod nts_ke;

use std::fs;
use std::io::BufReader;
use std::process;

use clap::{App, Arg, SubCommand};
use rustls::{internal::pemfile::certs, Certificate};
use slog::{debug, error, o};
use sloggers::terminal::TerminalLoggerBuilder;
use sloggers::Build;

use crate::config::{parse_ke_server_config, parse_ntp_server_config, NtsClientConfig};
use crate::ntp::client::run_nts_ntp_client;
use crate::ntp::server::start_ntp_server;
use crate::nts_ke::client::run_nts_ke_client;
use crate::nts_ke::server::start_nts_ke_server;

fn app() -> App<'static, 'static> {
    App::new("nts-core")
        .about("Network Time Security for NTPv4")
        .version("v0.1")
        .subcommands(vec![
            SubCommand::with_name("ke-server")
                .about("Runs the NTS-KE server over TLS/TCP")
                .arg(Arg::with_name("config_file").index(1).required(true)),
            SubCommand::with_name("ntp-server")
                .about("Runs the NTS-NTP server over UDP")
                .arg(Arg::with_name("config_file").index(1).required(true)),
            SubCommand::with_name("client")
                .about("Runs one NTS time-request against a server, for testing")
                .arg(Arg::with_name("host").required(true))
                .arg(Arg::with_name("port").long("port").takes_value(true))
                .arg(Arg::with_name("cert").long("cert").takes_value(true))
                .arg(Arg::with_name("ipv4").long("ipv4").conflicts_with("ipv6"))
                .arg(Arg::with_name("ipv6").long("ipv6").conflicts_with("ipv4")),
        ])
}

fn load_trusted_cert(path: &str) -> Option<Certificate> {
    let file = fs::File::open(path).ok()?;
    let parsed = certs(&mut BufReader::new(file)).ok()?;
    parsed.into_iter().next()
}

fn main() {
    let logger = TerminalLoggerBuilder::new()
        .build()
        .expect("BUG: TerminalLoggerBuilder::build shouldn't return an error.");
    let matches = app().get_matches();

    if matches.subcommand.is_none() {
        error!(logger, "you must specify a subcommand: ke-server, ntp-server, or client");
        process::exit(127);
    }

    if let Some(sub) = matches.subcommand_matches("ke-server") {
        let config_file = sub.value_of("config_file").unwrap();
        let config = match parse_ke_server_config(config_file) {
            Ok(config) => config,
            Err(err) => {
                error!(logger, "could not load ke-server config: {}", err);
                process::exit(1);
            }
        };
        if let Err(err) = start_nts_ke_server(config, logger.new(o!("component" => "nts_ke"))) {
            error!(logger, "NTS-KE server failed: {}", err);
            process::exit(1);
        }
    }

    if let Some(sub) = matches.subcommand_matches("ntp-server") {
        let config_file = sub.value_of("config_file").unwrap();
        let config = match parse_ntp_server_config(config_file) {
            Ok(config) => config,
            Err(err) => {
                error!(logger, "could not load ntp-server config: {}", err);
                process::exit(1);
            }
        };
        if let Err(err) = start_ntp_server(config, logger.new(o!("component" => "ntp"))) {
            error!(logger, "NTS-NTP server failed: {}", err);
            process::exit(1);
        }
    }

    if let Some(sub) = matches.subcommand_matches("client") {
        let host = sub.value_of("host").map(String::from).unwrap();
        let port = sub.value_of("port").map(String::from);
        let trusted_cert = sub.value_of("cert").and_then(load_trusted_cert);

        let use_ipv4 = if sub.is_present("ipv4") {
            Some(true)
        } else if sub.is_present("ipv6") {
            Some(false)
        } else {
            None
        };

        let client_config = NtsClientConfig {
            host,
            port,
            trusted_cert,
            use_ipv4,
        };

        let ke_result = match run_nts_ke_client(client_config) {
            Ok(result) => result,
            Err(err) => {
                error!(logger, "key exchange failed: {}", err);
                process::exit(1);
            }
        };
        debug!(logger, "key exchange complete, next hop {}:{}", ke_result.next_server, ke_result.next_port);

        match run_nts_ntp_client(&logger, ke_result) {
            Ok(result) => {
                println!("stratum: {}", result.stratum);
                println!("offset: {:.6}", result.time_diff);
            }
            Err(err) => {
                error!(logger, "NTS-NTP request failed: {}", err);
                process::exit(1);
            }
        }
    }
}
