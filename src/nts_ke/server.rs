//! NTS-KE server: a `mio` accept loop driving one `Connection` state machine per client, plus
//! the access-control/slot-pool bookkeeping described for the server path.

use slog::{debug, error, info};

use std::collections::BinaryHeap;
use std::io;
use std::io::{ErrorKind, Read, Write};
use std::net::ToSocketAddrs;
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::SystemTime;

use crossbeam::sync::WaitGroup;

use mio::tcp::{Shutdown, TcpListener, TcpStream};
use rustls::{NoClientAuth, ProtocolVersion, ServerConfig, ServerSession, Session};

use crate::cfsock;
use crate::config::KeServerConfig;
use crate::key_ring::KeyRing;
use crate::metrics::{NTS_ERRORS_TOTAL as ERROR_COUNTER, NTS_QUERIES_TOTAL as QUERY_COUNTER, NTS_TIMEOUTS_TOTAL as TIMEOUT_COUNTER};
use crate::nts_ke::connection::{derive_keys, MessageBuffer};
use crate::nts_ke::exchange::{build_error_response, build_response, process_request, KeErrorCode};
use crate::nts_ke::record::{validate, Validation};
use crate::nts_ke::timeout::Timeout;

const LISTENER: mio::Token = mio::Token(0);

/// Number of connection slots held open concurrently by one listener.
const POOL_SIZE: usize = 10;

/// Per-connection timeout: 2 seconds from creation, per the connection state machine.
const CONN_TIMEOUT_SECS: u64 = 2;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_secs()
}

/// A predicate deciding whether to accept a connection from `addr`. The default always accepts;
/// callers embedding this server in a more restrictive environment can supply their own.
pub type AccessControl = Arc<dyn Fn(&std::net::SocketAddr) -> bool + Send + Sync>;

struct Connection {
    socket: TcpStream,
    token: mio::Token,
    closing: bool,
    closed: bool,
    sent_response: bool,
    tls_session: ServerSession,
    key_ring: Arc<RwLock<KeyRing>>,
    server_override: Option<String>,
    port_override: Option<u16>,
    recv_buffer: MessageBuffer,
    logger: slog::Logger,
}

impl Connection {
    fn new(
        socket: TcpStream,
        token: mio::Token,
        tls_session: ServerSession,
        key_ring: Arc<RwLock<KeyRing>>,
        server_override: Option<String>,
        port_override: Option<u16>,
        logger: slog::Logger,
    ) -> Connection {
        Connection {
            socket,
            token,
            closing: false,
            closed: false,
            sent_response: false,
            tls_session,
            key_ring,
            server_override,
            port_override,
            recv_buffer: MessageBuffer::new(),
            logger,
        }
    }

    fn ready(&mut self, poll: &mut mio::Poll, ev: &mio::Event) {
        if ev.readiness().is_readable() {
            self.do_tls_read();
            self.try_process_request();
        }

        if ev.readiness().is_writable() {
            self.do_tls_write();
        }

        if self.closing && !self.tls_session.wants_write() {
            let _ = self.socket.shutdown(Shutdown::Both);
            self.closed = true;
        } else {
            self.reregister(poll);
        }
    }

    fn do_tls_read(&mut self) {
        match self.tls_session.read_tls(&mut self.socket) {
            Err(err) => {
                if err.kind() != ErrorKind::WouldBlock {
                    ERROR_COUNTER.inc();
                    debug!(self.logger, "read error: {:?}", err);
                    self.closing = true;
                }
                return;
            }
            Ok(0) => {
                if !self.sent_response {
                    ERROR_COUNTER.inc();
                }
                self.closing = true;
                return;
            }
            Ok(_) => {}
        }

        if let Err(err) = self.tls_session.process_new_packets() {
            ERROR_COUNTER.inc();
            error!(self.logger, "cannot process TLS packets: {:?}", err);
            self.closing = true;
        }
    }

    fn try_process_request(&mut self) {
        let mut plaintext = Vec::new();
        match self.tls_session.read_to_end(&mut plaintext) {
            Ok(_) => {}
            Err(ref err) if err.kind() == ErrorKind::WouldBlock => {}
            Err(err) => {
                ERROR_COUNTER.inc();
                debug!(self.logger, "plaintext read failed: {:?}", err);
                self.closing = true;
                return;
            }
        }
        if plaintext.is_empty() {
            return;
        }
        self.recv_buffer.extend_received(&plaintext);
        self.recv_buffer.mark_eof();

        if self.sent_response {
            return;
        }

        match validate(self.recv_buffer.data(), self.recv_buffer.eof()) {
            Validation::Incomplete => {}
            Validation::Error => {
                self.respond(build_error_response(KeErrorCode::BadRequest));
            }
            Validation::Ok => {
                QUERY_COUNTER.inc();
                let response = match process_request(self.recv_buffer.data()) {
                    Ok(()) => match derive_keys(&self.tls_session) {
                        Ok(keys) => {
                            let ring = self.key_ring.read().unwrap();
                            build_response(
                                keys,
                                &ring,
                                self.server_override.as_deref(),
                                self.port_override,
                            )
                        }
                        Err(_) => {
                            ERROR_COUNTER.inc();
                            build_error_response(KeErrorCode::InternalServerError)
                        }
                    },
                    Err(code) => {
                        ERROR_COUNTER.inc();
                        build_error_response(code)
                    }
                };
                self.respond(response);
            }
        }
    }

    fn respond(&mut self, bytes: Vec<u8>) {
        self.sent_response = true;
        if let Err(err) = self.tls_session.write_all(&bytes) {
            ERROR_COUNTER.inc();
            error!(self.logger, "queueing response failed: {:?}", err);
        }
        self.closing = true;
    }

    fn do_tls_write(&mut self) {
        if let Err(err) = self.tls_session.write_tls(&mut self.socket) {
            ERROR_COUNTER.inc();
            error!(self.logger, "write failed: {:?}", err);
            self.closing = true;
        }
    }

    fn register(&self, poll: &mut mio::Poll) {
        poll.register(
            &self.socket,
            self.token,
            self.event_set(),
            mio::PollOpt::level(),
        )
        .unwrap();
    }

    fn reregister(&self, poll: &mut mio::Poll) {
        poll.reregister(
            &self.socket,
            self.token,
            self.event_set(),
            mio::PollOpt::level(),
        )
        .unwrap();
    }

    fn event_set(&self) -> mio::Ready {
        let rd = self.tls_session.wants_read();
        let wr = self.tls_session.wants_write();
        if rd && wr {
            mio::Ready::readable() | mio::Ready::writable()
        } else if wr {
            mio::Ready::writable()
        } else {
            mio::Ready::readable()
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn die(&self) {
        ERROR_COUNTER.inc();
        let _ = self.socket.shutdown(Shutdown::Both);
    }
}

struct NtsKeServer {
    listener: TcpListener,
    connections: std::collections::HashMap<mio::Token, Connection>,
    deadlines: BinaryHeap<Timeout>,
    next_id: usize,
    tls_config: Arc<ServerConfig>,
    key_ring: Arc<RwLock<KeyRing>>,
    server_override: Option<String>,
    port_override: Option<u16>,
    access_control: AccessControl,
    logger: slog::Logger,
    poll: mio::Poll,
}

impl NtsKeServer {
    fn new(
        listener: TcpListener,
        tls_config: Arc<ServerConfig>,
        key_ring: Arc<RwLock<KeyRing>>,
        server_override: Option<String>,
        port_override: Option<u16>,
        access_control: AccessControl,
        logger: slog::Logger,
    ) -> Result<NtsKeServer, io::Error> {
        let poll = mio::Poll::new()?;
        poll.register(
            &listener,
            LISTENER,
            mio::Ready::readable(),
            mio::PollOpt::level(),
        )?;
        Ok(NtsKeServer {
            listener,
            connections: std::collections::HashMap::new(),
            deadlines: BinaryHeap::new(),
            next_id: 1,
            tls_config,
            key_ring,
            server_override,
            port_override,
            access_control,
            logger,
            poll,
        })
    }

    fn listen_and_serve(&mut self) {
        let mut events = mio::Events::with_capacity(1024);
        loop {
            let poll_timeout = std::time::Duration::from_millis(500);
            if self.poll.poll(&mut events, Some(poll_timeout)).is_err() {
                continue;
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => {
                        if let Err(err) = self.accept() {
                            ERROR_COUNTER.inc();
                            error!(self.logger, "accept failed: {:?}", err);
                        }
                    }
                    token => self.conn_event(token, &event),
                }
            }

            self.check_timeouts();
        }
    }

    fn accept(&mut self) -> Result<(), io::Error> {
        match self.listener.accept() {
            Ok((socket, addr)) => {
                if !(self.access_control)(&addr) {
                    info!(self.logger, "rejecting connection from {:?}: access denied", addr);
                    let _ = socket.shutdown(Shutdown::Both);
                    return Ok(());
                }

                if self.connections.len() >= POOL_SIZE {
                    info!(self.logger, "rejecting connection from {:?}: pool full", addr);
                    let _ = socket.shutdown(Shutdown::Both);
                    return Ok(());
                }

                info!(self.logger, "accepted connection from {:?}", addr);
                let tls_session = ServerSession::new(&self.tls_config);

                let token = mio::Token(self.next_id);
                self.next_id = self.next_id.wrapping_add(1).max(1);

                self.deadlines.push(Timeout {
                    deadline: now_secs() + CONN_TIMEOUT_SECS,
                    token,
                });

                let conn_logger = self.logger.new(slog::o!("client" => format!("{}", addr)));
                let conn = Connection::new(
                    socket,
                    token,
                    tls_session,
                    self.key_ring.clone(),
                    self.server_override.clone(),
                    self.port_override,
                    conn_logger,
                );
                conn.register(&mut self.poll);
                self.connections.insert(token, conn);
                Ok(())
            }
            Err(err) => {
                if err.kind() == io::ErrorKind::WouldBlock {
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    fn conn_event(&mut self, token: mio::Token, event: &mio::Event) {
        if let Some(conn) = self.connections.get_mut(&token) {
            conn.ready(&mut self.poll, event);
            if conn.is_closed() {
                self.connections.remove(&token);
            }
        }
    }

    fn check_timeouts(&mut self) {
        let now = now_secs();
        while let Some(top) = self.deadlines.peek() {
            if top.deadline > now {
                break;
            }
            let expired = self.deadlines.pop().unwrap();
            if let Some(conn) = self.connections.remove(&expired.token) {
                if !conn.is_closed() {
                    conn.die();
                    TIMEOUT_COUNTER.inc();
                }
            }
        }
    }
}

/// Load configuration and run the NTS-KE server until the process is killed.
pub fn start_nts_ke_server(
    config: KeServerConfig,
    logger: slog::Logger,
) -> Result<(), Box<dyn std::error::Error>> {
    let certs = crate::config::load_tls_certs(config.tls_cert_file.clone())?;
    let private_keys = rustls::internal::pemfile::pkcs8_private_keys(&mut io::BufReader::new(
        std::fs::File::open(&config.tls_key_file)?,
    ))
    .map_err(|()| io::Error::new(io::ErrorKind::Other, "could not parse TLS private key"))?;

    let mut server_config = ServerConfig::new(NoClientAuth::new());
    server_config.versions = vec![ProtocolVersion::TLSv1_3, ProtocolVersion::TLSv1_2];
    server_config.set_protocols(&[b"ntske/1".to_vec()]);
    server_config.set_single_cert(certs, private_keys[0].clone())?;
    let tls_config = Arc::new(server_config);

    let key_ring = Arc::new(RwLock::new(KeyRing::new()));
    spawn_rotation(key_ring.clone(), logger.clone());

    if let Some(metrics_config) = config.metrics.clone() {
        let metrics_logger = logger.new(slog::o!("component" => "metrics"));
        thread::spawn(move || {
            if let Err(err) = crate::metrics::run_metrics(metrics_config) {
                error!(metrics_logger, "metrics server failed: {:?}", err);
            }
        });
    }

    let access_control: AccessControl = Arc::new(|_addr| true);
    let wg = WaitGroup::new();

    for addr in &config.addrs {
        let addr = addr.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "could not resolve listen address")
        })?;
        let std_listener = cfsock::tcp_listener(&addr)?;
        let listener = TcpListener::from_listener(std_listener, &addr)?;

        let mut server = NtsKeServer::new(
            listener,
            tls_config.clone(),
            key_ring.clone(),
            config.ntp_server.clone(),
            config.ntp_port,
            access_control.clone(),
            logger.new(slog::o!("listen_addr" => format!("{}", addr))),
        )?;

        info!(logger, "starting NTS-KE server on {}", addr);
        let wg = wg.clone();
        thread::spawn(move || {
            server.listen_and_serve();
            drop(wg);
        });
    }

    wg.wait();
    Ok(())
}

fn spawn_rotation(key_ring: Arc<RwLock<KeyRing>>, logger: slog::Logger) {
    thread::spawn(move || loop {
        thread::sleep(crate::key_ring::ROTATION_PERIOD);
        key_ring.write().unwrap().rotate();
        debug!(logger, "rotated NTS-KE server key ring");
    });
}
