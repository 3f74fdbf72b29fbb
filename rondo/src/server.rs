//! Single-threaded, cooperative network server.
//!
//! Two listeners — query and metrics — share one `mio` [`Poll`] instance and
//! one [`std::sync::Mutex`]-guarded [`Store`]. Every connection is
//! non-blocking; a handler that would otherwise block returns control to the
//! event loop instead, exactly as bolo's `fdpoll` dispatch loop expects
//! (`fn(fd, udata) -> rc`, where a nonzero `rc` deregisters the fd). Per
//! BQIP, a connection accepts exactly one request and is closed once its
//! response has been written — no pipelining, no keep-alive.
//!
//! Grounded on bolo's `fdpoll.c` (`fdpoll_watch`/`fdpoll_unwatch`/the
//! `epoll_wait` dispatch loop) translated to `mio`'s readiness model, since
//! `mio`'s `Poll`/`Events`/`Interest` are direct analogues of
//! `epoll_create1`/`epoll_wait`/`EPOLLIN`. `mio` is grounded via
//! `examples/other_examples/manifests/{ChainSafe-forest,william-lbn-neon,zenithdb-zenith}/Cargo.toml`.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::Mutex;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, error, warn};

use crate::bqip::{self, Request, RequestType, Response};
use crate::error::{BqipError, Result};
use crate::ingest;
use crate::store::Store;

const TOKEN_QUERY_LISTENER: Token = Token(0);
const TOKEN_METRICS_LISTENER: Token = Token(1);
const FIRST_CONNECTION_TOKEN: usize = 2;

/// Listener addresses and connection pool sizing for [`Server::bind`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address for the query listener.
    pub query_addr: SocketAddr,
    /// Address for the measurement-ingest listener.
    pub metrics_addr: SocketAddr,
    /// Maximum number of simultaneously open connections, across both
    /// listeners.
    pub max_connections: usize,
}

struct Connection {
    stream: TcpStream,
    from_metrics_listener: bool,
    inbuf: Vec<u8>,
    outbuf: Vec<u8>,
    out_written: usize,
    response_ready: bool,
}

/// The network server: owns both listeners, the poll registry, and the
/// bounded pool of open connections.
pub struct Server {
    poll: Poll,
    query_listener: TcpListener,
    metrics_listener: TcpListener,
    connections: HashMap<Token, Connection>,
    next_token: usize,
    max_connections: usize,
}

impl Server {
    /// Binds both listeners and registers them with a fresh `mio` poll.
    pub fn bind(config: &ServerConfig) -> Result<Self> {
        let poll = Poll::new()?;
        let mut query_listener = TcpListener::bind(config.query_addr)?;
        let mut metrics_listener = TcpListener::bind(config.metrics_addr)?;
        poll.registry().register(&mut query_listener, TOKEN_QUERY_LISTENER, Interest::READABLE)?;
        poll.registry().register(&mut metrics_listener, TOKEN_METRICS_LISTENER, Interest::READABLE)?;
        Ok(Server {
            poll,
            query_listener,
            metrics_listener,
            connections: HashMap::new(),
            next_token: FIRST_CONNECTION_TOKEN,
            max_connections: config.max_connections,
        })
    }

    /// Runs the cooperative event loop forever, serializing every database
    /// operation through `db`.
    ///
    /// # Errors
    ///
    /// Returns an [`crate::error::RondoError::Io`] if the poll itself fails;
    /// per-connection I/O errors are logged and close that connection only.
    pub fn run(&mut self, db: &Mutex<Store>) -> Result<()> {
        let mut events = Events::with_capacity(128);
        loop {
            self.poll.poll(&mut events, None)?;
            let ready: Vec<Token> = events.iter().map(|e| e.token()).collect();
            for token in ready {
                match token {
                    TOKEN_QUERY_LISTENER => self.accept(false)?,
                    TOKEN_METRICS_LISTENER => self.accept(true)?,
                    token => self.service(token, db),
                }
            }
        }
    }

    fn accept(&mut self, from_metrics_listener: bool) -> Result<()> {
        loop {
            let accepted = if from_metrics_listener {
                self.metrics_listener.accept()
            } else {
                self.query_listener.accept()
            };
            let (mut stream, _addr) = match accepted {
                Ok(pair) => pair,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            };

            if self.connections.len() >= self.max_connections {
                warn!("connection pool full, dropping accepted connection");
                continue;
            }

            let token = Token(self.next_token);
            self.next_token += 1;
            self.poll.registry().register(&mut stream, token, Interest::READABLE)?;
            self.connections.insert(
                token,
                Connection {
                    stream,
                    from_metrics_listener,
                    inbuf: Vec::new(),
                    outbuf: Vec::new(),
                    out_written: 0,
                    response_ready: false,
                },
            );
        }
    }

    fn service(&mut self, token: Token, db: &Mutex<Store>) {
        let Some(conn) = self.connections.get_mut(&token) else { return };

        if conn.response_ready {
            if let Err(e) = flush_outbuf(conn) {
                debug!(error = %e, "connection write failed, closing");
                self.close(token);
            } else if conn.out_written == conn.outbuf.len() {
                self.close(token);
            }
            return;
        }

        match read_available(conn) {
            Ok(()) => {}
            Err(e) => {
                debug!(error = %e, "connection read failed, closing");
                self.close(token);
                return;
            }
        }

        match bqip::decode(&conn.inbuf) {
            Ok(Some((request, consumed))) => {
                conn.inbuf.drain(..consumed);
                let response = handle_request(db, &request);
                conn.outbuf = response.encode();
                conn.response_ready = true;
                if let Err(e) = self.poll.registry().reregister(&mut conn.stream, token, Interest::WRITABLE) {
                    error!(error = %e, "failed to reregister connection for write");
                    self.close(token);
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "malformed BQIP frame");
                let response = Response::Error(e.to_string());
                if let Some(conn) = self.connections.get_mut(&token) {
                    conn.outbuf = response.encode();
                    conn.response_ready = true;
                    let _ = self.poll.registry().reregister(&mut conn.stream, token, Interest::WRITABLE);
                }
            }
        }
    }

    fn close(&mut self, token: Token) {
        if let Some(mut conn) = self.connections.remove(&token) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
        }
    }
}

/// Reads whatever is currently available into `conn.inbuf`, treating
/// `WouldBlock` as "nothing more right now" rather than an error.
fn read_available(conn: &mut Connection) -> std::io::Result<()> {
    let mut chunk = [0u8; 4096];
    loop {
        match conn.stream.read(&mut chunk) {
            Ok(0) => return Ok(()),
            Ok(n) => conn.inbuf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

fn flush_outbuf(conn: &mut Connection) -> std::io::Result<()> {
    while conn.out_written < conn.outbuf.len() {
        match conn.stream.write(&conn.outbuf[conn.out_written..]) {
            Ok(0) => return Ok(()),
            Ok(n) => conn.out_written += n,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Executes one decoded request against the database, serialized through
/// `db`'s mutex. Factored out from the event loop so it can be exercised
/// directly in tests without real sockets.
fn handle_request(db: &Mutex<Store>, request: &Request) -> Response {
    match request.kind {
        RequestType::Query | RequestType::Plan => match request.as_query() {
            Ok(query) => {
                let db = db.lock().expect("database mutex poisoned");
                match db.query(query) {
                    Ok(result) => Response::Result(result),
                    Err(e) => Response::Error(e.to_string()),
                }
            }
            Err(e) => Response::Error(e.to_string()),
        },
        RequestType::Measurement => {
            let Ok(line) = std::str::from_utf8(&request.payload) else {
                return Response::Error(BqipError::BadHeader.to_string());
            };
            match ingest::parse_line(line) {
                Ok(sub) => {
                    let mut db = db.lock().expect("database mutex poisoned");
                    match db.insert(&sub) {
                        Ok(()) => Response::Result(crate::query::QueryResult {
                            fields: Vec::new(),
                            window_start_ms: sub.ts,
                            window_end_ms: sub.ts,
                        }),
                        Err(e) => Response::Error(e.to_string()),
                    }
                }
                Err(e) => Response::Error(e.to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{ConsolidationConfig, Field, Op, Query};
    use crate::reservoir::CfKind;

    #[test]
    fn handle_request_ingests_measurement() {
        let dir = tempfile::tempdir().unwrap();
        let store = Mutex::new(Store::init(dir.path(), b"test-key".to_vec()).unwrap());
        let req = Request { kind: RequestType::Measurement, payload: b"cpu host=a 1000 5.0".to_vec() };
        let resp = handle_request(&store, &req);
        assert!(matches!(resp, Response::Result(_)));
        assert!(store.lock().unwrap().resolve("cpu|host=a").is_some());
    }

    #[test]
    fn handle_request_reports_malformed_measurement() {
        let dir = tempfile::tempdir().unwrap();
        let store = Mutex::new(Store::init(dir.path(), b"test-key".to_vec()).unwrap());
        let req = Request { kind: RequestType::Measurement, payload: b"bad line".to_vec() };
        assert!(matches!(handle_request(&store, &req), Response::Error(_)));
    }

    #[test]
    fn handle_request_runs_query() {
        let dir = tempfile::tempdir().unwrap();
        let store = Mutex::new(Store::init(dir.path(), b"test-key".to_vec()).unwrap());
        let query = Query {
            select: vec![Field { name: "cpu".to_string(), ops: vec![Op::Push("cpu".to_string())] }],
            where_: None,
            from_secs: -60,
            until_secs: 0,
            bucket: ConsolidationConfig { cf: CfKind::Mean, stride_secs: 60, samples: 16 },
            aggregate: None,
        };
        let req = Request::query(&query);
        assert!(matches!(handle_request(&store, &req), Response::Result(_)));
    }
}
