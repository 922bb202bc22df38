#![forbid(unsafe_code)]

//! TCP shell around the engine: a single-threaded mio poll loop that
//! feeds raw bytes through the resumable decoder, hands decoded
//! requests to the engine, and routes the engine's write batches back
//! to the right sockets. Timer deadlines (expiry, blocking timeouts,
//! save cron) bound the poll timeout.

use std::collections::HashMap;
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use qs_command::{Engine, frame_to_argv};
use qs_config::Config;
use qs_protocol::{RespDecoder, RespFrame};
use tracing::{debug, info, warn};

const LISTENER: Token = Token(0);
const READ_CHUNK: usize = 16 * 1024;

type ClientId = u64;

fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

struct Connection {
    stream: TcpStream,
    decoder: RespDecoder,
    out: Vec<u8>,
    client: ClientId,
    /// Close once the out buffer drains (QUIT, protocol error).
    closing: bool,
}

pub struct Server {
    poll: Poll,
    listener: TcpListener,
    engine: Engine,
    connections: HashMap<Token, Connection>,
    tokens_by_client: HashMap<ClientId, Token>,
    next_token: usize,
}

impl Server {
    pub fn new(config: Config) -> io::Result<Self> {
        let addr: SocketAddr = config
            .bind
            .parse()
            .map_err(|err| io::Error::new(ErrorKind::InvalidInput, format!("{err}")))?;
        let mut listener = TcpListener::bind(addr)?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let engine = Engine::new(config, unix_now_ms());
        Ok(Self {
            poll,
            listener,
            engine,
            connections: HashMap::new(),
            tokens_by_client: HashMap::new(),
            next_token: 1,
        })
    }

    /// The address actually bound (resolves port 0).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the event loop until the process is killed.
    pub fn run(&mut self) -> io::Result<()> {
        info!(addr = %self.local_addr()?, "listening");
        let mut events = Events::with_capacity(256);
        loop {
            let timeout = self.engine.next_deadline().map(|deadline| {
                Duration::from_millis(deadline.saturating_sub(unix_now_ms()))
            });
            match self.poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
            let now_ms = unix_now_ms();
            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_ready(now_ms)?,
                    token => {
                        if event.is_readable() {
                            self.read_ready(token, now_ms);
                        }
                        if event.is_writable() {
                            self.flush(token);
                        }
                    }
                }
            }
            let due = self.engine.on_tick(unix_now_ms());
            self.route_writes(due);
            self.sweep_closed();
        }
    }

    fn accept_ready(&mut self, now_ms: u64) -> io::Result<()> {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    self.poll.registry().register(
                        &mut stream,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    )?;
                    let client = self.engine.connect(peer.to_string(), now_ms);
                    debug!(%peer, client, "connection accepted");
                    self.tokens_by_client.insert(client, token);
                    self.connections.insert(
                        token,
                        Connection {
                            stream,
                            decoder: RespDecoder::new(),
                            out: Vec::new(),
                            client,
                            closing: false,
                        },
                    );
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }

    fn read_ready(&mut self, token: Token, now_ms: u64) {
        let mut buf = [0_u8; READ_CHUNK];
        let mut gone = false;
        loop {
            let Some(connection) = self.connections.get_mut(&token) else {
                return;
            };
            match connection.stream.read(&mut buf) {
                Ok(0) => {
                    gone = true;
                    break;
                }
                Ok(read) => connection.decoder.feed(&buf[..read]),
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(client = connection.client, %err, "read failed");
                    gone = true;
                    break;
                }
            }
        }
        if gone {
            self.close_connection(token);
            return;
        }
        self.drain_requests(token, now_ms);
        self.flush(token);
    }

    /// Decode and dispatch every complete request buffered on this
    /// connection.
    fn drain_requests(&mut self, token: Token, now_ms: u64) {
        loop {
            let Some(connection) = self.connections.get_mut(&token) else {
                return;
            };
            if connection.closing {
                return;
            }
            let client = connection.client;
            match connection.decoder.try_next() {
                Ok(None) => return,
                Ok(Some(frame)) => {
                    let writes = match frame_to_argv(&frame) {
                        Ok(argv) => {
                            let result = self.engine.dispatch(client, argv, now_ms);
                            if result.close {
                                if let Some(connection) = self.connections.get_mut(&token) {
                                    connection.closing = true;
                                }
                            }
                            result.writes
                        }
                        Err(err) => vec![(client, err.to_frame())],
                    };
                    self.route_writes(writes);
                }
                Err(err) => {
                    // Malformed bytes: answer, then drop the
                    // connection, nothing further can be trusted.
                    warn!(client, %err, "protocol error");
                    let frame = RespFrame::Error(format!("ERR {err}"));
                    connection.out.extend_from_slice(&frame.to_bytes());
                    connection.closing = true;
                    return;
                }
            }
        }
    }

    fn route_writes(&mut self, writes: Vec<(ClientId, RespFrame)>) {
        let mut touched = Vec::new();
        for (client, frame) in writes {
            let Some(token) = self.tokens_by_client.get(&client) else {
                continue;
            };
            if let Some(connection) = self.connections.get_mut(token) {
                frame.write_to(&mut connection.out);
                touched.push(*token);
            }
        }
        touched.dedup();
        for token in touched {
            self.flush(token);
        }
    }

    fn flush(&mut self, token: Token) {
        let Some(connection) = self.connections.get_mut(&token) else {
            return;
        };
        while !connection.out.is_empty() {
            match connection.stream.write(&connection.out) {
                Ok(0) => {
                    connection.closing = true;
                    connection.out.clear();
                    break;
                }
                Ok(written) => {
                    connection.out.drain(..written);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(client = connection.client, %err, "write failed");
                    connection.closing = true;
                    connection.out.clear();
                    break;
                }
            }
        }
        if connection.out.is_empty() && connection.closing {
            self.close_connection(token);
        }
    }

    fn sweep_closed(&mut self) {
        let done: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, connection)| connection.closing && connection.out.is_empty())
            .map(|(token, _)| *token)
            .collect();
        for token in done {
            self.close_connection(token);
        }
    }

    fn close_connection(&mut self, token: Token) {
        let Some(mut connection) = self.connections.remove(&token) else {
            return;
        };
        let _ = self.poll.registry().deregister(&mut connection.stream);
        self.tokens_by_client.remove(&connection.client);
        self.engine.disconnect(connection.client);
        debug!(client = connection.client, "connection closed");
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::Duration;

    use qs_config::Config;

    use super::Server;

    fn start_server() -> std::net::SocketAddr {
        let mut config = Config::default();
        config.bind = "127.0.0.1:0".to_owned();
        let mut server = Server::new(config).expect("bind");
        let addr = server.local_addr().expect("addr");
        std::thread::spawn(move || {
            let _ = server.run();
        });
        addr
    }

    fn connect(addr: std::net::SocketAddr) -> TcpStream {
        let stream = TcpStream::connect(addr).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("timeout");
        stream
    }

    fn read_until(stream: &mut TcpStream, expected: &[u8]) -> Vec<u8> {
        let mut collected = Vec::new();
        let mut byte = [0_u8; 1];
        while !collected.ends_with(expected) {
            let read = stream.read(&mut byte).expect("read");
            assert!(read > 0, "connection closed early: {collected:?}");
            collected.push(byte[0]);
        }
        collected
    }

    #[test]
    fn serves_ping_over_tcp() {
        let addr = start_server();
        let mut stream = connect(addr);
        stream.write_all(b"*1\r\n$4\r\nPING\r\n").expect("write");
        assert_eq!(read_until(&mut stream, b"\r\n"), b"+PONG\r\n");
    }

    #[test]
    fn pipelined_set_get_round_trip() {
        let addr = start_server();
        let mut stream = connect(addr);
        stream
            .write_all(b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$5\r\nhello\r\n*2\r\n$3\r\nGET\r\n$1\r\nk\r\n")
            .expect("write");
        let reply = read_until(&mut stream, b"hello\r\n");
        assert_eq!(reply, b"+OK\r\n$5\r\nhello\r\n");
    }

    #[test]
    fn request_split_across_writes_decodes_once_complete() {
        let addr = start_server();
        let mut stream = connect(addr);
        stream.write_all(b"*1\r\n$4\r\nPI").expect("write");
        stream.flush().expect("flush");
        std::thread::sleep(Duration::from_millis(50));
        stream.write_all(b"NG\r\n").expect("write");
        assert_eq!(read_until(&mut stream, b"\r\n"), b"+PONG\r\n");
    }

    #[test]
    fn blpop_wakeup_across_connections() {
        let addr = start_server();
        let mut consumer = connect(addr);
        consumer
            .write_all(b"*3\r\n$5\r\nBLPOP\r\n$1\r\nq\r\n$1\r\n0\r\n")
            .expect("write");
        // Give the consumer time to register as a waiter.
        std::thread::sleep(Duration::from_millis(100));
        let mut producer = connect(addr);
        producer
            .write_all(b"*3\r\n$5\r\nRPUSH\r\n$1\r\nq\r\n$3\r\njob\r\n")
            .expect("write");
        assert_eq!(read_until(&mut producer, b"\r\n"), b":1\r\n");
        let reply = read_until(&mut consumer, b"job\r\n");
        assert_eq!(reply, b"*2\r\n$1\r\nq\r\n$3\r\njob\r\n");
    }

    #[test]
    fn protocol_error_closes_connection() {
        let addr = start_server();
        let mut stream = connect(addr);
        stream.write_all(b"!nonsense\r\n").expect("write");
        let mut collected = Vec::new();
        let mut buf = [0_u8; 256];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(read) => collected.extend_from_slice(&buf[..read]),
                Err(err) => panic!("read error before close: {err}"),
            }
        }
        let text = String::from_utf8_lossy(&collected);
        assert!(text.starts_with("-ERR Protocol error"), "got {text:?}");
    }
}
