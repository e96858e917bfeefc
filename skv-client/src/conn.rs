//! # Protocol Connection
//!
//! Purpose: Own one TCP socket and run framed command/response exchanges on
//! it: dial, authenticate, send, receive, and retry once on failure.
//!
//! ## Design Principles
//! 1. **One Exchange at a Time**: A connection is leased to a single caller;
//!    there is no internal locking.
//! 2. **Buffer Reuse**: The write buffer, read chunk and argument scratch live
//!    on the connection to avoid per-command allocations.
//! 3. **Streaming Receive**: Bytes accumulate in a `BytesMut` across partial
//!    reads; leftovers survive to the next response.
//! 4. **Close on Doubt**: Any IO or framing failure closes the socket so a
//!    half-written packet is never reused.

use std::io::{self, Read};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use socket2::SockRef;
use tracing::{debug, warn};

use skv_common::{parse_frames, Config, FrameWriter, SkvError, SkvResult};

use crate::arg::{Arg, ArgEncoder, JsonEncoder};
use crate::reply::{Reply, STATUS_OK};

/// Per-connection parameters, shared by every connection of a pool.
pub struct ConnectionSettings {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub retry_enabled: bool,
    pub encoding: bool,
    pub encoder: Arc<dyn ArgEncoder>,
}

impl ConnectionSettings {
    /// Extracts connection parameters from a pool config.
    pub fn from_config(config: &Config, encoder: Arc<dyn ArgEncoder>) -> Self {
        ConnectionSettings {
            host: config.host.clone(),
            port: config.port,
            password: config.password.clone().filter(|password| !password.is_empty()),
            connect_timeout: config.connect_timeout,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            read_buffer_size: config.read_buffer_size.max(512),
            write_buffer_size: config.write_buffer_size,
            retry_enabled: config.retry_enabled,
            encoding: config.encoding,
            encoder,
        }
    }
}

impl std::fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("retry_enabled", &self.retry_enabled)
            .field("encoding", &self.encoding)
            .finish_non_exhaustive()
    }
}

impl From<&Config> for ConnectionSettings {
    fn from(config: &Config) -> Self {
        ConnectionSettings::from_config(config, Arc::new(JsonEncoder))
    }
}

/// Single framed connection to the store.
///
/// Created closed; `start` dials it. `is_open` reports the cached flag and
/// never probes the socket.
#[derive(Debug)]
pub struct Connection {
    settings: Arc<ConnectionSettings>,
    stream: Option<TcpStream>,
    open: bool,
    writer: FrameWriter,
    recv_buf: BytesMut,
    // Read chunk size follows `read_buffer_size`.
    chunk: Vec<u8>,
    scratch: Vec<u8>,
}

impl Connection {
    /// Creates a closed connection.
    pub fn new(settings: Arc<ConnectionSettings>) -> Self {
        let mut writer = FrameWriter::with_capacity(settings.write_buffer_size);
        writer.release();
        Connection {
            settings,
            stream: None,
            open: false,
            writer,
            recv_buf: BytesMut::new(),
            chunk: Vec::new(),
            scratch: Vec::with_capacity(32),
        }
    }

    /// Creates and starts a connection.
    pub fn connect(settings: Arc<ConnectionSettings>) -> SkvResult<Self> {
        let mut conn = Connection::new(settings);
        conn.start()?;
        Ok(conn)
    }

    /// Dials the server, tunes the socket, and authenticates when configured.
    ///
    /// **Logic**:
    /// 1. Resolve `host:port` and dial each address with the connect timeout.
    /// 2. Disable Nagle, size the kernel socket buffers.
    /// 3. Allocate the write buffer and reset receive state.
    /// 4. Mark open, then run `auth` if a password is configured.
    pub fn start(&mut self) -> SkvResult<()> {
        self.close();
        let stream = dial(&self.settings)?;
        stream
            .set_nodelay(true)
            .map_err(|err| SkvError::connection("set nodelay", err))?;
        let sock = SockRef::from(&stream);
        sock.set_recv_buffer_size(self.settings.read_buffer_size)
            .map_err(|err| SkvError::connection("set read buffer", err))?;
        sock.set_send_buffer_size(self.settings.write_buffer_size.max(FrameWriter::MIN_CAPACITY))
            .map_err(|err| SkvError::connection("set write buffer", err))?;

        self.writer = FrameWriter::with_capacity(self.settings.write_buffer_size);
        self.chunk.resize(self.settings.read_buffer_size, 0);
        self.recv_buf.clear();
        self.stream = Some(stream);
        self.open = true;
        self.auth()
    }

    /// Closes the socket and releases the write buffer. Idempotent.
    pub fn close(&mut self) {
        self.open = false;
        self.writer.release();
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }

    /// Cached open flag.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Executes one command, retrying once on a fresh socket when enabled.
    pub fn exec(&mut self, args: &[Arg<'_>]) -> SkvResult<Reply> {
        let err = match self.exec_once(args) {
            Ok(reply) => return Ok(reply),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => err,
        };

        self.close();
        if !self.settings.retry_enabled {
            return Err(err);
        }

        debug!(error = %err, addr = %self.addr(), "command failed, reconnecting once");
        self.start()?;
        self.exec_once(args).map_err(|err| {
            if err.is_retryable() {
                self.close();
            }
            err
        })
    }

    /// Sends `ping`; true when the server answers `ok`.
    pub fn ping(&mut self) -> bool {
        match self.exec_once(&[Arg::from("ping")]) {
            Ok(reply) => reply.is_ok(),
            Err(err) => {
                debug!(error = %err, "ping failed");
                false
            }
        }
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.settings.host, self.settings.port)
    }

    fn exec_once(&mut self, args: &[Arg<'_>]) -> SkvResult<Reply> {
        if !self.open {
            return Err(SkvError::closed());
        }
        // Reject unframeable arguments before touching the socket.
        if !self.settings.encoding {
            if let Some(arg) = args.iter().find(|arg| arg.needs_encoder()) {
                return Err(SkvError::ArgumentType(format!(
                    "{:?} needs encoding enabled",
                    arg
                )));
            }
        }

        if let Err(err) = self.send(args) {
            self.open = false;
            return Err(err);
        }
        match self.recv() {
            Ok(reply) => Ok(reply),
            Err(err) => {
                self.open = false;
                Err(err)
            }
        }
    }

    fn auth(&mut self) -> SkvResult<()> {
        let password = match self.settings.password.clone() {
            Some(password) => password,
            None => return Ok(()),
        };

        let reply = match self.exec_once(&[Arg::from("auth"), Arg::from(password)]) {
            Ok(reply) => reply,
            Err(err) => {
                self.close();
                return Err(err);
            }
        };
        if reply.is_ok() {
            return Ok(());
        }

        self.close();
        warn!(addr = %self.addr(), status = ?reply.status(), "authentication rejected");
        Err(SkvError::Auth(format!(
            "server answered {:?}, password is wrong",
            reply.status().unwrap_or("")
        )))
    }

    fn send(&mut self, args: &[Arg<'_>]) -> SkvResult<()> {
        let Connection {
            settings,
            stream,
            writer,
            scratch,
            ..
        } = self;
        let stream = stream.as_mut().ok_or_else(SkvError::closed)?;
        let encoder: Option<&dyn ArgEncoder> = if settings.encoding {
            Some(settings.encoder.as_ref())
        } else {
            None
        };

        stream
            .set_write_timeout(non_zero(settings.write_timeout))
            .map_err(|err| SkvError::connection("set write deadline", err))?;
        writer.reset();
        for arg in args {
            let payload = arg.encode(scratch, encoder)?;
            writer
                .write_frame(stream, payload)
                .map_err(|err| SkvError::connection("send", err))?;
        }
        writer
            .finish(stream)
            .map_err(|err| SkvError::connection("send", err))?;
        stream
            .set_write_timeout(None)
            .map_err(|err| SkvError::connection("clear write deadline", err))
    }

    fn recv(&mut self) -> SkvResult<Reply> {
        let Connection {
            settings,
            stream,
            recv_buf,
            chunk,
            ..
        } = self;
        let stream = stream.as_mut().ok_or_else(SkvError::closed)?;

        stream
            .set_read_timeout(non_zero(settings.read_timeout))
            .map_err(|err| SkvError::connection("set read deadline", err))?;
        loop {
            if let Some(values) = parse_frames(recv_buf)? {
                stream
                    .set_read_timeout(None)
                    .map_err(|err| SkvError::connection("clear read deadline", err))?;
                return Ok(Reply::new(values));
            }
            let n = match stream.read(chunk) {
                Ok(0) => {
                    return Err(SkvError::connection(
                        "recv",
                        io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer"),
                    ))
                }
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(SkvError::connection("recv", err)),
            };
            recv_buf.extend_from_slice(&chunk[..n]);
        }
    }
}

fn dial(settings: &ConnectionSettings) -> SkvResult<TcpStream> {
    let addrs: Vec<SocketAddr> = (settings.host.as_str(), settings.port)
        .to_socket_addrs()
        .map_err(|err| SkvError::connection("resolve", err))?
        .collect();

    let mut last_err =
        io::Error::new(io::ErrorKind::AddrNotAvailable, "host resolved to no addresses");
    for addr in addrs {
        let attempt = match non_zero(settings.connect_timeout) {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
            None => TcpStream::connect(addr),
        };
        match attempt {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = err,
        }
    }
    Err(SkvError::connection("dial", last_err))
}

fn non_zero(timeout: Duration) -> Option<Duration> {
    if timeout.is_zero() {
        None
    } else {
        Some(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;
    use std::thread;

    use skv_common::encode_frames;

    fn settings_for(addr: SocketAddr) -> Arc<ConnectionSettings> {
        let config = Config::new(addr.ip().to_string(), addr.port())
            .with_timeouts(Duration::from_secs(1), Duration::from_secs(1), Duration::from_secs(1));
        Arc::new(ConnectionSettings::from(&config))
    }

    #[test]
    fn closed_connection_rejects_commands() {
        let config = Config::default();
        let mut conn = Connection::new(Arc::new(ConnectionSettings::from(&config)));
        assert!(!conn.is_open());
        let err = conn.exec(&[Arg::from("ping")]).unwrap_err();
        assert!(err.is_connection());
        conn.close();
        conn.close();
        assert!(!conn.is_open());
    }

    #[test]
    fn structured_argument_fails_before_io() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = thread::spawn(move || listener.accept().map(|(stream, _)| stream));

        let mut conn = Connection::connect(settings_for(addr)).unwrap();
        let _peer = accept.join().unwrap().unwrap();
        let arg = Arg::structured(&vec![1, 2, 3]).unwrap();
        let err = conn.exec(&[Arg::from("set"), arg]).unwrap_err();
        assert!(matches!(err, SkvError::ArgumentType(_)));
        assert!(conn.is_open());
    }

    #[test]
    fn reassembles_response_split_across_writes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = BytesMut::new();
            let mut chunk = [0u8; 256];
            loop {
                if parse_frames(&mut reader).unwrap().is_some() {
                    break;
                }
                let n = stream.read(&mut chunk).unwrap();
                reader.extend_from_slice(&chunk[..n]);
            }
            let mut reply = Vec::new();
            encode_frames(&[&b"ok"[..], b"hello world"], &mut reply);
            for piece in reply.chunks(3) {
                stream.write_all(piece).unwrap();
                stream.flush().unwrap();
                thread::sleep(Duration::from_millis(2));
            }
        });

        let mut conn = Connection::connect(settings_for(addr)).unwrap();
        let reply = conn.exec(&[Arg::from("get"), Arg::from("greeting")]).unwrap();
        assert!(reply.is_ok());
        assert_eq!(reply.get_str(1), Some("hello world"));
        server.join().unwrap();
    }

    #[test]
    fn peer_close_surfaces_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            drop(stream);
        });

        let mut conn = Connection::connect(settings_for(addr)).unwrap();
        server.join().unwrap();
        let err = conn.exec(&[Arg::from("ping")]).unwrap_err();
        assert!(err.is_connection());
        assert!(!conn.is_open());
    }
}
