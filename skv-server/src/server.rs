//! # TCP Server
//!
//! Accept length-framed connections, parse packets, and dispatch them to a
//! small in-memory key/value map. Used as the peer for client tests and as a
//! standalone binary.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use skv_common::{encode_frames, parse_frames, push_i64, push_u64};

const OK: &[u8] = b"ok";
const NOT_FOUND: &[u8] = b"not_found";
const ERROR: &[u8] = b"error";
const CLIENT_ERROR: &[u8] = b"client_error";
const NOAUTH: &[u8] = b"noauth";

/// State shared by every connection task.
pub struct ServerState {
    password: Option<String>,
    data: Mutex<HashMap<Bytes, Bytes>>,
    accepted: AtomicU64,
    commands: AtomicU64,
    // Bumping the generation closes every open connection.
    kill: watch::Sender<u64>,
}

impl ServerState {
    /// Creates server state; `password` enables the `auth` requirement.
    pub fn new(password: Option<String>) -> Self {
        let (kill, _) = watch::channel(0);
        ServerState {
            password: password.filter(|password| !password.is_empty()),
            data: Mutex::new(HashMap::new()),
            accepted: AtomicU64::new(0),
            commands: AtomicU64::new(0),
            kill,
        }
    }

    /// Connections accepted since start.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Packets dispatched since start.
    pub fn commands(&self) -> u64 {
        self.commands.load(Ordering::Relaxed)
    }

    /// Closes every connection currently open. New connections are unaffected.
    pub fn drop_connections(&self) {
        self.kill.send_modify(|generation| *generation = generation.wrapping_add(1));
    }
}

/// Accepts connections until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: Arc<ServerState>, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    info!(addr = %listener.local_addr()?, "server listening");

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        continue;
                    }
                };
                state.accepted.fetch_add(1, Ordering::Relaxed);
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, state).await {
                        debug!(%peer, error = %err, "connection ended with error");
                    }
                });
            }
        }
    }

    info!("server stopped");
    Ok(())
}

/// Handles a single TCP client connection.
pub async fn handle_connection(stream: TcpStream, state: Arc<ServerState>) -> io::Result<()> {
    let mut stream = stream;
    stream.set_nodelay(true)?;
    let mut kill = state.kill.subscribe();
    let mut buffer = BytesMut::with_capacity(8 * 1024);
    let mut response = Vec::with_capacity(256);
    let mut authed = state.password.is_none();

    loop {
        loop {
            match parse_frames(&mut buffer) {
                Ok(Some(args)) => {
                    response.clear();
                    dispatch_command(&args, &state, &mut authed, &mut response);
                    stream.write_all(&response).await?;
                }
                Ok(None) => break,
                Err(err) => {
                    response.clear();
                    let message = err.to_string();
                    encode_frames(&[ERROR, message.as_bytes()], &mut response);
                    stream.write_all(&response).await?;
                    return Ok(());
                }
            }
        }

        tokio::select! {
            read = stream.read_buf(&mut buffer) => {
                if read? == 0 {
                    return Ok(());
                }
            }
            _ = kill.changed() => {
                debug!("connection dropped on request");
                return Ok(());
            }
        }
    }
}

fn dispatch_command(args: &[Bytes], state: &ServerState, authed: &mut bool, out: &mut Vec<u8>) {
    state.commands.fetch_add(1, Ordering::Relaxed);
    let cmd = match args.first() {
        Some(cmd) => cmd.to_ascii_lowercase(),
        None => return encode_frames(&[CLIENT_ERROR, b"empty command"], out),
    };

    if cmd == b"auth" {
        return handle_auth(args, state, authed, out);
    }
    if !*authed {
        return encode_frames(&[NOAUTH, b"authentication required"], out);
    }

    match cmd.as_slice() {
        b"ping" => encode_frames(&[OK], out),
        b"echo" => {
            let mut values: Vec<&[u8]> = Vec::with_capacity(args.len());
            values.push(OK);
            values.extend(args[1..].iter().map(|value| &value[..]));
            encode_frames(&values, out);
        }
        b"set" => handle_set(args, state, out),
        b"get" => handle_get(args, state, out),
        b"del" => handle_del(args, state, out),
        b"exists" => handle_exists(args, state, out),
        b"incr" => handle_incr(args, state, out),
        b"dbsize" => {
            let mut size = Vec::new();
            push_u64(&mut size, state.data.lock().len() as u64);
            encode_frames(&[OK, &size[..]], out);
        }
        b"info" => handle_info(state, out),
        _ => {
            let message = format!("Unknown Command: {}", String::from_utf8_lossy(&cmd));
            encode_frames(&[CLIENT_ERROR, message.as_bytes()], out);
        }
    }
}

fn handle_auth(args: &[Bytes], state: &ServerState, authed: &mut bool, out: &mut Vec<u8>) {
    if args.len() != 2 {
        return encode_frames(&[CLIENT_ERROR, b"wrong number of arguments for auth"], out);
    }
    let accepted = match &state.password {
        Some(password) => password.as_bytes() == &args[1][..],
        None => true,
    };
    if accepted {
        *authed = true;
        encode_frames(&[OK, b"1"], out);
    } else {
        encode_frames(&[ERROR, b"invalid password"], out);
    }
}

fn handle_set(args: &[Bytes], state: &ServerState, out: &mut Vec<u8>) {
    if args.len() != 3 {
        return encode_frames(&[CLIENT_ERROR, b"wrong number of arguments for set"], out);
    }
    state.data.lock().insert(args[1].clone(), args[2].clone());
    encode_frames(&[OK, b"1"], out);
}

fn handle_get(args: &[Bytes], state: &ServerState, out: &mut Vec<u8>) {
    if args.len() != 2 {
        return encode_frames(&[CLIENT_ERROR, b"wrong number of arguments for get"], out);
    }
    let value = state.data.lock().get(&args[1]).cloned();
    match value {
        Some(value) => encode_frames(&[OK, &value[..]], out),
        None => encode_frames(&[NOT_FOUND], out),
    }
}

fn handle_del(args: &[Bytes], state: &ServerState, out: &mut Vec<u8>) {
    if args.len() != 2 {
        return encode_frames(&[CLIENT_ERROR, b"wrong number of arguments for del"], out);
    }
    state.data.lock().remove(&args[1]);
    encode_frames(&[OK, b"1"], out);
}

fn handle_exists(args: &[Bytes], state: &ServerState, out: &mut Vec<u8>) {
    if args.len() != 2 {
        return encode_frames(&[CLIENT_ERROR, b"wrong number of arguments for exists"], out);
    }
    let found: &[u8] = if state.data.lock().contains_key(&args[1]) {
        b"1"
    } else {
        b"0"
    };
    encode_frames(&[OK, found], out);
}

fn handle_incr(args: &[Bytes], state: &ServerState, out: &mut Vec<u8>) {
    if args.len() != 2 && args.len() != 3 {
        return encode_frames(&[CLIENT_ERROR, b"wrong number of arguments for incr"], out);
    }
    let by = match args.get(2) {
        Some(raw) => match parse_i64(raw) {
            Some(by) => by,
            None => return encode_frames(&[CLIENT_ERROR, b"increment is not an integer"], out),
        },
        None => 1,
    };

    let mut data = state.data.lock();
    let current = match data.get(&args[1]) {
        Some(raw) => match parse_i64(raw) {
            Some(current) => current,
            None => return encode_frames(&[ERROR, b"value is not an integer"], out),
        },
        None => 0,
    };
    let next = current.wrapping_add(by);
    let mut text = Vec::new();
    push_i64(&mut text, next);
    data.insert(args[1].clone(), Bytes::from(text.clone()));
    drop(data);
    encode_frames(&[OK, &text[..]], out);
}

fn handle_info(state: &ServerState, out: &mut Vec<u8>) {
    let mut keys = Vec::new();
    push_u64(&mut keys, state.data.lock().len() as u64);
    let mut accepted = Vec::new();
    push_u64(&mut accepted, state.accepted());
    let mut commands = Vec::new();
    push_u64(&mut commands, state.commands());
    encode_frames(
        &[
            OK,
            b"version",
            env!("CARGO_PKG_VERSION").as_bytes(),
            b"keys",
            &keys[..],
            b"connections",
            &accepted[..],
            b"commands",
            &commands[..],
        ],
        out,
    );
}

fn parse_i64(raw: &[u8]) -> Option<i64> {
    std::str::from_utf8(raw).ok()?.parse().ok()
}
