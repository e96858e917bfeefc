//! # SKV Server
//!
//! Purpose: A small tokio server speaking the length-framed SKV protocol
//! over an in-memory map. It backs the client's integration tests and can run
//! standalone through the `skv-server` binary.
//!
//! `ServerHandle` runs the server on a dedicated thread with its own
//! current-thread runtime so blocking callers can use it directly.

pub mod server;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tokio::sync::oneshot;
use tracing::warn;

pub use server::{handle_connection, serve, ServerState};

/// Background server bound to an ephemeral loopback port.
pub struct ServerHandle {
    addr: SocketAddr,
    state: Arc<ServerState>,
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// Binds `127.0.0.1:0` and starts serving; `password` enables auth.
    pub fn spawn(password: Option<&str>) -> io::Result<Self> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        let state = Arc::new(ServerState::new(password.map(str::to_owned)));
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (shutdown, stopped) = oneshot::channel::<()>();

        let served = Arc::clone(&state);
        let join = thread::Builder::new()
            .name("skv-server".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    let listener = match tokio::net::TcpListener::from_std(listener) {
                        Ok(listener) => listener,
                        Err(err) => {
                            warn!(error = %err, "failed to register listener");
                            return;
                        }
                    };
                    let stopped = async {
                        let _ = stopped.await;
                    };
                    if let Err(err) = serve(listener, served, stopped).await {
                        warn!(error = %err, "server loop failed");
                    }
                });
            })?;

        Ok(ServerHandle {
            addr,
            state,
            shutdown: Some(shutdown),
            join: Some(join),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Connections accepted so far.
    pub fn accepted(&self) -> u64 {
        self.state.accepted()
    }

    /// Closes every open connection while continuing to accept new ones.
    pub fn drop_connections(&self) {
        self.state.drop_connections();
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// Stops accepting, drops open connections and joins the server thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
