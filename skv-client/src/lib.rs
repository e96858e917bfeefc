//! # SKV Sync Client
//!
//! Purpose: Blocking client for the length-framed SKV protocol, built around
//! an adaptive pool that grows by whole cells under load and shrinks back when
//! demand drops.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse TCP connections across commands; cells
//!    bound how many exist at once.
//! 2. **Bounded Waiting**: Saturated acquirers park in a fixed-size queue
//!    and fail fast when it is full.
//! 3. **Minimal Allocation**: Connections reuse their write buffer, read
//!    buffer and argument scratch space; replies are zero-copy `Bytes`.
//! 4. **Protocol Clarity**: Framing lives in `skv-common` and is shared with
//!    the test server.
//!
//! ```no_run
//! use skv_client::{args, Config, Connectors};
//!
//! let pool = Connectors::new(Config::new("127.0.0.1", 8888))?;
//! pool.start()?;
//! let mut client = pool.new_client()?;
//! let reply = client.exec(&args!["set", "answer", 42])?;
//! assert!(reply.is_ok());
//! # Ok::<(), skv_client::SkvError>(())
//! ```

mod arg;
mod cell;
mod client;
mod conn;
mod connectors;
mod health;
mod metrics;
mod reply;
mod waiters;

pub use arg::{Arg, ArgEncoder, JsonEncoder};
pub use client::Client;
pub use conn::{Connection, ConnectionSettings};
pub use connectors::{Connectors, PoolStatus};
pub use metrics::PoolInfo;
pub use reply::{Reply, STATUS_NOT_FOUND, STATUS_OK};
pub use skv_common::{Config, SkvError, SkvResult};
