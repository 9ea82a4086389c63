//! Client-side HTTP/2 session management.
//!
//! An [`Agent`](agent::Agent) owns groups of HTTP/2 sessions keyed by origin
//! and connection options. Requests against the same identity multiplex onto
//! as few sessions as their concurrency allows; new sessions are only dialed
//! when every existing one is saturated, and drained sessions close after an
//! idle timeout. The [`Client`](client::Client) on top resolves urls against
//! a prefix, decodes bodies by content type and turns error statuses into
//! structured errors.

use std::time::Duration;

pub mod agent;
pub mod client;
pub mod connect;
pub mod error;
pub mod pool;
pub mod semaphore;
pub mod session;
pub mod session_id;
#[cfg(test)]
pub(crate) mod testing;

pub use crate::agent::{global_agent, Agent, AgentOptions, SessionOptions};
pub use crate::client::{Body, Client, ClientOptions, Lines, RequestOptions, Response};
pub use crate::error::{is_http_error, Error, HttpError};
pub use crate::pool::SessionPool;
pub use crate::session_id::SessionId;

/// Assumed stream concurrency of a session until the peer SETTINGS frame
/// arrives.
pub const DEFAULT_PEER_MAX_CONCURRENT_STREAMS: usize = 100;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// A fully drained session closes after staying idle this long.
pub const DEFAULT_KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
/// Pong allowance factor: see [`SessionOptions::max_outstanding_pings`].
pub const DEFAULT_MAX_OUTSTANDING_PINGS: u32 = 2;
/// How long a graceful shutdown waits for in-flight streams to finish.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(15);
/// Capacity of the recycled TLS state cache, in session identities.
pub const DEFAULT_MAX_CACHED_TLS_SESSIONS: usize = 100;

/// Sessions younger than this are removed on a debounce timer instead of
/// immediately, so a burst that empties a pool does not tear down sessions
/// the next burst would reuse.
pub const MIN_SESSION_RESIDENCY: Duration = Duration::from_millis(100);
