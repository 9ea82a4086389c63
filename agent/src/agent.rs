use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http::{Request, Uri};
use lazy_static::lazy_static;
use serde::{Serialize, Serializer};
use tracing::debug;

use crate::connect::{Connector, NetConnector};
use crate::error::Error;
use crate::pool::SessionPool;
use crate::session::RequestStream;
use crate::session_id::SessionId;
use crate::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_GRACE_PERIOD, DEFAULT_KEEP_ALIVE_TIMEOUT,
    DEFAULT_MAX_CACHED_TLS_SESSIONS, DEFAULT_MAX_OUTSTANDING_PINGS,
    DEFAULT_PEER_MAX_CONCURRENT_STREAMS, DEFAULT_PING_INTERVAL,
};

/// Connection options of one session identity.
///
/// The whole struct (except `id`, which becomes a discriminator segment of
/// its own) takes part in the identity fingerprint: sessions are shared only
/// between calls with equal options. Unset fields inherit the agent defaults
/// before the identity is computed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionOptions {
    /// Assumed concurrency until the remote advertisement is known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_max_concurrent_streams: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "opt_ms")]
    pub connect_timeout: Option<Duration>,
    /// Idle-close timeout: a fully drained session closes after this long.
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "opt_ms")]
    pub keep_alive_timeout: Option<Duration>,
    /// Heartbeat interval. `Duration::ZERO` disables the heartbeat.
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "opt_ms")]
    pub ping_interval: Option<Duration>,
    /// Pong allowance factor: a pong missing for `ping_interval` times this
    /// value counts as a heartbeat failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_outstanding_pings: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "opt_ms")]
    pub grace_period: Option<Duration>,
    /// DER-encoded trust anchors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca: Option<Vec<Vec<u8>>>,
    /// DER-encoded client certificate chain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert: Option<Vec<Vec<u8>>>,
    /// DER-encoded client private key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<Vec<u8>>,
    /// `Some(false)` disables server certificate verification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reject_unauthorized: Option<bool>,
    /// Forces otherwise identical option sets into separate session groups.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

fn opt_ms<S: Serializer>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
    match duration {
        Some(duration) => serializer.serialize_u64(duration.as_millis() as u64),
        None => serializer.serialize_none(),
    }
}

impl SessionOptions {
    /// Fills unset fields from the agent defaults.
    pub(crate) fn merged(&self, defaults: &AgentOptions) -> SessionOptions {
        SessionOptions {
            peer_max_concurrent_streams: self
                .peer_max_concurrent_streams
                .or(Some(DEFAULT_PEER_MAX_CONCURRENT_STREAMS)),
            connect_timeout: self.connect_timeout.or(Some(defaults.connect_timeout)),
            keep_alive_timeout: self
                .keep_alive_timeout
                .or(Some(defaults.keep_alive_timeout)),
            ping_interval: self.ping_interval.or(defaults.ping_interval),
            max_outstanding_pings: self
                .max_outstanding_pings
                .or(Some(defaults.max_outstanding_pings)),
            grace_period: self.grace_period.or(Some(defaults.grace_period)),
            ..self.clone()
        }
    }

    pub(crate) fn peer_max_concurrent_streams(&self) -> usize {
        self.peer_max_concurrent_streams
            .unwrap_or(DEFAULT_PEER_MAX_CONCURRENT_STREAMS)
    }

    pub(crate) fn connect_timeout(&self) -> Duration {
        self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT)
    }

    pub(crate) fn keep_alive_timeout(&self) -> Duration {
        self.keep_alive_timeout.unwrap_or(DEFAULT_KEEP_ALIVE_TIMEOUT)
    }

    pub(crate) fn ping_interval(&self) -> Option<Duration> {
        self.ping_interval.filter(|interval| !interval.is_zero())
    }

    pub(crate) fn max_outstanding_pings(&self) -> u32 {
        self.max_outstanding_pings
            .unwrap_or(DEFAULT_MAX_OUTSTANDING_PINGS)
    }

    pub(crate) fn grace_period(&self) -> Duration {
        self.grace_period.unwrap_or(DEFAULT_GRACE_PERIOD)
    }
}

/// Construction options of an [`Agent`].
#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub max_cached_tls_sessions: usize,
    /// Idle-close timeout applied to fully drained sessions.
    pub keep_alive_timeout: Duration,
    pub connect_timeout: Duration,
    /// How long a graceful shutdown waits for in-flight streams.
    pub grace_period: Duration,
    pub max_outstanding_pings: u32,
    /// `None` disables heartbeats; idle sessions then only close via the
    /// idle timeout.
    pub ping_interval: Option<Duration>,
}

impl Default for AgentOptions {
    fn default() -> Self {
        AgentOptions {
            max_cached_tls_sessions: DEFAULT_MAX_CACHED_TLS_SESSIONS,
            keep_alive_timeout: DEFAULT_KEEP_ALIVE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            grace_period: DEFAULT_GRACE_PERIOD,
            max_outstanding_pings: DEFAULT_MAX_OUTSTANDING_PINGS,
            ping_interval: Some(DEFAULT_PING_INTERVAL),
        }
    }
}

/// Owner of all session groups and of the recycled TLS state.
///
/// Cheap to clone; clones share the same pool table. Most callers use the
/// process-wide [`global_agent`]; tests construct isolated instances.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

pub(crate) struct AgentInner {
    options: AgentOptions,
    pub(crate) connector: Arc<dyn Connector>,
    pools: Mutex<HashMap<SessionId, Arc<SessionPool>>>,
}

impl Agent {
    pub fn new(options: AgentOptions) -> Self {
        let connector = Arc::new(NetConnector::new(options.max_cached_tls_sessions));
        Self::with_connector(options, connector)
    }

    /// Builds an agent on a custom transport (tests plug in an in-process
    /// connector here).
    pub fn with_connector(options: AgentOptions, connector: Arc<dyn Connector>) -> Self {
        Agent {
            inner: Arc::new(AgentInner {
                options,
                connector,
                pools: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Finds or creates the session group for this authority and option set.
    pub fn pool(&self, authority: &str, options: &SessionOptions) -> Result<Arc<SessionPool>, Error> {
        let uri: Uri = authority
            .parse()
            .map_err(|_| Error::Config(format!("invalid authority: {}", authority)))?;
        if uri.scheme().is_none() || uri.host().is_none() {
            return Err(Error::Config(format!(
                "authority must be an absolute URL: {}",
                authority
            )));
        }
        let options = options.merged(&self.inner.options);
        let sid = SessionId::new(&uri, &options);
        let mut pools = self.inner.pools.lock().unwrap();
        if let Some(pool) = pools.get(&sid) {
            return Ok(pool.clone());
        }
        let pool = SessionPool::new(
            sid.clone(),
            options,
            self.inner.connector.clone(),
            Arc::downgrade(&self.inner),
        );
        debug!(sid = %sid, pools = pools.len() + 1, "pool added");
        pools.insert(sid, pool.clone());
        Ok(pool)
    }

    /// Leases a session for the authority and issues one stream on it.
    pub async fn request(
        &self,
        authority: &str,
        options: &SessionOptions,
        request: Request<()>,
        body: Option<Bytes>,
    ) -> Result<RequestStream, Error> {
        self.pool(authority, options)?.request(request, body).await
    }

    /// Number of session groups currently tracked.
    pub fn pools(&self) -> usize {
        self.inner.pools.lock().unwrap().len()
    }

    /// Graceful teardown: drains every session within the grace period.
    pub async fn shutdown(&self) {
        let pools: Vec<_> = self.inner.pools.lock().unwrap().drain().collect();
        futures::future::join_all(pools.iter().map(|(_, pool)| pool.shutdown())).await;
    }

    /// Forced synchronous teardown of every session in every group. Evicts
    /// all recycled TLS state.
    pub fn destroy(&self) {
        let pools: Vec<_> = self.inner.pools.lock().unwrap().drain().collect();
        for (_, pool) in pools {
            pool.destroy();
        }
    }
}

impl AgentInner {
    /// Drops an empty session group from the table.
    pub(crate) fn prune(&self, sid: &SessionId) {
        let mut pools = self.pools.lock().unwrap();
        if pools.remove(sid).is_some() {
            debug!(sid = %sid, pools = pools.len(), "pool pruned");
        }
    }
}

lazy_static! {
    static ref GLOBAL_AGENT: Agent = Agent::new(AgentOptions::default());
}

/// The process-wide default agent, initialized lazily on first use.
pub fn global_agent() -> &'static Agent {
    &GLOBAL_AGENT
}
