//! In-process peers for exercising sessions without a network.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::DuplexStream;
use tokio::time::sleep;

use crate::agent::SessionOptions;
use crate::connect::{Connector, Io};
use crate::session_id::SessionId;

/// Prints test logs when `RUST_LOG` is set. Safe to call repeatedly.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Canned peer behavior, applied to every accepted stream.
#[derive(Debug, Clone)]
pub(crate) struct Behavior {
    pub status: u16,
    pub content_type: &'static str,
    /// Body chunks, sent as separate DATA frames.
    pub body: Vec<Bytes>,
    /// Pause before the response headers are sent.
    pub delay: Duration,
    /// Stream concurrency advertised in the peer SETTINGS frame.
    pub max_concurrent_streams: Option<u32>,
    /// Keep the pipe open but never speak; pings go unanswered.
    pub deaf: bool,
}

impl Default for Behavior {
    fn default() -> Self {
        Behavior {
            status: 200,
            content_type: "application/json",
            body: Vec::new(),
            delay: Duration::ZERO,
            max_concurrent_streams: None,
            deaf: false,
        }
    }
}

/// Connector backed by an in-memory duplex pipe with a canned peer on the
/// other end. Counts connect calls so tests can assert session reuse.
pub(crate) struct DuplexConnector {
    behavior: Behavior,
    connects: AtomicUsize,
    invalidations: AtomicUsize,
}

impl DuplexConnector {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(DuplexConnector {
            behavior,
            connects: AtomicUsize::new(0),
            invalidations: AtomicUsize::new(0),
        })
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for DuplexConnector {
    async fn connect(&self, _id: &SessionId, _options: &SessionOptions) -> io::Result<Box<dyn Io>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (near, far) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve(far, self.behavior.clone()));
        Ok(Box::new(near))
    }

    fn invalidate(&self, _id: &SessionId) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }
}

/// Connector whose connect calls are refused immediately.
pub(crate) struct FailingConnector;

#[async_trait]
impl Connector for FailingConnector {
    async fn connect(&self, _id: &SessionId, _options: &SessionOptions) -> io::Result<Box<dyn Io>> {
        Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
    }
}

/// Connector whose connect call never resolves. For timeout tests.
pub(crate) struct StalledConnector;

#[async_trait]
impl Connector for StalledConnector {
    async fn connect(&self, _id: &SessionId, _options: &SessionOptions) -> io::Result<Box<dyn Io>> {
        futures::future::pending().await
    }
}

async fn serve(io: DuplexStream, behavior: Behavior) {
    if behavior.deaf {
        let _io = io;
        futures::future::pending::<()>().await;
        return;
    }
    let mut builder = h2::server::Builder::new();
    if let Some(max) = behavior.max_concurrent_streams {
        builder.max_concurrent_streams(max);
    }
    let mut conn = match builder.handshake::<_, Bytes>(io).await {
        Ok(conn) => conn,
        Err(_) => return,
    };
    while let Some(accepted) = conn.accept().await {
        let (request, mut respond) = match accepted {
            Ok(accepted) => accepted,
            Err(_) => return,
        };
        drop(request);
        let behavior = behavior.clone();
        tokio::spawn(async move {
            if !behavior.delay.is_zero() {
                sleep(behavior.delay).await;
            }
            let response = match http::Response::builder()
                .status(behavior.status)
                .header(http::header::CONTENT_TYPE, behavior.content_type)
                .body(())
            {
                Ok(response) => response,
                Err(_) => return,
            };
            let mut stream = match respond.send_response(response, behavior.body.is_empty()) {
                Ok(stream) => stream,
                Err(_) => return,
            };
            let chunks = behavior.body.len();
            for (i, chunk) in behavior.body.into_iter().enumerate() {
                if stream.send_data(chunk, i + 1 == chunks).is_err() {
                    return;
                }
            }
        });
    }
}
