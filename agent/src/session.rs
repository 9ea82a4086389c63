use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use h2::client::{Connection, ResponseFuture, SendRequest};
use h2::{Ping, PingPong, Reason, RecvStream, SendStream};
use http::Request;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::error::Error;
use crate::pool::SessionPool;
use crate::semaphore::{Permit, Semaphore};
use crate::session_id::SessionId;

/// Session lifecycle. Error paths shortcut straight to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Connecting,
    Ready,
    Draining,
    Closed,
}

/// One multiplexed h2 connection to an origin, owned by exactly one pool.
///
/// The h2 connection itself lives in a background driver task; the session
/// holds the stream-opening handle, the concurrency limiter and the timers
/// (idle-close, heartbeat).
pub struct Session {
    id: SessionId,
    created_at: Instant,
    state: Mutex<State>,
    semaphore: Arc<Semaphore>,
    send_request: SendRequest<Bytes>,
    keep_alive_timeout: Duration,
    pool: Weak<SessionPool>,
    idle_timer: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    removal_scheduled: AtomicBool,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        semaphore: Arc<Semaphore>,
        send_request: SendRequest<Bytes>,
        keep_alive_timeout: Duration,
        pool: Weak<SessionPool>,
    ) -> Arc<Self> {
        Arc::new(Session {
            id,
            created_at: Instant::now(),
            state: Mutex::new(State::Connecting),
            semaphore,
            send_request,
            keep_alive_timeout,
            pool,
            idle_timer: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            removal_scheduled: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn state(&self) -> State {
        *self.state.lock().unwrap()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == State::Ready
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn semaphore(&self) -> &Arc<Semaphore> {
        &self.semaphore
    }

    /// Free capacity as seen by session selection; negative means "not free".
    pub fn available(&self) -> isize {
        self.semaphore.available()
    }

    pub(crate) fn set_ready(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == State::Connecting {
            *state = State::Ready;
        }
    }

    pub(crate) fn set_draining(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == State::Ready || *state == State::Connecting {
            *state = State::Draining;
        }
    }

    /// First call wins; the debounced-removal task is scheduled at most once.
    pub(crate) fn schedule_removal(&self) -> bool {
        !self.removal_scheduled.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn add_task(&self, task: JoinHandle<()>) {
        self.tasks.lock().unwrap().push(task);
    }

    /// Issues one stream on this session, consuming a granted lease.
    ///
    /// Cancels any pending idle-close, waits for h2 send readiness and opens
    /// the stream. The returned lease releases the permit on drop and re-arms
    /// the idle-close once the limiter fully drains again.
    pub(crate) async fn request(
        self: &Arc<Self>,
        permit: Permit,
        request: Request<()>,
        body: Option<Bytes>,
    ) -> Result<RequestStream, Error> {
        if !self.is_ready() {
            return Err(Error::SessionClosed);
        }
        self.clear_idle_timer();
        let mut send_request = self.send_request.clone().ready().await?;
        let end_of_stream = body.is_none();
        let (response, mut send) = send_request.send_request(request, end_of_stream)?;
        if let Some(body) = body {
            send.send_data(body, true)?;
        }
        trace!(sid = %self.id, in_flight = self.semaphore.in_flight(), "stream opened");
        Ok(RequestStream {
            response,
            send,
            canceled: false,
            _guard: StreamGuard {
                permit: Some(permit),
                session: self.clone(),
            },
        })
    }

    pub(crate) fn clear_idle_timer(&self) {
        if let Some(timer) = self.idle_timer.lock().unwrap().take() {
            timer.abort();
        }
    }

    /// Re-arms the idle-close timer. It fires only while the limiter is fully
    /// drained; any new stream cancels it.
    pub(crate) fn arm_idle_close(self: &Arc<Self>) {
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => return,
        };
        let timeout = self.keep_alive_timeout;
        let session = Arc::downgrade(self);
        let pool = self.pool.clone();
        let timer = handle.spawn(async move {
            loop {
                tokio::time::sleep(timeout).await;
                let (session, pool) = match (session.upgrade(), pool.upgrade()) {
                    (Some(session), Some(pool)) => (session, pool),
                    _ => return,
                };
                if !session.is_ready() {
                    return;
                }
                if session.semaphore.is_idle() {
                    info!(sid = %session.id, "session idle timeout");
                    session.set_draining();
                    pool.remove_session(&session, false);
                    return;
                }
            }
        });
        let mut slot = self.idle_timer.lock().unwrap();
        if let Some(old) = slot.replace(timer) {
            old.abort();
        }
    }

    fn maybe_arm_idle_close(self: &Arc<Self>) {
        if self.is_ready() && self.semaphore.is_idle() {
            self.arm_idle_close();
        }
    }

    /// Stops accepting new streams and waits up to the grace period for
    /// in-flight streams to drain before the forced close.
    pub(crate) async fn shutdown(self: &Arc<Self>, grace: Duration) {
        {
            let state = self.state.lock().unwrap();
            if *state == State::Closed || *state == State::Draining {
                return;
            }
        }
        self.set_draining();
        self.clear_idle_timer();
        let _ = tokio::time::timeout(grace, self.semaphore.drained()).await;
        match self.pool.upgrade() {
            Some(pool) => pool.remove_session(self, true),
            None => self.force_close(),
        }
    }

    /// Immediate teardown: aborts the driver, the heartbeat and the idle
    /// timer. In-flight streams on this session fail; nothing else does.
    pub(crate) fn force_close(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == State::Closed {
                return;
            }
            *state = State::Closed;
        }
        self.clear_idle_timer();
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        debug!(sid = %self.id, age_ms = self.age().as_millis() as u64, "session closed");
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("available", &self.available())
            .finish_non_exhaustive()
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        drop(self.permit.take());
        self.session.maybe_arm_idle_close();
    }
}

/// Ties an issued stream to its lease. Dropping it releases the permit.
pub(crate) struct StreamGuard {
    permit: Option<Permit>,
    session: Arc<Session>,
}

/// An opened stream: response future, send side and the capacity lease.
///
/// Dropping it cancels the stream at the h2 layer and frees the lease, so a
/// caller abandoning the future is enough to abort the exchange.
pub struct RequestStream {
    response: ResponseFuture,
    send: SendStream<Bytes>,
    canceled: bool,
    _guard: StreamGuard,
}

impl RequestStream {
    /// Waits for the response headers.
    pub async fn response(&mut self) -> Result<http::Response<RecvStream>, Error> {
        let response = (&mut self.response).await?;
        Ok(response)
    }

    /// Streams another body chunk; `end_of_stream` closes the send side.
    pub fn send_data(&mut self, data: Bytes, end_of_stream: bool) -> Result<(), Error> {
        self.send.send_data(data, end_of_stream)?;
        Ok(())
    }

    /// Resets the stream with CANCEL. Idempotent; siblings on the same
    /// session are unaffected.
    pub fn cancel(&mut self) {
        if !self.canceled {
            self.canceled = true;
            self.send.send_reset(Reason::CANCEL);
        }
    }
}

/// Drives the h2 connection and mirrors the remote concurrency advertisement
/// into the session's limiter as soon as it is known.
pub(crate) struct Driver<IO: AsyncRead + AsyncWrite + Unpin> {
    conn: Connection<IO, Bytes>,
    semaphore: Arc<Semaphore>,
    advertised: Option<usize>,
}

impl<IO: AsyncRead + AsyncWrite + Unpin> Driver<IO> {
    pub(crate) fn new(conn: Connection<IO, Bytes>, semaphore: Arc<Semaphore>) -> Self {
        Driver {
            conn,
            semaphore,
            advertised: None,
        }
    }
}

impl<IO: AsyncRead + AsyncWrite + Unpin> Future for Driver<IO> {
    type Output = Result<(), h2::Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // usize::MAX means the peer has not advertised a limit yet; keep the
        // default assumption until it does
        let max = self.conn.max_concurrent_send_streams();
        if max != usize::MAX && self.advertised != Some(max) {
            self.advertised = Some(max);
            self.semaphore.set_capacity(max);
            info!(max_concurrent_streams = max, "remote concurrency advertisement applied");
        }
        Pin::new(&mut self.conn).poll(cx)
    }
}

/// Periodic liveness probe. A pong missing within the allowance cancels the
/// session and invalidates its recycled TLS state.
pub(crate) fn spawn_heartbeat(
    session: &Arc<Session>,
    pool: &Arc<SessionPool>,
    mut ping_pong: PingPong,
    interval: Duration,
    max_outstanding_pings: u32,
) -> JoinHandle<()> {
    let session = Arc::downgrade(session);
    let pool = Arc::downgrade(pool);
    let allowance = interval * max_outstanding_pings.max(1);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // the first tick fires immediately
        loop {
            ticker.tick().await;
            let started = Instant::now();
            let ponged = tokio::time::timeout(allowance, ping_pong.ping(Ping::opaque())).await;
            match ponged {
                Ok(Ok(_pong)) => {
                    trace!(rtt_ms = started.elapsed().as_millis() as u64, "session ping");
                }
                Ok(Err(err)) => {
                    warn!("session ping failed: {}", err);
                    break;
                }
                Err(_) => {
                    warn!(allowance_ms = allowance.as_millis() as u64, "session pong timed out");
                    break;
                }
            }
        }
        if let (Some(session), Some(pool)) = (session.upgrade(), pool.upgrade()) {
            pool.cancel_session(&session);
        }
    })
}
