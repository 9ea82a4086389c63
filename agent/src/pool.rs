use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use h2::client;
use http::Request;
use rand::Rng;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::agent::{AgentInner, SessionOptions};
use crate::connect::Connector;
use crate::error::Error;
use crate::semaphore::{Permit, Semaphore};
use crate::session::{spawn_heartbeat, Driver, RequestStream, Session};
use crate::session_id::SessionId;
use crate::MIN_SESSION_RESIDENCY;

type Waiter = oneshot::Sender<Result<(Arc<Session>, Permit), Error>>;

enum Step {
    Grant(Waiter, Arc<Session>, Permit),
    ScaleUp,
    Retry,
    Done,
}

/// All sessions sharing one identity, plus the FIFO queue of pending
/// acquisitions.
///
/// Selection packs load onto the fewest sessions: among ready sessions with
/// free capacity the most loaded one wins, so lightly used sessions drain and
/// close sooner. At most one session is being created at any time; a failed
/// creation fails exactly one waiter and backs off briefly before the next
/// attempt.
pub struct SessionPool {
    id: SessionId,
    options: SessionOptions,
    connector: Arc<dyn Connector>,
    agent: Weak<AgentInner>,
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    sessions: Vec<Arc<Session>>,
    queue: VecDeque<Waiter>,
    scaling_up: bool,
    destroyed: bool,
}

impl SessionPool {
    pub(crate) fn new(
        id: SessionId,
        options: SessionOptions,
        connector: Arc<dyn Connector>,
        agent: Weak<AgentInner>,
    ) -> Arc<Self> {
        Arc::new(SessionPool {
            id,
            options,
            connector,
            agent,
            inner: Mutex::new(PoolInner {
                sessions: Vec::new(),
                queue: VecDeque::new(),
                scaling_up: false,
                destroyed: false,
            }),
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Number of live sessions in the group.
    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().sessions.len()
    }

    /// Total free capacity across all sessions of the group.
    pub fn available(&self) -> isize {
        let inner = self.inner.lock().unwrap();
        inner.sessions.iter().map(|s| s.available()).sum()
    }

    pub(crate) fn sessions(&self) -> Vec<Arc<Session>> {
        self.inner.lock().unwrap().sessions.clone()
    }

    /// Waits for a session lease: a ready session plus one unit of its
    /// capacity. Queued FIFO; bounded by the connect timeout.
    pub async fn acquire(self: &Arc<Self>) -> Result<(Arc<Session>, Permit), Error> {
        let connect_timeout = self.options.connect_timeout();
        let rx = {
            let mut inner = self.inner.lock().unwrap();
            if inner.destroyed {
                return Err(Error::SessionClosed);
            }
            let (tx, rx) = oneshot::channel();
            inner.queue.push_back(tx);
            rx
        };
        self.dispatch();
        match tokio::time::timeout(connect_timeout, rx).await {
            Ok(Ok(result)) => result,
            // the pool was destroyed while the caller was queued
            Ok(Err(_)) => Err(Error::SessionClosed),
            // dropping the receiver leaves a dead waiter behind; dispatch
            // skips it when its turn comes
            Err(_) => Err(Error::AcquireTimeout(connect_timeout)),
        }
    }

    /// Acquires a lease and issues one stream with it.
    pub async fn request(
        self: &Arc<Self>,
        request: Request<()>,
        body: Option<Bytes>,
    ) -> Result<RequestStream, Error> {
        let (session, permit) = self.acquire().await?;
        session.request(permit, request, body).await
    }

    fn dispatch(self: &Arc<Self>) {
        loop {
            let step = {
                let mut inner = self.inner.lock().unwrap();
                if inner.queue.is_empty() || inner.destroyed {
                    Step::Done
                } else {
                    // most loaded ready session that still has room
                    let session = inner
                        .sessions
                        .iter()
                        .filter(|s| s.is_ready() && s.available() > 0)
                        .min_by_key(|s| s.available())
                        .cloned();
                    match session {
                        Some(session) => match session.semaphore().try_acquire() {
                            Some(permit) => {
                                let waiter = inner.queue.pop_front().expect("queue is not empty");
                                Step::Grant(waiter, session, permit)
                            }
                            // lost the slot to a concurrent acquisition
                            None => Step::Retry,
                        },
                        None => {
                            if inner.scaling_up {
                                Step::Done
                            } else {
                                inner.scaling_up = true;
                                Step::ScaleUp
                            }
                        }
                    }
                }
            };
            match step {
                Step::Grant(waiter, session, permit) => {
                    if waiter.send(Ok((session, permit))).is_err() {
                        // the caller gave up; the permit drop frees the slot
                        trace!(sid = %self.id, "dropping lease for a gone waiter");
                    }
                }
                Step::ScaleUp => {
                    self.spawn_scale_up();
                    return;
                }
                Step::Retry => continue,
                Step::Done => return,
            }
        }
    }

    fn spawn_scale_up(self: &Arc<Self>) {
        let pool = self.clone();
        tokio::spawn(async move {
            if let Err(err) = pool.create_session().await {
                warn!(sid = %pool.id, "failed to create session: {}", err);
                let waiter = pool.inner.lock().unwrap().queue.pop_front();
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Err(err));
                }
                // jittered backoff before the next attempt
                let millis = rand::thread_rng().gen_range(75..=125);
                tokio::time::sleep(Duration::from_millis(millis)).await;
            }
            pool.inner.lock().unwrap().scaling_up = false;
            pool.dispatch();
        });
    }

    /// Opens the transport, performs the h2 handshake and installs the new
    /// session, all under the connect timeout.
    async fn create_session(self: &Arc<Self>) -> Result<(), Error> {
        let connect_timeout = self.options.connect_timeout();
        let started = Instant::now();
        let handshake = tokio::time::timeout(connect_timeout, async {
            let io = self
                .connector
                .connect(&self.id, &self.options)
                .await
                .map_err(Error::Connect)?;
            let (send_request, conn) = client::Builder::new()
                .enable_push(false)
                .handshake::<_, Bytes>(io)
                .await?;
            Ok::<_, Error>((send_request, conn))
        })
        .await;
        let (send_request, mut conn) = match handshake {
            Ok(Ok(parts)) => parts,
            Ok(Err(err)) => {
                // the cached TLS state may be stale
                self.connector.invalidate(&self.id);
                warn!(sid = %self.id, "session connect error: {}", err);
                return Err(err);
            }
            Err(_) => {
                warn!(sid = %self.id, "session connect timed out");
                return Err(Error::ConnectTimeout(connect_timeout));
            }
        };
        debug!(
            sid = %self.id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "session connected"
        );

        let ping_pong = conn.ping_pong();
        let semaphore = Arc::new(Semaphore::new(self.options.peer_max_concurrent_streams()));
        let session = Session::new(
            self.id.clone(),
            semaphore.clone(),
            send_request,
            self.options.keep_alive_timeout(),
            Arc::downgrade(self),
        );

        let driver = Driver::new(conn, semaphore);
        let driver_task = {
            let pool = Arc::downgrade(self);
            let session = Arc::downgrade(&session);
            tokio::spawn(async move {
                let result = driver.await;
                let (session, pool) = match (session.upgrade(), pool.upgrade()) {
                    (Some(session), Some(pool)) => (session, pool),
                    _ => return,
                };
                match result {
                    Ok(()) => {
                        info!(sid = %session.id(), age_ms = session.age().as_millis() as u64, "session ended")
                    }
                    Err(err) => {
                        warn!(sid = %session.id(), "session error: {}", err);
                        pool.connector.invalidate(&pool.id);
                    }
                }
                session.force_close();
                pool.remove_session(&session, false);
            })
        };
        session.add_task(driver_task);

        if let Some(interval) = self.options.ping_interval() {
            if let Some(ping_pong) = ping_pong {
                session.add_task(spawn_heartbeat(
                    &session,
                    self,
                    ping_pong,
                    interval,
                    self.options.max_outstanding_pings(),
                ));
            }
        }

        session.set_ready();
        session.arm_idle_close();
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.destroyed {
                session.force_close();
                return Err(Error::SessionClosed);
            }
            inner.sessions.push(session.clone());
            debug!(sid = %self.id, size = inner.sessions.len(), "session added");
        }
        Ok(())
    }

    /// Removes a session from the group, debounced by the minimum residency:
    /// a session younger than the window stays until the window elapses,
    /// unless removal is forced.
    pub(crate) fn remove_session(self: &Arc<Self>, session: &Arc<Session>, force: bool) {
        let age = session.age();
        if !force && age < MIN_SESSION_RESIDENCY {
            if !session.schedule_removal() {
                return;
            }
            let pool = self.clone();
            let session = session.clone();
            tokio::spawn(async move {
                tokio::time::sleep(MIN_SESSION_RESIDENCY - age).await;
                pool.delete_session(&session);
            });
            return;
        }
        self.delete_session(session);
    }

    /// Heartbeat failure: invalidate recycled TLS state and tear the session
    /// down immediately. In-flight streams on it fail; the group survives.
    pub(crate) fn cancel_session(self: &Arc<Self>, session: &Arc<Session>) {
        info!(sid = %self.id, "session canceled");
        self.connector.invalidate(&self.id);
        session.force_close();
        self.remove_session(session, false);
    }

    fn delete_session(self: &Arc<Self>, session: &Arc<Session>) {
        session.force_close();
        let (deleted, empty) = {
            let mut inner = self.inner.lock().unwrap();
            let before = inner.sessions.len();
            inner.sessions.retain(|s| !Arc::ptr_eq(s, session));
            let deleted = inner.sessions.len() < before;
            let empty = inner.sessions.is_empty()
                && inner.queue.is_empty()
                && !inner.scaling_up
                && !inner.destroyed;
            (deleted.then(|| inner.sessions.len()), empty)
        };
        if let Some(size) = deleted {
            debug!(sid = %self.id, size, "session deleted");
        }
        // a group with zero sessions is pruned from the agent's table
        if empty {
            if let Some(agent) = self.agent.upgrade() {
                agent.prune(&self.id);
            }
        }
    }

    /// Graceful teardown: rejects queued waiters, drains every session within
    /// the grace period, then closes them.
    pub(crate) async fn shutdown(self: &Arc<Self>) {
        let grace = self.options.grace_period();
        let (sessions, waiters) = self.detach();
        for waiter in waiters {
            let _ = waiter.send(Err(Error::SessionClosed));
        }
        let draining = sessions
            .iter()
            .map(|session| session.shutdown(grace))
            .collect::<Vec<_>>();
        futures::future::join_all(draining).await;
        self.connector.invalidate(&self.id);
    }

    /// Forced synchronous teardown of every session and queued waiter.
    pub(crate) fn destroy(self: &Arc<Self>) {
        let (sessions, waiters) = self.detach();
        for waiter in waiters {
            let _ = waiter.send(Err(Error::SessionClosed));
        }
        for session in &sessions {
            session.force_close();
        }
        self.connector.invalidate(&self.id);
    }

    fn detach(&self) -> (Vec<Arc<Session>>, Vec<Waiter>) {
        let mut inner = self.inner.lock().unwrap();
        inner.destroyed = true;
        (
            std::mem::take(&mut inner.sessions),
            inner.queue.drain(..).collect(),
        )
    }
}
