use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::{oneshot, Notify};

/// Counting semaphore bounding the in-flight streams of one session.
///
/// Unlike `tokio::sync::Semaphore` the capacity can shrink at runtime (the
/// remote peer advertises its own concurrency limit after the handshake), and
/// queued acquirers are granted strictly in FIFO order. When the capacity
/// shrinks below the number of in-flight permits the excess drains naturally;
/// no permit is ever revoked.
#[derive(Debug)]
pub struct Semaphore {
    inner: Mutex<Inner>,
    idle: Notify,
}

#[derive(Debug)]
struct Inner {
    capacity: usize,
    in_flight: usize,
    waiters: VecDeque<oneshot::Sender<Permit>>,
}

impl Semaphore {
    pub fn new(capacity: usize) -> Self {
        Semaphore {
            inner: Mutex::new(Inner {
                capacity,
                in_flight: 0,
                waiters: VecDeque::new(),
            }),
            idle: Notify::new(),
        }
    }

    /// Waits for a permit. Grants immediately when there is free capacity and
    /// no earlier waiter is queued, otherwise suspends until dispatched.
    pub async fn acquire(self: &Arc<Self>) -> Permit {
        let rx = {
            let mut inner = self.inner.lock().unwrap();
            if inner.waiters.is_empty() && inner.in_flight < inner.capacity {
                inner.in_flight += 1;
                return Permit::new(self.clone());
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.push_back(tx);
            rx
        };
        // the sender is dropped only after dispatch granted the slot; the
        // permit travels through the channel so that a caller abandoning
        // this future releases the slot on drop
        rx.await.expect("semaphore waiters are always dispatched")
    }

    /// Grants a permit only if one is free right now, without ever jumping
    /// ahead of queued waiters.
    pub fn try_acquire(self: &Arc<Self>) -> Option<Permit> {
        let mut inner = self.inner.lock().unwrap();
        if inner.waiters.is_empty() && inner.in_flight < inner.capacity {
            inner.in_flight += 1;
            Some(Permit::new(self.clone()))
        } else {
            None
        }
    }

    /// Applies a new capacity (e.g. a remote concurrency advertisement) and
    /// immediately re-dispatches, so that shrinking and growing again cannot
    /// starve queued waiters.
    pub fn set_capacity(self: &Arc<Self>, capacity: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.capacity = capacity;
        self.dispatch(&mut inner);
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().capacity
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().unwrap().in_flight
    }

    /// `capacity - in_flight - waiters`. Negative values mean "not free" and
    /// occur transiently after a capacity shrink.
    pub fn available(&self) -> isize {
        let inner = self.inner.lock().unwrap();
        inner.capacity as isize - inner.in_flight as isize - inner.waiters.len() as isize
    }

    /// Fully drained: no in-flight permit and no queued waiter.
    pub fn is_idle(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.in_flight == 0 && inner.waiters.is_empty()
    }

    /// Resolves once the semaphore is fully drained.
    pub async fn drained(&self) {
        loop {
            let notified = self.idle.notified();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    fn release_one(self: &Arc<Self>) {
        let idle = {
            let mut inner = self.inner.lock().unwrap();
            inner.in_flight -= 1;
            self.dispatch(&mut inner);
            inner.in_flight == 0 && inner.waiters.is_empty()
        };
        if idle {
            self.idle.notify_waiters();
        }
    }

    fn dispatch(self: &Arc<Self>, inner: &mut Inner) {
        while inner.in_flight < inner.capacity {
            match inner.waiters.pop_front() {
                Some(tx) => {
                    inner.in_flight += 1;
                    if let Err(mut permit) = tx.send(Permit::new(self.clone())) {
                        // the waiter gave up; take the slot back here
                        // instead of letting the permit release it, which
                        // would re-enter the lock
                        permit.released = true;
                        inner.in_flight -= 1;
                    }
                }
                None => break,
            }
        }
    }
}

/// A granted unit of concurrency on one session, released when the associated
/// stream completes. Releasing is idempotent and also triggered by `Drop`.
#[derive(Debug)]
pub struct Permit {
    semaphore: Arc<Semaphore>,
    released: bool,
}

impl Permit {
    fn new(semaphore: Arc<Semaphore>) -> Self {
        Permit {
            semaphore,
            released: false,
        }
    }

    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.semaphore.release_one();
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.release();
    }
}
