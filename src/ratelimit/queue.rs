//! Leaky bucket, queue shape.
//!
//! [`LeakyQueue`] holds a FIFO of pending admissions and releases them at
//! `capacity / interval`. The head is resolved as soon as enough capacity
//! has accrued; otherwise the scheduler sleeps for exactly the deficit.
//!
//! ```text
//! Idle --enqueue--> Scheduled --queue empties--> Idle (drain signalled once)
//!                      |  ^
//!                      +--+ head not admissible yet: sleep for the deficit
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{FloodgateError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Scheduled,
}

struct Pending {
    cost: f64,
    enqueued_at: Instant,
    tx: oneshot::Sender<Result<()>>,
}

struct Inner {
    capacity: f64,
    interval_ms: f64,
    available: f64,
    last_refill: Instant,
    queue: VecDeque<Pending>,
    queued_cost: f64,
    phase: Phase,
    closed: bool,
}

impl Inner {
    fn refill(&mut self, now: Instant) {
        let elapsed_ms = now.saturating_duration_since(self.last_refill).as_nanos() as f64 / 1e6;
        self.available = (self.available + self.capacity * elapsed_ms / self.interval_ms).min(self.capacity);
        self.last_refill = now;
    }

    /// Remove items whose caller stopped waiting.
    fn purge_cancelled(&mut self) {
        let before = self.queue.len();
        self.queue.retain(|item| !item.tx.is_closed());
        if self.queue.len() != before {
            self.queued_cost = self.queue.iter().map(|item| item.cost).sum();
            trace!(dropped = before - self.queue.len(), "Dropped cancelled queue items");
        }
    }

    /// Reject tail items once the running total passes capacity.
    fn trim_overflow(&mut self) -> usize {
        let mut total = 0.0;
        let mut keep = 0;
        for item in &self.queue {
            if total + item.cost > self.capacity {
                break;
            }
            total += item.cost;
            keep += 1;
        }

        let overflow: Vec<Pending> = self.queue.drain(keep..).collect();
        for item in &overflow {
            self.queued_cost -= item.cost;
        }
        let trimmed = overflow.len();
        for item in overflow {
            let _ = item.tx.send(Err(FloodgateError::QueueOverflow {
                requested: item.cost,
                capacity: self.capacity,
            }));
        }
        trimmed
    }
}

struct Shared {
    inner: Mutex<Inner>,
    wake: Notify,
    drains: watch::Sender<u64>,
}

/// A FIFO throttle that releases queued work at a fixed rate.
#[derive(Clone)]
pub struct LeakyQueue {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for LeakyQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("LeakyQueue")
            .field("capacity", &inner.capacity)
            .field("interval_ms", &inner.interval_ms)
            .field("queued", &inner.queue.len())
            .field("phase", &inner.phase)
            .finish()
    }
}

impl LeakyQueue {
    /// Create a queue that releases `capacity` units per `interval`.
    pub fn new(capacity: f64, interval: Duration) -> Result<Self> {
        check_params(capacity, interval)?;
        let (drains, _) = watch::channel(0);
        Ok(Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    capacity,
                    interval_ms: interval.as_secs_f64() * 1000.0,
                    available: capacity,
                    last_refill: Instant::now(),
                    queue: VecDeque::new(),
                    queued_cost: 0.0,
                    phase: Phase::Idle,
                    closed: false,
                }),
                wake: Notify::new(),
                drains,
            }),
        })
    }

    /// Queue `cost` units.
    ///
    /// Fails immediately if the queue already holds too much to take the
    /// item. Otherwise returns a [`Permit`] that resolves when the item is
    /// released; dropping the permit withdraws the item.
    pub fn enqueue(&self, cost: f64) -> Result<Permit> {
        if !cost.is_finite() || cost < 0.0 {
            return Err(FloodgateError::Config(format!("invalid cost {}", cost)));
        }

        let (tx, rx) = oneshot::channel();
        let start = {
            let mut inner = self.shared.inner.lock();
            if inner.closed {
                return Err(FloodgateError::QueueClosed);
            }
            inner.purge_cancelled();
            if inner.queued_cost + cost > inner.capacity {
                debug!(
                    cost,
                    queued = inner.queued_cost,
                    capacity = inner.capacity,
                    "Rejecting queue item over capacity"
                );
                return Err(FloodgateError::QueueOverflow {
                    requested: cost,
                    capacity: inner.capacity,
                });
            }

            inner.queue.push_back(Pending {
                cost,
                enqueued_at: Instant::now(),
                tx,
            });
            inner.queued_cost += cost;

            let start = inner.phase == Phase::Idle;
            if start {
                inner.phase = Phase::Scheduled;
            }
            start
        };

        if start {
            let handle = match tokio::runtime::Handle::try_current() {
                Ok(handle) => handle,
                Err(_) => {
                    let mut inner = self.shared.inner.lock();
                    inner.queue.clear();
                    inner.queued_cost = 0.0;
                    inner.phase = Phase::Idle;
                    return Err(FloodgateError::Config(
                        "LeakyQueue requires a tokio runtime".to_string(),
                    ));
                }
            };
            handle.spawn(run(self.shared.clone()));
        } else {
            self.shared.wake.notify_one();
        }

        Ok(Permit { rx })
    }

    /// Queue `cost` units and wait until they are released.
    pub async fn throttle(&self, cost: f64) -> Result<()> {
        self.enqueue(cost)?.await
    }

    /// Change the rate. Items that no longer fit are rejected from the tail.
    pub fn reconfigure(&self, capacity: f64, interval: Duration) -> Result<usize> {
        check_params(capacity, interval)?;
        let trimmed = {
            let mut inner = self.shared.inner.lock();
            let now = Instant::now();
            inner.refill(now);
            inner.capacity = capacity;
            inner.interval_ms = interval.as_secs_f64() * 1000.0;
            inner.available = inner.available.min(capacity);
            inner.trim_overflow()
        };
        if trimmed > 0 {
            debug!(trimmed, capacity, "Trimmed queue tail after reconfigure");
        }
        self.shared.wake.notify_one();
        Ok(trimmed)
    }

    /// Reject everything pending and refuse new items.
    pub fn close(&self) {
        {
            let mut inner = self.shared.inner.lock();
            inner.closed = true;
            for item in inner.queue.drain(..) {
                let _ = item.tx.send(Err(FloodgateError::QueueClosed));
            }
            inner.queued_cost = 0.0;
        }
        self.shared.wake.notify_one();
    }

    /// Wait until the queue is empty and the scheduler is idle.
    pub async fn drained(&self) {
        let mut rx = self.shared.drains.subscribe();
        loop {
            if self.is_idle() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Number of drain-to-empty transitions so far.
    pub fn drain_count(&self) -> u64 {
        *self.shared.drains.borrow()
    }

    /// Total cost currently waiting.
    pub fn queued_cost(&self) -> f64 {
        self.shared.inner.lock().queued_cost
    }

    pub fn len(&self) -> usize {
        self.shared.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_idle(&self) -> bool {
        let inner = self.shared.inner.lock();
        inner.phase == Phase::Idle && inner.queue.is_empty()
    }
}

fn check_params(capacity: f64, interval: Duration) -> Result<()> {
    if !capacity.is_finite() || capacity <= 0.0 {
        return Err(FloodgateError::Config(format!("invalid capacity {}", capacity)));
    }
    if interval.is_zero() {
        return Err(FloodgateError::Config("interval must be positive".to_string()));
    }
    Ok(())
}

/// Scheduler loop: one task per Scheduled phase.
async fn run(shared: Arc<Shared>) {
    loop {
        let delay = {
            let mut inner = shared.inner.lock();
            inner.refill(Instant::now());
            inner.purge_cancelled();

            let head_cost = match inner.queue.front() {
                Some(head) => head.cost,
                None => {
                    inner.phase = Phase::Idle;
                    inner.queued_cost = 0.0;
                    drop(inner);
                    shared.drains.send_modify(|n| *n += 1);
                    trace!("Queue drained");
                    return;
                }
            };

            if inner.available >= head_cost {
                if let Some(head) = inner.queue.pop_front() {
                    inner.available -= head.cost;
                    inner.queued_cost -= head.cost;
                    trace!(
                        cost = head.cost,
                        waited_ms = head.enqueued_at.elapsed().as_millis() as u64,
                        "Releasing queue item"
                    );
                    let _ = head.tx.send(Ok(()));
                }
                None
            } else {
                let deficit = head_cost - inner.available;
                Some(Duration::from_secs_f64(
                    deficit * inner.interval_ms / inner.capacity / 1000.0,
                ))
            }
        };

        if let Some(delay) = delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shared.wake.notified() => {}
            }
        }
    }
}

/// Resolves when a queued item is released.
#[must_use = "dropping a permit withdraws the item from the queue"]
#[derive(Debug)]
pub struct Permit {
    rx: oneshot::Receiver<Result<()>>,
}

impl Future for Permit {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(FloodgateError::QueueClosed)))
    }
}
