//! Request/response protocol between units.
//!
//! Units share no state. A caller sends a [`Request`] tagged with a
//! [`RequestId`] over the unit's inbound channel and gets back a
//! [`PendingReply`] immediately; the unit answers on a separate channel and a
//! demultiplexer task routes each answer to its waiting caller by id.
//!
//! Ordering holds within one channel only. Answers that arrive after their
//! caller timed out are dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::{Error, Result};

/// Correlation identifier, unique per client.
pub type RequestId = u64;

/// A request to a unit.
#[derive(Debug)]
pub struct Request<A> {
    /// Correlation id echoed in the response.
    pub id: RequestId,
    /// What to do.
    pub action: A,
}

/// A unit's answer to one request.
#[derive(Debug)]
pub struct Response<T> {
    /// Id of the request being answered.
    pub id: RequestId,
    /// Outcome.
    pub result: Result<T>,
}

/// Inbound message that can be matched to a pending request.
pub trait Correlated: Send + 'static {
    /// Reply payload.
    type Output: Send + 'static;

    /// Split into the request id and the outcome.
    fn into_parts(self) -> (RequestId, Result<Self::Output>);
}

impl<T: Send + 'static> Correlated for Response<T> {
    type Output = T;

    fn into_parts(self) -> (RequestId, Result<T>) {
        (self.id, self.result)
    }
}

type PendingMap<T> = Arc<Mutex<HashMap<RequestId, oneshot::Sender<Result<T>>>>>;

fn lock<T>(pending: &PendingMap<T>) -> MutexGuard<'_, HashMap<RequestId, oneshot::Sender<Result<T>>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Caller side of a unit channel.
pub struct UnitClient<Out, In: Correlated> {
    unit: &'static str,
    outbound: mpsc::UnboundedSender<Out>,
    pending: PendingMap<In::Output>,
    next_id: Arc<AtomicU64>,
    timeout: Duration,
    demux: Arc<JoinHandle<()>>,
}

impl<Out, In: Correlated> Clone for UnitClient<Out, In> {
    fn clone(&self) -> Self {
        Self {
            unit: self.unit,
            outbound: self.outbound.clone(),
            pending: Arc::clone(&self.pending),
            next_id: Arc::clone(&self.next_id),
            timeout: self.timeout,
            demux: Arc::clone(&self.demux),
        }
    }
}

impl<Out, In: Correlated> std::fmt::Debug for UnitClient<Out, In> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitClient")
            .field("unit", &self.unit)
            .field("pending", &lock(&self.pending).len())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl<Out: Send + 'static, In: Correlated> UnitClient<Out, In> {
    /// Connect to a unit and start routing its replies.
    #[must_use]
    pub fn new(
        unit: &'static str,
        outbound: mpsc::UnboundedSender<Out>,
        inbound: mpsc::UnboundedReceiver<In>,
        timeout: Duration,
    ) -> Self {
        let pending: PendingMap<In::Output> = Arc::default();
        let demux = tokio::spawn(demultiplex(unit, inbound, Arc::clone(&pending)));
        Self {
            unit,
            outbound,
            pending,
            next_id: Arc::new(AtomicU64::new(1)),
            timeout,
            demux: Arc::new(demux),
        }
    }

    /// Name of the unit this client talks to.
    #[must_use]
    pub const fn unit(&self) -> &'static str {
        self.unit
    }

    /// Send a message built around a fresh request id.
    ///
    /// Never blocks. Failures surface when the reply is awaited.
    pub fn dispatch_with(&self, build: impl FnOnce(RequestId) -> Out) -> PendingReply<In::Output> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);

        let rx = if self.outbound.send(build(id)).is_ok() {
            Some(rx)
        } else {
            lock(&self.pending).remove(&id);
            None
        };

        PendingReply {
            id,
            unit: self.unit,
            timeout: self.timeout,
            rx,
            pending: Arc::clone(&self.pending),
        }
    }

    /// Returns true while the unit accepts messages.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.outbound.is_closed()
    }
}

async fn demultiplex<In: Correlated>(
    unit: &'static str,
    mut inbound: mpsc::UnboundedReceiver<In>,
    pending: PendingMap<In::Output>,
) {
    while let Some(message) = inbound.recv().await {
        let (id, result) = message.into_parts();
        let waiter = lock(&pending).remove(&id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => debug!("Dropping late reply {id} from {unit}"),
        }
    }
    // Dropping the senders wakes every waiter with UnitUnavailable.
    lock(&pending).clear();
}

/// Reply to a dispatched request.
#[must_use = "a reply does nothing unless awaited"]
pub struct PendingReply<T> {
    id: RequestId,
    unit: &'static str,
    timeout: Duration,
    rx: Option<oneshot::Receiver<Result<T>>>,
    pending: PendingMap<T>,
}

impl<T> std::fmt::Debug for PendingReply<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingReply")
            .field("id", &self.id)
            .field("unit", &self.unit)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl<T> PendingReply<T> {
    /// Request id this reply belongs to.
    #[must_use]
    pub const fn id(&self) -> RequestId {
        self.id
    }

    /// Replace the timeout applied by [`wait`](Self::wait).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Wait for the unit's answer.
    ///
    /// # Errors
    ///
    /// Returns the unit's error, [`Error::Timeout`] if no answer arrived in
    /// time, or [`Error::UnitUnavailable`] if the unit is gone.
    pub async fn wait(self) -> Result<T> {
        let Some(rx) = self.rx else {
            return Err(Error::UnitUnavailable(self.unit));
        };
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::UnitUnavailable(self.unit)),
            Err(_) => {
                lock(&self.pending).remove(&self.id);
                Err(Error::Timeout {
                    unit: self.unit,
                    after: self.timeout,
                })
            }
        }
    }
}
