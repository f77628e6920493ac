//! Shutdown and failure plumbing shared by clients and servers

use crate::connection::Connection;
use crate::error::{Result, RpcError};

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

/// State of the link between an instance and its broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Connected, consumer loop not started yet
    Idle,
    /// Consuming deliveries
    Running,
    /// Inbound stream ended; reconnecting
    Recovering,
    /// Reconnect budget exhausted (terminal)
    Failed,
    /// Shut down (terminal)
    Stopped,
}

/// Everything a client or server shares with its supervisor task
#[derive(Debug)]
pub(crate) struct Lifecycle {
    pub(crate) stop: StopSignal,
    pub(crate) notifier: Notifier,
    pub(crate) in_flight: InFlight,
    state: watch::Sender<LinkState>,
    shut_down: AtomicBool,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        let (state, _rx) = watch::channel(LinkState::Idle);
        Self {
            stop: StopSignal::new(),
            notifier: Notifier::new(),
            in_flight: InFlight::new(),
            state,
            shut_down: AtomicBool::new(false),
        }
    }

    pub(crate) fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub(crate) fn set_state(&self, state: LinkState) {
        self.state.send_replace(state);
    }

    pub(crate) fn state_receiver(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    /// Shutdown has begun or the link failed for good
    pub(crate) fn is_closed(&self) -> bool {
        self.stop.is_stopped() || self.state() == LinkState::Failed
    }

    /// Stop the supervisor, drain in-flight work for at most `drain`, then
    /// release the connection. Only the first call does anything.
    pub(crate) async fn shutdown(
        &self,
        connection: &Connection,
        task: Option<JoinHandle<()>>,
        drain: Duration,
    ) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.stop.stop();

        let mut task = task;
        let drained = async {
            self.in_flight.drained().await;
            if let Some(task) = task.as_mut() {
                let _ = task.await;
            }
        };
        if timeout(drain, drained).await.is_err() {
            warn!(
                source = %connection.source(),
                in_flight = self.in_flight.count(),
                "Drain timed out, closing anyway"
            );
            // a reconnect still running must not install a session after close
            if let Some(task) = task.as_mut() {
                task.abort();
                let _ = task.await;
            }
        }

        self.state.send_if_modified(|state| {
            if *state == LinkState::Failed || *state == LinkState::Stopped {
                false
            } else {
                *state = LinkState::Stopped;
                true
            }
        });
        self.notifier.close();

        debug!(source = %connection.source(), "Shut down");
        connection.close().await.map_err(RpcError::Transport)
    }
}

/// One-way stop broadcast
#[derive(Debug)]
pub(crate) struct StopSignal {
    tx: watch::Sender<bool>,
}

impl StopSignal {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub(crate) fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub(crate) fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`stop`](Self::stop) has been called, including before this call
    pub(crate) fn stopped(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.tx.subscribe();
        async move {
            let _ = rx.wait_for(|stopped| *stopped).await;
        }
    }
}

/// Error notification channel.
///
/// Steady-state transport errors are reported without closing it; a terminal
/// failure or shutdown closes it exactly once.
#[derive(Debug)]
pub(crate) struct Notifier {
    tx: Mutex<Option<mpsc::UnboundedSender<RpcError>>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<RpcError>>>,
}

impl Notifier {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
        }
    }

    pub(crate) fn report(&self, error: RpcError) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(error);
        }
    }

    /// Report a terminal error and close the channel
    pub(crate) fn fail(&self, error: RpcError) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(error);
        }
    }

    pub(crate) fn close(&self) {
        self.tx.lock().take();
    }

    /// The receiving end; only the first caller gets it
    pub(crate) fn take(&self) -> Option<mpsc::UnboundedReceiver<RpcError>> {
        self.rx.lock().take()
    }
}

/// Counts operations that shutdown must wait for
#[derive(Debug, Clone, Default)]
pub(crate) struct InFlight {
    inner: Arc<InFlightInner>,
}

#[derive(Debug, Default)]
struct InFlightInner {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn enter(&self) -> InFlightGuard {
        self.inner.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            inner: self.inner.clone(),
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }

    /// Resolves once no operation is in flight
    pub(crate) async fn drained(&self) {
        loop {
            let idle = self.inner.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();

            if self.count() == 0 {
                return;
            }
            idle.await;
        }
    }
}

pub(crate) struct InFlightGuard {
    inner: Arc<InFlightInner>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.inner.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}
