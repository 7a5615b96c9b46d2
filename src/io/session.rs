// src/io/session.rs
//
// Serial line session: a TransportHandle plus a LineFramer behind an explicit
// state machine.
//
//   Closed -> Opening -> Open -> Closing -> Closed
//   (any) -> Faulted   on an unrecoverable transport error
//
// Lifecycle and write calls are serialized through the transport lock. While
// Open, a drain task moves incoming chunks into the framer, which fans complete
// messages out to every subscriber and pending one-shot read.

use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::feed::{FeedEvent, MessageFeed, Subscription};
use super::transport::TransportHandle;
use super::types::{ConnectionConfig, SessionState};
use super::{IncomingStream, SessionError, Transport, TransportError};
use crate::framing::LineFramer;

// ============================================================================
// Session
// ============================================================================

pub struct Session {
    identifier: String,
    config: ConnectionConfig,
    transport: Arc<Mutex<TransportHandle>>,
    state: Arc<watch::Sender<SessionState>>,
    feed: Arc<MessageFeed<String>>,
    drain: StdMutex<Option<JoinHandle<()>>>,
    /// Retire on disconnect instead of allowing a reconnect
    single_use: bool,
    /// Set under the transport lock once a single-use session has been disconnected
    retired: AtomicBool,
}

impl Session {
    /// Create a closed session. Nothing is opened until `connect`.
    pub fn new(config: ConnectionConfig, transport: Box<dyn Transport>) -> Self {
        let handle = TransportHandle::new(transport, &config.write_termination);
        let (state_tx, _) = watch::channel(SessionState::Closed);

        Self {
            identifier: config.path.clone(),
            config,
            transport: Arc::new(Mutex::new(handle)),
            state: Arc::new(state_tx),
            feed: Arc::new(MessageFeed::new()),
            drain: StdMutex::new(None),
            single_use: false,
            retired: AtomicBool::new(false),
        }
    }

    /// Make the session single-use: after its first disconnect it is retired
    /// and `connect` fails with `Retired`. Registries hand out such sessions
    /// so a stale handle can never reopen a device that has been re-registered.
    pub fn single_use(mut self) -> Self {
        self.single_use = true;
        self
    }

    /// A single-use session that has been disconnected for good
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Create a session and connect it right away if `open_on_create` is set
    pub async fn establish(
        config: ConnectionConfig,
        transport: Box<dyn Transport>,
    ) -> Result<Self, SessionError> {
        let session = Self::new(config, transport);
        if session.config.open_on_create {
            session.connect().await?;
        }
        Ok(session)
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Observe state transitions
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn is_open(&self) -> bool {
        *self.state.borrow() == SessionState::Open
    }

    /// Registered consumers: durable subscribers plus pending one-shot reads
    pub fn subscriber_count(&self) -> usize {
        self.feed.subscriber_count()
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Open the transport and start draining it. No-op if already open.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let mut transport = self.transport.lock().await;
        if self.is_retired() {
            return Err(SessionError::Retired);
        }
        match self.state() {
            SessionState::Open => return Ok(()),
            SessionState::Faulted(reason) => return Err(SessionError::TransportFaulted(reason)),
            _ => {}
        }

        self.set_state(SessionState::Opening);
        if let Err(e) = transport.open().await {
            self.set_state(SessionState::Closed);
            return Err(e.into());
        }

        let Some(incoming) = transport.take_incoming() else {
            let _ = transport.close().await;
            self.set_state(SessionState::Closed);
            return Err(TransportError::OpenFailed(
                "transport provided no incoming stream".to_string(),
            )
            .into());
        };

        // A fresh framer per connection: fragments never leak across reconnects
        let framer = LineFramer::new(self.config.effective_read_termination(), self.feed.clone())
            .with_max_length(self.config.max_line_length);

        self.set_state(SessionState::Open);
        let task = tokio::spawn(drain_loop(
            self.identifier.clone(),
            incoming,
            framer,
            self.state.clone(),
            self.feed.clone(),
            self.transport.clone(),
        ));
        *self.drain_slot() = Some(task);

        info!(
            "[session:{}] connected ({})",
            self.identifier,
            self.config.line_summary()
        );
        Ok(())
    }

    /// Stop draining and release the transport. No-op if already closed.
    ///
    /// The session always ends up Closed. If the transport could not be
    /// released cleanly the error is `ReleaseUncertain`.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let mut transport = self.transport.lock().await;
        match self.state() {
            SessionState::Closed => return Ok(()),
            SessionState::Faulted(reason) => {
                self.stop_drain().await;
                if let Err(e) = transport.close().await {
                    warn!("[session:{}] release after fault failed: {}", self.identifier, e);
                }
                return Err(SessionError::TransportFaulted(reason));
            }
            _ => {}
        }

        self.set_state(SessionState::Closing);
        self.stop_drain().await;
        // Resolve pending one-shot reads; durable subscribers stay registered
        self.feed.close();

        let result = transport.close().await;
        if self.single_use {
            self.retired.store(true, Ordering::Release);
        }
        self.set_state(SessionState::Closed);

        match result {
            Ok(()) => {
                info!("[session:{}] disconnected", self.identifier);
                Ok(())
            }
            Err(e) => {
                warn!(
                    "[session:{}] closed but device release is uncertain: {}",
                    self.identifier, e
                );
                Err(SessionError::ReleaseUncertain(e.to_string()))
            }
        }
    }

    // ------------------------------------------------------------------------
    // Writing
    // ------------------------------------------------------------------------

    /// Transmit `message` followed by the configured write termination
    pub async fn write(&self, message: &str) -> Result<(), SessionError> {
        let mut transport = self.transport.lock().await;
        self.ensure_open()?;

        transport
            .write(message.as_bytes())
            .await
            .map_err(|e| match e {
                TransportError::NotOpen => SessionError::NotOpen,
                other => SessionError::Transport(other),
            })
    }

    /// Drain the OS write buffer. No-op while closed.
    pub async fn flush(&self) -> Result<(), SessionError> {
        let mut transport = self.transport.lock().await;
        if let SessionState::Faulted(reason) = self.state() {
            return Err(SessionError::TransportFaulted(reason));
        }
        transport.flush().await.map_err(SessionError::from)
    }

    // ------------------------------------------------------------------------
    // Reading
    // ------------------------------------------------------------------------

    /// Wait for the next framed message.
    ///
    /// `None` or a zero timeout waits indefinitely. Other consumers still
    /// receive the same message.
    pub async fn read_once(&self, timeout: Option<Duration>) -> Result<String, SessionError> {
        self.pending_read(timeout)?.wait().await
    }

    /// Register a one-shot read without waiting on it yet
    pub fn pending_read(&self, timeout: Option<Duration>) -> Result<PendingRead, SessionError> {
        // Register before checking state so a concurrent close or fault
        // cannot fall between the check and the registration.
        let subscription = self.feed.subscribe();
        self.ensure_open()?;
        Ok(PendingRead::new(subscription, timeout))
    }

    /// Durable stream of every future message. Survives disconnect and
    /// reconnect; ends after a fault. Dropping it unsubscribes.
    pub fn subscribe(&self) -> MessageStream {
        MessageStream {
            inner: self.feed.subscribe(),
        }
    }

    /// Invoke `handler` for every future message on a background task
    pub fn subscribe_with<F>(&self, mut handler: F) -> SubscriptionHandle
    where
        F: FnMut(Result<String, SessionError>) + Send + 'static,
    {
        let mut stream = self.subscribe();
        let task = tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                handler(item);
            }
        });
        SubscriptionHandle { task }
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn ensure_open(&self) -> Result<(), SessionError> {
        match self.state() {
            SessionState::Open => Ok(()),
            SessionState::Faulted(reason) => Err(SessionError::TransportFaulted(reason)),
            _ => Err(SessionError::NotOpen),
        }
    }

    fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next.clone());
        if previous != next {
            debug!("[session:{}] {:?} -> {:?}", self.identifier, previous, next);
        }
    }

    fn drain_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.drain.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn stop_drain(&self) {
        let task = self.drain_slot().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(task) = self.drain_slot().take() {
            task.abort();
        }
    }
}

/// Move chunks from the transport into the framer until the stream fails or ends.
async fn drain_loop(
    identifier: String,
    mut incoming: IncomingStream,
    mut framer: LineFramer,
    state: Arc<watch::Sender<SessionState>>,
    feed: Arc<MessageFeed<String>>,
    transport: Arc<Mutex<TransportHandle>>,
) {
    let reason = loop {
        match incoming.recv().await {
            Some(Ok(chunk)) => {
                // Waits while a subscriber's queue is full
                let emitted = framer.feed(&chunk).await;
                debug!(
                    "[session:{}] read {} bytes, {} messages",
                    identifier,
                    chunk.len(),
                    emitted
                );
            }
            Some(Err(e)) => break e.to_string(),
            None => break "device disconnected".to_string(),
        }
    };

    // Only an Open session faults; a Closing one is being torn down on purpose
    let faulted = state.send_if_modified(|current| {
        if *current == SessionState::Open {
            *current = SessionState::Faulted(reason.clone());
            true
        } else {
            false
        }
    });
    if !faulted {
        return;
    }

    error!("[session:{}] transport faulted: {}", identifier, reason);
    feed.fault(&reason);
    drop(incoming);

    if let Err(e) = transport.lock().await.close().await {
        warn!("[session:{}] release after fault failed: {}", identifier, e);
    }
}

// ============================================================================
// One-Shot Reads
// ============================================================================

/// A single outstanding read: a registration on the message feed plus an
/// optional deadline. Resolves exactly once; the registration is dropped on
/// every path (message, timeout, close, fault, or the caller giving up).
pub struct PendingRead {
    subscription: Subscription<String>,
    deadline: Option<Instant>,
}

impl PendingRead {
    fn new(subscription: Subscription<String>, timeout: Option<Duration>) -> Self {
        let deadline = timeout
            .filter(|timeout| !timeout.is_zero())
            .map(|timeout| Instant::now() + timeout);
        Self {
            subscription,
            deadline,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Race the next message against the deadline
    pub async fn wait(mut self) -> Result<String, SessionError> {
        let next = next_message(&mut self.subscription);
        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, next)
                .await
                .unwrap_or(Err(SessionError::ReadTimeout)),
            None => next.await,
        }
    }
}

async fn next_message(subscription: &mut Subscription<String>) -> Result<String, SessionError> {
    match subscription.recv().await {
        Some(FeedEvent::Item(message)) => Ok(message),
        Some(FeedEvent::Faulted(reason)) => Err(SessionError::TransportFaulted(reason)),
        // Closed, or the session itself went away
        Some(FeedEvent::Closed) | None => Err(SessionError::Closed),
    }
}

// ============================================================================
// Durable Subscriptions
// ============================================================================

/// Stream of framed messages for one session.
/// Yields `Err(TransportFaulted)` once if the session faults, then ends.
pub struct MessageStream {
    inner: Subscription<String>,
}

impl MessageStream {
    pub async fn recv(&mut self) -> Option<Result<String, SessionError>> {
        self.next().await
    }
}

impl Stream for MessageStream {
    type Item = Result<String, SessionError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match this.inner.poll_recv(cx) {
                // Disconnects don't end a durable subscription
                Poll::Ready(Some(FeedEvent::Closed)) => continue,
                Poll::Ready(Some(FeedEvent::Item(message))) => {
                    return Poll::Ready(Some(Ok(message)))
                }
                Poll::Ready(Some(FeedEvent::Faulted(reason))) => {
                    return Poll::Ready(Some(Err(SessionError::TransportFaulted(reason))))
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Unsubscribe capability for a handler registered with `subscribe_with`.
/// Dropping the handle leaves the handler running.
pub struct SubscriptionHandle {
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn unsubscribe(self) {
        self.task.abort();
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}
