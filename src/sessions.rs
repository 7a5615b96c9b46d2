// src/sessions.rs
//
// Session registry: maps a device identifier to at most one live session.
// Owned by whichever context composes the core (the CLI, a service, a test);
// there is no process-global map.

use futures::StreamExt;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::io::{
    ConnectionConfig, MessageFeed, MessageStream, RegistryError, Session, SessionError,
    SessionState, Subscription, SubscriptionHandle, TransportFactory,
};

/// A framed message tagged with the device it came from
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeviceMessage {
    pub identifier: String,
    pub data: String,
}

struct RegistryEntry {
    session: Arc<Session>,
    /// Copies the session's messages into the registry-wide feed
    forwarder: JoinHandle<()>,
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<String, RegistryEntry>,
    /// Identifiers with a connect or remove in flight
    reserved: HashSet<String>,
}

pub struct SessionRegistry {
    factory: Arc<dyn TransportFactory>,
    inner: Mutex<RegistryInner>,
    events: Arc<MessageFeed<DeviceMessage>>,
}

impl SessionRegistry {
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            factory,
            inner: Mutex::new(RegistryInner::default()),
            events: Arc::new(MessageFeed::new()),
        }
    }

    /// Registry backed by OS serial ports
    #[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
    pub fn serial() -> Self {
        Self::new(Arc::new(crate::io::serial::SerialTransportFactory))
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Connect a new session for `config.path` and register it.
    ///
    /// Fails with `AlreadyConnected` while a session that is not Faulted (or
    /// a connect or remove) exists for the identifier. A Faulted entry is
    /// released and replaced. Nothing is stored when the connect fails.
    ///
    /// Sessions handed out here are single-use: disconnecting one through
    /// its own handle unregisters it, and it can never reconnect.
    pub async fn get_or_create(
        &self,
        config: ConnectionConfig,
    ) -> Result<Arc<Session>, RegistryError> {
        let identifier = config.path.clone();
        let (stale, reservation) = {
            let mut inner = self.lock_pruned();
            if inner.reserved.contains(&identifier) {
                return Err(RegistryError::AlreadyConnected(identifier));
            }
            let stale = match inner.sessions.get(&identifier) {
                Some(entry) if matches!(entry.session.state(), SessionState::Faulted(_)) => {
                    Some(entry.session.clone())
                }
                // Open, or still closing
                Some(_) => return Err(RegistryError::AlreadyConnected(identifier)),
                None => None,
            };
            (stale, self.reserve(&mut inner, &identifier))
        };

        // A faulted session may still hold the device until its release completes
        if let Some(stale) = stale {
            let _ = stale.disconnect().await;
        }

        let transport = self.factory.create(&config);
        let session = Arc::new(Session::new(config, transport).single_use());
        // Subscribe before connecting so the first lines reach the registry feed
        let messages = session.subscribe();
        session.connect().await?;

        let forwarder = tokio::spawn(forward_messages(
            identifier.clone(),
            messages,
            self.events.clone(),
        ));

        let mut inner = self.lock_inner();
        let stale = inner.sessions.insert(
            identifier.clone(),
            RegistryEntry {
                session: session.clone(),
                forwarder,
            },
        );
        if let Some(stale) = stale {
            debug!(
                "[registry] replaced {:?} session for {}",
                stale.session.state(),
                identifier
            );
            stale.forwarder.abort();
        }
        drop(inner);
        drop(reservation);

        info!("[registry] registered {}", identifier);
        Ok(session)
    }

    /// Disconnect and unregister the session for `identifier`. No-op if absent.
    ///
    /// A Faulted session is released and removed without error. If the
    /// transport could not be released the entry is still removed and the
    /// error is `ReleaseUncertain`.
    pub async fn remove(&self, identifier: &str) -> Result<(), RegistryError> {
        let (session, _reservation) = {
            let mut inner = self.lock_pruned();
            let Some(entry) = inner.sessions.get(identifier) else {
                return Ok(());
            };
            let session = entry.session.clone();
            // A concurrent remove already holds the reservation; both just disconnect
            let reservation = if inner.reserved.contains(identifier) {
                None
            } else {
                Some(self.reserve(&mut inner, identifier))
            };
            (session, reservation)
        };

        let result = match session.disconnect().await {
            Ok(()) | Err(SessionError::TransportFaulted(_)) => Ok(()),
            Err(e) => Err(RegistryError::from(e)),
        };

        let mut inner = self.lock_inner();
        let same = inner
            .sessions
            .get(identifier)
            .is_some_and(|entry| Arc::ptr_eq(&entry.session, &session));
        if same {
            if let Some(entry) = inner.sessions.remove(identifier) {
                entry.forwarder.abort();
            }
            info!("[registry] removed {}", identifier);
        }
        result
    }

    /// Disconnect every session and clear the registry
    pub async fn shutdown(&self) {
        let entries: Vec<(String, RegistryEntry)> = self.lock_inner().sessions.drain().collect();
        for (identifier, entry) in entries {
            entry.forwarder.abort();
            match entry.session.disconnect().await {
                Ok(()) | Err(SessionError::TransportFaulted(_)) => {}
                Err(e) => warn!("[registry] shutdown of {} incomplete: {}", identifier, e),
            }
        }
        info!("[registry] shut down");
    }

    // ========================================================================
    // Routing
    // ========================================================================

    pub fn lookup(&self, identifier: &str) -> Result<Arc<Session>, RegistryError> {
        self.lock_pruned()
            .sessions
            .get(identifier)
            .map(|entry| entry.session.clone())
            .ok_or_else(|| RegistryError::NotFound(identifier.to_string()))
    }

    /// Write `message` to the session for `identifier`
    pub async fn dispatch(&self, identifier: &str, message: &str) -> Result<(), RegistryError> {
        let session = self.lookup(identifier)?;
        session.write(message).await?;
        Ok(())
    }

    /// Invoke `handler` for every future message from `identifier`
    pub fn subscribe<F>(
        &self,
        identifier: &str,
        handler: F,
    ) -> Result<SubscriptionHandle, RegistryError>
    where
        F: FnMut(Result<String, SessionError>) + Send + 'static,
    {
        Ok(self.lookup(identifier)?.subscribe_with(handler))
    }

    /// Messages from every registered session, tagged with their identifier
    pub fn subscribe_all(&self) -> Subscription<DeviceMessage> {
        self.events.subscribe()
    }

    /// Registered identifiers, sorted
    pub fn identifiers(&self) -> Vec<String> {
        let mut identifiers: Vec<String> = self.lock_pruned().sessions.keys().cloned().collect();
        identifiers.sort();
        identifiers
    }

    pub fn len(&self) -> usize {
        self.lock_pruned().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn lock_inner(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock, dropping entries whose sessions were disconnected through their own handle
    fn lock_pruned(&self) -> MutexGuard<'_, RegistryInner> {
        let mut inner = self.lock_inner();
        inner.sessions.retain(|identifier, entry| {
            if !entry.session.is_retired() {
                return true;
            }
            entry.forwarder.abort();
            info!("[registry] removed {} after disconnect", identifier);
            false
        });
        inner
    }

    fn reserve(&self, inner: &mut RegistryInner, identifier: &str) -> Reservation<'_> {
        inner.reserved.insert(identifier.to_string());
        Reservation {
            registry: self,
            identifier: identifier.to_string(),
        }
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        for entry in self.lock_inner().sessions.values() {
            entry.forwarder.abort();
        }
    }
}

/// Holds an identifier reserved until dropped, including when the owning
/// future is cancelled mid-connect.
struct Reservation<'a> {
    registry: &'a SessionRegistry,
    identifier: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.registry.lock_inner().reserved.remove(&self.identifier);
    }
}

async fn forward_messages(
    identifier: String,
    mut stream: MessageStream,
    events: Arc<MessageFeed<DeviceMessage>>,
) {
    while let Some(item) = stream.next().await {
        match item {
            Ok(data) => {
                events
                    .publish(DeviceMessage {
                        identifier: identifier.clone(),
                        data,
                    })
                    .await;
            }
            Err(e) => {
                debug!("[registry] forwarding for {} stopped: {}", identifier, e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::testing::MockFactory;
    use crate::io::{FeedEvent, TransportError};

    fn registry() -> (SessionRegistry, Arc<MockFactory>) {
        let factory = Arc::new(MockFactory::default());
        (SessionRegistry::new(factory.clone()), factory)
    }

    async fn wait_for_fault(session: &Session) {
        session
            .watch_state()
            .wait_for(|state| matches!(state, SessionState::Faulted(_)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_one_live_session_per_identifier() {
        let (registry, factory) = registry();
        let probe = factory.probe("/dev/ttyUSB0");

        let first = registry
            .get_or_create(ConnectionConfig::new("/dev/ttyUSB0"))
            .await
            .unwrap();
        assert!(first.is_open());

        assert!(matches!(
            registry.get_or_create(ConnectionConfig::new("/dev/ttyUSB0")).await,
            Err(RegistryError::AlreadyConnected(ref id)) if id == "/dev/ttyUSB0"
        ));
        assert_eq!(probe.open_calls(), 1);

        registry.remove("/dev/ttyUSB0").await.unwrap();
        assert!(!first.is_open());
        assert_eq!(probe.close_calls(), 1);

        let third = registry
            .get_or_create(ConnectionConfig::new("/dev/ttyUSB0"))
            .await
            .unwrap();
        assert!(third.is_open());
        assert_eq!(probe.open_calls(), 2);
    }

    #[tokio::test]
    async fn test_failed_connect_is_not_stored() {
        let (registry, factory) = registry();
        factory.probe("COM3").fail_next_open("access denied");

        let err = registry
            .get_or_create(ConnectionConfig::new("COM3"))
            .await
            .err()
            .unwrap();
        assert_eq!(
            err,
            RegistryError::Session(SessionError::Transport(TransportError::OpenFailed(
                "access denied".to_string()
            )))
        );
        assert!(matches!(registry.lookup("COM3"), Err(RegistryError::NotFound(_))));
        assert!(registry.is_empty());

        // The reservation was released, so a retry goes through
        registry.get_or_create(ConnectionConfig::new("COM3")).await.unwrap();
        assert_eq!(registry.identifiers(), vec!["COM3".to_string()]);
    }

    #[tokio::test]
    async fn test_concurrent_connects_admit_one() {
        let (registry, factory) = registry();

        let (a, b) = tokio::join!(
            registry.get_or_create(ConnectionConfig::new("/dev/ttyACM0")),
            registry.get_or_create(ConnectionConfig::new("/dev/ttyACM0")),
        );

        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        assert!(matches!(
            a.err().or(b.err()),
            Some(RegistryError::AlreadyConnected(_))
        ));
        assert_eq!(factory.probe("/dev/ttyACM0").open_calls(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_routes_writes() {
        let (registry, factory) = registry();
        let config = ConnectionConfig::new("/dev/ttyUSB1").with_write_termination("\r");
        registry.get_or_create(config).await.unwrap();

        registry.dispatch("/dev/ttyUSB1", "*IDN?").await.unwrap();
        assert_eq!(factory.probe("/dev/ttyUSB1").written(), vec![b"*IDN?\r".to_vec()]);

        assert_eq!(
            registry.dispatch("/dev/ttyUSB9", "*IDN?").await,
            Err(RegistryError::NotFound("/dev/ttyUSB9".to_string()))
        );
    }

    #[tokio::test]
    async fn test_remove_absent_is_noop() {
        let (registry, _factory) = registry();
        registry.remove("/dev/nothing").await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_with_uncertain_release_still_removes() {
        let (registry, factory) = registry();
        registry.get_or_create(ConnectionConfig::new("COM4")).await.unwrap();
        factory.probe("COM4").fail_next_close("handle leaked");

        assert_eq!(
            registry.remove("COM4").await,
            Err(RegistryError::Session(SessionError::ReleaseUncertain(
                "failed to close device: handle leaked".to_string()
            )))
        );
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_faulted_session_stays_until_replaced() {
        let (registry, factory) = registry();
        let probe = factory.probe("/dev/ttyUSB2");
        let session = registry
            .get_or_create(ConnectionConfig::new("/dev/ttyUSB2"))
            .await
            .unwrap();

        probe.inject_error("unplugged").await;
        wait_for_fault(&session).await;
        // The faulted transport is released in the background
        for _ in 0..1000 {
            if probe.close_calls() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(probe.close_calls(), 1);

        // Still registered, surfacing the fault to callers
        assert!(matches!(
            registry.dispatch("/dev/ttyUSB2", "X").await,
            Err(RegistryError::Session(SessionError::TransportFaulted(_)))
        ));

        // A new connect replaces it
        let fresh = registry
            .get_or_create(ConnectionConfig::new("/dev/ttyUSB2"))
            .await
            .unwrap();
        assert!(fresh.is_open());
        assert!(Arc::ptr_eq(&registry.lookup("/dev/ttyUSB2").unwrap(), &fresh));
        assert_eq!(probe.open_calls(), 2);
    }

    #[tokio::test]
    async fn test_remove_faulted_session() {
        let (registry, factory) = registry();
        let session = registry
            .get_or_create(ConnectionConfig::new("/dev/ttyUSB3"))
            .await
            .unwrap();

        factory.probe("/dev/ttyUSB3").end_stream();
        wait_for_fault(&session).await;

        registry.remove("/dev/ttyUSB3").await.unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_all_tags_messages() {
        let (registry, factory) = registry();
        registry.get_or_create(ConnectionConfig::new("/dev/a")).await.unwrap();
        registry.get_or_create(ConnectionConfig::new("/dev/b")).await.unwrap();
        let mut all = registry.subscribe_all();

        factory.probe("/dev/a").push("from a\n").await;
        assert_eq!(
            all.recv().await,
            Some(FeedEvent::Item(DeviceMessage {
                identifier: "/dev/a".to_string(),
                data: "from a".to_string(),
            }))
        );

        factory.probe("/dev/b").push("from b\n").await;
        assert_eq!(
            all.recv().await,
            Some(FeedEvent::Item(DeviceMessage {
                identifier: "/dev/b".to_string(),
                data: "from b".to_string(),
            }))
        );
    }

    #[tokio::test]
    async fn test_subscribe_by_identifier() {
        let (registry, factory) = registry();
        registry.get_or_create(ConnectionConfig::new("/dev/a")).await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = registry
            .subscribe("/dev/a", move |item| {
                let _ = tx.send(item);
            })
            .unwrap();

        factory.probe("/dev/a").push("reading=3.3\n").await;
        assert_eq!(rx.recv().await, Some(Ok("reading=3.3".to_string())));
        handle.unsubscribe();

        assert!(matches!(
            registry.subscribe("/dev/z", |_| {}),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let (registry, factory) = registry();
        let a = registry.get_or_create(ConnectionConfig::new("/dev/a")).await.unwrap();
        let b = registry.get_or_create(ConnectionConfig::new("/dev/b")).await.unwrap();

        registry.shutdown().await;

        assert!(registry.is_empty());
        assert_eq!(a.state(), SessionState::Closed);
        assert_eq!(b.state(), SessionState::Closed);
        assert_eq!(factory.probe("/dev/a").close_calls(), 1);
        assert_eq!(factory.probe("/dev/b").close_calls(), 1);
    }

    #[tokio::test]
    async fn test_disconnected_handle_cannot_reopen_device() {
        let (registry, factory) = registry();
        let device = factory.probe("/dev/ttyUSB5");
        let old = registry
            .get_or_create(ConnectionConfig::new("/dev/ttyUSB5"))
            .await
            .unwrap();

        // Disconnecting through the handle unregisters the session
        old.disconnect().await.unwrap();
        assert_eq!(
            registry.dispatch("/dev/ttyUSB5", "X").await,
            Err(RegistryError::NotFound("/dev/ttyUSB5".to_string()))
        );
        assert!(registry.is_empty());

        let new = registry
            .get_or_create(ConnectionConfig::new("/dev/ttyUSB5"))
            .await
            .unwrap();

        // The stale handle may not open the device a second time
        assert_eq!(old.connect().await, Err(SessionError::Retired));
        assert!(!old.is_open());
        assert!(new.is_open());
        assert_eq!(device.open_calls(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_first_line_after_open_is_forwarded() {
        let (registry, factory) = registry();
        let mut all = registry.subscribe_all();
        factory.probe("/dev/ttyUSB7").send_on_open("READY\n");

        registry
            .get_or_create(ConnectionConfig::new("/dev/ttyUSB7"))
            .await
            .unwrap();
        let first = tokio::time::timeout(std::time::Duration::from_secs(5), all.recv())
            .await
            .unwrap();
        assert_eq!(
            first,
            Some(FeedEvent::Item(DeviceMessage {
                identifier: "/dev/ttyUSB7".to_string(),
                data: "READY".to_string(),
            }))
        );
    }
}
