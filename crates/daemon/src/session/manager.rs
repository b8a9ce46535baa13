//! Session manager.
//!
//! The manager is the request-facing surface of the hub: it creates sessions
//! through a [`ProcessEngine`], keeps them in a [`SessionRegistry`], hands
//! out subscriptions, and tears sessions down either on request or when
//! their process stream ends.

use std::sync::Arc;

use tokio::sync::Semaphore;
use uuid::Uuid;

use super::hub::{Session, SessionError, SessionId, SessionOptions, SessionState};
use super::registry::SessionRegistry;
use super::subscriber::{SubscriberHandle, SubscriberStats};
use crate::config::SessionConfig;
use crate::engine::{AttachParams, ProcessEngine};
use crate::transport::{ChunkSink, ChunkSource};

/// Default cap on concurrently registered sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 10;

/// Creates, tracks and closes sessions backed by one engine.
pub struct SessionManager<E> {
    engine: Arc<E>,
    registry: Arc<SessionRegistry>,
    options: SessionOptions,
    max_sessions: usize,
    /// One permit per session that may exist; held from before attach
    /// until teardown.
    slots: Arc<Semaphore>,
}

impl<E> Clone for SessionManager<E> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            registry: Arc::clone(&self.registry),
            options: self.options.clone(),
            max_sessions: self.max_sessions,
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<E: ProcessEngine> SessionManager<E> {
    pub fn new(engine: Arc<E>, options: SessionOptions, max_sessions: usize) -> Self {
        let max_sessions = max_sessions.max(1);
        Self {
            engine,
            registry: Arc::new(SessionRegistry::new()),
            options,
            max_sessions,
            slots: Arc::new(Semaphore::new(max_sessions)),
        }
    }

    pub fn from_config(engine: Arc<E>, config: &SessionConfig) -> Self {
        Self::new(engine, SessionOptions::from(config), config.max_sessions)
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Attach a new process and start its session.
    ///
    /// The session limit is enforced by reserving a slot before the engine
    /// is asked to attach, so concurrent creates cannot overshoot it. The
    /// slot is given back if the attach fails.
    pub async fn create_session(&self) -> Result<SessionId, SessionError> {
        let slot = Arc::clone(&self.slots)
            .try_acquire_owned()
            .map_err(|_| SessionError::LimitReached(self.max_sessions))?;

        let id = Uuid::new_v4().to_string();
        let (session, input) = Session::new(id.clone(), self.options.clone());
        session.begin_attach();

        let attachment = match self.engine.attach(&AttachParams::for_session(&id)).await {
            Ok(attachment) => attachment,
            Err(e) => {
                session.fail();
                tracing::warn!(session_id = %id, error = %e, "Failed to attach process");
                return Err(SessionError::AttachFailed(e.to_string()));
            }
        };

        if !self.registry.create(id.clone(), Arc::clone(&session)) {
            session.fail();
            if let Err(e) = self.engine.stop(&attachment.process).await {
                tracing::warn!(session_id = %id, error = %e, "Failed to stop orphaned process");
            }
            return Err(SessionError::AlreadyExists(id));
        }
        session.hold_slot(slot);

        let pid = attachment.process.pid;
        let session_loop = session.start(attachment, input);

        let manager = self.clone();
        tokio::spawn(async move {
            let exit = session_loop.run().await;
            // An explicit close already owns the teardown.
            if session.begin_close() {
                tracing::debug!(session_id = %session.id(), exit = ?exit, "Tearing down ended session");
                if let Err(e) = manager.teardown(&session).await {
                    tracing::warn!(session_id = %session.id(), error = %e, "Session teardown incomplete");
                }
            }
        });

        tracing::info!(session_id = %id, pid = ?pid, "Created new session");
        Ok(id)
    }

    /// Registered session ids, sorted.
    pub fn list_sessions(&self) -> Vec<SessionId> {
        self.registry.ids()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.registry.get(id)
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Close a session: stop its loop, release its subscribers, stop its
    /// process, and unregister it.
    ///
    /// A stop failure is returned as [`SessionError::StopFailed`] after the
    /// rest of the teardown has completed.
    pub async fn close_session(&self, id: &str) -> Result<(), SessionError> {
        let session = self
            .registry
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;

        if !session.begin_close() {
            return Err(SessionError::NotFound(id.to_string()));
        }
        self.teardown(&session).await
    }

    async fn teardown(&self, session: &Arc<Session>) -> Result<(), SessionError> {
        let id = session.id().clone();

        session.halt();
        let released = session.release_subscribers().await;

        let stopped = match session.take_process() {
            Some(process) => self.engine.stop(&process).await,
            None => Ok(()),
        };

        self.registry.delete(&id);
        session.release_slot();
        session.set_state(SessionState::Closed);

        let stats = session.stats().await;
        tracing::info!(
            session_id = %id,
            subscribers_released = released,
            chunks_out = stats.chunks_out,
            chunks_in = stats.chunks_in,
            "Session closed"
        );

        stopped.map_err(|e| {
            tracing::warn!(session_id = %id, error = %e, "Process stop failed; session removed anyway");
            SessionError::StopFailed {
                id,
                reason: e.to_string(),
            }
        })
    }

    /// Subscribe to a running session, reading the subscriber's input from
    /// `source`.
    pub async fn subscribe<S: ChunkSource>(
        &self,
        id: &str,
        source: S,
    ) -> Result<SubscriberHandle, SessionError> {
        let session = self
            .registry
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        if session.is_closing() {
            return Err(SessionError::NotRunning(id.to_string()));
        }
        session.subscribe(source).await
    }

    /// Relay a duplex transport to a session until either side ends.
    pub async fn attach<S, K>(
        &self,
        id: &str,
        source: S,
        sink: K,
    ) -> Result<SubscriberStats, SessionError>
    where
        S: ChunkSource,
        K: ChunkSink,
    {
        let handle = self.subscribe(id, source).await?;
        let subscriber_id = handle.id();
        let stats = handle.pump(sink).await;
        tracing::debug!(
            session_id = %id,
            subscriber_id = %subscriber_id,
            delivered = stats.delivered,
            dropped = stats.dropped,
            "Relay finished"
        );
        Ok(stats)
    }

    /// Close every registered session. Returns how many were closed.
    pub async fn shutdown_all(&self) -> usize {
        let mut closed = 0;
        for id in self.registry.ids() {
            match self.close_session(&id).await {
                Ok(()) => closed += 1,
                Err(SessionError::NotFound(_)) => {}
                Err(e) => {
                    closed += 1;
                    tracing::warn!(session_id = %id, error = %e, "Error closing session during shutdown");
                }
            }
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;
    use crate::transport::{StreamSink, StreamSource};
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::time::timeout;

    fn manager(engine: MemoryEngine) -> SessionManager<MemoryEngine> {
        SessionManager::new(Arc::new(engine), SessionOptions::default(), 4)
    }

    fn transport() -> (DuplexStream, StreamSource<DuplexStream>) {
        let (near, far) = tokio::io::duplex(1024);
        (near, StreamSource::new(far))
    }

    async fn recv(handle: &SubscriberHandle) -> Bytes {
        timeout(Duration::from_secs(2), handle.recv())
            .await
            .expect("timeout")
            .expect("subscription ended")
    }

    #[tokio::test]
    async fn test_create_and_list() {
        let manager = manager(MemoryEngine::echo());
        let a = manager.create_session().await.unwrap();
        let b = manager.create_session().await.unwrap();
        assert_ne!(a, b);

        let mut expected = vec![a.clone(), b.clone()];
        expected.sort();
        assert_eq!(manager.list_sessions(), expected);
        assert_eq!(manager.get(&a).unwrap().state(), SessionState::Running);
    }

    #[tokio::test]
    async fn test_attach_failure_is_not_registered() {
        let engine = MemoryEngine::new();
        engine.set_fail_attach(true);
        let manager = manager(engine);

        let result = manager.create_session().await;
        assert!(matches!(result, Err(SessionError::AttachFailed(_))));
        assert!(manager.list_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_session_limit() {
        let manager = manager(MemoryEngine::echo());
        for _ in 0..4 {
            manager.create_session().await.unwrap();
        }
        let result = manager.create_session().await;
        assert!(matches!(result, Err(SessionError::LimitReached(4))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creates_respect_limit() {
        let engine = MemoryEngine::echo();
        engine.set_attach_delay(Duration::from_millis(50));
        let manager = SessionManager::new(Arc::new(engine), SessionOptions::default(), 2);

        let tasks: Vec<_> = (0..6)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.create_session().await })
            })
            .collect();

        let mut created = 0;
        let mut refused = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => created += 1,
                Err(SessionError::LimitReached(2)) => refused += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(created, 2);
        assert_eq!(refused, 4);
        assert_eq!(manager.session_count(), 2);
    }

    #[tokio::test]
    async fn test_slots_are_returned() {
        let engine = MemoryEngine::echo();
        engine.set_fail_attach(true);
        let manager = SessionManager::new(Arc::new(engine), SessionOptions::default(), 1);

        for _ in 0..3 {
            let result = manager.create_session().await;
            assert!(matches!(result, Err(SessionError::AttachFailed(_))));
        }

        manager.engine().set_fail_attach(false);
        let id = manager.create_session().await.unwrap();
        assert!(matches!(
            manager.create_session().await,
            Err(SessionError::LimitReached(1))
        ));

        manager.close_session(&id).await.unwrap();
        manager.create_session().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_releases_subscribers_and_unregisters() {
        let manager = manager(MemoryEngine::new());
        let id = manager.create_session().await.unwrap();

        let mut transports = Vec::new();
        let mut handles = Vec::new();
        for _ in 0..3 {
            let (near, source) = transport();
            transports.push(near);
            handles.push(manager.subscribe(&id, source).await.unwrap());
        }

        manager.close_session(&id).await.unwrap();
        for handle in &handles {
            assert!(handle.is_done());
        }
        assert!(manager.list_sessions().is_empty());
        assert_eq!(manager.engine().stopped().len(), 1);

        let second = manager.close_session(&id).await;
        assert!(matches!(second, Err(SessionError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_stop_failure_still_removes_session() {
        let engine = MemoryEngine::new();
        engine.set_fail_stop(true);
        let manager = manager(engine);
        let id = manager.create_session().await.unwrap();
        let session = manager.get(&id).unwrap();

        let (_near, source) = transport();
        let handle = manager.subscribe(&id, source).await.unwrap();

        let result = manager.close_session(&id).await;
        assert!(matches!(result, Err(SessionError::StopFailed { .. })));
        assert!(handle.is_done());
        assert!(manager.get(&id).is_none());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_process_eof_closes_session() {
        let engine = MemoryEngine::new();
        let manager = manager(engine);
        let id = manager.create_session().await.unwrap();
        let session = manager.get(&id).unwrap();
        let end = manager.engine().next_process().await.unwrap();

        let (_near, source) = transport();
        let handle = manager.subscribe(&id, source).await.unwrap();

        drop(end);
        let state = timeout(Duration::from_secs(2), session.closed())
            .await
            .expect("session did not close");
        assert_eq!(state, SessionState::Closed);
        assert!(handle.is_done());
        assert!(manager.list_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_unknown_session() {
        let manager = manager(MemoryEngine::echo());
        let (_near, source) = transport();
        let result = manager.subscribe("nope", source).await;
        assert!(matches!(result, Err(SessionError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_attach_relays_echo() {
        let manager = manager(MemoryEngine::echo());
        let id = manager.create_session().await.unwrap();

        let (client, server) = tokio::io::duplex(1024);
        let (server_rd, server_wr) = tokio::io::split(server);
        let relay = {
            let manager = manager.clone();
            let id = id.clone();
            tokio::spawn(async move {
                manager
                    .attach(&id, StreamSource::new(server_rd), StreamSink::new(server_wr))
                    .await
            })
        };

        let (mut client_rd, mut client_wr) = tokio::io::split(client);
        client_wr.write_all(b"hello hub").await.unwrap();

        let mut buf = [0u8; 9];
        timeout(Duration::from_secs(2), client_rd.read_exact(&mut buf))
            .await
            .expect("timeout")
            .unwrap();
        assert_eq!(&buf, b"hello hub");

        manager.close_session(&id).await.unwrap();
        let stats = timeout(Duration::from_secs(2), relay)
            .await
            .expect("relay did not finish")
            .unwrap()
            .unwrap();
        assert!(stats.delivered >= 1);
    }

    #[tokio::test]
    async fn test_ping_pong_scenario() {
        let manager = manager(MemoryEngine::new());
        let id = manager.create_session().await.unwrap();
        let mut end = manager.engine().next_process().await.unwrap();

        let (_a_near, a_source) = transport();
        let a = manager.subscribe(&id, a_source).await.unwrap();
        let (_b_near, b_source) = transport();
        let b = manager.subscribe(&id, b_source).await.unwrap();

        end.stream.write_all(b"PING").await.unwrap();
        assert_eq!(recv(&a).await, Bytes::from_static(b"PING"));
        assert_eq!(recv(&b).await, Bytes::from_static(b"PING"));

        assert!(a.unsubscribe().await);
        end.stream.write_all(b"PONG").await.unwrap();
        assert_eq!(recv(&b).await, Bytes::from_static(b"PONG"));
        assert!(a.recv().await.is_none());

        manager.close_session(&id).await.unwrap();
        timeout(Duration::from_secs(1), b.done())
            .await
            .expect("done not fired");
        assert!(!manager.list_sessions().contains(&id));
    }

    #[tokio::test]
    async fn test_shutdown_all() {
        let manager = manager(MemoryEngine::echo());
        for _ in 0..3 {
            manager.create_session().await.unwrap();
        }
        assert_eq!(manager.shutdown_all().await, 3);
        assert_eq!(manager.session_count(), 0);
    }
}
