//! Management of multiple device sessions.
//! Provides a unified event stream and system-level tuning (FD limit).

use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::session::ConnectionState;
use crate::supervisor::{SessionEvent, Supervisor};
use futures_core::Stream;
use futures_util::StreamExt;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};
use tokio_util::sync::CancellationToken;

const EVENT_CAPACITY: usize = 256;

/// An event from any session owned by a [`Manager`].
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerEvent {
    pub device_id: String,
    pub event: SessionEvent,
}

struct Entry {
    session: Supervisor,
    token: CancellationToken,
}

struct ManagerInner {
    sessions: RwLock<HashMap<String, Entry>>,
    event_tx: broadcast::Sender<ManagerEvent>,
    cancel_token: CancellationToken,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Owns a set of sessions keyed by device id.
///
/// Each manager is an independent context; two managers never share
/// sessions.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

impl Manager {
    /// Raises the soft file descriptor limit to the hard limit.
    ///
    /// Useful when a single process supervises thousands of devices.
    /// Does nothing on non-Unix systems.
    pub fn maximize_fd_limit() -> Result<()> {
        #[cfg(unix)]
        {
            let (soft, hard) = rlimit::getrlimit(rlimit::Resource::NOFILE)
                .map_err(|e| SessionError::Io(format!("Failed to get rlimit: {}", e)))?;

            if soft < hard {
                rlimit::setrlimit(rlimit::Resource::NOFILE, hard, hard)
                    .map_err(|e| SessionError::Io(format!("Failed to set rlimit: {}", e)))?;
                info!("File descriptor limit increased from {} to {}", soft, hard);
            }
        }
        Ok(())
    }

    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(ManagerInner {
                sessions: RwLock::new(HashMap::new()),
                event_tx,
                cancel_token: CancellationToken::new(),
            }),
        }
    }

    /// Events from all managed sessions.
    pub fn stream(&self) -> impl Stream<Item = ManagerEvent> + Send + 'static {
        let mut rx = self.inner.event_tx.subscribe();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Manager stream lagged by {} events", n);
                    }
                }
            }
        }
    }

    /// Creates a TCP session from `config` and starts connecting it.
    pub async fn add(&self, config: SessionConfig) -> Result<Supervisor> {
        if self.inner.sessions.read().await.contains_key(&config.device_id) {
            return Err(SessionError::DuplicateDevice(config.device_id));
        }
        let session = Supervisor::new(config)?;
        match self.add_session(session.clone()).await {
            Ok(()) => Ok(session),
            Err(e) => {
                session.dispose().await;
                Err(e)
            }
        }
    }

    /// Takes ownership of an existing session and starts connecting it.
    pub async fn add_session(&self, session: Supervisor) -> Result<()> {
        let id = session.device_id().to_string();
        let mut sessions = self.inner.sessions.write().await;
        if sessions.contains_key(&id) {
            return Err(SessionError::DuplicateDevice(id));
        }

        let token = self.inner.cancel_token.child_token();
        self.spawn_forwarder(&session, token.clone());
        session.start().await?;

        sessions.insert(id.clone(), Entry { session, token });
        info!("Device {} added to manager", id);
        Ok(())
    }

    fn spawn_forwarder(&self, session: &Supervisor, token: CancellationToken) {
        let device_id = session.device_id().to_string();
        let event_tx = self.inner.event_tx.clone();
        let stream = session.events();

        tokio::spawn(async move {
            tokio::pin!(stream);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = stream.next() => match event {
                        Some(event) => {
                            let _ = event_tx.send(ManagerEvent {
                                device_id: device_id.clone(),
                                event,
                            });
                        }
                        None => break,
                    },
                }
            }
            debug!("Event forwarding for {} stopped", device_id);
        });
    }

    /// Removes and disposes a session.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let entry = self.inner.sessions.write().await.remove(id);
        match entry {
            Some(entry) => {
                entry.session.dispose().await;
                entry.token.cancel();
                info!("Device {} removed from manager", id);
                Ok(())
            }
            None => {
                warn!("Attempted to remove non-existent device {}", id);
                Err(SessionError::DeviceNotFound(id.to_string()))
            }
        }
    }

    pub async fn get(&self, id: &str) -> Option<Supervisor> {
        self.inner
            .sessions
            .read()
            .await
            .get(id)
            .map(|e| e.session.clone())
    }

    /// Device id to current connection state, without touching the network.
    pub async fn list(&self) -> HashMap<String, ConnectionState> {
        self.inner
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, e)| (id.clone(), e.session.state()))
            .collect()
    }

    /// Disposes every session and stops event forwarding.
    pub async fn shutdown(&self) {
        let entries: Vec<Entry> = {
            let mut sessions = self.inner.sessions.write().await;
            sessions.drain().map(|(_, e)| e).collect()
        };
        for entry in &entries {
            entry.session.dispose().await;
        }
        self.inner.cancel_token.cancel();
        info!("Manager shut down ({} sessions)", entries.len());
    }
}
