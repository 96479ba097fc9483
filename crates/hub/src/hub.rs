use relay_core::config::HubConfig;
use relay_core::protocol::{AgentCommand, UserEvent};
use relay_core::{short_token, Error, Result};
use relay_storage::AgentDirectory;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{PendingTable, SnapshotCache};
use crate::registry::{Registry, UserHandle};

/// Returned by [`Hub::register_agent`]. The socket writer drains `outbound`.
pub struct AgentSession {
    pub conn_id: u64,
    pub user_id: Option<i64>,
    pub outbound: mpsc::Receiver<String>,
}

/// Returned by [`Hub::register_user`].
pub struct UserSession {
    pub handle: UserHandle,
    pub outbound: mpsc::Receiver<String>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Hub {
    registry: RwLock<Registry>,
    screenshots: RwLock<SnapshotCache<String>>,
    page_states: RwLock<SnapshotCache<Value>>,
    screenshot_waiters: Mutex<PendingTable<String>>,
    page_state_waiters: Mutex<PendingTable<Value>>,
    directory: Arc<dyn AgentDirectory>,
    config: HubConfig,
    next_conn_id: AtomicU64,
}

impl Hub {
    pub fn new(directory: Arc<dyn AgentDirectory>, config: HubConfig) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            screenshots: RwLock::new(SnapshotCache::default()),
            page_states: RwLock::new(SnapshotCache::default()),
            screenshot_waiters: Mutex::new(PendingTable::default()),
            page_state_waiters: Mutex::new(PendingTable::default()),
            directory,
            config,
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    fn conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    // ---- agents ----

    /// Register a freshly authenticated agent. Any live connection for the
    /// same token is replaced.
    pub fn register_agent(&self, token: &str) -> AgentSession {
        let user_id = match self.directory.owner_of(token) {
            Ok(owner) => owner,
            Err(e) => {
                warn!(agent = %short_token(token), error = %e, "Owner lookup failed");
                None
            }
        };
        let (tx, outbound) = mpsc::channel(self.config.queue_capacity);
        let conn_id = self.conn_id();
        let replaced = write(&self.registry).insert_agent(token, conn_id, user_id, tx);
        info!(agent = %short_token(token), ?user_id, conn_id, replaced, "Agent registered");
        AgentSession { conn_id, user_id, outbound }
    }

    /// Remove the agent whatever connection it is on. Idempotent.
    pub fn unregister_agent(&self, token: &str) {
        if write(&self.registry).remove_agent(token) {
            self.cancel_waiters(token);
            info!(agent = %short_token(token), "Agent unregistered");
        }
    }

    /// Remove the agent only if `conn_id` is still its live connection.
    pub fn unregister_agent_conn(&self, token: &str, conn_id: u64) -> bool {
        let removed = write(&self.registry).remove_agent_conn(token, conn_id);
        if removed {
            self.cancel_waiters(token);
            info!(agent = %short_token(token), conn_id, "Agent unregistered");
        }
        removed
    }

    fn cancel_waiters(&self, token: &str) {
        lock(&self.screenshot_waiters).cancel(token);
        lock(&self.page_state_waiters).cancel(token);
    }

    pub fn is_agent_online(&self, token: &str) -> bool {
        read(&self.registry).agent_online(token)
    }

    pub fn agent_owner(&self, token: &str) -> Option<i64> {
        read(&self.registry).agent_owner(token)
    }

    /// Attach an owner to a live agent after pairing.
    pub fn update_agent_owner(&self, token: &str, user_id: i64) {
        if write(&self.registry).set_agent_owner(token, user_id) {
            debug!(agent = %short_token(token), user_id, "Agent owner updated");
        }
    }

    pub fn connected_agents(&self) -> Vec<String> {
        read(&self.registry).agent_tokens()
    }

    // ---- users ----

    pub fn register_user(&self, user_id: i64) -> UserSession {
        let (tx, outbound) = mpsc::channel(self.config.queue_capacity);
        let handle = UserHandle::new(self.conn_id(), user_id, tx);
        write(&self.registry).insert_user(&handle);
        info!(user_id, conn_id = handle.id, "User connected");
        UserSession { handle, outbound }
    }

    pub fn unregister_user(&self, handle: &UserHandle) {
        let last = write(&self.registry).remove_user(handle);
        info!(user_id = handle.user_id, conn_id = handle.id, last, "User disconnected");
    }

    pub fn set_viewing(&self, user_id: i64, token: &str) {
        write(&self.registry).set_viewing(user_id, token);
    }

    pub fn get_viewing(&self, user_id: i64) -> Option<String> {
        read(&self.registry).viewing(user_id).map(|s| s.to_string())
    }

    // ---- routing ----

    pub fn send_to_agent(&self, token: &str, msg: String) -> bool {
        read(&self.registry).send_to_agent(token, msg)
    }

    pub fn send_command(&self, token: &str, command: &AgentCommand) -> bool {
        match command.encode() {
            Ok(msg) => self.send_to_agent(token, msg),
            Err(e) => {
                warn!(error = %e, kind = command.kind(), "Failed to encode agent command");
                false
            }
        }
    }

    /// Deliver to every connection of `user_id`; returns the delivered count.
    pub fn send_to_user(&self, user_id: i64, msg: &str) -> usize {
        read(&self.registry).send_to_user(user_id, msg)
    }

    pub fn send_user_event(&self, user_id: i64, event: &UserEvent) -> usize {
        match event.encode() {
            Ok(msg) => self.send_to_user(user_id, &msg),
            Err(e) => {
                warn!(error = %e, "Failed to encode user event");
                0
            }
        }
    }

    /// Deliver to the agent's owner, but only while the owner is viewing
    /// this agent. Otherwise the message is dropped.
    pub fn broadcast_to_agent_users(&self, token: &str, msg: &str) -> usize {
        let registry = read(&self.registry);
        match registry.viewer_of(token) {
            Some(user_id) => registry.send_to_user(user_id, msg),
            None => 0,
        }
    }

    // ---- screenshot cache ----

    /// Store the agent's latest screenshot and wake everyone waiting for one.
    pub fn update_cache(&self, token: &str, image: &str) {
        write(&self.screenshots).update(token, image.to_string());
        let woken = lock(&self.screenshot_waiters).fulfill(token, &image.to_string());
        if woken > 0 {
            debug!(agent = %short_token(token), woken, "Screenshot delivered to waiters");
        }
    }

    pub fn get_cached(&self, token: &str) -> Option<(String, Instant)> {
        read(&self.screenshots).get(token)
    }

    /// A screenshot no older than the freshness window, or a new one from
    /// the agent. Falls back to a stale cached image on timeout.
    pub async fn request_sync(&self, token: &str, timeout: Duration) -> Result<String> {
        let fresh = read(&self.screenshots).fresh(token, self.config.freshness());
        if let Some(image) = fresh {
            debug!(agent = %short_token(token), "Serving cached screenshot");
            return Ok(image);
        }
        self.await_snapshot(
            token,
            timeout,
            &self.screenshot_waiters,
            &self.screenshots,
            AgentCommand::RequestScreenshot,
        )
        .await
    }

    // ---- page state cache ----

    pub fn update_page_state(&self, token: &str, state: Value) {
        lock(&self.page_state_waiters).fulfill(token, &state);
        write(&self.page_states).update(token, state);
    }

    pub fn cached_page_state(&self, token: &str) -> Option<(Value, Instant)> {
        read(&self.page_states).get(token)
    }

    /// Always asks the agent, since form values change without a repaint.
    pub async fn request_page_state_sync(&self, token: &str, timeout: Duration) -> Result<Value> {
        self.await_snapshot(
            token,
            timeout,
            &self.page_state_waiters,
            &self.page_states,
            AgentCommand::GetPageState,
        )
        .await
    }

    pub fn clear_agent_cache(&self, token: &str) {
        write(&self.screenshots).remove(token);
        write(&self.page_states).remove(token);
    }

    async fn await_snapshot<T: Clone>(
        &self,
        token: &str,
        timeout: Duration,
        waiters: &Mutex<PendingTable<T>>,
        cache: &RwLock<SnapshotCache<T>>,
        command: AgentCommand,
    ) -> Result<T> {
        if !self.is_agent_online(token) {
            return Err(Error::NotConnected);
        }

        let (id, rx) = lock(waiters).register(token);
        if !self.send_command(token, &command) {
            lock(waiters).remove(token, &id);
            return Err(Error::NotConnected);
        }

        let outcome = tokio::time::timeout(timeout, rx).await;
        lock(waiters).remove(token, &id);

        match outcome {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => read(cache)
                .get(token)
                .map(|(payload, _)| payload)
                .ok_or(Error::NotConnected),
            Err(_) => {
                warn!(agent = %short_token(token), kind = command.kind(), "Snapshot request timed out");
                read(cache)
                    .get(token)
                    .map(|(payload, _)| payload)
                    .ok_or_else(|| {
                        let what = match command {
                            AgentCommand::RequestScreenshot => "screenshot",
                            _ => "page state",
                        };
                        Error::Timeout(format!("{} request timed out", what))
                    })
            }
        }
    }

    // ---- bookkeeping ----

    /// Record "last seen" for every connected agent.
    pub fn touch_connected_agents(&self) -> usize {
        let tokens = self.connected_agents();
        let mut touched = 0;
        for token in &tokens {
            match self.directory.touch_last_seen(token) {
                Ok(()) => touched += 1,
                Err(e) => warn!(agent = %short_token(token), error = %e, "Failed to update last_seen"),
            }
        }
        touched
    }
}
