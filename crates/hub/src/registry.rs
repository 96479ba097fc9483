use std::collections::HashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Enqueue without waiting. A full or closed queue drops the message.
fn try_deliver(tx: &mpsc::Sender<String>, msg: String) -> bool {
    match tx.try_send(msg) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!("Outbound queue full, dropping message");
            false
        }
        Err(TrySendError::Closed(_)) => {
            debug!("Outbound queue closed, dropping message");
            false
        }
    }
}

struct AgentSlot {
    conn_id: u64,
    user_id: Option<i64>,
    tx: mpsc::Sender<String>,
}

/// One live user connection. A user may hold several at once.
#[derive(Debug, Clone)]
pub struct UserHandle {
    pub id: u64,
    pub user_id: i64,
    tx: mpsc::Sender<String>,
}

impl UserHandle {
    pub fn new(id: u64, user_id: i64, tx: mpsc::Sender<String>) -> Self {
        Self { id, user_id, tx }
    }

    /// Send to this connection only.
    pub fn send(&self, msg: String) -> bool {
        try_deliver(&self.tx, msg)
    }
}

/// Connection bookkeeping. Not synchronized; [`crate::Hub`] guards it.
#[derive(Default)]
pub struct Registry {
    agents: HashMap<String, AgentSlot>,
    users: HashMap<i64, HashMap<u64, mpsc::Sender<String>>>,
    viewing: HashMap<i64, String>,
}

impl Registry {
    /// Install a connection for `token`. Returns `true` when it replaced a
    /// live one, whose queue is closed by dropping its sender.
    pub fn insert_agent(
        &mut self,
        token: &str,
        conn_id: u64,
        user_id: Option<i64>,
        tx: mpsc::Sender<String>,
    ) -> bool {
        self.agents
            .insert(token.to_string(), AgentSlot { conn_id, user_id, tx })
            .is_some()
    }

    pub fn remove_agent(&mut self, token: &str) -> bool {
        self.agents.remove(token).is_some()
    }

    /// Remove `token` only while `conn_id` is still its current connection.
    pub fn remove_agent_conn(&mut self, token: &str, conn_id: u64) -> bool {
        match self.agents.get(token) {
            Some(slot) if slot.conn_id == conn_id => self.agents.remove(token).is_some(),
            _ => false,
        }
    }

    pub fn agent_online(&self, token: &str) -> bool {
        self.agents.contains_key(token)
    }

    pub fn agent_owner(&self, token: &str) -> Option<i64> {
        self.agents.get(token).and_then(|slot| slot.user_id)
    }

    pub fn set_agent_owner(&mut self, token: &str, user_id: i64) -> bool {
        match self.agents.get_mut(token) {
            Some(slot) => {
                slot.user_id = Some(user_id);
                true
            }
            None => false,
        }
    }

    pub fn agent_tokens(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }

    pub fn insert_user(&mut self, handle: &UserHandle) {
        self.users
            .entry(handle.user_id)
            .or_default()
            .insert(handle.id, handle.tx.clone());
    }

    /// Remove exactly this connection. Returns `true` when it was the user's
    /// last one, in which case the viewing assignment is cleared too.
    pub fn remove_user(&mut self, handle: &UserHandle) -> bool {
        let Some(conns) = self.users.get_mut(&handle.user_id) else {
            return false;
        };
        conns.remove(&handle.id);
        if conns.is_empty() {
            self.users.remove(&handle.user_id);
            self.viewing.remove(&handle.user_id);
            true
        } else {
            false
        }
    }

    pub fn set_viewing(&mut self, user_id: i64, token: &str) {
        self.viewing.insert(user_id, token.to_string());
    }

    pub fn viewing(&self, user_id: i64) -> Option<&str> {
        self.viewing.get(&user_id).map(|s| s.as_str())
    }

    /// Owner of `token` if that owner is currently viewing it.
    pub fn viewer_of(&self, token: &str) -> Option<i64> {
        let owner = self.agent_owner(token)?;
        (self.viewing(owner) == Some(token)).then_some(owner)
    }

    pub fn send_to_agent(&self, token: &str, msg: String) -> bool {
        match self.agents.get(token) {
            Some(slot) => try_deliver(&slot.tx, msg),
            None => false,
        }
    }

    /// Fan out to every connection of `user_id`; returns how many accepted.
    pub fn send_to_user(&self, user_id: i64, msg: &str) -> usize {
        self.users
            .get(&user_id)
            .map(|conns| {
                conns
                    .values()
                    .filter(|tx| try_deliver(tx, msg.to_string()))
                    .count()
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_agent_connection_wins() {
        let mut reg = Registry::default();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);

        assert!(!reg.insert_agent("agent_a", 1, None, tx1));
        assert!(reg.insert_agent("agent_a", 2, Some(7), tx2));
        assert_eq!(reg.agent_owner("agent_a"), Some(7));

        assert!(reg.send_to_agent("agent_a", "hello".into()));
        assert_eq!(rx2.try_recv().unwrap(), "hello");
        // First queue lost its only sender.
        assert!(rx1.try_recv().is_err());

        // A stale teardown from the first connection is ignored.
        assert!(!reg.remove_agent_conn("agent_a", 1));
        assert!(reg.agent_online("agent_a"));
        assert!(reg.remove_agent_conn("agent_a", 2));
        assert!(!reg.agent_online("agent_a"));
    }

    #[test]
    fn test_remove_last_user_conn_clears_viewing() {
        let mut reg = Registry::default();
        let (tx, _rx) = mpsc::channel(4);
        let a = UserHandle::new(1, 42, tx.clone());
        let b = UserHandle::new(2, 42, tx);
        reg.insert_user(&a);
        reg.insert_user(&b);
        reg.set_viewing(42, "agent_a");

        assert!(!reg.remove_user(&a));
        assert_eq!(reg.viewing(42), Some("agent_a"));

        assert!(reg.remove_user(&b));
        assert_eq!(reg.viewing(42), None);
        assert!(!reg.remove_user(&b));
    }

    #[test]
    fn test_full_queue_drops() {
        let mut reg = Registry::default();
        let (tx, _rx) = mpsc::channel(1);
        reg.insert_agent("agent_a", 1, None, tx);
        assert!(reg.send_to_agent("agent_a", "one".into()));
        assert!(!reg.send_to_agent("agent_a", "two".into()));
        assert!(!reg.send_to_agent("agent_missing", "x".into()));
    }

    #[test]
    fn test_viewer_of_requires_owner_viewing() {
        let mut reg = Registry::default();
        let (tx, _rx) = mpsc::channel(4);
        reg.insert_agent("agent_a", 1, Some(5), tx.clone());
        reg.insert_agent("agent_b", 2, Some(5), tx);
        assert_eq!(reg.viewer_of("agent_a"), None);

        reg.set_viewing(5, "agent_b");
        assert_eq!(reg.viewer_of("agent_a"), None);
        assert_eq!(reg.viewer_of("agent_b"), Some(5));

        // Viewing someone else's agent does not make you its viewer.
        reg.set_viewing(9, "agent_a");
        assert_eq!(reg.viewer_of("agent_a"), None);
    }
}
