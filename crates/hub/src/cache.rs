use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Cached<T> {
    pub payload: T,
    pub updated_at: Instant,
}

/// Latest payload per agent token.
#[derive(Debug)]
pub struct SnapshotCache<T> {
    entries: HashMap<String, Cached<T>>,
}

impl<T> Default for SnapshotCache<T> {
    fn default() -> Self {
        Self { entries: HashMap::new() }
    }
}

impl<T: Clone> SnapshotCache<T> {
    pub fn update(&mut self, token: &str, payload: T) {
        self.entries.insert(
            token.to_string(),
            Cached {
                payload,
                updated_at: Instant::now(),
            },
        );
    }

    pub fn get(&self, token: &str) -> Option<(T, Instant)> {
        self.entries
            .get(token)
            .map(|c| (c.payload.clone(), c.updated_at))
    }

    /// Payload younger than `max_age`.
    pub fn fresh(&self, token: &str, max_age: Duration) -> Option<T> {
        self.entries
            .get(token)
            .filter(|c| c.updated_at.elapsed() < max_age)
            .map(|c| c.payload.clone())
    }

    pub fn remove(&mut self, token: &str) -> bool {
        self.entries.remove(token).is_some()
    }
}

/// Callers waiting for the next payload from an agent, keyed by
/// (agent token, request id). Each slot is fulfilled at most once.
#[derive(Debug)]
pub struct PendingTable<T> {
    waiters: HashMap<String, HashMap<Uuid, oneshot::Sender<T>>>,
}

impl<T> Default for PendingTable<T> {
    fn default() -> Self {
        Self { waiters: HashMap::new() }
    }
}

impl<T: Clone> PendingTable<T> {
    pub fn register(&mut self, token: &str) -> (Uuid, oneshot::Receiver<T>) {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.waiters
            .entry(token.to_string())
            .or_default()
            .insert(id, tx);
        (id, rx)
    }

    /// Drop a slot that is no longer awaited. Absent slots are ignored.
    pub fn remove(&mut self, token: &str, id: &Uuid) {
        if let Some(slots) = self.waiters.get_mut(token) {
            slots.remove(id);
            if slots.is_empty() {
                self.waiters.remove(token);
            }
        }
    }

    /// Hand `payload` to every slot waiting on `token` and clear them.
    /// Returns how many waiters were still listening.
    pub fn fulfill(&mut self, token: &str, payload: &T) -> usize {
        self.waiters
            .remove(token)
            .map(|slots| {
                slots
                    .into_values()
                    .map(|tx| tx.send(payload.clone()).is_ok())
                    .filter(|delivered| *delivered)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Close every slot for `token`; their receivers wake with an error.
    pub fn cancel(&mut self, token: &str) {
        self.waiters.remove(token);
    }

    pub fn pending_for(&self, token: &str) -> usize {
        self.waiters.get(token).map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_freshness_window() {
        tokio::time::pause();
        let mut cache = SnapshotCache::default();
        cache.update("agent_a", "AAA".to_string());
        assert_eq!(cache.fresh("agent_a", Duration::from_secs(3)).as_deref(), Some("AAA"));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(cache.fresh("agent_a", Duration::from_secs(3)).is_none());
        assert_eq!(cache.get("agent_a").map(|(p, _)| p).as_deref(), Some("AAA"));
    }

    #[tokio::test]
    async fn test_fulfill_only_matching_token() {
        let mut table = PendingTable::default();
        let (id_a1, rx_a1) = table.register("agent_a");
        let (id_a2, rx_a2) = table.register("agent_a");
        let (_id_b, mut rx_b) = table.register("agent_b");
        assert_ne!(id_a1, id_a2);

        assert_eq!(table.fulfill("agent_a", &"AAA".to_string()), 2);
        assert_eq!(rx_a1.await.unwrap(), "AAA");
        assert_eq!(rx_a2.await.unwrap(), "AAA");
        assert!(rx_b.try_recv().is_err());
        assert_eq!(table.pending_for("agent_a"), 0);
        assert_eq!(table.pending_for("agent_b"), 1);

        // A second doorbell finds nothing to fulfill.
        assert_eq!(table.fulfill("agent_a", &"BBB".to_string()), 0);
    }

    #[test]
    fn test_remove_leaves_no_residue() {
        let mut table: PendingTable<String> = PendingTable::default();
        let (id, _rx) = table.register("agent_a");
        table.remove("agent_a", &id);
        table.remove("agent_a", &id);
        assert!(table.is_empty());
    }
}
