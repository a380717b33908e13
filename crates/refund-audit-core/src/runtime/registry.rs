use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{RwLock, watch};

/// Live handle for one scheduled or running processing loop.
#[derive(Debug)]
struct LoopEntry {
    generation: u64,
    pause_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

/// Handed to the loop when it is registered. Dropping it marks the loop done.
#[derive(Debug)]
pub struct LoopTicket {
    pub generation: u64,
    pause_rx: watch::Receiver<bool>,
    done_tx: watch::Sender<bool>,
}

impl LoopTicket {
    /// Whether an in-process pause has been requested for this loop.
    pub fn pause_requested(&self) -> bool {
        *self.pause_rx.borrow()
    }
}

impl Drop for LoopTicket {
    fn drop(&mut self) {
        let _ = self.done_tx.send(true);
    }
}

/// In-memory map of task ids to their live loop handles and credentials.
///
/// Constructed once per engine and shared by the controller; the database is
/// the source of truth for task state, this only tracks what this process is
/// currently running.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    loops: Arc<RwLock<HashMap<String, LoopEntry>>>,
    api_keys: Arc<RwLock<HashMap<String, String>>>,
    next_generation: Arc<AtomicU64>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a loop for `task_id`; `None` if one is already active.
    pub async fn try_register(&self, task_id: &str) -> Option<LoopTicket> {
        let mut loops = self.loops.write().await;
        if loops.contains_key(task_id) {
            return None;
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (pause_tx, pause_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        loops.insert(
            task_id.to_owned(),
            LoopEntry {
                generation,
                pause_tx,
                done_rx,
            },
        );
        Some(LoopTicket {
            generation,
            pause_rx,
            done_tx,
        })
    }

    /// Remove the entry for a finished loop, unless a newer loop replaced it.
    pub async fn finish(&self, task_id: &str, generation: u64) {
        let mut loops = self.loops.write().await;
        if loops.get(task_id).is_some_and(|e| e.generation == generation) {
            loops.remove(task_id);
        }
    }

    /// Signal the active loop to stop at the next row boundary.
    pub async fn request_pause(&self, task_id: &str) -> bool {
        match self.loops.read().await.get(task_id) {
            Some(entry) => entry.pause_tx.send(true).is_ok(),
            None => false,
        }
    }

    pub async fn is_active(&self, task_id: &str) -> bool {
        self.loops.read().await.contains_key(task_id)
    }

    /// Receiver that flips to `true` (or closes) when the loop ends.
    pub async fn done_receiver(&self, task_id: &str) -> Option<watch::Receiver<bool>> {
        self.loops
            .read()
            .await
            .get(task_id)
            .map(|entry| entry.done_rx.clone())
    }

    pub async fn set_api_key(&self, task_id: &str, api_key: String) {
        self.api_keys.write().await.insert(task_id.to_owned(), api_key);
    }

    pub async fn api_key(&self, task_id: &str) -> Option<String> {
        self.api_keys.read().await.get(task_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn one_loop_per_task() {
        let registry = TaskRegistry::new();
        let ticket = registry.try_register("t1").await.expect("first loop");
        assert!(registry.try_register("t1").await.is_none());
        assert!(registry.try_register("t2").await.is_some());

        registry.finish("t1", ticket.generation).await;
        drop(ticket);
        assert!(!registry.is_active("t1").await);
        assert!(registry.try_register("t1").await.is_some());
    }

    #[tokio::test]
    async fn stale_finish_keeps_newer_loop() {
        let registry = TaskRegistry::new();
        let old = registry.try_register("t1").await.unwrap();
        registry.finish("t1", old.generation).await;
        let _new = registry.try_register("t1").await.unwrap();
        registry.finish("t1", old.generation).await;
        assert!(registry.is_active("t1").await);
    }

    #[tokio::test]
    async fn pause_reaches_the_ticket() {
        let registry = TaskRegistry::new();
        let ticket = registry.try_register("t1").await.unwrap();
        assert!(!ticket.pause_requested());
        assert!(registry.request_pause("t1").await);
        assert!(ticket.pause_requested());
        assert!(!registry.request_pause("other").await);
    }

    #[tokio::test]
    async fn dropping_the_ticket_wakes_waiters() {
        let registry = TaskRegistry::new();
        let ticket = registry.try_register("t1").await.unwrap();
        let mut done = registry.done_receiver("t1").await.unwrap();
        let waiter = tokio::spawn(async move {
            let _ = done.wait_for(|d| *d).await;
        });
        drop(ticket);
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter woke")
            .unwrap();
    }

    #[tokio::test]
    async fn credentials_are_kept_in_memory() {
        let registry = TaskRegistry::new();
        assert!(registry.api_key("t1").await.is_none());
        registry.set_api_key("t1", "sk-1".into()).await;
        assert_eq!(registry.api_key("t1").await.as_deref(), Some("sk-1"));
    }
}
