use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

const MAX_ACTIVE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Success,
    Error,
}

/// A transient, dismissable operator message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub id: Uuid,
    pub level: Level,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Fan-out of operator notifications.
///
/// Every notification is broadcast to live subscribers and kept in a short
/// list of active entries until dismissed.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
    active: Arc<Mutex<VecDeque<Notification>>>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            tx,
            active: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn info(&self, message: impl Into<String>) -> Uuid {
        self.push(Level::Info, message.into())
    }

    pub fn success(&self, message: impl Into<String>) -> Uuid {
        self.push(Level::Success, message.into())
    }

    pub fn error(&self, message: impl Into<String>) -> Uuid {
        self.push(Level::Error, message.into())
    }

    fn push(&self, level: Level, message: String) -> Uuid {
        match level {
            Level::Error => tracing::warn!(message = %message, "Notification"),
            _ => tracing::info!(message = %message, "Notification"),
        }
        let notification = Notification {
            id: Uuid::new_v4(),
            level,
            message,
            created_at: Utc::now(),
        };
        let id = notification.id;
        {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            if active.len() >= MAX_ACTIVE {
                active.pop_front();
            }
            active.push_back(notification.clone());
        }
        // No subscribers is fine
        let _ = self.tx.send(notification);
        id
    }

    /// Notifications not yet dismissed, oldest first.
    pub fn active(&self) -> Vec<Notification> {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.iter().cloned().collect()
    }

    /// Returns false if `id` was not active.
    pub fn dismiss(&self, id: Uuid) -> bool {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        let before = active.len();
        active.retain(|n| n.id != id);
        active.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_dismiss() {
        let notifier = Notifier::new();
        let id = notifier.error("Login failed");
        notifier.success("Logged out");
        assert_eq!(notifier.active().len(), 2);
        assert!(notifier.dismiss(id));
        assert!(!notifier.dismiss(id));
        let active = notifier.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].level, Level::Success);
    }

    #[test]
    fn active_list_is_bounded() {
        let notifier = Notifier::new();
        for i in 0..(MAX_ACTIVE + 5) {
            notifier.info(format!("n{i}"));
        }
        let active = notifier.active();
        assert_eq!(active.len(), MAX_ACTIVE);
        assert_eq!(active[0].message, "n5");
    }

    #[tokio::test]
    async fn subscribers_receive_notifications() {
        let notifier = Notifier::new();
        let mut rx = notifier.subscribe();
        notifier.error("boom");
        let received = rx.recv().await.unwrap();
        assert_eq!(received.message, "boom");
        assert_eq!(received.level, Level::Error);
    }
}
