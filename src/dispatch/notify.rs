//! Notification sinks.

use std::sync::Mutex;

use async_trait::async_trait;
use log::{info, warn};

use super::NotificationSink;

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn show_jobs_queued(&self, count: usize, kind: &str) {
        info!("{} {} job(s) queued", count, kind);
    }

    async fn show_warning(&self, message: &str) {
        warn!("{}", message);
    }
}

/// A captured notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    JobsQueued { count: usize, kind: String },
    Warning(String),
}

/// Keeps notifications in memory for inspection.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    seen: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.seen.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.notifications()
            .into_iter()
            .filter_map(|n| match n {
                Notification::Warning(msg) => Some(msg),
                _ => None,
            })
            .collect()
    }

    fn push(&self, notification: Notification) {
        self.seen.lock().unwrap_or_else(|p| p.into_inner()).push(notification);
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn show_jobs_queued(&self, count: usize, kind: &str) {
        self.push(Notification::JobsQueued {
            count,
            kind: kind.to_string(),
        });
    }

    async fn show_warning(&self, message: &str) {
        self.push(Notification::Warning(message.to_string()));
    }
}
