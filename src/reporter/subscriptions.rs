//! Per-job status subscriptions over mpsc channels.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::mpsc;

use crate::store::{CaptureJob, JobStatus};

/// A status change pushed to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct JobUpdate {
    pub job_id: String,
    pub status: JobStatus,
    pub error: Option<String>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub version: i64,
}

impl JobUpdate {
    pub fn from_job(job: &CaptureJob) -> Self {
        Self {
            job_id: job.id.clone(),
            status: job.status,
            error: job.last_error.clone(),
            started_at: job.started_at,
            completed_at: job.completed_at,
            version: job.version,
        }
    }
}

type Subscribers = HashMap<String, Vec<(u64, mpsc::UnboundedSender<JobUpdate>)>>;

#[derive(Debug, Default)]
pub(crate) struct Registry {
    subscribers: Mutex<Subscribers>,
    next_id: AtomicU64,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, Subscribers> {
        self.subscribers.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn subscribe(this: &Arc<Registry>, job_id: &str) -> JobSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = this.next_id.fetch_add(1, Ordering::Relaxed);
        this.lock().entry(job_id.to_string()).or_default().push((id, tx));

        JobSubscription {
            receiver: rx,
            handle: SubscriptionHandle {
                job_id: job_id.to_string(),
                id,
                registry: Arc::downgrade(this),
            },
        }
    }

    /// Send to every live subscriber of the job; closed channels are pruned.
    pub(crate) fn publish(&self, update: JobUpdate) {
        let mut subscribers = self.lock();
        let Some(list) = subscribers.get_mut(&update.job_id) else {
            return;
        };
        list.retain(|(_, tx)| tx.send(update.clone()).is_ok());
        if list.is_empty() {
            subscribers.remove(&update.job_id);
        }
    }

    pub(crate) fn count(&self, job_id: &str) -> usize {
        self.lock().get(job_id).map(|l| l.len()).unwrap_or(0)
    }

    fn remove(&self, job_id: &str, id: u64) {
        let mut subscribers = self.lock();
        if let Some(list) = subscribers.get_mut(job_id) {
            list.retain(|(sid, _)| *sid != id);
            if list.is_empty() {
                subscribers.remove(job_id);
            }
        }
    }
}

/// Unsubscribes when dropped.
#[derive(Debug)]
pub struct SubscriptionHandle {
    job_id: String,
    id: u64,
    registry: Weak<Registry>,
}

impl SubscriptionHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.job_id, self.id);
        }
    }
}

/// Receiving end of a job subscription.
#[derive(Debug)]
pub struct JobSubscription {
    pub(crate) receiver: mpsc::UnboundedReceiver<JobUpdate>,
    pub(crate) handle: SubscriptionHandle,
}

impl JobSubscription {
    /// Wait for the next update. `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<JobUpdate> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<JobUpdate> {
        self.receiver.try_recv().ok()
    }

    pub fn job_id(&self) -> &str {
        self.handle.job_id()
    }
}
