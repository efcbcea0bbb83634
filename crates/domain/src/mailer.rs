//! Background mail delivery.
//!
//! Jobs go through a bounded queue drained by a fixed pool of worker tasks.
//! Submitting never waits: when the queue is full the job is dropped.

use std::sync::Arc;

use async_trait::async_trait;
use common::{Money, OrderId};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

/// A mail to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailJob {
    OrderPlaced {
        order_id: OrderId,
        to: String,
        name: String,
        total: Money,
    },
}

impl MailJob {
    pub fn recipient(&self) -> &str {
        match self {
            MailJob::OrderPlaced { to, .. } => to,
        }
    }

    pub fn subject(&self) -> String {
        match self {
            MailJob::OrderPlaced { order_id, .. } => format!("Order {order_id} received"),
        }
    }

    pub fn body(&self) -> String {
        match self {
            MailJob::OrderPlaced {
                order_id,
                name,
                total,
                ..
            } => format!(
                "Dear {name},\nWe received your order {order_id} totalling {total}. \
                 It will be processed once payment is confirmed."
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum MailError {
    #[error("Mail transport failed: {0}")]
    Transport(String),
}

/// Delivers mail.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, job: &MailJob) -> Result<(), MailError>;
}

/// Mailer that writes each mail to the log instead of sending it.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, job: &MailJob) -> Result<(), MailError> {
        tracing::info!(to = job.recipient(), subject = %job.subject(), "mail sent");
        Ok(())
    }
}

/// Producer handle of the mail queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct MailQueue {
    sender: mpsc::Sender<MailJob>,
}

/// Worker tasks draining a [`MailQueue`].
pub struct MailWorkers {
    handles: Vec<JoinHandle<()>>,
}

impl MailQueue {
    /// Starts `workers` tasks draining a queue of `capacity` jobs.
    ///
    /// Both values are raised to at least one.
    pub fn start(mailer: Arc<dyn Mailer>, capacity: usize, workers: usize) -> (Self, MailWorkers) {
        let (queue, receiver) = Self::channel(capacity);
        let receiver = Arc::new(Mutex::new(receiver));

        let handles = (0..workers.max(1))
            .map(|worker| {
                let receiver = Arc::clone(&receiver);
                let mailer = Arc::clone(&mailer);
                tokio::spawn(async move {
                    loop {
                        // Only the lock holder waits on the channel; the others
                        // queue up behind it.
                        let job = receiver.lock().await.recv().await;
                        let Some(job) = job else { break };

                        match mailer.send(&job).await {
                            Ok(()) => metrics::counter!("mail_jobs_sent_total").increment(1),
                            Err(e) => {
                                metrics::counter!("mail_jobs_failed_total").increment(1);
                                tracing::warn!(worker, to = job.recipient(), error = %e, "mail delivery failed");
                            }
                        }
                    }
                    tracing::debug!(worker, "mail worker stopped");
                })
            })
            .collect();

        (queue, MailWorkers { handles })
    }

    pub(crate) fn channel(capacity: usize) -> (Self, mpsc::Receiver<MailJob>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Enqueues a job without waiting. Returns `false` if it was dropped.
    pub fn submit(&self, job: MailJob) -> bool {
        match self.sender.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(job)) => {
                metrics::counter!("mail_jobs_dropped_total").increment(1);
                tracing::warn!(to = job.recipient(), "mail queue full, dropping job");
                false
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                metrics::counter!("mail_jobs_dropped_total").increment(1);
                tracing::warn!(to = job.recipient(), "mail queue closed, dropping job");
                false
            }
        }
    }
}

impl MailWorkers {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Waits for every worker to exit. Workers exit once every [`MailQueue`]
    /// handle is dropped and the queue is drained.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "mail worker panicked");
            }
        }
    }
}
