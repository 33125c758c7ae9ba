use crate::messages::determine;
use crate::recheck::Reconciler;
use anyhow::Result;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

const BUCKET_CAPACITY: f64 = 5.0;
const BUCKET_FILL_RATE: f64 = 1.0;
pub const QUEUE_CAPACITY: usize = 5;

/// Classic token bucket over a monotonic clock. Starts full.
pub struct TokenBucket {
    capacity: f64,
    fill_rate: f64,
    value: f64,
    last: Instant,
}

impl TokenBucket {
    pub fn new(capacity: f64, fill_rate: f64) -> TokenBucket {
        TokenBucket {
            capacity,
            fill_rate,
            value: capacity,
            last: Instant::now(),
        }
    }

    fn replenish(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.value = (self.value + elapsed * self.fill_rate).min(self.capacity);
        self.last = now;
    }

    /// How long to wait before `n` tokens will be available.
    pub fn cooldown(&mut self, n: f64) -> Duration {
        self.replenish();
        if self.value >= n {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((n - self.value) / self.fill_rate)
        }
    }

    pub fn consume(&mut self, n: f64) {
        self.replenish();
        self.value -= n;
    }
}

/// A comment reply that may deserve a throttled follow-up.
#[derive(Debug, Clone)]
pub struct FollowupJob {
    pub comment_id: String,
    pub document_id: String,
}

/// Producer side of the bounded follow-up queue. Backpressure is by drop:
/// a full queue silently discards the job.
#[derive(Clone)]
pub struct FollowupQueue {
    tx: mpsc::Sender<FollowupJob>,
}

impl FollowupQueue {
    pub fn new() -> (FollowupQueue, mpsc::Receiver<FollowupJob>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        (FollowupQueue { tx }, rx)
    }

    pub fn offer(&self, job: FollowupJob) {
        if self.tx.try_send(job).is_err() {
            log::debug!("follow-up queue full, dropping job");
        }
    }
}

/// Pull one job at a time, pay the bucket's cooldown before each outbound
/// action, re-reconcile the record, and nudge the commenter when the
/// document still fails.
pub async fn run_worker(
    reconciler: Reconciler,
    mut rx: mpsc::Receiver<FollowupJob>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut bucket = TokenBucket::new(BUCKET_CAPACITY, BUCKET_FILL_RATE);

    loop {
        let job = tokio::select! {
            job = rx.recv() => match job {
                Some(job) => job,
                None => return Ok(()),
            },
            _ = shutdown.changed() => {
                log::info!("follow-up worker stopping");
                return Ok(());
            }
        };

        tokio::time::sleep(bucket.cooldown(1.0)).await;
        bucket.consume(1.0);

        log::info!("handling follow-up for comment: {}", job.comment_id);

        let record = match reconciler.store.get_by_document_id(&job.document_id).await? {
            Some(record) => record,
            None => {
                log::debug!("no record for document: {}", job.document_id);
                continue;
            }
        };

        if let Err(err) = reconciler.reconcile(&record).await {
            log::error!("recheck during follow-up failed: {err:#}");
        }

        let record = match reconciler.store.get_by_document_id(&job.document_id).await? {
            Some(record) => record,
            None => continue,
        };
        let kind = match determine(record.current_flags) {
            Some(kind) => kind,
            None => {
                log::info!("document passes now, no follow-up needed: {}", job.document_id);
                continue;
            }
        };

        let doc = match reconciler.platform.fetch_document(&record.document_id).await {
            Ok(doc) => doc,
            Err(err) => {
                log::error!("failed to fetch document for follow-up: {err}");
                continue;
            }
        };
        let text = reconciler.messages.followup(kind, &doc.permalink_path);
        match reconciler.platform.post_comment_reply(&job.comment_id, &text).await {
            Ok(id) => log::info!("posted follow-up reply: {id}"),
            Err(err) => log::error!("failed to post follow-up reply: {err}"),
        }
    }
}
