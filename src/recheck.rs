use crate::classify::RuleSet;
use crate::config::RecheckConfig;
use crate::messages::{determine, MessageBuilder, MessageContext};
use crate::platform::{now_ut, Platform, PlatformError};
use crate::store::{Record, RecordStore};
use anyhow::Result;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(60);

/// What a single reconciliation pass did with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecheckOutcome {
    /// Document unchanged since the last look; nothing touched.
    Unchanged,
    /// Flags drifted; reply and stored state were brought up to date.
    Updated,
    /// Record retired (document removed, deleted or vanished).
    Deactivated,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CycleStats {
    pub total: u32,
    pub errors: u32,
}

/// The classify → determine → reply/record pipeline handle. Cheap to clone;
/// shared by the scheduler, the ingestion loop, and the command channel.
#[derive(Clone)]
pub struct Reconciler {
    pub platform: Arc<dyn Platform>,
    pub store: Arc<dyn RecordStore>,
    pub rules: Arc<RuleSet>,
    pub messages: Arc<MessageBuilder>,
}

impl Reconciler {
    /// Re-fetch one recorded document, diff its violation state against the
    /// record, and reconcile reply and stored flags.
    ///
    /// Flag persistence is always the last step: if the outbound post or
    /// edit fails, the stored flags stay stale so the next cycle retries.
    pub async fn reconcile(&self, record: &Record) -> Result<RecheckOutcome> {
        let doc = match self.platform.fetch_document(&record.document_id).await {
            Ok(doc) => doc,
            Err(PlatformError::NotFound) => {
                log::info!("document disappeared: {}", record.document_id);
                self.store.deactivate(record.id).await?;
                return Ok(RecheckOutcome::Deactivated);
            }
            Err(err) => return Err(err.into()),
        };

        if doc.is_gone() {
            log::info!("document was removed or deleted: {}", doc.id);
            self.store.deactivate(record.id).await?;
            return Ok(RecheckOutcome::Deactivated);
        }

        let new_flags = self.rules.classify(&doc.body);
        if new_flags == record.current_flags {
            log::debug!("no change in document: {}", doc.id);
            return Ok(RecheckOutcome::Unchanged);
        }
        log::info!("change detected in document: {}", doc.id);

        let new_kind = determine(new_flags);
        let old_kind = determine(record.current_flags);

        // Fall back to the old kind so a now-passing document still gets its
        // reply edited to show success.
        match new_kind.or(old_kind) {
            None => {
                log::info!("no reply update required for document: {}", doc.id);
            }
            Some(kind) => {
                let message = self.messages.build(
                    kind,
                    &MessageContext {
                        document_id: &doc.id,
                        permalink_path: &doc.permalink_path,
                        body_len: doc.body.len(),
                        passing: new_kind.is_none(),
                    },
                );

                match &record.reply_id {
                    None => {
                        let reply_id = self.platform.post_reply(&doc.id, &message).await?;
                        log::info!("created reply {reply_id} on document {}", doc.id);
                        self.store.set_reply_id(record.id, &reply_id).await?;
                    }
                    Some(reply_id) => {
                        self.platform.edit_reply(reply_id, &message).await?;
                        log::info!("updated reply {reply_id} on document {}", doc.id);
                    }
                }
            }
        }

        self.store
            .update_flags(record.id, new_flags, record.current_flags)
            .await?;
        Ok(RecheckOutcome::Updated)
    }

    /// One scheduler pass over every recheck-eligible record.
    pub async fn run_cycle(&self, cfg: &RecheckConfig) -> Result<CycleStats> {
        let mut stats = CycleStats::default();

        for record in self.store.list_eligible().await? {
            if is_expired(record.document_created_ut, now_ut(), cfg.forget_after_secs) {
                log::info!("forgetting stale record for document: {}", record.document_id);
                self.store.deactivate(record.id).await?;
                continue;
            }

            stats.total += 1;
            if let Err(err) = self.reconcile(&record).await {
                stats.errors += 1;
                log::error!("recheck failed for document {}: {err:#}", record.document_id);
                if matches!(
                    err.downcast_ref::<PlatformError>(),
                    Some(PlatformError::RateLimited)
                ) {
                    log::info!("rate limited; cooling down before the next record");
                    tokio::time::sleep(RATE_LIMIT_COOLDOWN).await;
                }
            }
        }

        Ok(stats)
    }
}

/// A record is expired strictly *past* the horizon: a document exactly
/// `forget_after` old is still rechecked.
pub(crate) fn is_expired(document_created_ut: i64, now: i64, forget_after_secs: u64) -> bool {
    now - document_created_ut > forget_after_secs as i64
}

/// Interval control: reset to base while the cycle error ratio stays at or
/// under the threshold, otherwise double up to the cap. An empty cycle
/// counts as successful.
fn next_delay(current_secs: u64, stats: &CycleStats, cfg: &RecheckConfig) -> u64 {
    let successful = stats.total == 0
        || (stats.errors as f64 / stats.total as f64) <= cfg.failure_threshold;
    if successful {
        cfg.base_poll_interval_secs
    } else if current_secs < cfg.max_poll_interval_secs {
        (current_secs * cfg.backoff_factor).min(cfg.max_poll_interval_secs)
    } else {
        current_secs
    }
}

/// Symmetric uniform jitter to keep many bot instances from polling in
/// lockstep.
fn jittered(delay_secs: u64, jitter_factor: f64) -> Duration {
    let delay = delay_secs as f64;
    let lo = delay * (1.0 - jitter_factor);
    let hi = delay * (1.0 + jitter_factor);
    let t = if hi > lo {
        rand::thread_rng().gen_range(lo..=hi)
    } else {
        delay
    };
    Duration::from_secs_f64(t.max(0.0))
}

/// Poll forever: reconcile every eligible record, tune the interval from the
/// cycle's error ratio, sleep with jitter. Ends only on shutdown.
pub async fn run_scheduler(
    reconciler: Reconciler,
    cfg: RecheckConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut delay = cfg.base_poll_interval_secs;

    loop {
        let stats = reconciler.run_cycle(&cfg).await?;
        delay = next_delay(delay, &stats, &cfg);
        let sleep = jittered(delay, cfg.jitter_factor);
        log::debug!(
            "recheck cycle done ({} records, {} errors), sleeping {sleep:?}",
            stats.total,
            stats.errors
        );

        tokio::select! {
            _ = tokio::time::sleep(sleep) => {}
            _ = shutdown.changed() => {
                log::info!("recheck scheduler stopping");
                return Ok(());
            }
        }
    }
}
