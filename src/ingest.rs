use crate::messages::{determine, MessageContext};
use crate::platform::{now_ut, Document, PlatformError};
use crate::recheck::Reconciler;
use crate::store::NewRecord;
use anyhow::Result;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::watch;

const SEEN_CAPACITY: usize = 100;
const WATERMARK_FLOOR_SECS: f64 = 10.0;
const RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(60);

/// Duplicate suppression for one feed: a bounded recently-seen id window
/// plus a monotonically advancing timestamp watermark. The watermark only
/// ever moves half the distance to a newly seen item (less a small floor),
/// which tolerates mildly out-of-order delivery without re-admitting old
/// items forever.
pub struct FeedGate {
    name: &'static str,
    seen: VecDeque<String>,
    check_time: f64,
}

impl FeedGate {
    pub fn new(name: &'static str, start_ut: f64) -> FeedGate {
        FeedGate {
            name,
            seen: VecDeque::with_capacity(SEEN_CAPACITY),
            check_time: start_ut,
        }
    }

    /// True if the item should be processed. Rejections are not errors.
    pub fn admit(&mut self, id: &str, created_ut: i64) -> bool {
        if self.seen.iter().any(|seen| seen == id) {
            log::debug!("[{}] skip: seen item: {id}", self.name);
            return false;
        }
        if (created_ut as f64) < self.check_time {
            log::debug!("[{}] skip: timestamp was supplanted: {id}", self.name);
            return false;
        }

        self.check_time += (0.5 * (created_ut as f64 - self.check_time - WATERMARK_FLOOR_SECS)).max(0.0);
        if self.seen.len() == SEEN_CAPACITY {
            self.seen.pop_front();
        }
        self.seen.push_back(id.to_string());
        true
    }

    #[cfg(test)]
    fn watermark(&self) -> f64 {
        self.check_time
    }
}

/// Classify a freshly arrived document and, when it violates, reply and
/// record it.
///
/// The record is created even when the reply post fails (reply id left
/// unset), so the recheck scheduler covers the retry.
pub async fn handle_new_document(reconciler: &Reconciler, doc: &Document) -> Result<()> {
    log::info!("found new document: {}", doc.id);

    if reconciler.store.get_by_document_id(&doc.id).await?.is_some() {
        log::debug!("document already recorded: {}", doc.id);
        return Ok(());
    }

    let flags = reconciler.rules.classify(&doc.body);
    let kind = match determine(flags) {
        None => {
            log::info!("document is OK: {}", doc.id);
            return Ok(());
        }
        Some(kind) => kind,
    };

    log::info!("document not OK, preparing to reply: {}", doc.id);
    let message = reconciler.messages.build(
        kind,
        &MessageContext {
            document_id: &doc.id,
            permalink_path: &doc.permalink_path,
            body_len: doc.body.len(),
            passing: false,
        },
    );

    let reply_id = match reconciler.platform.post_reply(&doc.id, &message).await {
        Ok(reply_id) => {
            log::info!("created reply {reply_id} on document {}", doc.id);
            Some(reply_id)
        }
        Err(err) => {
            log::error!("failed to reply to document {}: {err}", doc.id);
            None
        }
    };

    reconciler
        .store
        .create_record(NewRecord {
            document_id: doc.id.clone(),
            author_name: doc.author_name.clone(),
            reply_id,
            document_created_ut: doc.created_ut,
            current_flags: flags,
        })
        .await?;
    log::info!("added document to database: {}", doc.id);
    Ok(())
}

/// Poll the feed listing forever, routing non-duplicate documents into the
/// reply/record pipeline.
pub async fn run_ingestion(
    reconciler: Reconciler,
    feed: String,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut gate = FeedGate::new("submissions", now_ut() as f64);

    loop {
        match reconciler.platform.list_new_documents(&feed).await {
            Ok(docs) => {
                for doc in docs {
                    if !gate.admit(&doc.id, doc.created_ut) {
                        continue;
                    }
                    handle_new_document(&reconciler, &doc).await?;
                }
            }
            Err(PlatformError::RateLimited) => {
                log::info!("feed listing rate limited, cooling down");
                tokio::time::sleep(RATE_LIMIT_COOLDOWN).await;
            }
            Err(err) => {
                log::warn!("feed listing failed: {err}");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = shutdown.changed() => {
                log::info!("ingestion stopping");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{FeatureFlags, RuleSet};
    use crate::messages::MessageBuilder;
    use crate::store::{MemoryStore, RecordStore};
    use crate::testing::{document, MockPlatform};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn reconciler() -> (Arc<MockPlatform>, Arc<MemoryStore>, Reconciler) {
        let platform = Arc::new(MockPlatform::new());
        let store = Arc::new(MemoryStore::new());
        let reconciler = Reconciler {
            platform: platform.clone(),
            store: store.clone(),
            rules: Arc::new(RuleSet::new().unwrap()),
            messages: Arc::new(MessageBuilder::new("https://forum.example.com", "fencepost_bot")),
        };
        (platform, store, reconciler)
    }

    #[test]
    fn duplicate_ids_are_dropped_within_the_window() {
        let mut gate = FeedGate::new("test", 0.0);
        assert!(gate.admit("a", 50));
        assert!(!gate.admit("a", 50));

        for i in 0..SEEN_CAPACITY {
            assert!(gate.admit(&format!("filler{i}"), 50));
        }
        // "a" has been evicted by 100 fresh ids and is admitted again.
        assert!(gate.admit("a", 50));
    }

    #[test]
    fn stale_timestamps_are_dropped() {
        let mut gate = FeedGate::new("test", 100.0);
        assert!(!gate.admit("old", 99));
        assert!(gate.admit("new", 100));
    }

    #[test]
    fn watermark_advances_by_half_the_gap_minus_floor() {
        let mut gate = FeedGate::new("test", 100.0);
        assert!(gate.admit("a", 200));
        assert!((gate.watermark() - 145.0).abs() < 1e-9);

        // A small gap (below the floor) leaves the watermark alone.
        assert!(gate.admit("b", 150));
        assert!((gate.watermark() - 145.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn violating_document_gets_reply_and_record() {
        let (platform, store, reconciler) = reconciler();
        let doc = document("d1", "poster", "$x = Get-ChildItem C:\\temp\n", 100);

        handle_new_document(&reconciler, &doc).await.unwrap();

        assert_eq!(platform.post_count(), 1);
        let record = store.get_by_document_id("d1").await.unwrap().unwrap();
        assert_eq!(record.reply_id.as_deref(), Some("reply0"));
        assert!(record
            .current_flags
            .contains(FeatureFlags::CODE_OUTSIDE_OF_CODE_BLOCK));
    }

    #[tokio::test]
    async fn clean_document_creates_nothing() {
        let (platform, store, reconciler) = reconciler();
        let doc = document("d1", "poster", "how do I rename a file?\n", 100);

        handle_new_document(&reconciler, &doc).await.unwrap();

        assert_eq!(platform.post_count(), 0);
        assert!(store.get_by_document_id("d1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn record_is_created_even_when_the_post_fails() {
        let (platform, store, reconciler) = reconciler();
        platform.fail_posts.store(true, Ordering::SeqCst);
        let doc = document("d1", "poster", "$x = Get-ChildItem C:\\temp\n", 100);

        handle_new_document(&reconciler, &doc).await.unwrap();

        let record = store.get_by_document_id("d1").await.unwrap().unwrap();
        assert_eq!(record.reply_id, None);
        assert!(record.recheck_eligible, "scheduler must retry the post");
    }

    #[tokio::test]
    async fn already_recorded_document_is_skipped() {
        let (platform, _store, reconciler) = reconciler();
        let doc = document("d1", "poster", "$x = Get-ChildItem C:\\temp\n", 100);

        handle_new_document(&reconciler, &doc).await.unwrap();
        handle_new_document(&reconciler, &doc).await.unwrap();

        assert_eq!(platform.post_count(), 1);
    }
}
