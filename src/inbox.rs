use crate::config::Config;
use crate::platform::{now_ut, InboxItem, PlatformError};
use crate::recheck::Reconciler;
use crate::throttle::{FollowupJob, FollowupQueue};
use anyhow::Result;
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

lazy_static! {
    static ref DELETE_COMMAND: Regex =
        Regex::new(r"(?i)^!delete[ +]+(?:(doc)_)?([a-z0-9]{1,12})$").unwrap();
    static ref RECHECK_COMMAND: Regex =
        Regex::new(r"(?i)^!recheck +(?:([a-z]{1,8})_)?([a-z0-9]{1,12})$").unwrap();
    static ref PING_COMMAND: Regex = Regex::new(r"(?i)^!ping *$").unwrap();
    static ref GOOD_BEING: Regex = Regex::new(r"(?i)^Good (\w+)\.?$").unwrap();
}

/// Thing-kind accepted by the recheck command.
const DOCUMENT_KIND: &str = "doc";
/// Direct messages older than this are assumed re-delivered and ignored.
const IGNORE_MESSAGES_OLDER_THAN_SECS: i64 = 2 * 60;
/// Comment replies longer than this never get a follow-up.
const MAX_FOLLOWUP_COMMENT_LEN: usize = 110;
const RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(60);

/// Parses and executes the bot's inbound command grammar.
pub struct InboxHandler {
    reconciler: Reconciler,
    config: Arc<Config>,
    followups: Option<FollowupQueue>,
}

impl InboxHandler {
    pub fn new(
        reconciler: Reconciler,
        config: Arc<Config>,
        followups: Option<FollowupQueue>,
    ) -> InboxHandler {
        InboxHandler {
            reconciler,
            config,
            followups,
        }
    }

    pub async fn handle(&self, item: &InboxItem) -> Result<()> {
        match item {
            InboxItem::DirectMessage {
                id,
                author_name,
                subject,
                created_ut,
            } => {
                self.handle_direct_message(id, author_name, subject, *created_ut)
                    .await
            }
            InboxItem::CommentReply {
                id,
                body,
                document_id,
                ..
            } => self.handle_comment_reply(id, body, document_id).await,
        }
    }

    async fn handle_direct_message(
        &self,
        id: &str,
        author_name: &str,
        subject: &str,
        created_ut: i64,
    ) -> Result<()> {
        log::info!("direct message from {author_name}: {id}");

        if now_ut() - created_ut > IGNORE_MESSAGES_OLDER_THAN_SECS {
            log::info!("skip: message is stale: {id}");
            return Ok(());
        }

        if PING_COMMAND.is_match(subject) {
            log::info!("ping from {author_name}");
            if let Err(err) = self
                .reconciler
                .platform
                .send_message(author_name, &format!("re: {subject}"), "pong")
                .await
            {
                log::error!("failed to return ping: {err}");
            }
            return Ok(());
        }

        if let Some(caps) = DELETE_COMMAND.captures(subject) {
            let document_id = &caps[2];
            return self.handle_delete(author_name, document_id).await;
        }

        if let Some(caps) = RECHECK_COMMAND.captures(subject) {
            let kind = caps.get(1).map(|m| m.as_str().to_ascii_lowercase());
            let document_id = &caps[2];
            return self.handle_recheck(author_name, kind.as_deref(), document_id).await;
        }

        log::info!("skip: message is not a command: {id}");
        Ok(())
    }

    /// Trustees may force-delete; everyone else must be the document author,
    /// and the reply must be childless and still marked deletable.
    async fn handle_delete(&self, requester: &str, document_id: &str) -> Result<()> {
        log::info!("deletion request from {requester} on document: {document_id}");

        let record = match self.reconciler.store.get_by_document_id(document_id).await? {
            Some(record) => record,
            None => {
                log::info!("skip: document not recorded: {document_id}");
                return Ok(());
            }
        };
        let reply_id = match &record.reply_id {
            Some(reply_id) => reply_id.clone(),
            None => {
                log::info!("skip: no reply exists on document: {document_id}");
                return Ok(());
            }
        };

        if self.config.is_trustee(requester) {
            if let Err(err) = self.reconciler.platform.delete_reply(&reply_id).await {
                log::error!("failed to force-delete reply {reply_id}: {err}");
                return Ok(());
            }
            self.reconciler.store.deactivate(record.id).await?;
            log::info!("force-deleted reply {reply_id} on document {document_id}");
            return Ok(());
        }

        if !requester.eq_ignore_ascii_case(&record.author_name) {
            log::info!("skip: {requester} may not delete the reply on {document_id}");
            return Ok(());
        }

        let children = match self
            .reconciler
            .platform
            .reply_child_count(document_id, &reply_id)
            .await
        {
            Ok(children) => children,
            Err(PlatformError::NotFound) => {
                log::info!("reply no longer exists: {reply_id}");
                return Ok(());
            }
            Err(err) => {
                log::error!("failed to inspect reply {reply_id}: {err}");
                return Ok(());
            }
        };
        if children > 0 {
            log::info!("skip: reply has replies of its own: {reply_id}");
            self.reconciler.store.set_deletable_false(record.id).await?;
            return Ok(());
        }
        if !record.deletable {
            log::info!("skip: record is not deletable: {document_id}");
            return Ok(());
        }

        if let Err(err) = self.reconciler.platform.delete_reply(&reply_id).await {
            log::error!("failed to delete reply {reply_id}: {err}");
            return Ok(());
        }
        self.reconciler.store.deactivate(record.id).await?;
        log::info!("deleted reply {reply_id} on document {document_id}");
        Ok(())
    }

    async fn handle_recheck(
        &self,
        requester: &str,
        kind: Option<&str>,
        document_id: &str,
    ) -> Result<()> {
        log::info!("recheck request from {requester} on: {document_id}");

        if !self.config.is_trustee(requester) {
            log::info!("skip: {requester} is not authorized to request rechecks");
            return Ok(());
        }
        if kind != Some(DOCUMENT_KIND) {
            log::info!("skip: recheck target kind must be {DOCUMENT_KIND:?}, got {kind:?}");
            return Ok(());
        }

        let record = match self.reconciler.store.get_by_document_id(document_id).await? {
            Some(record) => record,
            None => {
                log::info!("skip: document not recorded: {document_id}");
                return Ok(());
            }
        };

        match self.reconciler.reconcile(&record).await {
            Ok(outcome) => log::info!("manual recheck of {document_id}: {outcome:?}"),
            Err(err) => log::error!("manual recheck of {document_id} failed: {err:#}"),
        }
        Ok(())
    }

    async fn handle_comment_reply(&self, id: &str, body: &str, document_id: &str) -> Result<()> {
        log::info!("comment reply received: {id}");

        if let Some(word) = good_being_word(body) {
            if !word.eq_ignore_ascii_case("bot") {
                return Ok(());
            }
            // Skip a fraction of acknowledgments so the bot doesn't answer
            // like clockwork.
            if rand::random::<f64>() < ACKNOWLEDGMENT_SKIP_PROBABILITY {
                return Ok(());
            }
            log::info!("acknowledging comment: {id}");
            let text = self.reconciler.messages.acknowledgment();
            if let Err(err) = self.reconciler.platform.post_comment_reply(id, &text).await {
                log::error!("failed to acknowledge comment {id}: {err}");
            }
            return Ok(());
        }

        if let Some(queue) = &self.followups {
            if body.len() > MAX_FOLLOWUP_COMMENT_LEN {
                log::info!("comment too long for a follow-up: {id}");
                return Ok(());
            }
            queue.offer(FollowupJob {
                comment_id: id.to_string(),
                document_id: document_id.to_string(),
            });
        }
        Ok(())
    }
}

const ACKNOWLEDGMENT_SKIP_PROBABILITY: f64 = 0.3;

fn good_being_word(body: &str) -> Option<&str> {
    GOOD_BEING
        .captures(body)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Poll the inbox forever, de-duplicating with a feed gate and dispatching
/// each fresh item to the handler.
pub async fn run_inbox(
    handler: InboxHandler,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut gate = crate::ingest::FeedGate::new("inbox", now_ut() as f64);

    loop {
        match handler.reconciler.platform.list_inbox().await {
            Ok(items) => {
                for item in items {
                    if !gate.admit(item.id(), item.created_ut()) {
                        continue;
                    }
                    handler.handle(&item).await?;
                }
            }
            Err(PlatformError::RateLimited) => {
                log::info!("inbox listing rate limited, cooling down");
                tokio::time::sleep(RATE_LIMIT_COOLDOWN).await;
            }
            Err(err) => {
                log::warn!("inbox listing failed: {err}");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = shutdown.changed() => {
                log::info!("inbox monitor stopping");
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
    use crate::store::{MemoryStore, NewRecord, RecordStore};
    use crate::testing::{document, MockPlatform};

    struct Harness {
        platform: Arc<MockPlatform>,
        store: Arc<MemoryStore>,
        handler: InboxHandler,
    }

    fn harness(followups: Option<FollowupQueue>) -> Harness {
        let platform = Arc::new(MockPlatform::new());
        let store = Arc::new(MemoryStore::new());
        let reconciler = Reconciler {
            platform: platform.clone(),
            store: store.clone(),
            rules: Arc::new(RuleSet::new().unwrap()),
            messages: Arc::new(MessageBuilder::new("https://forum.example.com", "fencepost_bot")),
        };
        let handler = InboxHandler::new(reconciler, Arc::new(Config::default()), followups);
        Harness {
            platform,
            store,
            handler,
        }
    }

    async fn seed_record(h: &Harness, document_id: &str, author: &str, reply_id: Option<&str>) {
        h.store
            .create_record(NewRecord {
                document_id: document_id.to_string(),
                author_name: author.to_string(),
                reply_id: reply_id.map(str::to_string),
                document_created_ut: now_ut(),
                current_flags: FeatureFlags::CODE_OUTSIDE_OF_CODE_BLOCK,
            })
            .await
            .unwrap();
    }

    fn direct_message(author: &str, subject: &str) -> InboxItem {
        InboxItem::DirectMessage {
            id: "m1".to_string(),
            author_name: author.to_string(),
            subject: subject.to_string(),
            created_ut: now_ut(),
        }
    }

    #[test]
    fn command_grammar() {
        assert!(DELETE_COMMAND.is_match("!delete abc123"));
        assert!(DELETE_COMMAND.is_match("!DELETE + abc123"));
        assert!(DELETE_COMMAND.is_match("!delete doc_abc123"));
        assert!(!DELETE_COMMAND.is_match("!delete reply_abc123"));
        assert!(!DELETE_COMMAND.is_match("!delete abc123 extra"));
        assert!(!DELETE_COMMAND.is_match("!delete averylongidentifier"));

        assert!(RECHECK_COMMAND.is_match("!recheck doc_abc123"));
        assert!(RECHECK_COMMAND.is_match("!recheck abc123"));
        assert!(!RECHECK_COMMAND.is_match("!recheckabc123"));

        assert!(PING_COMMAND.is_match("!ping"));
        assert!(PING_COMMAND.is_match("!PING  "));
        assert!(!PING_COMMAND.is_match("!ping pong"));
    }

    #[test]
    fn good_being_extraction() {
        assert_eq!(good_being_word("Good bot."), Some("bot"));
        assert_eq!(good_being_word("good BOT"), Some("BOT"));
        assert_eq!(good_being_word("Good human"), Some("human"));
        assert_eq!(good_being_word("Good bot, thanks"), None);
    }

    #[tokio::test]
    async fn ping_is_always_answered() {
        let h = harness(None);
        h.handler
            .handle(&direct_message("anyone", "!ping"))
            .await
            .unwrap();
        let sent = h.platform.sent_messages.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "anyone");
        assert_eq!(sent[0].2, "pong");
    }

    #[tokio::test]
    async fn stale_direct_messages_are_ignored() {
        let h = harness(None);
        let item = InboxItem::DirectMessage {
            id: "m1".to_string(),
            author_name: "anyone".to_string(),
            subject: "!ping".to_string(),
            created_ut: now_ut() - 300,
        };
        h.handler.handle(&item).await.unwrap();
        assert!(h.platform.sent_messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_denied_for_unrelated_user() {
        let h = harness(None);
        seed_record(&h, "d1", "poster", Some("r1")).await;

        h.handler
            .handle(&direct_message("stranger", "!delete d1"))
            .await
            .unwrap();

        assert!(h.platform.deleted.lock().unwrap().is_empty());
        let record = h.store.get_by_document_id("d1").await.unwrap().unwrap();
        assert!(record.recheck_eligible, "record must be unchanged");
    }

    #[tokio::test]
    async fn author_may_delete_childless_reply() {
        let h = harness(None);
        seed_record(&h, "d1", "poster", Some("r1")).await;

        h.handler
            .handle(&direct_message("Poster", "!delete d1"))
            .await
            .unwrap();

        assert_eq!(h.platform.deleted.lock().unwrap().as_slice(), ["r1"]);
        let record = h.store.get_by_document_id("d1").await.unwrap().unwrap();
        assert!(!record.recheck_eligible);
    }

    #[tokio::test]
    async fn replies_with_children_are_protected() {
        let h = harness(None);
        seed_record(&h, "d1", "poster", Some("r1")).await;
        h.platform.child_counts.lock().unwrap().insert("r1".to_string(), 2);

        h.handler
            .handle(&direct_message("poster", "!delete d1"))
            .await
            .unwrap();

        assert!(h.platform.deleted.lock().unwrap().is_empty());
        let record = h.store.get_by_document_id("d1").await.unwrap().unwrap();
        assert!(!record.deletable, "child replies mark the record undeletable");
        assert!(record.recheck_eligible);
    }

    #[tokio::test]
    async fn trustee_force_deletes_despite_children() {
        let h = harness(None);
        seed_record(&h, "d1", "poster", Some("r1")).await;
        h.platform.child_counts.lock().unwrap().insert("r1".to_string(), 2);

        h.handler
            .handle(&direct_message("forum_owner", "!delete d1"))
            .await
            .unwrap();

        assert_eq!(h.platform.deleted.lock().unwrap().as_slice(), ["r1"]);
        let record = h.store.get_by_document_id("d1").await.unwrap().unwrap();
        assert!(!record.recheck_eligible);
    }

    #[tokio::test]
    async fn delete_without_reply_is_a_no_op() {
        let h = harness(None);
        seed_record(&h, "d1", "poster", None).await;

        h.handler
            .handle(&direct_message("poster", "!delete d1"))
            .await
            .unwrap();

        assert!(h.platform.deleted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn recheck_requires_a_trustee() {
        let h = harness(None);
        h.platform
            .put_document(document("d1", "poster", "    fixed\n", now_ut()));
        seed_record(&h, "d1", "poster", Some("r1")).await;

        h.handler
            .handle(&direct_message("stranger", "!recheck doc_d1"))
            .await
            .unwrap();
        assert_eq!(h.platform.edit_count(), 0);
    }

    #[tokio::test]
    async fn recheck_requires_the_document_kind() {
        let h = harness(None);
        h.platform
            .put_document(document("d1", "poster", "    fixed\n", now_ut()));
        seed_record(&h, "d1", "poster", Some("r1")).await;

        h.handler
            .handle(&direct_message("forum_owner", "!recheck d1"))
            .await
            .unwrap();
        assert_eq!(h.platform.edit_count(), 0);
    }

    #[tokio::test]
    async fn trustee_recheck_reconciles_the_record() {
        let h = harness(None);
        // The document was fixed; a manual recheck should edit the reply to
        // the passing state.
        h.platform
            .put_document(document("d1", "poster", "    $x = 1\n", now_ut()));
        seed_record(&h, "d1", "poster", Some("r1")).await;

        h.handler
            .handle(&direct_message("forum_owner", "!recheck doc_d1"))
            .await
            .unwrap();

        assert_eq!(h.platform.edit_count(), 1);
        let record = h.store.get_by_document_id("d1").await.unwrap().unwrap();
        assert_eq!(record.current_flags, FeatureFlags::CONTAINS_CODE_BLOCK);
    }

    #[tokio::test]
    async fn short_comment_replies_enter_the_followup_queue() {
        let (queue, mut rx) = FollowupQueue::new();
        let h = harness(Some(queue));

        let item = InboxItem::CommentReply {
            id: "c1".to_string(),
            author_name: "someone".to_string(),
            body: "what does this mean?".to_string(),
            document_id: "d1".to_string(),
            created_ut: now_ut(),
        };
        h.handler.handle(&item).await.unwrap();

        let job = rx.try_recv().unwrap();
        assert_eq!(job.comment_id, "c1");
        assert_eq!(job.document_id, "d1");
    }

    #[tokio::test]
    async fn long_comment_replies_are_not_queued() {
        let (queue, mut rx) = FollowupQueue::new();
        let h = harness(Some(queue));

        let item = InboxItem::CommentReply {
            id: "c1".to_string(),
            author_name: "someone".to_string(),
            body: "x".repeat(200),
            document_id: "d1".to_string(),
            created_ut: now_ut(),
        };
        h.handler.handle(&item).await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
