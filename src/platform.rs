use async_trait::async_trait;
use serde::Deserialize;

/// Seconds since the Unix epoch, as the platform reports timestamps.
pub fn now_ut() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// A user-submitted text post as the platform reports it. Read-only here.
#[derive(Debug, Clone, Deserialize)]
pub struct Document {
    pub id: String,
    pub author_name: String,
    pub body: String,
    pub created_ut: i64,
    pub permalink_path: String,
    #[serde(default)]
    pub removed: bool,
    #[serde(default)]
    pub deleted: bool,
}

impl Document {
    pub fn is_gone(&self) -> bool {
        self.removed || self.deleted
    }
}

/// Items from the bot's inbox: someone messaged the bot directly, or
/// replied to one of its comments.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InboxItem {
    DirectMessage {
        id: String,
        author_name: String,
        subject: String,
        created_ut: i64,
    },
    CommentReply {
        id: String,
        author_name: String,
        body: String,
        /// The document the conversation hangs off.
        document_id: String,
        created_ut: i64,
    },
}

impl InboxItem {
    pub fn id(&self) -> &str {
        match self {
            InboxItem::DirectMessage { id, .. } => id,
            InboxItem::CommentReply { id, .. } => id,
        }
    }

    pub fn created_ut(&self) -> i64 {
        match self {
            InboxItem::DirectMessage { created_ut, .. } => *created_ut,
            InboxItem::CommentReply { created_ut, .. } => *created_ut,
        }
    }
}

/// Remote failure taxonomy the core branches on. Everything transient is
/// logged and skipped for the cycle; `NotFound` on a recorded document means
/// the document disappeared and its record gets deactivated; `RateLimited`
/// asks the calling loop for a cooldown sleep.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("not found")]
    NotFound,
    #[error("rate limited by the platform")]
    RateLimited,
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("could not decode response: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type PlatformResult<T> = Result<T, PlatformError>;

/// What the bot needs from the remote platform. Streams are expressed as
/// repeated listing calls; the ingestion gate's dedup makes polling
/// equivalent to a stream.
#[async_trait]
pub trait Platform: Send + Sync {
    async fn fetch_document(&self, id: &str) -> PlatformResult<Document>;
    /// Newest documents in the watched feed, any order, duplicates allowed.
    async fn list_new_documents(&self, feed: &str) -> PlatformResult<Vec<Document>>;
    async fn list_inbox(&self) -> PlatformResult<Vec<InboxItem>>;
    async fn post_reply(&self, document_id: &str, body: &str) -> PlatformResult<String>;
    async fn edit_reply(&self, reply_id: &str, body: &str) -> PlatformResult<()>;
    async fn delete_reply(&self, reply_id: &str) -> PlatformResult<()>;
    /// How many child replies the bot's reply has attracted.
    async fn reply_child_count(&self, document_id: &str, reply_id: &str) -> PlatformResult<usize>;
    /// Reply to a comment in a thread (as opposed to a top-level reply on a
    /// document).
    async fn post_comment_reply(&self, comment_id: &str, body: &str) -> PlatformResult<String>;
    async fn send_message(&self, to: &str, subject: &str, body: &str) -> PlatformResult<()>;
}
