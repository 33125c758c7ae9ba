//! Test doubles shared by the unit tests. Compiled only for `cfg(test)`.

use crate::platform::{Document, InboxItem, Platform, PlatformError, PlatformResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Scriptable in-memory platform. Documents are keyed by id; outbound calls
/// are recorded so tests can assert on side effects.
#[derive(Default)]
pub struct MockPlatform {
    pub documents: Mutex<HashMap<String, Document>>,
    pub inbox: Mutex<Vec<InboxItem>>,
    pub child_counts: Mutex<HashMap<String, usize>>,
    pub fail_posts: AtomicBool,
    pub fail_edits: AtomicBool,
    pub posted: Mutex<Vec<(String, String)>>,
    pub edited: Mutex<Vec<(String, String)>>,
    pub deleted: Mutex<Vec<String>>,
    pub comment_replies: Mutex<Vec<(String, String)>>,
    pub sent_messages: Mutex<Vec<(String, String, String)>>,
    reply_seq: AtomicUsize,
}

impl MockPlatform {
    pub fn new() -> MockPlatform {
        MockPlatform::default()
    }

    pub fn put_document(&self, doc: Document) {
        self.documents.lock().unwrap().insert(doc.id.clone(), doc);
    }

    pub fn post_count(&self) -> usize {
        self.posted.lock().unwrap().len()
    }

    pub fn edit_count(&self) -> usize {
        self.edited.lock().unwrap().len()
    }

    pub fn outbound_count(&self) -> usize {
        self.post_count() + self.edit_count() + self.deleted.lock().unwrap().len()
    }
}

#[async_trait]
impl Platform for MockPlatform {
    async fn fetch_document(&self, id: &str) -> PlatformResult<Document> {
        self.documents
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or(PlatformError::NotFound)
    }

    async fn list_new_documents(&self, _feed: &str) -> PlatformResult<Vec<Document>> {
        Ok(self.documents.lock().unwrap().values().cloned().collect())
    }

    async fn list_inbox(&self) -> PlatformResult<Vec<InboxItem>> {
        Ok(self.inbox.lock().unwrap().clone())
    }

    async fn post_reply(&self, document_id: &str, body: &str) -> PlatformResult<String> {
        if self.fail_posts.load(Ordering::SeqCst) {
            return Err(PlatformError::Status(500));
        }
        self.posted
            .lock()
            .unwrap()
            .push((document_id.to_string(), body.to_string()));
        let n = self.reply_seq.fetch_add(1, Ordering::SeqCst);
        Ok(format!("reply{n}"))
    }

    async fn edit_reply(&self, reply_id: &str, body: &str) -> PlatformResult<()> {
        if self.fail_edits.load(Ordering::SeqCst) {
            return Err(PlatformError::Status(500));
        }
        self.edited
            .lock()
            .unwrap()
            .push((reply_id.to_string(), body.to_string()));
        Ok(())
    }

    async fn delete_reply(&self, reply_id: &str) -> PlatformResult<()> {
        self.deleted.lock().unwrap().push(reply_id.to_string());
        Ok(())
    }

    async fn reply_child_count(&self, _document_id: &str, reply_id: &str) -> PlatformResult<usize> {
        Ok(*self.child_counts.lock().unwrap().get(reply_id).unwrap_or(&0))
    }

    async fn post_comment_reply(&self, comment_id: &str, body: &str) -> PlatformResult<String> {
        self.comment_replies
            .lock()
            .unwrap()
            .push((comment_id.to_string(), body.to_string()));
        Ok("ack0".to_string())
    }

    async fn send_message(&self, to: &str, subject: &str, body: &str) -> PlatformResult<()> {
        self.sent_messages.lock().unwrap().push((
            to.to_string(),
            subject.to_string(),
            body.to_string(),
        ));
        Ok(())
    }
}

pub fn document(id: &str, author: &str, body: &str, created_ut: i64) -> Document {
    Document {
        id: id.to_string(),
        author_name: author.to_string(),
        body: body.to_string(),
        created_ut,
        permalink_path: format!("/p/{id}/"),
        removed: false,
        deleted: false,
    }
}
