use crate::platform::{Document, InboxItem, Platform, PlatformError, PlatformResult};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

/// `Platform` implementation against the forum's JSON API.
pub struct HttpPlatform {
    client: Client,
    api_base_url: String,
}

#[derive(Deserialize)]
struct DocumentListing {
    documents: Vec<Document>,
}

#[derive(Deserialize)]
struct InboxListing {
    messages: Vec<InboxItem>,
}

#[derive(Deserialize)]
struct CreatedReply {
    id: String,
}

#[derive(Deserialize)]
struct ReplyChildren {
    child_count: usize,
}

impl HttpPlatform {
    pub fn new(api_base_url: &str, api_token: &str) -> PlatformResult<HttpPlatform> {
        let mut headers = reqwest::header::HeaderMap::new();
        if !api_token.is_empty() {
            if let Ok(mut value) =
                reqwest::header::HeaderValue::from_str(&format!("Bearer {api_token}"))
            {
                value.set_sensitive(true);
                headers.insert(reqwest::header::AUTHORIZATION, value);
            }
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("fencepost/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .build()?;

        Ok(HttpPlatform {
            client,
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base_url, path)
    }

    async fn check(&self, response: Response) -> PlatformResult<Response> {
        match response.status() {
            StatusCode::NOT_FOUND => Err(PlatformError::NotFound),
            StatusCode::TOO_MANY_REQUESTS => Err(PlatformError::RateLimited),
            status if status.is_success() => Ok(response),
            status => Err(PlatformError::Status(status.as_u16())),
        }
    }
}

#[async_trait]
impl Platform for HttpPlatform {
    async fn fetch_document(&self, id: &str) -> PlatformResult<Document> {
        let response = self
            .client
            .get(self.url(&format!("/documents/{id}")))
            .send()
            .await?;
        let response = self.check(response).await?;
        Ok(response.json().await?)
    }

    async fn list_new_documents(&self, feed: &str) -> PlatformResult<Vec<Document>> {
        let response = self
            .client
            .get(self.url(&format!("/feeds/{feed}/new")))
            .send()
            .await?;
        let response = self.check(response).await?;
        let listing: DocumentListing = response.json().await?;
        Ok(listing.documents)
    }

    async fn list_inbox(&self) -> PlatformResult<Vec<InboxItem>> {
        let response = self.client.get(self.url("/inbox")).send().await?;
        let response = self.check(response).await?;
        let listing: InboxListing = response.json().await?;
        Ok(listing.messages)
    }

    async fn post_reply(&self, document_id: &str, body: &str) -> PlatformResult<String> {
        let response = self
            .client
            .post(self.url(&format!("/documents/{document_id}/replies")))
            .json(&json!({ "body": body }))
            .send()
            .await?;
        let response = self.check(response).await?;
        let created: CreatedReply = response.json().await?;
        Ok(created.id)
    }

    async fn edit_reply(&self, reply_id: &str, body: &str) -> PlatformResult<()> {
        let response = self
            .client
            .patch(self.url(&format!("/replies/{reply_id}")))
            .json(&json!({ "body": body }))
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }

    async fn delete_reply(&self, reply_id: &str) -> PlatformResult<()> {
        let response = self
            .client
            .delete(self.url(&format!("/replies/{reply_id}")))
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }

    async fn reply_child_count(&self, document_id: &str, reply_id: &str) -> PlatformResult<usize> {
        let response = self
            .client
            .get(self.url(&format!("/documents/{document_id}/replies/{reply_id}/children")))
            .send()
            .await?;
        let response = self.check(response).await?;
        let children: ReplyChildren = response.json().await?;
        Ok(children.child_count)
    }

    async fn post_comment_reply(&self, comment_id: &str, body: &str) -> PlatformResult<String> {
        let response = self
            .client
            .post(self.url(&format!("/comments/{comment_id}/replies")))
            .json(&json!({ "body": body }))
            .send()
            .await?;
        let response = self.check(response).await?;
        let created: CreatedReply = response.json().await?;
        Ok(created.id)
    }

    async fn send_message(&self, to: &str, subject: &str, body: &str) -> PlatformResult<()> {
        let response = self
            .client
            .post(self.url("/messages"))
            .json(&json!({ "to": to, "subject": subject, "body": body }))
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }
}
