//! HTTP clients for the external services the pipeline talks to: the
//! tracker API, the embedding service, and the vector index.
//!
//! Every client maps HTTP failures onto the engine's error taxonomy:
//! 429 → rate limited, 404 → not found, 401/403 → fatal configuration,
//! 5xx and transport errors → transient.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use uuid::Uuid;

use sync_core::kernel::pipeline::embed::{Embedder, VectorIndex};
use sync_core::kernel::pipeline::extract::{SourceClient, SourceItem, SourcePage};
use sync_core::kernel::pipeline::message::EntityKind;
use sync_core::SyncError;

fn map_status(status: StatusCode, context: &str) -> SyncError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => SyncError::RateLimited(context.to_string()),
        StatusCode::NOT_FOUND => SyncError::NotFound(context.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            SyncError::FatalConfig(format!("{context}: {status}"))
        }
        _ => SyncError::Transient(format!("{context}: {status}")),
    }
}

fn map_transport(err: reqwest::Error, context: &str) -> SyncError {
    SyncError::Transient(format!("{context}: {err}"))
}

// ============================================================================
// Tracker API
// ============================================================================

#[derive(Debug, Deserialize)]
struct ListedItem {
    id: String,
    #[serde(default)]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    items: Vec<ListedItem>,
    #[serde(default)]
    next_cursor: Option<String>,
}

fn parse_kind(kind: Option<&str>) -> EntityKind {
    match kind {
        Some("merge_request") => EntityKind::MergeRequest,
        Some("repository") => EntityKind::Repository,
        _ => EntityKind::Issue,
    }
}

pub struct HttpSourceClient {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
}

impl HttpSourceClient {
    pub fn new(http: reqwest::Client, base: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http,
            base: base.into(),
            token,
        }
    }

    fn request(&self, url: String) -> reqwest::RequestBuilder {
        let mut req = self.http.get(url);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        req
    }
}

#[async_trait]
impl SourceClient for HttpSourceClient {
    async fn list(
        &self,
        since: Option<DateTime<Utc>>,
        cursor: Option<&str>,
    ) -> Result<SourcePage, SyncError> {
        let mut req = self.request(format!("{}/items", self.base));
        if let Some(since) = since {
            req = req.query(&[("updated_since", since.to_rfc3339())]);
        }
        if let Some(cursor) = cursor {
            req = req.query(&[("cursor", cursor)]);
        }

        let response = req
            .send()
            .await
            .map_err(|e| map_transport(e, "listing tracker items"))?;
        if !response.status().is_success() {
            return Err(map_status(response.status(), "listing tracker items"));
        }

        let body: ListResponse = response
            .json()
            .await
            .map_err(|e| map_transport(e, "decoding tracker list"))?;
        Ok(SourcePage {
            items: body
                .items
                .into_iter()
                .map(|item| SourceItem {
                    external_id: item.id,
                    entity_kind: parse_kind(item.kind.as_deref()),
                })
                .collect(),
            next_cursor: body.next_cursor,
        })
    }

    async fn fetch_detail(&self, external_id: &str) -> Result<serde_json::Value, SyncError> {
        let response = self
            .request(format!("{}/items/{external_id}", self.base))
            .send()
            .await
            .map_err(|e| map_transport(e, "fetching tracker item"))?;
        if !response.status().is_success() {
            return Err(map_status(
                response.status(),
                &format!("fetching tracker item {external_id}"),
            ));
        }
        response
            .json()
            .await
            .map_err(|e| map_transport(e, "decoding tracker item"))
    }
}

// ============================================================================
// Embedding service
// ============================================================================

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

pub struct HttpEmbedder {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpEmbedder {
    pub fn new(http: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, SyncError> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(&serde_json::json!({ "input": text }))
            .send()
            .await
            .map_err(|e| map_transport(e, "embedding request"))?;
        if !response.status().is_success() {
            return Err(map_status(response.status(), "embedding request"));
        }
        let body: EmbedResponse = response
            .json()
            .await
            .map_err(|e| map_transport(e, "decoding embedding"))?;
        Ok(body.embedding)
    }
}

// ============================================================================
// Vector index
// ============================================================================

pub struct HttpVectorIndex {
    http: reqwest::Client,
    base: String,
}

impl HttpVectorIndex {
    pub fn new(http: reqwest::Client, base: impl Into<String>) -> Self {
        Self {
            http,
            base: base.into(),
        }
    }
}

#[async_trait]
impl VectorIndex for HttpVectorIndex {
    async fn upsert(
        &self,
        collection: &str,
        point_id: Uuid,
        vector: &[f32],
        payload: serde_json::Value,
    ) -> Result<(), SyncError> {
        let body = serde_json::json!({
            "points": [{
                "id": point_id,
                "vector": vector,
                "payload": payload,
            }]
        });
        let response = self
            .http
            .put(format!("{}/collections/{collection}/points", self.base))
            .json(&body)
            .send()
            .await
            .map_err(|e| map_transport(e, "vector upsert"))?;
        if !response.status().is_success() {
            return Err(map_status(response.status(), "vector upsert"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_statuses_map_onto_the_error_taxonomy() {
        assert!(matches!(
            map_status(StatusCode::TOO_MANY_REQUESTS, "x"),
            SyncError::RateLimited(_)
        ));
        assert!(matches!(
            map_status(StatusCode::NOT_FOUND, "x"),
            SyncError::NotFound(_)
        ));
        assert!(matches!(
            map_status(StatusCode::UNAUTHORIZED, "x"),
            SyncError::FatalConfig(_)
        ));
        assert!(matches!(
            map_status(StatusCode::BAD_GATEWAY, "x"),
            SyncError::Transient(_)
        ));
    }

    #[test]
    fn unknown_kinds_default_to_issue() {
        assert_eq!(parse_kind(Some("merge_request")), EntityKind::MergeRequest);
        assert_eq!(parse_kind(Some("something_new")), EntityKind::Issue);
        assert_eq!(parse_kind(None), EntityKind::Issue);
    }
}
