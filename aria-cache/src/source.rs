//! Remote source of truth
//!
//! The cache trusts this collaborator unconditionally once it responds.
//! Only the call/response contract lives here; transport auth and
//! transport-level retry are out of scope.

use aria_common::{Error, Kind, Result};
use futures::future::BoxFuture;
use serde_json::Value;
use std::time::Duration;

/// Authoritative entity API. Dyn-safe so the session can hold
/// `Arc<dyn RemoteSource>` over any backing implementation (HTTP client,
/// test double).
pub trait RemoteSource: Send + Sync {
    /// Batch read. The result aligns with `ids`: `None` marks an id the
    /// source does not know (404-equivalent), never a batch-wide error.
    fn get_by_ids(&self, kind: Kind, ids: Vec<i64>) -> BoxFuture<'_, Result<Vec<Option<Value>>>>;

    /// Create an entity; returns the canonical metadata on success.
    fn create_entity(&self, kind: Kind, id: i64, payload: Value) -> BoxFuture<'_, Result<Value>>;

    /// Mutate an entity; returns the canonical metadata on success.
    fn update_entity(&self, kind: Kind, id: i64, payload: Value) -> BoxFuture<'_, Result<Value>>;

    /// Delete an entity; returns the canonical (final) metadata.
    fn delete_entity(&self, kind: Kind, id: i64) -> BoxFuture<'_, Result<Value>>;
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP implementation of [`RemoteSource`].
///
/// Endpoint shape: `GET {base}/{kind}?ids=1,2,3` returning a JSON array
/// aligned with the requested ids (`null` per unknown id);
/// `POST {base}/{kind}`, `PUT`/`DELETE {base}/{kind}/{id}` returning the
/// canonical entity object.
pub struct HttpSource {
    base_url: String,
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn segment(kind: Kind) -> &'static str {
        match kind {
            Kind::Track => "tracks",
            Kind::Collection => "collections",
            Kind::User => "users",
        }
    }

    fn map_transport_error(e: reqwest::Error) -> Error {
        if e.is_timeout() || e.is_connect() {
            Error::TransientNetwork(e.to_string())
        } else {
            Error::Internal(e.to_string())
        }
    }

    fn map_status(kind: Kind, id: i64, status: reqwest::StatusCode, body: String) -> Error {
        match status.as_u16() {
            404 => Error::NotFound { kind, id },
            400 | 422 => Error::Validation(body),
            409 => Error::Conflict(body),
            s if status.is_server_error() => {
                Error::TransientNetwork(format!("source returned {s}: {body}"))
            }
            s => Error::Internal(format!("source returned {s}: {body}")),
        }
    }

    async fn send_mutation(
        &self,
        request: reqwest::RequestBuilder,
        kind: Kind,
        id: i64,
    ) -> Result<Value> {
        let response = request.send().await.map_err(Self::map_transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::map_status(kind, id, status, body));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| Error::Internal(format!("Malformed canonical response: {e}")))
    }
}

impl RemoteSource for HttpSource {
    fn get_by_ids(&self, kind: Kind, ids: Vec<i64>) -> BoxFuture<'_, Result<Vec<Option<Value>>>> {
        Box::pin(async move {
            let joined = ids
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(",");
            let url = format!("{}/{}?ids={}", self.base_url, Self::segment(kind), joined);
            tracing::debug!(%kind, count = ids.len(), %url, "Fetching batch from source");

            let response = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(Self::map_transport_error)?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(Self::map_status(kind, 0, status, body));
            }
            let values: Vec<Option<Value>> = response
                .json()
                .await
                .map_err(|e| Error::Internal(format!("Malformed batch response: {e}")))?;
            if values.len() != ids.len() {
                return Err(Error::Internal(format!(
                    "source returned {} entries for {} ids",
                    values.len(),
                    ids.len()
                )));
            }
            Ok(values)
        })
    }

    fn create_entity(&self, kind: Kind, id: i64, payload: Value) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let url = format!("{}/{}", self.base_url, Self::segment(kind));
            tracing::debug!(%kind, id, "Creating entity at source");
            self.send_mutation(self.client.post(&url).json(&payload), kind, id)
                .await
        })
    }

    fn update_entity(&self, kind: Kind, id: i64, payload: Value) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let url = format!("{}/{}/{}", self.base_url, Self::segment(kind), id);
            tracing::debug!(%kind, id, "Updating entity at source");
            self.send_mutation(self.client.put(&url).json(&payload), kind, id)
                .await
        })
    }

    fn delete_entity(&self, kind: Kind, id: i64) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let url = format!("{}/{}/{}", self.base_url, Self::segment(kind), id);
            tracing::debug!(%kind, id, "Deleting entity at source");
            self.send_mutation(self.client.delete(&url), kind, id).await
        })
    }
}
