//! Remote resource abstraction for the directory API and the error-report sink.
//!
//! `RemoteResourceClient` lets the coordinator and the telemetry buffer work
//! against the real HTTP API (`HttpClient`) or the in-memory `MockClient`.

use std::future::Future;
use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::Error;
use crate::model::{Directory, DirectoryCreate, DirectoryUpdate};
use crate::telemetry::ErrorEntry;

/// Client-side timeout applied to every request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const DIRECTORIES_PATH: &str = "/api/v1/directories/";
const ERROR_REPORT_PATH: &str = "/api/v1/debug/log-errors";

/// Asynchronous operations on the directory resource.
///
/// Futures are `Send` so callers can hand them to spawned tasks (the
/// telemetry flush timer does).
pub trait RemoteResourceClient: Send + Sync {
    /// Fetches the full collection.
    fn list(&self) -> impl Future<Output = Result<Vec<Directory>, Error>> + Send;

    /// Fetches one record. Fails with `Error::NotFound` if the id is absent.
    fn get(&self, id: i64) -> impl Future<Output = Result<Directory, Error>> + Send;

    fn create(
        &self,
        input: &DirectoryCreate,
    ) -> impl Future<Output = Result<Directory, Error>> + Send;

    /// Updates a record with the given field values.
    fn replace(
        &self,
        id: i64,
        input: &DirectoryUpdate,
    ) -> impl Future<Output = Result<Directory, Error>> + Send;

    /// Flips the enabled flag server-side.
    fn toggle(&self, id: i64) -> impl Future<Output = Result<Directory, Error>> + Send;

    fn delete(&self, id: i64) -> impl Future<Output = Result<(), Error>> + Send;

    /// Delivers one batch of error entries to the report endpoint.
    fn submit_error_batch(
        &self,
        entries: &[ErrorEntry],
    ) -> impl Future<Output = Result<(), Error>> + Send;
}

#[derive(Serialize)]
struct ErrorBatch<'a> {
    errors: &'a [ErrorEntry],
}

/// `RemoteResourceClient` over HTTP/JSON.
#[derive(Debug, Clone)]
pub struct HttpClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpClient {
    /// Creates a client for the API rooted at `base_url`
    /// (e.g. `http://localhost:8800`).
    pub fn new(base_url: &str) -> Result<Self, Error> {
        Self::with_timeout(base_url, REQUEST_TIMEOUT)
    }

    /// Like [`HttpClient::new`] with a custom per-request timeout.
    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, Error> {
        let base_url = base_url.trim_end_matches('/').to_string();
        reqwest::Url::parse(&base_url)
            .map_err(|e| Error::Request(format!("invalid base url '{}': {}", base_url, e)))?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Request(e.to_string()))?;
        Ok(Self {
            http,
            base_url,
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn collection_url(&self) -> String {
        format!("{}{}", self.base_url, DIRECTORIES_PATH)
    }

    fn item_url(&self, id: i64) -> String {
        format!("{}{}{}", self.base_url, DIRECTORIES_PATH, id)
    }

    /// Sends the request and turns non-2xx responses into errors.
    /// `id` is the record the request targets, used for 404 mapping.
    async fn send(&self, request: RequestBuilder, id: Option<i64>) -> Result<Response, Error> {
        let response = request.send().await.map_err(|e| {
            let err = classify_send_error(&e, self.timeout);
            warn!(error = %err, "request failed without response");
            err
        })?;

        let status = response.status();
        if status.is_success() {
            debug!(status = status.as_u16(), url = %response.url(), "request ok");
            return Ok(response);
        }

        let url = response.url().to_string();
        let body = response.text().await.unwrap_or_default();
        warn!(status = status.as_u16(), url = %url, body = %body, "API error");
        Err(status_error(status, body, id))
    }
}

impl RemoteResourceClient for HttpClient {
    async fn list(&self) -> Result<Vec<Directory>, Error> {
        let response = self.send(self.http.get(self.collection_url()), None).await?;
        decode(response).await
    }

    async fn get(&self, id: i64) -> Result<Directory, Error> {
        let response = self.send(self.http.get(self.item_url(id)), Some(id)).await?;
        decode(response).await
    }

    async fn create(&self, input: &DirectoryCreate) -> Result<Directory, Error> {
        let request = self.http.post(self.collection_url()).json(input);
        let response = self.send(request, None).await?;
        decode(response).await
    }

    async fn replace(&self, id: i64, input: &DirectoryUpdate) -> Result<Directory, Error> {
        let request = self.http.put(self.item_url(id)).json(input);
        let response = self.send(request, Some(id)).await?;
        decode(response).await
    }

    async fn toggle(&self, id: i64) -> Result<Directory, Error> {
        let url = format!("{}/toggle", self.item_url(id));
        let response = self.send(self.http.patch(url), Some(id)).await?;
        decode(response).await
    }

    async fn delete(&self, id: i64) -> Result<(), Error> {
        self.send(self.http.delete(self.item_url(id)), Some(id))
            .await
            .map(|_| ())
    }

    async fn submit_error_batch(&self, entries: &[ErrorEntry]) -> Result<(), Error> {
        let url = format!("{}{}", self.base_url, ERROR_REPORT_PATH);
        let request = self.http.post(url).json(&ErrorBatch { errors: entries });
        self.send(request, None).await.map(|_| ())
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, Error> {
    let status = response.status().as_u16();
    response.json::<T>().await.map_err(|e| {
        if e.is_decode() {
            Error::Server {
                status,
                body: format!("invalid response body: {}", e),
            }
        } else {
            Error::Transport(e.to_string())
        }
    })
}

fn classify_send_error(e: &reqwest::Error, timeout: Duration) -> Error {
    if e.is_builder() {
        Error::Request(e.to_string())
    } else if e.is_timeout() {
        Error::Transport(format!("timed out after {:?}", timeout))
    } else {
        Error::Transport(e.to_string())
    }
}

fn status_error(status: StatusCode, body: String, id: Option<i64>) -> Error {
    match (status, id) {
        (StatusCode::NOT_FOUND, Some(id)) => Error::NotFound(id),
        (StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY, _) => {
            Error::Validation(detail_message(&body))
        }
        _ => Error::Server {
            status: status.as_u16(),
            body,
        },
    }
}

/// Extracts the human-readable part of a `{"detail": ...}` error body.
///
/// `detail` is either a string or a list of `{loc, msg}` objects.
fn detail_message(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return body.to_string();
    };
    match value.get("detail") {
        Some(serde_json::Value::String(msg)) => msg.clone(),
        Some(serde_json::Value::Array(items)) => {
            let msgs: Vec<String> = items
                .iter()
                .filter_map(|item| {
                    let msg = item.get("msg")?.as_str()?;
                    let field = item
                        .get("loc")
                        .and_then(|loc| loc.as_array())
                        .and_then(|loc| loc.last())
                        .map(|last| match last {
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        });
                    Some(match field {
                        Some(field) => format!("{}: {}", field, msg),
                        None => msg.to_string(),
                    })
                })
                .collect();
            if msgs.is_empty() {
                body.to_string()
            } else {
                msgs.join("; ")
            }
        }
        _ => body.to_string(),
    }
}
