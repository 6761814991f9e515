//! Turning finished traces into Cloud Trace API requests.

pub mod model;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use http::{header::CONTENT_TYPE, Method, Request};

use crate::error::{TraceError, TraceResult};
use crate::http::HttpClient;

/// Default service endpoint for trace uploads.
pub const DEFAULT_ENDPOINT: &str = "https://cloudtrace.googleapis.com";

/// Ships bundles of finished traces to the tracing service.
///
/// Exactly one terminal result is produced per bundle; the bundler fans it
/// out to every waiter registered on that bundle. Retries, if any, belong to
/// the transport.
#[async_trait]
pub trait Uploader: Send + Sync + fmt::Debug {
    /// Serialize and send one batch of traces.
    async fn upload(&self, traces: model::Traces) -> TraceResult<()>;
}

/// An [`Uploader`] that PATCHes the JSON payload to the Cloud Trace v1 API.
#[derive(Debug)]
pub struct HttpUploader {
    client: Arc<dyn HttpClient>,
    url: String,
}

impl HttpUploader {
    /// Create an uploader for `project_id` behind the given transport.
    ///
    /// `endpoint` is the service base URL; authentication is the transport's
    /// concern.
    pub fn new(client: Arc<dyn HttpClient>, endpoint: &str, project_id: &str) -> Self {
        HttpUploader {
            client,
            url: format!(
                "{}/v1/projects/{}/traces",
                endpoint.trim_end_matches('/'),
                project_id
            ),
        }
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn upload(&self, traces: model::Traces) -> TraceResult<()> {
        let body = serde_json::to_vec(&traces)
            .map_err(|err| TraceError::UploadFailed(err.to_string()))?;
        let request = Request::builder()
            .method(Method::PATCH)
            .uri(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .map_err(|err| TraceError::UploadFailed(err.to_string()))?;
        let response = self.client.send(request).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(TraceError::UploadFailed(format!(
                "service responded with status {}",
                response.status()
            )))
        }
    }
}
