//! HTTP plumbing: the transport abstraction and the outbound interceptor.

use async_trait::async_trait;
use http::{Request, Response};

use crate::error::TraceResult;
use crate::trace::Span;

/// The minimal transport interface the library needs: send one request,
/// receive one response.
///
/// Uploads and intercepted application calls both go through this trait, so
/// users can bring the HTTP client of their runtime. A [`reqwest::Client`]
/// implementation ships behind the `reqwest-client` feature.
#[async_trait]
pub trait HttpClient: std::fmt::Debug + Send + Sync {
    /// Send `request` and return the response.
    async fn send(&self, request: Request<Vec<u8>>) -> TraceResult<Response<Vec<u8>>>;
}

#[cfg(feature = "reqwest-client")]
#[async_trait]
impl HttpClient for reqwest::Client {
    async fn send(&self, request: Request<Vec<u8>>) -> TraceResult<Response<Vec<u8>>> {
        use crate::error::TraceError;

        let request = reqwest::Request::try_from(request)
            .map_err(|err| TraceError::UploadFailed(err.to_string()))?;
        let response = self
            .execute(request)
            .await
            .map_err(|err| TraceError::UploadFailed(err.to_string()))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| TraceError::UploadFailed(err.to_string()))?;
        Response::builder()
            .status(status)
            .body(body.to_vec())
            .map_err(|err| TraceError::UploadFailed(err.to_string()))
    }
}

/// An [`HttpClient`] middleware that traces outbound requests.
///
/// When a request carries a [`Span`] in its extensions (see
/// [`Span::attach`]), the wrapper opens a client child span, emits the trace
/// context header, forwards the request to the inner transport, and finishes
/// the child with the response status. Requests without a span pass through
/// untouched.
#[derive(Debug)]
pub struct TracedClient<C> {
    inner: C,
}

impl<C> TracedClient<C> {
    /// Wrap a transport.
    pub fn new(inner: C) -> Self {
        TracedClient { inner }
    }
}

#[async_trait]
impl<C: HttpClient> HttpClient for TracedClient<C> {
    async fn send(&self, mut request: Request<Vec<u8>>) -> TraceResult<Response<Vec<u8>>> {
        let span = request.extensions().get::<Span>().cloned();
        let child = span.map(|span| span.new_remote_child(&mut request));
        let result = self.inner.send(request).await;
        if let Some(child) = child {
            match &result {
                Ok(response) => child.finish_with_response(response),
                Err(err) => {
                    child.set_label(crate::trace::ERROR_LABEL, err.to_string());
                    child.finish();
                }
            }
        }
        result
    }
}
