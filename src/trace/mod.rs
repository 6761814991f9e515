//! Spans, traces, and the [`Client`] facade.
//!
//! A [`Client`] turns inbound requests (or raw header values) into root
//! spans. Application code opens children with [`Span::new_child`] and
//! [`Span::new_remote_child`]; finishing the root hands the accumulated
//! trace to a background bundler for upload. Requests that are not traced
//! yield null-object spans whose operations are cheap no-ops but which keep
//! propagating trace context downstream.

pub mod id_generator;
pub mod sampler;

use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use arc_swap::ArcSwapOption;
use http::header::{HeaderName, HeaderValue};
use tokio::sync::oneshot;

use crate::bundler::{BundleHandler, Bundler, BundlerOptions};
use crate::error::{TraceError, TraceResult};
use crate::export::{model, HttpUploader, Uploader, DEFAULT_ENDPOINT};
use crate::http::HttpClient;
use crate::propagation::{SpanContext, TraceId, TraceOptions, TRACE_CONTEXT_HEADER};
use self::sampler::{Decision, Parameters, SamplingPolicy};

/// Label carrying the HTTP host of a request span.
pub const HTTP_HOST_LABEL: &str = "trace.cloud.google.com/http/host";
/// Label carrying the HTTP method of a request span.
pub const HTTP_METHOD_LABEL: &str = "trace.cloud.google.com/http/method";
/// Label carrying the full URL of a request span.
pub const HTTP_URL_LABEL: &str = "trace.cloud.google.com/http/url";
/// Label carrying the response status code, attached at finish.
pub const HTTP_STATUS_CODE_LABEL: &str = "trace.cloud.google.com/http/status_code";
/// Reserved label under which instrumented code may attach stack traces.
pub const STACKTRACE_LABEL: &str = "trace.cloud.google.com/stacktrace";
/// Label recording why a client span's call failed.
pub(crate) const ERROR_LABEL: &str = "error";

/// Records spans and ships finished traces to the tracing service.
///
/// The client is cheap to clone and safe to share across request handlers.
/// Span submission is synchronous and O(1); uploading happens on a
/// background task owned by the client's bundler.
#[derive(Clone, Debug)]
pub struct Client {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    project_id: String,
    policy: ArcSwapOption<Box<dyn SamplingPolicy>>,
    bundler: Bundler<model::Trace>,
}

impl fmt::Debug for ClientInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("project_id", &self.project_id)
            .field("policy", &*self.policy.load())
            .field("bundler", &self.bundler)
            .finish()
    }
}

impl Client {
    /// Start building a client for the given Cloud project.
    pub fn builder(project_id: impl Into<String>) -> ClientBuilder {
        ClientBuilder {
            project_id: project_id.into(),
            endpoint: DEFAULT_ENDPOINT.to_owned(),
            transport: None,
            policy: None,
            bundler_options: BundlerOptions::default(),
        }
    }

    /// Install or remove the sampling policy.
    ///
    /// `None` means "sample only when the inbound header asks for it". The
    /// policy is swapped atomically; in-flight requests keep the decision
    /// they already received.
    pub fn set_sampling_policy(&self, policy: Option<Box<dyn SamplingPolicy>>) {
        self.inner.policy.store(policy.map(Arc::new));
    }

    /// Build a root span for an inbound HTTP request.
    ///
    /// The trace context header, if present and well formed, links the span
    /// to the caller's trace; a malformed or absent header means "no
    /// upstream context". Traced spans are labeled with the request's host,
    /// method, and URL.
    pub fn span_from_request<B>(&self, request: &http::Request<B>) -> Span {
        let header = request
            .headers()
            .get(TRACE_CONTEXT_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");
        let span = self.start_root(request.uri().path().to_owned(), header);
        if span.is_recording() {
            if let Some(host) = request_host(request) {
                span.set_label(HTTP_HOST_LABEL, host);
            }
            span.set_label(HTTP_METHOD_LABEL, request.method().as_str());
            span.set_label(HTTP_URL_LABEL, request.uri().to_string());
        }
        span
    }

    /// Build a root span named `name` from a raw header value.
    pub fn span_from_header(&self, name: impl Into<String>, header: &str) -> Span {
        self.start_root(name.into(), header)
    }

    /// Drain all pending trace data to the backend.
    ///
    /// Call during shutdown; bound the wait with `tokio::time::timeout` if a
    /// deadline is needed.
    pub async fn flush(&self) {
        self.inner.bundler.flush().await
    }

    fn start_root(&self, name: String, header: &str) -> Span {
        let context = header.parse::<SpanContext>().ok();
        let has_trace_header = context
            .as_ref()
            .map_or(false, |context| context.options.is_traced());
        let forced = context
            .as_ref()
            .map_or(false, |context| context.options.is_force_traced());
        let decision = match &*self.inner.policy.load() {
            Some(policy) => policy.sample(Parameters { has_trace_header }),
            // Without a policy the header speaks for itself.
            None => Decision {
                trace: has_trace_header,
                sample: has_trace_header,
                weight: 0.0,
            },
        };
        let traced = decision.trace || forced;
        let sampled = traced && decision.sample;
        let (trace_id, parent_span_id, upstream_options) = match context {
            Some(context) => (context.trace_id, context.span_id, context.options),
            None => (id_generator::new_trace_id(), 0, TraceOptions::default()),
        };
        let trace = Arc::new(TraceShared {
            client: self.inner.clone(),
            trace_id,
            options: upstream_options.with_traced(traced),
            sampled,
            spans: Mutex::new(Vec::new()),
        });
        if traced {
            Span::live(
                trace,
                id_generator::new_span_id(),
                parent_span_id,
                true,
                name,
                model::SpanKind::Server,
                HashMap::new(),
            )
        } else {
            // The null span keeps the upstream span id so outbound headers
            // re-emit it unchanged.
            Span::noop(trace, parent_span_id)
        }
    }
}

/// Configures and constructs a [`Client`].
#[derive(Debug)]
pub struct ClientBuilder {
    project_id: String,
    endpoint: String,
    transport: Option<Arc<dyn HttpClient>>,
    policy: Option<Box<dyn SamplingPolicy>>,
    bundler_options: BundlerOptions,
}

impl ClientBuilder {
    /// Use a custom transport for uploads instead of the bundled client.
    pub fn with_transport(mut self, transport: impl HttpClient + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Override the service endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Install an initial sampling policy.
    pub fn with_sampling_policy(mut self, policy: impl SamplingPolicy + 'static) -> Self {
        self.policy = Some(Box::new(policy));
        self
    }

    /// Seal upload bundles after this many finished traces.
    pub fn with_bundle_count_threshold(mut self, count: usize) -> Self {
        self.bundler_options.bundle_count_threshold = count;
        self
    }

    /// Seal upload bundles after this many serialized bytes.
    pub fn with_bundle_byte_limit(mut self, bytes: usize) -> Self {
        self.bundler_options.bundle_byte_limit = bytes;
        self
    }

    /// Seal upload bundles once their oldest trace is this old.
    pub fn with_delay_threshold(mut self, delay: std::time::Duration) -> Self {
        self.bundler_options.delay_threshold = delay;
        self
    }

    /// Drop new traces once this many bytes are buffered for upload.
    pub fn with_buffered_byte_limit(mut self, bytes: usize) -> Self {
        self.bundler_options.buffered_byte_limit = bytes;
        self
    }

    /// Allow this many concurrent upload requests.
    pub fn with_handler_limit(mut self, limit: usize) -> Self {
        self.bundler_options.handler_limit = limit;
        self
    }

    /// Construct the client.
    ///
    /// Must be called within a tokio runtime; the upload worker is spawned
    /// on it.
    pub fn build(self) -> TraceResult<Client> {
        if self.project_id.is_empty() {
            return Err(TraceError::InvalidConfiguration(
                "project id must not be empty".to_owned(),
            ));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            TraceError::InvalidConfiguration(
                "trace uploads require a running tokio runtime".to_owned(),
            )
        })?;
        let transport = match self.transport {
            Some(transport) => transport,
            None => default_transport()?,
        };
        let uploader = HttpUploader::new(transport, &self.endpoint, &self.project_id);
        let handler = Arc::new(TraceBundleHandler {
            uploader: Box::new(uploader),
        });
        let client = Client {
            inner: Arc::new(ClientInner {
                project_id: self.project_id,
                policy: ArcSwapOption::empty(),
                bundler: Bundler::new(self.bundler_options, handler, runtime),
            }),
        };
        if let Some(policy) = self.policy {
            client.set_sampling_policy(Some(policy));
        }
        Ok(client)
    }
}

#[cfg(feature = "reqwest-client")]
fn default_transport() -> TraceResult<Arc<dyn HttpClient>> {
    Ok(Arc::new(reqwest::Client::new()))
}

#[cfg(not(feature = "reqwest-client"))]
fn default_transport() -> TraceResult<Arc<dyn HttpClient>> {
    Err(TraceError::InvalidConfiguration(
        "no HTTP transport configured; enable the `reqwest-client` feature or supply one \
         with `with_transport`"
            .to_owned(),
    ))
}

#[derive(Debug)]
struct TraceBundleHandler {
    uploader: Box<dyn Uploader>,
}

#[async_trait::async_trait]
impl BundleHandler<model::Trace> for TraceBundleHandler {
    async fn handle(&self, items: Vec<model::Trace>) -> TraceResult<()> {
        self.uploader.upload(model::Traces { traces: items }).await
    }
}

// State shared by every span of one trace. Owns the finished spans until the
// root hands them to the bundler.
#[derive(Debug)]
struct TraceShared {
    client: Arc<ClientInner>,
    trace_id: TraceId,
    options: TraceOptions,
    sampled: bool,
    spans: Mutex<Vec<model::TraceSpan>>,
}

impl TraceShared {
    fn finish_span(
        &self,
        span: model::TraceSpan,
        is_root: bool,
        wait: bool,
    ) -> TraceResult<Option<oneshot::Receiver<TraceResult<()>>>> {
        let finished = {
            let mut spans = self.spans.lock().unwrap();
            spans.push(span);
            if !is_root {
                return Ok(None);
            }
            mem::take(&mut *spans)
        };
        if !self.sampled {
            return Ok(None);
        }
        let trace = model::Trace {
            project_id: self.client.project_id.clone(),
            trace_id: self.trace_id.to_string(),
            spans: finished,
        };
        let size = serde_json::to_vec(&trace)
            .map_err(|err| TraceError::UploadFailed(err.to_string()))?
            .len();
        if wait {
            Ok(Some(self.client.bundler.add_with_notify(trace, size)?))
        } else {
            self.client.bundler.add(trace, size)?;
            Ok(None)
        }
    }
}

/// A single timed, labeled unit of work within a trace.
///
/// Spans are cheap to clone; clones share the same underlying record, so a
/// span can ride along in request extensions or across tasks. All methods
/// are safe to call concurrently. A span is either *live* (it records and
/// will be part of the upload) or a *null object* that ignores every
/// mutation while still propagating trace context to peers.
#[derive(Clone)]
pub struct Span {
    inner: Arc<SpanInner>,
}

#[derive(Debug)]
struct SpanInner {
    trace: Arc<TraceShared>,
    span_id: u64,
    parent_span_id: u64,
    is_root: bool,
    // `None` marks the null-object variant.
    recording: Option<Mutex<Recording>>,
}

#[derive(Debug)]
struct Recording {
    name: String,
    kind: model::SpanKind,
    start_time: SystemTime,
    labels: HashMap<String, String>,
    finished: bool,
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Span")
            .field("trace_id", &self.inner.trace.trace_id)
            .field("span_id", &self.inner.span_id)
            .field("recording", &self.inner.recording.is_some())
            .finish()
    }
}

impl Span {
    #[allow(clippy::too_many_arguments)]
    fn live(
        trace: Arc<TraceShared>,
        span_id: u64,
        parent_span_id: u64,
        is_root: bool,
        name: String,
        kind: model::SpanKind,
        labels: HashMap<String, String>,
    ) -> Span {
        Span {
            inner: Arc::new(SpanInner {
                trace,
                span_id,
                parent_span_id,
                is_root,
                recording: Some(Mutex::new(Recording {
                    name,
                    kind,
                    start_time: SystemTime::now(),
                    labels,
                    finished: false,
                })),
            }),
        }
    }

    fn noop(trace: Arc<TraceShared>, span_id: u64) -> Span {
        Span {
            inner: Arc::new(SpanInner {
                trace,
                span_id,
                parent_span_id: 0,
                is_root: true,
                recording: None,
            }),
        }
    }

    /// Whether this span records data, i.e. the request is traced.
    pub fn is_recording(&self) -> bool {
        self.inner.recording.is_some()
    }

    /// The context this span presents to downstream peers.
    pub fn span_context(&self) -> SpanContext {
        SpanContext {
            trace_id: self.inner.trace.trace_id.clone(),
            span_id: self.inner.span_id,
            options: self.inner.trace.options,
        }
    }

    /// Attach this span to an outbound request so
    /// [`TracedClient`](crate::http::TracedClient) opens a client child
    /// around the call.
    pub fn attach<B>(&self, request: &mut http::Request<B>) {
        request.extensions_mut().insert(self.clone());
    }

    /// Start an in-process child span.
    pub fn new_child(&self, name: impl Into<String>) -> Span {
        if self.inner.recording.is_none() {
            return self.clone();
        }
        Span::live(
            self.inner.trace.clone(),
            id_generator::new_span_id(),
            self.inner.span_id,
            false,
            name.into(),
            model::SpanKind::Unspecified,
            HashMap::new(),
        )
    }

    /// Start a client span for an outbound HTTP request and stamp the trace
    /// context header onto it.
    ///
    /// The child is named after the request path and labeled with the
    /// request's host, method, and URL; finish it with
    /// [`finish_with_response`](Span::finish_with_response) to record the
    /// status code. On a null span no child is created, but the header is
    /// still written so downstream services see the upstream context with
    /// the trace bit cleared.
    pub fn new_remote_child<B>(&self, request: &mut http::Request<B>) -> Span {
        let child = if self.inner.recording.is_none() {
            self.clone()
        } else {
            let mut labels = HashMap::new();
            if let Some(host) = request_host(request) {
                labels.insert(HTTP_HOST_LABEL.to_owned(), host);
            }
            labels.insert(
                HTTP_METHOD_LABEL.to_owned(),
                request.method().as_str().to_owned(),
            );
            labels.insert(HTTP_URL_LABEL.to_owned(), request.uri().to_string());
            Span::live(
                self.inner.trace.clone(),
                id_generator::new_span_id(),
                self.inner.span_id,
                false,
                request.uri().path().to_owned(),
                model::SpanKind::Client,
                labels,
            )
        };
        let context = child.span_context();
        if let Ok(name) = HeaderName::from_bytes(TRACE_CONTEXT_HEADER.as_bytes()) {
            if let Ok(value) = HeaderValue::from_str(&context.to_string()) {
                request.headers_mut().insert(name, value);
            }
        }
        child
    }

    /// Start a client span for an outbound call whose carrier is not an
    /// HTTP request (RPC metadata, message queues). The caller is
    /// responsible for propagating [`span_context`](Span::span_context).
    pub fn new_rpc_child(&self, name: impl Into<String>) -> Span {
        if self.inner.recording.is_none() {
            return self.clone();
        }
        Span::live(
            self.inner.trace.clone(),
            id_generator::new_span_id(),
            self.inner.span_id,
            false,
            name.into(),
            model::SpanKind::Client,
            HashMap::new(),
        )
    }

    /// Add or overwrite a label. An empty value deletes the label.
    pub fn set_label(&self, key: impl Into<String>, value: impl Into<String>) {
        if let Some(recording) = &self.inner.recording {
            let mut recording = recording.lock().unwrap();
            if recording.finished {
                return;
            }
            let key = key.into();
            let value = value.into();
            if value.is_empty() {
                recording.labels.remove(&key);
            } else {
                recording.labels.insert(key, value);
            }
        }
    }

    /// Stamp the end time and hand the span to its trace.
    ///
    /// Finishing the root span submits the whole trace for upload (unless
    /// the trace is unsampled). A second finish is a no-op.
    pub fn finish(&self) {
        if let Err(err) = self.finish_inner(false) {
            tracing::warn!(error = %err, "failed to enqueue trace for upload");
        }
    }

    /// Record the response status code, then finish.
    pub fn finish_with_response<B>(&self, response: &http::Response<B>) {
        self.set_label(HTTP_STATUS_CODE_LABEL, response.status().as_u16().to_string());
        self.finish();
    }

    /// Finish and wait until the enclosing trace has been handed to the
    /// uploader and the upload has completed, returning its terminal
    /// result.
    ///
    /// Completes immediately for non-root spans, null spans, unsampled
    /// traces, and repeated finishes.
    pub async fn finish_wait(&self) -> TraceResult<()> {
        match self.finish_inner(true)? {
            Some(receiver) => receiver.await.map_err(|_| {
                TraceError::UploadFailed(
                    "upload worker stopped before reporting a result".to_owned(),
                )
            })?,
            None => Ok(()),
        }
    }

    fn finish_inner(
        &self,
        wait: bool,
    ) -> TraceResult<Option<oneshot::Receiver<TraceResult<()>>>> {
        let recording = match &self.inner.recording {
            Some(recording) => recording,
            None => return Ok(None),
        };
        let span = {
            let mut recording = recording.lock().unwrap();
            if recording.finished {
                return Ok(None);
            }
            recording.finished = true;
            model::TraceSpan {
                kind: recording.kind,
                name: mem::take(&mut recording.name),
                span_id: self.inner.span_id,
                parent_span_id: self.inner.parent_span_id,
                start_time: model::rfc3339(recording.start_time),
                end_time: model::rfc3339(SystemTime::now()),
                labels: mem::take(&mut recording.labels),
            }
        };
        self.inner.trace.finish_span(span, self.inner.is_root, wait)
    }
}

fn request_host<B>(request: &http::Request<B>) -> Option<String> {
    if let Some(host) = request.uri().host() {
        return Some(host.to_owned());
    }
    request
        .headers()
        .get(http::header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}
