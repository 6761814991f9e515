//! # Cloud Trace client
//!
//! Records tree-structured spans describing the work a process performs and
//! ships them asynchronously, in batches, to [Google Cloud Trace]. Trace
//! identity crosses process boundaries through the `X-Cloud-Trace-Context`
//! HTTP header, so spans recorded by peer services join the same logical
//! trace.
//!
//! [Google Cloud Trace]: https://cloud.google.com/trace
//!
//! ## Quickstart
//!
//! Build a [`Client`] for your project, derive a root span from each inbound
//! request, and open children around interesting work:
//!
//! ```no_run
//! use cloudtrace::{Client, LimitedSampler, TraceResult};
//!
//! #[tokio::main]
//! async fn main() -> TraceResult<()> {
//!     let client = Client::builder("my-project")
//!         // Trace 10% of requests, at most 5 per second.
//!         .with_sampling_policy(LimitedSampler::new(0.1, 5.0)?)
//!         .build()?;
//!
//!     // Usually the request comes from your HTTP server.
//!     let request = http::Request::get("https://service.example/work")
//!         .body(Vec::<u8>::new())
//!         .unwrap();
//!     let span = client.span_from_request(&request);
//!
//!     let child = span.new_child("compute");
//!     // ... do the work ...
//!     child.finish();
//!
//!     span.finish();
//!     client.flush().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Outbound calls
//!
//! Wrap your HTTP transport in a [`TracedClient`] and attach the current
//! span to outbound requests with [`Span::attach`]; each request then gets
//! its own client span and carries the trace context header. RPC clients
//! use [`rpc::traced_call`] instead (feature `grpc`).
//!
//! ## Sampling
//!
//! Without a policy, a request is traced exactly when its inbound header
//! asks for it. [`LimitedSampler`] traces a fraction of requests under a
//! global QPS ceiling and weights the sampled subset so backend estimates
//! stay unbiased; [`Client::set_sampling_policy`] swaps policies atomically
//! at runtime.
//!
//! ## Uploads
//!
//! Finished traces are batched by size, count, and age before upload (see
//! the [`bundler`] module); `Span::finish` never blocks on the network.
//! [`Span::finish_wait`] waits for the enclosing trace's upload and reports
//! its result, and [`Client::flush`] drains everything during shutdown.

#![warn(missing_docs)]

pub mod bundler;
pub mod error;
pub mod export;
pub mod http;
pub mod propagation;
#[cfg(feature = "grpc")]
pub mod rpc;
pub mod trace;

pub use crate::error::{TraceError, TraceResult};
pub use crate::http::{HttpClient, TracedClient};
pub use crate::propagation::{
    ContextParseError, SpanContext, TraceId, TraceOptions, TRACE_CONTEXT_HEADER,
};
pub use crate::trace::sampler::{Decision, LimitedSampler, Parameters, SamplingPolicy};
pub use crate::trace::{Client, ClientBuilder, Span};
