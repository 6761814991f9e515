//! Span wrappers for outbound RPC calls.
//!
//! [`traced_call`] brackets a tonic client call with an `RPC_CLIENT` span:
//! the trace context travels in the request metadata, and a non-OK status
//! ends up under the span's `error` label.

use std::future::Future;

use tonic::metadata::{Ascii, MetadataValue};
use tonic::{Request, Response, Status};

use crate::trace::{Span, ERROR_LABEL};

/// Metadata key carrying the trace context on RPC calls.
pub const TRACE_CONTEXT_METADATA_KEY: &str = "x-cloud-trace-context";

/// Run an outbound RPC under a client span.
///
/// Opens a child of `parent` named after `method` (the full
/// `/package.Service/Method` path), injects the trace context into the
/// request metadata, invokes `call`, and finishes the span when the call
/// completes. A non-OK status (including cancellation) is recorded as
/// `"<code>: <message>"` under the `error` label.
///
/// Works for unary calls and for calls that open a stream; for the latter
/// the span covers call establishment.
///
/// ```no_run
/// # use cloudtrace::Span;
/// # async fn say_hello(
/// #     request: tonic::Request<()>,
/// # ) -> Result<tonic::Response<()>, tonic::Status> {
/// #     unimplemented!()
/// # }
/// # async fn example(span: &Span) -> Result<(), tonic::Status> {
/// let response = cloudtrace::rpc::traced_call(
///     span,
///     "/example.Greeter/SayHello",
///     tonic::Request::new(()),
///     say_hello,
/// )
/// .await?;
/// # drop(response);
/// # Ok(())
/// # }
/// ```
pub async fn traced_call<M, T, F, Fut>(
    parent: &Span,
    method: &str,
    mut request: Request<M>,
    call: F,
) -> Result<Response<T>, Status>
where
    F: FnOnce(Request<M>) -> Fut,
    Fut: Future<Output = Result<Response<T>, Status>>,
{
    let span = parent.new_rpc_child(method);
    let context: Result<MetadataValue<Ascii>, _> =
        MetadataValue::try_from(span.span_context().to_string());
    if let Ok(value) = context {
        request.metadata_mut().insert(TRACE_CONTEXT_METADATA_KEY, value);
    }
    let result = call(request).await;
    if let Err(status) = &result {
        span.set_label(
            ERROR_LABEL,
            format!("{:?}: {}", status.code(), status.message()),
        );
    }
    span.finish();
    result
}
