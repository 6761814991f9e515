//! Trace context propagation over the `X-Cloud-Trace-Context` header.
//!
//! The wire format is `TRACE_ID/SPAN_ID;o=OPTIONS`:
//!
//! - `TRACE_ID` is 32 hex digits naming the trace,
//! - `SPAN_ID` is a decimal unsigned 64-bit integer (0 when the sender does
//!   not know its own span),
//! - `OPTIONS` is a decimal unsigned integer carrying the [`TraceOptions`]
//!   bits, and the whole `;o=` section may be absent.
//!
//! Parsing is tolerant: a missing options section defaults to 0 and a zero
//! span id is accepted. Anything else malformed yields
//! [`ContextParseError`], which callers treat as "no upstream context"
//! rather than an abort.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Name of the HTTP header used to exchange trace context between processes.
pub const TRACE_CONTEXT_HEADER: &str = "X-Cloud-Trace-Context";

/// Returned when a trace context header cannot be parsed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
#[error("malformed trace context header")]
pub struct ContextParseError(pub(crate) ());

/// Flag bits exchanged through the `;o=` section of the header.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TraceOptions(u32);

impl TraceOptions {
    /// Bit 0: spans for this request are flowing to the tracing backend.
    pub const TRACE: TraceOptions = TraceOptions(1);

    /// Bit 1: the caller asked for this request to be traced regardless of
    /// local sampling policy.
    pub const FORCE_TRACE: TraceOptions = TraceOptions(2);

    /// Whether the trace bit is set.
    pub fn is_traced(self) -> bool {
        self.0 & Self::TRACE.0 != 0
    }

    /// Whether the upstream caller requested forced tracing.
    pub fn is_force_traced(self) -> bool {
        self.0 & Self::FORCE_TRACE.0 != 0
    }

    /// The raw option bits as they appear on the wire.
    pub fn bits(self) -> u32 {
        self.0
    }

    pub(crate) fn from_bits(bits: u32) -> Self {
        TraceOptions(bits)
    }

    pub(crate) fn with_traced(self, traced: bool) -> Self {
        if traced {
            TraceOptions(self.0 | Self::TRACE.0)
        } else {
            TraceOptions(self.0 & !Self::TRACE.0)
        }
    }
}

/// A 128-bit trace identifier, rendered as 32 hex digits.
///
/// Identifiers parsed from an inbound header keep their original spelling,
/// so the id the backend sees matches the one every peer reports.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct TraceId(String);

impl TraceId {
    pub(crate) fn from_u128(value: u128) -> Self {
        TraceId(format!("{value:032x}"))
    }

    /// The hex digits of this id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TraceId {
    type Err = ContextParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == 32 && s.bytes().all(|b| b.is_ascii_hexdigit()) {
            Ok(TraceId(s.to_owned()))
        } else {
            Err(ContextParseError(()))
        }
    }
}

/// The identity a span presents to its peers: trace id, span id, and the
/// option bits that travel with them.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SpanContext {
    /// Identifier of the trace this span belongs to.
    pub trace_id: TraceId,
    /// Identifier of the span itself; 0 when unknown.
    pub span_id: u64,
    /// Option bits carried alongside the identifiers.
    pub options: TraceOptions,
}

impl fmt::Display for SpanContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{};o={}", self.trace_id, self.span_id, self.options.0)
    }
}

impl FromStr for SpanContext {
    type Err = ContextParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ids, options) = match s.split_once(";o=") {
            Some((ids, options)) => (ids, Some(options)),
            None => (s, None),
        };
        let (trace_id, span_id) = ids.split_once('/').ok_or(ContextParseError(()))?;
        let trace_id = trace_id.parse::<TraceId>()?;
        let span_id = span_id.parse::<u64>().map_err(|_| ContextParseError(()))?;
        let options = options
            .map(|o| o.parse::<u32>().map_err(|_| ContextParseError(())))
            .transpose()?
            .unwrap_or(0);
        Ok(SpanContext {
            trace_id,
            span_id,
            options: TraceOptions(options),
        })
    }
}
