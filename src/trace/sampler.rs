//! Sampling policies.
//!
//! A [`SamplingPolicy`] decides, per inbound request, whether the request is
//! *traced* (context keeps flowing to downstream peers) and whether it is
//! *sampled* (its spans are uploaded). The built-in [`LimitedSampler`]
//! combines a probabilistic decision with a global QPS ceiling and computes
//! a compensation weight so the sampled subset remains an unbiased estimate
//! of all offered traffic even while the ceiling is binding.

use std::fmt;
use std::sync::Mutex;
use std::time::SystemTime;

use crate::error::{TraceError, TraceResult};

/// Per-request input to a sampling decision.
#[derive(Clone, Copy, Debug, Default)]
pub struct Parameters {
    /// Whether the inbound request carried a trace context header with the
    /// trace bit set.
    pub has_trace_header: bool,
}

/// The outcome of a sampling decision.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Decision {
    /// Keep propagating trace context for this request.
    pub trace: bool,
    /// Upload the spans recorded for this request. Implies `trace`.
    pub sample: bool,
    /// How many offered requests this sampled one stands in for. Always a
    /// positive integer multiple of the sampler's weight unit when `sample`
    /// is set, and 0 otherwise.
    pub weight: f64,
}

/// Decides which requests are traced and which traces are uploaded.
///
/// Implementations are consulted once per root span and must be cheap; the
/// client reads the installed policy through an atomic pointer on every
/// request.
pub trait SamplingPolicy: Send + Sync + fmt::Debug {
    /// Return the decision for one request.
    fn sample(&self, params: Parameters) -> Decision;
}

/// A sampler that traces a fixed fraction of requests, subject to a global
/// QPS ceiling.
///
/// When the ceiling denies a request that passed the probabilistic check,
/// the denied mass is carried forward and folded into the weight of the
/// next granted request, keeping the expected weight total equal to the
/// number of requests the fraction would have selected. Weights are always
/// positive integer multiples of the *weight unit*, the inverse sampling
/// fraction rounded to the nearest integer (a fraction of 0.25 yields
/// multiples of 4).
#[derive(Debug)]
pub struct LimitedSampler {
    fraction: f64,
    weight_unit: f64,
    enabled: bool,
    state: Mutex<SamplerState>,
}

#[derive(Debug)]
struct SamplerState {
    bucket: TokenBucket,
    skipped: f64,
}

impl LimitedSampler {
    /// Create a sampler that traces `fraction` of requests, capped at
    /// `max_qps` sampled requests per second.
    ///
    /// Returns [`TraceError::InvalidConfiguration`] when `fraction` is
    /// outside `[0, 1]` or `max_qps` is negative. A `fraction` or `max_qps`
    /// of zero yields a sampler that never traces.
    pub fn new(fraction: f64, max_qps: f64) -> TraceResult<Self> {
        if !(0.0..=1.0).contains(&fraction) {
            return Err(TraceError::InvalidConfiguration(format!(
                "sampling fraction {fraction} is not in [0, 1]"
            )));
        }
        if max_qps.is_nan() || max_qps < 0.0 {
            return Err(TraceError::InvalidConfiguration(format!(
                "max QPS {max_qps} is negative"
            )));
        }
        let weight_unit = if fraction > 0.0 {
            (1.0 / fraction).round().max(1.0)
        } else {
            1.0
        };
        Ok(LimitedSampler {
            fraction,
            weight_unit,
            enabled: fraction > 0.0 && max_qps > 0.0,
            state: Mutex::new(SamplerState {
                bucket: TokenBucket::new(max_qps),
                skipped: 0.0,
            }),
        })
    }

    /// The granularity of the weights this sampler emits.
    pub fn weight_unit(&self) -> f64 {
        self.weight_unit
    }

    // The time-independent core of the decision, driven by an externally
    // supplied clock reading and uniform random value in [0, 1).
    fn sample_at(&self, params: Parameters, now: SystemTime, x: f64) -> Decision {
        if !self.enabled || x >= self.fraction {
            return Decision::default();
        }
        let mut state = self.state.lock().unwrap();
        if state.bucket.allow(now) {
            let weight = (state.skipped + 1.0) * self.weight_unit;
            state.skipped = 0.0;
            Decision {
                trace: true,
                sample: true,
                weight,
            }
        } else {
            state.skipped += 1.0;
            // The QPS ceiling holds, but an upstream trace bit must still
            // propagate downstream.
            Decision {
                trace: params.has_trace_header,
                sample: false,
                weight: 0.0,
            }
        }
    }
}

impl SamplingPolicy for LimitedSampler {
    fn sample(&self, params: Parameters) -> Decision {
        self.sample_at(params, SystemTime::now(), rand::random::<f64>())
    }
}

// Float token bucket refilled at `qps` tokens per second. The capacity is
// one more than a second's worth of tokens, capped at 100, so bursts of
// sampled traces stay bounded.
#[derive(Debug)]
struct TokenBucket {
    qps: f64,
    available: f64,
    capacity: f64,
    last_refill: SystemTime,
}

impl TokenBucket {
    fn new(qps: f64) -> Self {
        let capacity = if qps < 99.0 { 1.0 + qps.trunc() } else { 100.0 };
        TokenBucket {
            qps,
            available: capacity,
            capacity,
            last_refill: SystemTime::now(),
        }
    }

    fn allow(&mut self, now: SystemTime) -> bool {
        if let Ok(elapsed) = now.duration_since(self.last_refill) {
            self.available =
                (self.available + elapsed.as_secs_f64() * self.qps).min(self.capacity);
        }
        self.last_refill = now;
        if self.available >= 1.0 {
            self.available -= 1.0;
            true
        } else {
            false
        }
    }
}
