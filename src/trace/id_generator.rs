//! Identifier generation.

use std::cell::RefCell;

use rand::{rngs, Rng, SeedableRng};

use crate::propagation::TraceId;

/// Generate a new 128-bit trace id.
pub(crate) fn new_trace_id() -> TraceId {
    CURRENT_RNG.with(|rng| TraceId::from_u128(rng.borrow_mut().gen::<u128>()))
}

/// Generate a new nonzero span id.
pub(crate) fn new_span_id() -> u64 {
    CURRENT_RNG.with(|rng| {
        let mut rng = rng.borrow_mut();
        loop {
            let id = rng.gen::<u64>();
            if id != 0 {
                return id;
            }
        }
    })
}

thread_local! {
    // Ids must be unpredictable across concurrently created traces, so each
    // thread seeds a CSPRNG from OS entropy.
    static CURRENT_RNG: RefCell<rngs::StdRng> = RefCell::new(rngs::StdRng::from_entropy());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_ids_are_32_hex_digits() {
        let id = new_trace_id();
        assert_eq!(id.as_str().len(), 32);
        assert!(id.as_str().bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn span_ids_are_nonzero_and_vary() {
        let ids: Vec<u64> = (0..64).map(|_| new_span_id()).collect();
        assert!(ids.iter().all(|&id| id != 0));
        let first = ids[0];
        assert!(ids.iter().any(|&id| id != first));
    }
}
