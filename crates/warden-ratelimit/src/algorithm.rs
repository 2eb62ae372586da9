//! Admission decisions as pure state transitions.
//!
//! Each function takes the stored state (as read inside the atomic script),
//! the caller's timestamp and the limiter parameters, and returns whether
//! the request is admitted plus the state to write back. Timestamps are
//! Unix milliseconds, rates are units per second, and every division
//! floors.

use serde::{Deserialize, Serialize};

/// Outcome of one admission decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision<S> {
    pub admitted: bool,
    /// State to persist; `None` leaves the stored state untouched
    pub state: Option<S>,
}

impl<S> Decision<S> {
    fn admit(state: S) -> Self {
        Self {
            admitted: true,
            state: Some(state),
        }
    }

    fn deny() -> Self {
        Self {
            admitted: false,
            state: None,
        }
    }
}

/// Fixed window over a counter; `count` is the value before this request.
///
/// The counter always advances, denied requests included, so a burst
/// over the limit stays denied until the window key expires.
pub fn fixed_window(count: u64, limit: u64) -> Decision<u64> {
    let next = count.saturating_add(1);
    Decision {
        admitted: next <= limit,
        state: Some(next),
    }
}

/// Sliding window over request timestamps.
///
/// Records `now`, forgets everything at or before `now - window_ms`, and
/// admits if what remains fits the limit.
pub fn sliding_window(stamps: &[i64], now: i64, window_ms: u64, limit: u64) -> Decision<Vec<i64>> {
    let floor = now.saturating_sub(window_ms.min(i64::MAX as u64) as i64);
    let live: Vec<i64> = stamps
        .iter()
        .copied()
        .chain(std::iter::once(now))
        .filter(|&stamp| stamp > floor)
        .collect();
    Decision {
        admitted: live.len() as u64 <= limit,
        state: Some(live),
    }
}

/// Water level of a leaky bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakyState {
    pub water: u64,
    pub last: u64,
}

/// Leaky bucket: water drains at `rate` per second, each request adds one.
///
/// A missing state is an empty bucket last touched at `now`.
pub fn leaky_bucket(
    state: Option<LeakyState>,
    now: u64,
    capacity: u64,
    rate: u64,
) -> Decision<LeakyState> {
    let LeakyState { water, last } = state.unwrap_or(LeakyState { water: 0, last: now });
    let water = water.saturating_sub(accrued(last, now, rate));
    if water.saturating_add(1) > capacity {
        return Decision::deny();
    }
    Decision::admit(LeakyState {
        water: water + 1,
        last: last.max(now),
    })
}

/// Tokens left in a token bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenState {
    pub tokens: u64,
    pub last: u64,
}

/// Token bucket: refills at `rate` per second up to `capacity`, each
/// request takes one.
///
/// A missing state is a full bucket last refilled at `now`.
pub fn token_bucket(
    state: Option<TokenState>,
    now: u64,
    capacity: u64,
    rate: u64,
) -> Decision<TokenState> {
    let TokenState { tokens, last } = state.unwrap_or(TokenState {
        tokens: capacity,
        last: now,
    });
    let tokens = tokens.saturating_add(accrued(last, now, rate)).min(capacity);
    if tokens < 1 {
        return Decision::deny();
    }
    Decision::admit(TokenState {
        tokens: tokens - 1,
        last: last.max(now),
    })
}

/// How a hybrid bucket handled a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HybridAdmission {
    /// Admitted against the token counter
    Token,
    /// Tokens exhausted; admitted onto the overflow queue
    Queued,
    Rejected,
}

impl HybridAdmission {
    pub fn is_admitted(self) -> bool {
        !matches!(self, Self::Rejected)
    }
}

/// Hybrid token counter with a bounded FIFO overflow queue.
///
/// `tokens` is the counter and `queued` the queue length before this
/// request.
pub fn hybrid_bucket(
    tokens: u64,
    queued: u64,
    token_limit: u64,
    queue_limit: u64,
) -> HybridAdmission {
    if tokens.saturating_add(1) <= token_limit {
        HybridAdmission::Token
    } else if queued < queue_limit {
        HybridAdmission::Queued
    } else {
        HybridAdmission::Rejected
    }
}

/// `floor(max(0, now - last) * rate / 1000)`
fn accrued(last: u64, now: u64, rate: u64) -> u64 {
    let elapsed = now.saturating_sub(last) as u128;
    let amount = elapsed * rate as u128 / 1000;
    amount.min(u64::MAX as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fixed_window_counts_every_request() {
        let mut count = 0;
        let mut admitted = Vec::new();
        for _ in 0..4 {
            let decision = fixed_window(count, 3);
            count = decision.state.unwrap();
            admitted.push(decision.admitted);
        }
        assert_eq!(admitted, vec![true, true, true, false]);
        assert_eq!(count, 4);
    }

    #[test]
    fn test_sliding_window_drops_old_stamps() {
        let decision = sliding_window(&[0, 500, 999], 1000, 1000, 3);
        assert!(decision.admitted);
        assert_eq!(decision.state.unwrap(), vec![500, 999, 1000]);

        let decision = sliding_window(&[500, 999, 1000], 1001, 1000, 3);
        assert!(!decision.admitted);
    }

    #[test]
    fn test_leaky_bucket_drains() {
        let first = leaky_bucket(None, 0, 2, 1).state.unwrap();
        let second = leaky_bucket(Some(first), 0, 2, 1).state.unwrap();
        assert_eq!(second.water, 2);
        assert!(!leaky_bucket(Some(second), 0, 2, 1).admitted);
        assert!(!leaky_bucket(Some(second), 999, 2, 1).admitted);

        let decision = leaky_bucket(Some(second), 1000, 2, 1);
        assert!(decision.admitted);
        assert_eq!(decision.state.unwrap(), LeakyState { water: 2, last: 1000 });
    }

    #[test]
    fn test_token_bucket_refills() {
        let mut state = None;
        for _ in 0..5 {
            let decision = token_bucket(state, 0, 5, 5);
            assert!(decision.admitted);
            state = decision.state;
        }
        assert!(!token_bucket(state, 0, 5, 5).admitted);
        assert!(!token_bucket(state, 199, 5, 5).admitted);

        let decision = token_bucket(state, 200, 5, 5);
        assert!(decision.admitted);
        assert_eq!(decision.state.unwrap(), TokenState { tokens: 0, last: 200 });
    }

    #[test]
    fn test_bucket_clock_going_backwards() {
        let state = TokenState { tokens: 0, last: 1000 };
        assert!(!token_bucket(Some(state), 400, 5, 5).admitted);

        let state = TokenState { tokens: 2, last: 1000 };
        let decision = token_bucket(Some(state), 400, 5, 5);
        assert_eq!(decision.state.unwrap(), TokenState { tokens: 1, last: 1000 });

        let state = LeakyState { water: 1, last: 1000 };
        let decision = leaky_bucket(Some(state), 0, 5, 1000);
        assert_eq!(decision.state.unwrap(), LeakyState { water: 2, last: 1000 });
    }

    #[test]
    fn test_hybrid_overflow_queue() {
        assert_eq!(hybrid_bucket(0, 0, 2, 1), HybridAdmission::Token);
        assert_eq!(hybrid_bucket(1, 0, 2, 1), HybridAdmission::Token);
        assert_eq!(hybrid_bucket(2, 0, 2, 1), HybridAdmission::Queued);
        assert_eq!(hybrid_bucket(2, 1, 2, 1), HybridAdmission::Rejected);
        assert!(!HybridAdmission::Rejected.is_admitted());
        assert!(HybridAdmission::Queued.is_admitted());
    }

    proptest! {
        #[test]
        fn prop_token_bucket_never_exceeds_capacity(
            capacity in 0u64..1_000,
            rate in 0u64..10_000,
            tokens in 0u64..1_000,
            last in 0u64..1_000_000,
            now in 0u64..2_000_000,
        ) {
            let state = TokenState { tokens: tokens.min(capacity), last };
            let decision = token_bucket(Some(state), now, capacity, rate);
            match decision.state {
                Some(next) => {
                    prop_assert!(decision.admitted);
                    prop_assert!(next.tokens < capacity);
                    prop_assert!(next.last >= last);
                }
                None => prop_assert!(!decision.admitted),
            }
        }

        #[test]
        fn prop_leaky_bucket_never_overflows(
            capacity in 0u64..1_000,
            rate in 0u64..10_000,
            water in 0u64..1_000,
            last in 0u64..1_000_000,
            now in 0u64..2_000_000,
        ) {
            let state = LeakyState { water: water.min(capacity), last };
            let decision = leaky_bucket(Some(state), now, capacity, rate);
            match decision.state {
                Some(next) => {
                    prop_assert!(decision.admitted);
                    prop_assert!(next.water >= 1 && next.water <= capacity);
                    prop_assert!(next.last >= last);
                }
                None => prop_assert!(!decision.admitted),
            }
        }

        #[test]
        fn prop_sliding_window_keeps_only_live_stamps(
            mut stamps in proptest::collection::vec(0i64..10_000, 0..50),
            now in 0i64..20_000,
            window in 1u64..5_000,
            limit in 0u64..60,
        ) {
            stamps.sort_unstable();
            let decision = sliding_window(&stamps, now, window, limit);
            let live = decision.state.unwrap();
            prop_assert!(live.iter().all(|&s| s > now - window as i64));
            prop_assert!(live.contains(&now));
            prop_assert_eq!(decision.admitted, live.len() as u64 <= limit);
        }

        #[test]
        fn prop_hybrid_admits_at_most_both_limits(
            token_limit in 0u64..50,
            queue_limit in 0u64..50,
            requests in 0usize..200,
        ) {
            let (mut tokens, mut queued, mut admitted) = (0u64, 0u64, 0u64);
            for _ in 0..requests {
                match hybrid_bucket(tokens, queued, token_limit, queue_limit) {
                    HybridAdmission::Token => { tokens += 1; admitted += 1; }
                    HybridAdmission::Queued => { queued += 1; admitted += 1; }
                    HybridAdmission::Rejected => {}
                }
            }
            prop_assert!(admitted <= token_limit + queue_limit);
            prop_assert_eq!(admitted, (requests as u64).min(token_limit + queue_limit));
        }
    }
}
