//! proptest strategies for allocation scenarios.

use proptest::prelude::*;

/// One step of a randomized sale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaleStep {
    /// Submit every `(user, key)` pair at once, racing a confirm of the `nth`
    /// granted reservation and an expiry sweep.
    ///
    /// Indices point into the scenario's user and key pools; the small ranges
    /// put duplicate keys and repeat users into the same batch.
    Burst {
        /// `(user, key)` index pairs, in submission order
        requests: Vec<(usize, usize)>,
        /// Index into granted reservations, modulo their count
        confirm: usize,
    },
    /// Confirm the `nth` reservation granted so far, if it exists
    Confirm {
        /// Index into granted reservations, modulo their count
        nth: usize,
    },
    /// Advance time by this many seconds, then sweep
    Advance {
        /// Seconds to advance
        seconds: u64,
    },
}

/// Stock between 0 and `max_stock`
pub fn stock(max_stock: u32) -> impl Strategy<Value = u32> {
    0..=max_stock
}

/// Sequences of bursts, confirms and time jumps over `users` users.
///
/// Keys are drawn from a pool twice the size of the user pool so duplicate
/// keys and repeat users both show up often.
pub fn sale_steps(users: usize, max_len: usize) -> impl Strategy<Value = Vec<SaleStep>> {
    let users = users.max(1);
    let request = (0..users, 0..users * 2);
    let step = prop_oneof![
        6 => (proptest::collection::vec(request, 1..=6), any::<usize>())
            .prop_map(|(requests, confirm)| SaleStep::Burst { requests, confirm }),
        2 => any::<usize>().prop_map(|nth| SaleStep::Confirm { nth }),
        2 => (1..30_u64).prop_map(|seconds| SaleStep::Advance { seconds }),
    ];
    proptest::collection::vec(step, 1..=max_len)
}
