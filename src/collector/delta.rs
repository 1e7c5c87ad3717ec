//! Traffic delta computation.
//!
//! Counters in status reports are cumulative per session, so the ledger
//! stores differences between consecutive samples. Each direction is judged
//! on its own: a concentrator restart or client reconnect can reset one
//! counter while the other keeps climbing.

use crate::status::Counters;

/// Result of comparing one sample against the prior one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeltaOutcome {
    pub delta: Counters,
    pub reset_in: bool,
    pub reset_out: bool,
}

impl DeltaOutcome {
    pub fn any_reset(&self) -> bool {
        self.reset_in || self.reset_out
    }
}

/// Delta for one direction of an active session.
///
/// A current value below the prior one means the counter restarted from
/// zero; the full current value is then the best available estimate of
/// traffic since the reset.
fn directional_delta(prior: u64, current: u64) -> (u64, bool) {
    if current >= prior {
        (current - prior, false)
    } else {
        (current, true)
    }
}

/// Delta for an active session against its prior sample.
///
/// Without a prior sample the session is new to the ledger and its full
/// cumulative counters count as this cycle's contribution.
pub fn active_delta(prior: Option<Counters>, current: Counters) -> DeltaOutcome {
    let Some(prior) = prior else {
        return DeltaOutcome {
            delta: current,
            reset_in: false,
            reset_out: false,
        };
    };

    let (bytes_in, reset_in) = directional_delta(prior.bytes_in, current.bytes_in);
    let (bytes_out, reset_out) = directional_delta(prior.bytes_out, current.bytes_out);

    DeltaOutcome {
        delta: Counters { bytes_in, bytes_out },
        reset_in,
        reset_out,
    }
}

/// Final delta for a session that left the report.
///
/// The last-known counters from the session record stand in for the current
/// sample. A last-known value below the prior sample yields nothing for that
/// direction; the reset heuristic needs a follow-up sample that a closed
/// session will never produce.
pub fn closing_delta(prior: Option<Counters>, last_known: Counters) -> Counters {
    let Some(prior) = prior else {
        return last_known;
    };

    Counters {
        bytes_in: last_known.bytes_in.saturating_sub(prior.bytes_in),
        bytes_out: last_known.bytes_out.saturating_sub(prior.bytes_out),
    }
}
