//! Hybrid Logical Clock.
//!
//! `(ts, counter, node)` with a total order: wall millis first, then
//! counter, then lexicographic node id. Every replica ticks its clock
//! for local writes and absorbs every remote clock it observes *before*
//! comparing entries, which keeps the local clock monotonic even on
//! replicas that never write.

use serde::{Deserialize, Serialize};

/// One hybrid logical timestamp. Field order gives the derived `Ord`
/// exactly the comparison rule: `ts`, then `counter`, then `node`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hlc {
    pub ts: i64,
    pub counter: u32,
    pub node: String,
}

impl Hlc {
    /// A zero clock for `node`; any real tick or merge moves past it.
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            ts: 0,
            counter: 0,
            node: node.into(),
        }
    }

    /// Advance for a local event using the wall clock.
    pub fn tick(&mut self) {
        self.tick_at(now_millis());
    }

    /// Advance for a local event at an explicit wall time.
    pub fn tick_at(&mut self, now: i64) {
        let ts = now.max(self.ts);
        self.counter = if ts == self.ts { self.counter + 1 } else { 0 };
        self.ts = ts;
    }

    /// Absorb an observed remote clock using the wall clock.
    pub fn merge(&mut self, remote: &Hlc) {
        self.merge_at(remote, now_millis());
    }

    /// Absorb an observed remote clock at an explicit wall time.
    ///
    /// The node id never changes: a merge records that this replica has
    /// seen the remote event, it does not adopt the remote identity.
    pub fn merge_at(&mut self, remote: &Hlc, now: i64) {
        let ts = now.max(self.ts).max(remote.ts);
        self.counter = if ts == self.ts && ts == remote.ts {
            self.counter.max(remote.counter) + 1
        } else if ts == self.ts {
            self.counter + 1
        } else if ts == remote.ts {
            remote.counter + 1
        } else {
            0
        };
        self.ts = ts;
    }
}

/// Current wall clock in milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
