//! `TimerService` (spec.md §4.6): a correlation-id keyed timer set with
//! replay semantics across leadership changes.

use std::collections::BTreeMap;
use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;

/// One scheduled timer, keyed by the correlation id the service used when it
/// called `schedule`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerEntry {
    pub correlation_id: i64,
    pub deadline_ns: u64,
}

#[derive(Debug, Clone, Default)]
pub struct TimerService {
    /// Keyed by deadline first so `poll` can pop expired timers in order,
    /// then by correlation id to break ties deterministically.
    by_deadline: BTreeMap<(u64, i64), ()>,
    by_correlation: HashMap<i64, u64>,

    /// Cancellations observed before the corresponding expired-timer replay
    /// event: absorbed the next time that event is replayed instead of
    /// re-arming a timer that was already cancelled (spec.md §4.6).
    expired_timer_count_by_correlation_id: HashMap<i64, u32>,
}

impl TimerService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, correlation_id: i64, deadline_ns: u64) {
        if let Some(&old_deadline) = self.by_correlation.get(&correlation_id) {
            self.by_deadline.remove(&(old_deadline, correlation_id));
        }
        self.by_deadline.insert((deadline_ns, correlation_id), ());
        self.by_correlation.insert(correlation_id, deadline_ns);
    }

    pub fn cancel(&mut self, correlation_id: i64) -> bool {
        match self.by_correlation.remove(&correlation_id) {
            Some(deadline) => {
                self.by_deadline.remove(&(deadline, correlation_id));
                true
            }
            None => {
                // Not currently scheduled: this cancel arrived for a timer
                // whose expiry event has not yet been replayed. Remember it
                // so the eventual replay is absorbed rather than re-armed.
                *self.expired_timer_count_by_correlation_id.entry(correlation_id).or_insert(0) += 1;
                false
            }
        }
    }

    /// Pops every timer whose deadline is `<= now_ns`, most-overdue first.
    /// Each firing still has to be appended to the log by the caller and
    /// only fans out to the service once that append commits (spec.md §4.6).
    pub fn poll(&mut self, now_ns: u64) -> Vec<TimerEntry> {
        let mut fired = Vec::new();
        loop {
            let next = match self.by_deadline.iter().next() {
                Some((&(deadline, correlation_id), _)) if deadline <= now_ns => (deadline, correlation_id),
                _ => break,
            };
            self.by_deadline.remove(&next);
            self.by_correlation.remove(&next.1);
            fired.push(TimerEntry {
                correlation_id: next.1,
                deadline_ns: next.0,
            });
        }
        fired
    }

    /// Applied when replaying a previously-logged "timer expired" event: if
    /// a cancel for this correlation id was already observed and absorbed,
    /// consume it instead of treating the event as live.
    pub fn replay_expired(&mut self, correlation_id: i64) -> bool {
        match self.expired_timer_count_by_correlation_id.get_mut(&correlation_id) {
            Some(count) if *count > 0 => {
                *count -= 1;
                if *count == 0 {
                    self.expired_timer_count_by_correlation_id.remove(&correlation_id);
                }
                false
            }
            _ => true,
        }
    }

    pub fn snapshot_entries(&self) -> Vec<TimerEntry> {
        self.by_deadline
            .keys()
            .map(|&(deadline_ns, correlation_id)| TimerEntry { correlation_id, deadline_ns })
            .collect()
    }

    pub fn restore(&mut self, entries: Vec<TimerEntry>) {
        self.by_deadline.clear();
        self.by_correlation.clear();
        for e in entries {
            self.schedule(e.correlation_id, e.deadline_ns);
        }
    }

    pub fn len(&self) -> usize {
        self.by_correlation.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_correlation.is_empty()
    }
}
