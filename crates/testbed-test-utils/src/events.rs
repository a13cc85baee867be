//! Ordered record of calls made to the fakes.
//!
//! All fakes of one test share a single log, so tests can assert on the
//! relative order of launches, probes and administrative calls.

use spire_testbed::Service;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Started(Service),
    Stopped(Service, u32),
    Probed(&'static str),
    TokenIssued,
    EntryCreated,
    TestsRun,
}

#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<Event>>>);

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    /// Index of the first occurrence of `event`.
    pub fn position(&self, event: &Event) -> Option<usize> {
        self.0.lock().unwrap().iter().position(|e| e == event)
    }

    pub fn count(&self, event: &Event) -> usize {
        self.0.lock().unwrap().iter().filter(|e| *e == event).count()
    }

    pub fn contains(&self, event: &Event) -> bool {
        self.position(event).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_one_log() {
        let log = EventLog::new();
        let other = log.clone();
        log.push(Event::TokenIssued);
        other.push(Event::EntryCreated);

        assert_eq!(log.snapshot(), vec![Event::TokenIssued, Event::EntryCreated]);
        assert_eq!(log.position(&Event::EntryCreated), Some(1));
        assert_eq!(log.count(&Event::TestsRun), 0);
    }
}
