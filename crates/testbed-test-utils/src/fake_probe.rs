//! Probe that replays a script of observations.

use crate::events::{Event, EventLog};
use async_trait::async_trait;
use spire_testbed::probe::{Observation, Probe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// Replays its script one observation per call, then repeats the last one.
#[derive(Debug)]
pub struct ScriptedProbe {
    name: &'static str,
    events: EventLog,
    script: Mutex<Vec<Observation>>,
    calls: AtomicU32,
}

impl ScriptedProbe {
    pub fn new(name: &'static str, events: EventLog, script: Vec<Observation>) -> Self {
        assert!(!script.is_empty(), "a probe script needs at least one observation");
        Self {
            name,
            events,
            script: Mutex::new(script),
            calls: AtomicU32::new(0),
        }
    }

    /// Health endpoint answering 200 from call `n` on. `None` never does.
    pub fn healthy_after(name: &'static str, events: EventLog, n: Option<u32>) -> Self {
        let refused = Observation::Unreachable("connection refused".to_string());
        let script = match n {
            Some(n) => {
                let mut script = vec![refused; n.saturating_sub(1) as usize];
                script.push(Observation::Status(200));
                script
            }
            None => vec![refused],
        };
        Self::new(name, events, script)
    }

    /// Identity fetch listing `spiffe_id` from call `n` on. `None` never does.
    pub fn identity_after(
        name: &'static str,
        events: EventLog,
        spiffe_id: &str,
        n: Option<u32>,
    ) -> Self {
        let missing = Observation::Unreachable("no identity issued".to_string());
        let script = match n {
            Some(n) => {
                let mut script = vec![missing; n.saturating_sub(1) as usize];
                script.push(Observation::Output(format!(
                    "Received 1 svid after 3.2ms\n\nSPIFFE ID:\t\t{spiffe_id}\nSVID Valid After:\t2026-10-19 12:00:00 +0000 UTC\n"
                )));
                script
            }
            None => vec![missing],
        };
        Self::new(name, events, script)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Probe for ScriptedProbe {
    async fn probe(&self) -> Observation {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.events.push(Event::Probed(self.name));
        let mut script = self.script.lock().unwrap();
        if script.len() > 1 {
            script.remove(0)
        } else {
            script.first().cloned().unwrap()
        }
    }
}
