//! Waits for a registration entry to reach the agent.
//!
//! The agent's health endpoint turns ready as soon as its Workload API socket
//! accepts connections, which is earlier than the entry arriving through the
//! agent's sync with the server. Tests started in that window see "no
//! identity issued", so this wait is kept separate from agent readiness.

use crate::admin::EntryReceipt;
use crate::probe::{Budget, Outcome, Predicate, Probe, Prober, ReadinessCheck};
use common::types::SpiffeId;
use tracing::{info, instrument, warn};

pub struct PropagationWaiter<'a> {
    prober: &'a Prober,
    fetch: &'a dyn Probe,
}

impl<'a> PropagationWaiter<'a> {
    /// `fetch` queries the agent's identity-fetch interface.
    pub fn new(prober: &'a Prober, fetch: &'a dyn Probe) -> Self {
        Self { prober, fetch }
    }

    /// Poll until `workload_id` appears in the fetch output.
    ///
    /// `Outcome::Ready` means the identity is visible. The receipt ties the
    /// wait to an entry that has actually been created.
    #[instrument(skip_all, fields(workload_id = %workload_id, entry_id = receipt.entry_id().unwrap_or("unknown")))]
    pub async fn wait_for_identity(
        &self,
        receipt: &EntryReceipt,
        workload_id: &SpiffeId,
        budget: Budget,
    ) -> Outcome {
        let check = ReadinessCheck::new(
            format!("identity {workload_id}"),
            Predicate::HasToken(workload_id.to_string()),
            budget,
        );

        let outcome = self.prober.wait_until(&check, self.fetch).await;
        match outcome {
            Outcome::Ready { attempts } => info!(attempts, "Workload identity visible"),
            Outcome::TimedOut { attempts } => {
                warn!(attempts, "Workload identity never became visible");
            }
            Outcome::Cancelled { attempts } => warn!(attempts, "Identity wait cancelled"),
        }
        outcome
    }
}
