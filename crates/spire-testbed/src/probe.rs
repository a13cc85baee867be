//! Readiness probing.
//!
//! One parameterized poll-until-true primitive serves every wait in a run:
//! the server health endpoint, the agent health endpoint and the workload
//! identity fetch. A probe never fails; connection refused, a command that
//! cannot run or a non-zero exit are all just "not ready yet".

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Stand-in for timeouts too large to add to the current instant.
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// `now + timeout`, capped at [`FAR_FUTURE`] when the sum is not representable.
pub fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Raw result of one probe invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// HTTP status code.
    Status(u16),
    /// Successful command output (stdout).
    Output(String),
    /// The target could not be reached this time.
    Unreachable(String),
}

/// Pure predicate over an [`Observation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    StatusEquals(u16),
    /// Output contains the substring anywhere.
    Contains(String),
    /// Output contains the value as a whole whitespace-separated token, so
    /// `spiffe://example.org/web` does not match `spiffe://example.org/web2`.
    HasToken(String),
}

impl Predicate {
    pub fn evaluate(&self, observation: &Observation) -> bool {
        match (self, observation) {
            (Predicate::StatusEquals(expected), Observation::Status(actual)) => expected == actual,
            (Predicate::Contains(needle), Observation::Output(out)) => out.contains(needle.as_str()),
            (Predicate::HasToken(token), Observation::Output(out)) => {
                out.split_whitespace().any(|t| t == token.as_str())
            }
            _ => false,
        }
    }
}

/// Finite wait budget of one readiness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Optional attempt ceiling on top of the wall-clock timeout.
    pub max_attempts: Option<u32>,
}

impl Budget {
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
            max_attempts: None,
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// A named predicate paired with its budget. Stateless and reusable.
#[derive(Debug, Clone)]
pub struct ReadinessCheck {
    pub name: String,
    pub predicate: Predicate,
    pub budget: Budget,
}

impl ReadinessCheck {
    pub fn new(name: impl Into<String>, predicate: Predicate, budget: Budget) -> Self {
        Self {
            name: name.into(),
            predicate,
            budget,
        }
    }
}

/// Result of a readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ready { attempts: u32 },
    TimedOut { attempts: u32 },
    Cancelled { attempts: u32 },
}

impl Outcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, Outcome::Ready { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Outcome::Ready { attempts }
            | Outcome::TimedOut { attempts }
            | Outcome::Cancelled { attempts } => *attempts,
        }
    }
}

/// Something that can be observed repeatedly.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self) -> Observation;
}

/// Polls probes until a predicate holds, the budget runs out, or the run is
/// cancelled.
#[derive(Debug, Clone)]
pub struct Prober {
    cancel: CancellationToken,
    run_deadline: Option<Instant>,
}

impl Prober {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            run_deadline: None,
        }
    }

    /// Cap every wait at an overall run deadline in addition to its own budget.
    #[must_use]
    pub fn with_run_deadline(mut self, deadline: Instant) -> Self {
        self.run_deadline = Some(deadline);
        self
    }

    /// Probe until `check.predicate` holds.
    ///
    /// Returns `Ready` immediately on the first passing observation, so a
    /// predicate that first holds on probe N costs exactly N probe calls.
    /// Never-passing checks return `TimedOut` once the budget (or the run
    /// deadline, whichever is sooner) is spent.
    pub async fn wait_until(&self, check: &ReadinessCheck, probe: &dyn Probe) -> Outcome {
        let stage_deadline = deadline_after(check.budget.timeout);
        let deadline = match self.run_deadline {
            Some(run_deadline) => stage_deadline.min(run_deadline),
            None => stage_deadline,
        };
        let mut attempts = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                return Outcome::Cancelled { attempts };
            }

            attempts = attempts.saturating_add(1);
            let observation = probe.probe().await;
            if check.predicate.evaluate(&observation) {
                debug!(check = %check.name, attempts, "Readiness check passed");
                return Outcome::Ready { attempts };
            }
            debug!(check = %check.name, attempts, ?observation, "Not ready yet");

            let now = Instant::now();
            let out_of_attempts = check.budget.max_attempts.is_some_and(|max| attempts >= max);
            if out_of_attempts || now >= deadline {
                warn!(
                    check = %check.name,
                    attempts,
                    timeout_ms = check.budget.timeout.as_millis(),
                    "Readiness check timed out"
                );
                return Outcome::TimedOut { attempts };
            }

            // Cap the sleep at the remaining budget
            let delay = check
                .budget
                .poll_interval
                .min(deadline.saturating_duration_since(now));

            tokio::select! {
                () = self.cancel.cancelled() => {
                    return Outcome::Cancelled { attempts };
                }
                () = sleep(delay) => {}
            }
        }
    }
}

/// GET a URL and report its status code.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self) -> Observation {
        match self.client.get(&self.url).send().await {
            Ok(response) => Observation::Status(response.status().as_u16()),
            Err(e) => Observation::Unreachable(e.to_string()),
        }
    }
}

/// Run a command and report its stdout. Non-zero exits are unreachable.
#[derive(Debug, Clone)]
pub struct CommandProbe {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandProbe {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }
}

#[async_trait]
impl Probe for CommandProbe {
    async fn probe(&self) -> Observation {
        let output = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(self.timeout, output).await {
            Err(_) => Observation::Unreachable(format!(
                "{} did not finish within {:?}",
                self.program.display(),
                self.timeout
            )),
            Ok(Err(e)) => Observation::Unreachable(format!("{}: {e}", self.program.display())),
            Ok(Ok(output)) if output.status.success() => {
                Observation::Output(String::from_utf8_lossy(&output.stdout).into_owned())
            }
            Ok(Ok(output)) => Observation::Unreachable(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Unreachable until call `ready_on`, then status 200.
    struct CountingProbe {
        calls: AtomicU32,
        ready_on: Option<u32>,
    }

    impl CountingProbe {
        fn ready_on(n: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                ready_on: Some(n),
            }
        }

        fn never() -> Self {
            Self {
                calls: AtomicU32::new(0),
                ready_on: None,
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Probe for CountingProbe {
        async fn probe(&self) -> Observation {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            match self.ready_on {
                Some(n) if call >= n => Observation::Status(200),
                _ => Observation::Unreachable("connection refused".to_string()),
            }
        }
    }

    fn check(timeout: Duration, interval: Duration) -> ReadinessCheck {
        ReadinessCheck::new(
            "test",
            Predicate::StatusEquals(200),
            Budget::new(timeout, interval),
        )
    }

    #[test]
    fn test_predicates() {
        let ok = Observation::Status(200);
        let fetched = Observation::Output(
            "Received 1 svid after 1ms\n\nSPIFFE ID:\t\tspiffe://example.org/web2\n".to_string(),
        );

        assert!(Predicate::StatusEquals(200).evaluate(&ok));
        assert!(!Predicate::StatusEquals(200).evaluate(&Observation::Status(503)));
        assert!(!Predicate::StatusEquals(200).evaluate(&fetched));

        assert!(Predicate::Contains("spiffe://example.org/web".to_string()).evaluate(&fetched));
        assert!(!Predicate::HasToken("spiffe://example.org/web".to_string()).evaluate(&fetched));
        assert!(Predicate::HasToken("spiffe://example.org/web2".to_string()).evaluate(&fetched));

        assert!(!Predicate::Contains("refused".to_string())
            .evaluate(&Observation::Unreachable("connection refused".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_exactly_n_probes() {
        let prober = Prober::new(CancellationToken::new());
        let probe = CountingProbe::ready_on(4);

        let outcome = prober
            .wait_until(
                &check(Duration::from_secs(30), Duration::from_secs(1)),
                &probe,
            )
            .await;

        assert_eq!(outcome, Outcome::Ready { attempts: 4 });
        assert_eq!(probe.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_immediately_does_not_sleep() {
        let prober = Prober::new(CancellationToken::new());
        let probe = CountingProbe::ready_on(1);
        let start = Instant::now();

        let outcome = prober
            .wait_until(
                &check(Duration::from_secs(30), Duration::from_secs(5)),
                &probe,
            )
            .await;

        assert!(outcome.is_ready());
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_within_budget() {
        let prober = Prober::new(CancellationToken::new());
        let probe = CountingProbe::never();
        let timeout = Duration::from_secs(10);
        let interval = Duration::from_secs(3);
        let start = Instant::now();

        let outcome = prober.wait_until(&check(timeout, interval), &probe).await;

        assert!(matches!(outcome, Outcome::TimedOut { .. }));
        assert!(start.elapsed() <= timeout + interval);
        // Probes at 0, 3, 6, 9 and the capped final one at 10.
        assert_eq!(probe.calls(), 5);
        assert_eq!(outcome.attempts(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_timeout_still_polls() {
        let prober = Prober::new(CancellationToken::new())
            .with_run_deadline(deadline_after(Duration::from_secs(u64::MAX)));
        let probe = CountingProbe::ready_on(3);

        let outcome = prober
            .wait_until(
                &check(Duration::from_secs(u64::MAX), Duration::from_secs(1)),
                &probe,
            )
            .await;

        assert_eq!(outcome, Outcome::Ready { attempts: 3 });
    }

    #[test]
    fn test_deadline_after_caps_huge_timeouts() {
        let now = Instant::now();
        let deadline = deadline_after(Duration::MAX);

        assert!(deadline > now);
        assert!(deadline <= Instant::now() + FAR_FUTURE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_ceiling() {
        let prober = Prober::new(CancellationToken::new());
        let probe = CountingProbe::never();
        let check = ReadinessCheck::new(
            "ceiling",
            Predicate::StatusEquals(200),
            Budget::new(Duration::from_secs(600), Duration::from_secs(1)).with_max_attempts(3),
        );

        let outcome = prober.wait_until(&check, &probe).await;

        assert_eq!(outcome, Outcome::TimedOut { attempts: 3 });
        assert_eq!(probe.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_deadline_caps_stage_budget() {
        let prober =
            Prober::new(CancellationToken::new()).with_run_deadline(Instant::now() + Duration::from_secs(2));
        let probe = CountingProbe::never();
        let start = Instant::now();

        let outcome = prober
            .wait_until(
                &check(Duration::from_secs(60), Duration::from_secs(1)),
                &probe,
            )
            .await;

        assert!(matches!(outcome, Outcome::TimedOut { .. }));
        assert!(start.elapsed() <= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_sleep() {
        let cancel = CancellationToken::new();
        let prober = Prober::new(cancel.clone());
        let probe = CountingProbe::never();

        let canceller = tokio::spawn(async move {
            sleep(Duration::from_millis(1500)).await;
            cancel.cancel();
        });

        let outcome = prober
            .wait_until(
                &check(Duration::from_secs(60), Duration::from_secs(1)),
                &probe,
            )
            .await;
        canceller.await.unwrap();

        assert_eq!(outcome, Outcome::Cancelled { attempts: 2 });
    }

    #[tokio::test]
    async fn test_command_probe_reports_stdout() {
        let probe = CommandProbe::new(
            "sh",
            vec!["-c".to_string(), "echo SPIFFE ID: spiffe://example.org/w".to_string()],
            Duration::from_secs(5),
        );
        let observation = probe.probe().await;
        assert!(Predicate::HasToken("spiffe://example.org/w".to_string()).evaluate(&observation));
    }

    #[tokio::test]
    async fn test_command_probe_failure_is_unreachable() {
        let failing = CommandProbe::new(
            "sh",
            vec!["-c".to_string(), "echo no socket >&2; exit 1".to_string()],
            Duration::from_secs(5),
        );
        match failing.probe().await {
            Observation::Unreachable(msg) => assert!(msg.contains("no socket")),
            other => panic!("expected unreachable, got {other:?}"),
        }

        let missing = CommandProbe::new("/nonexistent/spire-agent", vec![], Duration::from_secs(5));
        assert!(matches!(missing.probe().await, Observation::Unreachable(_)));
    }
}
