// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Startup confirmation.
//!
//! After a node is powered on, its host name is probed until it answers
//! steadily or a deadline passes. A single answer is not trusted: during boot
//! the BMC can respond before the operating system network stack is up. So a
//! node only counts as reachable after a run of consecutive successful probes,
//! three by default. Any failed probe resets the run.
//!
//! Monitoring stops as soon as its [`CancellationToken`] fires, including in
//! the middle of a probe or a wait.

use crate::{config::StartupSettings, syscall::Invocation};

use serde::Serialize;
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    future::Future,
    time::Duration,
};
use tokio::time::{sleep_until, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Final outcome of startup monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StartupOutcome {
    /// Every probe succeeded from the first one on.
    ReachableImmediately,

    /// Node became stable after at least one failed probe.
    ReachableAfterWait { elapsed: Duration },

    /// Deadline passed before the node was stable.
    TimedOut { elapsed: Duration },

    /// Monitoring was interrupted.
    Cancelled { elapsed: Duration },
}

impl StartupOutcome {
    /// Check if node was confirmed reachable.
    pub fn is_reachable(&self) -> bool {
        matches!(
            self,
            Self::ReachableImmediately | Self::ReachableAfterWait { .. }
        )
    }
}

impl Display for StartupOutcome {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::ReachableImmediately => write!(fmt, "reachable"),
            Self::ReachableAfterWait { elapsed } => {
                write!(fmt, "reachable after {}s", elapsed.as_secs())
            }
            Self::TimedOut { elapsed } => write!(fmt, "TIMED OUT after {}s", elapsed.as_secs()),
            Self::Cancelled { elapsed } => write!(fmt, "cancelled after {}s", elapsed.as_secs()),
        }
    }
}

/// Phase of startup monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MonitorState {
    /// Probe in flight.
    Checking,

    /// Sleeping until next probe.
    Waiting,

    /// Node is stable.
    Confirmed,

    /// Deadline passed.
    TimedOut,
}

/// Live view of a node while its startup is monitored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStartupStatus {
    pub node_id: String,
    pub fqdn: String,
    pub reachable: bool,
    pub elapsed: Duration,
    pub consecutive_success_count: u32,
    pub state: MonitorState,
}

impl NodeStartupStatus {
    fn new(node_id: impl Into<String>, fqdn: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            fqdn: fqdn.into(),
            reachable: false,
            elapsed: Duration::ZERO,
            consecutive_success_count: 0,
            state: MonitorState::Checking,
        }
    }
}

/// Lightweight reachability check.
pub trait Prober: Send + Sync {
    /// Probe target host once, true if it answered.
    fn probe(&self, fqdn: &str) -> impl Future<Output = bool> + Send;
}

/// Probe host with a single ICMP echo through `ping`.
#[derive(Debug, Clone)]
pub struct PingProber {
    timeout: Duration,
}

impl PingProber {
    /// Construct new ping prober with per-probe timeout.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub(crate) fn invocation(&self, fqdn: &str) -> Invocation {
        Invocation::new("ping")
            .args(["-c", "1", "-W"])
            .arg(self.timeout.as_secs().max(1).to_string())
            .arg(fqdn)
            .timeout(self.timeout + Duration::from_secs(1))
    }
}

impl Prober for PingProber {
    async fn probe(&self, fqdn: &str) -> bool {
        match self.invocation(fqdn).run().await {
            Ok(_) => true,
            Err(error) => {
                debug!("{fqdn} did not answer: {error}");
                false
            }
        }
    }
}

/// Poll a node until it is stably reachable.
#[derive(Debug, Clone)]
pub struct StartupMonitor<P = PingProber>
where
    P: Prober,
{
    prober: P,
    interval: Duration,
    required_successes: u32,
}

impl StartupMonitor {
    /// Construct new ping based monitor from startup settings.
    pub fn from_settings(settings: &StartupSettings) -> Self {
        Self::new(
            PingProber::new(settings.probe_timeout()),
            settings.probe_interval(),
            settings.required_successes,
        )
    }
}

impl<P> StartupMonitor<P>
where
    P: Prober,
{
    /// Construct new startup monitor.
    ///
    /// At least one success is always required.
    pub fn new(prober: P, interval: Duration, required_successes: u32) -> Self {
        Self {
            prober,
            interval,
            required_successes: required_successes.max(1),
        }
    }

    /// Wait until target host is stably reachable.
    pub async fn await_reachable(
        &self,
        node_id: &str,
        fqdn: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> StartupOutcome {
        self.watch_reachable(node_id, fqdn, timeout, cancel, |_| {})
            .await
    }

    /// Wait until target host is stably reachable, reporting every probe.
    ///
    /// The callback sees the node status after each probe and on the final
    /// transition.
    #[instrument(skip(self, timeout, cancel, on_probe), level = "debug")]
    pub async fn watch_reachable(
        &self,
        node_id: &str,
        fqdn: &str,
        timeout: Duration,
        cancel: &CancellationToken,
        mut on_probe: impl FnMut(&NodeStartupStatus),
    ) -> StartupOutcome {
        let start = Instant::now();
        let deadline = start + timeout;
        let mut status = NodeStartupStatus::new(node_id, fqdn);
        let mut saw_failure = false;

        loop {
            status.state = MonitorState::Checking;
            let probe = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return cancelled(fqdn, start);
                }
                probe = timeout_at(deadline, self.prober.probe(fqdn)) => probe,
            };

            status.elapsed = start.elapsed();
            match probe {
                Ok(true) => status.consecutive_success_count += 1,
                Ok(false) => {
                    status.consecutive_success_count = 0;
                    saw_failure = true;
                }
                Err(_) => return timed_out(&mut status, &mut on_probe),
            }

            if status.consecutive_success_count >= self.required_successes {
                status.reachable = true;
                status.state = MonitorState::Confirmed;
                on_probe(&status);
                info!("{fqdn} reachable after {}s", status.elapsed.as_secs());
                return if saw_failure {
                    StartupOutcome::ReachableAfterWait {
                        elapsed: status.elapsed,
                    }
                } else {
                    StartupOutcome::ReachableImmediately
                };
            }

            if Instant::now() >= deadline {
                return timed_out(&mut status, &mut on_probe);
            }

            status.state = MonitorState::Waiting;
            on_probe(&status);

            let wake = (Instant::now() + self.interval).min(deadline);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return cancelled(fqdn, start);
                }
                _ = sleep_until(wake) => {}
            }

            if Instant::now() >= deadline {
                status.elapsed = start.elapsed();
                return timed_out(&mut status, &mut on_probe);
            }
        }
    }
}

fn timed_out(
    status: &mut NodeStartupStatus,
    on_probe: &mut impl FnMut(&NodeStartupStatus),
) -> StartupOutcome {
    status.state = MonitorState::TimedOut;
    on_probe(status);
    warn!(
        "{} not stable after {}s",
        status.fqdn,
        status.elapsed.as_secs()
    );

    StartupOutcome::TimedOut {
        elapsed: status.elapsed,
    }
}

fn cancelled(fqdn: &str, start: Instant) -> StartupOutcome {
    info!("stopped watching {fqdn}");
    StartupOutcome::Cancelled {
        elapsed: start.elapsed(),
    }
}
