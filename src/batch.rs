// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Fleet-wide fan-out.
//!
//! Every operation on a node or rack is independent and stateless, so a batch
//! simply runs many of them concurrently. The number in flight is capped to
//! keep shared PDU, BMC, and cluster API gear from being flooded. Results
//! always come back in input order.
//!
//! A failure of one item never aborts the rest of the batch. Each batch
//! returns a [`BatchSummary`] counting how every item fared.
//!
//! Every item is bounded by an overall timeout on top of whatever per-call
//! timeouts the transports apply. Power and outlet state batches get theirs
//! from [`NodePowerSequencer::with_operation_timeout`].

use crate::{
    bmc::{BmcClient, BmcError, BmcRequest, BmcTransport, ChassisPower},
    node::{NodeName, RackName},
    power::{
        outlet::{Outlet, OutletState, OutletTransport, TargetState},
        startup::{NodeStartupStatus, Prober, StartupMonitor, StartupOutcome},
        NodePowerReport, NodePowerSequencer, PowerError,
    },
    rack::{ClusterSource, RackEvaluator, RackReadiness},
};

use futures::{stream, Future, StreamExt};
use serde::Serialize;
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// How a single batch item fared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Succeeded,
    Failed,

    /// Operation went through, but its effect could not be confirmed.
    Unconfirmed,
}

/// Tally of a whole batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub unconfirmed: usize,
}

impl BatchSummary {
    /// Count outcome of one item.
    pub fn record(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Succeeded => self.succeeded += 1,
            ItemOutcome::Failed => self.failed += 1,
            ItemOutcome::Unconfirmed => self.unconfirmed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.unconfirmed
    }

    /// Check if every item fully succeeded.
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.unconfirmed == 0
    }
}

impl FromIterator<ItemOutcome> for BatchSummary {
    fn from_iter<I: IntoIterator<Item = ItemOutcome>>(outcomes: I) -> Self {
        let mut summary = Self::default();
        for outcome in outcomes {
            summary.record(outcome);
        }
        summary
    }
}

impl Display for BatchSummary {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(
            fmt,
            "{} total: {} succeeded, {} failed, {} unconfirmed",
            self.total(),
            self.succeeded,
            self.failed,
            self.unconfirmed
        )
    }
}

/// Run operation over every item with at most `limit` in flight.
///
/// Output order matches input order.
pub async fn fan_out<I, F, Fut>(items: I, limit: usize, operation: F) -> Vec<Fut::Output>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Fut,
    Fut: Future,
{
    stream::iter(items)
        .map(operation)
        .buffered(limit.max(1))
        .collect()
        .await
}

/// Power run settings shared by every node of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerPlan {
    pub target: TargetState,
    pub dry_run: bool,

    /// Confirm startup after powering on, if set.
    pub verify_reachable: Option<Duration>,

    /// Nodes handled at once.
    ///
    /// Outlet calls of those nodes are capped separately by the call limit
    /// of the sequencer's outlet controller.
    pub concurrency: usize,
}

/// Everything that happened to one node of a power batch.
#[derive(Debug)]
pub struct NodePowerOutcome {
    pub node: NodeName,
    pub report: Result<NodePowerReport, PowerError>,
    pub startup: Option<StartupOutcome>,
}

impl NodePowerOutcome {
    pub fn outcome(&self) -> ItemOutcome {
        match (&self.report, &self.startup) {
            (Err(_), _) => ItemOutcome::Failed,
            (Ok(report), _) if !report.is_success() => ItemOutcome::Failed,
            (Ok(_), Some(startup)) if !startup.is_reachable() => ItemOutcome::Unconfirmed,
            (Ok(_), _) => ItemOutcome::Succeeded,
        }
    }
}

impl Display for NodePowerOutcome {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match &self.report {
            Ok(report) => write!(fmt, "{report}")?,
            Err(error) => writeln!(fmt, "{}: FAILED: {error}", self.node)?,
        }

        if let Some(startup) = &self.startup {
            writeln!(fmt, "  startup: {startup}")?;
        }

        Ok(())
    }
}

/// Drive every node to planned state, optionally confirming startup.
///
/// Startup is only monitored for nodes whose outlets all turned on during a
/// real run. The observer sees every startup probe of every node.
pub async fn power_nodes<T, P>(
    sequencer: &NodePowerSequencer<T>,
    monitor: &StartupMonitor<P>,
    nodes: &[NodeName],
    plan: PowerPlan,
    domain_suffix: &str,
    cancel: &CancellationToken,
    observer: impl Fn(&NodeName, &NodeStartupStatus) + Sync,
) -> (Vec<NodePowerOutcome>, BatchSummary)
where
    T: OutletTransport,
    P: Prober,
{
    let observer = &observer;
    let outcomes = fan_out(nodes, plan.concurrency, |node| async move {
        let report = sequencer
            .set_node_power(node, plan.target, plan.dry_run)
            .await;

        let startup = match (&report, plan.verify_reachable) {
            (Ok(report), Some(timeout))
                if report.is_success()
                    && !report.is_dry_run()
                    && plan.target == TargetState::On =>
            {
                let startup = monitor
                    .watch_reachable(
                        &node.to_string(),
                        &node.fqdn(domain_suffix),
                        timeout,
                        cancel,
                        |status| observer(node, status),
                    )
                    .await;
                Some(startup)
            }
            _ => None,
        };

        NodePowerOutcome {
            node: *node,
            report,
            startup,
        }
    })
    .await;

    let summary = outcomes.iter().map(NodePowerOutcome::outcome).collect();
    (outcomes, summary)
}

/// Outlet states of one node.
pub type NodeOutletStates = (NodeName, Result<Vec<(Outlet, OutletState)>, PowerError>);

/// Read outlet states of every node.
///
/// A node counts as succeeded when every one of its outlets could be read.
pub async fn outlet_states<T>(
    sequencer: &NodePowerSequencer<T>,
    nodes: &[NodeName],
    limit: usize,
) -> (Vec<NodeOutletStates>, BatchSummary)
where
    T: OutletTransport,
{
    let states = fan_out(nodes, limit, |node| async move {
        (*node, sequencer.node_outlet_states(node).await)
    })
    .await;

    let summary = states
        .iter()
        .map(|(_, states)| match states {
            Ok(states) if states.iter().all(|(_, state)| *state != OutletState::Unknown) => {
                ItemOutcome::Succeeded
            }
            _ => ItemOutcome::Failed,
        })
        .collect();

    (states, summary)
}

/// Evaluate every rack, each bounded by an overall timeout.
///
/// A rack that cannot be evaluated in time is reported not ready.
pub async fn evaluate_racks<S>(
    evaluator: &RackEvaluator<S>,
    racks: &[RackName],
    limit: usize,
    timeout: Duration,
) -> (Vec<RackReadiness>, BatchSummary)
where
    S: ClusterSource,
{
    let verdicts = fan_out(racks, limit, |rack| async move {
        match tokio::time::timeout(timeout, evaluator.evaluate(*rack)).await {
            Ok(readiness) => readiness,
            Err(_) => {
                warn!("evaluation of {rack} exceeded {}s", timeout.as_secs());
                RackReadiness::unavailable(
                    *rack,
                    evaluator.policy().expected_nodes,
                    format!("evaluation timed out after {}s", timeout.as_secs()),
                )
            }
        }
    })
    .await;

    let summary = verdicts
        .iter()
        .map(|readiness| {
            if readiness.is_ready() {
                ItemOutcome::Succeeded
            } else {
                ItemOutcome::Failed
            }
        })
        .collect();

    (verdicts, summary)
}

/// Reply of one BMC.
#[derive(Debug)]
pub struct BmcReply<O = String> {
    pub node: NodeName,
    pub host: String,
    pub output: Result<O, BmcError>,
}

async fn within_timeout<O>(
    host: &str,
    timeout: Duration,
    call: impl Future<Output = Result<O, BmcError>>,
) -> Result<O, BmcError> {
    tokio::time::timeout(timeout, call)
        .await
        .unwrap_or_else(|_| {
            warn!("{host} exceeded {}s", timeout.as_secs());
            Err(BmcError::TimedOut {
                host: host.into(),
                after: timeout,
            })
        })
}

/// Send the same request to the BMC of every node.
///
/// Each request is bounded by `timeout`.
pub async fn bmc_requests<T>(
    client: &BmcClient<T>,
    nodes: &[NodeName],
    request: BmcRequest,
    limit: usize,
    timeout: Duration,
) -> (Vec<BmcReply>, BatchSummary)
where
    T: BmcTransport,
{
    let replies = fan_out(nodes, limit, |node| async move {
        let host = client.host(node);
        let output = within_timeout(&host, timeout, client.request(node, request)).await;
        BmcReply {
            node: *node,
            host,
            output,
        }
    })
    .await;

    let summary = replies
        .iter()
        .map(|reply| match reply.output {
            Ok(_) => ItemOutcome::Succeeded,
            Err(_) => ItemOutcome::Failed,
        })
        .collect();

    (replies, summary)
}

/// Query chassis power of every node through its BMC.
///
/// A node counts as succeeded only when its power state could be determined.
pub async fn bmc_power_states<T>(
    client: &BmcClient<T>,
    nodes: &[NodeName],
    limit: usize,
    timeout: Duration,
) -> (Vec<BmcReply<ChassisPower>>, BatchSummary)
where
    T: BmcTransport,
{
    let replies = fan_out(nodes, limit, |node| async move {
        let host = client.host(node);
        let output = within_timeout(&host, timeout, client.power_status(node)).await;
        BmcReply {
            node: *node,
            host,
            output,
        }
    })
    .await;

    let summary = replies
        .iter()
        .map(|reply| match reply.output {
            Ok(ChassisPower::On | ChassisPower::Off) => ItemOutcome::Succeeded,
            _ => ItemOutcome::Failed,
        })
        .collect();

    (replies, summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[tokio::test(start_paused = true)]
    async fn fan_out_keeps_input_order() {
        let delays = [30, 10, 20, 0, 5];
        let results = fan_out(delays, 2, |delay| async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            delay
        })
        .await;

        assert_eq!(results, delays.to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn fan_out_caps_in_flight_operations() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        fan_out(0..200, 60, |_| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }
        })
        .await;

        assert_eq!(peak.load(Ordering::SeqCst), 60);
    }

    /// BMC that answers every node except those it ignores.
    struct PartialBmc {
        silent: &'static str,
    }

    impl BmcTransport for PartialBmc {
        async fn execute(&self, host: &str, request: BmcRequest) -> Result<String, BmcError> {
            if host.starts_with(self.silent) {
                std::future::pending::<()>().await;
            }
            Ok(match request {
                BmcRequest::PowerStatus if host.starts_with("c0r21-gn2") => {
                    "Error: Unable to establish IPMI v2 / RMCP+ session".into()
                }
                BmcRequest::PowerStatus => "Chassis Power is on".into(),
                _ => "System Power : on".into(),
            })
        }
    }

    fn nodes() -> Vec<NodeName> {
        ["c0r21-gn1", "c0r21-gn2", "c0r21-gn3"]
            .iter()
            .map(|node| node.parse().unwrap())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn silent_bmc_times_out_alone() {
        let client = BmcClient::new(
            PartialBmc { silent: "c0r21-gn3" },
            "{node}-bmc",
            "example.net",
        );

        let (replies, summary) = bmc_requests(
            &client,
            &nodes(),
            BmcRequest::ChassisStatus,
            60,
            Duration::from_secs(10),
        )
        .await;

        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
        assert!(replies[0].output.is_ok());
        match &replies[2].output {
            Err(BmcError::TimedOut { host, after }) => {
                assert_eq!(host, "c0r21-gn3-bmc.example.net");
                assert_eq!(*after, Duration::from_secs(10));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_chassis_power_is_a_failure() {
        let client = BmcClient::new(
            PartialBmc { silent: "c0r21-gn3" },
            "{node}-bmc",
            "example.net",
        );

        let (replies, summary) =
            bmc_power_states(&client, &nodes(), 60, Duration::from_secs(10)).await;

        assert_eq!(
            summary,
            BatchSummary {
                succeeded: 1,
                failed: 2,
                unconfirmed: 0
            }
        );
        assert_eq!(replies[0].output.as_ref().ok(), Some(&ChassisPower::On));
        assert_eq!(replies[1].output.as_ref().ok(), Some(&ChassisPower::Unknown));
        assert!(replies[2].output.is_err());
    }

    #[test]
    fn summary_counts_outcomes() {
        let summary: BatchSummary = [
            ItemOutcome::Succeeded,
            ItemOutcome::Failed,
            ItemOutcome::Succeeded,
            ItemOutcome::Unconfirmed,
        ]
        .into_iter()
        .collect();

        assert_eq!(
            summary,
            BatchSummary {
                succeeded: 2,
                failed: 1,
                unconfirmed: 1
            }
        );
        assert!(!summary.is_success());
        assert_eq!(
            summary.to_string(),
            "4 total: 2 succeeded, 1 failed, 1 unconfirmed"
        );
        assert!(BatchSummary::default().is_success());
    }
}
