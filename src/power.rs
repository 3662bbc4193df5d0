// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Node power sequencing.
//!
//! Every node draws power through several power supplies, each plugged into
//! its own PDU outlet. Powering a node on or off means driving all of those
//! outlets to the same state.
//!
//! # Sequencing
//!
//! The outlets of a node are resolved through the [`ConnectionMap`], then
//! switched independently of each other. There is no ordering between them
//! and no rollback: if one outlet refuses, the others still get their
//! attempt, and the [`NodePowerReport`] lists every outcome so a partial
//! failure is visible. The node counts as powered only when every outlet
//! reports the requested state.
//!
//! A node whose outlet count differs from the expected number of power
//! supplies is still sequenced, but the report flags the discrepancy. A node
//! sharing an outlet with another node is refused outright.
//!
//! Each node operation may be bounded by an overall deadline. Outlets that do
//! not finish in time are reported as failed with an unknown state, next to
//! the outlets that did finish.
//!
//! # Dry Runs
//!
//! A dry run resolves outlets exactly like a real run, but never touches the
//! outlet transport. Each outlet yields a planned [`PowerOperationResult`].
//!
//! # Known Limitation
//!
//! Nothing coordinates two invocations switching the same outlet at the same
//! time. The PDU serializes or races them at its own discretion.

pub mod map;
pub mod outlet;
pub mod startup;

use crate::{
    config::Settings,
    node::{render_host, NodeName, RackName},
    power::{
        map::{ConnectionMap, OutletConflict},
        outlet::{
            Outlet, OutletController, OutletState, OutletTransport, PowerOperationResult,
            SnmpTransport, TargetState,
        },
    },
};

use futures::{future::join_all, Future};
use serde::Serialize;
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    time::Duration,
};
use tokio::time::{timeout_at, Instant};
use tracing::{info, instrument, warn};

/// Where PDUs live on the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PduTopology {
    host_template: String,
    domain_suffix: String,
}

impl PduTopology {
    /// Construct new PDU topology.
    ///
    /// Template placeholders `{rack}` and `{pdu}` are filled per outlet.
    pub fn new(host_template: impl Into<String>, domain_suffix: impl Into<String>) -> Self {
        Self {
            host_template: host_template.into(),
            domain_suffix: domain_suffix.into(),
        }
    }

    /// Host name of target PDU inside target rack.
    pub fn host(&self, rack: RackName, pdu_id: u32) -> String {
        render_host(
            &self.host_template,
            &[("rack", rack.to_string()), ("pdu", pdu_id.to_string())],
            &self.domain_suffix,
        )
    }
}

/// Drive every power supply outlet of a node to a target state.
#[derive(Debug)]
pub struct NodePowerSequencer<T = SnmpTransport>
where
    T: OutletTransport,
{
    map: ConnectionMap,
    controller: OutletController<T>,
    topology: PduTopology,
    expected_psus: usize,
    operation_timeout: Option<Duration>,
}

impl NodePowerSequencer {
    /// Construct new sequencer speaking SNMP according to settings.
    ///
    /// Outlet calls in flight are capped at the batch concurrency, and every
    /// node operation is bounded by the batch operation timeout.
    pub fn from_settings(map: ConnectionMap, settings: &Settings) -> Self {
        let pdu = &settings.pdu;
        let controller = OutletController::new(SnmpTransport::new(pdu), pdu.settle_delay())
            .with_call_limit(settings.batch.concurrency);

        Self::new(
            map,
            controller,
            PduTopology::new(pdu.host_template.as_str(), settings.cluster.domain_suffix.as_str()),
            pdu.psus_per_node,
        )
        .with_operation_timeout(settings.batch.operation_timeout())
    }
}

impl<T> NodePowerSequencer<T>
where
    T: OutletTransport,
{
    /// Construct new node power sequencer.
    pub fn new(
        map: ConnectionMap,
        controller: OutletController<T>,
        topology: PduTopology,
        expected_psus: usize,
    ) -> Self {
        Self {
            map,
            controller,
            topology,
            expected_psus,
            operation_timeout: None,
        }
    }

    /// Bound every node operation by an overall timeout.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    /// Borrow outlet controller.
    pub fn controller(&self) -> &OutletController<T> {
        &self.controller
    }

    /// Resolve outlets feeding target node.
    ///
    /// # Errors
    ///
    /// - Return [`PowerError::NodeNotInMap`] if connection map has no entry
    ///   for the node.
    /// - Return [`PowerError::OutletConflict`] if the node shares an outlet
    ///   with another node.
    pub fn outlets(&self, node: &NodeName) -> Result<Vec<Outlet>> {
        if let Some(conflict) = self.map.conflicts_for(&node.map_id()).first() {
            return Err(PowerError::OutletConflict {
                node: *node,
                conflict: (*conflict).clone(),
            });
        }

        let connections = self.map.connections_for(&node.map_id());
        if connections.is_empty() {
            return Err(PowerError::NodeNotInMap {
                node: *node,
                map_id: node.map_id(),
            });
        }

        if connections.len() != self.expected_psus {
            warn!(
                "{node} has {} outlet connections, expected {}",
                connections.len(),
                self.expected_psus
            );
        }

        Ok(connections
            .into_iter()
            .map(|connection| Outlet {
                host: self.topology.host(node.rack(), connection.pdu_id),
                connection,
            })
            .collect())
    }

    /// Drive all outlets of target node to target state.
    ///
    /// Every outlet gets its attempt regardless of how the others fared.
    ///
    /// # Errors
    ///
    /// - Return [`PowerError::NodeNotInMap`] if connection map has no entry
    ///   for the node.
    /// - Return [`PowerError::OutletConflict`] if the node shares an outlet
    ///   with another node.
    #[instrument(skip(self, node), fields(node = %node), level = "debug")]
    pub async fn set_node_power(
        &self,
        node: &NodeName,
        target: TargetState,
        dry_run: bool,
    ) -> Result<NodePowerReport> {
        let outlets = self.outlets(node)?;

        let results: Vec<PowerOperationResult> = if dry_run {
            outlets
                .into_iter()
                .map(|outlet| {
                    info!("[dry-run] {node}: would set {outlet} {target}");
                    PowerOperationResult::planned(outlet.connection, target)
                })
                .collect()
        } else {
            info!("{node}: switching {} outlets {target}", outlets.len());
            let deadline = self.deadline();
            join_all(outlets.iter().map(|outlet| async move {
                match within(deadline, self.controller.set_state(outlet, target)).await {
                    Some(result) => result,
                    None => {
                        warn!("{node}: {outlet} did not finish in time");
                        PowerOperationResult::timed_out(
                            outlet.connection.clone(),
                            target,
                            self.operation_timeout.unwrap_or_default(),
                        )
                    }
                }
            }))
            .await
        };

        Ok(NodePowerReport {
            node: *node,
            target,
            dry_run,
            expected_connections: self.expected_psus,
            results,
        })
    }

    /// Read current state of every outlet feeding target node.
    ///
    /// Outlets that do not answer before the operation deadline read as
    /// [`OutletState::Unknown`].
    ///
    /// # Errors
    ///
    /// - Return [`PowerError::NodeNotInMap`] if connection map has no entry
    ///   for the node.
    /// - Return [`PowerError::OutletConflict`] if the node shares an outlet
    ///   with another node.
    pub async fn node_outlet_states(&self, node: &NodeName) -> Result<Vec<(Outlet, OutletState)>> {
        let outlets = self.outlets(node)?;
        let deadline = self.deadline();
        let states = join_all(outlets.iter().map(|outlet| async move {
            within(deadline, self.controller.get_state(outlet))
                .await
                .unwrap_or(OutletState::Unknown)
        }))
        .await;

        Ok(outlets.into_iter().zip(states).collect())
    }

    fn deadline(&self) -> Option<Instant> {
        self.operation_timeout.map(|timeout| Instant::now() + timeout)
    }
}

// Yields nothing if deadline passes first.
async fn within<F: Future>(deadline: Option<Instant>, operation: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => timeout_at(deadline, operation).await.ok(),
        None => Some(operation.await),
    }
}

/// Every outlet outcome of one node power operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodePowerReport {
    node: NodeName,
    target: TargetState,
    dry_run: bool,
    expected_connections: usize,
    results: Vec<PowerOperationResult>,
}

impl NodePowerReport {
    pub fn node(&self) -> NodeName {
        self.node
    }

    pub fn target(&self) -> TargetState {
        self.target
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn results(&self) -> &[PowerOperationResult] {
        &self.results
    }

    /// Check if every outlet reached the requested state.
    pub fn is_success(&self) -> bool {
        !self.results.is_empty() && self.results.iter().all(PowerOperationResult::success)
    }

    /// Check if outlet count differs from the expected power supply count.
    pub fn has_connection_discrepancy(&self) -> bool {
        self.results.len() != self.expected_connections
    }
}

impl Display for NodePowerReport {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let succeeded = self.results.iter().filter(|result| result.success()).count();
        let verdict = match (self.dry_run, self.is_success()) {
            (true, _) => "planned",
            (false, true) => "ok",
            (false, false) => "FAILED",
        };
        writeln!(
            fmt,
            "{} {}: {verdict} ({succeeded}/{} outlets)",
            self.node,
            self.target,
            self.results.len()
        )?;
        if self.has_connection_discrepancy() {
            writeln!(
                fmt,
                "  warning: {} outlet connections, expected {}",
                self.results.len(),
                self.expected_connections
            )?;
        }
        for result in &self.results {
            writeln!(fmt, "  {result}")?;
        }

        Ok(())
    }
}

/// Power sequencing error types.
#[derive(Debug, thiserror::Error)]
pub enum PowerError {
    /// Connection map knows nothing about the node.
    #[error("node {node} ({map_id}) not found in connection map")]
    NodeNotInMap { node: NodeName, map_id: String },

    /// Node shares a PDU outlet with another node.
    #[error("node {node} cannot be switched safely: {conflict}")]
    OutletConflict {
        node: NodeName,
        conflict: OutletConflict,
    },
}

/// Friendly result alias :3
pub type Result<T, E = PowerError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::power::outlet::TransportError;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use std::{
        collections::HashSet,
        sync::{Arc, Mutex},
        time::Duration,
    };

    /// Outlet transport that records calls and fails writes on chosen ports.
    #[derive(Debug, Clone, Default)]
    struct RecordingTransport {
        calls: Arc<Mutex<Vec<String>>>,
        on: Arc<Mutex<HashSet<(String, u32)>>>,
        broken_ports: HashSet<u32>,
        silent_ports: HashSet<u32>,
    }

    impl RecordingTransport {
        async fn maybe_hang(&self, outlet: &Outlet) {
            if self.silent_ports.contains(&outlet.port()) {
                std::future::pending::<()>().await;
            }
        }
    }

    impl OutletTransport for RecordingTransport {
        async fn read(&self, outlet: &Outlet) -> outlet::Result<i64> {
            self.calls.lock().unwrap().push(format!("read {outlet}"));
            self.maybe_hang(outlet).await;
            let on = self
                .on
                .lock()
                .unwrap()
                .contains(&(outlet.host.clone(), outlet.port()));
            Ok(if on { 1 } else { 0 })
        }

        async fn write(&self, outlet: &Outlet, value: i64) -> outlet::Result<()> {
            self.calls.lock().unwrap().push(format!("write {outlet} {value}"));
            self.maybe_hang(outlet).await;
            if self.broken_ports.contains(&outlet.port()) {
                return Err(TransportError::Malformed {
                    raw: "snmpset: Timeout".into(),
                });
            }
            let key = (outlet.host.clone(), outlet.port());
            let mut on = self.on.lock().unwrap();
            if value == 2 {
                on.insert(key);
            } else {
                on.remove(&key);
            }
            Ok(())
        }
    }

    const MAP: &str = indoc! {r#"
        N1/PSU1
        2ft/0.6m
        PDU1/Port39
        N1/PSU2
        PDU1/Port41
        N1/PSU3
        PDU2/Port39
        N1/PSU4
        PDU2/Port41
        N2/PSU1
        PDU1/Port37
    "#};

    fn sequencer(transport: RecordingTransport) -> NodePowerSequencer<RecordingTransport> {
        NodePowerSequencer::new(
            ConnectionMap::parse(MAP),
            OutletController::new(transport, Duration::ZERO),
            PduTopology::new("{rack}-pdu{pdu}", "yka1.example.net"),
            4,
        )
    }

    #[test]
    fn outlets_resolve_pdu_hosts() -> anyhow::Result<()> {
        let node: NodeName = "c0r21-gn1".parse()?;
        let outlets = sequencer(RecordingTransport::default()).outlets(&node)?;

        let hosts = outlets
            .iter()
            .map(|outlet| (outlet.host.as_str(), outlet.port()))
            .collect::<Vec<_>>();
        assert_eq!(
            hosts,
            vec![
                ("c0r21-pdu1.yka1.example.net", 39),
                ("c0r21-pdu1.yka1.example.net", 41),
                ("c0r21-pdu2.yka1.example.net", 39),
                ("c0r21-pdu2.yka1.example.net", 41),
            ]
        );

        Ok(())
    }

    #[tokio::test]
    async fn dry_run_never_touches_transport() -> anyhow::Result<()> {
        let transport = RecordingTransport::default();
        let node: NodeName = "c0r21-gn1".parse()?;

        let report = sequencer(transport.clone())
            .set_node_power(&node, TargetState::On, true)
            .await?;

        assert!(report.is_success());
        assert!(report.is_dry_run());
        assert_eq!(report.results().len(), 4);
        assert!(report.results().iter().all(PowerOperationResult::is_dry_run));
        assert!(transport.calls.lock().unwrap().is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn partial_failure_attempts_every_outlet() -> anyhow::Result<()> {
        let transport = RecordingTransport {
            broken_ports: HashSet::from([41]),
            ..RecordingTransport::default()
        };
        let node: NodeName = "c0r21-gn1".parse()?;

        let report = sequencer(transport.clone())
            .set_node_power(&node, TargetState::On, false)
            .await?;

        let outcomes = report
            .results()
            .iter()
            .map(|result| (result.connection().psu_index, result.success()))
            .collect::<Vec<_>>();
        assert_eq!(outcomes, vec![(1, true), (2, false), (3, true), (4, false)]);
        assert!(!report.is_success());

        let writes = transport
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.starts_with("write"))
            .count();
        assert_eq!(writes, 4);

        Ok(())
    }

    #[tokio::test]
    async fn power_off_then_read_states() -> anyhow::Result<()> {
        let node: NodeName = "c0r21-gn1".parse()?;
        let sequencer = sequencer(RecordingTransport::default());

        let report = sequencer.set_node_power(&node, TargetState::On, false).await?;
        assert!(report.is_success());
        let states = sequencer.node_outlet_states(&node).await?;
        assert!(states.iter().all(|(_, state)| *state == OutletState::On));

        let report = sequencer.set_node_power(&node, TargetState::Off, false).await?;
        assert!(report.is_success());
        let states = sequencer.node_outlet_states(&node).await?;
        assert!(states.iter().all(|(_, state)| *state == OutletState::Off));

        Ok(())
    }

    #[tokio::test]
    async fn short_node_is_flagged_but_sequenced() -> anyhow::Result<()> {
        let node: NodeName = "c0r21-gn2".parse()?;

        let report = sequencer(RecordingTransport::default())
            .set_node_power(&node, TargetState::On, false)
            .await?;

        assert_eq!(report.results().len(), 1);
        assert!(report.has_connection_discrepancy());
        assert!(report.is_success());
        assert!(report.to_string().contains("1 outlet connections, expected 4"));

        Ok(())
    }

    #[tokio::test]
    async fn unknown_node_is_a_configuration_error() -> anyhow::Result<()> {
        let node: NodeName = "c0r21-gn9".parse()?;

        let result = sequencer(RecordingTransport::default())
            .set_node_power(&node, TargetState::Off, false)
            .await;

        assert!(matches!(result, Err(PowerError::NodeNotInMap { .. })));

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn silent_outlets_fail_at_deadline() -> anyhow::Result<()> {
        let transport = RecordingTransport {
            silent_ports: HashSet::from([41]),
            ..RecordingTransport::default()
        };
        let node: NodeName = "c0r21-gn1".parse()?;
        let sequencer = sequencer(transport).with_operation_timeout(Duration::from_secs(30));
        let start = tokio::time::Instant::now();

        let report = sequencer.set_node_power(&node, TargetState::On, false).await?;

        assert_eq!(start.elapsed(), Duration::from_secs(30));
        assert!(!report.is_success());
        let outcomes = report
            .results()
            .iter()
            .map(|result| (result.connection().port, result.achieved_state()))
            .collect::<Vec<_>>();
        assert_eq!(
            outcomes,
            vec![
                (39, OutletState::On),
                (41, OutletState::Unknown),
                (39, OutletState::On),
                (41, OutletState::Unknown),
            ]
        );
        assert!(report.results()[1]
            .error_detail()
            .is_some_and(|detail| detail.contains("no answer within 30s")));

        let states = sequencer.node_outlet_states(&node).await?;
        let states = states.iter().map(|(_, state)| *state).collect::<Vec<_>>();
        assert_eq!(
            states,
            vec![
                OutletState::On,
                OutletState::Unknown,
                OutletState::On,
                OutletState::Unknown,
            ]
        );

        Ok(())
    }

    #[test]
    fn nodes_sharing_outlet_are_refused() -> anyhow::Result<()> {
        let map = ConnectionMap::parse(indoc! {r#"
            N1/PSU1
            PDU1/Port39
            N2/PSU1
            PDU2/Port5
            N3/PSU1
            PDU2/Port5
        "#});
        let sequencer = NodePowerSequencer::new(
            map,
            OutletController::new(RecordingTransport::default(), Duration::ZERO),
            PduTopology::new("{rack}-pdu{pdu}", "yka1.example.net"),
            1,
        );

        assert_eq!(sequencer.outlets(&"c0r21-gn1".parse()?)?.len(), 1);
        for node in ["c0r21-gn2", "c0r21-gn3"] {
            let result = sequencer.outlets(&node.parse()?);
            assert!(matches!(result, Err(PowerError::OutletConflict { .. })));
        }

        Ok(())
    }
}
