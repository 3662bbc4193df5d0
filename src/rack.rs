// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Rack readiness evaluation.
//!
//! A rack is a fixed-size group of nodes, nine by default, named
//! `<rack>-gn1` through `<rack>-gn<expected>`. The rack is __ready__ only when
//! exactly that set of nodes is present and every one of them passes every
//! check of the [`ReadinessPolicy`]:
//!
//! 1. The `Ready` condition is true. An absent or unknown condition fails.
//! 2. Node is not cordoned, unless that check is disabled.
//! 3. Node does not carry the repair taint, if one is configured.
//! 4. Every required label is present with its required value.
//!
//! On top of per-node checks, every uniform label must be present on every
//! node and carry the same value on all of them. A node lacking one fails on
//! its own. Nodes outside the expected index range are reported as unexpected
//! and break the exact count rule.
//!
//! Evaluation is fail-closed. If the cluster cannot be queried, the rack is
//! reported not ready together with the query error.

pub mod kube;

pub use kube::{ClusterQueryError, ClusterSource, KubectlSource, NodeRecord};

use crate::{
    config::{RackSettings, RequiredLabel},
    node::{NodeName, RackName},
};

use serde::Serialize;
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{Display, Formatter, Result as FmtResult},
};
use tracing::{instrument, warn};

/// Single check a node failed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum CheckFailure {
    /// `Ready` condition is false.
    NotReady,

    /// `Ready` condition is unknown or absent.
    ReadyUnknown,

    /// Node is cordoned.
    Cordoned,

    /// Node carries the repair taint.
    RepairTaint { key: String },

    /// Required label is absent.
    LabelMissing { name: String, key: String },

    /// Required label has the wrong value.
    LabelMismatch {
        name: String,
        key: String,
        expected: String,
        actual: String,
    },

    /// Label that must agree across the rack is absent.
    UniformLabelMissing { key: String },
}

impl Display for CheckFailure {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::NotReady => write!(fmt, "not ready"),
            Self::ReadyUnknown => write!(fmt, "ready condition unknown"),
            Self::Cordoned => write!(fmt, "cordoned"),
            Self::RepairTaint { key } => write!(fmt, "tainted {key}"),
            Self::LabelMissing { name, key } => write!(fmt, "{name}: label {key} missing"),
            Self::LabelMismatch {
                name,
                key,
                expected,
                actual,
            } => write!(fmt, "{name}: {key}={actual}, expected {expected}"),
            Self::UniformLabelMissing { key } => write!(fmt, "label {key} missing"),
        }
    }
}

/// Label whose value differs across nodes of a rack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InconsistentLabel {
    pub key: String,

    /// Nodes grouped by the value they carry.
    pub values: BTreeMap<String, Vec<String>>,
}

impl Display for InconsistentLabel {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let values = self
            .values
            .iter()
            .map(|(value, nodes)| format!("{value} ({})", nodes.len()))
            .collect::<Vec<_>>()
            .join(", ");
        write!(fmt, "{} differs: {values}", self.key)
    }
}

/// Checks every node of a rack must pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub expected_nodes: u32,
    pub reject_cordoned: bool,
    pub repair_taint: Option<String>,
    pub required_labels: Vec<RequiredLabel>,
    pub uniform_labels: Vec<String>,
}

impl ReadinessPolicy {
    /// Construct policy from rack settings.
    pub fn from_settings(settings: &RackSettings) -> Self {
        Self {
            expected_nodes: settings.expected_nodes,
            reject_cordoned: settings.reject_cordoned,
            repair_taint: settings.repair_taint.clone(),
            required_labels: settings.required_labels.clone(),
            uniform_labels: settings.uniform_labels.clone(),
        }
    }

    /// Override expected node count.
    pub fn with_expected_nodes(mut self, expected_nodes: u32) -> Self {
        self.expected_nodes = expected_nodes;
        self
    }

    /// Determine checks target node fails.
    pub fn node_failures(&self, record: &NodeRecord) -> BTreeSet<CheckFailure> {
        let mut failures = BTreeSet::new();

        match record.ready {
            Some(true) => {}
            Some(false) => {
                failures.insert(CheckFailure::NotReady);
            }
            None => {
                failures.insert(CheckFailure::ReadyUnknown);
            }
        }

        if self.reject_cordoned && record.unschedulable {
            failures.insert(CheckFailure::Cordoned);
        }

        if let Some(taint) = &self.repair_taint {
            if record.taints.iter().any(|key| key == taint) {
                failures.insert(CheckFailure::RepairTaint { key: taint.clone() });
            }
        }

        for label in &self.required_labels {
            match record.labels.get(&label.key) {
                None => {
                    failures.insert(CheckFailure::LabelMissing {
                        name: label.name.clone(),
                        key: label.key.clone(),
                    });
                }
                Some(actual) if *actual != label.value => {
                    failures.insert(CheckFailure::LabelMismatch {
                        name: label.name.clone(),
                        key: label.key.clone(),
                        expected: label.value.clone(),
                        actual: actual.clone(),
                    });
                }
                Some(_) => {}
            }
        }

        for key in &self.uniform_labels {
            if !record.labels.contains_key(key) {
                failures.insert(CheckFailure::UniformLabelMissing { key: key.clone() });
            }
        }

        failures
    }

    /// Assess rack from records of its present nodes.
    pub fn assess(&self, rack: RackName, records: &[NodeRecord]) -> RackReadiness {
        let expected: BTreeSet<NodeName> = (1..=self.expected_nodes)
            .map(|index| rack.node(index))
            .collect();
        let present: BTreeSet<NodeName> = records.iter().map(|record| record.name).collect();

        let mut readiness = RackReadiness::empty(rack, self.expected_nodes);
        readiness.node_count = present.len();
        readiness.missing_nodes = expected
            .difference(&present)
            .map(ToString::to_string)
            .collect();
        readiness.unexpected_nodes = present
            .difference(&expected)
            .map(ToString::to_string)
            .collect();

        // Records naming the same node merge, so one failing copy fails it.
        for record in records {
            readiness
                .per_node_conditions
                .entry(record.name.to_string())
                .or_default()
                .extend(self.node_failures(record));
        }
        readiness.ready_node_count = readiness
            .per_node_conditions
            .values()
            .filter(|failures| failures.is_empty())
            .count();

        for key in &self.uniform_labels {
            let mut values: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for record in records {
                if let Some(value) = record.labels.get(key) {
                    values
                        .entry(value.clone())
                        .or_default()
                        .push(record.name.to_string());
                }
            }

            if values.len() > 1 {
                readiness.inconsistent_labels.push(InconsistentLabel {
                    key: key.clone(),
                    values,
                });
            }
        }

        readiness
    }
}

/// Verdict on a single rack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RackReadiness {
    pub rack_id: RackName,
    pub expected_node_count: u32,
    pub node_count: usize,
    pub ready_node_count: usize,

    /// Expected nodes absent from the cluster.
    pub missing_nodes: Vec<String>,

    /// Present nodes outside the expected index range.
    pub unexpected_nodes: Vec<String>,

    /// Failed checks per present node, empty for passing nodes.
    pub per_node_conditions: BTreeMap<String, BTreeSet<CheckFailure>>,

    pub inconsistent_labels: Vec<InconsistentLabel>,

    /// Reason rack could not be evaluated at all.
    pub source_error: Option<String>,
}

impl RackReadiness {
    fn empty(rack: RackName, expected_nodes: u32) -> Self {
        Self {
            rack_id: rack,
            expected_node_count: expected_nodes,
            node_count: 0,
            ready_node_count: 0,
            missing_nodes: Vec::new(),
            unexpected_nodes: Vec::new(),
            per_node_conditions: BTreeMap::new(),
            inconsistent_labels: Vec::new(),
            source_error: None,
        }
    }

    /// Rack that could not be evaluated.
    pub fn unavailable(rack: RackName, expected_nodes: u32, error: impl Display) -> Self {
        let mut readiness = Self::empty(rack, expected_nodes);
        readiness.source_error = Some(error.to_string());
        readiness
    }

    /// Check if rack is ready.
    pub fn is_ready(&self) -> bool {
        self.source_error.is_none()
            && self.node_count == self.expected_node_count as usize
            && self.ready_node_count == self.node_count
            && self.failing_nodes().next().is_none()
            && self.missing_nodes.is_empty()
            && self.unexpected_nodes.is_empty()
            && self.inconsistent_labels.is_empty()
    }

    /// Present nodes with at least one failed check.
    pub fn failing_nodes(&self) -> impl Iterator<Item = (&String, &BTreeSet<CheckFailure>)> {
        self.per_node_conditions
            .iter()
            .filter(|(_, failures)| !failures.is_empty())
    }
}

impl Display for RackReadiness {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let verdict = if self.is_ready() { "READY" } else { "NOT READY" };
        writeln!(
            fmt,
            "{}: {verdict} ({}/{} nodes ready, {} present)",
            self.rack_id, self.ready_node_count, self.expected_node_count, self.node_count
        )?;

        if let Some(error) = &self.source_error {
            writeln!(fmt, "  query failed: {error}")?;
        }

        for node in &self.missing_nodes {
            writeln!(fmt, "  {node}: missing")?;
        }

        for node in &self.unexpected_nodes {
            writeln!(fmt, "  {node}: unexpected")?;
        }

        for (node, failures) in self.failing_nodes() {
            let failures = failures
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            writeln!(fmt, "  {node}: {failures}")?;
        }

        for label in &self.inconsistent_labels {
            writeln!(fmt, "  {label}")?;
        }

        Ok(())
    }
}

/// Evaluate rack readiness against live cluster state.
#[derive(Debug, Clone)]
pub struct RackEvaluator<S = KubectlSource>
where
    S: ClusterSource,
{
    source: S,
    policy: ReadinessPolicy,
}

impl<S> RackEvaluator<S>
where
    S: ClusterSource,
{
    /// Construct new rack evaluator.
    pub fn new(source: S, policy: ReadinessPolicy) -> Self {
        Self { source, policy }
    }

    pub fn policy(&self) -> &ReadinessPolicy {
        &self.policy
    }

    /// Evaluate readiness of target rack.
    ///
    /// Never fails. A failed cluster query yields a rack that is not ready.
    #[instrument(skip(self), level = "debug")]
    pub async fn evaluate(&self, rack: RackName) -> RackReadiness {
        match self.source.rack_nodes(rack).await {
            Ok(records) => self.policy.assess(rack, &records),
            Err(error) => {
                warn!("cannot evaluate {rack}: {error}");
                RackReadiness::unavailable(rack, self.policy.expected_nodes, error)
            }
        }
    }
}
