// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Fleet naming scheme.
//!
//! Racks are named after their cabinet and row, e.g., `c0r21`. Nodes inside a
//! rack are numbered from one and named `<rack>-gn<index>`, e.g., `c0r21-gn1`.
//! Two neighbouring racks that are validated together form a __cross-rack__
//! pair named `<rack>-<rack>`, e.g., `c0r21-c0r22`.
//!
//! The PDU connection map does not know about racks at all. It refers to a
//! node by its position alone, `N<index>`, so `c0r21-gn1` is `N1` there.

use serde::Serialize;
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    str::FromStr,
};

/// Name of a rack, e.g., `c0r21`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RackName {
    cabinet: u32,
    row: u32,
}

impl RackName {
    /// Construct new rack name from cabinet and row numbers.
    pub fn new(cabinet: u32, row: u32) -> Self {
        Self { cabinet, row }
    }

    /// Name of node at target index inside this rack.
    pub fn node(&self, index: u32) -> NodeName {
        NodeName { rack: *self, index }
    }
}

impl FromStr for RackName {
    type Err = NodeNameError;

    fn from_str(name: &str) -> Result<Self> {
        let invalid = || NodeNameError::InvalidRack(name.to_string());
        let rest = name.strip_prefix('c').ok_or_else(invalid)?;
        let (cabinet, row) = rest.split_once('r').ok_or_else(invalid)?;

        Ok(Self {
            cabinet: parse_digits(cabinet).ok_or_else(invalid)?,
            row: parse_digits(row).ok_or_else(invalid)?,
        })
    }
}

impl Display for RackName {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(fmt, "c{}r{}", self.cabinet, self.row)
    }
}

impl Serialize for RackName {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Name of a node, e.g., `c0r21-gn1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeName {
    rack: RackName,
    index: u32,
}

impl NodeName {
    /// Rack that houses the node.
    pub fn rack(&self) -> RackName {
        self.rack
    }

    /// Position of node inside its rack, starting from one.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Identifier used for the node by the PDU connection map.
    pub fn map_id(&self) -> String {
        format!("N{}", self.index)
    }

    /// Fully qualified domain name of node.
    ///
    /// An empty domain suffix leaves the bare node name.
    pub fn fqdn(&self, domain_suffix: &str) -> String {
        qualify(self.to_string(), domain_suffix)
    }
}

impl FromStr for NodeName {
    type Err = NodeNameError;

    fn from_str(name: &str) -> Result<Self> {
        let invalid = || NodeNameError::InvalidNode(name.to_string());
        let (rack, node) = name.split_once('-').ok_or_else(invalid)?;
        let rack = rack.parse::<RackName>().map_err(|_| invalid())?;
        let index = node
            .strip_prefix("gn")
            .and_then(parse_digits)
            .ok_or_else(invalid)?;

        Ok(Self { rack, index })
    }
}

impl Display for NodeName {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(fmt, "{}-gn{}", self.rack, self.index)
    }
}

impl Serialize for NodeName {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Rack selection that may name a single rack or a cross-rack pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RackSelector {
    /// Single rack, e.g., `c0r21`.
    Single(RackName),

    /// Cross-rack pair, e.g., `c0r21-c0r22`.
    CrossRack(RackName, RackName),
}

impl RackSelector {
    /// Expand selection into the racks it names.
    pub fn racks(&self) -> Vec<RackName> {
        match self {
            Self::Single(rack) => vec![*rack],
            Self::CrossRack(left, right) => vec![*left, *right],
        }
    }
}

impl FromStr for RackSelector {
    type Err = NodeNameError;

    fn from_str(name: &str) -> Result<Self> {
        match name.split_once('-') {
            Some((left, right)) => {
                let invalid = |_| NodeNameError::InvalidCrossRack(name.to_string());
                Ok(Self::CrossRack(
                    left.parse().map_err(invalid)?,
                    right.parse().map_err(invalid)?,
                ))
            }
            None => Ok(Self::Single(name.parse()?)),
        }
    }
}

/// Attach domain suffix to a host name.
pub(crate) fn qualify(host: String, domain_suffix: &str) -> String {
    let suffix = domain_suffix.trim_start_matches('.');
    if suffix.is_empty() {
        host
    } else {
        format!("{host}.{suffix}")
    }
}

/// Fill `{name}` placeholders of a host template and qualify the result.
pub(crate) fn render_host(template: &str, vars: &[(&str, String)], domain_suffix: &str) -> String {
    let host = vars.iter().fold(template.to_string(), |host, (name, value)| {
        host.replace(&format!("{{{name}}}"), value)
    });

    qualify(host, domain_suffix)
}

fn parse_digits(text: &str) -> Option<u32> {
    if text.is_empty() || !text.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }

    text.parse().ok()
}

/// Naming error types.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum NodeNameError {
    /// Rack name does not follow `c<digits>r<digits>`.
    #[error("invalid rack name {0:?}, expected c<digits>r<digits> (e.g., c0r1)")]
    InvalidRack(String),

    /// Node name does not follow `<rack>-gn<digits>`.
    #[error("invalid node name {0:?}, expected <rack>-gn<digits> (e.g., c0r1-gn1)")]
    InvalidNode(String),

    /// Cross-rack name does not follow `<rack>-<rack>`.
    #[error("invalid cross-rack name {0:?}, expected <rack>-<rack> (e.g., c0r1-c0r2)")]
    InvalidCrossRack(String),
}

/// Friendly result alias :3
type Result<T, E = NodeNameError> = std::result::Result<T, E>;
