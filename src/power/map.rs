// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! PDU connection map parsing.
//!
//! The connection map records which PDU outlet feeds each power supply of each
//! node in a rack. It is a plain line-oriented text file exported from cabling
//! sheets, so it is parsed leniently rather than against a strict grammar.
//!
//! # Layout
//!
//! A record is spread over up to three lines:
//!
//! ```text
//! N1/PSU1
//! 2ft/0.6m
//! PDU1/Port39
//! ```
//!
//! The device line names a node and one of its power supplies. The cable line
//! is optional and gives the physical cable length. The port line names the
//! PDU and outlet port, closing the record. Blank lines and lines holding
//! only a number (row counters from the cabling sheet) are skipped anywhere.
//!
//! # Lenient Parsing
//!
//! A line that does not fit the record being assembled abandons that record
//! and parsing starts over from the offending line. Each abandoned record is
//! reported through a [`ParseWarning`] so callers can surface it, but it never
//! fails the parse.
//!
//! # Outlet Conflicts
//!
//! A record claiming an outlet that an earlier record already holds is kept
//! out of the connection list and recorded as an [`OutletConflict`]. Both
//! nodes involved become unusable, every other node stays usable.

use serde::Serialize;
use std::{
    collections::HashMap,
    fmt::{Display, Formatter, Result as FmtResult},
    fs::read_to_string,
    path::{Path, PathBuf},
};

const FEET_TO_METERS: f64 = 0.3048;

/// One power supply to PDU outlet connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PduConnection {
    /// Node identifier as written in the map, e.g., `N1`.
    pub node_id: String,

    /// Power supply index on the node, starting from one.
    pub psu_index: u32,

    /// PDU index inside the rack, starting from one.
    pub pdu_id: u32,

    /// Outlet port on the PDU.
    pub port: u32,

    /// Physical cable length, if the map records it.
    pub cable_length_meters: Option<f64>,
}

impl Display for PduConnection {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(
            fmt,
            "{}/PSU{} -> PDU{}/Port{}",
            self.node_id, self.psu_index, self.pdu_id, self.port
        )?;
        if let Some(length) = self.cable_length_meters {
            write!(fmt, " ({length}m)")?;
        }

        Ok(())
    }
}

/// Abandoned record reported during lenient parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseWarning {
    /// Line number of the offending line, starting from one.
    pub line_number: usize,

    /// Offending line as written.
    pub line: String,

    /// Device line of the abandoned record.
    pub abandoned: String,
}

impl Display for ParseWarning {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(
            fmt,
            "line {}: {:?} interrupts record {:?}, record dropped",
            self.line_number, self.line, self.abandoned
        )
    }
}

/// Two power supplies claiming the same PDU outlet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutletConflict {
    /// Connection that claimed the outlet first.
    pub first: PduConnection,

    /// Later connection claiming the same outlet.
    pub second: PduConnection,
}

impl OutletConflict {
    /// Check if target node is one of the claimants.
    pub fn involves(&self, node_id: &str) -> bool {
        self.first.node_id.eq_ignore_ascii_case(node_id)
            || self.second.node_id.eq_ignore_ascii_case(node_id)
    }
}

impl Display for OutletConflict {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(
            fmt,
            "PDU{}/Port{} is claimed by both {} and {}",
            self.first.pdu_id,
            self.first.port,
            psu_name(&self.first),
            psu_name(&self.second)
        )
    }
}

/// Parsed PDU connection map.
///
/// # Invariant
///
/// - No two connections share the same PDU outlet.
/// - Connections keep the order they appear in the map.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ConnectionMap {
    connections: Vec<PduConnection>,
    conflicts: Vec<OutletConflict>,
}

impl ConnectionMap {
    /// Load connection map from target file.
    ///
    /// # Errors
    ///
    /// - Return [`MapError::Read`] if file cannot be read.
    pub fn load(
        path: impl AsRef<Path>,
        on_warning: impl FnMut(&ParseWarning),
    ) -> Result<Self> {
        let text = read_to_string(path.as_ref()).map_err(|source| MapError::Read {
            source,
            path: path.as_ref().to_path_buf(),
        })?;

        Ok(Self::parse_with(&text, on_warning))
    }

    /// Parse connection map, ignoring abandoned records.
    pub fn parse(text: &str) -> Self {
        Self::parse_with(text, |_| {})
    }

    /// Parse connection map, reporting abandoned records to a callback.
    pub fn parse_with(text: &str, mut on_warning: impl FnMut(&ParseWarning)) -> Self {
        let mut connections: Vec<PduConnection> = Vec::new();
        let mut conflicts: Vec<OutletConflict> = Vec::new();
        let mut owners: HashMap<(u32, u32), usize> = HashMap::new();
        let mut state = ScanState::SeekingDevice;

        for (number, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if is_skippable(line) {
                continue;
            }

            let (next, emitted) = state.advance(line, |abandoned| {
                on_warning(&ParseWarning {
                    line_number: number + 1,
                    line: line.to_string(),
                    abandoned: abandoned.to_string(),
                })
            });
            state = next;

            if let Some(connection) = emitted {
                let outlet = (connection.pdu_id, connection.port);
                if let Some(first) = owners.get(&outlet) {
                    conflicts.push(OutletConflict {
                        first: connections[*first].clone(),
                        second: connection,
                    });
                    continue;
                }

                owners.insert(outlet, connections.len());
                connections.push(connection);
            }
        }

        if let ScanState::ExpectCable(device) | ScanState::ExpectPdu(device, _) = &state {
            on_warning(&ParseWarning {
                line_number: text.lines().count(),
                line: String::new(),
                abandoned: device.to_string(),
            });
        }

        Self {
            connections,
            conflicts,
        }
    }

    /// Connections of target node, in map order.
    ///
    /// Unknown nodes yield an empty listing. It is up to the caller to decide
    /// whether that is fatal.
    pub fn connections_for(&self, node_id: &str) -> Vec<PduConnection> {
        self.connections
            .iter()
            .filter(|connection| connection.node_id.eq_ignore_ascii_case(node_id))
            .cloned()
            .collect()
    }

    /// All connections in map order.
    pub fn connections(&self) -> &[PduConnection] {
        &self.connections
    }

    /// Outlet conflicts target node is part of.
    pub fn conflicts_for(&self, node_id: &str) -> Vec<&OutletConflict> {
        self.conflicts
            .iter()
            .filter(|conflict| conflict.involves(node_id))
            .collect()
    }

    /// All outlet conflicts in map order.
    pub fn conflicts(&self) -> &[OutletConflict] {
        &self.conflicts
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Device {
    node_id: String,
    psu_index: u32,
}

impl Display for Device {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(fmt, "{}/PSU{}", self.node_id, self.psu_index)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum ScanState {
    SeekingDevice,
    ExpectCable(Device),
    ExpectPdu(Device, Option<f64>),
}

impl ScanState {
    fn advance(
        self,
        line: &str,
        mut on_reset: impl FnMut(&Device),
    ) -> (Self, Option<PduConnection>) {
        match self {
            Self::SeekingDevice => match parse_device(line) {
                Some(device) => (Self::ExpectCable(device), None),
                None => (Self::SeekingDevice, None),
            },
            Self::ExpectCable(device) => {
                if let Some(length) = parse_cable_length(line) {
                    (Self::ExpectPdu(device, Some(length)), None)
                } else if let Some((pdu_id, port)) = parse_outlet(line) {
                    (Self::SeekingDevice, Some(close(device, None, pdu_id, port)))
                } else {
                    on_reset(&device);
                    Self::SeekingDevice.advance(line, on_reset)
                }
            }
            Self::ExpectPdu(device, length) => match parse_outlet(line) {
                Some((pdu_id, port)) => {
                    (Self::SeekingDevice, Some(close(device, length, pdu_id, port)))
                }
                None => {
                    on_reset(&device);
                    Self::SeekingDevice.advance(line, on_reset)
                }
            },
        }
    }
}

fn close(device: Device, length: Option<f64>, pdu_id: u32, port: u32) -> PduConnection {
    PduConnection {
        node_id: device.node_id,
        psu_index: device.psu_index,
        pdu_id,
        port,
        cable_length_meters: length,
    }
}

fn psu_name(connection: &PduConnection) -> String {
    format!("{}/PSU{}", connection.node_id, connection.psu_index)
}

fn is_skippable(line: &str) -> bool {
    line.is_empty() || line.bytes().all(|byte| byte.is_ascii_digit())
}

// Device line, e.g., "N1/PSU1".
fn parse_device(line: &str) -> Option<Device> {
    let (node, psu) = line.split_once('/')?;
    let psu_index = strip_prefix_ignore_case(psu, "psu")?.parse().ok()?;
    let is_node = node.len() > 1
        && node.as_bytes()[0].eq_ignore_ascii_case(&b'n')
        && node[1..].bytes().all(|byte| byte.is_ascii_digit());
    if !is_node {
        return None;
    }

    Some(Device {
        node_id: node.to_ascii_uppercase(),
        psu_index,
    })
}

// Port line, e.g., "PDU1/Port39" or "PDU1/39".
fn parse_outlet(line: &str) -> Option<(u32, u32)> {
    let (pdu, port) = line.split_once('/')?;
    let pdu_id = strip_prefix_ignore_case(pdu, "pdu")?.parse().ok()?;
    let port = strip_prefix_ignore_case(port, "port")
        .unwrap_or(port)
        .parse()
        .ok()?;

    Some((pdu_id, port))
}

// Cable line, e.g., "2ft/0.6m", "0.6m", or "2ft". Metres win over feet.
fn parse_cable_length(line: &str) -> Option<f64> {
    let mut feet = None;
    let mut meters = None;
    for part in line.split('/').map(str::trim) {
        let lower = part.to_ascii_lowercase();
        if let Some(value) = lower.strip_suffix("ft") {
            feet = Some(value.trim().parse::<f64>().ok()?);
        } else if let Some(value) = lower.strip_suffix('m') {
            meters = Some(value.trim().parse::<f64>().ok()?);
        } else {
            return None;
        }
    }

    meters.or(feet.map(|feet| feet * FEET_TO_METERS))
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&text[prefix.len()..])
    } else {
        None
    }
}

/// Connection map error types.
#[derive(Debug, thiserror::Error)]
pub enum MapError {
    /// Map file cannot be read.
    #[error("failed to read connection map at {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = MapError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use simple_test_case::test_case;

    fn connection(node: &str, psu: u32, pdu: u32, port: u32, length: Option<f64>) -> PduConnection {
        PduConnection {
            node_id: node.into(),
            psu_index: psu,
            pdu_id: pdu,
            port,
            cable_length_meters: length,
        }
    }

    #[test]
    fn parse_four_supplies_in_order() {
        let map = ConnectionMap::parse(indoc! {r#"
            1
            N1/PSU1
            2ft/0.6m
            PDU1/Port39

            2
            N1/PSU2
            PDU1/Port41
            3
            N1/PSU3
            0.6m
            PDU2/Port39
            4
            N1/PSU4
            2ft
            PDU2/41
            N2/PSU1
            PDU1/Port37
        "#});

        let result = map.connections_for("N1");
        let expect = vec![
            connection("N1", 1, 1, 39, Some(0.6)),
            connection("N1", 2, 1, 41, None),
            connection("N1", 3, 2, 39, Some(0.6)),
            connection("N1", 4, 2, 41, Some(2.0 * FEET_TO_METERS)),
        ];
        assert_eq!(result, expect);
        assert_eq!(map.connections_for("N2").len(), 1);
    }

    #[test]
    fn unknown_node_yields_nothing() {
        let map = ConnectionMap::parse("N1/PSU1\nPDU1/Port39\n");
        assert!(map.connections_for("N7").is_empty());
    }

    #[test]
    fn interrupted_record_is_dropped_and_reported() {
        let mut warnings = Vec::new();
        let map = ConnectionMap::parse_with(
            indoc! {r#"
                N1/PSU1
                2ft/0.6m
                cable tray B
                N1/PSU2
                N1/PSU3
                PDU2/Port39
            "#},
            |warning| warnings.push(warning.clone()),
        );

        assert_eq!(map.connections(), &[connection("N1", 3, 2, 39, None)]);
        assert_eq!(
            warnings,
            vec![
                ParseWarning {
                    line_number: 3,
                    line: "cable tray B".into(),
                    abandoned: "N1/PSU1".into(),
                },
                ParseWarning {
                    line_number: 5,
                    line: "N1/PSU3".into(),
                    abandoned: "N1/PSU2".into(),
                },
            ]
        );
    }

    #[test]
    fn trailing_open_record_is_reported() {
        let mut warnings = Vec::new();
        let map = ConnectionMap::parse_with("N4/PSU2\n0.6m\n", |warning| {
            warnings.push(warning.abandoned.clone())
        });

        assert!(map.connections().is_empty());
        assert_eq!(warnings, vec!["N4/PSU2".to_string()]);
    }

    #[test]
    fn shared_outlet_is_recorded_as_conflict() {
        let map = ConnectionMap::parse(indoc! {r#"
            N1/PSU1
            PDU1/Port39
            N2/PSU1
            PDU2/Port5
            N3/PSU1
            PDU2/Port5
        "#});

        assert_eq!(
            map.connections(),
            &[
                connection("N1", 1, 1, 39, None),
                connection("N2", 1, 2, 5, None),
            ]
        );
        assert_eq!(
            map.conflicts(),
            &[OutletConflict {
                first: connection("N2", 1, 2, 5, None),
                second: connection("N3", 1, 2, 5, None),
            }]
        );
        assert_eq!(
            map.conflicts()[0].to_string(),
            "PDU2/Port5 is claimed by both N2/PSU1 and N3/PSU1"
        );
        assert!(map.conflicts_for("N1").is_empty());
        assert_eq!(map.conflicts_for("n2").len(), 1);
        assert_eq!(map.conflicts_for("N3").len(), 1);
    }

    #[test_case("2ft/0.6m", Some(0.6); "feet and metres")]
    #[test_case("0.6m", Some(0.6); "metres only")]
    #[test_case("10ft", Some(10.0 * FEET_TO_METERS); "feet only")]
    #[test_case("PDU1/Port39", None; "port line")]
    #[test_case("two feet", None; "prose")]
    #[test]
    fn cable_length(line: &str, expect: Option<f64>) {
        assert_eq!(parse_cable_length(line), expect);
    }

    #[test_case("PDU1/Port39", Some((1, 39)); "named port")]
    #[test_case("pdu2/port41", Some((2, 41)); "lower case")]
    #[test_case("PDU2/41", Some((2, 41)); "bare port")]
    #[test_case("N1/PSU1", None; "device line")]
    #[test]
    fn outlet_line(line: &str, expect: Option<(u32, u32)>) {
        assert_eq!(parse_outlet(line), expect);
    }
}
