// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of the settings file that rackops reads at startup. The
//! settings are built once and threaded down to every component that needs
//! them, so nothing downstream reaches for environment variables on its own.
//!
//! # General Layout
//!
//! The settings file is TOML with one table per concern:
//!
//! - `[cluster]`: cluster context to query, and domain suffix of hosts.
//! - `[pdu]`: connection map, PDU host naming, and SNMP parameters.
//! - `[bmc]`: BMC host naming and IPMI credentials.
//! - `[startup]`: probe cadence for startup confirmation.
//! - `[rack]`: what makes a rack ready.
//! - `[batch]`: fan-out limits.
//!
//! Every field has a default, so an empty file is a valid settings file.
//! Fields holding paths or secrets go through shell expansion, which allows
//! `password = "$BMC_PASSWORD"` instead of a literal secret.

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    fs::read_to_string,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

/// Settings layout.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Cluster query settings.
    pub cluster: ClusterSettings,

    /// PDU outlet control settings.
    pub pdu: PduSettings,

    /// BMC access settings.
    pub bmc: BmcSettings,

    /// Startup confirmation settings.
    pub startup: StartupSettings,

    /// Rack readiness settings.
    pub rack: RackSettings,

    /// Batch fan-out settings.
    pub batch: BatchSettings,
}

impl Settings {
    /// Load settings from target file.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Read`] if file cannot be read.
    /// - Return [`ConfigError::Deserialize`] if file content is invalid.
    /// - Return [`ConfigError::ShellExpansion`] if expansion fails.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = read_to_string(path.as_ref()).map_err(|source| ConfigError::Read {
            source,
            path: path.as_ref().to_path_buf(),
        })?;

        data.parse()
    }
}

impl FromStr for Settings {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut settings: Settings = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on path and secret fields.
        if let Some(map) = settings.pdu.map.take() {
            settings.pdu.map = Some(PathBuf::from(expand(map.to_string_lossy().as_ref())?));
        }
        settings.pdu.community = expand(&settings.pdu.community)?;
        settings.bmc.password = expand(&settings.bmc.password)?;

        Ok(settings)
    }
}

impl Display for Settings {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// Cluster query settings.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClusterSettings {
    /// Cluster context to query, current context if absent.
    pub context: Option<String>,

    /// Domain suffix appended to every host name, e.g., `yka1.example.net`.
    pub domain_suffix: String,
}

/// PDU outlet control settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PduSettings {
    /// Path to PDU connection map.
    pub map: Option<PathBuf>,

    /// Host name template of a PDU, expands `{rack}` and `{pdu}`.
    pub host_template: String,

    /// SNMP community string.
    pub community: String,

    /// SNMP protocol version.
    pub version: String,

    /// Numeric base address of outlet state reads, suffixed by port.
    pub read_oid: String,

    /// Numeric base address of outlet state writes, suffixed by port.
    pub write_oid: String,

    /// Seconds to wait after a write before reading the outlet back.
    pub settle_delay_secs: u64,

    /// Seconds before a single SNMP call is abandoned.
    pub timeout_secs: u64,

    /// Number of power supplies wired into each node.
    pub psus_per_node: usize,
}

impl PduSettings {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for PduSettings {
    fn default() -> Self {
        Self {
            map: None,
            host_template: "{rack}-pdu{pdu}".into(),
            community: "private".into(),
            version: "2c".into(),
            read_oid: "1.3.6.1.4.1.1718.4.1.8.3.1.1.1".into(),
            write_oid: "1.3.6.1.4.1.1718.4.1.8.5.1.2.1".into(),
            settle_delay_secs: 2,
            timeout_secs: 2,
            psus_per_node: 4,
        }
    }
}

/// BMC access settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BmcSettings {
    /// Host name template of a BMC, expands `{node}`, `{rack}`, and `{index}`.
    pub host_template: String,

    /// IPMI user name.
    pub user: String,

    /// IPMI password.
    pub password: String,

    /// IPMI interface handed to `ipmitool -I`.
    pub interface: String,

    /// Seconds before a single IPMI call is abandoned.
    pub timeout_secs: u64,
}

impl BmcSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for BmcSettings {
    fn default() -> Self {
        Self {
            host_template: "{node}-bmc".into(),
            user: "root".into(),
            password: String::new(),
            interface: "lanplus".into(),
            timeout_secs: 5,
        }
    }
}

/// Startup confirmation settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StartupSettings {
    /// Seconds between reachability probes.
    pub probe_interval_secs: u64,

    /// Seconds before a single probe counts as failed.
    pub probe_timeout_secs: u64,

    /// Consecutive successful probes needed to confirm startup.
    pub required_successes: u32,

    /// Seconds before startup confirmation gives up.
    pub timeout_secs: u64,
}

impl StartupSettings {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for StartupSettings {
    fn default() -> Self {
        Self {
            probe_interval_secs: 5,
            probe_timeout_secs: 2,
            required_successes: 3,
            timeout_secs: 600,
        }
    }
}

/// Rack readiness settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RackSettings {
    /// Exact number of nodes a rack must have.
    pub expected_nodes: u32,

    /// Treat cordoned nodes as not ready.
    pub reject_cordoned: bool,

    /// Taint key that marks a node as pulled for repair.
    pub repair_taint: Option<String>,

    /// Labels whose value must agree across every node of a rack.
    pub uniform_labels: Vec<String>,

    /// Labels every node must carry with an exact value.
    #[serde(rename = "required_label")]
    pub required_labels: Vec<RequiredLabel>,
}

impl Default for RackSettings {
    fn default() -> Self {
        Self {
            expected_nodes: 9,
            reject_cordoned: true,
            repair_taint: None,
            uniform_labels: Vec::new(),
            required_labels: Vec::new(),
        }
    }
}

/// Label a node must carry to count as ready.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct RequiredLabel {
    /// Short name of the check for reports, e.g., `bios-conformance`.
    pub name: String,

    /// Label key.
    pub key: String,

    /// Exact label value required.
    pub value: String,
}

/// Batch fan-out settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchSettings {
    /// Maximum number of operations in flight at once.
    pub concurrency: usize,

    /// Seconds before a single rack evaluation is abandoned.
    pub operation_timeout_secs: u64,
}

impl BatchSettings {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            concurrency: 60,
            operation_timeout_secs: 120,
        }
    }
}

fn expand(value: &str) -> Result<String> {
    Ok(shellexpand::full(value)
        .map_err(ConfigError::ShellExpansion)?
        .into_owned())
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Settings file cannot be read.
    #[error("failed to read settings file at {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    #[sealed_test(env = [("BMC_PASSWORD", "hunter2"), ("RACKOPS_HOME", "/opt/rackops")])]
    fn deserialize_settings() -> anyhow::Result<()> {
        let result: Settings = r#"
            [cluster]
            context = "yka1-prod1"
            domain_suffix = "yka1.example.net"

            [pdu]
            map = "$RACKOPS_HOME/pdu-map.txt"
            community = "secret"

            [bmc]
            user = "admin"
            password = "$BMC_PASSWORD"

            [rack]
            expected_nodes = 9
            repair_taint = "validation.example.io/repair"
            uniform_labels = ["validation.example.io/firmware-bundle"]

            [[rack.required_label]]
            name = "bios-conformance"
            key = "validation.example.io/bios-conformance"
            value = "pass"
        "#
        .parse()?;

        let expect = Settings {
            cluster: ClusterSettings {
                context: Some("yka1-prod1".into()),
                domain_suffix: "yka1.example.net".into(),
            },
            pdu: PduSettings {
                map: Some("/opt/rackops/pdu-map.txt".into()),
                community: "secret".into(),
                ..PduSettings::default()
            },
            bmc: BmcSettings {
                user: "admin".into(),
                password: "hunter2".into(),
                ..BmcSettings::default()
            },
            startup: StartupSettings::default(),
            rack: RackSettings {
                expected_nodes: 9,
                reject_cordoned: true,
                repair_taint: Some("validation.example.io/repair".into()),
                uniform_labels: vec!["validation.example.io/firmware-bundle".into()],
                required_labels: vec![RequiredLabel {
                    name: "bios-conformance".into(),
                    key: "validation.example.io/bios-conformance".into(),
                    value: "pass".into(),
                }],
            },
            batch: BatchSettings::default(),
        };

        assert_eq!(result, expect);

        Ok(())
    }

    #[test]
    fn empty_settings_use_defaults() -> anyhow::Result<()> {
        let result: Settings = "".parse()?;
        assert_eq!(result, Settings::default());
        assert_eq!(result.pdu.psus_per_node, 4);
        assert_eq!(result.pdu.settle_delay(), Duration::from_secs(2));
        assert_eq!(result.startup.required_successes, 3);
        assert_eq!(result.startup.probe_interval(), Duration::from_secs(5));
        assert_eq!(result.rack.expected_nodes, 9);
        assert_eq!(result.batch.concurrency, 60);

        Ok(())
    }

    #[sealed_test]
    fn unset_secret_variable_is_an_error() {
        let result = r#"
            [bmc]
            password = "$RACKOPS_UNSET_PASSWORD"
        "#
        .parse::<Settings>();

        assert!(matches!(result, Err(ConfigError::ShellExpansion(_))));
    }

    #[test]
    fn serialized_settings_parse_back() -> anyhow::Result<()> {
        let settings = Settings {
            cluster: ClusterSettings {
                context: Some("dal1-prod1".into()),
                domain_suffix: "dal1.example.net".into(),
            },
            rack: RackSettings {
                required_labels: vec![RequiredLabel {
                    name: "qsfp".into(),
                    key: "validation.example.io/qsfp-verified".into(),
                    value: "true".into(),
                }],
                ..RackSettings::default()
            },
            ..Settings::default()
        };

        let result: Settings = settings.to_string().parse()?;
        assert_eq!(result, settings);

        Ok(())
    }

    #[test]
    fn load_reports_missing_file() {
        let result = Settings::load("/rackops/does/not/exist.toml");
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
