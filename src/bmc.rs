// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Baseboard management controller access.
//!
//! Every node carries a BMC reachable out of band at a host derived from the
//! node name. Requests are typed as [`BmcRequest`] and rendered into an
//! `ipmitool` argument vector by [`IpmiTransport`]. The BMC password is
//! handed over through the `IPMI_PASSWORD` environment variable, so it never
//! shows up in the process table.

use crate::{
    config::BmcSettings,
    node::{render_host, NodeName},
    syscall::{Invocation, SyscallError},
};

use serde::Serialize;
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    future::Future,
    str::FromStr,
    time::Duration,
};
use tracing::{debug, instrument};

/// Device to boot from on next start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BootDevice {
    Pxe,
    Disk,
    Bios,
}

impl BootDevice {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Pxe => "pxe",
            Self::Disk => "disk",
            Self::Bios => "bios",
        }
    }
}

impl FromStr for BootDevice {
    type Err = String;

    fn from_str(device: &str) -> std::result::Result<Self, Self::Err> {
        match device.to_ascii_lowercase().as_str() {
            "pxe" => Ok(Self::Pxe),
            "disk" => Ok(Self::Disk),
            "bios" => Ok(Self::Bios),
            other => Err(format!("unknown boot device {other:?}, expected pxe, disk, or bios")),
        }
    }
}

impl Display for BootDevice {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.as_str())
    }
}

/// Request understood by a BMC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BmcRequest {
    PowerStatus,
    PowerOn,
    PowerOff,
    PowerCycle,
    BootDevice(BootDevice),
    ChassisStatus,
    UserList,
}

impl BmcRequest {
    /// Arguments that express request to `ipmitool`.
    pub fn arguments(&self) -> Vec<&'static str> {
        match self {
            Self::PowerStatus => vec!["chassis", "power", "status"],
            Self::PowerOn => vec!["chassis", "power", "on"],
            Self::PowerOff => vec!["chassis", "power", "off"],
            Self::PowerCycle => vec!["chassis", "power", "cycle"],
            Self::BootDevice(device) => vec!["chassis", "bootdev", device.as_str()],
            Self::ChassisStatus => vec!["chassis", "status"],
            Self::UserList => vec!["user", "list", "1"],
        }
    }
}

impl Display for BmcRequest {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::PowerStatus => write!(fmt, "power status"),
            Self::PowerOn => write!(fmt, "power on"),
            Self::PowerOff => write!(fmt, "power off"),
            Self::PowerCycle => write!(fmt, "power cycle"),
            Self::BootDevice(device) => write!(fmt, "bootdev {device}"),
            Self::ChassisStatus => write!(fmt, "chassis status"),
            Self::UserList => write!(fmt, "user list"),
        }
    }
}

/// Chassis power as reported by a BMC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChassisPower {
    On,
    Off,
    Unknown,
}

impl ChassisPower {
    /// Normalize `chassis power status` output, e.g., `Chassis Power is on`.
    pub fn from_status_output(output: &str) -> Self {
        let output = output.trim().to_ascii_lowercase();
        match output.rsplit(' ').next() {
            Some("on") if output.contains("power is") => Self::On,
            Some("off") if output.contains("power is") => Self::Off,
            _ => Self::Unknown,
        }
    }
}

impl Display for ChassisPower {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::On => write!(fmt, "ON"),
            Self::Off => write!(fmt, "OFF"),
            Self::Unknown => write!(fmt, "UNKNOWN"),
        }
    }
}

/// Channel that carries requests to a BMC.
pub trait BmcTransport: Send + Sync {
    /// Send request to BMC at target host, returning its raw reply.
    fn execute(
        &self,
        host: &str,
        request: BmcRequest,
    ) -> impl Future<Output = Result<String>> + Send;
}

/// Talk to BMCs through `ipmitool`.
#[derive(Debug, Clone)]
pub struct IpmiTransport {
    interface: String,
    user: String,
    password: String,
    timeout: Duration,
}

impl IpmiTransport {
    /// Construct new IPMI transport from BMC settings.
    pub fn new(settings: &BmcSettings) -> Self {
        Self {
            interface: settings.interface.clone(),
            user: settings.user.clone(),
            password: settings.password.clone(),
            timeout: settings.timeout(),
        }
    }

    pub(crate) fn invocation(&self, host: &str, request: BmcRequest) -> Invocation {
        Invocation::new("ipmitool")
            .args(["-I", self.interface.as_str(), "-H", host, "-U", self.user.as_str(), "-E"])
            .args(request.arguments())
            .env("IPMI_PASSWORD", &self.password)
            .timeout(self.timeout)
    }
}

impl BmcTransport for IpmiTransport {
    async fn execute(&self, host: &str, request: BmcRequest) -> Result<String> {
        Ok(self.invocation(host, request).run().await?)
    }
}

/// Issue BMC requests by node name.
#[derive(Debug, Clone)]
pub struct BmcClient<T = IpmiTransport>
where
    T: BmcTransport,
{
    transport: T,
    host_template: String,
    domain_suffix: String,
}

impl BmcClient {
    /// Construct new `ipmitool` based client from BMC settings.
    pub fn from_settings(settings: &BmcSettings, domain_suffix: impl Into<String>) -> Self {
        Self::new(
            IpmiTransport::new(settings),
            settings.host_template.clone(),
            domain_suffix,
        )
    }
}

impl<T> BmcClient<T>
where
    T: BmcTransport,
{
    /// Construct new BMC client.
    ///
    /// Template placeholders `{node}`, `{rack}`, and `{index}` are filled per
    /// node.
    pub fn new(
        transport: T,
        host_template: impl Into<String>,
        domain_suffix: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            host_template: host_template.into(),
            domain_suffix: domain_suffix.into(),
        }
    }

    /// BMC host of target node.
    pub fn host(&self, node: &NodeName) -> String {
        render_host(
            &self.host_template,
            &[
                ("node", node.to_string()),
                ("rack", node.rack().to_string()),
                ("index", node.index().to_string()),
            ],
            &self.domain_suffix,
        )
    }

    /// Send request to BMC of target node.
    #[instrument(skip(self, node), fields(node = %node), level = "debug")]
    pub async fn request(&self, node: &NodeName, request: BmcRequest) -> Result<String> {
        let host = self.host(node);
        debug!("{request} via {host}");
        self.transport.execute(&host, request).await
    }

    /// Query chassis power of target node.
    pub async fn power_status(&self, node: &NodeName) -> Result<ChassisPower> {
        let output = self.request(node, BmcRequest::PowerStatus).await?;
        Ok(ChassisPower::from_status_output(&output))
    }
}

/// BMC error types.
#[derive(Debug, thiserror::Error)]
pub enum BmcError {
    #[error(transparent)]
    Syscall(#[from] SyscallError),

    /// BMC did not answer before the operation deadline.
    #[error("{host} did not answer within {}s", after.as_secs())]
    TimedOut { host: String, after: Duration },
}

/// Friendly result alias :3
type Result<T, E = BmcError> = std::result::Result<T, E>;
