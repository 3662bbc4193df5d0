// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! PDU outlet control.
//!
//! Reads and writes the switching state of a single PDU outlet, and folds
//! whatever the device says into [`OutletState`].
//!
//! # Encoding Asymmetry
//!
//! The PDUs encode the same logical state differently depending on the
//! direction of the call:
//!
//! | state | write | read |
//! |-------|-------|------|
//! | ON    | 2     | 1    |
//! | OFF   | 1     | 0    |
//!
//! This is how the devices behave. Both tables are kept side by side in
//! [`TargetState::write_value`] and [`OutletState::from_read_value`].

use crate::{config::PduSettings, power::map::PduConnection, syscall::Invocation};

use serde::Serialize;
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    future::Future,
    str::FromStr,
    sync::Arc,
    time::Duration,
};
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, instrument, warn};

/// Power state an outlet can be asked to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TargetState {
    On,
    Off,
}

impl TargetState {
    /// Integer written to the device to request this state.
    pub fn write_value(self) -> i64 {
        match self {
            Self::On => 2,
            Self::Off => 1,
        }
    }
}

impl Display for TargetState {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::On => fmt.write_str("ON"),
            Self::Off => fmt.write_str("OFF"),
        }
    }
}

impl FromStr for TargetState {
    type Err = String;

    fn from_str(state: &str) -> Result<Self, Self::Err> {
        match state.to_ascii_lowercase().as_str() {
            "on" => Ok(Self::On),
            "off" => Ok(Self::Off),
            _ => Err(format!("invalid power state {state:?}, expected on or off")),
        }
    }
}

/// Power state an outlet reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutletState {
    On,
    Off,
    Unknown,
}

impl OutletState {
    /// Interpret integer read back from the device.
    pub fn from_read_value(value: i64) -> Self {
        match value {
            1 => Self::On,
            0 => Self::Off,
            _ => Self::Unknown,
        }
    }
}

impl From<TargetState> for OutletState {
    fn from(target: TargetState) -> Self {
        match target {
            TargetState::On => Self::On,
            TargetState::Off => Self::Off,
        }
    }
}

impl Display for OutletState {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::On => fmt.write_str("ON"),
            Self::Off => fmt.write_str("OFF"),
            Self::Unknown => fmt.write_str("UNKNOWN"),
        }
    }
}

/// A PDU outlet reachable on the network.
#[derive(Debug, Clone, PartialEq)]
pub struct Outlet {
    /// Connection this outlet serves.
    pub connection: PduConnection,

    /// Host name of the PDU.
    pub host: String,
}

impl Outlet {
    pub fn port(&self) -> u32 {
        self.connection.port
    }
}

impl Display for Outlet {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(fmt, "{} [{}]", self.connection, self.host)
    }
}

/// Outcome of one outlet power operation.
///
/// Built once per attempt and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PowerOperationResult {
    connection: PduConnection,
    requested_state: TargetState,
    achieved_state: OutletState,
    success: bool,
    error_detail: Option<String>,
    dry_run: bool,
}

impl PowerOperationResult {
    /// Result of an operation that was only planned, never sent.
    pub fn planned(connection: PduConnection, requested_state: TargetState) -> Self {
        Self {
            connection,
            requested_state,
            achieved_state: requested_state.into(),
            success: true,
            error_detail: None,
            dry_run: true,
        }
    }

    /// Result of an attempt cut short by the operation deadline.
    ///
    /// Whatever the outlet did is unknown, so it counts as a failure.
    pub fn timed_out(
        connection: PduConnection,
        requested_state: TargetState,
        after: Duration,
    ) -> Self {
        Self::attempted(
            connection,
            requested_state,
            OutletState::Unknown,
            Some(format!(
                "no answer within {}s, outlet state unknown",
                after.as_secs()
            )),
        )
    }

    fn attempted(
        connection: PduConnection,
        requested_state: TargetState,
        achieved_state: OutletState,
        error_detail: Option<String>,
    ) -> Self {
        let success = error_detail.is_none() && achieved_state == OutletState::from(requested_state);
        Self {
            connection,
            requested_state,
            achieved_state,
            success,
            error_detail,
            dry_run: false,
        }
    }

    pub fn connection(&self) -> &PduConnection {
        &self.connection
    }

    pub fn requested_state(&self) -> TargetState {
        self.requested_state
    }

    pub fn achieved_state(&self) -> OutletState {
        self.achieved_state
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn error_detail(&self) -> Option<&str> {
        self.error_detail.as_deref()
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }
}

impl Display for PowerOperationResult {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        if self.dry_run {
            return write!(fmt, "[dry-run] {} set {}", self.connection, self.requested_state);
        }

        let verdict = if self.success { "ok" } else { "FAILED" };
        write!(
            fmt,
            "{} requested {} achieved {}: {verdict}",
            self.connection, self.requested_state, self.achieved_state
        )?;
        if let Some(detail) = &self.error_detail {
            write!(fmt, " ({detail})")?;
        }

        Ok(())
    }
}

/// Layer of indirection for talking to PDU outlets.
///
/// Values are raw device integers, see the module documentation for how
/// they map to power states.
pub trait OutletTransport: Send + Sync {
    /// Read raw state integer of outlet.
    fn read(&self, outlet: &Outlet) -> impl Future<Output = Result<i64>> + Send;

    /// Write raw state integer to outlet.
    fn write(&self, outlet: &Outlet, value: i64) -> impl Future<Output = Result<()>> + Send;
}

/// Outlet access through net-snmp command line tools.
#[derive(Debug, Clone)]
pub struct SnmpTransport {
    community: String,
    version: String,
    read_oid: String,
    write_oid: String,
    timeout: Duration,
}

impl SnmpTransport {
    /// Construct new SNMP transport from PDU settings.
    pub fn new(settings: &PduSettings) -> Self {
        Self {
            community: settings.community.clone(),
            version: settings.version.clone(),
            read_oid: settings.read_oid.clone(),
            write_oid: settings.write_oid.clone(),
            timeout: settings.timeout(),
        }
    }

    fn invocation(&self, program: &str, outlet: &Outlet) -> Invocation {
        // INVARIANT: Single attempt per call, no net-snmp retries.
        Invocation::new(program)
            .args(["-v", self.version.as_str(), "-c", self.community.as_str()])
            .args(["-t".to_string(), self.timeout.as_secs().max(1).to_string()])
            .args(["-r", "0", "-Oqv"])
            .arg(outlet.host.as_str())
            .timeout(self.timeout + Duration::from_secs(1))
    }

    pub(crate) fn read_invocation(&self, outlet: &Outlet) -> Invocation {
        self.invocation("snmpget", outlet)
            .arg(format!("{}.{}", self.read_oid, outlet.port()))
    }

    pub(crate) fn write_invocation(&self, outlet: &Outlet, value: i64) -> Invocation {
        self.invocation("snmpset", outlet)
            .arg(format!("{}.{}", self.write_oid, outlet.port()))
            .args(["i".to_string(), value.to_string()])
    }
}

impl OutletTransport for SnmpTransport {
    #[instrument(skip(self, outlet), fields(outlet = %outlet), level = "debug")]
    async fn read(&self, outlet: &Outlet) -> Result<i64> {
        let output = self.read_invocation(outlet).run().await?;
        parse_integer(&output).ok_or(TransportError::Malformed { raw: output })
    }

    #[instrument(skip(self, outlet), fields(outlet = %outlet), level = "debug")]
    async fn write(&self, outlet: &Outlet, value: i64) -> Result<()> {
        self.write_invocation(outlet, value).run().await?;
        Ok(())
    }
}

// Accepts both "1" and "INTEGER: 1" renderings.
fn parse_integer(output: &str) -> Option<i64> {
    let value = output.trim();
    let value = value
        .rsplit_once(':')
        .map(|(_, value)| value.trim())
        .unwrap_or(value);

    value.parse().ok()
}

/// Drive a single outlet and normalize what it reports.
///
/// Clones share the same call limit, if one is set.
#[derive(Debug, Clone)]
pub struct OutletController<T = SnmpTransport>
where
    T: OutletTransport,
{
    transport: T,
    settle_delay: Duration,
    call_limit: Option<Arc<Semaphore>>,
}

impl<T> OutletController<T>
where
    T: OutletTransport,
{
    /// Construct new outlet controller.
    pub fn new(transport: T, settle_delay: Duration) -> Self {
        Self {
            transport,
            settle_delay,
            call_limit: None,
        }
    }

    /// Allow at most `limit` transport calls in flight at once.
    ///
    /// The settle delay between a write and its read back holds no slot.
    pub fn with_call_limit(mut self, limit: usize) -> Self {
        self.call_limit = Some(Arc::new(Semaphore::new(limit.max(1))));
        self
    }

    /// Borrow underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    async fn slot(&self) -> Option<SemaphorePermit<'_>> {
        match &self.call_limit {
            // INVARIANT: Semaphore is never closed.
            Some(limit) => limit.acquire().await.ok(),
            None => None,
        }
    }

    async fn read(&self, outlet: &Outlet) -> Result<i64> {
        let _slot = self.slot().await;
        self.transport.read(outlet).await
    }

    async fn write(&self, outlet: &Outlet, value: i64) -> Result<()> {
        let _slot = self.slot().await;
        self.transport.write(outlet, value).await
    }

    /// Query current state of outlet.
    ///
    /// Transport failures and values outside the read table both come back
    /// as [`OutletState::Unknown`].
    pub async fn get_state(&self, outlet: &Outlet) -> OutletState {
        match self.read(outlet).await {
            Ok(value) => OutletState::from_read_value(value),
            Err(error) => {
                warn!("cannot read {outlet}: {error}");
                OutletState::Unknown
            }
        }
    }

    /// Switch outlet to target state and confirm it took effect.
    ///
    /// Writes the target state, waits out the settle delay, then reads the
    /// outlet back. Never fails: transport errors and state mismatches are
    /// reported through the returned [`PowerOperationResult`].
    #[instrument(skip(self, outlet), fields(outlet = %outlet), level = "debug")]
    pub async fn set_state(&self, outlet: &Outlet, target: TargetState) -> PowerOperationResult {
        let connection = outlet.connection.clone();
        if let Err(error) = self.write(outlet, target.write_value()).await {
            warn!("cannot switch {outlet} {target}: {error}");
            return PowerOperationResult::attempted(
                connection,
                target,
                OutletState::Unknown,
                Some(error.to_string()),
            );
        }

        tokio::time::sleep(self.settle_delay).await;

        match self.read(outlet).await {
            Ok(value) => {
                let achieved = OutletState::from_read_value(value);
                debug!("{outlet} reads {value} ({achieved}) after settle delay");
                let detail = (achieved != OutletState::from(target)).then(|| {
                    format!("requested {target} but outlet reports {achieved} (raw {value})")
                });
                if let Some(detail) = &detail {
                    warn!("{outlet}: {detail}");
                }
                PowerOperationResult::attempted(connection, target, achieved, detail)
            }
            Err(error) => {
                warn!("cannot read back {outlet}: {error}");
                PowerOperationResult::attempted(
                    connection,
                    target,
                    OutletState::Unknown,
                    Some(error.to_string()),
                )
            }
        }
    }
}

/// Outlet transport error types.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Talking to the device failed.
    #[error(transparent)]
    Syscall(#[from] crate::syscall::SyscallError),

    /// Device answered with something that is not a state integer.
    #[error("malformed outlet response: {raw:?}")]
    Malformed { raw: String },
}

/// Friendly result alias :3
pub type Result<T, E = TransportError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use simple_test_case::test_case;
    use std::{
        collections::HashMap,
        ffi::OsString,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };

    /// Simulated PDU holding raw read values per port.
    #[derive(Debug, Clone, Default)]
    struct FakePdu {
        ports: Arc<Mutex<HashMap<u32, i64>>>,
        writes: Arc<Mutex<Vec<(u32, i64)>>>,
        stuck: bool,
        unreachable: bool,
    }

    impl OutletTransport for FakePdu {
        async fn read(&self, outlet: &Outlet) -> Result<i64> {
            if self.unreachable {
                return Err(TransportError::Malformed {
                    raw: "Timeout: No Response from pdu".into(),
                });
            }
            Ok(*self.ports.lock().unwrap().get(&outlet.port()).unwrap_or(&0))
        }

        async fn write(&self, outlet: &Outlet, value: i64) -> Result<()> {
            if self.unreachable {
                return Err(TransportError::Malformed {
                    raw: "Timeout: No Response from pdu".into(),
                });
            }
            self.writes.lock().unwrap().push((outlet.port(), value));
            if !self.stuck {
                // Device translates write encoding into read encoding.
                let read = match value {
                    2 => 1,
                    1 => 0,
                    other => other,
                };
                self.ports.lock().unwrap().insert(outlet.port(), read);
            }
            Ok(())
        }
    }

    /// Simulated PDU that answers slowly and tracks calls in flight.
    #[derive(Debug, Clone, Default)]
    struct SlowPdu {
        ports: Arc<Mutex<HashMap<u32, i64>>>,
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl SlowPdu {
        async fn busy(&self) {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl OutletTransport for SlowPdu {
        async fn read(&self, outlet: &Outlet) -> Result<i64> {
            self.busy().await;
            Ok(*self.ports.lock().unwrap().get(&outlet.port()).unwrap_or(&0))
        }

        async fn write(&self, outlet: &Outlet, value: i64) -> Result<()> {
            self.busy().await;
            let read = if value == 2 { 1 } else { 0 };
            self.ports.lock().unwrap().insert(outlet.port(), read);
            Ok(())
        }
    }

    fn outlet(port: u32) -> Outlet {
        Outlet {
            connection: PduConnection {
                node_id: "N1".into(),
                psu_index: 1,
                pdu_id: 1,
                port,
                cable_length_meters: None,
            },
            host: "c0r21-pdu1".into(),
        }
    }

    #[test_case(TargetState::On, 2; "on writes two")]
    #[test_case(TargetState::Off, 1; "off writes one")]
    #[test]
    fn write_encoding(target: TargetState, expect: i64) {
        assert_eq!(target.write_value(), expect);
    }

    #[test_case(1, OutletState::On; "one reads on")]
    #[test_case(0, OutletState::Off; "zero reads off")]
    #[test_case(2, OutletState::Unknown; "two is not a read value")]
    #[test_case(-1, OutletState::Unknown; "negative")]
    #[test]
    fn read_encoding(value: i64, expect: OutletState) {
        assert_eq!(OutletState::from_read_value(value), expect);
    }

    #[test_case("1", Some(1); "bare")]
    #[test_case("INTEGER: 0\n", Some(0); "typed")]
    #[test_case("No Such Instance currently exists at this OID", None; "missing")]
    #[test]
    fn parse_snmp_integer(output: &str, expect: Option<i64>) {
        assert_eq!(parse_integer(output), expect);
    }

    #[tokio::test(start_paused = true)]
    async fn set_state_confirms_after_settle_delay() {
        let pdu = FakePdu::default();
        let controller = OutletController::new(pdu.clone(), Duration::from_secs(2));
        let start = tokio::time::Instant::now();

        let result = controller.set_state(&outlet(39), TargetState::On).await;

        assert!(start.elapsed() >= Duration::from_secs(2));
        assert_eq!(result.requested_state(), TargetState::On);
        assert_eq!(result.achieved_state(), OutletState::On);
        assert!(result.success());
        assert_eq!(result.error_detail(), None);
        assert_eq!(*pdu.writes.lock().unwrap(), vec![(39, 2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn set_state_twice_is_idempotent() {
        let controller = OutletController::new(FakePdu::default(), Duration::from_secs(2));

        let first = controller.set_state(&outlet(41), TargetState::On).await;
        let second = controller.set_state(&outlet(41), TargetState::On).await;

        assert_eq!(first.achieved_state(), OutletState::On);
        assert_eq!(second.achieved_state(), OutletState::On);
        assert!(second.success());
    }

    #[tokio::test(start_paused = true)]
    async fn set_state_reports_mismatch_without_retry() {
        let pdu = FakePdu {
            stuck: true,
            ..FakePdu::default()
        };
        let controller = OutletController::new(pdu.clone(), Duration::from_secs(2));

        let result = controller.set_state(&outlet(39), TargetState::On).await;

        assert_eq!(result.requested_state(), TargetState::On);
        assert_eq!(result.achieved_state(), OutletState::Off);
        assert!(!result.success());
        assert!(result.error_detail().unwrap().contains("outlet reports OFF"));
        assert_eq!(pdu.writes.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn set_state_carries_raw_transport_output() {
        let pdu = FakePdu {
            unreachable: true,
            ..FakePdu::default()
        };
        let controller = OutletController::new(pdu, Duration::from_secs(2));

        let result = controller.set_state(&outlet(39), TargetState::Off).await;

        assert_eq!(result.requested_state(), TargetState::Off);
        assert_eq!(result.achieved_state(), OutletState::Unknown);
        assert!(!result.success());
        assert!(result.error_detail().unwrap().contains("No Response"));
        assert_eq!(controller.get_state(&outlet(39)).await, OutletState::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn call_limit_is_shared_by_clones() {
        let pdu = SlowPdu::default();
        let controller = OutletController::new(pdu.clone(), Duration::ZERO).with_call_limit(3);
        let outlets = (1..=10).map(outlet).collect::<Vec<_>>();

        let results = futures::future::join_all(outlets.iter().map(|outlet| {
            let controller = controller.clone();
            async move { controller.set_state(outlet, TargetState::On).await }
        }))
        .await;

        assert!(results.iter().all(PowerOperationResult::success));
        assert_eq!(pdu.peak.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn timed_out_attempt_is_a_failure() {
        let result = PowerOperationResult::timed_out(
            outlet(39).connection,
            TargetState::On,
            Duration::from_secs(120),
        );

        assert!(!result.success());
        assert!(!result.is_dry_run());
        assert_eq!(result.achieved_state(), OutletState::Unknown);
        assert_eq!(
            result.error_detail(),
            Some("no answer within 120s, outlet state unknown")
        );
    }

    #[test]
    fn snmp_invocations_address_port() {
        let transport = SnmpTransport::new(&PduSettings {
            community: "secret".into(),
            read_oid: "1.2.3".into(),
            write_oid: "1.2.4".into(),
            ..PduSettings::default()
        });

        let read = transport.read_invocation(&outlet(39));
        assert_eq!(read.program(), "snmpget");
        let args = read.arguments();
        assert_eq!(args.last(), Some(&OsString::from("1.2.3.39")));
        assert!(args.contains(&OsString::from("c0r21-pdu1")));
        assert!(args.contains(&OsString::from("secret")));

        let write = transport.write_invocation(&outlet(39), TargetState::Off.write_value());
        assert_eq!(write.program(), "snmpset");
        let args = write.arguments();
        assert_eq!(
            &args[args.len() - 3..],
            &[OsString::from("1.2.4.39"), "i".into(), "1".into()]
        );
    }
}
