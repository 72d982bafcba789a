//! Device configuration parameters and their last reported values.
//!
//! The device echoes every parameter as `prefix=value` both when queried via
//! `read` and when a write is accepted. The prefix set is closed; unknown
//! prefixes are logged and dropped so newer firmware does not break older
//! app versions.

use std::collections::BTreeMap;

/// A logical device parameter, keyed by its wire-protocol command prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Parameter {
    /// `CS` - number of battery strings.
    SeriesCount,
    /// `gybh` - over-voltage protection threshold.
    OverVoltageProtection,
    /// `gyhf` - over-voltage recovery threshold.
    OverVoltageRecovery,
    /// `qybh` - under-voltage protection threshold.
    UnderVoltageProtection,
    /// `qyhf` - under-voltage recovery threshold.
    UnderVoltageRecovery,
    /// `usergw` - probe high-temperature limit.
    ProbeHighTemperature,
    /// `userhf` - probe temperature recovery.
    ProbeRecoveryTemperature,
    /// `mosgw` - MOS high-temperature limit.
    MosHighTemperature,
    /// `moshf` - MOS temperature recovery.
    MosRecoveryTemperature,
    /// `jhyc` - balance start voltage difference.
    BalanceVoltageDiff,
    /// `jhwd` - balance temperature limit.
    BalanceTemperature,
    /// `dcrl` - battery design capacity.
    BatteryCapacity,
    /// `ycjh` - voltage-diff balance threshold.
    VoltageDiffBalance,
    /// `jhqd` - balance start voltage.
    BalanceStart,
    /// `dqdl` - current limit.
    CurrentLimit,
    /// `gzys` - fault delay in seconds.
    FaultDelay,
    /// `glbh` - over-current protection threshold.
    OverCurrentProtection,
    /// `cdgl` - charging over-current threshold.
    ChargingOverCurrent,
    /// `ycbh` - voltage-diff protection threshold.
    VoltageDiffProtection,
    /// `dljd` - current detection setting.
    CurrentDetection,
    /// `dlxd` - current debounce setting.
    CurrentDebounce,
    /// `dlys` - short-circuit delay.
    ShortCircuitDelay,
    /// `jhpl` - balance frequency.
    BalanceFrequency,
    /// `ver` - firmware version string.
    FirmwareVersion,
}

impl Parameter {
    pub const ALL: [Parameter; 24] = [
        Parameter::SeriesCount,
        Parameter::OverVoltageProtection,
        Parameter::OverVoltageRecovery,
        Parameter::UnderVoltageProtection,
        Parameter::UnderVoltageRecovery,
        Parameter::ProbeHighTemperature,
        Parameter::ProbeRecoveryTemperature,
        Parameter::MosHighTemperature,
        Parameter::MosRecoveryTemperature,
        Parameter::BalanceVoltageDiff,
        Parameter::BalanceTemperature,
        Parameter::BatteryCapacity,
        Parameter::VoltageDiffBalance,
        Parameter::BalanceStart,
        Parameter::CurrentLimit,
        Parameter::FaultDelay,
        Parameter::OverCurrentProtection,
        Parameter::ChargingOverCurrent,
        Parameter::VoltageDiffProtection,
        Parameter::CurrentDetection,
        Parameter::CurrentDebounce,
        Parameter::ShortCircuitDelay,
        Parameter::BalanceFrequency,
        Parameter::FirmwareVersion,
    ];

    /// The wire-protocol command prefix.
    pub fn prefix(&self) -> &'static str {
        match self {
            Parameter::SeriesCount => "CS",
            Parameter::OverVoltageProtection => "gybh",
            Parameter::OverVoltageRecovery => "gyhf",
            Parameter::UnderVoltageProtection => "qybh",
            Parameter::UnderVoltageRecovery => "qyhf",
            Parameter::ProbeHighTemperature => "usergw",
            Parameter::ProbeRecoveryTemperature => "userhf",
            Parameter::MosHighTemperature => "mosgw",
            Parameter::MosRecoveryTemperature => "moshf",
            Parameter::BalanceVoltageDiff => "jhyc",
            Parameter::BalanceTemperature => "jhwd",
            Parameter::BatteryCapacity => "dcrl",
            Parameter::VoltageDiffBalance => "ycjh",
            Parameter::BalanceStart => "jhqd",
            Parameter::CurrentLimit => "dqdl",
            Parameter::FaultDelay => "gzys",
            Parameter::OverCurrentProtection => "glbh",
            Parameter::ChargingOverCurrent => "cdgl",
            Parameter::VoltageDiffProtection => "ycbh",
            Parameter::CurrentDetection => "dljd",
            Parameter::CurrentDebounce => "dlxd",
            Parameter::ShortCircuitDelay => "dlys",
            Parameter::BalanceFrequency => "jhpl",
            Parameter::FirmwareVersion => "ver",
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Parameter> {
        Parameter::ALL.iter().copied().find(|p| p.prefix() == prefix)
    }

    /// Display unit of the parameter value.
    pub fn unit(&self) -> &'static str {
        match self {
            Parameter::SeriesCount => "S",
            Parameter::OverVoltageProtection
            | Parameter::OverVoltageRecovery
            | Parameter::UnderVoltageProtection
            | Parameter::UnderVoltageRecovery
            | Parameter::BalanceVoltageDiff
            | Parameter::VoltageDiffBalance
            | Parameter::BalanceStart
            | Parameter::VoltageDiffProtection => "V",
            Parameter::ProbeHighTemperature
            | Parameter::ProbeRecoveryTemperature
            | Parameter::MosHighTemperature
            | Parameter::MosRecoveryTemperature
            | Parameter::BalanceTemperature => "\u{2103}",
            Parameter::BatteryCapacity => "Ah",
            Parameter::CurrentLimit
            | Parameter::OverCurrentProtection
            | Parameter::ChargingOverCurrent
            | Parameter::CurrentDetection
            | Parameter::CurrentDebounce => "A",
            Parameter::FaultDelay => "s",
            Parameter::ShortCircuitDelay => "us",
            Parameter::BalanceFrequency => "ms",
            Parameter::FirmwareVersion => "",
        }
    }
}

/// Last device-reported value per parameter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterTable {
    values: BTreeMap<Parameter, String>,
}

impl ParameterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an echoed value. Returns the matched parameter, or `None` for
    /// an unknown prefix (which the caller logs and drops).
    pub fn set(&mut self, prefix: &str, value: &str) -> Option<Parameter> {
        let param = Parameter::from_prefix(prefix)?;
        self.values.insert(param, value.to_owned());
        Some(param)
    }

    pub fn get(&self, param: Parameter) -> Option<&str> {
        self.values.get(&param).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Parameter, &str)> {
        self.values.iter().map(|(p, v)| (*p, v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}
