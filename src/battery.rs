//! The owned battery telemetry model.
//!
//! Mutated only by the protocol decoder; everything else reads it through
//! session snapshots. Defaults mirror the hardware maximum of 252 strings,
//! with 6 strings packed per balance-bitmap byte.

/// Hardware ceiling on the number of battery strings.
pub const MAX_STRINGS: usize = 252;

/// Strings represented by one byte of the balance bitmap.
const STRINGS_PER_BALANCE_BYTE: usize = 6;

/// Reason a protective MOS switch was closed, decoded from the fault byte
/// embedded in `cdclose`/`fdclose` status tokens.
///
/// The byte is a bitmask; when several bits are set the first match in
/// [`FaultReason::from_status_byte`] order wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultReason {
    ShortCircuit,
    StringDrop,
    UnderVoltage,
    ManualClose,
    MosOverTemperature,
    ProbeOverTemperature,
    OverCurrent,
    DelayRecovery,
}

impl FaultReason {
    /// Match order: short-circuit first, then string-drop ahead of the
    /// single-cell faults, over-current ahead of delay-recovery.
    const PRIORITY: [(u8, FaultReason); 8] = [
        (0x80, FaultReason::ShortCircuit),
        (0x10, FaultReason::StringDrop),
        (0x01, FaultReason::UnderVoltage),
        (0x02, FaultReason::ManualClose),
        (0x04, FaultReason::MosOverTemperature),
        (0x08, FaultReason::ProbeOverTemperature),
        (0x40, FaultReason::OverCurrent),
        (0x20, FaultReason::DelayRecovery),
    ];

    pub fn from_status_byte(byte: u8) -> Option<FaultReason> {
        Self::PRIORITY
            .iter()
            .find(|(mask, _)| byte & mask != 0)
            .map(|&(_, reason)| reason)
    }

    /// Stable machine-readable label, used in snapshots and logs.
    pub fn label(&self) -> &'static str {
        match self {
            FaultReason::ShortCircuit => "short_circuit_protection",
            FaultReason::StringDrop => "string_drop",
            FaultReason::UnderVoltage => "single_under_voltage",
            FaultReason::ManualClose => "manual_close",
            FaultReason::MosOverTemperature => "mos_high_temp",
            FaultReason::ProbeOverTemperature => "probe_high_temp",
            FaultReason::OverCurrent => "over_current_protection",
            FaultReason::DelayRecovery => "delay_recovery",
        }
    }
}

/// The reported state of the battery.
#[derive(Debug, Clone, PartialEq)]
pub struct BatteryState {
    /// Pack voltage in V.
    pub total_voltage: f64,
    /// Spread between highest and lowest string voltage in V.
    pub voltage_diff: f64,
    /// Voltage-diff protection threshold in V (`ycbh` parameter echo).
    pub ycbh: f64,
    /// 1-based index of the string with the lowest voltage.
    pub lowest_string: u32,
    pub min_voltage: f64,
    /// 1-based index of the string with the highest voltage.
    pub highest_string: u32,
    pub max_voltage: f64,
    pub average_voltage: f64,
    /// Pack current in A.
    pub current: f64,
    /// Pack power in W.
    pub power: f64,
    /// State of charge in %.
    pub ratio: f64,
    /// Remaining capacity in Ah.
    pub capacity: f64,
    /// Design capacity in Ah.
    pub total_capacity: f64,
    pub mos_temperature: f64,
    pub balance_temperature: f64,
    pub chip1_temperature: f64,
    pub chip2_temperature: f64,
    /// Probe temperatures, index = probe number - 1, sparse-extended on
    /// demand as `u<N>` keys arrive.
    pub temperatures: Vec<f64>,
    /// Per-string voltages in V, index = string number - 1. Grown lazily,
    /// never shrunk.
    pub voltages: Vec<f64>,
    pub charging_status: bool,
    pub discharging_status: bool,
    pub balancing_status: bool,
    /// Which strings are actively balancing, 6 strings per byte, bit N of
    /// byte B = string B*6 + N + 1.
    pub balance_status: Vec<u8>,
    pub total_strings: usize,
    /// Seconds remaining on an active fault delay, counted down at 1 Hz.
    pub gzys: u32,
    /// Why the charge MOS was last closed, cleared on `cdopen`.
    pub cd_close_fault: Option<FaultReason>,
    /// Why the discharge MOS was last closed, cleared on `fdopen`.
    pub fd_close_fault: Option<FaultReason>,
}

impl Default for BatteryState {
    fn default() -> Self {
        Self {
            total_voltage: 0.0,
            voltage_diff: 0.0,
            ycbh: 0.0,
            lowest_string: 0,
            min_voltage: 0.0,
            highest_string: 0,
            max_voltage: 0.0,
            average_voltage: 0.0,
            current: 0.0,
            power: 0.0,
            ratio: 0.0,
            capacity: 0.0,
            total_capacity: 0.0,
            mos_temperature: 0.0,
            balance_temperature: 0.0,
            chip1_temperature: 0.0,
            chip2_temperature: 0.0,
            temperatures: vec![0.0; 4],
            voltages: vec![0.0; MAX_STRINGS],
            charging_status: false,
            discharging_status: false,
            balancing_status: false,
            balance_status: vec![0; balance_bytes_for(MAX_STRINGS)],
            total_strings: MAX_STRINGS,
            gzys: 0,
            cd_close_fault: None,
            fd_close_fault: None,
        }
    }
}

impl BatteryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a `CS` echo: clamp to the hardware range and grow the dependent
    /// arrays. Arrays are never shrunk, so values already reported for low
    /// string indices survive a string-count change.
    pub fn set_total_strings(&mut self, count: usize) {
        let count = count.min(MAX_STRINGS);
        self.total_strings = count;
        if self.voltages.len() < count {
            self.voltages.resize(count, 0.0);
        }
        let needed = balance_bytes_for(count);
        if self.balance_status.len() < needed {
            self.balance_status.resize(needed, 0);
        }
    }

    /// Record the voltage of a 1-based string index, growing the array when
    /// the device reports a string we have not seen yet.
    pub fn set_string_voltage(&mut self, index: usize, voltage: f64) {
        if index == 0 || index > MAX_STRINGS {
            return;
        }
        if self.voltages.len() < index {
            self.voltages.resize(index, 0.0);
        }
        self.voltages[index - 1] = voltage;
    }

    /// Record the temperature of a 1-based probe index, sparse-extending the
    /// array on demand.
    pub fn set_probe_temperature(&mut self, index: usize, temperature: f64) {
        if index == 0 {
            return;
        }
        if self.temperatures.len() < index {
            self.temperatures.resize(index, 0.0);
        }
        self.temperatures[index - 1] = temperature;
    }

    /// Overwrite the head of the balance bitmap with device-reported bytes.
    pub fn set_balance_bitmap(&mut self, bytes: &[u8]) {
        for (slot, &byte) in self.balance_status.iter_mut().zip(bytes) {
            *slot = byte;
        }
    }

    /// Whether the given 0-based string index is actively balancing.
    pub fn is_balancing(&self, string_index: usize) -> bool {
        if string_index >= self.total_strings {
            return false;
        }
        let byte_index = string_index / STRINGS_PER_BALANCE_BYTE;
        let bit = 1u8 << (string_index % STRINGS_PER_BALANCE_BYTE);
        self.balance_status
            .get(byte_index)
            .map(|b| b & bit != 0)
            .unwrap_or(false)
    }

    /// 1-based indices of every string that is actively balancing.
    pub fn balancing_strings(&self) -> Vec<usize> {
        (0..self.total_strings)
            .filter(|&i| self.is_balancing(i))
            .map(|i| i + 1)
            .collect()
    }

    /// Whether the measured voltage spread exceeds the configured
    /// voltage-diff protection threshold.
    pub fn voltage_diff_alert(&self) -> bool {
        self.voltage_diff > 0.0 && self.ycbh > 0.0 && self.voltage_diff > self.ycbh
    }

    /// Rough charge percentage derived from the voltage window, clamped to
    /// 0..=100. The 3.0/4.2 fallbacks cover a device that has not reported
    /// its min/max yet.
    pub fn charge_percentage(&self) -> f64 {
        let min = if self.min_voltage > 0.0 { self.min_voltage } else { 3.0 };
        let max = if self.max_voltage > 0.0 { self.max_voltage } else { 4.2 };
        if max <= min {
            return 0.0;
        }
        ((self.total_voltage - min) / (max - min) * 100.0).clamp(0.0, 100.0)
    }
}

/// Bytes needed to hold a balance bitmap for `count` strings.
pub(crate) fn balance_bytes_for(count: usize) -> usize {
    count.div_ceil(STRINGS_PER_BALANCE_BYTE)
}
