//! Wire protocol: outbound command builders and the inbound line decoder.
//!
//! The device speaks a newline-delimited ASCII protocol. Each line holds
//! whitespace-separated tokens of four shapes:
//!
//! - fixed status tokens (`cdopen`, `cdclose[<fault>[<delay>]]`, `fdopen`,
//!   `fdclose[<fault>[<delay>]]`, `jhstop`),
//! - telemetry `key:value` pairs with 2-6 character mnemonic keys,
//! - parameter echoes `prefix=value`,
//! - auth responses (`pd1`/`pd0`) and the restart acknowledgement (`RES`).
//!
//! Unknown keys and prefixes are logged and dropped rather than treated as
//! errors, so decoding survives firmware that is newer than this crate.

use crate::battery::{BatteryState, FaultReason};
use crate::params::{Parameter, ParameterTable};
use log::{debug, warn};

/// Device response confirming a password submission.
pub const AUTH_SUCCESS: &str = "pd1";
/// Device response rejecting a password submission.
pub const AUTH_FAILURE: &str = "pd0";
/// Device acknowledgement of a `restart` command.
pub const RESTART_ACK: &str = "RES";

/// Heartbeat poll payload.
pub const POLL: &str = "re";
/// Request a dump of every parameter echo.
pub const READ_PARAMETERS: &str = "read\n";

pub const CHARGE_OPEN: &str = "cdopen\n";
pub const CHARGE_CLOSE: &str = "cdclose\n";
pub const DISCHARGE_OPEN: &str = "fdopen\n";
pub const DISCHARGE_CLOSE: &str = "fdclose\n";
pub const ONE_KEY_BALANCE: &str = "okjh\n";
pub const RESTART: &str = "restart\n";
pub const RESET_CURRENT: &str = "dl0\n";

/// One-command battery chemistry presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChemistryPreset {
    /// LiFePO4 (`okFe`).
    Iron,
    /// Lithium titanate (`okTi`).
    Titanate,
    /// Ternary lithium (`okCo`).
    Ternary,
}

impl ChemistryPreset {
    pub fn command(&self) -> &'static str {
        match self {
            ChemistryPreset::Iron => "okFe\n",
            ChemistryPreset::Titanate => "okTi\n",
            ChemistryPreset::Ternary => "okCo\n",
        }
    }
}

/// Build the password submission command: fixed prefix, the password, a NUL
/// and the line terminator.
pub fn password_command(password: &str) -> String {
    format!("pswd={password}\u{0}\n")
}

/// Build an analog parameter write. The value is scaled by ten and encoded
/// as a big-endian 16-bit pair of hex bytes, e.g. `gybh=0x01,0x6d` for 36.5.
pub fn analog_command(param: Parameter, value: f64) -> String {
    let scaled = (value * 10.0).floor() as u16;
    let [hi, lo] = scaled.to_be_bytes();
    format!("{}=0x{hi:02x},0x{lo:02x}\n", param.prefix())
}

/// Build an integer parameter write, a single hex byte, e.g. `gzys=0x1e`.
pub fn integer_command(param: Parameter, value: u8) -> String {
    format!("{}=0x{value:02x}\n", param.prefix())
}

/// Build the device rename command. The new name only takes effect on the
/// next connection.
pub fn rename_command(name: &str) -> String {
    format!("FC-{name}\r\n")
}

/// Outcome of a password submission as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthResponse {
    Success,
    Failure,
}

/// Side effects of a decoded line that the session must act on, beyond the
/// in-place updates to [`BatteryState`] and [`ParameterTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEvent {
    /// An auth response token, forwarded to the auth session.
    Auth(AuthResponse),
    /// The device acknowledged a restart.
    Restarted,
    /// A fault token seeded the fault-delay countdown with this many seconds.
    FaultDelaySeeded(u32),
}

/// Decode one complete line, updating the battery model and parameter table
/// in place and returning the events the session must handle.
///
/// The caller fires exactly one change notification per decoded line; a
/// single packet commonly updates a dozen fields and per-token notification
/// would only cause downstream churn.
pub fn decode_line(
    line: &str,
    battery: &mut BatteryState,
    params: &mut ParameterTable,
) -> Vec<LineEvent> {
    let mut events = Vec::new();

    for token in line.split_whitespace() {
        match token {
            AUTH_SUCCESS => {
                events.push(LineEvent::Auth(AuthResponse::Success));
                continue;
            }
            AUTH_FAILURE => {
                events.push(LineEvent::Auth(AuthResponse::Failure));
                continue;
            }
            RESTART_ACK => {
                events.push(LineEvent::Restarted);
                continue;
            }
            _ => {}
        }

        if token.contains("cdopen") {
            battery.charging_status = true;
            battery.cd_close_fault = None;
        } else if token.contains("cdclose") {
            battery.charging_status = false;
            if let Some((fault, delay)) = parse_fault_suffix(token, "cdclose") {
                battery.cd_close_fault = fault;
                if delay > 0 {
                    events.push(LineEvent::FaultDelaySeeded(delay));
                }
            }
        } else if token.contains("fdopen") {
            battery.discharging_status = true;
            battery.fd_close_fault = None;
        } else if token.contains("fdclose") {
            battery.discharging_status = false;
            if let Some((fault, delay)) = parse_fault_suffix(token, "fdclose") {
                battery.fd_close_fault = fault;
                if delay > 0 {
                    events.push(LineEvent::FaultDelaySeeded(delay));
                }
            }
        } else if token.contains("jhstop") {
            battery.balancing_status = false;
        } else if let Some((key, value)) = split_key_value(token) {
            apply_telemetry(battery, key, value);
        }

        // Any `prefix=value` token is also offered to the parameter table,
        // independent of the telemetry handling above.
        let mut parts = token.split('=');
        if let (Some(prefix), Some(value), None) = (parts.next(), parts.next(), parts.next()) {
            apply_parameter(battery, params, prefix.trim(), value.trim());
        }
    }

    events
}

/// Parse the optional fault byte (offset 7) and delay-seconds suffix
/// (offset 8..) of a `cdclose`/`fdclose` token.
fn parse_fault_suffix(token: &str, marker: &str) -> Option<(Option<FaultReason>, u32)> {
    let token = token.trim_end();
    if !token.starts_with(marker) || token.chars().count() <= marker.len() {
        return None;
    }

    let mut rest = token.chars().skip(marker.len());
    let status_byte = rest.next()? as u32 as u8;
    let fault = FaultReason::from_status_byte(status_byte);
    debug!(
        "{marker} status byte 0x{status_byte:02x} -> {:?}",
        fault.map(|f| f.label())
    );

    let delay: u32 = {
        let digits: String = rest.take_while(char::is_ascii_digit).collect();
        digits.parse().unwrap_or(0)
    };
    Some((fault, delay))
}

/// Split a token into key and value, trying `:` before `=`.
fn split_key_value(token: &str) -> Option<(&str, &str)> {
    for sep in [':', '='] {
        let mut parts = token.split(sep);
        if let (Some(key), Some(value), None) = (parts.next(), parts.next(), parts.next()) {
            return Some((key.trim(), value.trim()));
        }
    }
    None
}

/// Apply one telemetry pair to the battery model.
///
/// Unparsable numeric values deliberately map to zero, mirroring the device
/// app's established behavior; a legitimate zero and a garbled value are
/// indistinguishable downstream.
fn apply_telemetry(battery: &mut BatteryState, key: &str, value: &str) {
    let float = || value.parse::<f64>().unwrap_or(0.0);
    let int = || value.parse::<u32>().unwrap_or(0);

    match key {
        "zdy" => battery.total_voltage = float(),
        "yc" => battery.voltage_diff = float(),
        "zd" => battery.lowest_string = int(),
        "min" => battery.min_voltage = float(),
        "zg" => battery.highest_string = int(),
        "max" => battery.max_voltage = float(),
        "dl" => battery.current = float(),
        "gl" => battery.power = float(),
        "bl" => battery.ratio = float(),
        "rl" => battery.capacity = float(),
        "zx" => battery.total_capacity = float(),
        "pj" => battery.average_voltage = float(),
        "moswd" => battery.mos_temperature = float(),
        "jhwd" => battery.balance_temperature = float(),
        "xpwd1" => battery.chip1_temperature = float(),
        "xpwd2" => battery.chip2_temperature = float(),
        "jhzt" => {
            battery.balancing_status = true;
            // The value is a run of characters whose code points are the
            // raw bitmap bytes. Short runs are noise from a split packet.
            if value.chars().count() >= 4 {
                let bytes: Vec<u8> = value.chars().map(|c| c as u32 as u8).collect();
                battery.set_balance_bitmap(&bytes);
                debug!("balance bitmap: {}", hex::encode(&bytes));
            }
        }
        _ => {
            // `u<N>` updates probe temperature N; a bare positive integer
            // key updates string voltage N.
            if let Some(rest) = key.strip_prefix('u') {
                if let (Ok(index), Ok(temp)) = (rest.parse::<usize>(), value.parse::<f64>()) {
                    battery.set_probe_temperature(index, temp);
                    return;
                }
            }
            if let (Ok(index), Ok(voltage)) = (key.parse::<usize>(), value.parse::<f64>()) {
                battery.set_string_voltage(index, voltage);
                return;
            }
            debug!("ignoring unknown telemetry key {key:?}");
        }
    }
}

/// Apply one `prefix=value` echo to the parameter table, with the side
/// effects `CS` and `ycbh` have on the battery model.
fn apply_parameter(
    battery: &mut BatteryState,
    params: &mut ParameterTable,
    prefix: &str,
    value: &str,
) {
    match params.set(prefix, value) {
        Some(Parameter::SeriesCount) => {
            let count = value.parse::<usize>().unwrap_or(0);
            battery.set_total_strings(count);
            debug!("string count set to {}", battery.total_strings);
        }
        Some(Parameter::VoltageDiffProtection) => {
            battery.ycbh = value.parse().unwrap_or(0.0);
        }
        Some(_) => {}
        None => warn!("ignoring unknown parameter prefix {prefix:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::battery::FaultReason;

    fn decode(line: &str, battery: &mut BatteryState, params: &mut ParameterTable) -> Vec<LineEvent> {
        decode_line(line, battery, params)
    }

    #[test]
    fn telemetry_line_updates_fields() {
        let mut battery = BatteryState::new();
        let mut params = ParameterTable::new();
        let events = decode("zdy:52.40 dl:1.23 gl:64.50", &mut battery, &mut params);
        assert!(events.is_empty());
        assert_eq!(battery.total_voltage, 52.40);
        assert_eq!(battery.current, 1.23);
        assert_eq!(battery.power, 64.50);
    }

    #[test]
    fn string_voltage_and_probe_temperature_keys() {
        let mut battery = BatteryState::new();
        battery.voltages.clear();
        battery.temperatures.clear();
        let mut params = ParameterTable::new();
        decode("3:3.301 u2:24.5", &mut battery, &mut params);
        assert_eq!(battery.voltages.len(), 3);
        assert_eq!(battery.voltages[2], 3.301);
        assert_eq!(battery.temperatures, vec![0.0, 24.5]);
    }

    #[test]
    fn unparsable_value_maps_to_zero() {
        let mut battery = BatteryState::new();
        battery.total_voltage = 52.0;
        let mut params = ParameterTable::new();
        decode("zdy:garbage", &mut battery, &mut params);
        assert_eq!(battery.total_voltage, 0.0);
    }

    #[test]
    fn unknown_key_is_dropped() {
        let mut battery = BatteryState::new();
        let before = battery.clone();
        let mut params = ParameterTable::new();
        assert!(decode("nope:1.0", &mut battery, &mut params).is_empty());
        assert_eq!(battery, before);
    }

    #[test]
    fn auth_and_restart_tokens_become_events() {
        let mut battery = BatteryState::new();
        let mut params = ParameterTable::new();
        let events = decode("pd1 RES pd0", &mut battery, &mut params);
        assert_eq!(
            events,
            vec![
                LineEvent::Auth(AuthResponse::Success),
                LineEvent::Restarted,
                LineEvent::Auth(AuthResponse::Failure),
            ]
        );
    }

    #[test]
    fn charge_status_tokens_toggle_flags() {
        let mut battery = BatteryState::new();
        let mut params = ParameterTable::new();
        decode("cdopen fdopen", &mut battery, &mut params);
        assert!(battery.charging_status);
        assert!(battery.discharging_status);
        decode("cdclose jhstop", &mut battery, &mut params);
        assert!(!battery.charging_status);
        assert!(!battery.balancing_status);
    }

    #[test]
    fn cdclose_fault_byte_seeds_delay() {
        let mut battery = BatteryState::new();
        let mut params = ParameterTable::new();
        // 0x11 = string-drop | under-voltage; string-drop wins the priority
        // match. Trailing digits are the delay in seconds.
        let line = format!("cdclose{}002", '\u{11}');
        let events = decode(&line, &mut battery, &mut params);
        assert!(!battery.charging_status);
        assert_eq!(battery.cd_close_fault, Some(FaultReason::StringDrop));
        assert_eq!(battery.cd_close_fault.unwrap().label(), "string_drop");
        assert_eq!(events, vec![LineEvent::FaultDelaySeeded(2)]);
    }

    #[test]
    fn fdclose_fault_without_delay() {
        let mut battery = BatteryState::new();
        let mut params = ParameterTable::new();
        let line = format!("fdclose{}", '\u{80}');
        let events = decode(&line, &mut battery, &mut params);
        assert_eq!(battery.fd_close_fault, Some(FaultReason::ShortCircuit));
        assert!(events.is_empty());
    }

    #[test]
    fn cdopen_clears_previous_fault() {
        let mut battery = BatteryState::new();
        battery.cd_close_fault = Some(FaultReason::OverCurrent);
        let mut params = ParameterTable::new();
        decode("cdopen", &mut battery, &mut params);
        assert_eq!(battery.cd_close_fault, None);
    }

    #[test]
    fn bare_cdclose_has_no_fault_suffix() {
        let mut battery = BatteryState::new();
        let mut params = ParameterTable::new();
        assert!(decode("cdclose", &mut battery, &mut params).is_empty());
        assert_eq!(battery.cd_close_fault, None);
    }

    #[test]
    fn parameter_echo_lands_in_table_and_battery() {
        let mut battery = BatteryState::new();
        battery.voltages = vec![0.0; 4];
        battery.balance_status = vec![0; 1];
        battery.set_string_voltage(2, 3.2);
        let mut params = ParameterTable::new();
        decode("CS=16 gybh=3.65 ycbh=0.25", &mut battery, &mut params);
        assert_eq!(params.get(Parameter::SeriesCount), Some("16"));
        assert_eq!(params.get(Parameter::OverVoltageProtection), Some("3.65"));
        assert_eq!(battery.total_strings, 16);
        assert_eq!(battery.voltages.len(), 16);
        assert_eq!(battery.voltages[1], 3.2);
        assert_eq!(battery.ycbh, 0.25);
    }

    #[test]
    fn balance_bitmap_token() {
        let mut battery = BatteryState::new();
        battery.set_total_strings(24);
        let mut params = ParameterTable::new();
        let line = format!("jhzt:{}{}{}{}", '\u{1}', '\u{0}', '\u{2}', '\u{0}');
        decode(&line, &mut battery, &mut params);
        assert!(battery.balancing_status);
        assert_eq!(&battery.balance_status[..4], &[1, 0, 2, 0]);
        assert_eq!(battery.balancing_strings(), vec![1, 14]);
    }

    #[test]
    fn command_builders() {
        assert_eq!(password_command("1234"), "pswd=1234\u{0}\n");
        assert_eq!(analog_command(Parameter::OverVoltageProtection, 36.5), "gybh=0x01,0x6d\n");
        assert_eq!(analog_command(Parameter::BalanceVoltageDiff, 0.05), "jhyc=0x00,0x00\n");
        assert_eq!(integer_command(Parameter::FaultDelay, 30), "gzys=0x1e\n");
        assert_eq!(rename_command("PACK-7"), "FC-PACK-7\r\n");
        assert_eq!(ChemistryPreset::Iron.command(), "okFe\n");
    }
}
