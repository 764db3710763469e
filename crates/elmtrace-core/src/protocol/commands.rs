//! Command catalog and per-command decoding
//!
//! Each command pairs a fixed ASCII request with a decoder that turns a
//! framed response into a physical value. Every OBD response carries a
//! two-byte mode+PID echo prefix, so signal bytes start at index 2.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use super::{framer, ProtocolError, COMMAND_TERMINATOR};
use crate::connection::ConnectionManager;

/// The fixed catalog of AT and OBD commands this adapter dialect speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObdCommand {
    /// Reset the adapter (`AT Z`)
    Reset,
    /// Repeat the previous command (`AT \r`)
    Repeat,
    /// Echo off (`AT E0`)
    EchoOff,
    /// Echo on (`AT E1`)
    EchoOn,
    /// Linefeeds off (`AT L0`)
    LinefeedsOff,
    /// Linefeeds on (`AT L1`)
    LinefeedsOn,
    /// Automatic protocol selection (`AT SP0`)
    AutoProtocol,
    /// Adapter supply voltage (`AT RV`)
    ReadVoltage,
    /// Engine speed, mode 01 PID 0C
    EngineRpm,
    /// Vehicle speed, mode 01 PID 0D
    VehicleSpeed,
}

impl ObdCommand {
    /// The exact request string, without the carriage-return terminator.
    pub fn request(&self) -> &'static str {
        match self {
            ObdCommand::Reset => "AT Z",
            ObdCommand::Repeat => "AT \r",
            ObdCommand::EchoOff => "AT E0",
            ObdCommand::EchoOn => "AT E1",
            ObdCommand::LinefeedsOff => "AT L0",
            ObdCommand::LinefeedsOn => "AT L1",
            ObdCommand::AutoProtocol => "AT SP0",
            ObdCommand::ReadVoltage => "AT RV",
            ObdCommand::EngineRpm => "01 0C",
            ObdCommand::VehicleSpeed => "01 0D",
        }
    }

    /// Human-readable command name.
    pub fn name(&self) -> &'static str {
        match self {
            ObdCommand::Reset => "reset",
            ObdCommand::Repeat => "repeat",
            ObdCommand::EchoOff => "echo off",
            ObdCommand::EchoOn => "echo on",
            ObdCommand::LinefeedsOff => "linefeeds off",
            ObdCommand::LinefeedsOn => "linefeeds on",
            ObdCommand::AutoProtocol => "auto protocol",
            ObdCommand::ReadVoltage => "battery voltage",
            ObdCommand::EngineRpm => "engine RPM",
            ObdCommand::VehicleSpeed => "vehicle speed",
        }
    }

    /// Unit of the decoded value; empty for configuration commands.
    pub fn unit(&self) -> &'static str {
        match self {
            ObdCommand::EngineRpm => "RPM",
            ObdCommand::VehicleSpeed => "km/h",
            ObdCommand::ReadVoltage => "V",
            _ => "",
        }
    }

    /// Whether the response payload is expected to be a hex byte run.
    pub fn expects_hex_payload(&self) -> bool {
        matches!(self, ObdCommand::EngineRpm | ObdCommand::VehicleSpeed)
    }

    /// The bytes put on the wire: request plus the carriage return.
    pub fn wire_bytes(&self) -> Vec<u8> {
        let mut bytes = self.request().as_bytes().to_vec();
        bytes.push(COMMAND_TERMINATOR);
        bytes
    }

    /// Decode a framed response into a physical value.
    ///
    /// `payload` is the hex-decoded byte buffer; `raw` is the frame before
    /// cleaning, needed for text responses like `AT RV` whose decimal point
    /// would be eaten by the `.`-filler stripping. A buffer too short for
    /// the command's offsets yields `None` ("no data"), never a panic.
    pub fn decode(&self, raw: &str, payload: &[u8]) -> Option<f64> {
        match self {
            // ((A * 256) + B) / 4, skipping the 41 0C echo prefix
            ObdCommand::EngineRpm => {
                let a = *payload.get(2)? as u32;
                let b = *payload.get(3)? as u32;
                Some(((a * 256 + b) / 4) as f64)
            }
            // single byte A after the 41 0D echo prefix
            ObdCommand::VehicleSpeed => Some(*payload.get(2)? as f64),
            ObdCommand::ReadVoltage => decode_voltage(raw),
            _ => None,
        }
    }

    /// Issue this command over `conn`: send, optionally wait
    /// `response_delay`, then perform the framed read and decode.
    ///
    /// Each call produces a fresh [`CommandInvocation`]; there is no shared
    /// buffer between calls. The manager's command gate serializes the
    /// request/response pair against other callers.
    pub fn run(
        &self,
        conn: &ConnectionManager,
        response_delay: Duration,
    ) -> Result<CommandInvocation, ProtocolError> {
        self.transact(conn, &self.wire_bytes(), response_delay)
    }

    /// Re-issue the previous request with a lone carriage return, decoding
    /// the response as this command.
    pub fn resend(
        &self,
        conn: &ConnectionManager,
        response_delay: Duration,
    ) -> Result<CommandInvocation, ProtocolError> {
        self.transact(conn, &[COMMAND_TERMINATOR], response_delay)
    }

    fn transact(
        &self,
        conn: &ConnectionManager,
        wire: &[u8],
        response_delay: Duration,
    ) -> Result<CommandInvocation, ProtocolError> {
        let _gate = conn.command_gate();
        let started_at = Instant::now();

        conn.write(wire)?;
        if !response_delay.is_zero() {
            std::thread::sleep(response_delay);
        }
        let raw = conn.read_frame()?.ok_or(ProtocolError::ConnectionLost)?;

        let cleaned = framer::clean_response(&raw);
        if self.expects_hex_payload() && !framer::is_hex_plausible(&cleaned) {
            tracing::debug!(command = self.name(), frame = %cleaned,
                "expected a hex payload, decoding will yield no data");
        }
        let payload = framer::decode_payload(&cleaned);
        let value = self.decode(&raw, &payload);
        let finished_at = Instant::now();

        tracing::debug!(command = self.name(), frame = %cleaned,
            elapsed_ms = (finished_at - started_at).as_millis() as u64, "command completed");

        Ok(CommandInvocation {
            command: *self,
            started_at,
            finished_at,
            raw,
            payload,
            value,
        })
    }
}

/// Pull the numeric part out of a voltage frame such as `12.6V` (possibly
/// with echo around it).
fn decode_voltage(raw: &str) -> Option<f64> {
    let digits: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    digits.parse().ok()
}

/// One completed command round trip. Created at invocation start, never
/// shared across calls.
#[derive(Debug, Clone)]
pub struct CommandInvocation {
    /// The command that was issued.
    pub command: ObdCommand,
    /// When the request was sent.
    pub started_at: Instant,
    /// When the decoded response was ready.
    pub finished_at: Instant,
    /// Raw frame as received, prompt stripped, noise intact.
    pub raw: String,
    /// Hex-decoded byte buffer (two characters per byte).
    pub payload: Vec<u8>,
    /// Decoded physical value, `None` when the response carried no data.
    pub value: Option<f64>,
}

impl CommandInvocation {
    /// Round-trip latency of this invocation.
    pub fn elapsed(&self) -> Duration {
        self.finished_at.duration_since(self.started_at)
    }

    /// Bare value rendering, `NO DATA` when decoding yielded nothing.
    pub fn calculated_result(&self) -> String {
        match self.value {
            Some(v) => format_value(v),
            None => "NO DATA".to_string(),
        }
    }

    /// `"<value> <unit>"` rendering for display.
    pub fn formatted_result(&self) -> String {
        match self.value {
            Some(v) => format!("{} {}", format_value(v), self.command.unit()),
            None => "NO DATA".to_string(),
        }
    }
}

fn format_value(v: f64) -> String {
    if v.fract() == 0.0 {
        format!("{}", v as i64)
    } else {
        format!("{:.1}", v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn catalog_strings_are_exact() {
        assert_eq!(ObdCommand::Reset.request(), "AT Z");
        assert_eq!(ObdCommand::Repeat.request(), "AT \r");
        assert_eq!(ObdCommand::EchoOff.request(), "AT E0");
        assert_eq!(ObdCommand::EchoOn.request(), "AT E1");
        assert_eq!(ObdCommand::LinefeedsOff.request(), "AT L0");
        assert_eq!(ObdCommand::LinefeedsOn.request(), "AT L1");
        assert_eq!(ObdCommand::AutoProtocol.request(), "AT SP0");
        assert_eq!(ObdCommand::ReadVoltage.request(), "AT RV");
        assert_eq!(ObdCommand::EngineRpm.request(), "01 0C");
        assert_eq!(ObdCommand::VehicleSpeed.request(), "01 0D");
    }

    #[test]
    fn wire_bytes_append_carriage_return() {
        assert_eq!(ObdCommand::EngineRpm.wire_bytes(), b"01 0C\r".to_vec());
    }

    #[test]
    fn hex_payload_expected_only_for_obd_queries() {
        assert!(ObdCommand::EngineRpm.expects_hex_payload());
        assert!(ObdCommand::VehicleSpeed.expects_hex_payload());
        assert!(!ObdCommand::ReadVoltage.expects_hex_payload());
        assert!(!ObdCommand::Reset.expects_hex_payload());
        assert!(!ObdCommand::EchoOff.expects_hex_payload());
    }

    #[test]
    fn rpm_decode_reference_vector() {
        let payload = [0x41, 0x0C, 0x1A, 0xF8];
        let value = ObdCommand::EngineRpm.decode("", &payload);
        assert_eq!(value, Some(1726.0));
    }

    #[test]
    fn speed_decode_skips_echo_prefix() {
        let payload = [0x41, 0x0D, 0x2A];
        assert_eq!(ObdCommand::VehicleSpeed.decode("", &payload), Some(42.0));
    }

    #[test]
    fn short_buffer_yields_no_data() {
        assert_eq!(ObdCommand::EngineRpm.decode("", &[0x41, 0x0C]), None);
        assert_eq!(ObdCommand::VehicleSpeed.decode("", &[]), None);
    }

    #[test]
    fn voltage_decodes_from_raw_frame() {
        assert_eq!(ObdCommand::ReadVoltage.decode("12.6V\r\r", &[]), Some(12.6));
        assert_eq!(
            ObdCommand::ReadVoltage.decode("AT RV\r12.6V\r", &[]),
            Some(12.6)
        );
        assert_eq!(ObdCommand::ReadVoltage.decode("?\r", &[]), None);
    }

    #[test]
    fn formatting() {
        let inv = CommandInvocation {
            command: ObdCommand::EngineRpm,
            started_at: Instant::now(),
            finished_at: Instant::now(),
            raw: "41 0C 1A F8".into(),
            payload: vec![0x41, 0x0C, 0x1A, 0xF8],
            value: Some(1726.0),
        };
        assert_eq!(inv.formatted_result(), "1726 RPM");
        assert_eq!(inv.calculated_result(), "1726");

        let none = CommandInvocation { value: None, ..inv };
        assert_eq!(none.formatted_result(), "NO DATA");
    }
}
