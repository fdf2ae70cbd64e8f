//! Applying verified configuration to device state.
//!
//! The applier walks the top-level pairs of a [`VerifiedPayload`] and offers
//! each one to the device's [`DeviceState`]. Keys a device does not know,
//! and values of the wrong shape, are skipped; neither fails the cycle.
//! Settings that only last for one response (the lamp's colour and blink)
//! are reset by [`DeviceState::begin_update`] before each payload.
//!
//! Two device types ship with the crate:
//!
//! | Device        | Key  | Value                                         |
//! |---------------|------|-----------------------------------------------|
//! | Lamp          | `i`  | report interval in seconds                    |
//! |               | `r`, `g`, `b` | color channel, `0..=255`             |
//! |               | `bf` | blink flag                                    |
//! | Light sensor  | `i`  | report interval in seconds                    |
//! |               | `s`  | sensitivity flag: set for 10k lux, clear for 375 lux |
//! |               | `ir` | infrared filter register value, `0..=255`     |

use crate::consts::{DEFAULT_INTERVAL_SECS, LAMP_DEFAULT_INTERVAL_SECS, MAX_PAYLOAD_TOKENS};
use crate::scanner::{TokenKind, scan};
use crate::verify::VerifiedPayload;

/// A payload value offered to [`DeviceState::apply_field`].
///
/// The raw text is decoded on demand; every accessor returns `None` when the
/// value does not have the requested shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigValue<'a> {
    kind: TokenKind,
    bytes: &'a [u8],
}

impl<'a> ConfigValue<'a> {
    /// Wraps a scanned value.
    pub const fn new(kind: TokenKind, bytes: &'a [u8]) -> Self {
        Self { kind, bytes }
    }

    /// The value's token kind.
    pub fn kind(&self) -> TokenKind {
        self.kind
    }

    /// The value's raw text (string values without their quotes).
    pub fn raw(&self) -> &'a [u8] {
        self.bytes
    }

    /// Decimal digits as an unsigned integer. Signs, fractions, exponents
    /// and overflow all yield `None`.
    pub fn as_uint(&self) -> Option<u32> {
        if self.kind != TokenKind::Primitive || self.bytes.is_empty() {
            return None;
        }
        self.bytes.iter().try_fold(0u32, |acc, &b| {
            if !b.is_ascii_digit() {
                return None;
            }
            acc.checked_mul(10)?.checked_add(u32::from(b - b'0'))
        })
    }

    /// [`as_uint`](Self::as_uint) narrowed to `u8`.
    pub fn as_u8(&self) -> Option<u8> {
        self.as_uint().and_then(|v| u8::try_from(v).ok())
    }

    /// [`as_uint`](Self::as_uint) narrowed to `u16`.
    pub fn as_u16(&self) -> Option<u16> {
        self.as_uint().and_then(|v| u16::try_from(v).ok())
    }

    /// A single digit (nonzero is set) or a `true`/`false` literal.
    pub fn as_flag(&self) -> Option<bool> {
        if self.kind != TokenKind::Primitive {
            return None;
        }
        match self.bytes {
            [digit] if digit.is_ascii_digit() => Some(*digit != b'0'),
            b"true" => Some(true),
            b"false" => Some(false),
            _ => None,
        }
    }

    /// A string value without escapes, as text.
    pub fn as_str(&self) -> Option<&'a str> {
        if self.kind != TokenKind::String || self.bytes.contains(&b'\\') {
            return None;
        }
        core::str::from_utf8(self.bytes).ok()
    }
}

/// Mutable device settings the backend may reconfigure.
pub trait DeviceState {
    /// Applies one payload field. Returns `true` when `key` is recognized and
    /// `value` was accepted.
    fn apply_field(&mut self, key: &[u8], value: ConfigValue<'_>) -> bool;

    /// Resets settings that only last for one response. Called once per
    /// payload, before its first field is applied.
    fn begin_update(&mut self) {}

    /// Seconds to sleep between reports.
    fn report_interval(&self) -> u16;
}

impl<S: DeviceState + ?Sized> DeviceState for &mut S {
    fn apply_field(&mut self, key: &[u8], value: ConfigValue<'_>) -> bool {
        (**self).apply_field(key, value)
    }

    fn begin_update(&mut self) {
        (**self).begin_update()
    }

    fn report_interval(&self) -> u16 {
        (**self).report_interval()
    }
}

/// Settings of an RGB status lamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct LampState {
    /// Report interval in seconds.
    pub interval: u16,
    /// Red channel.
    pub red: u8,
    /// Green channel.
    pub green: u8,
    /// Blue channel.
    pub blue: u8,
    /// Whether the lamp should blink to attract attention.
    pub blink: bool,
}

impl Default for LampState {
    fn default() -> Self {
        Self {
            interval: LAMP_DEFAULT_INTERVAL_SECS,
            red: 0,
            green: 0,
            blue: 0,
            blink: false,
        }
    }
}

impl DeviceState for LampState {
    fn apply_field(&mut self, key: &[u8], value: ConfigValue<'_>) -> bool {
        let slot = match key {
            b"i" => return value.as_u16().map(|v| self.interval = v).is_some(),
            b"bf" => return value.as_flag().map(|v| self.blink = v).is_some(),
            b"r" => &mut self.red,
            b"g" => &mut self.green,
            b"b" => &mut self.blue,
            _ => return false,
        };
        value.as_u8().map(|v| *slot = v).is_some()
    }

    /// Every response is a complete colour command: channels it leaves out
    /// are off, and the blink fires only for the response that asks for it.
    fn begin_update(&mut self) {
        self.red = 0;
        self.green = 0;
        self.blue = 0;
        self.blink = false;
    }

    fn report_interval(&self) -> u16 {
        self.interval
    }
}

/// Measurement range of the light sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum Sensitivity {
    /// High gain, saturates around 375 lux.
    #[default]
    Lux375,
    /// Low gain, up to about 10k lux.
    Lux10k,
}

/// Settings of an ambient light sensor node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct LightSensorState {
    /// Report interval in seconds.
    pub interval: u16,
    /// Selected measurement range.
    pub sensitivity: Sensitivity,
    /// Infrared filter register value.
    pub ir_filter: u8,
}

impl Default for LightSensorState {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL_SECS,
            sensitivity: Sensitivity::Lux375,
            ir_filter: 0x20,
        }
    }
}

impl DeviceState for LightSensorState {
    fn apply_field(&mut self, key: &[u8], value: ConfigValue<'_>) -> bool {
        match key {
            b"i" => value.as_u16().map(|v| self.interval = v).is_some(),
            b"s" => value
                .as_flag()
                .map(|high| {
                    self.sensitivity = if high {
                        Sensitivity::Lux10k
                    } else {
                        Sensitivity::Lux375
                    }
                })
                .is_some(),
            b"ir" => value.as_u8().map(|v| self.ir_filter = v).is_some(),
            _ => false,
        }
    }

    fn report_interval(&self) -> u16 {
        self.interval
    }
}

/// Applies a verified payload to `state` and returns the number of fields
/// that took effect.
///
/// The payload is consumed. Never fails: a payload that does not rescan
/// applies nothing and leaves `state` untouched.
pub fn apply<S: DeviceState>(payload: VerifiedPayload, mut state: S) -> usize {
    let tokens = match scan::<MAX_PAYLOAD_TOKENS>(payload.payload()) {
        Ok(tokens) => tokens,
        Err(err) => {
            warn!("verified payload does not rescan: {}", err);
            return 0;
        }
    };
    state.begin_update();
    let mut applied = 0;
    for (key, value) in tokens.root().entries() {
        let name = core::str::from_utf8(key.bytes()).unwrap_or("?");
        if state.apply_field(key.bytes(), ConfigValue::new(value.kind(), value.bytes())) {
            debug!("applied {}", name);
            applied += 1;
        } else {
            warn!("ignored payload key {}", name);
        }
    }
    applied
}
