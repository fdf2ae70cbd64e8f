//! One telemetry cycle: report, receive, verify, apply.
//!
//! [`TelemetryNode`] owns everything a field node needs for a cycle: the
//! transport, the hash primitive, the memory probe, the device state and an
//! optional status LED that is lit while the modem is busy.
//!
//! ## Cycle
//!
//! 1. Build a signed envelope from the caller's readings, followed by the
//!    accumulated error flags (`e`) and the loop counter (`lp`).
//! 2. Post it. Once the backend accepts it with status 200, the flags it
//!    carried are cleared.
//! 3. Read the response in chunks, verify it and apply it to the device
//!    state.
//!
//! Any failure ends the cycle early, sets a bit in the error flags and
//! leaves the device state untouched. The node simply tries again after
//! its next interval.
//!
//! ## Example
//!
//! ```rust,ignore
//! let config = NodeConfig::new("http://backend/report", identity);
//! let mut node = TelemetryNode::new(config, modem, Sha512Hash, probe, LampState::default(), Some(led));
//! loop {
//!     let _ = node.run_cycle([Field::fixed("t", read_temperature(), 1)]);
//!     sleep_interval(&mut delay, node.report_interval());
//! }
//! ```

use embedded_hal::digital::OutputPin;

use crate::config::{DeviceState, apply};
use crate::consts::{KEY_ERROR_FLAGS, KEY_LOOP_COUNTER};
use crate::envelope::{Field, build_envelope};
use crate::error::{CycleError, ErrorFlags};
use crate::hash::HashPrimitive;
use crate::identity::DeviceIdentity;
use crate::memory::MemoryProbe;
use crate::transport::{Transport, post_envelope, read_response};
use crate::verify::verify;

/// Run-time configuration of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeConfig {
    /// Backend endpoint reports are posted to.
    pub url: &'static str,
    /// Identity prefixing every signed message.
    pub identity: DeviceIdentity,
}

impl NodeConfig {
    /// Creates a configuration for `identity` reporting to `url`.
    pub const fn new(url: &'static str, identity: DeviceIdentity) -> Self {
        Self { url, identity }
    }
}

/// A field node running the signed telemetry cycle.
///
/// ## Type Parameters
///
/// - `T`: the modem [`Transport`]
/// - `H`: the [`HashPrimitive`] signing and verifying messages
/// - `P`: the [`MemoryProbe`] gating verification
/// - `S`: the [`DeviceState`] the backend configures
/// - `LED`: an [`OutputPin`] driving the status LED
#[derive(Debug)]
pub struct TelemetryNode<T, H, P, S, LED>
where
    T: Transport,
    H: HashPrimitive,
    P: MemoryProbe,
    S: DeviceState,
    LED: OutputPin,
{
    transport: T,
    hasher: H,
    probe: P,
    state: S,
    /// Status LED, lit for the duration of a cycle.
    pub status_led: Option<LED>,
    config: NodeConfig,
    error_flags: ErrorFlags,
    loop_counter: u16,
}

impl<T, H, P, S, LED> TelemetryNode<T, H, P, S, LED>
where
    T: Transport,
    H: HashPrimitive,
    P: MemoryProbe,
    S: DeviceState,
    LED: OutputPin,
{
    /// Creates a node and switches the status LED off.
    pub fn new(
        config: NodeConfig,
        transport: T,
        hasher: H,
        probe: P,
        state: S,
        status_led: Option<LED>,
    ) -> Self {
        let mut node = Self {
            transport,
            hasher,
            probe,
            state,
            status_led,
            config,
            error_flags: ErrorFlags::empty(),
            loop_counter: 0,
        };
        node.set_led(false);
        node
    }

    fn set_led(&mut self, on: bool) {
        if let Some(led) = self.status_led.as_mut() {
            let _ = if on { led.set_high() } else { led.set_low() };
        }
    }

    /// Runs one cycle reporting `readings` and returns the number of
    /// configuration fields applied.
    ///
    /// # Errors
    /// The first failure of the cycle. It has already been recorded in
    /// [`error_flags`](Self::error_flags) and logged.
    pub fn run_cycle<'f, I>(&mut self, readings: I) -> Result<usize, CycleError>
    where
        I: IntoIterator<Item = Field<'f>>,
    {
        self.set_led(true);
        let result = self.exchange(readings);
        match &result {
            Ok(applied) => info!("cycle {}: {} fields applied", self.loop_counter, applied),
            Err(err) => {
                self.error_flags |= ErrorFlags::from(err);
                warn!("cycle {} failed: {}", self.loop_counter, err);
            }
        }
        self.set_led(false);
        self.loop_counter = self.loop_counter.wrapping_add(1);
        result
    }

    fn exchange<'f, I>(&mut self, readings: I) -> Result<usize, CycleError>
    where
        I: IntoIterator<Item = Field<'f>>,
    {
        let reported = self.error_flags;
        let trailer = [
            Field::uint(KEY_ERROR_FLAGS, u32::from(reported.bits())),
            Field::uint(KEY_LOOP_COUNTER, u32::from(self.loop_counter)),
        ];
        let length = {
            let envelope = build_envelope(
                &self.config.identity,
                readings.into_iter().chain(trailer),
                &mut self.hasher,
            )?;
            post_envelope(&mut self.transport, self.config.url, envelope.as_bytes())?
        };
        self.error_flags.remove(reported);

        let verified = {
            let response = read_response(&mut self.transport, length)?;
            verify(&response, &self.config.identity, &self.probe, &mut self.hasher)?
        };
        Ok(apply(verified, &mut self.state))
    }

    /// Failures recorded since the last accepted report.
    pub fn error_flags(&self) -> ErrorFlags {
        self.error_flags
    }

    /// Cycles run since start-up, wrapping.
    pub fn loop_counter(&self) -> u16 {
        self.loop_counter
    }

    /// Seconds to sleep before the next cycle, as configured by the backend.
    pub fn report_interval(&self) -> u16 {
        self.state.report_interval()
    }

    /// The current device state.
    pub fn state(&self) -> &S {
        &self.state
    }

    /// The node's configuration.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Consumes the node, returning the transport and device state.
    pub fn release(self) -> (T, S) {
        (self.transport, self.state)
    }
}
