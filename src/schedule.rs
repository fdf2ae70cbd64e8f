//! Blocking report scheduling.
//!
//! A field node spends almost all of its life asleep. These helpers drive
//! [`TelemetryNode`] cycles from a [`DelayNs`] provider, sleeping for the
//! interval the backend configured after every cycle. Entering a real
//! low-power mode is up to the delay implementation.

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;

use crate::config::DeviceState;
use crate::envelope::Field;
use crate::error::CycleError;
use crate::hash::HashPrimitive;
use crate::memory::MemoryProbe;
use crate::node::TelemetryNode;
use crate::transport::Transport;

/// Sleeps for `secs` seconds.
pub fn sleep_interval<D: DelayNs>(delay: &mut D, secs: u16) {
    delay.delay_ms(u32::from(secs) * 1_000);
}

/// Runs one cycle reporting `readings`, then sleeps for the node's report
/// interval.
///
/// The interval is read after the cycle, so a new interval configured by
/// the backend takes effect immediately.
///
/// # Errors
/// The cycle's failure, after the sleep has completed.
pub fn report_once<'f, D, I, T, H, P, S, LED>(
    node: &mut TelemetryNode<T, H, P, S, LED>,
    delay: &mut D,
    readings: I,
) -> Result<usize, CycleError>
where
    D: DelayNs,
    I: IntoIterator<Item = Field<'f>>,
    T: Transport,
    H: HashPrimitive,
    P: MemoryProbe,
    S: DeviceState,
    LED: OutputPin,
{
    let result = node.run_cycle(readings);
    sleep_interval(delay, node.report_interval());
    result
}

/// Runs a blocking report loop that never returns.
///
/// `take_readings` is called at the start of every cycle and hands the
/// fresh sensor readings to the provided callback, which runs the cycle.
///
/// # Example
/// ```rust,ignore
/// run_report_loop(&mut node, &mut delay, |report| {
///     let lux = sensor.read_lux();
///     report(&[Field::uint("lux", lux)]);
/// });
/// ```
///
/// # Notes
/// - Failed cycles are already recorded in the node's error flags and are
///   reported with the next envelope; the loop just carries on.
pub fn run_report_loop<D, T, H, P, S, LED, F>(
    node: &mut TelemetryNode<T, H, P, S, LED>,
    delay: &mut D,
    mut take_readings: F,
) -> !
where
    D: DelayNs,
    T: Transport,
    H: HashPrimitive,
    P: MemoryProbe,
    S: DeviceState,
    LED: OutputPin,
    F: FnMut(&mut dyn FnMut(&[Field<'_>])),
{
    loop {
        take_readings(&mut |readings: &[Field<'_>]| {
            let _ = node.run_cycle(readings.iter().copied());
        });
        sleep_interval(delay, node.report_interval());
    }
}
