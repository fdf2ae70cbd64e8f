//! # fieldlink
//!
//! A portable, no_std core for battery-powered field nodes that report telemetry over a narrow
//! serial-modem link and take signed configuration updates in return, all within a few
//! kilobytes of RAM.
//!
//! The crate implements the signed telemetry envelope protocol and its memory-bounded JSON
//! pipeline:
//! - a signed outbound envelope built from typed readings
//! - a two-pass JSON token scanner that bounds memory before committing any
//! - signature verification gated by a live free-memory probe
//! - verified configuration applied to mutable device state
//!
//! ## Crate features
//! | Feature      | Description |
//! |--------------|-------------|
//! | `std`        | Builds against `std` instead of `#![no_std]` |
//! | `defmt-0-3`  | Uses `defmt` logging and derives `defmt::Format` for public types |
//! | `log`        | Uses `log` logging |
//!
//! ## Wire format
//!
//! Outbound:
//!
//! ```text
//! {"v":"0.0.1","a":"<base64 Hash(identity)>","s":"<base64 Hash(identity ‖ payload)>","p":{...}}
//! ```
//!
//! Inbound responses carry `v`, `s` and `p`; any other top-level keys are ignored. The
//! identity is the device's fixed 15 byte IMEI and the hash is SHA-512.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fieldlink::prelude::*;
//!
//! let identity = DeviceIdentity::try_from("123456789012345")?;
//! let mut node = TelemetryNode::new(
//!     NodeConfig::new("http://backend/report", identity),
//!     modem,
//!     Sha512Hash,
//!     HeapStackProbe::new(heap_top),
//!     LampState::default(),
//!     Some(status_led),
//! );
//! loop {
//!     let _ = report_once(&mut node, &mut delay, [Field::uint("lux", sensor.lux())]);
//! }
//! ```
//!
//! ## Modules
//!
//! - [`scanner`]: token scanner and cursor navigation
//! - [`envelope`]: payload serializer and envelope builder
//! - [`verify`]: memory-gated envelope verification
//! - [`config`]: configuration applier and shipped device states
//! - [`node`] and [`schedule`]: the telemetry cycle and its blocking driver loop
//! - [`memory`] and [`stack`]: free-memory probing and stack depth measurement
//!
//! --
//! Designed for `#![no_std]` use in resource-constrained embedded environments.

#![deny(
    bad_style,
    dead_code,
    improper_ctypes,
    non_shorthand_field_patterns,
    no_mangle_generic_items,
    overflowing_literals,
    path_statements,
    patterns_in_fns_without_body,
    unconditional_recursion,
    unused,
    while_true,
    missing_debug_implementations,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_results
)]
#![cfg_attr(not(any(test, feature = "std")), no_std)]

pub use heapless;

#[macro_use]
mod fmt;

pub mod config;
pub mod consts;
pub mod envelope;
pub mod error;
pub mod hash;
pub mod identity;
pub mod memory;
pub mod node;
pub mod scanner;
pub mod schedule;
pub mod stack;
pub mod transport;
pub mod verify;

/// The types most firmware needs, in one import.
pub mod prelude {
    pub use crate::config::{DeviceState, LampState, LightSensorState, Sensitivity};
    pub use crate::envelope::{Field, FieldValue};
    pub use crate::error::{CycleError, ErrorFlags};
    pub use crate::hash::{HashPrimitive, Sha512Hash};
    pub use crate::identity::DeviceIdentity;
    pub use crate::memory::{FixedBudget, HeapStackProbe, MemoryProbe};
    pub use crate::node::{NodeConfig, TelemetryNode};
    pub use crate::schedule::{report_once, run_report_loop, sleep_interval};
    pub use crate::transport::{PostStatus, Transport};
}
