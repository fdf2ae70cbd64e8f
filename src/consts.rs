//! Constants used across the envelope protocol implementation.
//!
//! This module defines protocol literals, JSON key names and the fixed
//! capacities that bound every buffer the crate uses.
//!
//! ## Key Concepts
//!
//! - **Identity prefix**: every signed message starts with the fixed-width
//!   device identity (the 15 digit modem IMEI).
//! - **Hash sizes**: the hash primitive produces 64 byte digests, carried on
//!   the wire as 88 characters of padded base64.
//! - **Capacities**: payload, envelope and response sizes are fixed so that
//!   the whole exchange fits in statically sized buffers.
//! - **Budget**: [`HASH_STACK_BYTES`] is the worst-case stack depth of the
//!   hash primitive as measured with [`crate::stack::profile_hash`].
//!
//! These values should be used wherever framing or buffer logic is
//! implemented to keep the builder and verifier in agreement.

/// Protocol version written into every outbound envelope.
pub const PROTOCOL_VERSION: &str = "0.0.1";

/// Minimum accepted protocol version of inbound responses.
///
/// An inbound `v` value is accepted when its first
/// `PROTOCOL_VERSION_MIN.len()` bytes equal this string.
pub const PROTOCOL_VERSION_MIN: &str = "0.0";

/// Envelope key holding the protocol version.
pub const KEY_VERSION: &str = "v";
/// Envelope key holding the base64 authentication tag.
pub const KEY_AUTH: &str = "a";
/// Envelope key holding the base64 payload signature.
pub const KEY_SIGNATURE: &str = "s";
/// Envelope key holding the payload object.
pub const KEY_PAYLOAD: &str = "p";

/// Payload key carrying the accumulated error flags of previous cycles.
pub const KEY_ERROR_FLAGS: &str = "e";
/// Payload key carrying the cycle counter since the last reset.
pub const KEY_LOOP_COUNTER: &str = "lp";

/// Length (in bytes) of the device identity prefix.
pub const IDENTITY_LEN: usize = 15;

/// Size (in bytes) of a digest produced by the hash primitive.
pub const HASH_BYTES: usize = 64;

/// Length of a digest encoded as padded standard base64.
pub const HASH_B64_LEN: usize = HASH_BYTES.div_ceil(3) * 4;

/// Scratch size used when decoding a base64 digest.
///
/// The decoder sizes its output conservatively from the input length, so
/// the scratch buffer holds the full three-bytes-per-quad estimate and the
/// decoded length is checked against [`HASH_BYTES`] afterwards.
pub const HASH_B64_DECODE_LEN: usize = HASH_B64_LEN / 4 * 3;

/// Worst-case stack depth (in bytes) of one hash invocation.
pub const HASH_STACK_BYTES: usize = 704;

/// Maximum size (in bytes) of a serialized outbound payload object.
pub const MAX_PAYLOAD_LEN: usize = 112;

/// Maximum number of decimal places accepted for fixed-point readings.
pub const MAX_DECIMALS: u8 = 6;

/// Maximum size (in bytes) of a complete outbound envelope.
///
/// Derived from the envelope template:
/// `{"v":"<version>","a":"<b64>","s":"<b64>","p":<payload>}`.
pub const MAX_ENVELOPE_LEN: usize = 6
    + PROTOCOL_VERSION.len()
    + 7
    + HASH_B64_LEN
    + 7
    + HASH_B64_LEN
    + 6
    + MAX_PAYLOAD_LEN
    + 1;

/// Maximum size (in bytes) of an inbound response body.
pub const MAX_RESPONSE_LEN: usize = 300;

/// Maximum size (in bytes) of a signed message (`identity ‖ payload`).
pub const MAX_SIGNED_LEN: usize = IDENTITY_LEN + MAX_RESPONSE_LEN;

/// Maximum number of tokens accepted in an inbound response.
pub const MAX_RESPONSE_TOKENS: usize = 32;

/// Maximum number of tokens accepted in a verified payload.
pub const MAX_PAYLOAD_TOKENS: usize = MAX_RESPONSE_TOKENS;

/// Maximum container nesting depth the scanner follows.
pub const MAX_NESTING: usize = 8;

/// Maximum number of bytes requested from the transport per chunk.
///
/// Software serial links drop bytes when asked for much more at once.
pub const READ_CHUNK_LEN: usize = 64;

/// The only HTTP status that carries a response worth reading.
pub const HTTP_OK: u16 = 200;

/// Default report interval (in seconds) of sensor nodes.
pub const DEFAULT_INTERVAL_SECS: u16 = 5 * 60;

/// Default report interval (in seconds) of lamp nodes.
pub const LAMP_DEFAULT_INTERVAL_SECS: u16 = 30 * 60;
