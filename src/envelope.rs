//! Outbound payload serialization and signed envelope assembly.
//!
//! A report is a flat list of [`Field`]s. The builder serializes them into a
//! compact JSON object, signs `identity ‖ payload` and `identity` with the
//! hash primitive, and wraps everything in the envelope the backend expects:
//!
//! ```text
//! {"v":"0.0.1","a":"<base64 auth tag>","s":"<base64 signature>","p":{...}}
//! ```
//!
//! Every intermediate buffer has a fixed capacity. Running out of room is an
//! error ([`BuildError::BufferTooSmall`]); output is never silently cut.

use core::fmt::Write as _;
use core::ops::Range;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use heapless::{String, Vec};

use crate::consts::{
    HASH_B64_LEN, KEY_AUTH, KEY_PAYLOAD, KEY_SIGNATURE, KEY_VERSION, MAX_DECIMALS,
    MAX_ENVELOPE_LEN, MAX_PAYLOAD_LEN, PROTOCOL_VERSION,
};
use crate::error::BuildError;
use crate::hash::{Digest, HashPrimitive};
use crate::identity::DeviceIdentity;

/// Largest scaled magnitude a fixed-point reading may reach before
/// formatting. Keeps the conversion to an integer exact.
const FIXED_LIMIT: f64 = 1e15;

/// A value carried in the outbound payload.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum FieldValue<'a> {
    /// Unsigned integer, written in decimal.
    Uint(u32),
    /// Signed integer, written in decimal.
    Int(i32),
    /// Boolean flag, written as a single digit `0` or `1`.
    Flag(bool),
    /// Decimal reading rounded to `decimals` places.
    Fixed {
        /// The raw reading.
        value: f32,
        /// Digits after the decimal point, at most [`MAX_DECIMALS`].
        decimals: u8,
    },
    /// Free text, written as an escaped JSON string.
    Text(&'a str),
}

/// One `key: value` pair of the outbound payload.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct Field<'a> {
    /// The payload key, written verbatim.
    pub key: &'a str,
    /// The value written under `key`.
    pub value: FieldValue<'a>,
}

impl<'a> Field<'a> {
    /// An unsigned integer field.
    pub const fn uint(key: &'a str, value: u32) -> Self {
        Self {
            key,
            value: FieldValue::Uint(value),
        }
    }

    /// A signed integer field.
    pub const fn int(key: &'a str, value: i32) -> Self {
        Self {
            key,
            value: FieldValue::Int(value),
        }
    }

    /// A flag field.
    pub const fn flag(key: &'a str, value: bool) -> Self {
        Self {
            key,
            value: FieldValue::Flag(value),
        }
    }

    /// A fixed-point field with `decimals` places.
    pub const fn fixed(key: &'a str, value: f32, decimals: u8) -> Self {
        Self {
            key,
            value: FieldValue::Fixed { value, decimals },
        }
    }

    /// A text field.
    pub const fn text(key: &'a str, value: &'a str) -> Self {
        Self {
            key,
            value: FieldValue::Text(value),
        }
    }
}

fn is_plain_key(key: &str) -> bool {
    !key.bytes().any(|b| b == b'"' || b == b'\\' || b < 0x20)
}

fn write_fixed<W: core::fmt::Write>(
    out: &mut W,
    value: f32,
    decimals: u8,
) -> Result<(), BuildError> {
    if decimals > MAX_DECIMALS {
        return Err(BuildError::TooManyDecimals(decimals));
    }
    let scale = 10u64.pow(u32::from(decimals));
    let scaled = libm::round(f64::from(value) * scale as f64);
    if !scaled.is_finite() || libm::fabs(scaled) >= FIXED_LIMIT {
        return Err(BuildError::NonFinite);
    }
    let sign = if scaled < 0.0 { "-" } else { "" };
    let units = libm::fabs(scaled) as u64;
    let whole = units / scale;
    let frac = units % scale;
    let width = usize::from(decimals);
    let written = if width == 0 {
        write!(out, "{sign}{whole}")
    } else {
        write!(out, "{sign}{whole}.{frac:0width$}")
    };
    written.map_err(|_| BuildError::BufferTooSmall)
}

fn write_text<W: core::fmt::Write>(out: &mut W, text: &str) -> core::fmt::Result {
    out.write_char('"')?;
    for c in text.chars() {
        match c {
            '"' => out.write_str("\\\"")?,
            '\\' => out.write_str("\\\\")?,
            c if u32::from(c) < 0x20 => write!(out, "\\u{:04x}", u32::from(c))?,
            c => out.write_char(c)?,
        }
    }
    out.write_char('"')
}

fn write_value<W: core::fmt::Write>(out: &mut W, value: &FieldValue<'_>) -> Result<(), BuildError> {
    match *value {
        FieldValue::Uint(v) => write!(out, "{v}").map_err(|_| BuildError::BufferTooSmall),
        FieldValue::Int(v) => write!(out, "{v}").map_err(|_| BuildError::BufferTooSmall),
        FieldValue::Flag(v) => {
            write!(out, "{}", u8::from(v)).map_err(|_| BuildError::BufferTooSmall)
        }
        FieldValue::Fixed { value, decimals } => write_fixed(out, value, decimals),
        FieldValue::Text(text) => write_text(out, text).map_err(|_| BuildError::BufferTooSmall),
    }
}

/// Serializes `fields` into a compact JSON object, in iteration order.
///
/// # Errors
/// - [`BuildError::InvalidKey`] if a key contains a quote, backslash or control byte
/// - [`BuildError::NonFinite`] or [`BuildError::TooManyDecimals`] for
///   unrepresentable fixed-point readings
/// - [`BuildError::BufferTooSmall`] if the object exceeds [`MAX_PAYLOAD_LEN`]
pub fn serialize_payload<'f, I>(fields: I) -> Result<String<MAX_PAYLOAD_LEN>, BuildError>
where
    I: IntoIterator<Item = Field<'f>>,
{
    let mut out: String<MAX_PAYLOAD_LEN> = String::new();
    out.push('{').map_err(|_| BuildError::BufferTooSmall)?;
    for (n, field) in fields.into_iter().enumerate() {
        if !is_plain_key(field.key) {
            return Err(BuildError::InvalidKey);
        }
        if n > 0 {
            out.push(',').map_err(|_| BuildError::BufferTooSmall)?;
        }
        write!(out, "\"{}\":", field.key).map_err(|_| BuildError::BufferTooSmall)?;
        write_value(&mut out, &field.value)?;
    }
    out.push('}').map_err(|_| BuildError::BufferTooSmall)?;
    Ok(out)
}

/// A signed outbound envelope, ready to post.
#[derive(Debug, Clone)]
pub struct Envelope {
    body: String<MAX_ENVELOPE_LEN>,
    auth: Range<usize>,
    signature: Range<usize>,
    payload: Range<usize>,
}

impl Envelope {
    /// The complete envelope text.
    pub fn as_str(&self) -> &str {
        &self.body
    }

    /// The complete envelope as bytes, as handed to the transport.
    pub fn as_bytes(&self) -> &[u8] {
        self.body.as_bytes()
    }

    /// Length of the envelope in bytes.
    pub fn len(&self) -> usize {
        self.body.len()
    }

    /// Whether the envelope is empty. Never true for a built envelope.
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// The serialized payload object.
    pub fn payload(&self) -> &str {
        self.body.get(self.payload.clone()).unwrap_or("")
    }

    /// Base64 of `Hash(identity ‖ payload)`.
    pub fn signature(&self) -> &str {
        self.body.get(self.signature.clone()).unwrap_or("")
    }

    /// Base64 of `Hash(identity)`.
    pub fn auth_tag(&self) -> &str {
        self.body.get(self.auth.clone()).unwrap_or("")
    }

    /// Renders the envelope the way the backend answers: version, signature
    /// and payload, without the authentication tag.
    ///
    /// # Errors
    /// [`BuildError::BufferTooSmall`] if the rendering does not fit.
    pub fn response_form(&self) -> Result<Vec<u8, MAX_ENVELOPE_LEN>, BuildError> {
        let mut out: Vec<u8, MAX_ENVELOPE_LEN> = Vec::new();
        for part in [
            "{\"",
            KEY_VERSION,
            "\":\"",
            PROTOCOL_VERSION,
            "\",\"",
            KEY_SIGNATURE,
            "\":\"",
            self.signature(),
            "\",\"",
            KEY_PAYLOAD,
            "\":",
            self.payload(),
            "}",
        ] {
            out.extend_from_slice(part.as_bytes())
                .map_err(|_| BuildError::BufferTooSmall)?;
        }
        Ok(out)
    }
}

/// Appends `text` and returns the range it occupies.
fn append(body: &mut String<MAX_ENVELOPE_LEN>, text: &str) -> Result<Range<usize>, BuildError> {
    let start = body.len();
    body.push_str(text).map_err(|_| BuildError::BufferTooSmall)?;
    Ok(start..body.len())
}

/// Encodes `digest` as padded standard base64 into `out`.
fn encode_digest<'o>(
    digest: &Digest,
    out: &'o mut [u8; HASH_B64_LEN],
) -> Result<&'o str, BuildError> {
    let written = STANDARD
        .encode_slice(digest, &mut out[..])
        .map_err(|_| BuildError::BufferTooSmall)?;
    core::str::from_utf8(&out[..written]).map_err(|_| BuildError::BufferTooSmall)
}

/// Builds a signed envelope reporting `fields` for `identity`.
///
/// The payload is serialized first; the signature covers
/// `identity ‖ payload` and the authentication tag covers `identity` alone.
///
/// # Errors
/// Everything [`serialize_payload`] rejects, and
/// [`BuildError::BufferTooSmall`] if the envelope exceeds [`MAX_ENVELOPE_LEN`].
pub fn build_envelope<'f, H, I>(
    identity: &DeviceIdentity,
    fields: I,
    mut hasher: H,
) -> Result<Envelope, BuildError>
where
    H: HashPrimitive,
    I: IntoIterator<Item = Field<'f>>,
{
    let payload = serialize_payload(fields)?;

    let signature = hasher.hash(&[identity.as_bytes(), payload.as_bytes()]);
    let auth = hasher.hash(&[identity.as_bytes()]);
    let mut signature_b64 = [0u8; HASH_B64_LEN];
    let mut auth_b64 = [0u8; HASH_B64_LEN];
    let signature_b64 = encode_digest(&signature, &mut signature_b64)?;
    let auth_b64 = encode_digest(&auth, &mut auth_b64)?;

    let mut body: String<MAX_ENVELOPE_LEN> = String::new();
    let _ = append(&mut body, "{\"")?;
    let _ = append(&mut body, KEY_VERSION)?;
    let _ = append(&mut body, "\":\"")?;
    let _ = append(&mut body, PROTOCOL_VERSION)?;
    let _ = append(&mut body, "\",\"")?;
    let _ = append(&mut body, KEY_AUTH)?;
    let _ = append(&mut body, "\":\"")?;
    let auth = append(&mut body, auth_b64)?;
    let _ = append(&mut body, "\",\"")?;
    let _ = append(&mut body, KEY_SIGNATURE)?;
    let _ = append(&mut body, "\":\"")?;
    let signature = append(&mut body, signature_b64)?;
    let _ = append(&mut body, "\",\"")?;
    let _ = append(&mut body, KEY_PAYLOAD)?;
    let _ = append(&mut body, "\":")?;
    let payload = append(&mut body, &payload)?;
    let _ = append(&mut body, "}")?;

    trace!("envelope built, {} bytes", body.len());
    Ok(Envelope {
        body,
        auth,
        signature,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::{HASH_B64_DECODE_LEN, HASH_BYTES};
    use crate::hash::Sha512Hash;
    use crate::scanner::{TokenKind, scan};

    fn identity() -> DeviceIdentity {
        DeviceIdentity::try_from("123456789012345").unwrap()
    }

    fn decode(b64: &str) -> Digest {
        let mut out = [0u8; HASH_B64_DECODE_LEN];
        let written = STANDARD.decode_slice(b64, &mut out).unwrap();
        assert_eq!(written, HASH_BYTES);
        out[..HASH_BYTES].try_into().unwrap()
    }

    #[test]
    fn test_serialize_lamp_payload() {
        let payload = serialize_payload([
            Field::uint("i", 900),
            Field::uint("r", 1),
            Field::uint("g", 2),
            Field::uint("b", 1),
        ])
        .unwrap();
        assert_eq!(payload.as_str(), r#"{"i":900,"r":1,"g":2,"b":1}"#);
    }

    #[test]
    fn test_serialize_empty_payload() {
        let payload = serialize_payload(core::iter::empty()).unwrap();
        assert_eq!(payload.as_str(), "{}");
    }

    #[test]
    fn test_value_formats() {
        let payload = serialize_payload([
            Field::int("t", -12),
            Field::flag("on", true),
            Field::flag("off", false),
            Field::fixed("h", 21.456, 2),
            Field::fixed("d", -0.5, 1),
            Field::fixed("w", 3.0, 0),
            Field::fixed("z", -0.001, 2),
        ])
        .unwrap();
        assert_eq!(
            payload.as_str(),
            r#"{"t":-12,"on":1,"off":0,"h":21.46,"d":-0.5,"w":3,"z":0.00}"#
        );
    }

    #[test]
    fn test_text_is_escaped() {
        let payload = serialize_payload([Field::text("m", "a\"b\\c\n")]).unwrap();
        assert_eq!(payload.as_str(), r#"{"m":"a\"b\\c\u000a"}"#);
        assert!(scan::<4>(payload.as_bytes()).is_ok());
    }

    #[test]
    fn test_rejected_fields() {
        assert_eq!(
            serialize_payload([Field::uint("a\"b", 1)]),
            Err(BuildError::InvalidKey)
        );
        assert_eq!(
            serialize_payload([Field::fixed("x", f32::NAN, 1)]),
            Err(BuildError::NonFinite)
        );
        assert_eq!(
            serialize_payload([Field::fixed("x", f32::INFINITY, 1)]),
            Err(BuildError::NonFinite)
        );
        assert_eq!(
            serialize_payload([Field::fixed("x", 1.0, 7)]),
            Err(BuildError::TooManyDecimals(7))
        );
    }

    #[test]
    fn test_payload_overflow_is_an_error() {
        let long = "x".repeat(MAX_PAYLOAD_LEN);
        assert_eq!(
            serialize_payload([Field::text("m", &long)]),
            Err(BuildError::BufferTooSmall)
        );
        let fields = (0..40).map(|_| Field::uint("k", 4_000_000_000));
        assert_eq!(serialize_payload(fields), Err(BuildError::BufferTooSmall));
    }

    #[test]
    fn test_build_envelope_signs_identity_and_payload() {
        let id = identity();
        let envelope = build_envelope(&id, [Field::uint("lux", 420)], Sha512Hash).unwrap();

        assert_eq!(envelope.payload(), r#"{"lux":420}"#);
        assert_eq!(envelope.signature().len(), HASH_B64_LEN);
        assert_eq!(envelope.auth_tag().len(), HASH_B64_LEN);

        let expected_sig = Sha512Hash.hash(&[id.as_bytes(), &b"{\"lux\":420}"[..]]);
        assert_eq!(decode(envelope.signature()), expected_sig);
        let expected_auth = Sha512Hash.hash(&[id.as_bytes()]);
        assert_eq!(decode(envelope.auth_tag()), expected_auth);

        let prefix = "{\"v\":\"0.0.1\",\"a\":\"";
        assert!(envelope.as_str().starts_with(prefix));
        assert!(envelope.as_str().ends_with(",\"p\":{\"lux\":420}}"));
        assert_eq!(envelope.len(), envelope.as_bytes().len());
    }

    #[test]
    fn test_envelope_is_well_formed_json() {
        let envelope = build_envelope(
            &identity(),
            [Field::uint("i", 900), Field::text("fw", "1.2")],
            Sha512Hash,
        )
        .unwrap();
        let tokens = scan::<16>(envelope.as_bytes()).unwrap();
        let root = tokens.root();
        assert_eq!(root.token().children, 4);
        assert_eq!(root.get("v").unwrap().bytes(), PROTOCOL_VERSION.as_bytes());
        assert_eq!(root.get("a").unwrap().bytes(), envelope.auth_tag().as_bytes());
        assert_eq!(root.get("p").unwrap().kind(), TokenKind::Object);
        assert_eq!(root.get("p").unwrap().bytes(), envelope.payload().as_bytes());
    }

    #[test]
    fn test_response_form_drops_auth_tag() {
        let envelope = build_envelope(&identity(), [Field::uint("i", 1)], Sha512Hash).unwrap();
        let response = envelope.response_form().unwrap();
        let tokens = scan::<16>(&response).unwrap();
        let root = tokens.root();
        assert_eq!(root.token().children, 3);
        assert!(root.get("a").is_none());
        assert_eq!(root.get("s").unwrap().bytes(), envelope.signature().as_bytes());
        assert_eq!(root.get("p").unwrap().bytes(), b"{\"i\":1}");
    }

    #[test]
    fn test_largest_payload_fits_envelope() {
        let text = "y".repeat(MAX_PAYLOAD_LEN - 8);
        let envelope = build_envelope(&identity(), [Field::text("m", &text)], Sha512Hash).unwrap();
        assert_eq!(envelope.payload().len(), MAX_PAYLOAD_LEN);
        assert_eq!(envelope.len(), MAX_ENVELOPE_LEN);
    }
}
