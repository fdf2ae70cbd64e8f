//! Inbound envelope verification.
//!
//! A response moves through a fixed sequence of [`VerifyStage`]s and is
//! rejected at the first stage it fails:
//!
//! 1. **Tokenized**: the body scans as a JSON object; `v` names a supported
//!    protocol version and no envelope key is repeated.
//! 2. **SignatureExtracted**: `s` decodes to exactly one digest.
//! 3. **PayloadExtracted**: `p` is present and is an object.
//! 4. **BudgetChecked**: the [memory probe](crate::memory::MemoryProbe)
//!    reports room for the [budget estimate](crate::memory::budget_estimate).
//!    The hash primitive is never invoked when this check fails.
//! 5. **Verified**: `Hash(identity ‖ payload)` equals the claimed signature,
//!    compared in constant time.
//!
//! Only a fully verified response yields a [`VerifiedPayload`], the sole
//! input the configuration applier accepts.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use heapless::Vec;
use subtle::ConstantTimeEq;

use crate::consts::{
    HASH_B64_DECODE_LEN, HASH_BYTES, IDENTITY_LEN, KEY_PAYLOAD, KEY_SIGNATURE, KEY_VERSION,
    MAX_RESPONSE_TOKENS, MAX_SIGNED_LEN, PROTOCOL_VERSION_MIN,
};
use crate::error::VerifyError;
use crate::hash::{Digest, HashPrimitive};
use crate::identity::DeviceIdentity;
use crate::memory::{MemoryProbe, budget_estimate};
use crate::scanner::{Cursor, TokenKind, scan};

/// The stages a response passes through on its way to acceptance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum VerifyStage {
    /// Bytes received, nothing checked yet.
    Received,
    /// Scanned, version accepted, envelope keys unique.
    Tokenized,
    /// Signature decoded.
    SignatureExtracted,
    /// Payload object located.
    PayloadExtracted,
    /// Enough free memory to hash the payload.
    BudgetChecked,
    /// Signature matched.
    Verified,
}

impl VerifyError {
    /// The stage the response was rejected in.
    pub fn stage(&self) -> VerifyStage {
        match self {
            VerifyError::Malformed(_)
            | VerifyError::DuplicateField
            | VerifyError::ProtocolMismatch => VerifyStage::Tokenized,
            VerifyError::SignatureDecodeError => VerifyStage::SignatureExtracted,
            VerifyError::MissingPayload => VerifyStage::PayloadExtracted,
            VerifyError::InsufficientMemory { .. } => VerifyStage::BudgetChecked,
            VerifyError::PayloadTooLarge { .. } | VerifyError::SignatureInvalid => {
                VerifyStage::Verified
            }
        }
    }
}

/// A payload whose signature has been checked against the device identity.
///
/// Owns the signed message `identity ‖ payload`. Only [`verify`] constructs
/// it.
#[derive(Debug, Clone)]
pub struct VerifiedPayload {
    message: Vec<u8, MAX_SIGNED_LEN>,
}

impl VerifiedPayload {
    /// The identity prefix of the signed message.
    pub fn identity(&self) -> &[u8] {
        &self.message[..IDENTITY_LEN]
    }

    /// The payload object text.
    pub fn payload(&self) -> &[u8] {
        &self.message[IDENTITY_LEN..]
    }

    /// The full signed message.
    pub fn message(&self) -> &[u8] {
        &self.message
    }
}

/// The three envelope fields the verifier reads.
struct EnvelopeFields<'s, 'a> {
    version: Option<Cursor<'s, 'a, MAX_RESPONSE_TOKENS>>,
    signature: Option<Cursor<'s, 'a, MAX_RESPONSE_TOKENS>>,
    payload: Option<Cursor<'s, 'a, MAX_RESPONSE_TOKENS>>,
}

impl<'s, 'a> EnvelopeFields<'s, 'a> {
    /// Collects `v`, `s` and `p` from the top level, refusing repeats.
    fn locate(root: Cursor<'s, 'a, MAX_RESPONSE_TOKENS>) -> Result<Self, VerifyError> {
        let mut fields = Self {
            version: None,
            signature: None,
            payload: None,
        };
        for (key, value) in root.entries() {
            let slot = if key.is_key(KEY_VERSION) {
                &mut fields.version
            } else if key.is_key(KEY_SIGNATURE) {
                &mut fields.signature
            } else if key.is_key(KEY_PAYLOAD) {
                &mut fields.payload
            } else {
                continue;
            };
            if slot.replace(value).is_some() {
                return Err(VerifyError::DuplicateField);
            }
        }
        Ok(fields)
    }
}

fn version_supported(version: &[u8]) -> bool {
    version.starts_with(PROTOCOL_VERSION_MIN.as_bytes())
}

fn decode_signature(encoded: &[u8]) -> Result<Digest, VerifyError> {
    let mut scratch = [0u8; HASH_B64_DECODE_LEN];
    let decoded = STANDARD
        .decode_slice(encoded, &mut scratch)
        .map_err(|_| VerifyError::SignatureDecodeError)?;
    if decoded != HASH_BYTES {
        return Err(VerifyError::SignatureDecodeError);
    }
    let mut digest = [0u8; HASH_BYTES];
    digest.copy_from_slice(&scratch[..HASH_BYTES]);
    Ok(digest)
}

/// Verifies an inbound response for `identity`.
///
/// No device state is touched; on success the caller receives the verified
/// payload to hand to the [configuration applier](crate::config::apply).
///
/// # Errors
/// - [`VerifyError::Malformed`] if the response does not scan
/// - [`VerifyError::DuplicateField`] if `v`, `s` or `p` is repeated
/// - [`VerifyError::ProtocolMismatch`] if `v` is missing or unsupported
/// - [`VerifyError::SignatureDecodeError`] if `s` is missing or not one digest
/// - [`VerifyError::MissingPayload`] if `p` is missing or not an object
/// - [`VerifyError::InsufficientMemory`] if the probe reports too little room
/// - [`VerifyError::PayloadTooLarge`] if `identity ‖ payload` does not fit
/// - [`VerifyError::SignatureInvalid`] if the signature does not match
pub fn verify<P, H>(
    response: &[u8],
    identity: &DeviceIdentity,
    probe: P,
    mut hasher: H,
) -> Result<VerifiedPayload, VerifyError>
where
    P: MemoryProbe,
    H: HashPrimitive,
{
    let tokens = scan::<MAX_RESPONSE_TOKENS>(response)?;
    trace!("response scanned, {} tokens", tokens.len());
    let fields = EnvelopeFields::locate(tokens.root())?;

    let version = fields
        .version
        .filter(|v| v.kind() == TokenKind::String)
        .ok_or(VerifyError::ProtocolMismatch)?;
    if !version_supported(version.bytes()) {
        return Err(VerifyError::ProtocolMismatch);
    }

    let signature = fields
        .signature
        .filter(|s| s.kind() == TokenKind::String)
        .ok_or(VerifyError::SignatureDecodeError)?;
    let claimed = decode_signature(signature.bytes())?;

    let payload = fields
        .payload
        .filter(|p| p.kind() == TokenKind::Object)
        .ok_or(VerifyError::MissingPayload)?
        .bytes();

    let needed = budget_estimate(payload.len());
    let available = probe.available_bytes();
    if needed > available {
        return Err(VerifyError::InsufficientMemory { needed, available });
    }

    let too_large = VerifyError::PayloadTooLarge {
        limit: MAX_SIGNED_LEN,
    };
    let mut message: Vec<u8, MAX_SIGNED_LEN> = Vec::new();
    message
        .extend_from_slice(identity.as_bytes())
        .map_err(|()| too_large)?;
    message.extend_from_slice(payload).map_err(|()| too_large)?;

    let computed = hasher.hash(&[message.as_slice()]);
    if !bool::from(computed[..].ct_eq(&claimed[..])) {
        return Err(VerifyError::SignatureInvalid);
    }

    trace!("response verified, payload {} bytes", payload.len());
    Ok(VerifiedPayload { message })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::{HASH_B64_LEN, MAX_RESPONSE_LEN};
    use crate::envelope::{Field, build_envelope};
    use crate::hash::Sha512Hash;
    use crate::memory::FixedBudget;
    use core::fmt::Write as _;
    use proptest::prelude::*;

    const LAMP_PAYLOAD: &str = r#"{"i":900,"r":1,"g":2,"b":1}"#;

    fn identity() -> DeviceIdentity {
        DeviceIdentity::try_from("123456789012345").unwrap()
    }

    /// Wraps the SHA-512 binding and counts invocations.
    #[derive(Default)]
    struct CountingHash {
        calls: usize,
    }

    impl HashPrimitive for CountingHash {
        fn hash(&mut self, parts: &[&[u8]]) -> Digest {
            self.calls += 1;
            Sha512Hash.hash(parts)
        }
    }

    fn sign(payload: &str) -> heapless::String<HASH_B64_LEN> {
        let digest = Sha512Hash.hash(&[identity().as_bytes(), payload.as_bytes()]);
        encode(&digest)
    }

    fn encode(digest: &[u8]) -> heapless::String<HASH_B64_LEN> {
        let mut out = [0u8; HASH_B64_LEN];
        let written = STANDARD.encode_slice(digest, &mut out).unwrap();
        let mut text = heapless::String::new();
        text.push_str(core::str::from_utf8(&out[..written]).unwrap())
            .unwrap();
        text
    }

    fn response(version: &str, signature: &str, payload: &str) -> heapless::String<MAX_RESPONSE_LEN> {
        let mut out = heapless::String::new();
        write!(out, r#"{{"v":"{version}","s":"{signature}","p":{payload}}}"#).unwrap();
        out
    }

    fn plenty() -> FixedBudget {
        FixedBudget(budget_estimate(MAX_RESPONSE_LEN))
    }

    #[test]
    fn test_accepts_signed_lamp_response() {
        let body = response("0.0.1", &sign(LAMP_PAYLOAD), LAMP_PAYLOAD);
        let verified = verify(body.as_bytes(), &identity(), plenty(), Sha512Hash).unwrap();
        assert_eq!(verified.identity(), b"123456789012345");
        assert_eq!(verified.payload(), LAMP_PAYLOAD.as_bytes());
        assert_eq!(verified.message().len(), IDENTITY_LEN + LAMP_PAYLOAD.len());
    }

    #[test]
    fn test_accepts_response_form_of_built_envelope() {
        let id = identity();
        let envelope = build_envelope(
            &id,
            [Field::uint("i", 900), Field::flag("bf", true)],
            Sha512Hash,
        )
        .unwrap();
        let body = envelope.response_form().unwrap();
        let verified = verify(&body, &id, plenty(), Sha512Hash).unwrap();
        assert_eq!(verified.payload(), envelope.payload().as_bytes());
    }

    #[test]
    fn test_rejects_other_identity() {
        let body = response("0.0.1", &sign(LAMP_PAYLOAD), LAMP_PAYLOAD);
        let other = DeviceIdentity::try_from("999999999999999").unwrap();
        assert_eq!(
            verify(body.as_bytes(), &other, plenty(), Sha512Hash).unwrap_err(),
            VerifyError::SignatureInvalid
        );
    }

    #[test]
    fn test_single_payload_byte_flip_is_rejected() {
        let signature = sign(LAMP_PAYLOAD);
        let payload = LAMP_PAYLOAD.replace("900", "901");
        let body = response("0.0.1", &signature, &payload);
        let err = verify(body.as_bytes(), &identity(), plenty(), Sha512Hash).unwrap_err();
        assert_eq!(err, VerifyError::SignatureInvalid);
        assert_eq!(err.stage(), VerifyStage::Verified);
    }

    proptest! {
        #[test]
        fn prop_signature_byte_flip_is_rejected(index in 0..HASH_BYTES, mask in 1..=255u8) {
            let mut digest = Sha512Hash.hash(&[identity().as_bytes(), LAMP_PAYLOAD.as_bytes()]);
            digest[index] ^= mask;
            let body = response("0.0.1", &encode(&digest), LAMP_PAYLOAD);
            prop_assert_eq!(
                verify(body.as_bytes(), &identity(), plenty(), Sha512Hash).unwrap_err(),
                VerifyError::SignatureInvalid
            );
        }

        #[test]
        fn prop_payload_byte_flip_is_rejected(index in 0..LAMP_PAYLOAD.len(), mask in 1..=255u8) {
            let body = response("0.0.1", &sign(LAMP_PAYLOAD), LAMP_PAYLOAD);
            let mut bytes = body.as_bytes().to_vec();
            let payload_start = bytes.len() - 1 - LAMP_PAYLOAD.len();
            bytes[payload_start + index] ^= mask;
            let err = verify(&bytes, &identity(), plenty(), Sha512Hash).unwrap_err();
            prop_assert!(
                matches!(
                    err,
                    VerifyError::SignatureInvalid
                        | VerifyError::Malformed(_)
                        | VerifyError::MissingPayload
                        | VerifyError::DuplicateField
                ),
                "unexpected error {:?}",
                err
            );
        }
    }

    #[test]
    fn test_budget_gate_never_hashes() {
        let body = response("0.0.1", &sign(LAMP_PAYLOAD), LAMP_PAYLOAD);
        let needed = budget_estimate(LAMP_PAYLOAD.len());

        let mut hasher = CountingHash::default();
        let err = verify(body.as_bytes(), &identity(), FixedBudget(needed - 1), &mut hasher)
            .unwrap_err();
        assert_eq!(
            err,
            VerifyError::InsufficientMemory {
                needed,
                available: needed - 1
            }
        );
        assert_eq!(err.stage(), VerifyStage::BudgetChecked);
        assert_eq!(hasher.calls, 0);

        let verified = verify(body.as_bytes(), &identity(), FixedBudget(needed), &mut hasher);
        assert!(verified.is_ok());
        assert_eq!(hasher.calls, 1);
    }

    #[test]
    fn test_version_gate() {
        let signature = sign(LAMP_PAYLOAD);
        for accepted in ["0.0", "0.0.1", "0.0.9-rc1"] {
            let body = response(accepted, &signature, LAMP_PAYLOAD);
            assert!(verify(body.as_bytes(), &identity(), plenty(), Sha512Hash).is_ok());
        }
        for rejected in ["0.1", "1.0.0", "0.", ""] {
            let body = response(rejected, &signature, LAMP_PAYLOAD);
            assert_eq!(
                verify(body.as_bytes(), &identity(), plenty(), Sha512Hash).unwrap_err(),
                VerifyError::ProtocolMismatch
            );
        }
    }

    #[test]
    fn test_version_must_be_a_string() {
        let mut body: heapless::String<MAX_RESPONSE_LEN> = heapless::String::new();
        write!(body, r#"{{"v":0.0,"s":"{}","p":{}}}"#, sign(LAMP_PAYLOAD), LAMP_PAYLOAD).unwrap();
        assert_eq!(
            verify(body.as_bytes(), &identity(), plenty(), Sha512Hash).unwrap_err(),
            VerifyError::ProtocolMismatch
        );
    }

    #[test]
    fn test_unknown_top_level_keys_are_ignored() {
        let mut body: heapless::String<MAX_RESPONSE_LEN> = heapless::String::new();
        write!(
            body,
            r#"{{"x":[1,{{"y":2}}],"v":"0.0.1","p":{},"t":"n","s":"{}"}}"#,
            LAMP_PAYLOAD,
            sign(LAMP_PAYLOAD)
        )
        .unwrap();
        let verified = verify(body.as_bytes(), &identity(), plenty(), Sha512Hash).unwrap();
        assert_eq!(verified.payload(), LAMP_PAYLOAD.as_bytes());
    }

    #[test]
    fn test_duplicate_envelope_key() {
        let mut body: heapless::String<MAX_RESPONSE_LEN> = heapless::String::new();
        write!(
            body,
            r#"{{"v":"0.0.1","s":"{}","p":{},"p":{{}}}}"#,
            sign(LAMP_PAYLOAD),
            LAMP_PAYLOAD
        )
        .unwrap();
        assert_eq!(
            verify(body.as_bytes(), &identity(), plenty(), Sha512Hash).unwrap_err(),
            VerifyError::DuplicateField
        );
    }

    #[test]
    fn test_signature_decode_errors() {
        let short = encode(&[0u8; 63]);
        let long = encode(&[0u8; 66]);
        for bad in ["", "not base64!", short.as_str(), long.as_str()] {
            let body = response("0.0.1", bad, LAMP_PAYLOAD);
            let err = verify(body.as_bytes(), &identity(), plenty(), Sha512Hash).unwrap_err();
            assert_eq!(err, VerifyError::SignatureDecodeError, "signature {bad:?}");
            assert_eq!(err.stage(), VerifyStage::SignatureExtracted);
        }

        let missing = r#"{"v":"0.0.1","p":{}}"#;
        assert_eq!(
            verify(missing.as_bytes(), &identity(), plenty(), Sha512Hash).unwrap_err(),
            VerifyError::SignatureDecodeError
        );
    }

    #[test]
    fn test_payload_must_be_an_object() {
        let signature = sign(LAMP_PAYLOAD);
        for payload in ["[1,2]", "\"p\"", "7"] {
            let body = response("0.0.1", &signature, payload);
            assert_eq!(
                verify(body.as_bytes(), &identity(), plenty(), Sha512Hash).unwrap_err(),
                VerifyError::MissingPayload
            );
        }
        let mut body: heapless::String<MAX_RESPONSE_LEN> = heapless::String::new();
        write!(body, r#"{{"v":"0.0.1","s":"{}"}}"#, signature).unwrap();
        let err = verify(body.as_bytes(), &identity(), plenty(), Sha512Hash).unwrap_err();
        assert_eq!(err, VerifyError::MissingPayload);
        assert_eq!(err.stage(), VerifyStage::PayloadExtracted);
    }

    #[test]
    fn test_malformed_response() {
        let mut hasher = CountingHash::default();
        for body in [&b"[]"[..], &b""[..], &b"{\"v\":\"0.0.1\""[..], &b"<html>"[..]] {
            let err = verify(body, &identity(), plenty(), &mut hasher).unwrap_err();
            assert!(matches!(err, VerifyError::Malformed(_)), "{err:?}");
            assert_eq!(err.stage(), VerifyStage::Tokenized);
        }
        assert_eq!(hasher.calls, 0);
    }

    #[test]
    fn test_stages_are_ordered() {
        assert!(VerifyStage::Received < VerifyStage::Tokenized);
        assert!(VerifyStage::BudgetChecked < VerifyStage::Verified);
        assert!(
            VerifyError::SignatureDecodeError.stage() < VerifyError::MissingPayload.stage()
        );
    }
}
