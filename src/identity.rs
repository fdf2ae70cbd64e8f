//! Fixed-width device identity.
//!
//! The identity doubles as the device key: it prefixes every signed message
//! in both directions. On the reference hardware it is the modem IMEI.

use crate::consts::IDENTITY_LEN;
use crate::error::IdentityError;

/// A validated, fixed-width device identity.
///
/// Always exactly [`IDENTITY_LEN`] bytes of printable ASCII.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DeviceIdentity([u8; IDENTITY_LEN]);

impl DeviceIdentity {
    /// Validates `raw` and copies it into a new identity.
    ///
    /// # Errors
    /// - [`IdentityError::WrongLength`] if `raw` is not [`IDENTITY_LEN`] bytes long
    /// - [`IdentityError::InvalidByte`] if any byte is outside printable ASCII
    pub fn new(raw: &[u8]) -> Result<Self, IdentityError> {
        if raw.len() != IDENTITY_LEN {
            return Err(IdentityError::WrongLength {
                expected: IDENTITY_LEN,
                found: raw.len(),
            });
        }
        if let Some(offset) = raw.iter().position(|b| !b.is_ascii_graphic()) {
            return Err(IdentityError::InvalidByte { offset });
        }
        let mut bytes = [0u8; IDENTITY_LEN];
        bytes.copy_from_slice(raw);
        Ok(Self(bytes))
    }

    /// The identity bytes, as they prefix a signed message.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The identity as text.
    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.0).unwrap_or("")
    }
}

impl TryFrom<&str> for DeviceIdentity {
    type Error = IdentityError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_imei() {
        let id = DeviceIdentity::try_from("123456789012345").unwrap();
        assert_eq!(id.as_bytes(), b"123456789012345");
        assert_eq!(id.as_str(), "123456789012345");
    }

    #[test]
    fn test_rejects_wrong_length() {
        assert_eq!(
            DeviceIdentity::new(b"12345"),
            Err(IdentityError::WrongLength {
                expected: IDENTITY_LEN,
                found: 5
            })
        );
    }

    #[test]
    fn test_rejects_unprintable_bytes() {
        assert_eq!(
            DeviceIdentity::new(b"1234567 9012345"),
            Err(IdentityError::InvalidByte { offset: 7 })
        );
    }
}
