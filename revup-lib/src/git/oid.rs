use std::fmt::{self, Display};
use std::str::FromStr;

use thiserror::Error;

const OID_HEX_LEN: usize = 40;

/// Number of hex characters used when abbreviating an OID for display.
pub const SHORT_OID_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum ParseOidError {
    #[error("OID was not {OID_HEX_LEN} hex characters: {0:?}")]
    Invalid(String),

    #[error("OID was the zero OID, which is not valid here")]
    Zero,
}

fn parse_hex(s: &str) -> Option<[u8; 20]> {
    if s.len() != OID_HEX_LEN || !s.is_ascii() {
        return None;
    }
    let mut bytes = [0u8; 20];
    for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
        let high = char::from(chunk[0]).to_digit(16)?;
        let low = char::from(chunk[1]).to_digit(16)?;
        bytes[i] = u8::try_from(high * 16 + low).expect("Hex byte out of range");
    }
    Some(bytes)
}

/// A Git object ID which is not the all-zeros OID.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NonZeroOid {
    bytes: [u8; 20],
}

impl NonZeroOid {
    /// Render the full 40-character hex form.
    pub fn to_hex(&self) -> String {
        self.bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Render an abbreviated hex form suitable for display.
    pub fn to_short_hex(&self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(SHORT_OID_LEN);
        hex
    }
}

impl Display for NonZeroOid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for NonZeroOid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NonZeroOid({})", self.to_hex())
    }
}

impl FromStr for NonZeroOid {
    type Err = ParseOidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match MaybeZeroOid::from_str(s)? {
            MaybeZeroOid::Zero => Err(ParseOidError::Zero),
            MaybeZeroOid::NonZero(oid) => Ok(oid),
        }
    }
}

/// An OID which may be the all-zeros OID, as used by git to indicate an
/// absent object (e.g. an unborn ref in `update-ref` or a `push` lease for a
/// branch which must not yet exist).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaybeZeroOid {
    /// The all-zeros OID.
    Zero,

    /// A regular OID.
    NonZero(NonZeroOid),
}

impl Display for MaybeZeroOid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaybeZeroOid::Zero => write!(f, "{}", "0".repeat(OID_HEX_LEN)),
            MaybeZeroOid::NonZero(oid) => write!(f, "{oid}"),
        }
    }
}

impl fmt::Debug for MaybeZeroOid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MaybeZeroOid({self})")
    }
}

impl FromStr for MaybeZeroOid {
    type Err = ParseOidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match parse_hex(s) {
            None => Err(ParseOidError::Invalid(s.to_owned())),
            Some(bytes) if bytes == [0u8; 20] => Ok(MaybeZeroOid::Zero),
            Some(bytes) => Ok(MaybeZeroOid::NonZero(NonZeroOid { bytes })),
        }
    }
}

impl From<NonZeroOid> for MaybeZeroOid {
    fn from(oid: NonZeroOid) -> Self {
        MaybeZeroOid::NonZero(oid)
    }
}

impl TryFrom<MaybeZeroOid> for NonZeroOid {
    type Error = ParseOidError;

    fn try_from(oid: MaybeZeroOid) -> Result<Self, Self::Error> {
        match oid {
            MaybeZeroOid::Zero => Err(ParseOidError::Zero),
            MaybeZeroOid::NonZero(oid) => Ok(oid),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::{MaybeZeroOid, NonZeroOid};

    #[test]
    fn test_oid_round_trip() {
        let hex = "91a7b04cb12d2ddfd0b74ab833a34ef9c46bcff8";
        let oid = NonZeroOid::from_str(hex).unwrap();
        assert_eq!(oid.to_hex(), hex);
        assert_eq!(oid.to_short_hex(), "91a7b04c");
    }

    #[test]
    fn test_zero_oid() {
        let zero = "0".repeat(40);
        assert!(NonZeroOid::from_str(&zero).is_err());
        assert_eq!(MaybeZeroOid::from_str(&zero).unwrap(), MaybeZeroOid::Zero);
        assert_eq!(MaybeZeroOid::Zero.to_string(), zero);
    }

    #[test]
    fn test_invalid_oid() {
        assert!(NonZeroOid::from_str("not-an-oid").is_err());
        assert!(NonZeroOid::from_str("abc123").is_err());
    }
}
