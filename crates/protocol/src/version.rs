//! Protocol version management

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol version exchanged during the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

/// Current protocol version
pub const CURRENT_VERSION: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

impl ProtocolVersion {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Check if this version is compatible with another version
    pub fn is_compatible_with(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major && self.minor >= other.minor
    }

    /// Handshake payload form: `[major, minor]`
    pub fn to_bytes(self) -> [u8; 2] {
        [self.major, self.minor]
    }

    /// Parse a handshake payload. Trailing bytes are ignored.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        match bytes {
            [major, minor, ..] => Ok(Self::new(*major, *minor)),
            _ => Err(ProtocolError::InvalidVersionPayload(bytes.len())),
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Validate a peer's version against [`CURRENT_VERSION`].
///
/// Major versions must match; minor differences are allowed in both
/// directions.
pub fn validate_version(peer: &ProtocolVersion) -> Result<()> {
    if peer.major != CURRENT_VERSION.major {
        return Err(ProtocolError::IncompatibleVersion {
            major: peer.major,
            minor: peer.minor,
            expected_major: CURRENT_VERSION.major,
            expected_minor: CURRENT_VERSION.minor,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_compatibility() {
        let v1_0 = ProtocolVersion::new(1, 0);
        let v1_1 = ProtocolVersion::new(1, 1);
        let v2_0 = ProtocolVersion::new(2, 0);

        assert!(v1_1.is_compatible_with(&v1_0));
        assert!(!v1_0.is_compatible_with(&v1_1));
        assert!(!v2_0.is_compatible_with(&v1_0));
    }

    #[test]
    fn test_version_bytes() {
        let v = ProtocolVersion::from_bytes(&[1, 3, 0xFF]).unwrap();
        assert_eq!(v, ProtocolVersion::new(1, 3));
        assert_eq!(v.to_bytes(), [1, 3]);
        assert!(matches!(
            ProtocolVersion::from_bytes(&[1]),
            Err(ProtocolError::InvalidVersionPayload(1))
        ));
    }

    #[test]
    fn test_validate_version() {
        assert!(validate_version(&ProtocolVersion::new(1, 0)).is_ok());
        assert!(validate_version(&ProtocolVersion::new(1, 9)).is_ok());
        assert!(matches!(
            validate_version(&ProtocolVersion::new(2, 0)),
            Err(ProtocolError::IncompatibleVersion { .. })
        ));
    }
}
