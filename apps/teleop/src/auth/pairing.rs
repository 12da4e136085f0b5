use super::error::BrokerError;
use std::fmt;

pub const PAIRING_CODE_LEN: usize = 6;

/// Normalised pairing code: trimmed, upper-case, exactly six characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PairingCode(String);

impl PairingCode {
    pub fn parse(raw: &str) -> Result<Self, BrokerError> {
        let normalized = raw.trim().to_uppercase();
        if normalized.chars().count() != PAIRING_CODE_LEN {
            return Err(BrokerError::InvalidFormat);
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PairingCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
