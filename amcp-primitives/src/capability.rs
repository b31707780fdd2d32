//! Capability tags advertised by agents to the registry.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const MAX_ID_LEN: usize = 64;

/// Tag naming a unit of work an agent can perform (e.g. `weather`,
/// `travel.booking`).
///
/// Tags double as topic segments in `task.<capability>.request` routes, so
/// the accepted alphabet matches the topic grammar.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityId(String);

impl CapabilityId {
    /// Creates a capability tag after validating its format.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCapability`] if the tag is empty, too long, or
    /// contains characters outside the topic alphabet.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::InvalidCapability {
                id,
                reason: "tag cannot be empty".into(),
            });
        }
        if id.len() > MAX_ID_LEN {
            return Err(Error::InvalidCapability {
                id,
                reason: format!("tag length must be <= {MAX_ID_LEN}"),
            });
        }
        let valid = id
            .split('.')
            .all(|seg| !seg.is_empty() && seg.chars().all(|c| matches!(c, 'a'..='z' | '0'..='9')));
        if !valid {
            return Err(Error::InvalidCapability {
                id,
                reason: "tag must be dot-separated lowercase alphanumeric segments".into(),
            });
        }
        Ok(Self(id))
    }

    /// Returns the tag as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<CapabilityId> for String {
    fn from(value: CapabilityId) -> Self {
        value.0
    }
}

impl Display for CapabilityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CapabilityId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_dotted_tags() {
        assert_eq!(CapabilityId::new("weather").unwrap().as_str(), "weather");
        assert!(CapabilityId::new("travel.booking").is_ok());
    }

    #[test]
    fn rejects_bad_tags() {
        assert!(CapabilityId::new("").is_err());
        assert!(CapabilityId::new("Weather").is_err());
        assert!(CapabilityId::new("a..b").is_err());
        assert!(CapabilityId::new("a b").is_err());
    }
}
