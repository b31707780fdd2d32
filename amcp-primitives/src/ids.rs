//! Agent and context identifier types.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

const MAX_NAME_LEN: usize = 96;
const MAX_CONTEXT_LEN: usize = 64;

fn validate_name_part(part: &str, what: &str) -> Result<()> {
    if part.is_empty() {
        return Err(Error::InvalidAgentId {
            reason: format!("{what} cannot be empty"),
        });
    }
    if part.len() > MAX_NAME_LEN {
        return Err(Error::InvalidAgentId {
            reason: format!("{what} length must be <= {MAX_NAME_LEN}"),
        });
    }
    if !part
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '-' | '_' | '.'))
    {
        return Err(Error::InvalidAgentId {
            reason: format!(
                "{what} must contain lowercase alphanumeric, dash, underscore, or dot"
            ),
        });
    }
    Ok(())
}

/// Unique identifier for an agent participating in the mesh.
///
/// Two agents are the same agent only when name, namespace, and instance all
/// match. A cloned agent keeps name and namespace but receives a fresh
/// instance.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct AgentId {
    name: String,
    namespace: String,
    instance: Uuid,
}

impl AgentId {
    /// Creates an identifier with a random instance UUID.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAgentId`] when name or namespace are empty,
    /// too long, or contain unsupported characters.
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let namespace = namespace.into();
        validate_name_part(&name, "agent name")?;
        validate_name_part(&namespace, "agent namespace")?;
        Ok(Self {
            name,
            namespace,
            instance: Uuid::new_v4(),
        })
    }

    /// Reconstructs an identifier from its parts, keeping the given instance.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAgentId`] when name or namespace fail
    /// validation.
    pub fn with_instance(
        name: impl Into<String>,
        namespace: impl Into<String>,
        instance: Uuid,
    ) -> Result<Self> {
        let name = name.into();
        let namespace = namespace.into();
        validate_name_part(&name, "agent name")?;
        validate_name_part(&namespace, "agent namespace")?;
        Ok(Self {
            name,
            namespace,
            instance,
        })
    }

    /// Returns the agent name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the agent namespace.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Returns the instance UUID distinguishing this agent from its clones.
    #[must_use]
    pub const fn instance(&self) -> Uuid {
        self.instance
    }

    /// Derives the identifier a clone of this agent receives: same name and
    /// namespace, fresh instance.
    #[must_use]
    pub fn clone_instance(&self) -> Self {
        Self {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            instance: Uuid::new_v4(),
        }
    }
}

impl Display for AgentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.namespace, self.name, self.instance)
    }
}

impl FromStr for AgentId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (namespace, rest) = s.split_once('/').ok_or_else(|| Error::InvalidAgentId {
            reason: "expected `namespace/name#instance`".into(),
        })?;
        let (name, instance) = rest.split_once('#').ok_or_else(|| Error::InvalidAgentId {
            reason: "expected `namespace/name#instance`".into(),
        })?;
        let instance = Uuid::parse_str(instance).map_err(|err| Error::InvalidAgentId {
            reason: format!("instance is not a uuid: {err}"),
        })?;
        Self::with_instance(name, namespace, instance)
    }
}

/// Identifier of a process-local agent context.
///
/// Context identifiers are restricted to a single lowercase alphanumeric
/// segment so they can be embedded into reserved topics such as
/// `system.mobility.<context>.ticket`.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(String);

impl ContextId {
    /// Creates a context identifier after validating its format.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidContextId`] when the identifier is empty, too
    /// long, or is not lowercase alphanumeric.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::InvalidContextId {
                id,
                reason: "identifier cannot be empty".into(),
            });
        }
        if id.len() > MAX_CONTEXT_LEN {
            return Err(Error::InvalidContextId {
                id,
                reason: format!("identifier length must be <= {MAX_CONTEXT_LEN}"),
            });
        }
        if !id.chars().all(|c| matches!(c, 'a'..='z' | '0'..='9')) {
            return Err(Error::InvalidContextId {
                id,
                reason: "identifier must be lowercase alphanumeric".into(),
            });
        }
        Ok(Self(id))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ContextId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContextId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}
