//! `<domain>.<name>` identifiers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EntityIdError {
    #[error("'{0}' is not of the form <domain>.<name>")]
    InvalidFormat(String),

    #[error("empty domain")]
    EmptyDomain,

    #[error("empty name")]
    EmptyName,

    #[error("bad domain '{0}': use a-z, 0-9 and single inner underscores")]
    InvalidDomainChars(String),

    #[error("bad name '{0}': whitespace is not allowed")]
    InvalidNameChars(String),
}

/// Identifier of one entity inside a namespace, e.g. `light.living_room`
///
/// Only the domain is constrained. Names are minted by plugins as well as by
/// the runtime itself (`thread.thread-0`, `app.HelloWorld`), so anything
/// without whitespace or a dot goes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId {
    domain: String,
    name: String,
}

impl EntityId {
    pub fn new(domain: impl Into<String>, name: impl Into<String>) -> Result<Self, EntityIdError> {
        let (domain, name) = (domain.into(), name.into());
        check_domain(&domain)?;
        check_name(&domain, &name)?;
        Ok(EntityId { domain, name })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_valid(s: &str) -> bool {
        EntityId::from_str(s).is_ok()
    }
}

fn check_domain(domain: &str) -> Result<(), EntityIdError> {
    if domain.is_empty() {
        return Err(EntityIdError::EmptyDomain);
    }
    let charset = domain
        .bytes()
        .all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'_'));
    let underscores_ok =
        !domain.starts_with('_') && !domain.ends_with('_') && !domain.contains("__");
    if charset && underscores_ok {
        Ok(())
    } else {
        Err(EntityIdError::InvalidDomainChars(domain.to_string()))
    }
}

fn check_name(domain: &str, name: &str) -> Result<(), EntityIdError> {
    if name.is_empty() {
        Err(EntityIdError::EmptyName)
    } else if name.contains('.') {
        Err(EntityIdError::InvalidFormat(format!("{domain}.{name}")))
    } else if name.contains(char::is_whitespace) {
        Err(EntityIdError::InvalidNameChars(name.to_string()))
    } else {
        Ok(())
    }
}

impl FromStr for EntityId {
    type Err = EntityIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (domain, name) = s
            .split_once('.')
            .ok_or_else(|| EntityIdError::InvalidFormat(s.to_string()))?;
        EntityId::new(domain, name)
    }
}

impl TryFrom<String> for EntityId {
    type Error = EntityIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> String {
        format!("{}.{}", id.domain, id.name)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.domain, self.name)
    }
}
