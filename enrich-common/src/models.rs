//! Shared entity model
//!
//! Auditable entities are referenced by a typed kind tag plus the row id.
//! The kind decides which host table the id belongs to; nothing in this crate
//! owns the entities themselves.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Kinds of records the enrichment services run against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    Company,
    Domain,
    Person,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [EntityKind::Company, EntityKind::Domain, EntityKind::Person];

    /// Value stored in `auditable_type`
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Company => "Company",
            EntityKind::Domain => "Domain",
            EntityKind::Person => "Person",
        }
    }

    /// Host table the entity rows live in
    pub fn table_name(&self) -> &'static str {
        match self {
            EntityKind::Company => "companies",
            EntityKind::Domain => "domains",
            EntityKind::Person => "people",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "company" | "companies" => Ok(EntityKind::Company),
            "domain" | "domains" => Ok(EntityKind::Domain),
            "person" | "people" => Ok(EntityKind::Person),
            other => Err(Error::Validation(format!("Unknown entity kind: {}", other))),
        }
    }
}

/// Reference to one auditable entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: i64,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: i64) -> Self {
        Self { kind, id }
    }

    pub fn company(id: i64) -> Self {
        Self::new(EntityKind::Company, id)
    }

    pub fn domain(id: i64) -> Self {
        Self::new(EntityKind::Domain, id)
    }

    pub fn person(id: i64) -> Self {
        Self::new(EntityKind::Person, id)
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parses_singular_and_table_names() {
        assert_eq!("Company".parse::<EntityKind>().unwrap(), EntityKind::Company);
        assert_eq!("people".parse::<EntityKind>().unwrap(), EntityKind::Person);
        assert_eq!("domains".parse::<EntityKind>().unwrap(), EntityKind::Domain);
    }

    #[test]
    fn test_unknown_kind_is_validation_error() {
        let err = "invoice".parse::<EntityKind>().unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_entity_ref_display() {
        assert_eq!(EntityRef::domain(42).to_string(), "Domain#42");
    }
}
