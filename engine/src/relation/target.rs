use crate::{key_component, Database};
use serde_json::Value;
use std::collections::BTreeMap;

/// The database(s) a relation points at.
#[derive(Debug, Clone)]
pub(crate) enum Target {
    One(Database),
    /// Chosen by the value of a discriminator field.
    Poly {
        discriminator: String,
        types: BTreeMap<String, Database>,
    },
}

impl Target {
    pub fn databases(&self) -> Vec<Database> {
        match self {
            Target::One(db) => vec![db.clone()],
            Target::Poly { types, .. } => types.values().cloned().collect(),
        }
    }

    pub fn discriminator(&self) -> Option<&str> {
        match self {
            Target::One(_) => None,
            Target::Poly { discriminator, .. } => Some(discriminator),
        }
    }

    /// The database selected by a discriminator value.
    pub fn for_value(&self, value: Option<&Value>) -> Option<Database> {
        match self {
            Target::One(db) => Some(db.clone()),
            Target::Poly { types, .. } => types.get(&key_component(value?)?).cloned(),
        }
    }

    /// The discriminator value identifying `db`.
    pub fn value_of(&self, db: &Database) -> Option<String> {
        match self {
            Target::One(_) => None,
            Target::Poly { types, .. } => types
                .iter()
                .find(|(_, candidate)| candidate.ptr_eq(db))
                .map(|(value, _)| value.clone()),
        }
    }

    pub fn owns(&self, db: &Database) -> bool {
        match self {
            Target::One(target) => target.ptr_eq(db),
            Target::Poly { types, .. } => types.values().any(|candidate| candidate.ptr_eq(db)),
        }
    }
}
