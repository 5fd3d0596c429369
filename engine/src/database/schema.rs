//! Entity schema: validated, resolved form of [`DatabaseOptions`].

use crate::codec::SharedCodec;
use crate::compare::{comparator_from_expression, Comparator};
use crate::config::{CacheMode, DatabaseOptions, DefaultValue, Defaults, LoadMode, RevisionFn};
use crate::relation::{self, RelationHandle};
use crate::{error::Result, is_marker, Database, EntityName, Error};
use std::collections::BTreeMap;

/// How stale remote data is recognised.
#[derive(Clone)]
pub(crate) enum Revision {
    /// Field compared with the value already held; lower is older.
    Field(String),
    Check(RevisionFn),
}

/// Everything a [`Database`] knows about its entity type.
pub(crate) struct Schema {
    pub name: EntityName,
    pub class_name: String,
    pub key: Vec<String>,
    pub key_separator: String,
    pub fields: Vec<String>,
    /// Fields and relations included in the remote encoding.
    pub save_fields: Vec<String>,
    pub defaults: BTreeMap<String, DefaultValue>,
    pub codecs: BTreeMap<String, SharedCodec>,
    pub comparator: Option<Comparator>,
    pub revision: Option<Revision>,
    pub cache: CacheMode,
    pub load: LoadMode,
    pub auto_refresh: bool,
    pub full_save: bool,
    pub full_publish: bool,
    pub relations: BTreeMap<String, RelationHandle>,
}

impl Schema {
    /// Validate `options` and build the relation objects.
    ///
    /// `lookup` finds already-defined entities, used for defaults that depend
    /// on a target's key.
    pub fn build(
        options: DatabaseOptions,
        defaults: &Defaults,
        lookup: &dyn Fn(&str) -> Option<Database>,
    ) -> Result<Self> {
        let name = options.name.trim().to_string();
        if name.is_empty() {
            return Err(Error::InvalidOptions("entity name must not be empty".into()));
        }

        let key = options.key.to_vec();
        if key.is_empty() || key.iter().any(|k| k.is_empty()) {
            return Err(Error::EmptyKey(name));
        }

        let mut fields: Vec<String> = Vec::with_capacity(options.fields.len());
        for field in &options.fields {
            if is_marker(field) || field.is_empty() {
                return Err(Error::InvalidOptions(format!(
                    "invalid field name '{field}' on entity '{name}'"
                )));
            }
            if fields.contains(field) {
                return Err(Error::DuplicateField {
                    entity: name,
                    field: field.clone(),
                });
            }
            fields.push(field.clone());
        }
        if fields.is_empty() {
            fields = key.clone();
        }
        for field in &key {
            if !fields.contains(field) {
                return Err(Error::KeyFieldMissing {
                    entity: name,
                    field: field.clone(),
                });
            }
        }

        let key_separator = options
            .key_separator
            .unwrap_or_else(|| defaults.key_separator.clone());
        if key_separator.is_empty() {
            return Err(Error::InvalidOptions("key separator must not be empty".into()));
        }

        let mut relations = BTreeMap::new();
        for (relation_name, relation_options) in options.relations {
            if fields.contains(&relation_name) {
                return Err(Error::relation(
                    name.as_str(),
                    relation_name,
                    "relation name shadows a field",
                ));
            }
            let relation = relation::build(&name, &key, &relation_name, relation_options, lookup)?;
            for field in relation.owner_fields() {
                if !fields.contains(&field) {
                    fields.push(field);
                }
            }
            relations.insert(relation_name, relation);
        }

        let mut save_fields = fields.clone();
        for (relation_name, relation) in &relations {
            if relation.encodes(true) {
                save_fields.push(relation_name.clone());
            }
        }

        let mut field_defaults = BTreeMap::new();
        for (field, value) in options.defaults {
            field_defaults.insert(field, DefaultValue::Value(value));
        }
        for (field, generate) in options.generators {
            field_defaults.insert(field, DefaultValue::Generator(generate));
        }

        let comparator = match (options.comparator_fn, options.comparator) {
            (Some(comparator), _) => Some(comparator),
            (None, Some(expression)) => Some(comparator_from_expression(&expression)?),
            (None, None) => None,
        };
        let revision = match (options.revision_fn, options.revision) {
            (Some(check), _) => Some(Revision::Check(check)),
            (None, Some(field)) => Some(Revision::Field(field)),
            (None, None) => None,
        };

        let class_name = options.class_name.unwrap_or_else(|| class_name_of(&name));

        Ok(Self {
            name,
            class_name,
            key,
            key_separator,
            fields,
            save_fields,
            defaults: field_defaults,
            codecs: options.codecs,
            comparator,
            revision,
            cache: options.cache.unwrap_or(defaults.cache),
            load: options.load.unwrap_or(defaults.load),
            auto_refresh: options.auto_refresh.unwrap_or(defaults.auto_refresh),
            full_save: options.full_save.unwrap_or(defaults.full_save),
            full_publish: options.full_publish.unwrap_or(defaults.full_publish),
            relations,
        })
    }
}

/// `task_list` becomes `TaskList`.
fn class_name_of(name: &str) -> String {
    name.split(|c: char| c == '_' || c == '-' || c == ' ')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SingleOptions;

    fn none(_: &str) -> Option<Database> {
        None
    }

    #[test]
    fn class_names() {
        assert_eq!(class_name_of("task"), "Task");
        assert_eq!(class_name_of("task_list"), "TaskList");
        assert_eq!(class_name_of("user-group"), "UserGroup");
    }

    #[test]
    fn fields_default_to_key() {
        let schema = Schema::build(DatabaseOptions::new("tag"), &Defaults::default(), &none).unwrap();
        assert_eq!(schema.fields, vec!["id"]);
        assert_eq!(schema.class_name, "Tag");
    }

    #[test]
    fn key_must_be_a_field() {
        let options = DatabaseOptions::new("task").fields(["name"]);
        let err = Schema::build(options, &Defaults::default(), &none).err();
        assert_eq!(
            err,
            Some(Error::KeyFieldMissing {
                entity: "task".into(),
                field: "id".into()
            })
        );
    }

    #[test]
    fn duplicate_fields_rejected() {
        let options = DatabaseOptions::new("task").fields(["id", "name", "name"]);
        assert!(matches!(
            Schema::build(options, &Defaults::default(), &none),
            Err(Error::DuplicateField { .. })
        ));
    }

    #[test]
    fn relation_foreign_keys_become_fields() {
        let mut owner = SingleOptions::to("user");
        owner.local = Some("owner_id".into());
        let options = DatabaseOptions::new("task")
            .fields(["id", "name"])
            .belongs_to("owner", owner);
        let schema = Schema::build(options, &Defaults::default(), &none).unwrap();
        assert_eq!(schema.fields, vec!["id", "name", "owner_id"]);
        assert_eq!(schema.save_fields, schema.fields);
    }

    #[test]
    fn relation_cannot_shadow_field() {
        let options = DatabaseOptions::new("task")
            .fields(["id", "owner"])
            .belongs_to("owner", SingleOptions::to("user"));
        assert!(matches!(
            Schema::build(options, &Defaults::default(), &none),
            Err(Error::InvalidRelation { .. })
        ));
    }

    #[test]
    fn entity_overrides_defaults() {
        let options = DatabaseOptions::new("task")
            .cache(CacheMode::Pending)
            .key_separator(":");
        let schema = Schema::build(options, &Defaults::default(), &none).unwrap();
        assert_eq!(schema.cache, CacheMode::Pending);
        assert_eq!(schema.load, LoadMode::All);
        assert_eq!(schema.key_separator, ":");
    }

    #[test]
    fn bad_comparator_rejected() {
        let options = DatabaseOptions::new("task").comparator("--x");
        assert!(matches!(
            Schema::build(options, &Defaults::default(), &none),
            Err(Error::InvalidComparator(_))
        ));
    }
}
