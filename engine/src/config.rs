//! Configuration: registry defaults and declarative entity definitions.
//!
//! The serialisable half of an entity definition can be read from JSON, the
//! way a schema file would be. Closures (codecs, generated defaults, custom
//! comparators and revision checks) are attached with builder methods.

use crate::codec::SharedCodec;
use crate::compare::Comparator;
use crate::{error::Result, Cascade, Error, Model, Record};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;
use std::sync::Arc;

/// Whether synced models keep a local copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    /// Never touch local storage.
    None,
    /// Persist locally only while a remote write is outstanding.
    Pending,
    /// Always mirror models locally.
    #[default]
    All,
}

impl FromStr for CacheMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(CacheMode::None),
            "pending" => Ok(CacheMode::Pending),
            "all" => Ok(CacheMode::All),
            _ => Err(ConfigError::InvalidCache(s.to_string())),
        }
    }
}

/// What a database loads on initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    /// Local storage only; remote data arrives through refresh, fetch or live.
    None,
    /// Local storage, then a full remote refresh.
    #[default]
    All,
}

impl FromStr for LoadMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(LoadMode::None),
            "all" => Ok(LoadMode::All),
            _ => Err(ConfigError::InvalidLoad(s.to_string())),
        }
    }
}

/// Configuration errors raised while reading [`Defaults`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid cache mode: {0}")]
    InvalidCache(String),

    #[error("invalid load mode: {0}")]
    InvalidLoad(String),

    #[error("invalid REBOUND_AUTO_REFRESH value: {0}")]
    InvalidAutoRefresh(String),

    #[error("key separator must not be empty")]
    EmptyKeySeparator,
}

/// Registry-wide defaults applied to every entity that does not override them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Defaults {
    pub key_separator: String,
    pub cache: CacheMode,
    pub load: LoadMode,
    pub auto_refresh: bool,
    pub full_save: bool,
    pub full_publish: bool,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            key_separator: "/".to_string(),
            cache: CacheMode::All,
            load: LoadMode::All,
            auto_refresh: true,
            full_save: false,
            full_publish: false,
        }
    }
}

impl Defaults {
    /// Load defaults from `REBOUND_*` environment variables.
    pub fn from_env() -> std::result::Result<Self, ConfigError> {
        let mut defaults = Defaults::default();

        if let Ok(cache) = env::var("REBOUND_CACHE") {
            defaults.cache = cache.parse()?;
        }
        if let Ok(load) = env::var("REBOUND_LOAD") {
            defaults.load = load.parse()?;
        }
        if let Ok(separator) = env::var("REBOUND_KEY_SEPARATOR") {
            if separator.is_empty() {
                return Err(ConfigError::EmptyKeySeparator);
            }
            defaults.key_separator = separator;
        }
        if let Ok(auto) = env::var("REBOUND_AUTO_REFRESH") {
            defaults.auto_refresh = auto
                .parse()
                .map_err(|_| ConfigError::InvalidAutoRefresh(auto.clone()))?;
        }

        Ok(defaults)
    }
}

/// One field name or an ordered list of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldSpec {
    One(String),
    Many(Vec<String>),
}

impl FieldSpec {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            FieldSpec::One(field) => vec![field.clone()],
            FieldSpec::Many(fields) => fields.clone(),
        }
    }
}

impl Default for FieldSpec {
    fn default() -> Self {
        FieldSpec::One("id".to_string())
    }
}

impl From<&str> for FieldSpec {
    fn from(field: &str) -> Self {
        FieldSpec::One(field.to_string())
    }
}

impl From<Vec<&str>> for FieldSpec {
    fn from(fields: Vec<&str>) -> Self {
        FieldSpec::Many(fields.into_iter().map(String::from).collect())
    }
}

/// How a relation contributes to its owner's encoded form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
    /// Not encoded; foreign keys carry the relation.
    #[default]
    None,
    /// Embedded encoded model(s).
    Model,
    /// The related key.
    Key,
    /// The related keys, for to-many relations.
    Keys,
}

/// Options for `belongsTo` and `hasOne`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SingleOptions {
    /// Target entity name.
    pub model: Option<String>,
    /// Foreign-key fields on the owner. Defaults to `<relation>_<targetKey>`.
    pub local: Option<FieldSpec>,
    pub store: StoreMode,
    pub save: StoreMode,
    pub auto: bool,
    pub lazy: bool,
    pub clear_key: bool,
    pub cascade: Option<Cascade>,
    pub discriminator: Option<String>,
    pub discriminators: BTreeMap<String, String>,
}

impl Default for SingleOptions {
    fn default() -> Self {
        Self {
            model: None,
            local: None,
            store: StoreMode::None,
            save: StoreMode::None,
            auto: true,
            lazy: false,
            clear_key: true,
            cascade: None,
            discriminator: None,
            discriminators: BTreeMap::new(),
        }
    }
}

impl SingleOptions {
    pub fn to(model: impl Into<String>) -> Self {
        Self {
            model: Some(model.into()),
            ..Self::default()
        }
    }
}

/// Options for `hasMany`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HasManyOptions {
    pub model: Option<String>,
    /// Fields on the related model pointing at the owner.
    /// Defaults to `<ownerEntity>_<ownerKey>`.
    pub foreign: Option<FieldSpec>,
    /// Owner fields the foreign fields mirror. Defaults to the owner key.
    pub local: Option<FieldSpec>,
    pub comparator: Option<String>,
    pub store: StoreMode,
    pub save: StoreMode,
    pub auto: bool,
    pub lazy: bool,
    pub clear_key: bool,
    pub cascade_remove: bool,
    pub cascade_save_related: bool,
    pub cascade: Option<Cascade>,
    pub discriminator: Option<String>,
    pub discriminators: BTreeMap<String, String>,
}

impl Default for HasManyOptions {
    fn default() -> Self {
        Self {
            model: None,
            foreign: None,
            local: None,
            comparator: None,
            store: StoreMode::None,
            save: StoreMode::None,
            auto: true,
            lazy: false,
            clear_key: true,
            cascade_remove: false,
            cascade_save_related: false,
            cascade: None,
            discriminator: None,
            discriminators: BTreeMap::new(),
        }
    }
}

impl HasManyOptions {
    pub fn to(model: impl Into<String>) -> Self {
        Self {
            model: Some(model.into()),
            ..Self::default()
        }
    }
}

/// Options for `hasManyThrough`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThroughOptions {
    pub model: Option<String>,
    /// Join entity name.
    pub through: Option<String>,
    /// Join fields pointing at the owner. Defaults to `<ownerEntity>_<ownerKey>`.
    pub local: Option<FieldSpec>,
    /// Join fields pointing at the related model. Defaults to `<relatedEntity>_<relatedKey>`.
    pub foreign: Option<FieldSpec>,
    pub comparator: Option<String>,
    pub store: StoreMode,
    pub save: StoreMode,
    pub auto: bool,
    pub lazy: bool,
    pub cascade_remove: bool,
    pub cascade_remove_through: bool,
    pub cascade_save_related: bool,
    pub cascade: Option<Cascade>,
}

impl Default for ThroughOptions {
    fn default() -> Self {
        Self {
            model: None,
            through: None,
            local: None,
            foreign: None,
            comparator: None,
            store: StoreMode::None,
            save: StoreMode::None,
            auto: true,
            lazy: false,
            cascade_remove: false,
            cascade_remove_through: true,
            cascade_save_related: false,
            cascade: None,
        }
    }
}

impl ThroughOptions {
    pub fn to(model: impl Into<String>, through: impl Into<String>) -> Self {
        Self {
            model: Some(model.into()),
            through: Some(through.into()),
            ..Self::default()
        }
    }
}

/// A declared relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RelationOptions {
    BelongsTo(SingleOptions),
    HasOne(SingleOptions),
    HasMany(HasManyOptions),
    HasManyThrough(ThroughOptions),
}

/// Produces a default field value.
pub type Generator = Arc<dyn Fn() -> Value + Send + Sync>;

/// Returns true when `incoming` is older than what `model` already holds.
pub type RevisionFn = Arc<dyn Fn(&Model, &Record) -> bool + Send + Sync>;

/// A field default: a constant or a generator.
#[derive(Clone)]
pub enum DefaultValue {
    Value(Value),
    Generator(Generator),
}

impl DefaultValue {
    /// A random v4 UUID string.
    pub fn uuid() -> Self {
        DefaultValue::Generator(Arc::new(|| Value::from(uuid::Uuid::new_v4().to_string())))
    }

    /// The current time in epoch milliseconds.
    pub fn now() -> Self {
        DefaultValue::Generator(Arc::new(|| Value::from(crate::codec::now_millis())))
    }

    pub fn produce(&self) -> Value {
        match self {
            DefaultValue::Value(value) => value.clone(),
            DefaultValue::Generator(generate) => generate(),
        }
    }
}

impl std::fmt::Debug for DefaultValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DefaultValue::Value(value) => f.debug_tuple("Value").field(value).finish(),
            DefaultValue::Generator(_) => f.write_str("Generator"),
        }
    }
}

/// Declarative definition of one entity type.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseOptions {
    pub name: String,
    #[serde(default)]
    pub class_name: Option<String>,
    #[serde(default)]
    pub key: FieldSpec,
    #[serde(default)]
    pub key_separator: Option<String>,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub defaults: BTreeMap<String, Value>,
    #[serde(default)]
    pub cache: Option<CacheMode>,
    #[serde(default)]
    pub load: Option<LoadMode>,
    #[serde(default)]
    pub auto_refresh: Option<bool>,
    #[serde(default)]
    pub full_save: Option<bool>,
    #[serde(default)]
    pub full_publish: Option<bool>,
    #[serde(default)]
    pub comparator: Option<String>,
    /// Field whose value orders revisions of a record.
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub relations: BTreeMap<String, RelationOptions>,
    #[serde(skip)]
    pub generators: BTreeMap<String, Generator>,
    #[serde(skip)]
    pub codecs: BTreeMap<String, SharedCodec>,
    #[serde(skip)]
    pub comparator_fn: Option<Comparator>,
    #[serde(skip)]
    pub revision_fn: Option<RevisionFn>,
}

impl std::fmt::Debug for DatabaseOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseOptions")
            .field("name", &self.name)
            .field("key", &self.key)
            .field("fields", &self.fields)
            .field("cache", &self.cache)
            .field("load", &self.load)
            .field("relations", &self.relations)
            .field("codecs", &self.codecs.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl DatabaseOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            class_name: None,
            key: FieldSpec::default(),
            key_separator: None,
            fields: Vec::new(),
            defaults: BTreeMap::new(),
            cache: None,
            load: None,
            auto_refresh: None,
            full_save: None,
            full_publish: None,
            comparator: None,
            revision: None,
            relations: BTreeMap::new(),
            generators: BTreeMap::new(),
            codecs: BTreeMap::new(),
            comparator_fn: None,
            revision_fn: None,
        }
    }

    /// Parse the serialisable part of a definition.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::InvalidOptions(e.to_string()))
    }

    pub fn class_name(mut self, class_name: impl Into<String>) -> Self {
        self.class_name = Some(class_name.into());
        self
    }

    pub fn key(mut self, key: impl Into<FieldSpec>) -> Self {
        self.key = key.into();
        self
    }

    pub fn key_separator(mut self, separator: impl Into<String>) -> Self {
        self.key_separator = Some(separator.into());
        self
    }

    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn default_value(mut self, field: impl Into<String>, value: Value) -> Self {
        self.defaults.insert(field.into(), value);
        self
    }

    pub fn default_with(mut self, field: impl Into<String>, default: DefaultValue) -> Self {
        let field = field.into();
        match default {
            DefaultValue::Value(value) => {
                self.defaults.insert(field, value);
            }
            DefaultValue::Generator(generate) => {
                self.generators.insert(field, generate);
            }
        }
        self
    }

    pub fn cache(mut self, cache: CacheMode) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn load(mut self, load: LoadMode) -> Self {
        self.load = Some(load);
        self
    }

    pub fn auto_refresh(mut self, auto_refresh: bool) -> Self {
        self.auto_refresh = Some(auto_refresh);
        self
    }

    pub fn full_save(mut self, full_save: bool) -> Self {
        self.full_save = Some(full_save);
        self
    }

    pub fn full_publish(mut self, full_publish: bool) -> Self {
        self.full_publish = Some(full_publish);
        self
    }

    pub fn comparator(mut self, expression: impl Into<String>) -> Self {
        self.comparator = Some(expression.into());
        self
    }

    pub fn comparator_fn(mut self, comparator: Comparator) -> Self {
        self.comparator_fn = Some(comparator);
        self
    }

    pub fn revision(mut self, field: impl Into<String>) -> Self {
        self.revision = Some(field.into());
        self
    }

    pub fn revision_fn(mut self, revision: RevisionFn) -> Self {
        self.revision_fn = Some(revision);
        self
    }

    pub fn codec(mut self, field: impl Into<String>, codec: SharedCodec) -> Self {
        self.codecs.insert(field.into(), codec);
        self
    }

    pub fn relation(mut self, name: impl Into<String>, relation: RelationOptions) -> Self {
        self.relations.insert(name.into(), relation);
        self
    }

    pub fn belongs_to(self, name: impl Into<String>, options: SingleOptions) -> Self {
        self.relation(name, RelationOptions::BelongsTo(options))
    }

    pub fn has_one(self, name: impl Into<String>, options: SingleOptions) -> Self {
        self.relation(name, RelationOptions::HasOne(options))
    }

    pub fn has_many(self, name: impl Into<String>, options: HasManyOptions) -> Self {
        self.relation(name, RelationOptions::HasMany(options))
    }

    pub fn has_many_through(self, name: impl Into<String>, options: ThroughOptions) -> Self {
        self.relation(name, RelationOptions::HasManyThrough(options))
    }
}
