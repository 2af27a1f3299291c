use thiserror::Error;

use crate::datatype::TypeCategory;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Lock poisoned: {0}")]
    Lock(String),

    // ---- type definition ----
    #[error("Type definition error: {category} type '{name}' is already registered")]
    DuplicateType { category: TypeCategory, name: String },
    #[error("Type definition error: unresolved type '{referenced}' in attribute '{attribute}' of '{type_name}'")]
    UnresolvedReference {
        type_name: String,
        attribute: String,
        referenced: String,
    },
    #[error("Type definition error: field '{attribute}' of '{type_name}' collides with an incompatible inherited field")]
    IncompatibleField { type_name: String, attribute: String },
    #[error("Type definition error: {0}")]
    InvalidTypeDefinition(String),
    #[error("Type not found: {}", describe_type(.category, .name))]
    TypeNotFound {
        category: Option<TypeCategory>,
        name: String,
    },

    // ---- instances ----
    #[error("Cannot convert {value} to {type_name}: {reason}")]
    ValueConversion {
        type_name: String,
        value: String,
        reason: String,
    },
    #[error("Null value not allowed for required attribute '{attribute}'")]
    NullRequiredAttribute { attribute: String },
    #[error("Identity error: {0}")]
    Identity(String),

    // ---- repository ----
    #[error("Repository error: {0}")]
    Repository(String),
    #[error("Entity not found: {0}")]
    EntityNotFound(String),
    #[error("Trait '{trait_name}' is not attached to entity {guid}")]
    TraitNotFound { guid: String, trait_name: String },
    #[error("Type '{type_name}' has no property '{property}'")]
    UnknownProperty { type_name: String, property: String },
    #[error("Unique constraint violated: {type_name}.{attribute} = {value} already exists")]
    UniqueConstraint {
        type_name: String,
        attribute: String,
        value: String,
    },

    // ---- queries ----
    #[error("Parse error: {message}")]
    QueryParse {
        message: String,
        line: Option<usize>,
        col: Option<usize>,
    },
    #[error("Unknown type or trait '{0}'")]
    UnknownType(String),
    #[error("Unknown attribute '{attribute}' on '{type_name}'")]
    UnknownAttribute { type_name: String, attribute: String },
    #[error("Invalid query: {0}")]
    InvalidQuery(String),
    #[error("Discovery error for query '{query}': {source}")]
    Discovery {
        query: String,
        #[source]
        source: Box<CatalogError>,
    },
}

pub type Result<T> = std::result::Result<T, CatalogError>;

fn describe_type(category: &Option<TypeCategory>, name: &str) -> String {
    match category {
        Some(category) => format!("{category} '{name}'"),
        None => format!("'{name}'"),
    }
}

impl CatalogError {
    pub fn discovery(query: &str, source: CatalogError) -> Self {
        match source {
            already @ CatalogError::Discovery { .. } => already,
            source => Self::Discovery {
                query: query.to_string(),
                source: Box::new(source),
            },
        }
    }
    pub fn conversion(type_name: &str, value: impl std::fmt::Display, reason: &str) -> Self {
        Self::ValueConversion {
            type_name: type_name.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
    /// True for the errors a type batch can fail with.
    pub fn is_type_definition_error(&self) -> bool {
        matches!(
            self,
            Self::DuplicateType { .. }
                | Self::UnresolvedReference { .. }
                | Self::IncompatibleField { .. }
                | Self::InvalidTypeDefinition(_)
        )
    }
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::EntityNotFound(_) | Self::TraitNotFound { .. } | Self::TypeNotFound { .. }
        )
    }
    /// The innermost error of a discovery failure, or the error itself.
    pub fn root_cause(&self) -> &CatalogError {
        match self {
            Self::Discovery { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

// Helper conversions
impl From<rusqlite::Error> for CatalogError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}
impl From<serde_json::Error> for CatalogError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
impl From<config::ConfigError> for CatalogError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}
impl<T> From<std::sync::PoisonError<T>> for CatalogError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::Lock(e.to_string())
    }
}
