//! Typed errors surfaced by the engine.

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing reference: {kind} '{id}'")]
    MissingReference { kind: &'static str, id: String },
    #[error("duplicate {kind}: {name}")]
    Duplicate { kind: &'static str, name: String },
    #[error("invalid edge {entity}.{edge}: {reason}")]
    InvalidEdge {
        entity: String,
        edge: String,
        reason: String,
    },
    #[error("config load: {0}")]
    Load(String),
    #[error("validation: {0}")]
    Validation(String),
}

/// Which store constraint an operation tripped over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    Unique,
    ForeignKey,
    NotNull,
    Check,
    /// An edge target is already linked to a different node.
    Edge,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConstraintViolation {
    pub kind: ConstraintKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constraint: Option<String>,
    pub message: String,
}

impl std::fmt::Display for ConstraintViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.constraint {
            Some(c) => write!(f, "{:?} constraint {}: {}", self.kind, c, self.message),
            None => write!(f, "{:?} constraint: {}", self.kind, self.message),
        }
    }
}

#[derive(Error, Debug)]
pub enum GraphError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("validation: {entity}: {message}")]
    Validation { entity: String, message: String },
    #[error("constraint violation: {0}")]
    Constraint(ConstraintViolation),
    #[error("required edge {entity}.{edge} cannot be removed")]
    RequiredEdge { entity: String, edge: String },
    #[error("{entity} not found")]
    NotFound { entity: String },
    #[error("{entity} not singular: {count} rows matched")]
    NotSingular { entity: String, count: usize },
    #[error("privacy: {entity}: {reason}")]
    PolicyDenied { entity: String, reason: String },
    #[error("{entity}: operation does not support capability '{capability}'")]
    Capability {
        entity: String,
        capability: &'static str,
    },
    #[error("uninitialized interceptor '{slot}' on {entity} (missing registration?)")]
    UninitializedInterceptor { entity: String, slot: String },
    #[error("canceled: {0}")]
    Canceled(String),
    #[error("database: {0}")]
    Db(sqlx::Error),
}

/// Fieldless mirror of [`GraphError`] for callers that only branch on the kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Validation,
    ConstraintViolation,
    RequiredEdge,
    NotFound,
    NotSingular,
    PolicyDenied,
    Capability,
    UninitializedInterceptor,
    Canceled,
    Database,
}

impl GraphError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GraphError::Config(_) => ErrorKind::Config,
            GraphError::Validation { .. } => ErrorKind::Validation,
            GraphError::Constraint(_) => ErrorKind::ConstraintViolation,
            GraphError::RequiredEdge { .. } => ErrorKind::RequiredEdge,
            GraphError::NotFound { .. } => ErrorKind::NotFound,
            GraphError::NotSingular { .. } => ErrorKind::NotSingular,
            GraphError::PolicyDenied { .. } => ErrorKind::PolicyDenied,
            GraphError::Capability { .. } => ErrorKind::Capability,
            GraphError::UninitializedInterceptor { .. } => ErrorKind::UninitializedInterceptor,
            GraphError::Canceled(_) => ErrorKind::Canceled,
            GraphError::Db(_) => ErrorKind::Database,
        }
    }

    pub fn validation(entity: impl Into<String>, message: impl Into<String>) -> Self {
        GraphError::Validation {
            entity: entity.into(),
            message: message.into(),
        }
    }

    pub fn not_found(entity: impl Into<String>) -> Self {
        GraphError::NotFound {
            entity: entity.into(),
        }
    }

    pub fn constraint(kind: ConstraintKind, message: impl Into<String>) -> Self {
        GraphError::Constraint(ConstraintViolation {
            kind,
            constraint: None,
            message: message.into(),
        })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, GraphError::NotFound { .. })
    }

    pub fn is_constraint(&self) -> bool {
        matches!(self, GraphError::Constraint(_))
    }

    pub fn is_denied(&self) -> bool {
        matches!(self, GraphError::PolicyDenied { .. })
    }

    /// Constraint details when this is a [`GraphError::Constraint`].
    pub fn as_constraint(&self) -> Option<&ConstraintViolation> {
        match self {
            GraphError::Constraint(c) => Some(c),
            _ => None,
        }
    }
}

/// Store errors: constraint failures are lifted into [`ConstraintViolation`], the rest stay opaque.
impl From<sqlx::Error> for GraphError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e {
            let kind = match db.kind() {
                sqlx::error::ErrorKind::UniqueViolation => Some(ConstraintKind::Unique),
                sqlx::error::ErrorKind::ForeignKeyViolation => Some(ConstraintKind::ForeignKey),
                sqlx::error::ErrorKind::NotNullViolation => Some(ConstraintKind::NotNull),
                sqlx::error::ErrorKind::CheckViolation => Some(ConstraintKind::Check),
                _ => None,
            };
            if let Some(kind) = kind {
                return GraphError::Constraint(ConstraintViolation {
                    kind,
                    constraint: db.constraint().map(str::to_string),
                    message: db.message().to_string(),
                });
            }
        }
        GraphError::Db(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        assert_eq!(GraphError::not_found("user").kind(), ErrorKind::NotFound);
        assert_eq!(
            GraphError::constraint(ConstraintKind::Unique, "dup").kind(),
            ErrorKind::ConstraintViolation
        );
        let denied = GraphError::PolicyDenied {
            entity: "tenant".into(),
            reason: "no viewer".into(),
        };
        assert!(denied.is_denied());
        assert_eq!(denied.to_string(), "privacy: tenant: no viewer");
    }

    #[test]
    fn non_database_sqlx_errors_stay_opaque() {
        let e: GraphError = sqlx::Error::RowNotFound.into();
        assert_eq!(e.kind(), ErrorKind::Database);
    }
}
