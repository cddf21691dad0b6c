use std::fmt;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// One failed check of a schema validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaFailure {
    pub column: String,
    pub check: String,
    pub detail: String,
}

impl SchemaFailure {
    pub fn new(column: impl Into<String>, check: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            check: check.into(),
            detail: detail.into(),
        }
    }
}

impl fmt::Display for SchemaFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "column '{}' failed '{}': {}", self.column, self.check, self.detail)
    }
}

fn join_failures(failures: &[SchemaFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{schema} rejected the dataset ({} failures): {}", .failures.len(), join_failures(.failures))]
    SchemaViolation {
        schema: String,
        failures: Vec<SchemaFailure>,
    },

    #[error("{0} is not fitted yet, call `fit` before `predict`")]
    NotFitted(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("value error: {0}")]
    Value(String),

    #[error("tracking error: {0}")]
    Tracking(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error(transparent)]
    ObjectStore(#[from] object_store::Error),

    #[error(transparent)]
    ObjectPath(#[from] object_store::path::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub fn value(msg: impl Into<String>) -> Self {
        Error::Value(msg.into())
    }

    pub fn tracking(msg: impl Into<String>) -> Self {
        Error::Tracking(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_violation_lists_every_failure() {
        let err = Error::SchemaViolation {
            schema: "InputsSchema".into(),
            failures: vec![
                SchemaFailure::new("AMOUNT", "greater_than(0)", "2 rows"),
                SchemaFailure::new("SIDE", "not_nullable", "1 rows"),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 failures"));
        assert!(msg.contains("AMOUNT"));
        assert!(msg.contains("SIDE"));
    }
}
