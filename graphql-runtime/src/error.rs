//! Engine errors.
use std::sync::Arc;

use displaydoc::Display;
use serde_json_bytes::ByteString;
use serde_json_bytes::Value;
use thiserror::Error;

pub use crate::configuration::ConfigurationError;
use crate::graphql::ErrorExtension;
use crate::graphql::IntoGraphQLError;
use crate::graphql::Location;
use crate::json_ext::Object;
use crate::json_ext::Path;

/// A type-erased error, as returned by batch sources and jobs.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Static errors found before a query is analyzed or executed.
///
/// A query with any of these never reaches execution: its response only carries `errors`.
#[derive(Error, Display, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ValidationError {
    /// {message}
    Syntax {
        message: String,
        locations: Vec<Location>,
    },

    /// Field '{key}' has a field conflict: {conflicts}?
    FieldConflict {
        key: String,
        conflicts: String,
        locations: Vec<Location>,
    },

    /// Field '{key}' has an argument conflict: {conflicts}?
    ArgumentConflict {
        key: String,
        conflicts: String,
        locations: Vec<Location>,
    },

    /// Fragment {name} was used, but not defined
    UndefinedFragment {
        name: String,
        locations: Vec<Location>,
    },

    /// Fragment {name} contains an infinite loop
    CyclicalFragment {
        name: String,
        locations: Vec<Location>,
    },

    /// Field '{field}' doesn't exist on type '{type_name}'
    UndefinedField {
        field: String,
        type_name: String,
        locations: Vec<Location>,
    },

    /// Unknown operation named '{name}'
    UnknownOperation { name: String },

    /// An operation name is required
    OperationNameRequired,

    /// No operations in query document
    NoOperation,

    /// Schema is not configured for {operation_type}s
    UnsupportedOperation {
        operation_type: String,
        locations: Vec<Location>,
    },
}

impl ErrorExtension for ValidationError {
    fn extension_code(&self) -> String {
        match self {
            ValidationError::Syntax { .. } => "GRAPHQL_PARSE_FAILED",
            _ => "GRAPHQL_VALIDATION_FAILED",
        }
        .to_string()
    }
}

impl IntoGraphQLError for ValidationError {
    fn locations(&self) -> Vec<Location> {
        match self {
            ValidationError::Syntax { locations, .. }
            | ValidationError::FieldConflict { locations, .. }
            | ValidationError::ArgumentConflict { locations, .. }
            | ValidationError::UndefinedFragment { locations, .. }
            | ValidationError::CyclicalFragment { locations, .. }
            | ValidationError::UndefinedField { locations, .. }
            | ValidationError::UnsupportedOperation { locations, .. } => locations.clone(),
            ValidationError::UnknownOperation { .. }
            | ValidationError::OperationNameRequired
            | ValidationError::NoOperation => Vec::new(),
        }
    }
}

/// Errors raised by analyzers. These reach the client and stop the query before execution.
#[derive(Error, Display, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AnalysisError {
    /// Query has complexity of {actual}, which exceeds max complexity of {max}
    MaxComplexity { actual: u64, max: u64 },

    /// Query has depth of {actual}, which exceeds max depth of {max}
    MaxDepth { actual: usize, max: usize },

    /// {message}
    Custom {
        message: String,
        locations: Vec<Location>,
    },
}

impl AnalysisError {
    pub fn custom(message: impl Into<String>) -> Self {
        AnalysisError::Custom {
            message: message.into(),
            locations: Vec::new(),
        }
    }
}

impl ErrorExtension for AnalysisError {
    fn extension_code(&self) -> String {
        match self {
            AnalysisError::MaxComplexity { .. } => "MAX_COMPLEXITY_LIMIT",
            AnalysisError::MaxDepth { .. } => "MAX_DEPTH_LIMIT",
            AnalysisError::Custom { .. } => "ANALYSIS_ERROR",
        }
        .to_string()
    }
}

impl IntoGraphQLError for AnalysisError {
    fn locations(&self) -> Vec<Location> {
        match self {
            AnalysisError::Custom { locations, .. } => locations.clone(),
            _ => Vec::new(),
        }
    }
}

/// Error from {source_name}#fetch({keys}), {cause}
///
/// A failed batch: every key of the batch resolves to the same error.
#[derive(Error, Display, Debug, Clone)]
#[ignore_extra_doc_attributes]
pub struct LoadError {
    /// The name of the source whose `fetch` failed.
    pub source_name: String,
    /// The keys of the failed batch, as they were handed to `fetch`.
    pub keys: String,
    pub cause: Arc<BoxError>,
}

impl LoadError {
    pub(crate) fn new<K: std::fmt::Debug>(source_name: &str, keys: &[K], cause: BoxError) -> Self {
        LoadError {
            source_name: source_name.to_string(),
            keys: keys
                .iter()
                .map(|key| format!("{key:?}"))
                .collect::<Vec<_>>()
                .join(", "),
            cause: Arc::new(cause),
        }
    }

    /// The message with the query location of the failing field spliced in.
    pub fn message_at(&self, operation: &str, path: &Path) -> String {
        format!(
            "Error from {}#fetch({}) at {operation}.{path}, {}",
            self.source_name, self.keys, self.cause
        )
    }
}

/// {message}
///
/// An error returned by application code for one field of one object. It is recorded at the
/// path of the field while sibling fields keep executing.
#[derive(Error, Display, Debug, Clone)]
#[ignore_extra_doc_attributes]
pub struct FieldError {
    pub message: String,
    pub extensions: Object,
    pub(crate) load_error: Option<LoadError>,
}

impl FieldError {
    pub fn new(message: impl Into<String>) -> Self {
        FieldError {
            message: message.into(),
            extensions: Object::new(),
            load_error: None,
        }
    }

    pub fn with_extension(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extensions.insert(ByteString::from(key), value.into());
        self
    }

    /// The response error for this error, raised at `path` of `operation`.
    pub(crate) fn into_graphql_error(
        self,
        operation: &str,
        path: Option<Path>,
        locations: Vec<Location>,
    ) -> crate::graphql::Error {
        let message = match (&self.load_error, &path) {
            (Some(load_error), Some(path)) => load_error.message_at(operation, path),
            (Some(load_error), None) => load_error.message_at(operation, &Path::empty()),
            (None, _) => self.message,
        };
        crate::graphql::Error {
            message,
            locations,
            path,
            extensions: self.extensions,
        }
    }
}

impl From<LoadError> for FieldError {
    fn from(load_error: LoadError) -> Self {
        FieldError {
            message: load_error.to_string(),
            extensions: Object::new(),
            load_error: Some(load_error),
        }
    }
}

/// Unrecoverable scheduler errors. These indicate a bug in the engine or in a source
/// implementation and abort the whole run.
#[derive(Error, Display, Debug, Clone)]
#[non_exhaustive]
pub enum DataloaderError {
    /// Dataloader fiber limit is too low ({limit}), it must be at least 3
    FiberLimitTooLow { limit: usize },

    /// `nonblocking: true` requires an async runtime, run the dataloader from within a tokio runtime
    NonblockingWithoutRuntime,

    /// Invariant: {count} {queue}
    Invariant { count: usize, queue: &'static str },

    /// {source_name}#fetch returned {values} values for {keys} keys
    MissingValues {
        source_name: String,
        keys: usize,
        values: usize,
    },

    /// Dataloader stalled with {workers} suspended workers and nothing left to run
    Stalled { workers: usize },

    /// job failed: {0}
    Job(Arc<BoxError>),
}

impl DataloaderError {
    pub(crate) fn job(error: impl Into<BoxError>) -> Self {
        DataloaderError::Job(Arc::new(error.into()))
    }
}

/// Errors which abort execution of a whole multiplex.
#[derive(Error, Display, Debug, Clone)]
#[non_exhaustive]
pub enum ExecutionError {
    /// {0}
    Dataloader(#[from] DataloaderError),

    /// resolver for {type_name}.{field} returned {actual} results for {expected} objects
    ResolverResultCount {
        type_name: String,
        field: String,
        expected: usize,
        actual: usize,
    },

    /// no field {type_name}.{field} to execute
    UnknownField { type_name: String, field: String },

    /// abstract type {0} has no registered resolve_type hook
    MissingTypeResolver(String),

    /// resolve_type for {abstract_type} returned {runtime_type}, which is not one of its possible types
    InvalidRuntimeType {
        abstract_type: String,
        runtime_type: String,
    },

    /// fragment resolution exceeded {limit} iterations
    FragmentIterationCap { limit: usize },
}

impl ExecutionError {
    /// Unwraps execution errors raised inside dataloader jobs.
    pub(crate) fn from_dataloader(error: DataloaderError) -> Self {
        if let DataloaderError::Job(cause) = &error
            && let Some(execution_error) = (**cause).downcast_ref::<ExecutionError>()
        {
            return execution_error.clone();
        }
        ExecutionError::Dataloader(error)
    }
}

/// The schema could not be assembled.
#[derive(Error, Display, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SchemaError {
    /// schema parsing or validation failed: {0}
    Invalid(String),

    /// no type named '{0}' in the schema
    UnknownType(String),

    /// no field '{type_name}.{field}' in the schema
    UnknownField { type_name: String, field: String },

    /// '{0}' is not an abstract type
    NotAbstract(String),
}
