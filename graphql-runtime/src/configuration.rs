//! Engine configuration.
//!
//! Can be created through `serde::Deserialize` from various formats, most commonly YAML:
//!
//! ```yaml
//! limits:
//!   max_complexity: 200
//!   max_depth: 12
//! dataloader:
//!   fiber_limit: 16
//! ```
use std::str::FromStr;

use displaydoc::Display;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Minimum number of workers a dataloader needs: one for jobs, two for sources.
pub(crate) const MIN_FIBER_LIMIT: usize = 3;

#[derive(Debug, Error, Display)]
#[non_exhaustive]
pub enum ConfigurationError {
    /// could not deserialize configuration: {0}
    DeserializeConfigError(#[from] serde_yaml::Error),
    /// {message}: {error}
    InvalidConfiguration {
        message: &'static str,
        error: String,
    },
}

/// The configuration of the engine.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct Configuration {
    /// Limits checked by static analysis before execution.
    pub limits: Limits,

    /// Settings of the cooperative scheduler.
    pub dataloader: DataloaderConfig,

    /// Execution strategy settings.
    pub execution: ExecutionConfig,
}

/// Operation limits.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct Limits {
    /// Reject operations whose complexity is above this value.
    pub max_complexity: Option<u64>,

    /// Reject operations whose depth is above this value.
    pub max_depth: Option<usize>,

    /// Count `__typename`, `__schema` and friends when computing depth.
    pub count_introspection_fields: bool,

    /// Log exceeded limits instead of rejecting the operation.
    pub warn_only: bool,
}

/// Dataloader settings.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct DataloaderConfig {
    /// Maximum number of concurrently suspended workers, at least 3. Unbounded when absent.
    pub fiber_limit: Option<usize>,

    /// Poll workers with the waker of the surrounding async runtime, so sources may await I/O.
    pub nonblocking: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct ExecutionConfig {
    /// Write `Resolved::Raw` results verbatim, without completing them against the schema.
    pub raw_value: bool,
}

impl Configuration {
    pub fn validate(self) -> Result<Self, ConfigurationError> {
        if let Some(limit) = self.dataloader.fiber_limit {
            if limit < MIN_FIBER_LIMIT {
                return Err(ConfigurationError::InvalidConfiguration {
                    message: "dataloader.fiber_limit is too low",
                    error: format!("{limit} is below the minimum of {MIN_FIBER_LIMIT}"),
                });
            }
        }
        Ok(self)
    }
}

impl FromStr for Configuration {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let configuration: Configuration = serde_yaml::from_str(s)?;
        configuration.validate()
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_yaml_configuration() {
        let configuration: Configuration = r#"
limits:
  max_complexity: 100
  max_depth: 8
dataloader:
  fiber_limit: 10
  nonblocking: true
"#
        .parse()
        .unwrap();
        assert_eq!(configuration.limits.max_complexity, Some(100));
        assert_eq!(configuration.limits.max_depth, Some(8));
        assert!(!configuration.limits.warn_only);
        assert_eq!(configuration.dataloader.fiber_limit, Some(10));
        assert!(configuration.dataloader.nonblocking);
        assert!(!configuration.execution.raw_value);
    }

    #[test]
    fn test_empty_configuration_is_default() {
        let configuration: Configuration = "{}".parse().unwrap();
        assert_eq!(configuration, Configuration::default());
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let error = "limits:\n  max_height: 3\n".parse::<Configuration>().unwrap_err();
        assert!(matches!(
            error,
            ConfigurationError::DeserializeConfigError(_)
        ));
    }

    #[test]
    fn test_fiber_limit_too_low() {
        let error = "dataloader:\n  fiber_limit: 2\n"
            .parse::<Configuration>()
            .unwrap_err();
        assert_snapshot!(
            error.to_string(),
            @"dataloader.fiber_limit is too low: 2 is below the minimum of 3"
        );
    }

    #[test]
    fn test_json_schema_lists_sections() {
        let schema = serde_json::to_value(schemars::schema_for!(Configuration)).unwrap();
        let properties = schema["properties"].as_object().unwrap();
        assert!(properties.contains_key("limits"));
        assert!(properties.contains_key("dataloader"));
        assert!(properties.contains_key("execution"));
    }
}
