//! Validation rules for endpoint definitions.
//!
//! Endpoint-level rules run on every definition before it is admitted to a
//! configuration, both at repository load and for every admin mutation.
//! Cross-definition invariants (global listen-path uniqueness, per-group name
//! uniqueness) are enforced by the repository layer with the helpers here.
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::models::EndpointConfig;

static NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9]+(-[A-Za-z0-9]+)*$").expect("valid name pattern"));

const KNOWN_METHODS: [&str; 5] = ["GET", "POST", "PUT", "DELETE", "PATCH"];

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Endpoint '{name}' collides: {message}")]
    Conflict { name: String, message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Endpoint definition validator
pub struct EndpointValidator;

impl EndpointValidator {
    /// Validate a single endpoint definition.
    pub fn validate(endpoint: &EndpointConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if endpoint.name.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "name".to_string(),
            });
        } else if !NAME_PATTERN.is_match(&endpoint.name) {
            errors.push(ValidationError::InvalidField {
                field: format!("name: {}", endpoint.name),
                message: "Names are alphanumeric segments joined by single dashes".to_string(),
            });
        }

        if !endpoint.endpoint.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: format!("endpoint: {}", endpoint.endpoint),
                message: "Listen paths must start with '/'".to_string(),
            });
        }

        if let Err(e) = Self::validate_method(&endpoint.name, &endpoint.method) {
            errors.push(e);
        }

        match endpoint.backend.len() {
            0 => errors.push(ValidationError::MissingField {
                field: format!("endpoint '{}' backend", endpoint.name),
            }),
            1 => {}
            n => {
                if endpoint.is_bypass {
                    errors.push(ValidationError::InvalidField {
                        field: format!("endpoint '{}' backend", endpoint.name),
                        message: format!("Bypass endpoints take exactly one backend, got {n}"),
                    });
                }
                if endpoint.method != "GET" {
                    errors.push(ValidationError::InvalidField {
                        field: format!("endpoint '{}' backend", endpoint.name),
                        message: format!(
                            "{} endpoints take exactly one backend, got {n}",
                            endpoint.method
                        ),
                    });
                }
            }
        }

        for (i, backend) in endpoint.backend.iter().enumerate() {
            if !backend.url_pattern.starts_with('/') {
                errors.push(ValidationError::InvalidField {
                    field: format!("endpoint '{}' backend {} url_pattern", endpoint.name, i + 1),
                    message: "URL patterns must start with '/'".to_string(),
                });
            }
            if let Err(e) = Self::validate_method(&endpoint.name, &backend.method) {
                errors.push(e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    fn validate_method(name: &str, method: &str) -> ValidationResult<()> {
        if KNOWN_METHODS.contains(&method) {
            Ok(())
        } else {
            Err(ValidationError::InvalidField {
                field: format!("endpoint '{name}' method: {method}"),
                message: format!("Method must be one of {}", KNOWN_METHODS.join(", ")),
            })
        }
    }

    /// Check a candidate against definitions already admitted to a group.
    ///
    /// Names must be unique within the candidate's own group; listen paths
    /// must be unique across every group.
    pub fn check_duplicates(
        group: &str,
        existing_group: &str,
        existing: &[EndpointConfig],
        candidate: &EndpointConfig,
    ) -> ValidationResult<()> {
        for def in existing {
            if group.eq_ignore_ascii_case(existing_group)
                && def.name.eq_ignore_ascii_case(&candidate.name)
            {
                return Err(ValidationError::Conflict {
                    name: candidate.name.clone(),
                    message: format!("name '{}' already exists in group '{group}'", candidate.name),
                });
            }
            if def.endpoint.eq_ignore_ascii_case(&candidate.endpoint) {
                return Err(ValidationError::Conflict {
                    name: candidate.name.clone(),
                    message: format!(
                        "listen path '{}' already registered (group '{existing_group}')",
                        candidate.endpoint
                    ),
                });
            }
        }
        Ok(())
    }

    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}
