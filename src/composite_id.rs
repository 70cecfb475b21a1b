//! Composite identifiers for providers that address hosts by several keys.
//!
//! Fields are joined with `|` in a fixed, provider-defined order, for example
//! `instance|zone|project` for GCE or `resource-group|deployment` for Azure.

use thiserror::Error;

/// Separator between composite identifier fields.
pub const DELIMITER: char = '|';

/// Errors raised while encoding or decoding composite identifiers.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CompositeIdError {
    /// Raised when a field contains the delimiter.
    #[error("composite id field {index} contains the reserved delimiter '|'")]
    ReservedDelimiter {
        /// Zero-based field position.
        index: usize,
    },
    /// Raised when a field is empty.
    #[error("composite id field {index} is empty")]
    EmptyField {
        /// Zero-based field position.
        index: usize,
    },
    /// Raised when an identifier does not split into the expected field count.
    #[error("composite id '{id}' has {found} fields, expected {expected}")]
    Arity {
        /// Identifier as supplied.
        id: String,
        /// Field count required by the provider.
        expected: usize,
        /// Field count present in the identifier.
        found: usize,
    },
}

/// Joins `fields` into a composite identifier.
///
/// # Errors
///
/// Returns [`CompositeIdError`] when a field is empty or contains `|`.
pub fn encode(fields: &[&str]) -> Result<String, CompositeIdError> {
    for (index, field) in fields.iter().enumerate() {
        if field.is_empty() {
            return Err(CompositeIdError::EmptyField { index });
        }
        if field.contains(DELIMITER) {
            return Err(CompositeIdError::ReservedDelimiter { index });
        }
    }
    Ok(fields.join("|"))
}

/// Splits `id` into exactly `N` fields.
///
/// # Errors
///
/// Returns [`CompositeIdError::Arity`] when the field count differs from `N`
/// and [`CompositeIdError::EmptyField`] when any field is blank.
pub fn decode<const N: usize>(id: &str) -> Result<[String; N], CompositeIdError> {
    let fields: Vec<String> = id.split(DELIMITER).map(str::to_owned).collect();
    let found = fields.len();
    let decoded = <[String; N]>::try_from(fields).map_err(|_| CompositeIdError::Arity {
        id: id.to_owned(),
        expected: N,
        found,
    })?;
    if let Some(index) = decoded.iter().position(String::is_empty) {
        return Err(CompositeIdError::EmptyField { index });
    }
    Ok(decoded)
}
