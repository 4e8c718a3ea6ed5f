//! CRD helper errors

use thiserror::Error;

/// Errors raised while interpreting CRD fields
#[derive(Debug, Error)]
pub enum CrdError {
    /// VF range string could not be parsed
    #[error("Invalid VF range: {0}")]
    InvalidVfRange(String),
}
