use thiserror::Error;

use crate::buffer::PageId;

pub type LatchTreeResult<T, E = LatchTreeError> = Result<T, E>;

#[derive(Debug, Error)]
pub enum LatchTreeError {
    #[error("Entry too large: {size} bytes exceeds the {max} byte limit")]
    EntryTooLarge { size: usize, max: usize },

    #[error("Duplicate key")]
    DuplicateKey,

    #[error("Cursor is unpositioned")]
    Unpositioned,

    #[error("Split invariant violation: {0}")]
    SplitInvariantViolation(String),

    #[error("Page not found: {0}")]
    PageNotFound(PageId),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::LatchTreeError;

    #[test]
    fn test_error_display() {
        let err = LatchTreeError::EntryTooLarge {
            size: 2000,
            max: 1024,
        };
        assert_eq!(
            err.to_string(),
            "Entry too large: 2000 bytes exceeds the 1024 byte limit"
        );
        assert_eq!(LatchTreeError::PageNotFound(7).to_string(), "Page not found: 7");
        assert_eq!(
            LatchTreeError::Unpositioned.to_string(),
            "Cursor is unpositioned"
        );
    }
}
