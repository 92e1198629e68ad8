// ============================================================
// Layer 3 — Error Taxonomy
// ============================================================
// Three failure classes, none of them retried:
//
//   InvalidInput       — malformed batch (zero-length sentence,
//                        mismatched feature or label counts)
//   NumericDivergence  — loss exploded or became non-finite;
//                        fatal for the whole run
//   Configuration      — contradictory or unknown options,
//                        raised before any batch is processed
//
// Upper layers work with anyhow::Result; a TaggerError
// converts into anyhow::Error through `?`.

use thiserror::Error;

/// Result alias for the tagging core.
pub type TaggerResult<T> = std::result::Result<T, TaggerError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaggerError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("numeric divergence: {0}")]
    NumericDivergence(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl TaggerError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        TaggerError::InvalidInput(msg.into())
    }

    pub fn divergence(msg: impl Into<String>) -> Self {
        TaggerError::NumericDivergence(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        TaggerError::Configuration(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_class() {
        let e = TaggerError::invalid_input("sentence 2 has length 0");
        assert_eq!(e.to_string(), "invalid input: sentence 2 has length 0");

        let e = TaggerError::configuration("threshold and topk are exclusive");
        assert!(e.to_string().starts_with("configuration error"));
    }

    #[test]
    fn test_converts_into_anyhow() {
        fn fails() -> anyhow::Result<()> {
            Err(TaggerError::divergence("loss is NaN"))?;
            Ok(())
        }
        let err = fails().unwrap_err();
        assert_eq!(
            err.downcast_ref::<TaggerError>(),
            Some(&TaggerError::divergence("loss is NaN"))
        );
    }
}
