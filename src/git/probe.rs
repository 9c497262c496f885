use tracing::debug;

/// Outcome of a best-effort git query.
///
/// Queries never fail the caller. They either produce a value, report that
/// the fact does not exist in this repository (`NotApplicable`, e.g. a
/// detached HEAD has no branch), or carry the reason the lookup broke.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe<T> {
    Value(T),
    NotApplicable,
    Failed(String),
}

impl<T> Probe<T> {
    /// The value, if the query produced one.
    pub fn value(self) -> Option<T> {
        match self {
            Probe::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Collapse to a plain value, using `default` for both non-value cases.
    pub fn value_or(self, default: T) -> T {
        self.value().unwrap_or(default)
    }

    /// Human-readable reason for a missing value, used in error messages.
    pub fn describe(&self) -> String {
        match self {
            Probe::Value(_) => "resolved".to_string(),
            Probe::NotApplicable => "not available".to_string(),
            Probe::Failed(e) => format!("query failed: {}", e),
        }
    }

    /// Convert a `git2` result. `NotFound` maps to `NotApplicable`, everything
    /// else that fails is logged and kept as `Failed`.
    pub(crate) fn from_git(what: &str, res: Result<T, git2::Error>) -> Self {
        match res {
            Ok(v) => Probe::Value(v),
            Err(e) if e.code() == git2::ErrorCode::NotFound => {
                debug!(query = what, "git: not found: {}", e.message());
                Probe::NotApplicable
            }
            Err(e) => {
                debug!(query = what, "git query failed: {}", e.message());
                Probe::Failed(e.message().to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_or_uses_default_for_both_missing_cases() {
        assert!(Probe::Value(true).value_or(false));
        assert!(!Probe::<bool>::NotApplicable.value_or(false));
        assert!(!Probe::<bool>::Failed("boom".into()).value_or(false));
    }

    #[test]
    fn from_git_distinguishes_not_found() {
        let nf = git2::Error::new(
            git2::ErrorCode::NotFound,
            git2::ErrorClass::Reference,
            "no such ref",
        );
        let other = git2::Error::from_str("corrupt");
        assert_eq!(
            Probe::<u8>::from_git("ref", Err(nf)),
            Probe::NotApplicable
        );
        assert_eq!(
            Probe::<u8>::from_git("ref", Err(other)),
            Probe::Failed("corrupt".into())
        );
    }
}
