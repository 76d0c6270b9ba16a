//! Error classification for job execution.
//!
//! Operations return a single [`JobError`]. Three kinds are distinguished:
//! hard errors (anything unexpected), *acceptable* errors (the destination
//! already exists under `IfNotExists` -- counted separately and rendered with
//! an `OK?` status), and interruption by the cancellation token.

use thiserror::Error;

/// A non-fatal outcome. The job is counted as an acceptable failure and the
/// success path is taken for notification and successor scheduling.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct AcceptableError {
    reason: &'static str,
}

impl AcceptableError {
    /// The destination file already exists and `IfNotExists` is set.
    pub fn file_exists() -> Self {
        Self {
            reason: "File already exists",
        }
    }

    /// The destination object already exists and `IfNotExists` is set.
    pub fn object_exists() -> Self {
        Self {
            reason: "Object already exists",
        }
    }

    pub fn reason(&self) -> &str {
        self.reason
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Acceptable(#[from] AcceptableError),

    /// The cancellation context won the race against an in-flight operation.
    #[error("interrupted")]
    Interrupted,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl JobError {
    pub fn is_acceptable(&self) -> bool {
        matches!(self, JobError::Acceptable(_))
    }

    pub fn acceptable(&self) -> Option<&AcceptableError> {
        match self {
            JobError::Acceptable(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for JobError {
    fn from(err: std::io::Error) -> Self {
        JobError::Other(err.into())
    }
}

/// Strips transport-client noise from an error string before display: tabs
/// and newlines are collapsed to single spaces and the trailing
/// `status code: ...` tail some SDK errors append is cut off.
pub fn cleanup_error(err: &JobError) -> String {
    let raw = format!("{:#}", err);
    let mut flat = String::with_capacity(raw.len());
    let mut last_was_space = false;
    for c in raw.chars() {
        if c == '\n' || c == '\t' || c == ' ' {
            if !last_was_space {
                flat.push(' ');
            }
            last_was_space = true;
        } else {
            flat.push(c);
            last_was_space = false;
        }
    }
    let flat = match flat.find(" status code:") {
        Some(idx) => flat[..idx].trim_end_matches(&[' ', ','][..]).to_string(),
        None => flat,
    };
    flat.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acceptable_classification() {
        let err: JobError = AcceptableError::object_exists().into();
        assert!(err.is_acceptable());
        assert_eq!(err.acceptable().unwrap().reason(), "Object already exists");
        let hard: JobError = anyhow::anyhow!("boom").into();
        assert!(!hard.is_acceptable());
        assert!(!JobError::Interrupted.is_acceptable());
    }

    #[test]
    fn cleanup_flattens_noise() {
        let err: JobError = anyhow::anyhow!("AccessDenied: denied\n\tstatus code: 403, request id: X").into();
        assert_eq!(cleanup_error(&err), "AccessDenied: denied");
        let plain: JobError = anyhow::anyhow!("simple failure").into();
        assert_eq!(cleanup_error(&plain), "simple failure");
    }
}
