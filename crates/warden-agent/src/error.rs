use std::path::Path;

use warden_process::ProcessError;

const MAX_MESSAGE_BYTES: usize = 32 * 1024;
const MAX_HINT_BYTES: usize = 8 * 1024;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },
    #[error("{what} already exists: {id}")]
    AlreadyExists { what: &'static str, id: String },
    #[error("{0}")]
    InvalidState(String),
    #[error("{0}")]
    Validation(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{context}: {source}")]
    Archive {
        context: String,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("{context}: {source}")]
    Http {
        context: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{0}")]
    Timeout(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Coarse classification a transport layer maps to its own status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidState,
    Validation,
    IoFailure,
    Timeout,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::Validation => "validation",
            ErrorKind::IoFailure => "io_failure",
            ErrorKind::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl Error {
    pub fn not_found(what: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { what, id: id.into() }
    }

    pub fn already_exists(what: &'static str, id: impl Into<String>) -> Self {
        Self::AlreadyExists { what, id: id.into() }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn io_at(op: &str, path: &Path, source: std::io::Error) -> Self {
        Self::io(format!("{op} {}", path.display()), source)
    }

    pub fn archive(context: impl Into<String>, source: zip::result::ZipError) -> Self {
        Self::Archive {
            context: context.into(),
            source,
        }
    }

    pub fn http(context: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Http {
            context: context.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Error::InvalidState(_) => ErrorKind::InvalidState,
            Error::Validation(_) => ErrorKind::Validation,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Io { .. } | Error::Archive { .. } | Error::Http { .. } | Error::Internal(_) => {
                ErrorKind::IoFailure
            }
        }
    }

    fn hint(&self) -> Option<&'static str> {
        match self {
            Error::InvalidState(_) => Some("Check whether the server is running and retry."),
            Error::Http { .. } => Some("Check network access to the distribution site."),
            Error::Timeout(_) => Some("The process may need to be stopped manually."),
            _ => None,
        }
    }

    pub fn payload(&self) -> ErrorPayload {
        ErrorPayload {
            code: self.kind().code().to_string(),
            message: truncate_utf8(&format!("{self:#}"), MAX_MESSAGE_BYTES),
            hint: self.hint().map(|h| truncate_utf8(h, MAX_HINT_BYTES)),
        }
    }
}

impl From<ProcessError> for Error {
    fn from(e: ProcessError) -> Self {
        match e {
            ProcessError::AlreadyRunning | ProcessError::NotRunning => {
                Error::InvalidState(e.to_string())
            }
            ProcessError::NotInstalled(_) => Error::InvalidState(e.to_string()),
            ProcessError::InvalidArgument(msg) => Error::Validation(msg),
            ProcessError::Timeout { .. } => Error::Timeout(e.to_string()),
            ProcessError::Io { context, source } => Error::Io { context, source },
            ProcessError::Spawn(source) => Error::io("spawn server process", source),
            ProcessError::NoConsole(_) | ProcessError::Os(_) => {
                Error::Internal(anyhow::Error::new(e))
            }
        }
    }
}

pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_truncates_message() {
        let err = Error::Validation("a".repeat(MAX_MESSAGE_BYTES + 1024));
        let p = err.payload();
        assert_eq!(p.code, "validation");
        assert!(p.message.len() <= MAX_MESSAGE_BYTES);
        assert!(p.message.ends_with("…(truncated)"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "é".repeat(100);
        let out = truncate_utf8(&s, 31);
        assert!(out.ends_with("…(truncated)"));
        assert!(out.len() <= 31);
    }

    #[test]
    fn process_states_map_to_invalid_state() {
        assert_eq!(
            Error::from(ProcessError::AlreadyRunning).kind(),
            ErrorKind::InvalidState
        );
        assert_eq!(
            Error::from(ProcessError::NotRunning).kind(),
            ErrorKind::InvalidState
        );
        assert_eq!(
            Error::from(ProcessError::InvalidArgument("n".into())).kind(),
            ErrorKind::Validation
        );
    }

    #[test]
    fn payload_serializes_without_empty_hint() {
        let v = serde_json::to_value(Error::not_found("server", "42").payload()).unwrap();
        assert_eq!(v["code"], "not_found");
        assert_eq!(v["message"], "server not found: 42");
        assert!(v.get("hint").is_none());
    }
}
