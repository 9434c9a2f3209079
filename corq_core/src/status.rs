//! The application-layer result of an RPC: a code and a message.
//!
//! The runtime itself never interprets a status beyond the retry loop
//! checking for [`StatusCode::Unavailable`]. Everything else is written into
//! user-provided buffers by finish-style operations and read back by user
//! code. Transport-level success is a separate channel entirely (the ok-bit
//! returned by every operation awaiter).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Error categories consumed or passed through by the runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    Ok,
    Cancelled,
    Unknown,
    NotFound,
    FailedPrecondition,
    Internal,
    Unavailable,
}

impl StatusCode {
    /// Short name for logging.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::Cancelled => "CANCELLED",
            StatusCode::Unknown => "UNKNOWN",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::FailedPrecondition => "FAILED_PRECONDITION",
            StatusCode::Internal => "INTERNAL",
            StatusCode::Unavailable => "UNAVAILABLE",
        }
    }
}

/// A code-and-message pair delivered by finish operations.
///
/// The default value is an OK status, so a freshly declared buffer can be
/// passed straight into a finish awaiter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    code: StatusCode,
    message: String,
}

impl Status {
    #[must_use]
    pub fn ok() -> Self {
        Status {
            code: StatusCode::Ok,
            message: String::new(),
        }
    }

    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Status {
            code,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn code(&self) -> StatusCode {
        self.code
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::ok()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code.name())
        } else {
            write!(f, "{}: {}", self.code.name(), self.message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_status_is_ok() {
        let status = Status::default();
        assert!(status.is_ok());
        assert_eq!(status.code(), StatusCode::Ok);
    }

    #[test]
    fn code_names_are_short_constants() {
        assert_eq!(StatusCode::Unavailable.name(), "UNAVAILABLE");
        assert_eq!(StatusCode::FailedPrecondition.name(), "FAILED_PRECONDITION");
    }

    #[test]
    fn display_includes_message_when_present() {
        let status = Status::new(StatusCode::NotFound, "no such variable");
        assert_eq!(status.to_string(), "NOT_FOUND: no such variable");
        assert_eq!(Status::ok().to_string(), "OK");
    }
}
