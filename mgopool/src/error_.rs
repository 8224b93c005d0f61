// Copyright Rouven Bauer
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt::{Display, Formatter};

use thiserror::Error;

use crate::backend::BoxError;
use crate::classify::Classification;

// imports for docs
#[allow(unused)]
use crate::config::DbInfo;
#[allow(unused)]
use crate::pool::Pool;

/// Stable, driver independent identifier of a failure class.
///
/// The numeric value ([`ErrorCode::as_u16()`]) and the name ([`ErrorCode::as_str()`]) are
/// part of the API and will not change between releases.
/// Layers above the pool (e.g., HTTP handlers) are expected to map these codes to their own
/// status representation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u16)]
pub enum ErrorCode {
    /// No rule matched the driver's error.
    Unknown = 0,
    /// The connection or the whole topology was lost.
    ConnectFailure = 1,
    NotFound = 2,
    CollectionNotFound = 3,
    /// Duplicate key.
    DocumentConflict = 4,
    CollectionConflict = 5,
    /// The caller's deadline passed or an I/O operation timed out.
    Timeout = 6,
    QueryInputArray = 7,
    UpdateInputArray = 8,
    BadUpdateOperatorUsage = 9,
    RegexString = 10,
    DotField = 11,
    StringIndexTooLong = 12,
    /// The pool was shut down.
    PoolClosed = 13,
    /// The pool was given a [`DbInfo`] it cannot work with.
    InvalidConfig = 14,
}

impl ErrorCode {
    pub fn as_u16(&self) -> u16 {
        *self as u16
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Unknown => "Unknown",
            ErrorCode::ConnectFailure => "ConnectFailure",
            ErrorCode::NotFound => "NotFound",
            ErrorCode::CollectionNotFound => "CollectionNotFound",
            ErrorCode::DocumentConflict => "DocumentConflict",
            ErrorCode::CollectionConflict => "CollectionConflict",
            ErrorCode::Timeout => "Timeout",
            ErrorCode::QueryInputArray => "QueryInputArray",
            ErrorCode::UpdateInputArray => "UpdateInputArray",
            ErrorCode::BadUpdateOperatorUsage => "BadUpdateOperatorUsage",
            ErrorCode::RegexString => "RegexString",
            ErrorCode::DotField => "DotField",
            ErrorCode::StringIndexTooLong => "StringIndexTooLong",
            ErrorCode::PoolClosed => "PoolClosed",
            ErrorCode::InvalidConfig => "InvalidConfig",
        }
    }

    /// Whether a caller may reasonably retry the failed work.
    ///
    /// Only transport level failures qualify.
    /// All other codes describe a problem with the request itself or a pool shutdown.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCode::ConnectFailure | ErrorCode::Timeout)
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
/// Errors returned by the [`Pool`].
///
/// **Important Notes on Usage:**
///  * Error messages are *not* considered part of the API.
///    They may change at any time and don't follow semantic versioning.
///  * Use [`PoolError::code()`] to make decisions based on errors.
pub enum PoolError {
    /// A driver operation failed and was classified.
    ///
    /// The message is the raw driver error text.
    #[error("{code}: {message}")]
    #[non_exhaustive]
    Classified { code: ErrorCode, message: String },

    /// Used when discovering the topology failed on every attempt.
    #[error("connection failed: {message}{}",
            source.as_ref().map(|err| format!(" caused by: {err}")).unwrap_or_default())]
    #[non_exhaustive]
    Disconnect {
        message: String,
        source: Option<BoxError>,
    },

    /// Used when waiting for a session exceeded the caller's deadline or the caller cancelled.
    #[error("{message}")]
    #[non_exhaustive]
    Timeout { message: String },

    /// The pool is closed (or currently closing) and hands out no more sessions.
    #[error("session pool is closed")]
    PoolClosed,

    /// Used when the pool was given an unusable [`DbInfo`].
    #[error("invalid configuration: {message}")]
    #[non_exhaustive]
    InvalidConfig { message: String },
}

impl PoolError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PoolError::Classified { code, .. } => *code,
            PoolError::Disconnect { .. } => ErrorCode::ConnectFailure,
            PoolError::Timeout { .. } => ErrorCode::Timeout,
            PoolError::PoolClosed => ErrorCode::PoolClosed,
            PoolError::InvalidConfig { .. } => ErrorCode::InvalidConfig,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }

    pub(crate) fn classified(classification: Classification, message: String) -> Self {
        Self::Classified {
            code: classification.code,
            message,
        }
    }

    pub(crate) fn discovery_error(err: BoxError) -> Self {
        Self::Disconnect {
            message: String::from("failed to discover topology"),
            source: Some(err),
        }
    }

    pub(crate) fn acquisition_timeout<S: AsRef<str>>(during: S) -> Self {
        Self::Timeout {
            message: format!("session acquisition timed out while {}", during.as_ref()),
        }
    }

    pub(crate) fn acquisition_cancelled() -> Self {
        Self::Timeout {
            message: String::from("session acquisition cancelled by caller"),
        }
    }

    pub(crate) fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[rstest]
    #[case(ErrorCode::ConnectFailure, true)]
    #[case(ErrorCode::Timeout, true)]
    #[case(ErrorCode::PoolClosed, false)]
    #[case(ErrorCode::DocumentConflict, false)]
    #[case(ErrorCode::Unknown, false)]
    fn test_retryable_codes(#[case] code: ErrorCode, #[case] retryable: bool) {
        assert_eq!(code.is_retryable(), retryable);
    }

    #[rstest]
    fn test_error_codes() {
        assert_eq!(PoolError::PoolClosed.code(), ErrorCode::PoolClosed);
        assert_eq!(
            PoolError::acquisition_timeout("waiting").code(),
            ErrorCode::Timeout
        );
        assert_eq!(
            PoolError::acquisition_cancelled().code(),
            ErrorCode::Timeout
        );
        assert_eq!(
            PoolError::discovery_error("refused".into()).code(),
            ErrorCode::ConnectFailure
        );
        assert_eq!(
            PoolError::invalid_config("nope").code(),
            ErrorCode::InvalidConfig
        );
    }

    #[rstest]
    fn test_disconnect_display_includes_source() {
        let err = PoolError::discovery_error("connection refused".into());
        assert_eq!(
            err.to_string(),
            "connection failed: failed to discover topology caused by: connection refused"
        );
    }

    #[rstest]
    fn test_stable_numbers() {
        assert_eq!(ErrorCode::Unknown.as_u16(), 0);
        assert_eq!(ErrorCode::PoolClosed.as_u16(), 13);
        assert_eq!(ErrorCode::DocumentConflict.to_string(), "DocumentConflict");
    }
}
