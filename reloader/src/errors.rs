//! Classification of API failures into the retry classes the pipeline
//! branches on.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Connection resets, timeouts, 429s and 5xx. Retried with backoff.
    Transient,
    /// Optimistic-concurrency conflict. Re-queued a bounded number of times.
    Conflict,
    /// RBAC failures. Retried at long intervals.
    Forbidden,
    /// The object is gone.
    NotFound,
    /// Anything the pipeline cannot recover from by retrying.
    Permanent,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Conflict => "conflict",
            ErrorClass::Forbidden => "forbidden",
            ErrorClass::NotFound => "not_found",
            ErrorClass::Permanent => "permanent",
        }
    }
}

pub fn classify(err: &kube::Error) -> ErrorClass {
    match err {
        kube::Error::Api(resp) => classify_status(resp.code),
        // Everything reaching us outside an API status is connection-level;
        // bounded retries keep a genuinely broken environment from looping
        // forever.
        _ => ErrorClass::Transient,
    }
}

pub fn classify_status(code: u16) -> ErrorClass {
    match code {
        404 | 410 => ErrorClass::NotFound,
        409 => ErrorClass::Conflict,
        401 | 403 => ErrorClass::Forbidden,
        408 | 429 => ErrorClass::Transient,
        code if code >= 500 => ErrorClass::Transient,
        _ => ErrorClass::Permanent,
    }
}

/// Failure applying a mutation to a single workload.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// The workload disappeared between listing and writing.
    #[error("workload is gone")]
    Gone,
    /// The requested mutation does not exist for this kind.
    #[error("{0}")]
    Unsupported(String),
    #[error(transparent)]
    Api(#[from] kube::Error),
}

impl ApplyError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ApplyError::Gone => ErrorClass::NotFound,
            ApplyError::Unsupported(_) => ErrorClass::Permanent,
            ApplyError::Api(err) => classify(err),
        }
    }
}
