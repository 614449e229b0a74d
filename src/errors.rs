//! Error kinds, one enum per failure surface, following the teacher's
//! pattern of a `thiserror::Error` per runtime module rather than one
//! crate-wide error type.

use thiserror::Error;

/// §4.1 / §7 — the JSON body did not match the timer schema.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimerParseError {
    #[error("timing.interval must be a non-negative integer")]
    BadInterval,
    #[error("timing.repeat-for must be a non-negative integer")]
    BadRepeatFor,
    #[error("callback.http.uri is required and must be a string")]
    MissingUri,
    #[error("callback.http.opaque is required and must be a string")]
    MissingOpaque,
    #[error("reliability.replication-factor must be an integer")]
    BadReplicationFactor,
    #[error("reliability.replicas must be an array of strings")]
    BadReplicas,
    #[error("request body is not valid JSON: {0}")]
    InvalidJson(String),
}

/// §7 — surfaced to an HTTP client as 4xx with a short message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("malformed request body: {0}")]
    MalformedBody(#[from] TimerParseError),
    #[error("not a replica for this timer")]
    NotAReplica,
    #[error("{0}")]
    BadHex(String),
}

impl ApiError {
    pub fn status(&self) -> warp::http::StatusCode {
        use warp::http::StatusCode;
        match self {
            ApiError::MalformedBody(_) => StatusCode::BAD_REQUEST,
            ApiError::NotAReplica => StatusCode::BAD_REQUEST,
            ApiError::BadHex(_) => StatusCode::BAD_REQUEST,
        }
    }
}

/// §4.3 / §7 — a best-effort replication PUT to a peer failed. Never
/// surfaced to the originating client; logged and counted only.
#[derive(Error, Debug)]
pub enum ReplicationError {
    #[error("replication: transport error contacting {addr}: {source}")]
    Transport {
        addr: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("replication: {addr} rejected the timer with status {status}")]
    BadStatus { addr: String, status: u16 },
}

/// §4.4 / §7 — a callback POST either failed transport or returned a
/// non-2xx status. Both count the pop as having happened.
#[derive(Error, Debug)]
pub enum CallbackError {
    #[error("callback transport failure for timer {id}: {source}")]
    Transport {
        id: u64,
        #[source]
        source: reqwest::Error,
    },
    #[error("callback for timer {id} got non-2xx status {status}")]
    BadStatus { id: u64, status: u16 },
}
