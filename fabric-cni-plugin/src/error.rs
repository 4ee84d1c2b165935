use thiserror::Error;

use crate::CNI_VERSION;
use crate::response::{CniErrorResponse, Response};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("{0}")]
    Tonic(#[from] tonic::Status),

    #[error("{0}")]
    TonicTransport(#[from] tonic::transport::Error),
}

impl Error {
    pub fn into_response(self) -> Response {
        let (code, msg) = match &self {
            Error::Io(_) => (5, "I/O Error"),
            Error::Json(_) | Error::Parse(_) => (6, "Decoding Failure"),
            // The agent being unreachable is the runtime's cue to retry.
            Error::Tonic(_) | Error::TonicTransport(_) => (11, "Try Again Later"),
        };
        Response::Error(CniErrorResponse {
            cni_version: CNI_VERSION.to_owned(),
            code,
            msg: msg.to_owned(),
            details: self.to_string(),
        })
    }
}
