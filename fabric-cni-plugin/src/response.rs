use std::io::Write;
use std::process::ExitCode;

use fabric_cni_api::cni::v1::{CniCmdResponse, ErrorCode};
use serde::Serialize;

use crate::CNI_VERSION;

pub enum Response {
    /// Raw CNI result JSON from the agent, printed as-is.
    Success(Vec<u8>),
    Error(CniErrorResponse),
    Version(VersionResponse),
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CniErrorResponse {
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
    pub details: String,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct VersionResponse {
    pub cni_version: String,
    pub supported_versions: Vec<String>,
}

impl Response {
    pub fn from_reply(reply: CniCmdResponse) -> Response {
        match reply.error {
            None => Response::Success(reply.cni_result),
            Some(error) => Response::Error(error_to_cni(error)),
        }
    }

    pub fn write_out(self) -> ExitCode {
        let (out, code) = match &self {
            Response::Success(bytes) => (bytes.clone(), ExitCode::SUCCESS),
            Response::Error(error) => match serde_json::to_vec(error) {
                Ok(out) => (out, ExitCode::FAILURE),
                Err(e) => (e.to_string().into_bytes(), ExitCode::FAILURE),
            },
            Response::Version(version) => match serde_json::to_vec(version) {
                Ok(out) => (out, ExitCode::SUCCESS),
                Err(e) => (e.to_string().into_bytes(), ExitCode::FAILURE),
            },
        };
        std::io::stdout()
            .write_all(&out)
            .expect("failed to write response to stdout");
        code
    }
}

/// Maps the agent's typed error onto the CNI error document. Codes
/// below 100 are the well-known CNI codes; the rest are plugin
/// specific.
fn error_to_cni(error: fabric_cni_api::cni::v1::Error) -> CniErrorResponse {
    let code = ErrorCode::try_from(error.code).unwrap_or(ErrorCode::Unknown);
    let (code, msg) = match code {
        ErrorCode::IncompatibleCniVersion => (1, "Incompatible CNI Version"),
        ErrorCode::UnsupportedField => (2, "Unsupported Field"),
        ErrorCode::UnknownContainer => (3, "Unknown Container"),
        ErrorCode::DecodingFailure => (6, "Decoding Failure"),
        ErrorCode::InvalidNetworkConfig => (7, "Invalid Network Config"),
        ErrorCode::TryAgainLater => (11, "Try Again Later"),
        ErrorCode::IpamFailure => (101, "IPAM Failure"),
        ErrorCode::ConfigInterfaceFailure => (102, "Config Interface Failure"),
        ErrorCode::CheckInterfaceFailure => (103, "Check Interface Failure"),
        ErrorCode::Unknown => (100, "Unknown Error"),
    };
    CniErrorResponse {
        cni_version: CNI_VERSION.to_owned(),
        code,
        msg: msg.to_owned(),
        details: error.message,
    }
}
