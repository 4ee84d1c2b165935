use tracing::info;

use crate::response::{Response, VersionResponse};
use crate::{CNI_VERSION, SUPPORTED_CNI_VERSIONS};

pub fn version() -> Response {
    info!("version called");
    Response::Version(VersionResponse {
        cni_version: CNI_VERSION.to_owned(),
        supported_versions: SUPPORTED_CNI_VERSIONS
            .iter()
            .map(|v| v.to_string())
            .collect(),
    })
}
