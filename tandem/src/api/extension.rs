//! `load_extension` and `get_extension`.

use std::path::Path;

use crate::api::SessionApi;
use crate::extension::Extension;
use crate::server::protocol::{GetExtensionParams, LoadExtensionParams};
use crate::{Error, Result};

impl SessionApi {
    pub async fn load_extension(&self, params: LoadExtensionParams) -> Result<Extension> {
        if params.path.trim().is_empty() {
            return Err(Error::validation("extension path is empty"));
        }
        self.extensions.load(Path::new(params.path.trim())).await
    }

    pub fn get_extension(&self, params: GetExtensionParams) -> Result<Extension> {
        self.extensions.get(&params.extension_id)
    }
}
