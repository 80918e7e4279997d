//! `download`: start a new transfer.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;
use url::Url;

use crate::api::reporter::{EventReporter, SessionSink};
use crate::api::SessionApi;
use crate::catalog::{AddDownloadOptions, Headers};
use crate::server::pool::Connection;
use crate::server::protocol::{DownloadParams, DownloadResponse};
use crate::transfer::{Transfer, TransferRequest};
use crate::{Error, Result};

/// Accept only absolute http(s) URLs with a host.
pub(crate) fn validate_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim()).map_err(|e| Error::validation(format!("invalid url {raw:?}: {e}")))?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some_and(|h| !h.is_empty()) => Ok(url),
        "http" | "https" => Err(Error::validation(format!("url {raw:?} has no host"))),
        scheme => Err(Error::validation(format!("unsupported url scheme {scheme:?}"))),
    }
}

fn download_response(transfer: &dyn Transfer) -> DownloadResponse {
    DownloadResponse {
        download_id: transfer.hash().to_string(),
        file_name: transfer.file_name().to_string(),
        save_path: transfer.save_path().to_string_lossy().into_owned(),
        directory: transfer.download_directory().to_string_lossy().into_owned(),
        content_length: transfer.content_length(),
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

impl SessionApi {
    pub async fn download(&self, conn: Connection, params: DownloadParams) -> Result<DownloadResponse> {
        let url = validate_url(&params.url)?;
        let hash = self.manager.new_hash();

        let directory = match non_empty(params.directory) {
            Some(dir) => PathBuf::from(dir),
            None => self.defaults.download_dir.clone(),
        };
        let headers: Headers = params
            .headers
            .into_iter()
            .map(|h| (h.key, h.value))
            .collect();
        let options = self.defaults.options.clone().with_overrides(
            params.max_connections,
            params.max_segments,
            params.force_parts,
        );

        let request = TransferRequest {
            hash: hash.clone(),
            url: url.to_string(),
            file_name: non_empty(params.file_name),
            directory: directory.clone(),
            headers: headers.clone(),
            options,
        };
        let add = AddDownloadOptions {
            url: url.to_string(),
            headers,
            child_hash: non_empty(params.child_hash),
            hidden: params.is_hidden,
            children: params.is_children,
            download_location: directory,
        };

        if add.child_hash.is_some() {
            let transfer = self.coordinator.start_pair(&conn, request, add).await?;
            return Ok(download_response(transfer.as_ref()));
        }

        let slot = self.active.reserve(&hash)?;
        let reporter = Arc::new(EventReporter::new(hash.as_str(), Arc::clone(&self.pool)));
        let sink = Arc::new(SessionSink::new(
            Arc::clone(&reporter),
            Arc::clone(&self.manager),
        ));
        let transfer = self.engine.create(request, Arc::clone(&sink) as _).await?;
        self.manager.add_download(transfer.as_ref(), add).await?;
        let response = download_response(transfer.as_ref());

        if params.is_children {
            info!(hash = %hash, "Child stream registered; it starts with its primary");
            return Ok(response);
        }

        self.pool.add_download(&hash, &conn);
        self.launch(slot, transfer, reporter, sink);
        info!(hash = %hash, url = %url, "Download started");
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_url() {
        assert!(validate_url("https://example.com/a.mp4").is_ok());
        assert!(validate_url("  http://127.0.0.1:8080/x ").is_ok());
        assert_eq!(
            validate_url("ftp://example.com/a").unwrap_err().code(),
            "VALIDATION_ERROR"
        );
        assert!(validate_url("not a url").is_err());
        assert!(validate_url("").is_err());
    }

    #[test]
    fn test_non_empty() {
        assert_eq!(non_empty("  ".into()), None);
        assert_eq!(non_empty(" a ".into()), Some("a".into()));
    }
}
