//! Extension manifests registered at runtime.
//!
//! An extension is a directory holding a `manifest.json`. The daemon only
//! records the manifest; running extension code is left to clients.

use std::path::{Path, PathBuf};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{Error, Result};

/// File name looked up inside an extension directory.
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Deserialize)]
struct Manifest {
    name: String,
    #[serde(default)]
    version: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    entrypoint: Option<String>,
}

/// A registered extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extension {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<String>,
    /// Directory the manifest was loaded from.
    pub path: String,
}

/// Identifier derived from the manifest name: lowercase ASCII alphanumerics and dashes.
pub fn extension_id(name: &str) -> String {
    let mut id = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            id.push(c.to_ascii_lowercase());
        } else if !id.ends_with('-') && !id.is_empty() {
            id.push('-');
        }
    }
    while id.ends_with('-') {
        id.pop();
    }
    id
}

#[derive(Default)]
pub struct ExtensionRegistry {
    extensions: DashMap<String, Extension>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the manifest at `path` (a directory or the manifest file itself).
    ///
    /// Loading the same extension again replaces the earlier registration.
    pub async fn load(&self, path: &Path) -> Result<Extension> {
        let (dir, manifest_path) = if path.is_dir() {
            (path.to_path_buf(), path.join(MANIFEST_FILE))
        } else {
            let dir = path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            (dir, path.to_path_buf())
        };

        let raw = tokio::fs::read_to_string(&manifest_path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    Error::not_found("Extension manifest", manifest_path.display().to_string())
                }
                _ => Error::Io(e),
            })?;
        let manifest: Manifest = serde_json::from_str(&raw).map_err(|e| {
            Error::validation(format!("invalid manifest {}: {e}", manifest_path.display()))
        })?;

        let id = extension_id(&manifest.name);
        if id.is_empty() {
            return Err(Error::validation(format!(
                "manifest {} has no usable name",
                manifest_path.display()
            )));
        }

        let extension = Extension {
            id: id.clone(),
            name: manifest.name,
            version: manifest.version,
            description: manifest.description,
            entrypoint: manifest.entrypoint,
            path: dir.to_string_lossy().into_owned(),
        };
        info!(id = %extension.id, version = %extension.version, "Extension loaded");
        self.extensions.insert(id, extension.clone());
        Ok(extension)
    }

    pub fn get(&self, id: &str) -> Result<Extension> {
        self.extensions
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::not_found("Extension", id))
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }
}
