//! Template loading for `Page.reload` expansion.
//!
//! Local files are preferred over downloads:
//!
//! 1. `file://` URLs and absolute paths are read only if they resolve inside
//!    the template directory
//! 2. other URLs are looked up in the template directory by file name
//! 3. if that read fails, the URL is fetched over HTTP
//!
//! URLs come from the remote room, so local reads never leave the template
//! directory. Without one, only HTTP is used.

use std::path::{Path, PathBuf};

use super::BridgeError;
use crate::constants::TEMPLATE_FETCH_TIMEOUT;

/// Resolves template URLs to bytes.
#[derive(Debug, Clone)]
pub struct TemplateLoader {
    template_dir: Option<PathBuf>,
    http: reqwest::Client,
}

impl TemplateLoader {
    /// Create a loader searching `template_dir` before downloading.
    pub fn new(template_dir: Option<PathBuf>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(TEMPLATE_FETCH_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                log::warn!("[Template] Falling back to default HTTP client: {e:#}");
                reqwest::Client::new()
            });
        Self { template_dir, http }
    }

    /// Load the template behind `url`.
    pub async fn load(&self, url: &str) -> Result<Vec<u8>, BridgeError> {
        if let Some(path) = local_only_path(url) {
            return self.read_confined(&path).await;
        }

        if let Some(path) = self.cached_path(url) {
            match self.read_confined(&path).await {
                Ok(bytes) => {
                    log::debug!("[Template] {url} served from {}", path.display());
                    return Ok(bytes);
                }
                Err(e) => log::debug!("[Template] {e}, downloading {url}"),
            }
        }

        self.fetch(url).await
    }

    /// Read `path` if it resolves inside the template directory.
    async fn read_confined(&self, path: &Path) -> Result<Vec<u8>, BridgeError> {
        let local_error =
            |e: std::io::Error| BridgeError::Template(format!("{}: {e}", path.display()));
        let Some(dir) = &self.template_dir else {
            return Err(BridgeError::Template(format!(
                "{}: local templates need a template directory",
                path.display()
            )));
        };

        let dir = tokio::fs::canonicalize(dir).await.map_err(local_error)?;
        let resolved = tokio::fs::canonicalize(path).await.map_err(local_error)?;
        if !resolved.starts_with(&dir) {
            log::warn!(
                "[Template] Refusing {} outside {}",
                resolved.display(),
                dir.display()
            );
            return Err(BridgeError::Template(format!(
                "{} is outside the template directory",
                path.display()
            )));
        }
        tokio::fs::read(&resolved).await.map_err(local_error)
    }

    fn cached_path(&self, url: &str) -> Option<PathBuf> {
        let dir = self.template_dir.as_ref()?;
        let name = file_name(url)?;
        Some(dir.join(name))
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, BridgeError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| BridgeError::Template(format!("GET {url}: {e:#}")))?;

        if !response.status().is_success() {
            return Err(BridgeError::Template(format!(
                "GET {url}: {}",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| BridgeError::Template(format!("GET {url}: {e:#}")))?;
        log::info!("[Template] Downloaded {} bytes from {url}", bytes.len());
        Ok(bytes.to_vec())
    }
}

/// Path for URLs that can only be read locally.
fn local_only_path(url: &str) -> Option<PathBuf> {
    if let Some(rest) = url.strip_prefix("file://") {
        return Some(PathBuf::from(rest));
    }
    let path = Path::new(url);
    path.is_absolute().then(|| path.to_path_buf())
}

/// Last path segment of a URL, without query or fragment.
fn file_name(url: &str) -> Option<&str> {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    let path = &url[..end];
    let path = path.split_once("://").map_or(path, |(_, rest)| rest);
    let (_, name) = path.rsplit_once('/')?;
    (!name.is_empty() && name != ".." && name != ".").then_some(name)
}
