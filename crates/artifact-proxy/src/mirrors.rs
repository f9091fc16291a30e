//! Mirror list loading

use crate::error::{ProxyError, Result};
use std::path::Path;
use tracing::info;

/// Ordered list of mirror base URLs, highest priority first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mirrors(Vec<String>);

impl Mirrors {
    pub fn new(list: Vec<String>) -> Self {
        Self(list)
    }

    /// Load mirrors from a file, one base URL per line
    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ProxyError::Mirrors {
                path: path.to_path_buf(),
                source,
            })?;
        let mirrors = Self::parse(&text);
        info!(count = mirrors.len(), path = ?path, "Loaded mirrors");
        Ok(mirrors)
    }

    /// Parse a mirror list, skipping blank lines and `#` comments
    pub fn parse(text: &str) -> Self {
        Self::new(
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string)
                .collect(),
        )
    }

    /// Whether another mirror follows the one at `idx`
    pub fn has_more(&self, idx: usize) -> bool {
        idx + 1 < self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Join a mirror base and a request path with exactly one `/`
pub fn build_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
