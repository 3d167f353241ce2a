use crate::{HttpBackend, LocalBackend, RemoteBackend, RemoteError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One `[[mirrors]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorConfig {
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

impl MirrorConfig {
    pub fn new(name: &str, url: &str) -> Self {
        Self {
            name: name.to_owned(),
            url: url.trim_end_matches('/').to_owned(),
            auth_token: None,
        }
    }

    #[must_use]
    pub fn with_token(mut self, token: &str) -> Self {
        self.auth_token = Some(token.to_owned());
        self
    }

    /// Backend for this mirror's URL scheme: `http(s)://` goes over HTTP,
    /// `file://` and bare paths are local directories.
    pub fn backend(&self) -> Result<Box<dyn RemoteBackend>, RemoteError> {
        let url = self.url.trim_end_matches('/');
        if url.starts_with("http://") || url.starts_with("https://") {
            let mut config = self.clone();
            config.url = url.to_owned();
            return Ok(Box::new(HttpBackend::new(config)));
        }
        if let Some(path) = url.strip_prefix("file://") {
            return Ok(Box::new(LocalBackend::new(PathBuf::from(path))));
        }
        if url.contains("://") {
            return Err(RemoteError::Config(format!(
                "mirror '{}' has unsupported URL scheme: {url}",
                self.name
            )));
        }
        Ok(Box::new(LocalBackend::new(PathBuf::from(url))))
    }
}
