use crate::CoreError;
use serde::{Deserialize, Serialize};
use spackle_remote::MirrorConfig;
use spackle_schema::ArchSpec;
use std::path::{Path, PathBuf};

/// Environment variable naming an alternate config file.
pub const CONFIG_ENV: &str = "SPACKLE_CONFIG";

/// `config.toml`:
///
/// ```toml
/// install_tree = "/opt/spackle"
///
/// [[mirrors]]
/// name = "main"
/// url = "https://cache.example.com"
///
/// [host]
/// platform = "linux"
/// os = "ubuntu22.04"
/// target = "x86_64"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_install_tree")]
    pub install_tree: PathBuf,
    #[serde(default)]
    pub mirrors: Vec<MirrorConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<ArchSpec>,
}

fn home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

fn default_install_tree() -> PathBuf {
    home().map_or_else(
        || PathBuf::from(".spackle/opt"),
        |h| h.join(".spackle").join("opt"),
    )
}

impl Default for Config {
    fn default() -> Self {
        Self {
            install_tree: default_install_tree(),
            mirrors: Vec::new(),
            host: None,
        }
    }
}

impl Config {
    /// `$SPACKLE_CONFIG`, else `~/.config/spackle/config.toml`.
    pub fn default_path() -> Result<PathBuf, CoreError> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Ok(PathBuf::from(path));
        }
        home()
            .map(|h| h.join(".config/spackle/config.toml"))
            .ok_or_else(|| CoreError::Config("HOME not set".to_owned()))
    }

    /// Load the default config file; a missing file yields the defaults.
    pub fn load_default() -> Result<Self, CoreError> {
        let path = Self::default_path()?;
        if !path.exists() {
            tracing::debug!("no config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), CoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| CoreError::Config(format!("cannot serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn validate(&self) -> Result<(), CoreError> {
        let mut seen = std::collections::BTreeSet::new();
        for mirror in &self.mirrors {
            if !seen.insert(mirror.name.as_str()) {
                return Err(CoreError::Config(format!(
                    "duplicate mirror name '{}'",
                    mirror.name
                )));
            }
        }
        Ok(())
    }

    /// Mirrors with normalized URLs, in file order.
    pub fn mirrors(&self) -> Vec<MirrorConfig> {
        self.mirrors
            .iter()
            .map(|m| {
                let mut normalized = MirrorConfig::new(&m.name, &m.url);
                normalized.auth_token.clone_from(&m.auth_token);
                normalized
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let config = Config {
            install_tree: dir.path().join("opt"),
            mirrors: vec![MirrorConfig::new("main", "https://cache.example.com").with_token("t0k")],
            host: Some(ArchSpec::parse_triplet("linux-ubuntu22.04-x86_64")),
        };
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[[mirrors]]\nname = \"local\"\nurl = \"file:///srv/mirror/\"\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert!(config.host.is_none());
        assert_eq!(config.mirrors()[0].url, "file:///srv/mirror");
    }

    #[test]
    fn duplicate_mirror_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[[mirrors]]\nname = \"a\"\nurl = \"/x\"\n[[mirrors]]\nname = \"a\"\nurl = \"/y\"\n",
        )
        .unwrap();
        assert!(matches!(Config::load(&path), Err(CoreError::Config(_))));
    }

    #[test]
    fn invalid_toml_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "install_tree = [").unwrap();
        assert!(matches!(Config::load(&path), Err(CoreError::ConfigParse(_))));
    }
}
