//! Loader configuration: reads `~/.vivafolio/blocks.toml` and yields the
//! dependency allowlist, integrity settings, and sandbox limits.

use crate::allowlist::DependencyAllowlist;
use crate::sandbox::ResourceLimits;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Settings shared by every loader created from one `BlockHost`.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub allowlist: DependencyAllowlist,
    /// Compute SHA-256 digests of bundle and local module bytes.
    pub compute_integrity: bool,
    pub resource_limits: ResourceLimits,
    /// Install the template bridge for html-mode blocks.
    pub template_bridge: bool,
    config_path: Option<PathBuf>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            allowlist: DependencyAllowlist::default(),
            compute_integrity: true,
            resource_limits: ResourceLimits::default(),
            template_bridge: true,
            config_path: None,
        }
    }
}

impl LoaderConfig {
    /// Loads `~/.vivafolio/blocks.toml` if it exists.
    pub fn load() -> Self {
        Self::load_from(dirs_path().join("blocks.toml"))
    }

    /// Loads from an explicit path. Falls back to defaults, with a warning
    /// on read or parse errors.
    pub fn load_from(path: PathBuf) -> Self {
        if !path.exists() {
            info!("No loader config found at {:?}, using defaults", path);
            return Self::default();
        }

        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                warn!("Failed to read loader config {:?}: {}", path, e);
                return Self {
                    config_path: Some(path),
                    ..Self::default()
                };
            }
        };

        match Self::from_toml(&contents) {
            Ok(mut config) => {
                info!("Loaded loader config from {:?}", path);
                config.config_path = Some(path);
                config
            }
            Err(e) => {
                warn!("{}. Falling back to default loader config.", e);
                Self {
                    config_path: Some(path),
                    ..Self::default()
                }
            }
        }
    }

    /// Parses the TOML format directly.
    pub fn from_toml(contents: &str) -> Result<Self, crate::BlockLoaderError> {
        let file: ConfigFile = toml::from_str(contents)
            .map_err(|e| crate::BlockLoaderError::Config(format!("invalid loader config: {e}")))?;
        Ok(file.into_config())
    }

    pub fn with_allowlist(mut self, allowlist: DependencyAllowlist) -> Self {
        self.allowlist = allowlist;
        self
    }

    /// Returns whether a config file was found.
    pub fn has_config_file(&self) -> bool {
        self.config_path.is_some()
    }
}

/// Raw TOML structure matching `blocks.toml`.
#[derive(Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    loader: LoaderSection,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct LoaderSection {
    #[serde(default = "default_true")]
    compute_integrity: bool,
    #[serde(default = "default_true")]
    template_bridge: bool,
    #[serde(default)]
    allowlist: Option<AllowlistSection>,
    #[serde(default)]
    limits: LimitsSection,
}

impl Default for LoaderSection {
    fn default() -> Self {
        Self {
            compute_integrity: true,
            template_bridge: true,
            allowlist: None,
            limits: LimitsSection::default(),
        }
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
struct AllowlistSection {
    #[serde(default)]
    specifiers: Vec<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
struct LimitsSection {
    max_memory_bytes: Option<usize>,
    fuel_per_call: Option<u64>,
}

fn default_true() -> bool {
    true
}

impl ConfigFile {
    fn into_config(self) -> LoaderConfig {
        let defaults = ResourceLimits::default();
        let allowlist = match self.loader.allowlist {
            Some(section) => DependencyAllowlist::new(section.specifiers),
            None => DependencyAllowlist::default(),
        };
        LoaderConfig {
            allowlist,
            compute_integrity: self.loader.compute_integrity,
            resource_limits: ResourceLimits {
                max_memory_bytes: self
                    .loader
                    .limits
                    .max_memory_bytes
                    .unwrap_or(defaults.max_memory_bytes),
                fuel_per_call: self.loader.limits.fuel_per_call.unwrap_or(defaults.fuel_per_call),
            },
            template_bridge: self.loader.template_bridge,
            config_path: None,
        }
    }
}

/// Resolve the Vivafolio config directory.
fn dirs_path() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        Path::new(&home).join(".vivafolio")
    } else if let Ok(home) = std::env::var("USERPROFILE") {
        Path::new(&home).join(".vivafolio")
    } else {
        PathBuf::from(".vivafolio")
    }
}
