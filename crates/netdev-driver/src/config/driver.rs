use core::error::Error;
use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;

use crate::domain::registry::DEFAULT_EXCLUDED_PREFIXES;
use crate::drivers::node_agent::DEFAULT_RESOURCE_FILE;
use crate::drivers::subinterface::DEFAULT_SLOTS_PER_PARENT;

#[derive(Debug, derive_more::Display)]
pub enum ConfigError {
    #[display("Failed to read driver config {path}")]
    Read { path: String },
    #[display("Invalid driver config {path}")]
    Parse { path: String },
}

impl Error for ConfigError {}

/// Optional YAML tuning of the driver variants
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DriverConfig {
    /// Host link name prefixes never advertised
    pub excluded_prefixes: Vec<String>,
    pub slots_per_parent: u32,
    /// IFLA_MACVLAN_MODE value, 4 is bridge
    pub macvlan_mode: u32,
    /// IFLA_IPVLAN_MODE value, 0 is L2
    pub ipvlan_mode: u16,
    pub resource_file: PathBuf,
    /// Resource pool name; the node name when unset
    pub pool_name: Option<String>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            excluded_prefixes: DEFAULT_EXCLUDED_PREFIXES
                .iter()
                .map(|p| p.to_string())
                .collect(),
            slots_per_parent: DEFAULT_SLOTS_PER_PARENT,
            macvlan_mode: 4,
            ipvlan_mode: 0,
            resource_file: PathBuf::from(DEFAULT_RESOURCE_FILE),
            pool_name: None,
        }
    }
}

impl DriverConfig {
    pub fn load(path: &Path) -> Result<Self, Report<ConfigError>> {
        let content = std::fs::read_to_string(path).change_context_lazy(|| ConfigError::Read {
            path: path.display().to_string(),
        })?;
        Self::from_yaml(&content).attach_printable_lazy(|| format!("file: {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self, Report<ConfigError>> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).change_context(ConfigError::Parse {
            path: "<inline>".to_string(),
        })
    }
}
