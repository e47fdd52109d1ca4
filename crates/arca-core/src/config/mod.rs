mod defaults;
mod types;
mod util;

use std::path::Path;

use crate::error::{ArcaError, Result};

pub use self::types::*;
pub use self::util::expand_tilde;
pub use arca_storage::RetryConfig;

/// Load a YAML config file and validate it.
pub fn load_config(path: &Path) -> Result<ArcaConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| ArcaError::Config(format!("cannot read '{}': {e}", path.display())))?;
    parse_config(&contents)
        .map_err(|e| ArcaError::Config(format!("invalid config '{}': {e}", path.display())))
}

/// Parse and validate config text. Errors carry no file context.
pub fn parse_config(contents: &str) -> std::result::Result<ArcaConfig, String> {
    let config: ArcaConfig = serde_yaml::from_str(contents).map_err(|e| e.to_string())?;
    config.validate()?;
    Ok(config)
}

/// Returns a minimal YAML config template suitable for bootstrapping.
pub fn minimal_config_template() -> &'static str {
    r#"# arca configuration file

repository:
  url: /path/to/repo

# --- Common optional settings (uncomment as needed) ---

# pack:
#   max_pack_size_mb: 10
#   max_pack_item_size_bytes: 262144
#
# encryption:
#   version: 2
#
# compression: lz4
"#
}
