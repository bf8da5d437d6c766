//! Script engine configuration module
//!
//! Parses and manages the script engine configuration from YAML files.
//! Every field has a default, so an empty document is a valid configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Script engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptConfig {
    // ============================================
    // Compiler Checks
    // ============================================
    /// Reject calls that pass fewer arguments than the builtin signature requires
    #[serde(default = "default_true")]
    pub warn_func_mismatch_paramnum: bool,

    /// Warn at run time when an argument does not match the builtin signature
    #[serde(default = "default_true")]
    pub warn_func_mismatch_argtypes: bool,

    // ============================================
    // Runaway Script Guards
    // ============================================
    /// Opcodes a script may execute in one run before it is terminated
    #[serde(default = "default_check_cmdcount")]
    pub check_cmdcount: u32,

    /// Jumps a script may take in one run before it is terminated
    #[serde(default = "default_check_gotocount")]
    pub check_gotocount: u32,

    // ============================================
    // Player Input
    // ============================================
    #[serde(default)]
    pub input_min_value: i64,

    #[serde(default = "default_input_max_value")]
    pub input_max_value: i64,

    // ============================================
    // Events & Files
    // ============================================
    /// Label run on every NPC after loading
    #[serde(default = "default_init_event_name")]
    pub init_event_name: String,

    /// Optional YAML constant database
    #[serde(default)]
    pub constants_file: Option<String>,

    /// NPC source files loaded at startup and on reload
    #[serde(default)]
    pub npc_files: Vec<String>,
}

// ============================================
// Default value functions
// ============================================

fn default_true() -> bool {
    true
}

fn default_check_cmdcount() -> u32 {
    65535
}

fn default_check_gotocount() -> u32 {
    2048
}

fn default_input_max_value() -> i64 {
    i64::from(i32::MAX)
}

fn default_init_event_name() -> String {
    "OnInit".to_string()
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            warn_func_mismatch_paramnum: true,
            warn_func_mismatch_argtypes: true,
            check_cmdcount: default_check_cmdcount(),
            check_gotocount: default_check_gotocount(),
            input_min_value: 0,
            input_max_value: default_input_max_value(),
            init_event_name: default_init_event_name(),
            constants_file: None,
            npc_files: Vec::new(),
        }
    }
}

impl ScriptConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: ScriptConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML in {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Parse configuration from a YAML string
    pub fn from_str(contents: &str) -> Result<Self> {
        // serde_yaml treats an empty document as null, not as an empty map
        let config: ScriptConfig = if contents.trim().is_empty() {
            ScriptConfig::default()
        } else {
            serde_yaml::from_str(contents).context("Failed to parse YAML")?
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.input_min_value <= self.input_max_value,
            "input_min_value ({}) is greater than input_max_value ({})",
            self.input_min_value,
            self.input_max_value
        );
        anyhow::ensure!(
            !self.init_event_name.is_empty(),
            "init_event_name cannot be empty"
        );
        anyhow::ensure!(
            self.init_event_name.len() <= 23,
            "init_event_name too long: {} chars (max 23)",
            self.init_event_name.len()
        );

        Ok(())
    }

    /// Save configuration to a YAML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(&self)
            .context("Failed to serialize config to YAML")?;

        fs::write(path.as_ref(), yaml)
            .with_context(|| format!("Failed to write config to {}", path.as_ref().display()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = ScriptConfig::from_str("").unwrap();

        assert!(config.warn_func_mismatch_paramnum);
        assert!(config.warn_func_mismatch_argtypes);
        assert_eq!(config.check_cmdcount, 65535);
        assert_eq!(config.check_gotocount, 2048);
        assert_eq!(config.input_min_value, 0);
        assert_eq!(config.input_max_value, 2147483647);
        assert_eq!(config.init_event_name, "OnInit");
        assert!(config.constants_file.is_none());
        assert!(config.npc_files.is_empty());
    }

    #[test]
    fn test_custom_values() {
        let config = ScriptConfig::from_str(
            r#"
warn_func_mismatch_paramnum: false
check_cmdcount: 100
check_gotocount: 0
input_min_value: -10
input_max_value: 10
constants_file: "db/const.yml"
npc_files:
  - "npc/test.txt"
  - "npc/shops.txt"
"#,
        )
        .unwrap();

        assert!(!config.warn_func_mismatch_paramnum);
        assert!(config.warn_func_mismatch_argtypes);
        assert_eq!(config.check_cmdcount, 100);
        assert_eq!(config.check_gotocount, 0);
        assert_eq!(config.input_min_value, -10);
        assert_eq!(config.input_max_value, 10);
        assert_eq!(config.constants_file.as_deref(), Some("db/const.yml"));
        assert_eq!(config.npc_files.len(), 2);
    }

    #[test]
    fn test_validation_input_range() {
        let result = ScriptConfig::from_str("input_min_value: 5\ninput_max_value: 1\n");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("input_min_value"));
    }

    #[test]
    fn test_validation_empty_event_name() {
        let result = ScriptConfig::from_str("init_event_name: \"\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_yaml() {
        let result = ScriptConfig::from_str("check_cmdcount: [not, a, number]");
        assert!(result.is_err());
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!(
            "npcscript_config_{}.yaml",
            std::process::id()
        ));

        let mut config = ScriptConfig::default();
        config.check_gotocount = 77;
        config.npc_files.push("npc/a.txt".to_string());
        config.save(&path).unwrap();

        let loaded = ScriptConfig::from_file(&path).unwrap();
        assert_eq!(loaded.check_gotocount, 77);
        assert_eq!(loaded.npc_files, vec!["npc/a.txt".to_string()]);

        let _ = std::fs::remove_file(&path);
    }
}
