//! Script constant database
//!
//! Loads named integer constants (and character parameter aliases) from a
//! YAML document with a `Header`/`Body` layout:
//!
//! ```yaml
//! Header:
//!   Type: CONSTANT_DB
//!   Version: 1
//! Body:
//!   - Name: Job_Novice
//!     Value: 0
//!   - Name: Zeny
//!     Value: 20
//!     Parameter: true
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const CONSTANT_DB_TYPE: &str = "CONSTANT_DB";
pub const CONSTANT_DB_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstantEntry {
    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "Value")]
    pub value: i64,

    /// The entry names a character parameter; `value` is its parameter number
    #[serde(rename = "Parameter", default)]
    pub parameter: bool,

    #[serde(rename = "Deprecated", default)]
    pub deprecated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Header {
    #[serde(rename = "Type")]
    typ: String,
    #[serde(rename = "Version")]
    version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConstantFile {
    #[serde(rename = "Header")]
    header: Header,
    #[serde(rename = "Body", default)]
    body: Vec<ConstantEntry>,
}

/// Parsed constant database
#[derive(Debug, Clone, Default)]
pub struct ConstDb {
    entries: Vec<ConstantEntry>,
}

impl ConstDb {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read constant file: {}", path.display()))?;
        Self::from_str(&contents)
            .with_context(|| format!("Failed to load constants from {}", path.display()))
    }

    pub fn from_str(contents: &str) -> Result<Self> {
        let file: ConstantFile =
            serde_yaml::from_str(contents).context("Failed to parse YAML")?;

        anyhow::ensure!(
            file.header.typ == CONSTANT_DB_TYPE,
            "Invalid database type '{}' (expected {})",
            file.header.typ,
            CONSTANT_DB_TYPE
        );
        anyhow::ensure!(
            file.header.version <= CONSTANT_DB_VERSION,
            "Unsupported constant database version {}",
            file.header.version
        );

        for entry in &file.body {
            anyhow::ensure!(!entry.name.is_empty(), "constant with an empty name");
            anyhow::ensure!(
                !entry.name.starts_with(|c: char| c.is_ascii_digit()),
                "constant '{}' starts with a digit",
                entry.name
            );
        }

        Ok(Self { entries: file.body })
    }

    pub fn entries(&self) -> &[ConstantEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
