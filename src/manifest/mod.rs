//! Extension manifest parsing and validation
//!
//! Each extension ships an `extension.toml` manifest declaring:
//! - Extension metadata (id, version, author)
//! - Requested permissions (capability strings, optionally wildcarded)
//! - Storage collections the extension owns (name -> indexed field paths)
//!
//! The manifest is immutable once loaded and drives every permission
//! decision for the extension's lifetime.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::permissions::{is_valid_identifier, Permission};

/// Extension manifest (extension.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionManifest {
    /// Extension metadata
    pub extension: ExtensionMetadata,

    /// Requested permissions, e.g. `["storage.collections", "network:*"]`
    #[serde(default)]
    pub permissions: Vec<String>,

    /// Declared storage collections: name -> indexed JSON field paths.
    /// An extension with no declarations gets no collection access at all.
    #[serde(default)]
    pub collections: BTreeMap<String, Vec<String>>,
}

/// Extension metadata section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionMetadata {
    /// Unique extension identifier (e.g. "todo-sync")
    pub id: String,

    /// Extension version
    pub version: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Extension author
    #[serde(default)]
    pub author: String,
}

impl ExtensionManifest {
    /// Load a manifest from an extension.toml file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest: {}", path.display()))?;

        let manifest: ExtensionManifest = toml::from_str(&content)
            .with_context(|| format!("Failed to parse manifest: {}", path.display()))?;

        manifest.validate()?;

        Ok(manifest)
    }

    /// Parse a manifest from a TOML string (used when the host receives
    /// bundles whose manifest is already in memory)
    pub fn parse(content: &str) -> Result<Self> {
        let manifest: ExtensionManifest =
            toml::from_str(content).context("Failed to parse extension manifest")?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Validate the manifest
    pub fn validate(&self) -> Result<()> {
        if self.extension.id.is_empty() {
            anyhow::bail!("Extension id is required");
        }

        if self.extension.version.is_empty() {
            anyhow::bail!("Extension version is required");
        }

        // Extension ids end up in table names and storage paths
        if !self
            .extension
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            anyhow::bail!("Extension id must be alphanumeric with hyphens/underscores");
        }

        for raw in &self.permissions {
            Permission::parse(raw)
                .with_context(|| format!("Invalid permission string: {raw}"))?;
        }

        for (name, indexes) in &self.collections {
            if !is_valid_identifier(name) {
                anyhow::bail!("Invalid collection name: {name}");
            }
            for field in indexes {
                crate::permissions::validate_field_path(field)
                    .with_context(|| format!("Invalid index field in collection {name}"))?;
            }
        }

        Ok(())
    }

    /// Get the extension id
    pub fn id(&self) -> &str {
        &self.extension.id
    }

    /// True if the manifest declares the given collection
    pub fn declares_collection(&self, name: &str) -> bool {
        self.collections.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_manifest() {
        let toml = r#"
[extension]
id = "todo-sync"
version = "1.2.0"
description = "Sync todos with a remote service"

permissions = ["storage.collections", "network:*", "scheduler.*"]

[collections]
todos = ["status", "due.date"]
projects = []
"#;

        let manifest = ExtensionManifest::parse(toml).unwrap();
        assert_eq!(manifest.id(), "todo-sync");
        assert_eq!(manifest.permissions.len(), 3);
        assert!(manifest.declares_collection("todos"));
        assert!(manifest.declares_collection("projects"));
        assert!(!manifest.declares_collection("users"));
        assert_eq!(manifest.collections["todos"], vec!["status", "due.date"]);
    }

    #[test]
    fn test_rejects_bad_extension_id() {
        let toml = r#"
[extension]
id = "evil/../ext"
version = "1.0.0"
"#;
        assert!(ExtensionManifest::parse(toml).is_err());
    }

    #[test]
    fn test_rejects_bad_collection_name() {
        let toml = r#"
[extension]
id = "ext"
version = "1.0.0"

[collections]
"bad-name!" = []
"#;
        assert!(ExtensionManifest::parse(toml).is_err());
    }

    #[test]
    fn test_rejects_unparseable_permission() {
        let toml = r#"
[extension]
id = "ext"
version = "1.0.0"

permissions = [""]
"#;
        assert!(ExtensionManifest::parse(toml).is_err());
    }
}
