//! Permission parsing and capability gates
//!
//! Manifest permission strings are dot- or colon-segmented
//! (`"storage.collections"`, `"network:*"`). A trailing `.*` or `:*` acts
//! as a prefix wildcard. Strings are parsed once at manifest load into a
//! structured [`Permission`] and matched with an explicit prefix matcher,
//! never re-parsed per call.
//!
//! Identifier and field-path validators live here too: they run before any
//! value reaches string-built SQL.

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::manifest::ExtensionManifest;

/// JSON field paths: `a`, `a.b.c` - no quotes, no spaces, no SQL
static FIELD_PATH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_.]*$").unwrap());

/// SQL identifiers (collection/table names, sort columns)
static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").unwrap());

/// Secret key names
static SECRET_KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_.-]{1,128}$").unwrap());

/// A parsed permission: capability name plus scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permission {
    /// Capability name with the wildcard suffix stripped,
    /// e.g. `"scheduler"` for `"scheduler.*"`.
    pub capability: String,
    /// Whether the permission grants every finer-grained capability
    /// under the prefix.
    pub wildcard: bool,
}

impl Permission {
    /// Parse a raw permission string from a manifest.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(anyhow!("Empty permission string"));
        }

        let (base, wildcard) = match raw.strip_suffix(".*").or_else(|| raw.strip_suffix(":*")) {
            Some(base) => (base, true),
            None => (raw, false),
        };

        if base.is_empty() {
            return Err(anyhow!("Permission is only a wildcard: {raw}"));
        }

        let valid = base
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == ':' || c == '_' || c == '-');
        if !valid {
            return Err(anyhow!("Permission contains invalid characters: {raw}"));
        }

        Ok(Self {
            capability: base.to_string(),
            wildcard,
        })
    }

    /// Check whether this permission grants the requested capability.
    ///
    /// `"scheduler.*"` grants `"scheduler"` itself and any
    /// `"scheduler.<x>"`; segment boundaries are respected so
    /// `"net.*"` never grants `"network"`.
    pub fn grants(&self, requested: &str) -> bool {
        if requested == self.capability {
            return true;
        }
        if self.wildcard {
            if let Some(rest) = requested.strip_prefix(&self.capability) {
                return rest.starts_with('.') || rest.starts_with(':');
            }
        }
        false
    }
}

/// Result of a capability check.
#[derive(Debug, Clone)]
pub struct AccessDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl AccessDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Evaluates a manifest's declared permissions and collections before any
/// capability call executes. Checks are synchronous; the host runs them
/// before any mutating call is dispatched.
#[derive(Debug, Clone)]
pub struct PermissionChecker {
    extension_id: String,
    permissions: Vec<Permission>,
    collections: Vec<String>,
}

impl PermissionChecker {
    /// Build a checker from a validated manifest. Permission strings are
    /// parsed once here; unparseable entries were already rejected at
    /// manifest load, so they are skipped defensively rather than granted.
    pub fn from_manifest(manifest: &ExtensionManifest) -> Self {
        let permissions = manifest
            .permissions
            .iter()
            .filter_map(|raw| Permission::parse(raw).ok())
            .collect();
        Self {
            extension_id: manifest.id().to_string(),
            permissions,
            collections: manifest.collections.keys().cloned().collect(),
        }
    }

    /// The extension this checker guards.
    pub fn extension_id(&self) -> &str {
        &self.extension_id
    }

    /// Coarse capability gate, e.g. `check_access("secrets")` or
    /// `check_access("storage.collections")`.
    pub fn check_access(&self, capability: &str) -> AccessDecision {
        if self.permissions.iter().any(|p| p.grants(capability)) {
            AccessDecision::allow()
        } else {
            AccessDecision::deny(format!(
                "extension '{}' does not declare permission '{}'",
                self.extension_id, capability
            ))
        }
    }

    /// True if the capability is granted. Used by the runtime when deciding
    /// which context handles to expose.
    pub fn has(&self, capability: &str) -> bool {
        self.check_access(capability).allowed
    }

    /// Collection access requires both the coarse storage capability and an
    /// exact collection declaration. No declarations means no access to any
    /// collection, whatever the candidate name looks like.
    pub fn validate_collection_access(&self, collection: &str) -> AccessDecision {
        let coarse = self.check_access("storage.collections");
        if !coarse.allowed {
            return coarse;
        }
        if self.collections.is_empty() {
            return AccessDecision::deny(format!(
                "extension '{}' declares no collections",
                self.extension_id
            ));
        }
        if self.collections.iter().any(|c| c == collection) {
            AccessDecision::allow()
        } else {
            AccessDecision::deny(format!(
                "collection '{}' not declared by extension '{}'",
                collection, self.extension_id
            ))
        }
    }
}

/// Validate a JSON field path (`a.b.c`). Rejects anything that could
/// smuggle SQL into a built clause.
pub fn validate_field_path(path: &str) -> Result<()> {
    if FIELD_PATH_RE.is_match(path) && !path.contains("..") && !path.ends_with('.') {
        Ok(())
    } else {
        Err(anyhow!("Invalid field path: {path:?}"))
    }
}

/// True if the string is a safe SQL identifier.
pub fn is_valid_identifier(name: &str) -> bool {
    IDENTIFIER_RE.is_match(name)
}

/// Validate a secret key name against the safe character class.
pub fn validate_secret_key(key: &str) -> Result<()> {
    if SECRET_KEY_RE.is_match(key) {
        Ok(())
    } else {
        Err(anyhow!("Invalid secret key name: {key:?}"))
    }
}

/// User ids are embedded in scoping keys, so separators are forbidden.
pub fn validate_user_id(user_id: &str) -> Result<()> {
    if user_id.is_empty() {
        return Err(anyhow!("User id must not be empty"));
    }
    if user_id.contains(':') || user_id.contains('/') || user_id.contains('\\') {
        return Err(anyhow!("User id contains forbidden characters: {user_id:?}"));
    }
    Ok(())
}
