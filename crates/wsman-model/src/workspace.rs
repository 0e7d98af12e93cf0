use std::fmt;

use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::Digest;

const REF_PREFIX: &str = "workspace-";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkspaceId(pub String);

impl WorkspaceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn is_valid(raw: &str) -> bool {
        !raw.is_empty() && raw.chars().all(|c| c.is_ascii_alphanumeric())
    }
}

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Content hash of an immutable workspace configuration.
///
/// Base64 of a SHA-256 digest with `/` written as `*`, so it can sit inside a
/// single URL path segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkspaceHash(pub String);

impl WorkspaceHash {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let digest = sha2::Sha256::digest(bytes);
        let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(digest);
        Self(encoded.replace('/', "*"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn is_valid(raw: &str) -> bool {
        !raw.is_empty()
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '*' | '+' | '_' | '-' | '='))
    }
}

impl fmt::Display for WorkspaceHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `workspace-<id>-<hash>` as it appears in routed URLs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkspaceRef {
    pub id: WorkspaceId,
    pub hash: WorkspaceHash,
}

impl WorkspaceRef {
    pub fn new(id: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            id: WorkspaceId(id.into()),
            hash: WorkspaceHash(hash.into()),
        }
    }

    pub fn parse(segment: &str) -> Option<Self> {
        let rest = segment.strip_prefix(REF_PREFIX)?;
        let (id, hash) = rest.split_once('-')?;
        if !WorkspaceId::is_valid(id) || !WorkspaceHash::is_valid(hash) {
            return None;
        }
        Some(Self::new(id, hash))
    }
}

impl fmt::Display for WorkspaceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{REF_PREFIX}{}-{}", self.id, self.hash)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitRepository {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub branch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedInstanceConfig {
    pub name: String,
    #[serde(default)]
    pub allow_write: bool,
}

/// Configuration snapshot a workspace version is built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    pub id: WorkspaceId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub repositories: Vec<GitRepository>,
    #[serde(default)]
    pub shared_instances: Vec<SharedInstanceConfig>,
    #[serde(default)]
    pub memory_limit: Option<String>,
    #[serde(default)]
    pub base_image: Option<String>,
}

impl WorkspaceConfig {
    pub fn content_hash(&self) -> WorkspaceHash {
        // Serializing a plain struct of strings and vectors cannot fail.
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        WorkspaceHash::of_bytes(&bytes)
    }

    pub fn shared_instance(&self, name: &str) -> Option<&SharedInstanceConfig> {
        self.shared_instances.iter().find(|s| s.name == name)
    }
}

/// An immutable, content-addressed workspace configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceVersion {
    pub reference: WorkspaceRef,
    pub config: WorkspaceConfig,
}

impl WorkspaceVersion {
    pub fn new(config: WorkspaceConfig) -> Self {
        let reference = WorkspaceRef {
            id: config.id.clone(),
            hash: config.content_hash(),
        };
        Self { reference, config }
    }

    pub fn id(&self) -> &WorkspaceId {
        &self.reference.id
    }

    pub fn hash(&self) -> &WorkspaceHash {
        &self.reference.hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(id: &str) -> WorkspaceConfig {
        WorkspaceConfig {
            id: WorkspaceId(id.to_string()),
            name: "demo".to_string(),
            repositories: vec![],
            shared_instances: vec![SharedInstanceConfig {
                name: "review".to_string(),
                allow_write: false,
            }],
            memory_limit: Some("2Gi".to_string()),
            base_image: None,
        }
    }

    #[test]
    fn parses_workspace_reference_with_star_hash() {
        let r = WorkspaceRef::parse("workspace-abc-1234*5678").unwrap();
        assert_eq!(r.id.as_str(), "abc");
        assert_eq!(r.hash.as_str(), "1234*5678");
        assert_eq!(r.to_string(), "workspace-abc-1234*5678");
    }

    #[test]
    fn rejects_malformed_references() {
        assert!(WorkspaceRef::parse("workspace-abc").is_none());
        assert!(WorkspaceRef::parse("workspace--1234").is_none());
        assert!(WorkspaceRef::parse("workspace-abc-").is_none());
        assert!(WorkspaceRef::parse("ws-abc-1234").is_none());
        assert!(WorkspaceRef::parse("workspace-abc-12/34").is_none());
    }

    #[test]
    fn content_hash_is_stable_and_path_safe() {
        let a = config("abc").content_hash();
        let b = config("abc").content_hash();
        assert_eq!(a, b);
        assert!(!a.as_str().contains('/'));
        assert_ne!(a, config("abd").content_hash());

        let version = WorkspaceVersion::new(config("abc"));
        let reparsed = WorkspaceRef::parse(&version.reference.to_string()).unwrap();
        assert_eq!(reparsed, version.reference);
    }
}
