use std::fmt;

use serde::{Deserialize, Serialize};

/// The reason an instance exists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "key", rename_all = "snake_case")]
pub enum InstanceOwner {
    User(String),
    Shared(String),
    /// Pre-warmed pool slot, numbered contiguously from zero.
    Unassigned(u32),
}

impl InstanceOwner {
    pub fn user(id: impl Into<String>) -> Self {
        Self::User(id.into())
    }

    pub fn shared(name: impl Into<String>) -> Self {
        Self::Shared(name.into())
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::User(id) => Some(id),
            Self::Shared(_) | Self::Unassigned(_) => None,
        }
    }

    /// Only user-owned instances are evicted after idling.
    pub fn is_idle_evictable(&self) -> bool {
        match self {
            Self::User(_) => true,
            Self::Shared(_) | Self::Unassigned(_) => false,
        }
    }
}

impl fmt::Display for InstanceOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::Shared(name) => write!(f, "shared:{name}"),
            Self::Unassigned(slot) => write!(f, "unassigned:{slot}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn equality_is_by_variant_and_key() {
        let mut set = HashSet::new();
        set.insert(InstanceOwner::user("alice"));
        set.insert(InstanceOwner::shared("alice"));
        set.insert(InstanceOwner::Unassigned(0));
        set.insert(InstanceOwner::user("alice"));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn serializes_as_tagged_union() {
        let json = serde_json::to_string(&InstanceOwner::Unassigned(2)).unwrap();
        assert_eq!(json, r#"{"kind":"unassigned","key":2}"#);
        let back: InstanceOwner = serde_json::from_str(r#"{"kind":"user","key":"bob"}"#).unwrap();
        assert_eq!(back, InstanceOwner::user("bob"));
        assert_eq!(back.to_string(), "user:bob");
    }
}
