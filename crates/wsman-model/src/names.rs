use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::workspace::WorkspaceRef;

/// Platform limit for object names (DNS-1123 label).
pub const MAX_NAME_LEN: usize = 63;

const PROCESS_ID_LEN: usize = 5;

/// Cluster-unique identity of one backend instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceName(pub String);

impl InstanceName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Stable UUID derived from the name; used by the instance-id routing mode.
    pub fn uuid(&self) -> uuid::Uuid {
        uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, self.0.as_bytes())
    }
}

impl fmt::Display for InstanceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn random_process_id() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..PROCESS_ID_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        let c = if c.is_ascii_alphanumeric() {
            c.to_ascii_lowercase()
        } else {
            '-'
        };
        if c == '-' && out.ends_with('-') {
            continue;
        }
        out.push(c);
    }
    out
}

/// Generates instance names of the form
/// `<prefix><workspace-id>-<hash>-<process-id>-<seq>`.
///
/// The `<process-id>-<seq>` tail is what makes names unique, so when the name
/// would exceed [`MAX_NAME_LEN`] the descriptive head is shortened instead.
#[derive(Debug)]
pub struct InstanceNameGenerator {
    prefix: String,
    process_id: String,
    next: AtomicU64,
}

impl InstanceNameGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self::with_process_id(prefix, random_process_id())
    }

    pub fn with_process_id(prefix: impl Into<String>, process_id: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            process_id: sanitize(&process_id.into()),
            next: AtomicU64::new(1),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn generate(&self, workspace: &WorkspaceRef) -> InstanceName {
        let seq = self.next.fetch_add(1, Ordering::Relaxed);
        let tail = format!("-{}-{seq}", self.process_id);

        let mut head = sanitize(&format!("{}{}-{}", self.prefix, workspace.id, workspace.hash));
        if !head.starts_with(|c: char| c.is_ascii_lowercase()) {
            head.insert(0, 'i');
        }
        let budget = MAX_NAME_LEN.saturating_sub(tail.len());
        head.truncate(budget);
        while head.ends_with('-') {
            head.pop();
        }

        InstanceName(format!("{head}{tail}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_dns_label(s: &str) -> bool {
        s.len() <= MAX_NAME_LEN
            && s.starts_with(|c: char| c.is_ascii_lowercase())
            && s.ends_with(|c: char| c.is_ascii_alphanumeric())
            && s.chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    }

    #[test]
    fn names_are_unique_and_valid_labels() {
        let generator = InstanceNameGenerator::with_process_id("wsinst-", "p1x9z");
        let ws = WorkspaceRef::new("abc", "1234*5678");
        let a = generator.generate(&ws);
        let b = generator.generate(&ws);
        assert_ne!(a, b);
        assert_eq!(a.as_str(), "wsinst-abc-1234-5678-p1x9z-1");
        assert!(is_dns_label(a.as_str()));
        assert_ne!(a.uuid(), b.uuid());
        assert_eq!(a.uuid(), InstanceName(a.0.clone()).uuid());
    }

    #[test]
    fn long_names_keep_the_unique_tail() {
        let generator = InstanceNameGenerator::with_process_id("wsinst-", "abcde");
        let ws = WorkspaceRef::new("verylongworkspaceid", "Q2hhbmdlZCB0aGUgd29ya3NwYWNlIGNvbmZpZyBoYXNo*x+y");
        for _ in 0..1000 {
            generator.generate(&ws);
        }
        let name = generator.generate(&ws);
        assert!(is_dns_label(name.as_str()), "{name}");
        assert!(name.as_str().ends_with("-abcde-1001"), "{name}");
        assert_eq!(name.as_str().len(), MAX_NAME_LEN);
    }

    #[test]
    fn random_process_ids_are_sanitized() {
        let generator = InstanceNameGenerator::new("wsinst-");
        let name = generator.generate(&WorkspaceRef::new("abc", "h"));
        assert!(is_dns_label(name.as_str()), "{name}");
    }
}
