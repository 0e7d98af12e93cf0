//! Git repository access: remote ref listing, and deduplicated import and
//! rebase jobs feeding the versioned model store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::Digest;
use tokio::process::Command;
use tracing::Instrument;

use wsman_core::{ReusableTasks, TaskHandle, TaskState};

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("failed to run git: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("git {command} failed: {stderr}")]
    Command { command: String, stderr: String },
    #[error("invalid {what}: {value:?}")]
    InvalidArgument { what: &'static str, value: String },
    #[error("malformed ls-remote line: {0:?}")]
    Parse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefKind {
    Branch,
    Tag,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteRef {
    pub name: String,
    pub kind: RefKind,
    pub commit: String,
}

fn check_url(url: &str) -> Result<(), GitError> {
    if url.trim().is_empty() || url.starts_with('-') {
        return Err(GitError::InvalidArgument {
            what: "repository url",
            value: url.to_string(),
        });
    }
    Ok(())
}

fn check_commit(commit: &str) -> Result<(), GitError> {
    if !(7..=64).contains(&commit.len()) || !commit.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(GitError::InvalidArgument {
            what: "commit",
            value: commit.to_string(),
        });
    }
    Ok(())
}

async fn run_git(dir: Option<&Path>, args: &[&str]) -> Result<String, GitError> {
    let mut cmd = Command::new("git");
    if let Some(dir) = dir {
        cmd.arg("-C").arg(dir);
    }
    let output = cmd
        .args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .kill_on_drop(true)
        .output()
        .await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::Command {
            command: args.first().copied().unwrap_or_default().to_string(),
            stderr: stderr.trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parses `git ls-remote --heads --tags` output. Peeled tag lines (`^{}`)
/// replace the tag object id with the commit it points to.
pub fn parse_ls_remote(output: &str) -> Result<Vec<RemoteRef>, GitError> {
    let mut refs: BTreeMap<(RefKind, String), String> = BTreeMap::new();
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let (commit, name) = line
            .split_once(char::is_whitespace)
            .ok_or_else(|| GitError::Parse(line.to_string()))?;
        let name = name.trim();
        let (kind, short) = if let Some(branch) = name.strip_prefix("refs/heads/") {
            (RefKind::Branch, branch)
        } else if let Some(tag) = name.strip_prefix("refs/tags/") {
            (RefKind::Tag, tag)
        } else {
            continue;
        };
        match short.strip_suffix("^{}") {
            Some(tag) => {
                refs.insert((kind, tag.to_string()), commit.to_string());
            }
            None => {
                refs.entry((kind, short.to_string()))
                    .or_insert_with(|| commit.to_string());
            }
        }
    }
    Ok(refs
        .into_iter()
        .map(|((kind, name), commit)| RemoteRef { name, kind, commit })
        .collect())
}

/// Branches and tags of a remote repository. Not cached.
pub async fn list_remote_refs(url: &str) -> Result<Vec<RemoteRef>, GitError> {
    check_url(url)?;
    let out = run_git(None, &["ls-remote", "--heads", "--tags", "--", url]).await?;
    parse_ls_remote(&out)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImportKey {
    pub repository_url: String,
    pub commit: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RebaseKey {
    pub branch: String,
    pub base: String,
    pub onto: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredVersion {
    pub version: String,
    pub files: usize,
}

/// The versioned model store imports land in.
#[async_trait]
pub trait VersionedStore: Send + Sync + 'static {
    async fn import_tree(&self, key: &ImportKey, tree: &Path) -> anyhow::Result<StoredVersion>;
    async fn rebase(&self, key: &RebaseKey) -> anyhow::Result<StoredVersion>;
}

type Manifest = BTreeMap<String, String>;

fn hex_digest(bytes: &[u8]) -> String {
    hex::encode(sha2::Sha256::digest(bytes))
}

/// Content-addressed store on the local disk. A version is the manifest of
/// file paths to blob digests; branches point at versions.
pub struct LocalStore {
    root: PathBuf,
    branches: Mutex<BTreeMap<String, String>>,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            branches: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn branch_head(&self, branch: &str) -> Option<String> {
        self.branches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(branch)
            .cloned()
    }

    pub fn set_branch(&self, branch: &str, version: &str) {
        self.branches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(branch.to_string(), version.to_string());
    }

    fn version_path(&self, version: &str) -> PathBuf {
        self.root.join("versions").join(format!("{version}.json"))
    }

    pub async fn manifest(&self, version: &str) -> anyhow::Result<Manifest> {
        use anyhow::Context;
        if !version.bytes().all(|b| b.is_ascii_hexdigit()) {
            anyhow::bail!("invalid version id {version:?}");
        }
        let raw = tokio::fs::read(self.version_path(version))
            .await
            .with_context(|| format!("unknown version {version}"))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    async fn write_version(&self, manifest: &Manifest) -> anyhow::Result<StoredVersion> {
        let raw = serde_json::to_vec(manifest)?;
        let version = hex_digest(&raw);
        tokio::fs::create_dir_all(self.root.join("versions")).await?;
        tokio::fs::write(self.version_path(&version), raw).await?;
        Ok(StoredVersion {
            version,
            files: manifest.len(),
        })
    }

    async fn collect(&self, tree: &Path) -> anyhow::Result<Manifest> {
        let objects = self.root.join("objects");
        tokio::fs::create_dir_all(&objects).await?;
        let mut manifest = Manifest::new();
        let mut pending = vec![tree.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    if entry.file_name() != ".git" {
                        pending.push(path);
                    }
                    continue;
                }
                if !file_type.is_file() {
                    continue;
                }
                let Ok(rel) = path.strip_prefix(tree) else {
                    continue;
                };
                let content = tokio::fs::read(&path).await?;
                let digest = hex_digest(&content);
                let blob = objects.join(&digest);
                if tokio::fs::metadata(&blob).await.is_err() {
                    tokio::fs::write(&blob, &content).await?;
                }
                manifest.insert(rel.to_string_lossy().replace('\\', "/"), digest);
            }
        }
        Ok(manifest)
    }
}

/// Replays the changes `base -> head` on top of `onto`. Paths changed
/// differently on both sides conflict.
fn rebase_manifests(base: &Manifest, head: &Manifest, onto: &Manifest) -> Result<Manifest, Vec<String>> {
    let mut result = onto.clone();
    let mut conflicts = Vec::new();
    let paths: std::collections::BTreeSet<&String> = base.keys().chain(head.keys()).collect();
    for path in paths {
        let ours = head.get(path);
        let original = base.get(path);
        if ours == original {
            continue;
        }
        let theirs = onto.get(path);
        if theirs != original && theirs != ours {
            conflicts.push(path.clone());
            continue;
        }
        match ours {
            Some(digest) => result.insert(path.clone(), digest.clone()),
            None => result.remove(path),
        };
    }
    if conflicts.is_empty() { Ok(result) } else { Err(conflicts) }
}

#[async_trait]
impl VersionedStore for LocalStore {
    async fn import_tree(&self, key: &ImportKey, tree: &Path) -> anyhow::Result<StoredVersion> {
        let manifest = self.collect(tree).await?;
        let stored = self.write_version(&manifest).await?;
        tracing::debug!(commit = %key.commit, version = %stored.version, files = stored.files, "tree imported");
        Ok(stored)
    }

    async fn rebase(&self, key: &RebaseKey) -> anyhow::Result<StoredVersion> {
        let head = self.branch_head(&key.branch).unwrap_or_else(|| key.base.clone());
        let base = self.manifest(&key.base).await?;
        let onto = self.manifest(&key.onto).await?;
        let head_manifest = self.manifest(&head).await?;
        let merged = rebase_manifests(&base, &head_manifest, &onto).map_err(|conflicts| {
            anyhow::anyhow!("rebase of {} conflicts in {}", key.branch, conflicts.join(", "))
        })?;
        let stored = self.write_version(&merged).await?;
        self.set_branch(&key.branch, &stored.version);
        Ok(stored)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GitTaskInfo<K> {
    pub key: K,
    pub state: &'static str,
    pub error: Option<String>,
}

fn describe<K: Clone, R: Clone + Send + Sync + 'static>(handle: &TaskHandle<K, R>) -> GitTaskInfo<K> {
    let state = match handle.state() {
        TaskState::Created => "created",
        TaskState::Active => "running",
        TaskState::Completed => "completed",
        TaskState::Cancelled => "cancelled",
        TaskState::Unknown => "unknown",
    };
    GitTaskInfo {
        key: handle.key().clone(),
        state,
        error: handle
            .try_result()
            .and_then(|r| r.err())
            .map(|f| f.message().to_string()),
    }
}

pub struct GitTasks {
    store: Arc<dyn VersionedStore>,
    scratch: PathBuf,
    imports: ReusableTasks<ImportKey, StoredVersion>,
    rebases: ReusableTasks<RebaseKey, StoredVersion>,
}

impl GitTasks {
    pub fn new(store: Arc<dyn VersionedStore>, scratch: impl Into<PathBuf>) -> Self {
        Self {
            store,
            scratch: scratch.into(),
            imports: ReusableTasks::new(),
            rebases: ReusableTasks::new(),
        }
    }

    /// Fetches `key.commit` from `key.repository_url` and imports its tree.
    /// A failed import is replayed until [`Self::invalidate_import`].
    pub fn import(&self, key: ImportKey) -> TaskHandle<ImportKey, StoredVersion> {
        self.imports.get_or_create(key, |key| {
            let key = key.clone();
            let store = self.store.clone();
            let checkout = self
                .scratch
                .join(&hex_digest(format!("{}\n{}", key.repository_url, key.commit).as_bytes())[..16]);
            let span = tracing::info_span!("git_import", url = %key.repository_url, commit = %key.commit);
            async move {
                check_url(&key.repository_url)?;
                check_commit(&key.commit)?;
                let _ = tokio::fs::remove_dir_all(&checkout).await;
                tokio::fs::create_dir_all(&checkout).await?;
                let result = fetch_and_import(store.as_ref(), &key, &checkout).await;
                if let Err(e) = tokio::fs::remove_dir_all(&checkout).await {
                    tracing::debug!(error = %e, "scratch checkout cleanup failed");
                }
                match &result {
                    Ok(stored) => tracing::info!(version = %stored.version, "git import finished"),
                    Err(e) => tracing::warn!(error = %e, "git import failed"),
                }
                result
            }
            .instrument(span)
        })
    }

    pub fn rebase(&self, key: RebaseKey) -> TaskHandle<RebaseKey, StoredVersion> {
        self.rebases.get_or_create(key, |key| {
            let key = key.clone();
            let store = self.store.clone();
            let span = tracing::info_span!("git_rebase", branch = %key.branch);
            async move {
                let result = store.rebase(&key).await;
                if let Err(e) = &result {
                    tracing::warn!(error = %e, "rebase failed");
                }
                result
            }
            .instrument(span)
        })
    }

    pub fn invalidate_import(&self, key: &ImportKey) -> bool {
        self.imports.invalidate(key).is_some()
    }

    pub fn invalidate_rebase(&self, key: &RebaseKey) -> bool {
        self.rebases.invalidate(key).is_some()
    }

    pub fn imports(&self) -> Vec<GitTaskInfo<ImportKey>> {
        self.imports.handles().iter().map(describe).collect()
    }

    pub fn rebases(&self) -> Vec<GitTaskInfo<RebaseKey>> {
        self.rebases.handles().iter().map(describe).collect()
    }
}

async fn fetch_and_import(
    store: &dyn VersionedStore,
    key: &ImportKey,
    checkout: &Path,
) -> anyhow::Result<StoredVersion> {
    run_git(Some(checkout), &["init", "-q"]).await?;
    run_git(
        Some(checkout),
        &["fetch", "-q", "--depth", "1", "--", &key.repository_url, &key.commit],
    )
    .await?;
    run_git(Some(checkout), &["checkout", "-q", "--detach", "FETCH_HEAD"]).await?;
    store.import_tree(key, checkout).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("wsman-git-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn parses_branches_and_peeled_tags() {
        let out = "\
1111111111111111111111111111111111111111\trefs/heads/main
2222222222222222222222222222222222222222\trefs/heads/feature/x
3333333333333333333333333333333333333333\trefs/tags/v1.0
4444444444444444444444444444444444444444\trefs/tags/v1.0^{}
5555555555555555555555555555555555555555\trefs/pull/1/head
";
        let refs = parse_ls_remote(out).unwrap();
        assert_eq!(refs.len(), 3);
        assert!(refs.contains(&RemoteRef {
            name: "feature/x".to_string(),
            kind: RefKind::Branch,
            commit: "2".repeat(40),
        }));
        let tag = refs.iter().find(|r| r.kind == RefKind::Tag).unwrap();
        assert_eq!((tag.name.as_str(), tag.commit.as_str()), ("v1.0", "4".repeat(40).as_str()));
        assert!(parse_ls_remote("garbage").is_err());
    }

    #[test]
    fn rejects_option_like_arguments() {
        assert!(check_url("--upload-pack=evil").is_err());
        assert!(check_commit("--all").is_err());
        assert!(check_commit("abc1234").is_ok());
    }

    #[test]
    fn rebase_replays_branch_changes() {
        let m = |pairs: &[(&str, &str)]| -> Manifest {
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
        };
        let base = m(&[("a", "1"), ("b", "1")]);
        let head = m(&[("a", "2"), ("b", "1"), ("c", "1")]);
        let onto = m(&[("a", "1"), ("b", "3")]);
        assert_eq!(
            rebase_manifests(&base, &head, &onto).unwrap(),
            m(&[("a", "2"), ("b", "3"), ("c", "1")])
        );

        let onto = m(&[("a", "9"), ("b", "1")]);
        assert_eq!(rebase_manifests(&base, &head, &onto).unwrap_err(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn local_store_imports_and_rebases() {
        let root = scratch_dir();
        let tree = root.join("tree");
        tokio::fs::create_dir_all(tree.join("models")).await.unwrap();
        tokio::fs::create_dir_all(tree.join(".git")).await.unwrap();
        tokio::fs::write(tree.join("models/a.mps"), "a").await.unwrap();
        tokio::fs::write(tree.join(".git/HEAD"), "ref").await.unwrap();

        let store = LocalStore::new(root.join("store"));
        let key = ImportKey {
            repository_url: "https://git.example/r.git".to_string(),
            commit: "abc1234".to_string(),
        };
        let base = store.import_tree(&key, &tree).await.unwrap();
        assert_eq!(base.files, 1);

        tokio::fs::write(tree.join("b.txt"), "b").await.unwrap();
        let onto = store.import_tree(&key, &tree).await.unwrap();
        assert_ne!(base.version, onto.version);

        let rebased = store
            .rebase(&RebaseKey {
                branch: "feature".to_string(),
                base: base.version.clone(),
                onto: onto.version.clone(),
            })
            .await
            .unwrap();
        assert_eq!(rebased.version, onto.version);
        assert_eq!(store.branch_head("feature"), Some(onto.version));

        let _ = tokio::fs::remove_dir_all(&root).await;
    }

    #[tokio::test]
    async fn failed_tasks_are_replayed_until_invalidated() {
        let root = scratch_dir();
        let tasks = GitTasks::new(Arc::new(LocalStore::new(root.join("store"))), root.join("scratch"));
        let key = RebaseKey {
            branch: "main".to_string(),
            base: "00".to_string(),
            onto: "11".to_string(),
        };
        let first = tasks.rebase(key.clone()).await_result().await.unwrap_err();
        let second = tasks.rebase(key.clone()).await_result().await.unwrap_err();
        assert_eq!(first, second);
        assert_eq!(tasks.rebases().len(), 1);
        assert!(tasks.rebases()[0].error.is_some());

        assert!(tasks.invalidate_rebase(&key));
        assert!(tasks.rebases().is_empty());

        let bad = ImportKey {
            repository_url: "-x".to_string(),
            commit: "abc1234".to_string(),
        };
        let failure = tasks.import(bad).await_result().await.unwrap_err();
        assert!(failure.message().contains("repository url"), "{failure:?}");
    }
}
