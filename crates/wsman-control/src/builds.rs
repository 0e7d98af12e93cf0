//! Image builds per workspace version.
//!
//! The build pipeline itself is external; [`ImageBuilds`] only makes sure each
//! version is built once and reports where that build stands.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::Instrument;

use wsman_core::{ReusableTasks, TaskHandle, TaskResult, TaskState};
use wsman_model::{WorkspaceHash, WorkspaceVersion};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageCoordinates {
    pub image: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum BuildStatus {
    NotStarted,
    Building,
    Ready(ImageCoordinates),
    Failed(String),
}

impl BuildStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn image(&self) -> Option<&str> {
        match self {
            Self::Ready(coords) => Some(&coords.image),
            _ => None,
        }
    }
}

#[async_trait]
pub trait ImageBuilder: Send + Sync + 'static {
    async fn build(&self, version: &WorkspaceVersion) -> anyhow::Result<ImageCoordinates>;
}

/// Uses the image configured on the workspace, or a fixed default.
#[derive(Debug, Clone)]
pub struct PrebuiltImages {
    default_image: String,
}

impl PrebuiltImages {
    pub fn new(default_image: impl Into<String>) -> Self {
        Self {
            default_image: default_image.into(),
        }
    }
}

#[async_trait]
impl ImageBuilder for PrebuiltImages {
    async fn build(&self, version: &WorkspaceVersion) -> anyhow::Result<ImageCoordinates> {
        let image = version
            .config
            .base_image
            .clone()
            .unwrap_or_else(|| self.default_image.clone());
        if image.trim().is_empty() {
            anyhow::bail!("no image configured for workspace {}", version.id());
        }
        Ok(ImageCoordinates { image })
    }
}

pub struct ImageBuilds {
    builder: Arc<dyn ImageBuilder>,
    tasks: ReusableTasks<WorkspaceHash, ImageCoordinates>,
}

impl ImageBuilds {
    pub fn new(builder: Arc<dyn ImageBuilder>) -> Self {
        Self {
            builder,
            tasks: ReusableTasks::new(),
        }
    }

    fn task(&self, version: &WorkspaceVersion) -> TaskHandle<WorkspaceHash, ImageCoordinates> {
        self.tasks.get_or_create(version.hash().clone(), |hash| {
            let builder = self.builder.clone();
            let version = version.clone();
            let span = tracing::info_span!("image_build", workspace = %version.id(), hash = %hash);
            async move {
                tracing::info!("image build started");
                let result = builder.build(&version).await;
                match &result {
                    Ok(coords) => tracing::info!(image = %coords.image, "image build finished"),
                    Err(e) => tracing::warn!(error = %e, "image build failed"),
                }
                result
            }
            .instrument(span)
        })
    }

    /// Current state of the build for `version`, starting it if needed.
    pub fn status(&self, version: &WorkspaceVersion) -> BuildStatus {
        let handle = self.task(version);
        handle.launch();
        status_of(&handle)
    }

    /// Like [`Self::status`] but never starts a build.
    pub fn peek(&self, hash: &WorkspaceHash) -> BuildStatus {
        match self.tasks.get(hash) {
            Some(handle) => status_of(&handle),
            None => BuildStatus::NotStarted,
        }
    }

    pub async fn await_image(&self, version: &WorkspaceVersion) -> TaskResult<ImageCoordinates> {
        self.task(version).await_result().await
    }

    /// Forgets a finished build so the next query starts a new one.
    pub fn invalidate(&self, hash: &WorkspaceHash) -> bool {
        self.tasks.invalidate(hash).is_some()
    }
}

fn status_of(handle: &TaskHandle<WorkspaceHash, ImageCoordinates>) -> BuildStatus {
    match handle.state() {
        TaskState::Created => BuildStatus::NotStarted,
        TaskState::Active => BuildStatus::Building,
        TaskState::Completed | TaskState::Cancelled | TaskState::Unknown => match handle.try_result() {
            Some(Ok(coords)) => BuildStatus::Ready(coords),
            Some(Err(failure)) => BuildStatus::Failed(failure.message().to_string()),
            None => BuildStatus::Building,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wsman_model::{WorkspaceConfig, WorkspaceId};

    fn version(image: Option<&str>) -> WorkspaceVersion {
        WorkspaceVersion::new(WorkspaceConfig {
            id: WorkspaceId("abc".to_string()),
            name: String::new(),
            repositories: vec![],
            shared_instances: vec![],
            memory_limit: None,
            base_image: image.map(str::to_string),
        })
    }

    struct CountingBuilder {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ImageBuilder for CountingBuilder {
        async fn build(&self, version: &WorkspaceVersion) -> anyhow::Result<ImageCoordinates> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            if self.fail {
                anyhow::bail!("compiler exploded");
            }
            Ok(ImageCoordinates {
                image: format!("registry.local/{}:{}", version.id(), version.hash()),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn builds_run_once_per_version() {
        let builder = Arc::new(CountingBuilder {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let builds = ImageBuilds::new(builder.clone());
        let v = version(None);

        assert_eq!(builds.peek(v.hash()), BuildStatus::NotStarted);
        assert_eq!(builds.status(&v), BuildStatus::Building);
        let image = builds.await_image(&v).await.unwrap();
        assert!(builds.status(&v).is_ready());
        assert_eq!(builds.status(&v).image(), Some(image.image.as_str()));
        assert_eq!(builder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_stick_until_invalidated() {
        let builder = Arc::new(CountingBuilder {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let builds = ImageBuilds::new(builder.clone());
        let v = version(None);

        assert!(builds.await_image(&v).await.is_err());
        assert!(matches!(builds.status(&v), BuildStatus::Failed(m) if m.contains("compiler exploded")));
        assert_eq!(builder.calls.load(Ordering::SeqCst), 1);

        assert!(builds.invalidate(v.hash()));
        assert!(builds.await_image(&v).await.is_err());
        assert_eq!(builder.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn prebuilt_images_prefer_the_workspace_image() {
        let builder = PrebuiltImages::new("base:1");
        assert_eq!(builder.build(&version(Some("custom:2"))).await.unwrap().image, "custom:2");
        assert_eq!(builder.build(&version(None)).await.unwrap().image, "base:1");
    }
}
