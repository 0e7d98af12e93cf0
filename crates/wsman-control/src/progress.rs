//! Startup progress shown while an instance is not ready yet.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use wsman_model::InstanceName;

use crate::builds::BuildStatus;
use crate::cluster::PodPhase;

/// Log lines printed by the instance image while it boots, in order.
const LOG_MARKERS: &[(&str, u8, &str)] = &[
    ("container is starting...", 50, "Container is starting"),
    ("starting service 'app'...", 60, "Starting application service"),
    ("+ /mps/bin/mps.sh", 70, "Starting MPS"),
    ("Workspace client loaded", 80, "Workspace client loaded"),
    ("Index is ready", 90, "Indexing finished"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub percent: u8,
    pub status: String,
    pub failed: bool,
}

impl Progress {
    fn at(percent: u8, status: impl Into<String>) -> Self {
        Self {
            percent,
            status: status.into(),
            failed: false,
        }
    }

    fn failed(percent: u8, status: impl Into<String>) -> Self {
        Self {
            failed: true,
            ..Self::at(percent, status)
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProgressInput<'a> {
    pub build: &'a BuildStatus,
    pub deployment_exists: bool,
    pub pod_phase: Option<PodPhase>,
    pub logs: &'a str,
    pub ready: bool,
}

pub fn estimate(input: ProgressInput<'_>) -> Progress {
    match input.build {
        BuildStatus::NotStarted => return Progress::at(0, "Waiting for the image build"),
        BuildStatus::Building => return Progress::at(5, "Building the workspace image"),
        BuildStatus::Failed(message) => return Progress::failed(10, format!("Image build failed: {message}")),
        BuildStatus::Ready(_) => {}
    }
    if input.ready {
        return Progress::at(100, "Ready");
    }
    if !input.deployment_exists {
        return Progress::at(20, "Waiting for the container to be created");
    }
    match input.pod_phase {
        None | Some(PodPhase::Pending) | Some(PodPhase::Unknown) => Progress::at(30, "Container created"),
        Some(PodPhase::Failed) | Some(PodPhase::Succeeded) => Progress::failed(30, "Container stopped"),
        Some(PodPhase::Running) => LOG_MARKERS
            .iter()
            .rev()
            .find(|(marker, _, _)| input.logs.contains(marker))
            .map(|(_, percent, status)| Progress::at(*percent, *status))
            .unwrap_or_else(|| Progress::at(40, "Container running")),
    }
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Self-refreshing status page.
pub fn render_page(workspace: &str, progress: &Progress) -> String {
    let refresh = if progress.failed {
        String::new()
    } else {
        r#"<meta http-equiv="refresh" content="3">"#.to_string()
    };
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
{refresh}
<title>Starting workspace</title>
<style>
body {{ font-family: sans-serif; margin: 4em auto; max-width: 40em; }}
.bar {{ background: #ddd; height: 1.2em; border-radius: 4px; }}
.fill {{ background: {color}; height: 100%; width: {percent}%; border-radius: 4px; }}
</style>
</head>
<body>
<h2>Workspace {workspace}</h2>
<div class="bar"><div class="fill"></div></div>
<p>{percent}% &middot; {status}</p>
</body>
</html>
"#,
        refresh = refresh,
        color = if progress.failed { "#c33" } else { "#3a7" },
        percent = progress.percent,
        workspace = escape_html(workspace),
        status = escape_html(&progress.status),
    )
}

/// Short-lived cache of readiness probes, so every proxied request does not
/// hit the cluster API.
#[derive(Debug)]
pub struct ReadinessCache {
    ttl: Duration,
    entries: Mutex<HashMap<InstanceName, (bool, Instant)>>,
}

impl ReadinessCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, instance: &InstanceName) -> Option<bool> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(instance)
            .filter(|(_, at)| at.elapsed() < self.ttl)
            .map(|(ready, _)| *ready)
    }

    pub fn put(&self, instance: &InstanceName, ready: bool) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(instance.clone(), (ready, Instant::now()));
    }

    pub fn retain(&self, mut keep: impl FnMut(&InstanceName) -> bool) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|name, _| keep(name));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builds::ImageCoordinates;

    fn ready_build() -> BuildStatus {
        BuildStatus::Ready(ImageCoordinates {
            image: "img".to_string(),
        })
    }

    fn running(build: &BuildStatus, logs: &str) -> Progress {
        estimate(ProgressInput {
            build,
            deployment_exists: true,
            pod_phase: Some(PodPhase::Running),
            logs,
            ready: false,
        })
    }

    #[test]
    fn progress_advances_through_stages() {
        let build = ready_build();
        let building = BuildStatus::Building;
        let mut last = 0;
        for input in [
            ProgressInput { build: &building, deployment_exists: false, pod_phase: None, logs: "", ready: false },
            ProgressInput { build: &build, deployment_exists: false, pod_phase: None, logs: "", ready: false },
            ProgressInput { build: &build, deployment_exists: true, pod_phase: Some(PodPhase::Pending), logs: "", ready: false },
            ProgressInput { build: &build, deployment_exists: true, pod_phase: Some(PodPhase::Running), logs: "", ready: false },
            ProgressInput { build: &build, deployment_exists: true, pod_phase: Some(PodPhase::Running), logs: "x\ncontainer is starting...\n", ready: false },
            ProgressInput { build: &build, deployment_exists: true, pod_phase: Some(PodPhase::Running), logs: "Index is ready", ready: false },
            ProgressInput { build: &build, deployment_exists: true, pod_phase: Some(PodPhase::Running), logs: "", ready: true },
        ] {
            let p = estimate(input);
            assert!(p.percent > last, "{p:?}");
            last = p.percent;
        }
        assert_eq!(last, 100);
    }

    #[test]
    fn latest_marker_wins() {
        let build = ready_build();
        let logs = "container is starting...\nstarting service 'app'...\n+ /mps/bin/mps.sh\nWorkspace client loaded\n";
        assert_eq!(running(&build, logs).percent, 80);
    }

    #[test]
    fn failures_are_flagged_and_page_does_not_refresh() {
        let failed = estimate(ProgressInput {
            build: &BuildStatus::Failed("boom".to_string()),
            deployment_exists: false,
            pod_phase: None,
            logs: "",
            ready: false,
        });
        assert!(failed.failed);
        let page = render_page("abc<script>", &failed);
        assert!(!page.contains("http-equiv"));
        assert!(page.contains("abc&lt;script&gt;"));

        let page = render_page("abc", &running(&ready_build(), ""));
        assert!(page.contains("http-equiv=\"refresh\""));
        assert!(page.contains("40%"));
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_cache_expires() {
        let cache = ReadinessCache::new(Duration::from_secs(2));
        let a = InstanceName("a".to_string());
        cache.put(&a, true);
        assert_eq!(cache.get(&a), Some(true));
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(cache.get(&a), None);
        cache.retain(|_| false);
        assert!(cache.is_empty());
    }
}
