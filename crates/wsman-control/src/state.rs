use std::sync::Arc;
use std::time::Duration;

use crate::git::GitTasks;
use crate::manager::Manager;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<Manager>,
    pub git: Arc<GitTasks>,
    /// Upstream client for proxied HTTP requests. Redirects are passed
    /// through to the caller untouched.
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(manager: Arc<Manager>, git: Arc<GitTasks>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { manager, git, http })
    }
}
