use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

/// Stable project identifier as reported by the CI provider.
pub type ProjectId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildStatus {
    Unknown,
    Building,
    Passing,
    Failing,
}

impl BuildStatus {
    /// Map a provider status string onto the four states we track.
    pub fn from_api(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "success" | "passed" | "passing" => BuildStatus::Passing,
            "testing" | "waiting" | "initiated" | "building" | "queued" => BuildStatus::Building,
            "error" | "failed" | "failing" | "stopped" | "infrastructure_failure" => {
                BuildStatus::Failing
            }
            _ => BuildStatus::Unknown,
        }
    }
}

/// Immutable snapshot of one build.
#[derive(Debug, Clone, PartialEq)]
pub struct Build {
    pub id: String,
    pub uuid: String,
    pub status: BuildStatus,
    pub commit_id: String,
    pub message: String,
    pub branch: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub author_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub repository_url: String,
    builds: Vec<Build>,
    is_enabled: bool,
}

impl Project {
    /// New projects start enabled until merged against settings.
    pub fn new(id: impl Into<ProjectId>, name: impl Into<String>, repository_url: impl Into<String>, builds: Vec<Build>) -> Self {
        let mut project = Self {
            id: id.into(),
            name: name.into(),
            repository_url: repository_url.into(),
            builds: Vec::new(),
            is_enabled: true,
        };
        project.replace_builds(builds);
        project
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.is_enabled = enabled;
        self
    }

    /// Builds, most recently started first.
    pub fn builds(&self) -> &[Build] {
        &self.builds
    }

    pub fn latest_build(&self) -> Option<&Build> {
        self.builds.first()
    }

    pub fn status(&self) -> BuildStatus {
        self.latest_build().map_or(BuildStatus::Unknown, |b| b.status)
    }

    pub fn is_enabled(&self) -> bool {
        self.is_enabled
    }

    /// Swap in a fresh build list wholesale.
    pub fn replace_builds(&mut self, mut builds: Vec<Build>) {
        // Stable sort keeps provider order for identical start times.
        builds.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        self.builds = builds;
    }

    pub(crate) fn apply_enablement(&mut self, disabled: &BTreeSet<ProjectId>) {
        self.is_enabled = !disabled.contains(&self.id);
    }
}

/// Recompute `is_enabled` for every project from the disabled set.
pub fn merge_enablement(projects: &mut [Project], disabled: &BTreeSet<ProjectId>) {
    for project in projects.iter_mut() {
        project.apply_enablement(disabled);
    }
}
