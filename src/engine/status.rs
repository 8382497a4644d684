use super::project::{BuildStatus, Project};
use std::fmt;

/// One indicator summarizing every enabled project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateStatus {
    Unknown,
    Passing,
    Failing,
    Building,
}

impl fmt::Display for AggregateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AggregateStatus::Unknown => "unknown",
            AggregateStatus::Passing => "passing",
            AggregateStatus::Failing => "failing",
            AggregateStatus::Building => "building",
        };
        f.write_str(label)
    }
}

/// Fold enabled projects into one status. Priority: failing > building > passing.
/// No enabled projects yields `Unknown`. Input order never matters.
pub fn aggregate(projects: &[Project]) -> AggregateStatus {
    let mut any_enabled = false;
    let mut any_building = false;

    for project in projects.iter().filter(|p| p.is_enabled()) {
        any_enabled = true;
        match project.status() {
            BuildStatus::Failing => return AggregateStatus::Failing,
            BuildStatus::Building => any_building = true,
            BuildStatus::Passing | BuildStatus::Unknown => {}
        }
    }

    if !any_enabled {
        AggregateStatus::Unknown
    } else if any_building {
        AggregateStatus::Building
    } else {
        AggregateStatus::Passing
    }
}
