use crate::engine::project::{Build, BuildStatus, Project};
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Identifiers arrive as integers from older endpoints and strings from newer ones.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WireId {
    Int(u64),
    Str(String),
}

impl std::fmt::Display for WireId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireId::Int(n) => write!(f, "{}", n),
            WireId::Str(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthResponse {
    pub access_token: String,
    /// Unix seconds, sometimes fractional.
    pub expires_at: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectsResponse {
    pub projects: Vec<WireProject>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireProject {
    pub id: WireId,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default, alias = "name")]
    pub repository_name: Option<String>,
    #[serde(default)]
    pub repository_url: Option<String>,
    #[serde(default)]
    pub builds: Vec<WireBuild>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BuildsResponse {
    pub builds: Vec<WireBuild>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireBuild {
    pub id: WireId,
    pub uuid: String,
    pub status: String,
    #[serde(default)]
    pub commit_id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub branch: String,
    pub started_at: String,
    #[serde(default)]
    pub finished_at: Option<String>,
    #[serde(default)]
    pub github_username: Option<String>,
}

/// Parse provider timestamps: RFC 3339, or `2015-10-02T14:05:09.123+0000`.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z"))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

impl WireBuild {
    pub fn into_build(self) -> Result<Build, String> {
        let started_at = parse_timestamp(&self.started_at)
            .ok_or_else(|| format!("build {}: bad started_at {:?}", self.id, self.started_at))?;
        let finished_at = match self.finished_at.as_deref() {
            None | Some("") => None,
            Some(raw) => Some(
                parse_timestamp(raw)
                    .ok_or_else(|| format!("build {}: bad finished_at {:?}", self.id, raw))?,
            ),
        };
        Ok(Build {
            id: self.id.to_string(),
            uuid: self.uuid,
            status: BuildStatus::from_api(&self.status),
            commit_id: self.commit_id,
            message: self.message,
            branch: self.branch,
            started_at,
            finished_at,
            author_name: self.github_username.filter(|n| !n.is_empty()),
        })
    }
}

pub fn into_builds(wire: Vec<WireBuild>) -> Result<Vec<Build>, String> {
    wire.into_iter().map(WireBuild::into_build).collect()
}

impl WireProject {
    /// Unnamed projects are dropped (`Ok(None)`), matching what the provider UI lists.
    pub fn into_project(self) -> Result<Option<Project>, String> {
        let Some(name) = self.repository_name.filter(|n| !n.is_empty()) else {
            return Ok(None);
        };
        let id = self.id.to_string();
        let builds = into_builds(self.builds).map_err(|e| format!("project {}: {}", id, e))?;
        Ok(Some(Project::new(id, name, self.repository_url.unwrap_or_default(), builds)))
    }
}

impl ProjectsResponse {
    pub fn into_projects(self) -> Result<Vec<Project>, String> {
        let mut out = Vec::with_capacity(self.projects.len());
        for wire in self.projects {
            if let Some(project) = wire.into_project()? {
                out.push(project);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_projects_document() {
        let json = r#"{
            "projects": [
                {
                    "id": 42,
                    "uuid": "0b3c",
                    "repository_name": "acme/api",
                    "repository_url": "https://github.com/acme/api",
                    "builds": [
                        {
                            "id": 1, "uuid": "b1", "status": "success",
                            "commit_id": "abc", "message": "old", "branch": "main",
                            "started_at": "2026-03-01T09:00:00.000+0000",
                            "finished_at": "2026-03-01T09:04:00.000+0000",
                            "github_username": "erin"
                        },
                        {
                            "id": 2, "uuid": "b2", "status": "testing",
                            "commit_id": "def", "message": "new", "branch": "main",
                            "started_at": "2026-03-01T10:00:00Z",
                            "finished_at": null
                        }
                    ]
                },
                { "id": "anon", "builds": [] }
            ]
        }"#;
        let parsed: ProjectsResponse = serde_json::from_str(json).unwrap();
        let projects = parsed.into_projects().unwrap();
        assert_eq!(projects.len(), 1, "unnamed project dropped");
        let p = &projects[0];
        assert_eq!(p.id, "42");
        assert_eq!(p.name, "acme/api");
        assert_eq!(p.builds()[0].id, "2");
        assert_eq!(p.status(), BuildStatus::Building);
        assert_eq!(p.builds()[1].author_name.as_deref(), Some("erin"));
        assert!(p.builds()[1].finished_at.is_some());
        assert!(p.builds()[0].finished_at.is_none());
    }

    #[test]
    fn test_name_alias_and_string_ids() {
        let json = r#"{"projects":[{"id":"p-1","name":"web","builds":[]}]}"#;
        let parsed: ProjectsResponse = serde_json::from_str(json).unwrap();
        let projects = parsed.into_projects().unwrap();
        assert_eq!(projects[0].id, "p-1");
        assert_eq!(projects[0].name, "web");
        assert_eq!(projects[0].repository_url, "");
    }

    #[test]
    fn test_bad_timestamp_is_an_error() {
        let json = r#"{"id":1,"uuid":"u","status":"success","started_at":"yesterday"}"#;
        let wire: WireBuild = serde_json::from_str(json).unwrap();
        let err = wire.into_build().unwrap_err();
        assert!(err.contains("started_at"), "{}", err);
    }

    #[test]
    fn test_missing_required_field_fails_deserialize() {
        let json = r#"{"id":1,"status":"success","started_at":"2026-03-01T10:00:00Z"}"#;
        assert!(serde_json::from_str::<WireBuild>(json).is_err());
    }

    #[test]
    fn test_parse_timestamp_formats() {
        assert!(parse_timestamp("2026-03-01T10:00:00Z").is_some());
        assert!(parse_timestamp("2026-03-01T10:00:00.123+00:00").is_some());
        assert!(parse_timestamp("2026-03-01T10:00:00.123-0500").is_some());
        assert!(parse_timestamp("2026-03-01").is_none());
    }
}
