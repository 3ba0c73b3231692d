use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static META_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"fleeting-meta:([a-z0-9\-]+)\s*=(.*)").expect("valid metadata pattern")
});

/// Placeholder substituted with the instance's public hostname in `ready-url`.
pub const HOST_PLACEHOLDER: &str = "{host}";

/// Extract `fleeting-meta:{key}={value}` directives from a bootstrap template.
///
/// Best effort: lines that don't match are ignored and the last occurrence of a key wins.
pub fn parse_metadata(script: &str) -> HashMap<String, String> {
    let mut meta = HashMap::new();
    for line in script.lines() {
        if let Some(caps) = META_RE.captures(line) {
            meta.insert(caps[1].to_string(), caps[2].trim().to_string());
        }
    }
    meta
}

/// A project: its bootstrap script template and the metadata embedded in it.
#[derive(Debug, Clone)]
pub struct Project {
    pub id: String,
    pub script: String,
    pub meta: HashMap<String, String>,
}

impl Project {
    pub fn new(id: &str, script: &str) -> Self {
        Self {
            id: id.to_string(),
            script: script.to_string(),
            meta: parse_metadata(script),
        }
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.meta
            .get(key)
            .map(|v| v.as_str())
            .filter(|v| !v.is_empty())
    }

    /// Repository name part of the `repo` metadata (`owner/name`).
    pub fn repo_name(&self) -> Option<&str> {
        let repo = self.meta("repo")?;
        repo.rsplit('/').next().filter(|name| !name.is_empty())
    }

    /// Health URL of an instance reachable at `host`.
    pub fn ready_url(&self, host: &str) -> String {
        self.meta("ready-url")
            .unwrap_or("http://{host}/")
            .replace(HOST_PLACEHOLDER, host)
    }

    /// Substitute `{{name}}` placeholders; unknown placeholders stay as they are.
    pub fn render(&self, vars: &BTreeMap<String, String>) -> String {
        let mut out = self.script.clone();
        for (name, value) in vars {
            out = out.replace(&format!("{{{{{}}}}}", name), value);
        }
        out
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    #[error("cannot read projects directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot read project template {path}: {source}")]
    ReadTemplate {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Static directory holding one bootstrap template per project; the file stem is the id.
#[derive(Debug, Clone)]
pub struct ProjectDirectory {
    root: PathBuf,
}

impl ProjectDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map of project id to template path. Hidden files are skipped.
    pub fn project_map(&self) -> Result<BTreeMap<String, PathBuf>, ProjectError> {
        let entries = std::fs::read_dir(&self.root).map_err(|source| ProjectError::ReadDir {
            path: self.root.clone(),
            source,
        })?;
        let mut map = BTreeMap::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if file_name.starts_with('.') || !path.is_file() {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                map.insert(stem.to_string(), path.clone());
            }
        }
        Ok(map)
    }

    pub fn ids(&self) -> Result<Vec<String>, ProjectError> {
        Ok(self.project_map()?.into_keys().collect())
    }

    /// Load a project fresh from disk; `None` for unknown ids.
    pub fn load(&self, id: &str) -> Result<Option<Project>, ProjectError> {
        let map = self.project_map()?;
        let Some(path) = map.get(id) else {
            return Ok(None);
        };
        let script = std::fs::read_to_string(path).map_err(|source| ProjectError::ReadTemplate {
            path: path.clone(),
            source,
        })?;
        Ok(Some(Project::new(id, &script)))
    }
}
