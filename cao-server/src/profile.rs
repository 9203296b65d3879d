//! Agent profile store.
//!
//! A profile is a markdown file with YAML front-matter (`name`,
//! `description`, optional `provider`) and a system-prompt body, kept under
//! the user-scoped store (`~/.cao/agents`). `cao install` seeds the built-in
//! set.

use std::{path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    error::{OrchestratorError, Result},
    flow::{split_front_matter, FlowError},
    provider::ProviderKind,
};

#[derive(Debug, Clone, Serialize)]
pub struct AgentProfile {
    pub name: String,
    pub description: String,
    pub provider: Option<ProviderKind>,
    pub system_prompt: String,
}

#[derive(Debug, Deserialize)]
struct ProfileFrontMatter {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    provider: Option<String>,
}

pub fn parse_profile(content: &str) -> Result<AgentProfile, FlowError> {
    let (front, body) = split_front_matter(content)?;
    let meta: ProfileFrontMatter = serde_yaml::from_str(front)?;
    let provider = meta
        .provider
        .as_deref()
        .map(ProviderKind::from_str)
        .transpose()
        .map_err(FlowError::Provider)?;
    Ok(AgentProfile {
        name: meta.name,
        description: meta.description,
        provider,
        system_prompt: body.trim().to_string(),
    })
}

pub struct ProfileStore {
    dir: PathBuf,
}

/// Built-in profiles seeded by `cao install`: (file name, content).
const BUILTINS: &[(&str, &str)] = &[
    (
        "supervisor",
        include_str!("../profiles/supervisor.md"),
    ),
    (
        "developer",
        include_str!("../profiles/developer.md"),
    ),
    (
        "reviewer",
        include_str!("../profiles/reviewer.md"),
    ),
];

impl ProfileStore {
    pub fn open(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.md"))
    }

    pub fn get(&self, name: &str) -> Result<AgentProfile> {
        let path = self.path_for(name);
        let content = std::fs::read_to_string(&path)
            .map_err(|_| OrchestratorError::not_found(format!("agent profile '{name}'")))?;
        parse_profile(&content).map_err(OrchestratorError::from)
    }

    pub fn list(&self) -> Vec<AgentProfile> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut profiles: Vec<AgentProfile> = entries
            .flatten()
            .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("md"))
            .filter_map(|e| std::fs::read_to_string(e.path()).ok())
            .filter_map(|content| parse_profile(&content).ok())
            .collect();
        profiles.sort_by(|a, b| a.name.cmp(&b.name));
        profiles
    }

    pub fn save(&self, content: &str) -> Result<String> {
        let profile = parse_profile(content).map_err(OrchestratorError::from)?;
        std::fs::write(self.path_for(&profile.name), content)
            .map_err(|e| OrchestratorError::internal(e.to_string()))?;
        Ok(profile.name)
    }

    /// Write the built-in profiles. Existing files are left untouched so
    /// local edits survive re-installs.
    pub fn install_builtins(&self) -> std::io::Result<Vec<String>> {
        let mut installed = Vec::new();
        for (name, content) in BUILTINS {
            let path = self.path_for(name);
            if path.exists() {
                continue;
            }
            std::fs::write(&path, content)?;
            installed.push((*name).to_string());
        }
        Ok(installed)
    }
}
