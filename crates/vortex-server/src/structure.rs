//! Project and namespace structure.
//!
//! The structure maps a project id to its secret, connection-lifetime
//! policy, and per-namespace channel options. It is resolved from the TOML
//! configuration and can be reloaded at runtime via the `update_structure`
//! control message.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use thiserror::Error;
use tracing::info;
use vortex_core::channel;

use crate::config::Config;

/// Feature flags resolved per channel namespace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelOptions {
    /// Allow client-originated publish.
    #[serde(default)]
    pub publish: bool,

    /// Allow anonymous (empty-user) subscribers.
    #[serde(default)]
    pub anonymous: bool,

    /// Enable the presence feature.
    #[serde(default)]
    pub presence: bool,

    /// History list size cap. Zero disables history.
    #[serde(default)]
    pub history_size: usize,

    /// History list expiry in seconds. Zero means size eviction only.
    #[serde(default)]
    pub history_lifetime: u64,

    /// Broadcast join/leave notices to subscribers.
    #[serde(default)]
    pub join_leave: bool,

    /// Require the external authorization round-trip before subscribing.
    #[serde(default)]
    pub is_private: bool,

    /// Mirror publishes to the admin channel.
    #[serde(default)]
    pub is_watching: bool,
}

/// A project's resolved structure.
#[derive(Debug, Clone)]
pub struct Project {
    /// Project id.
    pub id: String,
    /// Shared HMAC secret.
    pub secret: String,
    /// Credential lifetime in seconds; zero disables expiry checking.
    pub connection_lifetime: u64,
    /// Options for channels without a namespace.
    pub default_options: ChannelOptions,
    /// Namespace name → options.
    pub namespaces: HashMap<String, ChannelOptions>,
}

/// Structure lookup failures.
#[derive(Debug, Error)]
pub enum StructureError {
    /// Backing store failure; maps to an internal-error response.
    #[error("Structure store failure: {0}")]
    Internal(String),
}

/// Read access to project/namespace structure.
///
/// `Ok(None)` means the entity does not exist and maps to a not-found
/// response; `Err` maps to an internal-error response.
pub trait Structure: Send + Sync {
    /// Look up a project by id.
    fn get_project_by_id(&self, id: &str) -> Result<Option<Project>, StructureError>;

    /// Look up a namespace's options inside a project.
    fn get_namespace(
        &self,
        project: &str,
        name: &str,
    ) -> Result<Option<ChannelOptions>, StructureError>;

    /// All known projects.
    fn project_list(&self) -> Result<Vec<Project>, StructureError>;

    /// All namespace names of a project.
    fn namespace_list(&self, project: &str) -> Result<Vec<String>, StructureError>;

    /// Re-read the structure from its backing source.
    fn reload(&self) -> Result<(), StructureError>;

    /// Resolve the channel options governing a channel name: the
    /// namespace's options when the channel is namespaced, the project
    /// defaults otherwise. `Ok(None)` when the project or the named
    /// namespace does not exist.
    fn channel_options(
        &self,
        project: &str,
        channel_name: &str,
    ) -> Result<Option<ChannelOptions>, StructureError> {
        match channel::namespace_of(channel_name) {
            Some(namespace) => self.get_namespace(project, namespace),
            None => Ok(self
                .get_project_by_id(project)?
                .map(|p| p.default_options)),
        }
    }
}

/// Structure resolved from the TOML configuration.
pub struct ConfigStructure {
    /// Config file to re-read on reload; `None` makes reload a no-op.
    path: Option<PathBuf>,
    projects: RwLock<HashMap<String, Project>>,
}

impl ConfigStructure {
    /// Build the structure from a loaded configuration.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            path: config.path.clone(),
            projects: RwLock::new(Self::index(config)),
        }
    }

    fn index(config: &Config) -> HashMap<String, Project> {
        config
            .projects
            .iter()
            .map(|p| {
                let namespaces = p
                    .namespaces
                    .iter()
                    .map(|ns| (ns.name.clone(), ns.options.clone()))
                    .collect();
                (
                    p.id.clone(),
                    Project {
                        id: p.id.clone(),
                        secret: p.secret.clone(),
                        connection_lifetime: p.connection_lifetime,
                        default_options: p.options.clone(),
                        namespaces,
                    },
                )
            })
            .collect()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, Project>>, StructureError> {
        self.projects
            .read()
            .map_err(|e| StructureError::Internal(e.to_string()))
    }
}

impl Structure for ConfigStructure {
    fn get_project_by_id(&self, id: &str) -> Result<Option<Project>, StructureError> {
        Ok(self.read()?.get(id).cloned())
    }

    fn get_namespace(
        &self,
        project: &str,
        name: &str,
    ) -> Result<Option<ChannelOptions>, StructureError> {
        Ok(self
            .read()?
            .get(project)
            .and_then(|p| p.namespaces.get(name).cloned()))
    }

    fn project_list(&self) -> Result<Vec<Project>, StructureError> {
        Ok(self.read()?.values().cloned().collect())
    }

    fn namespace_list(&self, project: &str) -> Result<Vec<String>, StructureError> {
        Ok(self
            .read()?
            .get(project)
            .map(|p| p.namespaces.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn reload(&self) -> Result<(), StructureError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let config =
            Config::from_file(path).map_err(|e| StructureError::Internal(e.to_string()))?;
        let mut projects = self
            .projects
            .write()
            .map_err(|e| StructureError::Internal(e.to_string()))?;
        *projects = Self::index(&config);
        info!(path = %path.display(), projects = projects.len(), "Structure reloaded");
        Ok(())
    }
}
