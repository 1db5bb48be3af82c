// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Service Installer
//!
//! Lands external tool servers on disk through one of four methods:
//! descriptor download (`config_only`), essential-file fetch
//! (`lightweight`), git clone (`full_clone`) or image pull
//! (`container_image`). A written `installation_config.json` is the marker
//! that a service is installed; re-installing an installed service returns
//! the existing config untouched.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::domain::identity::ToolId;
use crate::domain::service::{
    DescriptorCapability, InstallMethod, ServiceConfig, ServiceDescriptor, ServiceHealth,
    ServiceMetadata, ServiceStatus, ServiceType, SupervisionPolicy, Transport,
};
use crate::infrastructure::container_runtime::ContainerRuntime;

const CONFIG_FILE: &str = "installation_config.json";
const RESULT_FILE: &str = "installation_result.json";
const CLONE_TIMEOUT: Duration = Duration::from_secs(60);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Files worth having without a working copy of the repository.
const ESSENTIAL_FILES: &[&str] = &[
    "README.md",
    "requirements.txt",
    "pyproject.toml",
    "setup.py",
    "package.json",
];

#[derive(Debug, Clone, thiserror::Error)]
pub enum InstallError {
    #[error("install spec is missing '{0}'")]
    MissingField(&'static str),

    #[error("not a usable repository URL: {0}")]
    InvalidUrl(String),

    #[error("download of {url} failed: {message}")]
    DownloadFailed { url: String, message: String },

    #[error("no essential files could be fetched from {0}")]
    NothingFetched(String),

    #[error("git clone failed: {0}")]
    CloneFailed(String),

    #[error("git clone timed out after {0:?}")]
    CloneTimeout(Duration),

    #[error("image pull failed: {0}")]
    ImagePull(String),

    #[error("descriptor is invalid: {0}")]
    Descriptor(String),

    #[error("io error: {0}")]
    Io(String),
}

/// What a caller asks the installer to install.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InstallSpec {
    pub service_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub install_method: InstallMethod,
    /// Descriptor URL (`config_only`) or repository URL (`lightweight`,
    /// `full_clone`).
    pub source_url: Option<String>,
    pub container_image: Option<String>,
    pub entry_point: Option<String>,
    #[serde(default)]
    pub transport: Option<Transport>,
    #[serde(default)]
    pub capabilities: Vec<DescriptorCapability>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Container-internal port for `container_image` services.
    pub container_port: Option<u16>,
}

impl InstallSpec {
    fn resolved_service_id(&self) -> ToolId {
        let raw = self.service_id.clone().unwrap_or_else(|| self.name.clone());
        let sanitized: String = raw
            .to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        ToolId::new(sanitized.trim_matches('_').to_string())
    }
}

/// Parsed `github.com/owner/repo` coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoCoordinates {
    pub owner: String,
    pub repo: String,
}

pub fn parse_github_url(url: &str) -> Result<RepoCoordinates, InstallError> {
    let trimmed = url
        .trim_end_matches('/')
        .trim_end_matches(".git")
        .strip_prefix("https://github.com/")
        .or_else(|| url.trim_end_matches('/').trim_end_matches(".git").strip_prefix("http://github.com/"))
        .ok_or_else(|| InstallError::InvalidUrl(url.to_string()))?;
    let mut parts = trimmed.splitn(2, '/');
    let owner = parts.next().filter(|s| !s.is_empty());
    let repo = parts.next().filter(|s| !s.is_empty());
    match (owner, repo) {
        (Some(owner), Some(repo)) => Ok(RepoCoordinates {
            owner: owner.to_string(),
            repo: repo.split('/').next().unwrap_or(repo).to_string(),
        }),
        _ => Err(InstallError::InvalidUrl(url.to_string())),
    }
}

/// Installs external tool servers under the install root.
pub struct ServiceInstaller {
    install_root: PathBuf,
    runtime: ContainerRuntime,
    http: reqwest::Client,
    /// Base of the raw-file host for lightweight installs. Overridable so
    /// tests can point at a local server.
    raw_base: String,
}

impl ServiceInstaller {
    pub fn new(install_root: PathBuf, runtime: ContainerRuntime) -> Self {
        Self {
            install_root,
            runtime,
            http: reqwest::Client::new(),
            raw_base: "https://raw.githubusercontent.com".to_string(),
        }
    }

    pub fn with_raw_base(mut self, raw_base: impl Into<String>) -> Self {
        self.raw_base = raw_base.into();
        self
    }

    pub fn install_dir(&self, service_id: &ToolId) -> PathBuf {
        self.install_root.join(service_id.as_str())
    }

    pub fn is_installed(&self, service_id: &ToolId) -> bool {
        self.install_dir(service_id).join(CONFIG_FILE).is_file()
    }

    /// Install a service. Idempotent: an installed service's existing config
    /// is returned as-is, with no directory churn.
    pub async fn install(&self, spec: &InstallSpec) -> Result<ServiceConfig, InstallError> {
        let service_id = spec.resolved_service_id();
        if service_id.as_str().is_empty() {
            return Err(InstallError::MissingField("name"));
        }

        if self.is_installed(&service_id) {
            info!(service = %service_id, "already installed, returning existing config");
            return self.load_config(&service_id);
        }

        let dir = self.install_dir(&service_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| InstallError::Io(e.to_string()))?;

        let mut descriptor: Option<ServiceDescriptor> = None;
        match spec.install_method {
            InstallMethod::None => {}
            InstallMethod::ConfigOnly => {
                let url = spec
                    .source_url
                    .as_deref()
                    .ok_or(InstallError::MissingField("source_url"))?;
                descriptor = Some(self.download_descriptor(url, &dir).await?);
            }
            InstallMethod::Lightweight => {
                let url = spec
                    .source_url
                    .as_deref()
                    .ok_or(InstallError::MissingField("source_url"))?;
                self.fetch_essential_files(url, spec.entry_point.as_deref(), &dir)
                    .await?;
            }
            InstallMethod::FullClone => {
                let url = spec
                    .source_url
                    .as_deref()
                    .ok_or(InstallError::MissingField("source_url"))?;
                self.clone_repository(url, &dir).await?;
            }
            InstallMethod::ContainerImage => {
                let image = spec
                    .container_image
                    .as_deref()
                    .ok_or(InstallError::MissingField("container_image"))?;
                self.runtime
                    .pull(image)
                    .await
                    .map_err(|e| InstallError::ImagePull(e.to_string()))?;
            }
        }

        let config = self.build_config(&service_id, spec, descriptor, &dir);
        self.save_config(&config).await?;
        info!(service = %service_id, method = ?spec.install_method, "service installed");
        Ok(config)
    }

    /// Remove an installed service's directory. Stopping it first is the
    /// container's job.
    pub async fn uninstall(&self, service_id: &ToolId) -> Result<(), InstallError> {
        let dir = self.install_dir(service_id);
        if !dir.exists() {
            return Ok(());
        }
        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(|e| InstallError::Io(e.to_string()))?;
        info!(service = %service_id, "service uninstalled");
        Ok(())
    }

    /// Service ids with an installation marker on disk.
    pub fn list_installed(&self) -> Vec<ToolId> {
        let Ok(entries) = std::fs::read_dir(&self.install_root) else {
            return Vec::new();
        };
        let mut ids: Vec<ToolId> = entries
            .flatten()
            .filter(|e| e.path().join(CONFIG_FILE).is_file())
            .filter_map(|e| e.file_name().to_str().map(ToolId::new))
            .collect();
        ids.sort();
        ids
    }

    /// Reload every persisted service config. Corrupt entries are logged
    /// and skipped; one bad install never blocks the fleet.
    pub fn load_installed(&self) -> Vec<ServiceConfig> {
        self.list_installed()
            .into_iter()
            .filter_map(|id| match self.load_config(&id) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!(service = %id, error = %e, "skipping corrupt installed config");
                    None
                }
            })
            .collect()
    }

    pub fn load_config(&self, service_id: &ToolId) -> Result<ServiceConfig, InstallError> {
        let path = self.install_dir(service_id).join(CONFIG_FILE);
        let raw = std::fs::read_to_string(&path).map_err(|e| InstallError::Io(e.to_string()))?;
        serde_json::from_str(&raw).map_err(|e| InstallError::Descriptor(e.to_string()))
    }

    /// Persist the canonical `installation_config.json` marker.
    pub async fn save_config(&self, config: &ServiceConfig) -> Result<(), InstallError> {
        let dir = self.install_dir(&config.service_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| InstallError::Io(e.to_string()))?;
        let raw = serde_json::to_string_pretty(config)
            .map_err(|e| InstallError::Descriptor(e.to_string()))?;
        tokio::fs::write(dir.join(CONFIG_FILE), raw)
            .await
            .map_err(|e| InstallError::Io(e.to_string()))
    }

    /// Persist the most recent installation result beside the config.
    pub async fn save_result(
        &self,
        service_id: &ToolId,
        result: &crate::domain::service::InstallationResult,
    ) -> Result<(), InstallError> {
        let dir = self.install_dir(service_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| InstallError::Io(e.to_string()))?;
        let raw = serde_json::to_string_pretty(result)
            .map_err(|e| InstallError::Descriptor(e.to_string()))?;
        tokio::fs::write(dir.join(RESULT_FILE), raw)
            .await
            .map_err(|e| InstallError::Io(e.to_string()))
    }

    async fn download_descriptor(
        &self,
        url: &str,
        dir: &Path,
    ) -> Result<ServiceDescriptor, InstallError> {
        let response = self
            .http
            .get(url)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await
            .map_err(|e| InstallError::DownloadFailed {
                url: url.to_string(),
                message: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(InstallError::DownloadFailed {
                url: url.to_string(),
                message: format!("status {}", response.status()),
            });
        }
        let raw = response.text().await.map_err(|e| InstallError::DownloadFailed {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        let descriptor: ServiceDescriptor =
            serde_json::from_str(&raw).map_err(|e| InstallError::Descriptor(e.to_string()))?;
        tokio::fs::write(dir.join("service.json"), &raw)
            .await
            .map_err(|e| InstallError::Io(e.to_string()))?;
        Ok(descriptor)
    }

    async fn fetch_essential_files(
        &self,
        repo_url: &str,
        entry_point: Option<&str>,
        dir: &Path,
    ) -> Result<usize, InstallError> {
        let coords = parse_github_url(repo_url)?;

        let mut wanted: Vec<String> = ESSENTIAL_FILES.iter().map(|s| s.to_string()).collect();
        if let Some(entry) = entry_point {
            if !wanted.iter().any(|f| f == entry) {
                wanted.push(entry.to_string());
            }
        }

        let mut fetched = 0;
        for file in &wanted {
            let mut ok = false;
            for branch in ["main", "master"] {
                let url = format!(
                    "{}/{}/{}/{}/{}",
                    self.raw_base, coords.owner, coords.repo, branch, file
                );
                match self.http.get(&url).timeout(DOWNLOAD_TIMEOUT).send().await {
                    Ok(response) if response.status().is_success() => {
                        let body = response.bytes().await.map_err(|e| {
                            InstallError::DownloadFailed {
                                url: url.clone(),
                                message: e.to_string(),
                            }
                        })?;
                        if let Some(parent) = dir.join(file).parent() {
                            tokio::fs::create_dir_all(parent)
                                .await
                                .map_err(|e| InstallError::Io(e.to_string()))?;
                        }
                        tokio::fs::write(dir.join(file), &body)
                            .await
                            .map_err(|e| InstallError::Io(e.to_string()))?;
                        ok = true;
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        debug!(url = %url, error = %e, "essential file fetch failed");
                        continue;
                    }
                }
            }
            if ok {
                fetched += 1;
            }
        }

        if fetched == 0 {
            return Err(InstallError::NothingFetched(repo_url.to_string()));
        }
        debug!(repo = repo_url, fetched, "lightweight install fetched files");
        Ok(fetched)
    }

    async fn clone_repository(&self, url: &str, dir: &Path) -> Result<(), InstallError> {
        let url = url.to_string();
        // Clone into a subdirectory so the install marker lives beside, not
        // inside, the working copy.
        let checkout = dir.join("repo");
        let clone = tokio::task::spawn_blocking(move || {
            git2::Repository::clone(&url, &checkout).map(|_| ())
        });
        match tokio::time::timeout(CLONE_TIMEOUT, clone).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(InstallError::CloneFailed(e.to_string())),
            Ok(Err(join)) => Err(InstallError::CloneFailed(join.to_string())),
            Err(_) => Err(InstallError::CloneTimeout(CLONE_TIMEOUT)),
        }
    }

    fn build_config(
        &self,
        service_id: &ToolId,
        spec: &InstallSpec,
        descriptor: Option<ServiceDescriptor>,
        dir: &Path,
    ) -> ServiceConfig {
        let service_type = match spec.install_method {
            InstallMethod::ContainerImage => ServiceType::Container,
            _ => ServiceType::External,
        };
        let working_directory = match spec.install_method {
            InstallMethod::FullClone => dir.join("repo"),
            _ => dir.to_path_buf(),
        };

        let mut capabilities: Vec<_> = spec
            .capabilities
            .iter()
            .cloned()
            .map(DescriptorCapability::into_capability)
            .collect();
        if let Some(d) = &descriptor {
            if capabilities.is_empty() {
                capabilities = d
                    .capabilities
                    .iter()
                    .cloned()
                    .map(DescriptorCapability::into_capability)
                    .collect();
            }
        }

        let now = chrono::Utc::now();
        ServiceConfig {
            service_id: service_id.clone(),
            display_name: descriptor
                .as_ref()
                .map(|d| d.name.clone())
                .unwrap_or_else(|| spec.name.clone()),
            description: descriptor
                .as_ref()
                .map(|d| d.description.clone())
                .filter(|d| !d.is_empty())
                .unwrap_or_else(|| spec.description.clone()),
            version: descriptor
                .as_ref()
                .map(|d| d.version.clone())
                .unwrap_or_else(|| "1.0.0".to_string()),
            service_type,
            install_method: spec.install_method,
            host: "127.0.0.1".to_string(),
            port: descriptor
                .as_ref()
                .and_then(|d| d.port)
                .or(spec.container_port),
            endpoint: None,
            transport: spec
                .transport
                .or(descriptor.as_ref().and_then(|d| d.transport))
                .unwrap_or(Transport::Websocket),
            working_directory: Some(working_directory),
            entry_point: spec
                .entry_point
                .clone()
                .or(descriptor.as_ref().and_then(|d| d.entry_point.clone())),
            environment: spec.environment.clone(),
            source_url: spec.source_url.clone(),
            container_image: spec.container_image.clone(),
            capabilities,
            policy: SupervisionPolicy::default(),
            metadata: ServiceMetadata {
                tags: spec.tags.clone(),
                author: descriptor.as_ref().and_then(|d| d.author.clone()),
                license: descriptor.as_ref().and_then(|d| d.license.clone()),
                documentation_url: descriptor
                    .as_ref()
                    .and_then(|d| d.documentation_url.clone()),
                created_at: Some(now),
                updated_at: Some(now),
            },
            status: ServiceStatus::Stopped,
            process_id: None,
            container_id: None,
            actual_endpoint: None,
            health: ServiceHealth::default(),
        }
    }
}
