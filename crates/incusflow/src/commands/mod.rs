pub mod apply;
pub mod query;

use incusflow_config::Settings;
use incusflow_core::{FileStateCache, ProcessExecutor};
use incusflow_incus::Context;

/// What every command needs from the environment
pub struct Host {
    pub settings: Settings,
    pub executor: ProcessExecutor,
    pub cache: Option<FileStateCache>,
}

impl Host {
    pub fn new(settings: Settings) -> anyhow::Result<Self> {
        let cache = if settings.cache.enabled {
            let dir = settings.cache.resolved_dir()?;
            tracing::debug!("State cache in {}", dir.display());
            Some(FileStateCache::new(dir, settings.cache.ttl_secs))
        } else {
            None
        };
        Ok(Self {
            executor: ProcessExecutor::new(settings.locale.clone()),
            cache,
            settings,
        })
    }

    pub fn context(&self) -> Context {
        Context {
            binary: self.settings.binary.clone(),
            remote: self.settings.remote.clone(),
            project: self.settings.project.clone(),
        }
    }
}
