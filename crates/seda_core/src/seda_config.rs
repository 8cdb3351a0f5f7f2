//! Building and running a pipeline from settings.
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use seda_error::{Result, SedaError};
use tracing::{debug, info};

use crate::event::StageEvent;
use crate::registry::StageRegistry;
use crate::settings::SedaSettings;
use crate::stage::{RejectedEvent, Stage};
use crate::thread_pool::{DEFAULT_THREAD_POOL, ThreadPool};

/// Upper bound (exclusive) on the number of threads in a single pool.
pub const MAX_THREAD_COUNT: usize = 1_000_000;

/// Thread pools and stages of a pipeline, kept in configured order.
///
/// Lifecycle is `instantiate`, `start`, then `cleanup`. Dropping the config
/// cleans it up.
pub struct SedaConfig {
    settings: SedaSettings,
    thread_pools: IndexMap<String, ThreadPool>,
    stages: IndexMap<String, Arc<Stage>>,
}

impl SedaConfig {
    pub fn new(settings: SedaSettings) -> Self {
        SedaConfig {
            settings,
            thread_pools: IndexMap::new(),
            stages: IndexMap::new(),
        }
    }

    /// Create and start a pipeline.
    pub fn init(settings: SedaSettings, registry: &StageRegistry) -> Result<Self> {
        let mut config = Self::new(settings);
        config.instantiate(registry)?;
        config.start()?;
        Ok(config)
    }

    pub fn settings(&self) -> &SedaSettings {
        &self.settings
    }

    /// Create thread pools and stages, and wire stages together.
    ///
    /// On error, anything created so far is torn down.
    pub fn instantiate(&mut self, registry: &StageRegistry) -> Result<()> {
        if !self.stages.is_empty() || !self.thread_pools.is_empty() {
            return Err(SedaError::new("Pipeline already instantiated"));
        }

        let result = self.build(registry);
        if let Err(e) = result {
            self.clear();
            return Err(e);
        }

        info!(
            thread_pools = self.thread_pools.len(),
            stages = self.stages.len(),
            event_history = self.settings.event_history,
            "instantiated pipeline"
        );

        Ok(())
    }

    fn build(&mut self, registry: &StageRegistry) -> Result<()> {
        self.init_thread_pools()
            .map_err(|e| e.with_field("phase", "thread_pools"))?;
        self.init_stages(registry)
            .map_err(|e| e.with_field("phase", "stages"))?;
        self.gen_next_stages()
            .map_err(|e| e.with_field("phase", "next_stages"))?;
        Ok(())
    }

    fn init_thread_pools(&mut self) -> Result<()> {
        if !self
            .settings
            .thread_pools
            .iter()
            .any(|p| p.name == DEFAULT_THREAD_POOL)
        {
            return Err(SedaError::new("Missing default thread pool")
                .with_field("pool", DEFAULT_THREAD_POOL));
        }

        let history = self.settings.history_config();
        for pool_settings in &self.settings.thread_pools {
            if self.thread_pools.contains_key(&pool_settings.name) {
                return Err(SedaError::new("Duplicate thread pool")
                    .with_field("pool", &pool_settings.name));
            }

            let count = match usize::try_from(pool_settings.count) {
                Ok(count) if count >= 1 => count,
                _ => {
                    let cpus = num_cpus::get();
                    info!(pool = %pool_settings.name, cpus, "using number of cpus for thread count");
                    cpus
                }
            };
            if count >= MAX_THREAD_COUNT {
                return Err(SedaError::new("Thread count too large")
                    .with_field("pool", &pool_settings.name)
                    .with_field("count", count)
                    .with_field("max", MAX_THREAD_COUNT));
            }

            let pool = ThreadPool::try_new(&pool_settings.name, count, history)?;
            self.thread_pools.insert(pool_settings.name.clone(), pool);
        }

        Ok(())
    }

    fn init_stages(&mut self, registry: &StageRegistry) -> Result<()> {
        for stage_settings in &self.settings.stages {
            let name = &stage_settings.name;
            if self.stages.contains_key(name) {
                return Err(SedaError::new("Duplicate stage").with_field("stage", name));
            }

            let pool_name = match stage_settings.thread_pool.as_deref() {
                Some(pool_name) => pool_name,
                None => {
                    info!(stage = %name, pool = DEFAULT_THREAD_POOL, "using default thread pool");
                    DEFAULT_THREAD_POOL
                }
            };
            let pool = self.thread_pools.get(pool_name).ok_or_else(|| {
                SedaError::new("Unknown thread pool")
                    .with_field("stage", name)
                    .with_field("pool", pool_name)
            })?;

            let stage =
                registry.make_stage(stage_settings.class(), name, &stage_settings.properties())?;
            stage.set_pool(pool);
            debug!(stage = %name, class = %stage_settings.class(), pool = %pool_name, "created stage");

            self.stages.insert(name.clone(), stage);
        }

        Ok(())
    }

    fn gen_next_stages(&self) -> Result<()> {
        for stage_settings in &self.settings.stages {
            let Some(stage) = self.stages.get(&stage_settings.name) else {
                continue;
            };
            for next_name in &stage_settings.next_stages {
                let next = self.stages.get(next_name).ok_or_else(|| {
                    SedaError::new("Unknown next stage")
                        .with_field("stage", &stage_settings.name)
                        .with_field("next", next_name)
                })?;
                stage.push_stage(next.clone());
            }
        }

        Ok(())
    }

    /// Connect all stages in configured order.
    ///
    /// If any stage fails to connect, the pipeline is cleaned up.
    pub fn start(&mut self) -> Result<()> {
        if self.thread_pools.is_empty() {
            return Err(SedaError::new("Pipeline not instantiated"));
        }

        let result = self.stages.values().try_for_each(|stage| stage.connect());
        if let Err(e) = result {
            self.cleanup();
            return Err(e.with_field("phase", "start"));
        }

        info!(stages = self.stages.len(), "started pipeline");

        Ok(())
    }

    /// Disconnect all connected stages, then drop stages and thread pools.
    pub fn cleanup(&mut self) {
        for stage in self.stages.values() {
            if stage.is_connected() {
                stage.disconnect();
            }
        }
        self.clear();
    }

    fn clear(&mut self) {
        let had_pools = !self.thread_pools.is_empty();
        // Stages that never connected still reference each other.
        for stage in self.stages.values() {
            stage.clear_next_stages();
        }
        self.stages.clear();
        // Pools stop in reverse creation order.
        while let Some((_, pool)) = self.thread_pools.pop() {
            drop(pool);
        }
        if had_pools {
            info!("cleaned up pipeline");
        }
    }

    pub fn get_stage(&self, name: &str) -> Option<&Arc<Stage>> {
        self.stages.get(name)
    }

    /// Stage names in configured order.
    pub fn stage_names(&self) -> impl Iterator<Item = &str> {
        self.stages.keys().map(|k| k.as_str())
    }

    /// Queue length of every stage, in configured order.
    pub fn stage_queue_status(&self) -> Vec<(&str, usize)> {
        self.stages
            .iter()
            .map(|(name, stage)| (name.as_str(), stage.qlen()))
            .collect()
    }

    pub fn thread_pool(&self, name: &str) -> Option<&ThreadPool> {
        self.thread_pools.get(name)
    }

    /// Add an event to a stage by name.
    pub fn submit(&self, stage: &str, event: StageEvent) -> Result<(), RejectedEvent> {
        match self.stages.get(stage) {
            Some(target) => target.add_event(event),
            None => Err(RejectedEvent::new(stage, event)),
        }
    }
}

impl Drop for SedaConfig {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl fmt::Debug for SedaConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SedaConfig")
            .field("thread_pools", &self.thread_pools.keys().collect::<Vec<_>>())
            .field("stages", &self.stages.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

static SEDA_CONFIG: Mutex<Option<SedaConfig>> = Mutex::new(None);

/// Create and start the process wide pipeline.
///
/// Errors if a pipeline is already running.
pub fn init_seda(settings: SedaSettings, registry: &StageRegistry) -> Result<()> {
    if SEDA_CONFIG.lock().is_some() {
        return Err(SedaError::new("Pipeline already initialized"));
    }

    let config = SedaConfig::init(settings, registry)?;

    let mut global = SEDA_CONFIG.lock();
    if global.is_some() {
        drop(global);
        drop(config);
        return Err(SedaError::new("Pipeline already initialized"));
    }
    *global = Some(config);

    Ok(())
}

/// Run `f` with the process wide pipeline, if one is running.
///
/// The pipeline is locked for the duration of `f`.
pub fn with_seda_config<F, T>(f: F) -> Option<T>
where
    F: FnOnce(&SedaConfig) -> T,
{
    SEDA_CONFIG.lock().as_ref().map(f)
}

/// Stop and drop the process wide pipeline.
pub fn cleanup_seda() {
    let config = SEDA_CONFIG.lock().take();
    if let Some(mut config) = config {
        config.cleanup();
    }
}
