use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use seda_error::{Result, SedaError};

use crate::metrics::MetricsStage;
use crate::stage::{Stage, StageHandler, StageProperties};
use crate::timer::TimerStage;

type StageFactory = Box<dyn Fn(&str) -> Box<dyn StageHandler> + Send + Sync>;

/// Stage classes that can be instantiated by name from configuration.
#[derive(Default)]
pub struct StageRegistry {
    factories: HashMap<String, StageFactory>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry containing the built in `TimerStage` and
    /// `MetricsStage` classes.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("TimerStage", |_| TimerStage::new());
        registry.register("MetricsStage", |_| MetricsStage::new());
        registry
    }

    /// Register a stage class.
    ///
    /// The factory receives the configured stage name.
    ///
    /// Panics if the class is already registered.
    pub fn register<H, F>(&mut self, class: &str, factory: F)
    where
        H: StageHandler,
        F: Fn(&str) -> H + Send + Sync + 'static,
    {
        if self.factories.contains_key(class) {
            panic!("Attempt to register duplicate stage class '{class}'");
        }
        self.factories.insert(
            class.to_string(),
            Box::new(move |name: &str| Box::new(factory(name)) as Box<dyn StageHandler>),
        );
    }

    pub fn contains(&self, class: &str) -> bool {
        self.factories.contains_key(class)
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(|k| k.as_str())
    }

    /// Create a stage of `class` named `name` with the given properties
    /// applied.
    pub fn make_stage(
        &self,
        class: &str,
        name: &str,
        properties: &StageProperties,
    ) -> Result<Arc<Stage>> {
        let factory = self.factories.get(class).ok_or_else(|| {
            SedaError::new("Unknown stage class")
                .with_field("class", class)
                .with_field("stage", name)
        })?;

        let mut handler = factory(name);
        handler.set_properties(properties).map_err(|e| {
            SedaError::with_source("Failed to set stage properties", Box::new(e))
                .with_field("stage", name)
        })?;

        Ok(Stage::from_boxed(name, handler))
    }
}

impl fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut classes: Vec<_> = self.classes().collect();
        classes.sort_unstable();
        f.debug_struct("StageRegistry")
            .field("classes", &classes)
            .finish()
    }
}
