//! In-memory registry mapping job types to sources.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::AppConfig;
use crate::sources::{ExampleSource, SyncSource};
use crate::types::JobType;

#[derive(Clone, Default)]
pub struct SourceRegistry {
    handlers: HashMap<JobType, Arc<dyn SyncSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry for the configured bundled source.
    pub fn for_config(config: &AppConfig) -> Self {
        let mut registry = Self::new();
        match config.source.as_str() {
            "example" => {
                let source: Arc<dyn SyncSource> = Arc::new(ExampleSource::default());
                for job_type in JobType::ALL {
                    registry.register(*job_type, source.clone());
                }
                info!(source = "example", "Registered example source for all job types");
            }
            other => {
                warn!(source = other, "No sources registered; claimed jobs will be dead-lettered");
            }
        }
        registry
    }

    /// Register (or replace) the source serving `job_type`.
    pub fn register(&mut self, job_type: JobType, source: Arc<dyn SyncSource>) {
        self.handlers.insert(job_type, source);
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn SyncSource>> {
        self.handlers.get(&job_type).cloned()
    }

    pub fn job_types(&self) -> Vec<JobType> {
        let mut types: Vec<JobType> = self.handlers.keys().copied().collect();
        types.sort();
        types
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}
