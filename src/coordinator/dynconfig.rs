//! Immutable snapshot of the dynamic chunk manager configuration
//!
//! Operations grab one `Arc` at their start and read every toggle from it,
//! so a concurrent replacement never produces a torn read.

use crate::common::{ChunkManagerConfig, Result};
use std::sync::{Arc, RwLock};

pub struct ConfigSnapshot {
    current: RwLock<Arc<ChunkManagerConfig>>,
}

impl ConfigSnapshot {
    pub fn new(config: ChunkManagerConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
        }
    }

    pub fn snapshot(&self) -> Arc<ChunkManagerConfig> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Swap in a new snapshot; in-flight operations keep the old one
    pub fn replace(&self, config: ChunkManagerConfig) -> Result<Arc<ChunkManagerConfig>> {
        config.validate()?;
        let next = Arc::new(config);
        let mut guard = self
            .current
            .write()
            .map_err(|_| crate::Error::Internal("config lock poisoned".into()))?;
        *guard = next.clone();
        tracing::info!("Chunk manager config replaced: {:?}", next);
        Ok(next)
    }
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self::new(ChunkManagerConfig::default())
    }
}
