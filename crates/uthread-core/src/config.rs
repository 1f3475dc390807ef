//! Runtime configuration.
//!
//! The configuration is handed to [`crate::init_with`] by the embedding
//! program; nothing is read from the environment. Every field has a default,
//! and operations issued before `init` behave as if `init` had been called
//! with [`RuntimeConfig::DEFAULT`].
//!
//! - `priority_map`: host values for the five priority levels.
//! - `max_destructor_passes`: optional cap on detach passes. Unset means the
//!   registry is drained until a pass invokes no destructor.
//! - `stack_size`: stack size for threads created by this crate. Unset means
//!   the host default.

use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::uthread::priority::PriorityMap;

/// Smallest stack accepted for library-created threads (`PTHREAD_STACK_MIN`
/// on glibc x86_64).
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Rejected configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("stack size {requested} is below the minimum of {minimum} bytes")]
    StackTooSmall { requested: usize, minimum: usize },
}

/// Process-wide runtime settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub priority_map: PriorityMap,
    pub max_destructor_passes: Option<NonZeroUsize>,
    pub stack_size: Option<usize>,
}

impl RuntimeConfig {
    /// Configuration used before `init` and by `init()`.
    pub const DEFAULT: Self = Self {
        priority_map: PriorityMap::HOST,
        max_destructor_passes: None,
        stack_size: None,
    };

    /// Check the settings without applying them.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.stack_size {
            Some(requested) if requested < MIN_STACK_SIZE => Err(ConfigError::StackTooSmall {
                requested,
                minimum: MIN_STACK_SIZE,
            }),
            _ => Ok(()),
        }
    }

    #[must_use]
    pub const fn with_priority_map(mut self, map: PriorityMap) -> Self {
        self.priority_map = map;
        self
    }

    #[must_use]
    pub const fn with_max_destructor_passes(mut self, passes: Option<NonZeroUsize>) -> Self {
        self.max_destructor_passes = passes;
        self
    }

    #[must_use]
    pub const fn with_stack_size(mut self, size: Option<usize>) -> Self {
        self.stack_size = size;
        self
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
