//! Library-wide lifecycle.
//!
//! A single context holds the active [`RuntimeConfig`]. `init` installs it,
//! `shutdown` tears down the TLS registry and restores the defaults. Entry
//! points read the context on demand, so every operation also works before
//! `init`.

use std::num::NonZeroUsize;

use parking_lot::RwLock;
use tracing::debug;

use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::uthread::priority::PriorityMap;
use crate::uthread::tls;

struct Context {
    config: RuntimeConfig,
    initialized: bool,
}

static CONTEXT: RwLock<Context> = RwLock::new(Context {
    config: RuntimeConfig::DEFAULT,
    initialized: false,
});

/// Initialize with [`RuntimeConfig::DEFAULT`].
pub fn init() -> Result<()> {
    init_with(RuntimeConfig::DEFAULT)
}

/// Initialize (or reconfigure) the runtime.
///
/// The configuration is validated first; a rejected configuration leaves the
/// current one in place.
pub fn init_with(config: RuntimeConfig) -> Result<()> {
    config.validate()?;
    let mut ctx = CONTEXT.write();
    ctx.config = config;
    ctx.initialized = true;
    debug!(?config, "uthread runtime initialized");
    Ok(())
}

/// Tear the runtime down.
///
/// Runs the detach hook for the calling thread, then releases every registry
/// entry and native TLS slot. Keys stay usable and rebind on next access.
/// No other library thread may be running TLS operations concurrently.
pub fn shutdown() {
    // Destructors read the context, so it must not be locked here.
    tls::teardown();
    let mut ctx = CONTEXT.write();
    ctx.config = RuntimeConfig::DEFAULT;
    ctx.initialized = false;
    debug!("uthread runtime shut down");
}

#[must_use]
pub fn is_initialized() -> bool {
    CONTEXT.read().initialized
}

pub(crate) fn priority_map() -> PriorityMap {
    CONTEXT.read().config.priority_map
}

pub(crate) fn max_destructor_passes() -> Option<NonZeroUsize> {
    CONTEXT.read().config.max_destructor_passes
}

pub(crate) fn stack_size() -> Option<usize> {
    CONTEXT.read().config.stack_size
}
