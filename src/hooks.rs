//! Lifecycle hooks for task environments.
//!
//! Hooks observe environment transitions without participating in them:
//! telemetry, bookkeeping, scorecards. They run synchronously on the
//! calling thread, in registration order. A failing hook is logged and
//! skipped unless it declares itself fatal.

use tracing::warn;

use crate::error::{EnvError, Phase, Result};

/// Observer over task environment lifecycle transitions.
///
/// Every method defaults to a no-op, so trivial hooks implement nothing.
pub trait EnvHook: Send + Sync {
    /// Name used in log lines.
    fn name(&self) -> &str {
        "hook"
    }

    /// Whether a failure in this hook should abort the transition.
    fn fatal(&self) -> bool {
        false
    }

    /// Fired once, when the hook is registered.
    fn on_init(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Fired at the start of every `reset`.
    fn on_reset_start(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Fired after a `reset` reaches the ready state.
    fn on_reset_complete(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Fired when the environment closes.
    fn on_close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Ordered collection of hooks owned by one environment.
#[derive(Default)]
pub struct HookRegistry {
    hooks: Vec<Box<dyn EnvHook>>,
}

impl HookRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered hooks.
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// True when no hooks are registered.
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Registers a hook and fires its `on_init` immediately.
    ///
    /// A fatal hook that fails to initialize is rejected and not
    /// registered.
    pub fn add(&mut self, mut hook: Box<dyn EnvHook>) -> Result<()> {
        if let Err(e) = hook.on_init() {
            if hook.fatal() {
                return Err(EnvError::invalid_config(format!(
                    "hook '{}' failed to initialize: {e}",
                    hook.name()
                )));
            }
            warn!(hook = hook.name(), "hook failed during init: {e}");
        }
        self.hooks.push(hook);
        Ok(())
    }

    /// Notifies every hook that a reset is starting.
    pub fn reset_start(&mut self) -> Result<()> {
        self.notify("reset_start", |hook| hook.on_reset_start())
    }

    /// Notifies every hook that a reset completed.
    pub fn reset_complete(&mut self) -> Result<()> {
        self.notify("reset_complete", |hook| hook.on_reset_complete())
    }

    /// Notifies every hook that the environment closed.
    ///
    /// Close never aborts: even fatal hooks only log here.
    pub fn close(&mut self) {
        for hook in &mut self.hooks {
            if let Err(e) = hook.on_close() {
                warn!(hook = hook.name(), "hook failed during close: {e}");
            }
        }
    }

    fn notify(
        &mut self,
        event: &str,
        f: impl Fn(&mut dyn EnvHook) -> anyhow::Result<()>,
    ) -> Result<()> {
        for hook in &mut self.hooks {
            if let Err(e) = f(hook.as_mut()) {
                if hook.fatal() {
                    return Err(EnvError::sandbox_unavailable(
                        Phase::Resolve,
                        format!("fatal hook '{}' failed during {event}: {e}", hook.name()),
                    ));
                }
                warn!(hook = hook.name(), event, "hook failed: {e}");
            }
        }
        Ok(())
    }
}
