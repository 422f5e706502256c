//! Tracing subscriber setup with a runtime-adjustable filter

use std::sync::Mutex;
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter, Registry};

/// Runtime control over the active log filter
pub trait LogControl: Send + Sync {
    fn set_level(&self, directive: &str) -> Result<(), String>;

    /// Currently active filter directives
    fn current(&self) -> String;
}

pub struct LogHandle {
    handle: reload::Handle<EnvFilter, Registry>,
    current: Mutex<String>,
}

/// Install the global subscriber. `RUST_LOG` wins over `default_level`.
pub fn init(default_level: &str) -> anyhow::Result<LogHandle> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let current = filter.to_string();
    let (filter, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()?;

    Ok(LogHandle {
        handle,
        current: Mutex::new(current),
    })
}

impl LogControl for LogHandle {
    fn set_level(&self, directive: &str) -> Result<(), String> {
        let filter = EnvFilter::try_new(directive).map_err(|e| e.to_string())?;
        self.handle.reload(filter).map_err(|e| e.to_string())?;
        if let Ok(mut current) = self.current.lock() {
            *current = directive.to_string();
        }
        Ok(())
    }

    fn current(&self) -> String {
        self.current
            .lock()
            .map(|current| current.clone())
            .unwrap_or_default()
    }
}
