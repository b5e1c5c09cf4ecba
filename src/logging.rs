//! Optional tracing setup for embedding binaries.
//!
//! Not invoked automatically by [`crate::Runner`] — a library should never
//! seize global logging init on the host's behalf — but exported so a host
//! binary can opt into the same setup the teacher's own binary used.

use tracing_subscriber::prelude::*;
use tracing_subscriber::{reload, EnvFilter};

/// A handle allowing the log level to be changed after `init` without
/// restarting the process.
pub struct LogReloadHandle {
    inner: reload::Handle<EnvFilter, tracing_subscriber::Registry>,
}

impl LogReloadHandle {
    /// Replace the active filter directive (e.g. `"debug"`, `"my_crate=trace,info"`).
    /// A malformed directive is ignored and the previous filter stays active.
    pub fn set_level(&self, directive: &str) {
        if let Ok(filter) = EnvFilter::try_new(directive) {
            let _ = self.inner.modify(|f| *f = filter);
        }
    }
}

/// Initialize a global `tracing` subscriber reading its filter from
/// `level` (falling back to `"info"` on a malformed directive), emitting
/// either plain or JSON-formatted lines.
///
/// Panics if a global subscriber has already been installed.
pub fn init_tracing(level: &str, json: bool) -> LogReloadHandle {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, reload_handle) = reload::Layer::new(filter);

    if json {
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    LogReloadHandle {
        inner: reload_handle,
    }
}
