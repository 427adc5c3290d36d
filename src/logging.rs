//! Tracing setup and replay-safe logging macros for orchestrations.
//!
//! An orchestrator body runs again on every turn, so a plain `tracing::info!`
//! inside it fires once per replay. The `durable_*` macros only emit while
//! the context is executing new code (`!ctx.is_replaying()`) and tag each
//! record with the instance id.

/// Install a global `fmt` subscriber filtered by `RUST_LOG` (default `info`).
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[macro_export]
macro_rules! durable_error {
    ($ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        if !ctx.is_replaying() {
            ::tracing::error!(target: "durable_replay::orchestration", instance = %ctx.instance_id(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        if !ctx.is_replaying() {
            ::tracing::warn!(target: "durable_replay::orchestration", instance = %ctx.instance_id(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_info {
    ($ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        if !ctx.is_replaying() {
            ::tracing::info!(target: "durable_replay::orchestration", instance = %ctx.instance_id(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_debug {
    ($ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        if !ctx.is_replaying() {
            ::tracing::debug!(target: "durable_replay::orchestration", instance = %ctx.instance_id(), $($arg)+);
        }
    }};
}
