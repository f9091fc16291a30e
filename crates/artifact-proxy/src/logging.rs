//! Log subscriber setup

use crate::error::Result;
use tracing_subscriber::{prelude::*, EnvFilter};

/// Build the filter used by the subscriber; `RUST_LOG` directives are
/// kept and the crate defaults are added on top.
pub fn env_filter(debug: bool) -> Result<EnvFilter> {
    let level = if debug { "debug" } else { "info" };
    Ok(EnvFilter::from_default_env()
        .add_directive(format!("artifact_proxy={}", level).parse()?)
        .add_directive(format!("artifact_store={}", level).parse()?)
        .add_directive(format!("tower_http={}", level).parse()?))
}

/// Install the global subscriber.
///
/// With `json` set, events go to the structured JSON sink instead of the
/// human readable formatter.
pub fn init(debug: bool, json: bool) -> Result<()> {
    let env_filter = env_filter(debug)?;

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    tracing::debug!("Debug logging enabled");
    Ok(())
}
