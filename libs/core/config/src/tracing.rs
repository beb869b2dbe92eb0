//! Log output and error-report setup for the ingestion binaries.

use crate::Environment;
use tracing::{debug, info};
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

/// Install the color-eyre panic and error report hooks.
///
/// Reports show the source location but not the environment section. Installing twice
/// is a no-op.
pub fn install_color_eyre() {
    let _ = color_eyre::config::HookBuilder::default()
        .display_location_section(true)
        .display_env_section(false)
        .install();
}

/// Filter used when `RUST_LOG` is unset
fn default_directives(environment: &Environment) -> &'static str {
    match environment {
        Environment::Production => "info,async_nats=warn",
        Environment::Development => "info,nats_ingest=debug,ingest_worker=debug,async_nats=info",
    }
}

/// Install the global subscriber.
///
/// Production writes flattened JSON lines without targets; development writes the
/// pretty multi-line format. Both carry `tracing_error::ErrorLayer` so eyre reports get
/// span traces. A second call leaves the first subscriber in place.
pub fn init_tracing(environment: &Environment) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(environment)));

    let output: Box<dyn Layer<Registry> + Send + Sync> = if environment.is_production() {
        fmt::layer()
            .json()
            .with_target(false)
            .flatten_event(true)
            .boxed()
    } else {
        fmt::layer()
            .pretty()
            .with_file(false)
            .with_line_number(false)
            .boxed()
    };

    let installed = tracing_subscriber::registry()
        .with(output)
        .with(tracing_error::ErrorLayer::default())
        .with(filter)
        .try_init()
        .is_ok();

    if installed {
        info!(environment = ?environment, "Tracing initialized");
    } else {
        debug!("Global subscriber already set");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives() {
        assert!(default_directives(&Environment::Production).contains("async_nats=warn"));
        assert!(default_directives(&Environment::Development).contains("nats_ingest=debug"));
    }

    #[test]
    fn test_directives_parse() {
        for environment in [Environment::Development, Environment::Production] {
            EnvFilter::try_new(default_directives(&environment)).unwrap();
        }
    }

    #[test]
    fn test_init_tracing_twice() {
        temp_env::with_var("RUST_LOG", Some("warn"), || {
            init_tracing(&Environment::Production);
            init_tracing(&Environment::Development);
        });
    }
}
