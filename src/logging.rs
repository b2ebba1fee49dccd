use crate::config::LoggingConfig;
use crate::error::{MarketError, Result};
use std::fs::OpenOptions;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| MarketError::Config(format!("Invalid log level {:?}: {}", config.level, e)))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    let installed = match (config.format.as_str(), config.file.as_deref()) {
        ("json", Some(path)) => builder.json().with_writer(open_log_file(path)?).try_init(),
        ("json", None) => builder.json().try_init(),
        ("pretty", Some(path)) => builder.pretty().with_writer(open_log_file(path)?).try_init(),
        ("pretty", None) => builder.pretty().try_init(),
        ("compact", Some(path)) => builder.compact().with_writer(open_log_file(path)?).try_init(),
        ("compact", None) => builder.compact().try_init(),
        (other, _) => {
            return Err(MarketError::Config(format!("Unknown log format: {}", other)));
        }
    };

    // A subscriber may already be installed (tests, embedding); keep it.
    if let Err(e) = installed {
        tracing::debug!("tracing subscriber already set: {}", e);
    }
    Ok(())
}

fn open_log_file(path: &str) -> Result<Arc<std::fs::File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(Arc::new(file))
}
