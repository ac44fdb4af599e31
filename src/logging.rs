//! Tracing subscriber setup for the binary.

use tracing_subscriber::EnvFilter;

/// Builds the filter: `RUST_LOG` when set, otherwise `level` for this crate
/// with noisy HTTP dependencies held at `warn`.
pub fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("warn,qualflow={level},hyper=warn,reqwest=warn"))
    })
}

/// Installs the global subscriber. Later calls are ignored so tests and
/// embedders can call it freely.
pub fn init(level: &str, json: bool) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter(level))
        .with_target(false)
        .with_writer(std::io::stderr);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_twice_is_harmless() {
        init("debug", false);
        init("info", true);
    }

    #[test]
    fn filter_names_the_crate() {
        if std::env::var_os("RUST_LOG").is_none() {
            assert!(filter("trace").to_string().contains("qualflow=trace"));
        }
    }
}
