use anyhow::Context;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub max_connections: u32,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .context("DATABASE_URL must be set to the gradebook Postgres instance")?;

        let max_connections = match std::env::var("GRADEBOOK_MAX_CONNECTIONS") {
            Ok(value) => value
                .parse()
                .with_context(|| format!("GRADEBOOK_MAX_CONNECTIONS is not a number: {value}"))?,
            Err(_) => 5,
        };

        Ok(Self {
            database_url,
            max_connections,
        })
    }
}

/// Logs go to stderr so command output on stdout stays pipeable.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_env("GRADEBOOK_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let json = std::env::var("GRADEBOOK_LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
