//! Configuration for reinforce

use std::path::PathBuf;

use crate::error::{Error, Result};

/// Where the relational store lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseLocation {
    InMemory,
    File(PathBuf),
}

/// Azure OpenAI deployment used for question generation
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Resource endpoint, e.g. `https://my-resource.openai.azure.com`
    pub endpoint: String,

    pub api_key: String,

    /// Deployment name (also sent as the model)
    pub deployment: String,

    pub api_version: String,

    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// Retries after the first failed attempt
    pub max_retries: u32,
}

/// Cosmos DB account used for the ingestion log
#[derive(Debug, Clone)]
pub struct CosmosConfig {
    pub endpoint: String,
    pub key: String,
    pub database: String,
    pub container: String,
}

/// Configuration for the service
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory for all local storage
    pub data_dir: PathBuf,

    /// Shared API key expected in `X-API-Key`
    pub api_key: Option<String>,

    /// SQLite connection string (`sqlite::memory:`, `sqlite://path`, or a path)
    pub database_url: Option<String>,

    /// Azure Storage connection string; local blobs when unset
    pub blob_connection_string: Option<String>,

    /// Cosmos DB ingestion log; local JSONL when unset
    pub cosmos: Option<CosmosConfig>,

    /// Question generator; fallback questions when unset
    pub llm: Option<LlmConfig>,

    /// HTTP bind address
    pub server_host: String,

    /// HTTP server port
    pub server_port: u16,

    /// Largest accepted request body, uploads included
    pub max_upload_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("reinforce");

        Self {
            data_dir,
            api_key: None,
            database_url: None,
            blob_connection_string: None,
            cosmos: None,
            llm: None,
            server_host: "127.0.0.1".to_string(),
            server_port: 8000,
            max_upload_bytes: 10 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Create a new config with a custom data directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Load configuration from the environment, reading `.env` first if present.
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                return Err(Error::config(format!("Failed to read .env: {}", e)));
            }
        }

        let mut config = match env("REINFORCE_DATA_DIR") {
            Some(dir) => Self::with_data_dir(dir),
            None => Self::default(),
        };

        config.api_key = env("APP_API_KEY");
        config.database_url = env("SQL_CONNECTION_STRING").or_else(|| env("DATABASE_URL"));
        config.blob_connection_string = env("BLOB_CONNECTION_STRING");

        if let Some(host) = env("REINFORCE_HOST") {
            config.server_host = host;
        }
        if let Some(port) = env("REINFORCE_PORT") {
            config.server_port = port
                .parse()
                .map_err(|_| Error::config(format!("Invalid REINFORCE_PORT: {}", port)))?;
        }
        if let Some(limit) = env("REINFORCE_MAX_UPLOAD_BYTES") {
            config.max_upload_bytes = limit.parse().map_err(|_| {
                Error::config(format!("Invalid REINFORCE_MAX_UPLOAD_BYTES: {}", limit))
            })?;
        }

        if let (Some(endpoint), Some(key)) = (env("COSMOS_ENDPOINT"), env("COSMOS_KEY")) {
            config.cosmos = Some(CosmosConfig {
                endpoint,
                key,
                database: env("COSMOS_DATABASE").unwrap_or_else(|| "reinforce_db".to_string()),
                container: env("COSMOS_CONTAINER")
                    .unwrap_or_else(|| "ingestion_logs".to_string()),
            });
        }

        if let (Some(endpoint), Some(api_key), Some(deployment)) = (
            env("AZURE_OPENAI_ENDPOINT"),
            env("AZURE_OPENAI_KEY"),
            env("AZURE_OPENAI_DEPLOYMENT_NAME"),
        ) {
            config.llm = Some(LlmConfig {
                endpoint,
                api_key,
                deployment,
                api_version: env("AZURE_OPENAI_API_VERSION")
                    .unwrap_or_else(|| "2024-02-01".to_string()),
                timeout_secs: 60,
                max_retries: 2,
            });
        }

        Ok(config)
    }

    /// Resolve the SQLite location from the connection string.
    ///
    /// Accepts SQLAlchemy-style URLs (`sqlite:///relative.db`,
    /// `sqlite:////absolute.db`, `sqlite+pysqlite:///:memory:`, bare
    /// `sqlite://` for in-memory) as well as a plain file path.
    pub fn database_location(&self) -> Result<DatabaseLocation> {
        let Some(url) = self.database_url.as_deref() else {
            return Ok(DatabaseLocation::File(self.data_dir.join("reinforce.db")));
        };

        let Some((scheme, rest)) = url.split_once("://") else {
            return Ok(match url {
                ":memory:" | "sqlite::memory:" => DatabaseLocation::InMemory,
                path => DatabaseLocation::File(PathBuf::from(path)),
            });
        };

        // `dialect+driver`, the driver is irrelevant here
        let dialect = scheme.split('+').next().unwrap_or_default();
        if dialect != "sqlite" {
            return Err(Error::config(format!(
                "Unsupported database connection string: {}",
                scheme
            )));
        }

        let path = rest.split('?').next().unwrap_or_default();
        let path = path.strip_prefix('/').unwrap_or(path);
        Ok(match path {
            "" | ":memory:" => DatabaseLocation::InMemory,
            path => DatabaseLocation::File(PathBuf::from(path)),
        })
    }

    /// Root of the local blob store
    pub fn blob_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }

    /// Directory of the local ingestion log
    pub fn ingestion_log_dir(&self) -> PathBuf {
        self.data_dir.join("ingestion")
    }

    /// Ensure all required directories exist
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.blob_dir())?;
        std::fs::create_dir_all(self.ingestion_log_dir())?;
        Ok(())
    }
}

fn env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_url(url: &str) -> Config {
        Config {
            database_url: Some(url.to_string()),
            ..Config::with_data_dir("/tmp/reinforce-test")
        }
    }

    #[test]
    fn default_database_lives_in_data_dir() {
        let config = Config::with_data_dir("/tmp/reinforce-test");
        assert_eq!(
            config.database_location().unwrap(),
            DatabaseLocation::File(PathBuf::from("/tmp/reinforce-test/reinforce.db"))
        );
    }

    #[test]
    fn parses_sqlite_connection_strings() {
        assert_eq!(
            with_url("sqlite::memory:").database_location().unwrap(),
            DatabaseLocation::InMemory
        );
        assert_eq!(
            with_url(":memory:").database_location().unwrap(),
            DatabaseLocation::InMemory
        );
        assert_eq!(
            with_url("sqlite:////var/lib/app.db").database_location().unwrap(),
            DatabaseLocation::File(PathBuf::from("/var/lib/app.db"))
        );
        assert_eq!(
            with_url("sqlite:///reinforce.db").database_location().unwrap(),
            DatabaseLocation::File(PathBuf::from("reinforce.db"))
        );
        assert_eq!(
            with_url("data/app.db").database_location().unwrap(),
            DatabaseLocation::File(PathBuf::from("data/app.db"))
        );
    }

    #[test]
    fn sqlalchemy_memory_urls_are_in_memory() {
        for url in [
            "sqlite+pysqlite:///:memory:",
            "sqlite:///:memory:",
            "sqlite://:memory:",
            "sqlite://",
        ] {
            assert_eq!(
                with_url(url).database_location().unwrap(),
                DatabaseLocation::InMemory,
                "{}",
                url
            );
        }
    }

    #[test]
    fn driver_suffix_is_accepted_for_files() {
        assert_eq!(
            with_url("sqlite+pysqlite:///data/app.db?timeout=5")
                .database_location()
                .unwrap(),
            DatabaseLocation::File(PathBuf::from("data/app.db"))
        );
    }

    #[test]
    fn rejects_other_database_schemes() {
        let err = with_url("mssql+pyodbc://user:pw@host/db")
            .database_location()
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(!err.to_string().contains("pw"));
    }
}
