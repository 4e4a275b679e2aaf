use dotenvy::dotenv;
use std::env;

use crate::error::AppError;

/// Which message store backend to run against. Chosen once at startup;
/// there is no runtime switching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Postgres { database_url: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub backend: StoreBackend,
    pub history_limit: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();
        let port = env::var("PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3000);
        let history_limit = env::var("HISTORY_LIMIT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(100);

        let backend = match env::var("STORE_BACKEND").as_deref() {
            Ok("memory") => StoreBackend::Memory,
            Ok("postgres") | Err(_) => {
                let database_url = env::var("DATABASE_URL")
                    .map_err(|_| AppError::Config("DATABASE_URL missing".into()))?;
                StoreBackend::Postgres { database_url }
            }
            Ok(other) => {
                return Err(AppError::Config(format!(
                    "unknown STORE_BACKEND '{other}'"
                )))
            }
        };

        Ok(Self {
            port,
            backend,
            history_limit,
        })
    }

    #[cfg(test)]
    pub fn test_defaults() -> Self {
        Self {
            port: 0,
            backend: StoreBackend::Memory,
            history_limit: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_use_memory_backend() {
        let cfg = Config::test_defaults();
        assert_eq!(cfg.backend, StoreBackend::Memory);
        assert_eq!(cfg.history_limit, 100);
    }
}
