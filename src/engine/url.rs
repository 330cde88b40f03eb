use std::fmt;
use std::str::FromStr;

use crate::error::SqlSessionError;
use crate::types::{DatabaseType, EngineMode};

/// Concrete driver named after the `+` in a URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Driver {
    Rusqlite,
    TokioPostgres,
}

impl Driver {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Driver::Rusqlite => "rusqlite",
            Driver::TokioPostgres => "tokio-postgres",
        }
    }

    #[must_use]
    pub fn mode(self) -> EngineMode {
        match self {
            Driver::Rusqlite => EngineMode::Blocking,
            Driver::TokioPostgres => EngineMode::Async,
        }
    }

    #[must_use]
    pub fn backend(self) -> DatabaseType {
        match self {
            Driver::Rusqlite => DatabaseType::Sqlite,
            Driver::TokioPostgres => DatabaseType::Postgres,
        }
    }
}

/// Drivers per backend, default first.
fn drivers_for(backend: DatabaseType, mode: EngineMode) -> &'static [Driver] {
    match (backend, mode) {
        (DatabaseType::Sqlite, EngineMode::Blocking) => &[Driver::Rusqlite],
        (DatabaseType::Postgres, EngineMode::Async) => &[Driver::TokioPostgres],
        _ => &[],
    }
}

fn default_driver(backend: DatabaseType) -> Driver {
    match backend {
        DatabaseType::Sqlite => Driver::Rusqlite,
        DatabaseType::Postgres => Driver::TokioPostgres,
    }
}

/// A parsed `backend[+driver]://rest` connection URL.
///
/// Only the scheme is interpreted; everything after `://` is handed to the driver.
///
/// ```rust
/// use sql_session::prelude::*;
///
/// let url: EngineUrl = "sqlite:///tmp/app.db".parse().unwrap();
/// assert_eq!(url.to_string(), "sqlite:///tmp/app.db");
/// assert_eq!(url.with_default_driver().to_string(), "sqlite+rusqlite:///tmp/app.db");
/// assert_eq!(url.mode(), EngineMode::Blocking);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineUrl {
    backend: DatabaseType,
    backend_name: String,
    driver: Option<Driver>,
    rest: String,
}

impl EngineUrl {
    /// Parse a URL string.
    ///
    /// # Errors
    /// Returns `SqlSessionError::ConfigError` for an unknown backend or driver, or a
    /// driver that does not belong to the backend.
    pub fn parse(url: &str) -> Result<Self, SqlSessionError> {
        let (scheme, rest) = if let Some((scheme, rest)) = url.split_once("://") {
            (scheme, rest.to_string())
        } else if let Some(rest) = url.strip_prefix("sqlite:") {
            // sqlite::memory:
            ("sqlite", rest.to_string())
        } else {
            return Err(SqlSessionError::ConfigError(format!(
                "connection url {url:?} has no scheme"
            )));
        };

        let (backend_name, driver_name) = match scheme.split_once('+') {
            Some((b, d)) => (b, Some(d)),
            None => (scheme, None),
        };

        let backend = match backend_name.to_ascii_lowercase().as_str() {
            "sqlite" => DatabaseType::Sqlite,
            "postgres" | "postgresql" => DatabaseType::Postgres,
            other => {
                return Err(SqlSessionError::ConfigError(format!(
                    "unsupported backend {other:?}"
                )));
            }
        };

        let driver = match driver_name {
            None => None,
            Some(name) => {
                let driver = match name.to_ascii_lowercase().as_str() {
                    "rusqlite" => Driver::Rusqlite,
                    "tokio-postgres" | "tokio_postgres" => Driver::TokioPostgres,
                    other => {
                        return Err(SqlSessionError::ConfigError(format!(
                            "unsupported driver {other:?}"
                        )));
                    }
                };
                if driver.backend() != backend {
                    return Err(SqlSessionError::ConfigError(format!(
                        "driver {} cannot serve backend {backend_name}",
                        driver.name()
                    )));
                }
                Some(driver)
            }
        };

        Ok(Self {
            backend,
            backend_name: backend_name.to_string(),
            driver,
            rest,
        })
    }

    #[must_use]
    pub fn backend(&self) -> DatabaseType {
        self.backend
    }

    /// The driver, explicit or default.
    #[must_use]
    pub fn driver(&self) -> Driver {
        self.driver.unwrap_or_else(|| default_driver(self.backend))
    }

    #[must_use]
    pub fn mode(&self) -> EngineMode {
        self.driver().mode()
    }

    /// Everything after `://`.
    #[must_use]
    pub fn rest(&self) -> &str {
        &self.rest
    }

    /// Spell out the default driver in the scheme.
    #[must_use]
    pub fn with_default_driver(&self) -> Self {
        Self {
            driver: Some(self.driver()),
            ..self.clone()
        }
    }

    /// Swap to a driver of the requested mode, keeping the URL if it already has one.
    ///
    /// # Errors
    /// Returns `SqlSessionError::ConfigError` when the backend has no driver of that mode.
    pub fn for_mode(&self, mode: EngineMode) -> Result<Self, SqlSessionError> {
        let candidates = drivers_for(self.backend, mode);
        if candidates.contains(&self.driver()) {
            return Ok(self.clone());
        }
        let driver = candidates.first().copied().ok_or_else(|| {
            SqlSessionError::ConfigError(format!(
                "no {mode:?} driver available for {}",
                self.backend_name
            ))
        })?;
        Ok(Self {
            driver: Some(driver),
            ..self.clone()
        })
    }

    /// File path for `SQLite` URLs. `sqlite://a.db` is relative, `sqlite:///a.db`
    /// absolute, and `sqlite::memory:` or an empty path is an in-memory database.
    #[must_use]
    pub fn sqlite_path(&self) -> Option<String> {
        if self.backend != DatabaseType::Sqlite {
            return None;
        }
        let path = self.rest.split('?').next().unwrap_or_default();
        if path.is_empty() || path == ":memory:" {
            return Some(":memory:".to_string());
        }
        Some(path.to_string())
    }
}

impl FromStr for EngineUrl {
    type Err = SqlSessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EngineUrl::parse(s)
    }
}

impl fmt::Display for EngineUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.driver {
            Some(driver) => write!(f, "{}+{}://{}", self.backend_name, driver.name(), self.rest),
            None => write!(f, "{}://{}", self.backend_name, self.rest),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_driver_round_trip() {
        let url = EngineUrl::parse("sqlite://app.db").unwrap();
        let explicit = url.with_default_driver();
        assert_eq!(explicit.to_string(), "sqlite+rusqlite://app.db");
        assert_eq!(EngineUrl::parse(&explicit.to_string()).unwrap().driver(), url.driver());
    }

    #[test]
    fn postgresql_scheme_picks_async_driver() {
        let url = EngineUrl::parse("postgresql://user:pw@localhost:5432/db").unwrap();
        assert_eq!(url.backend(), DatabaseType::Postgres);
        assert_eq!(url.mode(), EngineMode::Async);
        assert_eq!(url.rest(), "user:pw@localhost:5432/db");
        assert!(url.for_mode(EngineMode::Blocking).is_err());
    }

    #[test]
    fn sqlite_paths() {
        assert_eq!(
            EngineUrl::parse("sqlite:///tmp/x.db").unwrap().sqlite_path().as_deref(),
            Some("/tmp/x.db")
        );
        assert_eq!(
            EngineUrl::parse("sqlite::memory:").unwrap().sqlite_path().as_deref(),
            Some(":memory:")
        );
        assert_eq!(
            EngineUrl::parse("sqlite://").unwrap().sqlite_path().as_deref(),
            Some(":memory:")
        );
    }

    #[test]
    fn rejects_unknown_and_mismatched() {
        for bad in [
            "mysql://localhost/db",
            "sqlite+aiosqlite://x.db",
            "postgres+rusqlite://h/db",
            "nonsense",
        ] {
            assert!(
                matches!(EngineUrl::parse(bad), Err(SqlSessionError::ConfigError(_))),
                "{bad}"
            );
        }
    }
}
