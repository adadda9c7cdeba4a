//! Conversions from external infrastructure errors into domain errors.

use netguard_domain::NetguardError;
use reqwest::Error as HttpError;
use rusqlite::Error as SqlError;

/// Error newtype that keeps conversions on the infrastructure side and can be
/// converted back into the domain error.
#[derive(Debug)]
pub struct InfraError(pub NetguardError);

impl From<InfraError> for NetguardError {
    fn from(value: InfraError) -> Self {
        value.0
    }
}

impl From<NetguardError> for InfraError {
    fn from(value: NetguardError) -> Self {
        InfraError(value)
    }
}

/// Extension trait to make the conversion logic explicit in tests and within
/// this module.
trait IntoNetguardError {
    fn into_netguard(self) -> NetguardError;
}

/* -------------------------------------------------------------------------- */
/* rusqlite::Error → NetguardError */
/* -------------------------------------------------------------------------- */

impl IntoNetguardError for SqlError {
    fn into_netguard(self) -> NetguardError {
        use rusqlite::ffi::ErrorCode;
        use rusqlite::Error as RE;

        match self {
            RE::SqliteFailure(err, maybe_message) => {
                let message = maybe_message.unwrap_or_default();
                match (err.code, err.extended_code) {
                    (ErrorCode::DatabaseBusy, _) => {
                        NetguardError::Database("database is busy".into())
                    }
                    (ErrorCode::DatabaseLocked, _) => {
                        NetguardError::Database("database is locked".into())
                    }
                    (ErrorCode::ConstraintViolation, 1555 | 2067) => {
                        NetguardError::InvalidInput(format!("unique constraint violation: {message}"))
                    }
                    (ErrorCode::NotADatabase, _) => {
                        NetguardError::Database("file is not a database".into())
                    }
                    _ => NetguardError::Database(format!(
                        "sqlite failure {:?} (code {}): {}",
                        err.code, err.extended_code, message
                    )),
                }
            }
            RE::QueryReturnedNoRows => NetguardError::NotFound("no rows returned by query".into()),
            RE::FromSqlConversionFailure(_, _, cause) => {
                NetguardError::Database(format!("failed to convert sqlite value: {cause}"))
            }
            RE::InvalidColumnType(_, _, ty) => {
                NetguardError::Database(format!("invalid column type: {ty}"))
            }
            RE::Utf8Error(_) => {
                NetguardError::Database("invalid UTF-8 returned from sqlite".into())
            }
            RE::InvalidPath(path) => NetguardError::Database(format!(
                "invalid database path: {}",
                path.to_string_lossy()
            )),
            other => NetguardError::Database(other.to_string()),
        }
    }
}

impl From<SqlError> for InfraError {
    fn from(value: SqlError) -> Self {
        InfraError(value.into_netguard())
    }
}

/* -------------------------------------------------------------------------- */
/* r2d2::Error → NetguardError */
/* -------------------------------------------------------------------------- */

impl IntoNetguardError for r2d2::Error {
    fn into_netguard(self) -> NetguardError {
        NetguardError::Database(format!("connection pool error: {self}"))
    }
}

impl From<r2d2::Error> for InfraError {
    fn from(value: r2d2::Error) -> Self {
        InfraError(value.into_netguard())
    }
}

/* -------------------------------------------------------------------------- */
/* reqwest::Error → NetguardError */
/* -------------------------------------------------------------------------- */

impl IntoNetguardError for HttpError {
    fn into_netguard(self) -> NetguardError {
        if self.is_timeout() {
            return NetguardError::Network("HTTP request timed out".into());
        }

        if self.is_connect() {
            return NetguardError::Network("HTTP connection failure".into());
        }

        if self.is_builder() {
            return NetguardError::Config(format!("invalid HTTP client setup: {self}"));
        }

        if let Some(status) = self.status() {
            let code = status.as_u16();
            let message =
                format!("HTTP {} {}", code, status.canonical_reason().unwrap_or("unknown status"));

            return match code {
                404 => NetguardError::NotFound(message),
                400..=499 => NetguardError::InvalidInput(message),
                _ => NetguardError::Network(message),
            };
        }

        NetguardError::Network(self.to_string())
    }
}

impl From<HttpError> for InfraError {
    fn from(value: HttpError) -> Self {
        InfraError(value.into_netguard())
    }
}

/* -------------------------------------------------------------------------- */
/* serde_json / toml → NetguardError */
/* -------------------------------------------------------------------------- */

impl From<serde_json::Error> for InfraError {
    fn from(value: serde_json::Error) -> Self {
        InfraError(NetguardError::Serialization(value.to_string()))
    }
}

impl From<toml::de::Error> for InfraError {
    fn from(value: toml::de::Error) -> Self {
        InfraError(NetguardError::Config(format!("invalid TOML: {}", value.message())))
    }
}

/* -------------------------------------------------------------------------- */
/* Tests */
/* -------------------------------------------------------------------------- */
