//! OpenStack identity (Keystone v3) client.
//!
//! Cortex authenticates against the platform identity service with the
//! password method. All six `OS_*` environment variables are required;
//! a missing one is a fatal startup error. Tokens are cached until shortly
//! before their expiry.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors that can occur during identity operations.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// A required `OS_*` environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// The token request failed.
    #[error("Token request failed: {0}")]
    RequestFailed(String),

    /// The identity service answered with an error status.
    #[error("Identity service error ({code}): {message}")]
    ApiError { code: u16, message: String },

    /// The token response could not be interpreted.
    #[error("Failed to parse token response: {0}")]
    ParseError(String),
}

/// Credentials read from the `OS_*` environment variables.
#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub auth_url: String,
    pub username: String,
    pub password: String,
    pub user_domain_name: String,
    pub project_name: String,
    pub project_domain_name: String,
}

impl IdentityConfig {
    /// Reads the identity configuration from the environment.
    ///
    /// # Errors
    ///
    /// Returns `IdentityError::MissingEnvVar` naming the first absent
    /// variable. Callers treat this as fatal at startup.
    pub fn from_env() -> Result<Self, IdentityError> {
        Ok(Self {
            auth_url: require_env("OS_AUTH_URL")?,
            username: require_env("OS_USERNAME")?,
            password: require_env("OS_PASSWORD")?,
            user_domain_name: require_env("OS_USER_DOMAIN_NAME")?,
            project_name: require_env("OS_PROJECT_NAME")?,
            project_domain_name: require_env("OS_PROJECT_DOMAIN_NAME")?,
        })
    }
}

fn require_env(key: &str) -> Result<String, IdentityError> {
    std::env::var(key).map_err(|_| IdentityError::MissingEnvVar(key.to_string()))
}

/// A scoped token with its expiry.
#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

/// Keystone v3 password-auth client with token caching.
pub struct IdentityClient {
    http: reqwest::Client,
    config: IdentityConfig,
    token: RwLock<Option<CachedToken>>,
}

impl IdentityClient {
    /// Creates a client from the given credentials.
    pub fn new(config: IdentityConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            token: RwLock::new(None),
        }
    }

    /// Returns a valid token, fetching a new one when the cached token is
    /// absent or within a minute of expiring.
    pub async fn token(&self) -> Result<String, IdentityError> {
        {
            let cached = self.token.read().await;
            if let Some(token) = cached.as_ref() {
                if token.expires_at - Utc::now() > ChronoDuration::seconds(60) {
                    return Ok(token.value.clone());
                }
            }
        }

        let fresh = self.authenticate().await?;
        let value = fresh.value.clone();
        *self.token.write().await = Some(fresh);
        Ok(value)
    }

    /// Performs the password authentication request.
    async fn authenticate(&self) -> Result<CachedToken, IdentityError> {
        let url = format!("{}/auth/tokens", self.config.auth_url.trim_end_matches('/'));
        let body = json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": self.config.username,
                            "domain": { "name": self.config.user_domain_name },
                            "password": self.config.password,
                        }
                    }
                },
                "scope": {
                    "project": {
                        "name": self.config.project_name,
                        "domain": { "name": self.config.project_domain_name },
                    }
                }
            }
        });

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| IdentityError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(IdentityError::ApiError {
                code: status.as_u16(),
                message,
            });
        }

        let token = response
            .headers()
            .get("X-Subject-Token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                IdentityError::ParseError("X-Subject-Token header missing".to_string())
            })?;

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| IdentityError::ParseError(e.to_string()))?;

        let expires_at = payload
            .pointer("/token/expires_at")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<DateTime<Utc>>().ok())
            .unwrap_or_else(|| Utc::now() + ChronoDuration::hours(1));

        tracing::info!(expires_at = %expires_at, "Obtained identity token");

        Ok(CachedToken {
            value: token,
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clear_os_env() {
        for key in [
            "OS_AUTH_URL",
            "OS_USERNAME",
            "OS_PASSWORD",
            "OS_USER_DOMAIN_NAME",
            "OS_PROJECT_NAME",
            "OS_PROJECT_DOMAIN_NAME",
        ] {
            std::env::remove_var(key);
        }
    }

    // One test covers both paths: parallel tests sharing OS_* process
    // state would race otherwise.
    #[test]
    fn test_from_env() {
        clear_os_env();
        let err = IdentityConfig::from_env().unwrap_err();
        assert!(matches!(err, IdentityError::MissingEnvVar(ref key) if key == "OS_AUTH_URL"));

        std::env::set_var("OS_AUTH_URL", "http://keystone:5000/v3");
        std::env::set_var("OS_USERNAME", "cortex");
        std::env::set_var("OS_PASSWORD", "secret");
        std::env::set_var("OS_USER_DOMAIN_NAME", "Default");
        std::env::set_var("OS_PROJECT_NAME", "cloud");
        std::env::set_var("OS_PROJECT_DOMAIN_NAME", "Default");

        let config = IdentityConfig::from_env().expect("all variables present");
        assert_eq!(config.auth_url, "http://keystone:5000/v3");
        assert_eq!(config.project_name, "cloud");
        clear_os_env();
    }

    #[test]
    fn test_error_display() {
        let err = IdentityError::ApiError {
            code: 401,
            message: "unauthorized".to_string(),
        };
        assert!(err.to_string().contains("401"));

        let err = IdentityError::MissingEnvVar("OS_PASSWORD".to_string());
        assert!(err.to_string().contains("OS_PASSWORD"));
    }
}
