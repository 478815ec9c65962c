use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use super::{SecretError, SecretStore};

/// Reads secrets from the process environment.
///
/// `ai-project-conn-string` with prefix `CLINICAL_SECRET_` is read from
/// `CLINICAL_SECRET_AI_PROJECT_CONN_STRING`. Writes are kept in memory by
/// this store and its clones; the process environment is never modified.
#[derive(Debug, Clone)]
pub struct EnvSecretStore {
    prefix: String,
    written: Arc<Mutex<HashMap<String, String>>>,
}

impl EnvSecretStore {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            written: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Environment variable name for a secret.
    pub fn var_name(&self, secret: &str) -> String {
        let key: String = secret
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{key}", self.prefix)
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn get_secret(&self, name: &str) -> Result<String, SecretError> {
        let var = self.var_name(name);
        let written = self
            .written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&var)
            .cloned();
        written
            .or_else(|| std::env::var(&var).ok())
            .ok_or_else(|| SecretError::NotFound(name.to_string()))
    }

    async fn set_secret(&self, name: &str, value: &str) -> Result<(), SecretError> {
        let var = self.var_name(name);
        tracing::warn!(
            secret = %name,
            env_var = %var,
            "Secret kept in memory only; set the environment variable to persist it"
        );
        self.written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(var, value.to_string());
        Ok(())
    }
}
