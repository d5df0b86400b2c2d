//! Upstream Credential Sources
//!
//! Dhan credentials come from the environment or from a JSON file of the
//! form `{"accessToken": "...", "clientId": "..."}`. They are read once at
//! startup.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::application::ports::{CredentialSource, CredentialsError, FeedCredentials};

/// Environment variable holding the access token.
pub const ACCESS_TOKEN_VAR: &str = "DHAN_ACCESS_TOKEN";
/// Environment variable holding the client id.
pub const CLIENT_ID_VAR: &str = "DHAN_CLIENT_ID";

// =============================================================================
// Environment
// =============================================================================

/// Reads credentials from two environment variables.
#[derive(Debug, Clone)]
pub struct EnvCredentialSource {
    token_var: String,
    client_id_var: String,
}

impl Default for EnvCredentialSource {
    fn default() -> Self {
        Self::with_vars(ACCESS_TOKEN_VAR, CLIENT_ID_VAR)
    }
}

impl EnvCredentialSource {
    /// Read from custom variable names.
    #[must_use]
    pub fn with_vars(token_var: impl Into<String>, client_id_var: impl Into<String>) -> Self {
        Self {
            token_var: token_var.into(),
            client_id_var: client_id_var.into(),
        }
    }
}

impl CredentialSource for EnvCredentialSource {
    fn load(&self) -> Result<FeedCredentials, CredentialsError> {
        let token = std::env::var(&self.token_var)
            .map_err(|_| CredentialsError::Missing(format!("{} is not set", self.token_var)))?;
        let client_id = std::env::var(&self.client_id_var)
            .map_err(|_| CredentialsError::Missing(format!("{} is not set", self.client_id_var)))?;

        FeedCredentials::new(token, client_id)
    }
}

// =============================================================================
// File
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialsFile {
    access_token: String,
    client_id: String,
}

/// Reads credentials from a JSON file.
#[derive(Debug, Clone)]
pub struct FileCredentialSource {
    path: PathBuf,
}

impl FileCredentialSource {
    /// Read from `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The file this source reads.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialSource for FileCredentialSource {
    fn load(&self) -> Result<FeedCredentials, CredentialsError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CredentialsError::Missing(format!(
                    "{} does not exist",
                    self.path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let file: CredentialsFile = serde_json::from_str(&raw)?;
        FeedCredentials::new(file.access_token, file.client_id)
    }
}

// =============================================================================
// Fallback Chain
// =============================================================================

/// Tries each source in order; the first that has credentials wins.
///
/// A source reporting `Missing` falls through to the next one. Read and
/// parse errors stop the chain.
#[derive(Default)]
pub struct ChainedCredentialSource {
    sources: Vec<Box<dyn CredentialSource>>,
}

impl ChainedCredentialSource {
    /// Create an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a source.
    #[must_use]
    pub fn with(mut self, source: impl CredentialSource + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    /// Environment first, then the configured file if any.
    #[must_use]
    pub fn standard(credentials_file: Option<&Path>) -> Self {
        let chain = Self::new().with(EnvCredentialSource::default());
        match credentials_file {
            Some(path) => chain.with(FileCredentialSource::new(path)),
            None => chain,
        }
    }
}

impl CredentialSource for ChainedCredentialSource {
    fn load(&self) -> Result<FeedCredentials, CredentialsError> {
        let mut missing = Vec::new();

        for source in &self.sources {
            match source.load() {
                Ok(credentials) => return Ok(credentials),
                Err(CredentialsError::Missing(reason)) => missing.push(reason),
                Err(e) => return Err(e),
            }
        }

        if missing.is_empty() {
            missing.push("no credential source configured".to_string());
        }
        Err(CredentialsError::Missing(missing.join("; ")))
    }
}
