/// OAuth client configuration and settings loading
use crate::error::{OAuthError, Result};
use crate::pkce::VerifierLength;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use url::Url;

pub const DIGILOCKER_AUTHORIZATION_ENDPOINT: &str =
    "https://api.digitallocker.gov.in/public/oauth2/1/authorize";
pub const DIGILOCKER_TOKEN_ENDPOINT: &str =
    "https://api.digitallocker.gov.in/public/oauth2/2/token";

/// Ten minutes, long enough to finish the DigiLocker consent screens
pub const DEFAULT_SESSION_TTL_SECS: u64 = 600;

/// OAuth 2.0 configuration
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub redirect_uri: String,
    pub scope: Option<String>,
    pub verifier_length: VerifierLength,
    pub session_ttl_secs: u64,
}

impl OAuthConfig {
    /// Configuration for the DigiLocker partner endpoints
    ///
    /// # Example
    ///
    /// ```
    /// use raitha_digilocker::config::OAuthConfig;
    ///
    /// let config = OAuthConfig::digilocker("client-id", "https://portal.example/callback");
    /// assert!(config.token_endpoint.contains("digitallocker"));
    /// ```
    pub fn digilocker(client_id: impl Into<String>, redirect_uri: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: None,
            authorization_endpoint: DIGILOCKER_AUTHORIZATION_ENDPOINT.to_string(),
            token_endpoint: DIGILOCKER_TOKEN_ENDPOINT.to_string(),
            redirect_uri: redirect_uri.into(),
            scope: None,
            verifier_length: VerifierLength::default(),
            session_ttl_secs: DEFAULT_SESSION_TTL_SECS,
        }
    }

    pub fn with_client_secret(mut self, client_secret: impl Into<String>) -> Self {
        self.client_secret = Some(client_secret.into());
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }
}

/// Settings read from a JSON file and overlaid with `DIGILOCKER_*` variables
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub redirect_uri: Option<String>,
    pub authorization_endpoint: Option<String>,
    pub token_endpoint: Option<String>,
    pub scope: Option<String>,
    pub verifier_min_length: Option<usize>,
    pub verifier_max_length: Option<usize>,
    pub session_ttl_secs: Option<u64>,
}

impl Settings {
    /// Read settings from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Load the optional file, then apply the process environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let settings = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        Ok(settings.with_env(|name| std::env::var(name).ok()))
    }

    /// Overlay values from an environment lookup
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let overlay = |field: &mut Option<String>, name: &str| {
            if let Some(value) = lookup(name).filter(|v| !v.is_empty()) {
                *field = Some(value);
            }
        };

        overlay(&mut self.client_id, "DIGILOCKER_CLIENT_ID");
        overlay(&mut self.client_secret, "DIGILOCKER_CLIENT_SECRET");
        overlay(&mut self.redirect_uri, "DIGILOCKER_REDIRECT_URI");
        overlay(&mut self.authorization_endpoint, "DIGILOCKER_AUTHORIZATION_ENDPOINT");
        overlay(&mut self.token_endpoint, "DIGILOCKER_TOKEN_ENDPOINT");
        overlay(&mut self.scope, "DIGILOCKER_SCOPE");
        self
    }

    /// Validate and build the client configuration
    pub fn into_oauth_config(self) -> Result<OAuthConfig> {
        let client_id = self
            .client_id
            .ok_or_else(|| OAuthError::Config("client_id is not set".to_string()))?;
        let redirect_uri = self
            .redirect_uri
            .ok_or_else(|| OAuthError::Config("redirect_uri is not set".to_string()))?;

        let defaults = VerifierLength::default();
        let verifier_length = VerifierLength::new(
            self.verifier_min_length.unwrap_or(defaults.min()),
            self.verifier_max_length.unwrap_or(defaults.max()),
        )?;

        let mut config = OAuthConfig::digilocker(client_id, redirect_uri);
        config.client_secret = self.client_secret;
        config.scope = self.scope;
        config.verifier_length = verifier_length;
        if let Some(endpoint) = self.authorization_endpoint {
            config.authorization_endpoint = endpoint;
        }
        if let Some(endpoint) = self.token_endpoint {
            config.token_endpoint = endpoint;
        }
        if let Some(ttl) = self.session_ttl_secs {
            config.session_ttl_secs = ttl;
        }

        for (name, value) in [
            ("authorization_endpoint", &config.authorization_endpoint),
            ("token_endpoint", &config.token_endpoint),
            ("redirect_uri", &config.redirect_uri),
        ] {
            Url::parse(value)
                .map_err(|e| OAuthError::Config(format!("{} is not a valid URL: {}", name, e)))?;
        }

        Ok(config)
    }
}
