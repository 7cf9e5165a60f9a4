/// OAuth 2.0 authorization code flow against DigiLocker
use crate::callback::CallbackParams;
use crate::config::OAuthConfig;
use crate::error::{OAuthError, Result};
use crate::pkce::Pkce;
use crate::session::{now_secs, Session, SessionStorage, Token};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

/// Authorization flow result
#[derive(Debug, Clone)]
pub struct AuthFlowResult {
    pub url: String,
    pub state: String,
}

/// Token obtained at the end of the flow, with the phone number stashed
/// at its start
#[derive(Debug, Clone)]
pub struct AuthOutcome {
    pub token: Token,
    pub phone_number: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_token_type")]
    token_type: String,
    expires_in: Option<u64>,
    refresh_token: Option<String>,
    scope: Option<String>,
    id_token: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl From<TokenResponse> for Token {
    fn from(response: TokenResponse) -> Self {
        Token {
            expires_at: response.expires_in.map(|secs| now_secs().saturating_add(secs)),
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            token_type: response.token_type,
            expires_in: response.expires_in,
            scope: response.scope,
            id_token: response.id_token,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    error_description: Option<String>,
}

impl From<ErrorResponse> for OAuthError {
    fn from(response: ErrorResponse) -> Self {
        let ErrorResponse {
            error,
            error_description,
        } = response;

        match error.as_str() {
            "invalid_grant" => {
                OAuthError::InvalidGrant(error_description.unwrap_or_else(|| error.clone()))
            }
            "invalid_client" => OAuthError::InvalidClient,
            "access_denied" => OAuthError::AuthorizationDenied,
            _ => OAuthError::OAuthErrorResponse {
                error: error.clone(),
                description: error_description,
            },
        }
    }
}

/// 16 CSPRNG bytes, hex encoded
fn generate_state() -> Result<String> {
    let mut bytes = [0u8; 16];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| OAuthError::CryptoUnavailable(e.to_string()))?;
    Ok(hex::encode(bytes))
}

/// OAuth 2.0 client
///
/// Runs the DigiLocker authorization code flow with PKCE. The verifier
/// travels in the injected [`SessionStorage`], keyed by `state`.
pub struct OAuthClient<S: SessionStorage> {
    config: OAuthConfig,
    storage: Arc<S>,
    http: reqwest::blocking::Client,
}

impl<S: SessionStorage> OAuthClient<S> {
    /// Create a new OAuth client
    pub fn new(config: OAuthConfig, storage: Arc<S>) -> Self {
        Self {
            config,
            storage,
            http: reqwest::blocking::Client::new(),
        }
    }

    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Start the OAuth authorization flow
    ///
    /// Generates a PKCE pair and a state value, saves the session, and
    /// returns the DigiLocker URL the user should be redirected to. Sessions
    /// older than the configured TTL are discarded first.
    pub fn start_auth_flow(&self, phone_number: Option<&str>) -> Result<AuthFlowResult> {
        let pruned = self.storage.prune_expired(self.config.session_ttl_secs)?;
        if pruned > 0 {
            debug!(pruned, "discarded abandoned authorization sessions");
        }

        let pkce = Pkce::with_length_range(self.config.verifier_length)?;
        let state = generate_state()?;

        let session = match phone_number {
            Some(phone) => Session::with_phone_number(
                state.clone(),
                pkce.code_verifier().to_string(),
                phone.to_string(),
            ),
            None => Session::new(state.clone(), pkce.code_verifier().to_string()),
        };
        self.storage.save_session(&state, session)?;

        let url = self.build_auth_url(&state, pkce.code_challenge())?;
        debug!(%state, "started DigiLocker authorization");

        Ok(AuthFlowResult { url, state })
    }

    fn build_auth_url(&self, state: &str, code_challenge: &str) -> Result<String> {
        let mut params = vec![
            ("response_type", "code"),
            ("client_id", self.config.client_id.as_str()),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("state", state),
            ("code_challenge", code_challenge),
            ("code_challenge_method", Pkce::code_challenge_method()),
        ];
        if let Some(scope) = &self.config.scope {
            params.push(("scope", scope.as_str()));
        }

        Ok(Url::parse_with_params(&self.config.authorization_endpoint, &params)?.into())
    }

    /// Finish the flow from the redirect callback
    ///
    /// The session is removed before the exchange, so a replayed callback
    /// fails with [`OAuthError::InvalidState`].
    pub fn complete_auth_flow(&self, callback: &CallbackParams) -> Result<AuthOutcome> {
        let session = match self.storage.take_session(&callback.state)? {
            Some(session) => session,
            None => {
                warn!(state = %callback.state, "callback state does not match any session");
                return Err(OAuthError::InvalidState);
            }
        };

        if session.is_expired(self.config.session_ttl_secs) {
            warn!(state = %callback.state, "authorization session expired");
            return Err(OAuthError::SessionExpired);
        }

        let token = self.exchange_code(&callback.code, &session.code_verifier)?;

        Ok(AuthOutcome {
            token,
            phone_number: session.phone_number,
        })
    }

    /// Exchange an authorization code for a token
    pub fn exchange_code(&self, code: &str, code_verifier: &str) -> Result<Token> {
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("client_id", self.config.client_id.as_str()),
            ("code_verifier", code_verifier),
        ];
        if let Some(secret) = &self.config.client_secret {
            form.push(("client_secret", secret.as_str()));
        }

        let token = self.post_token_request(&form)?;
        info!("exchanged authorization code for DigiLocker token");
        Ok(token)
    }

    /// Obtain a new token with a refresh token
    pub fn refresh_token(&self, refresh_token: &str) -> Result<Token> {
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.config.client_id.as_str()),
        ];
        if let Some(secret) = &self.config.client_secret {
            form.push(("client_secret", secret.as_str()));
        }

        let mut token = self.post_token_request(&form)?;
        // Servers may omit the refresh token when it is not rotated.
        if token.refresh_token.is_none() {
            token.refresh_token = Some(refresh_token.to_string());
        }
        info!("refreshed DigiLocker token");
        Ok(token)
    }

    fn post_token_request(&self, form: &[(&str, &str)]) -> Result<Token> {
        let response = self
            .http
            .post(&self.config.token_endpoint)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(form)
            .send()?;

        let status = response.status();
        let body = response.text()?;

        if !status.is_success() {
            return Err(match serde_json::from_str::<ErrorResponse>(&body) {
                Ok(error) => error.into(),
                Err(_) => OAuthError::InvalidResponse(format!("HTTP {}: {}", status, body)),
            });
        }

        let token: TokenResponse = serde_json::from_str(&body)?;
        Ok(token.into())
    }

    /// Get a token by key
    pub fn get_token(&self, key: &str) -> Result<Option<Token>> {
        self.storage.get_token(key)
    }

    /// Save a token
    pub fn save_token(&self, key: &str, token: Token) -> Result<()> {
        self.storage.save_token(key, token)
    }
}

/// Token refresher with concurrency control
///
/// Holds one lock per token key. Callers that queue behind an in-flight
/// refresh pick up the token it stored instead of refreshing again.
pub struct TokenRefresher<S: SessionStorage> {
    client: Arc<OAuthClient<S>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<S: SessionStorage> TokenRefresher<S> {
    /// Create a new token refresher
    pub fn new(client: Arc<OAuthClient<S>>) -> Self {
        Self {
            client,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks.lock().entry(key.to_string()).or_default().clone()
    }

    /// Return the stored token for `key`, refreshing it first if expired
    pub fn get_valid_token(&self, key: &str) -> Result<Token> {
        let key_lock = self.key_lock(key);
        let _guard = key_lock.lock();

        let current = self
            .client
            .get_token(key)?
            .ok_or_else(|| OAuthError::StorageError(format!("no token stored for {}", key)))?;

        if !current.is_expired() {
            return Ok(current);
        }

        let refresh_token = current.refresh_token.ok_or(OAuthError::NoRefreshToken)?;
        let token = self.client.refresh_token(&refresh_token)?;
        self.client.save_token(key, token.clone())?;

        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemoryStorage;
    use mockito::{Matcher, Server};
    use std::thread;

    fn test_config(token_endpoint: String) -> OAuthConfig {
        let mut config = OAuthConfig::digilocker("test-client", "https://portal.example/callback");
        config.token_endpoint = token_endpoint;
        config
    }

    fn query_param(url: &str, name: &str) -> Option<String> {
        Url::parse(url)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    #[test]
    fn test_oauth_start_flow() {
        let storage = Arc::new(MemoryStorage::new());
        let config = test_config("https://auth.example/token".to_string()).with_scope("openid");
        let client = OAuthClient::new(config, storage.clone());

        let result = client.start_auth_flow(None).unwrap();

        assert_eq!(result.state.len(), 32);
        assert_eq!(query_param(&result.url, "client_id").as_deref(), Some("test-client"));
        assert_eq!(query_param(&result.url, "response_type").as_deref(), Some("code"));
        assert_eq!(query_param(&result.url, "code_challenge_method").as_deref(), Some("S256"));
        assert_eq!(query_param(&result.url, "scope").as_deref(), Some("openid"));
        assert_eq!(
            query_param(&result.url, "redirect_uri").as_deref(),
            Some("https://portal.example/callback")
        );
        assert_eq!(query_param(&result.url, "state"), Some(result.state.clone()));

        let session = storage.get_session(&result.state).unwrap().unwrap();
        let challenge = Pkce::from_verifier(session.code_verifier).unwrap();
        assert_eq!(
            query_param(&result.url, "code_challenge").as_deref(),
            Some(challenge.code_challenge())
        );
    }

    #[test]
    fn test_complete_flow_sends_verifier() {
        let mut server = Server::new();
        let storage = Arc::new(MemoryStorage::new());
        let config = test_config(format!("{}/token", server.url())).with_client_secret("s3cret");
        let client = OAuthClient::new(config, storage.clone());

        let flow = client.start_auth_flow(Some("9876543210")).unwrap();
        let verifier = storage.get_session(&flow.state).unwrap().unwrap().code_verifier;

        let mock = server
            .mock("POST", "/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
                Matcher::UrlEncoded("code".into(), "auth-code".into()),
                Matcher::UrlEncoded("code_verifier".into(), verifier),
                Matcher::UrlEncoded("client_secret".into(), "s3cret".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"at","token_type":"Bearer","expires_in":3600,"refresh_token":"rt"}"#)
            .create();

        let callback = CallbackParams {
            code: "auth-code".to_string(),
            state: flow.state.clone(),
        };
        let outcome = client.complete_auth_flow(&callback).unwrap();

        mock.assert();
        assert_eq!(outcome.token.access_token, "at");
        assert_eq!(outcome.token.refresh_token.as_deref(), Some("rt"));
        assert!(!outcome.token.is_expired());
        assert_eq!(outcome.phone_number.as_deref(), Some("9876543210"));

        // The session was consumed by the first exchange.
        assert!(matches!(
            client.complete_auth_flow(&callback),
            Err(OAuthError::InvalidState)
        ));
    }

    #[test]
    fn test_unknown_state_rejected() {
        let storage = Arc::new(MemoryStorage::new());
        let client = OAuthClient::new(test_config("https://auth.example/token".into()), storage);

        let callback = CallbackParams {
            code: "code".to_string(),
            state: "forged".to_string(),
        };
        assert!(matches!(
            client.complete_auth_flow(&callback),
            Err(OAuthError::InvalidState)
        ));
    }

    #[test]
    fn test_expired_session_rejected() {
        let storage = Arc::new(MemoryStorage::new());
        let client = OAuthClient::new(
            test_config("https://auth.example/token".into()),
            storage.clone(),
        );

        let flow = client.start_auth_flow(None).unwrap();
        let mut session = storage.get_session(&flow.state).unwrap().unwrap();
        session.created_at -= client.config().session_ttl_secs + 1;
        storage.save_session(&flow.state, session).unwrap();

        let callback = CallbackParams {
            code: "code".to_string(),
            state: flow.state,
        };
        assert!(matches!(
            client.complete_auth_flow(&callback),
            Err(OAuthError::SessionExpired)
        ));
    }

    #[test]
    fn test_start_flow_discards_abandoned_sessions() {
        let storage = Arc::new(MemoryStorage::new());
        let client = OAuthClient::new(
            test_config("https://auth.example/token".into()),
            storage.clone(),
        );

        let abandoned = client.start_auth_flow(None).unwrap();
        let mut session = storage.get_session(&abandoned.state).unwrap().unwrap();
        session.created_at -= 10_000;
        storage.save_session(&abandoned.state, session).unwrap();

        let fresh = client.start_auth_flow(None).unwrap();

        assert!(storage.get_session(&abandoned.state).unwrap().is_none());
        assert!(storage.get_session(&fresh.state).unwrap().is_some());
    }

    #[test]
    fn test_huge_expires_in_saturates() {
        let mut server = Server::new();
        let storage = Arc::new(MemoryStorage::new());
        let client = OAuthClient::new(test_config(format!("{}/token", server.url())), storage);

        let _mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_body(format!(r#"{{"access_token":"a","expires_in":{}}}"#, u64::MAX))
            .create();

        let token = client.exchange_code("x", "v").unwrap();
        assert_eq!(token.expires_at, Some(u64::MAX));
        assert!(!token.is_expired());
    }

    #[test]
    fn test_token_error_mapping() {
        let mut server = Server::new();
        let storage = Arc::new(MemoryStorage::new());
        let client = OAuthClient::new(test_config(format!("{}/token", server.url())), storage);

        let _grant = server
            .mock("POST", "/token")
            .match_body(Matcher::UrlEncoded("code".into(), "stale".into()))
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant","error_description":"code expired"}"#)
            .create();
        let _client_error = server
            .mock("POST", "/token")
            .match_body(Matcher::UrlEncoded("code".into(), "bad-client".into()))
            .with_status(401)
            .with_body(r#"{"error":"invalid_client"}"#)
            .create();
        let _html = server
            .mock("POST", "/token")
            .match_body(Matcher::UrlEncoded("code".into(), "gateway".into()))
            .with_status(502)
            .with_body("<html>Bad Gateway</html>")
            .create();

        match client.exchange_code("stale", "v") {
            Err(OAuthError::InvalidGrant(description)) => assert_eq!(description, "code expired"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(matches!(
            client.exchange_code("bad-client", "v"),
            Err(OAuthError::InvalidClient)
        ));
        assert!(matches!(
            client.exchange_code("gateway", "v"),
            Err(OAuthError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_refresh_keeps_refresh_token() {
        let mut server = Server::new();
        let storage = Arc::new(MemoryStorage::new());
        let client = OAuthClient::new(test_config(format!("{}/token", server.url())), storage);

        let _mock = server
            .mock("POST", "/token")
            .match_body(Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()))
            .with_status(200)
            .with_body(r#"{"access_token":"new","expires_in":60}"#)
            .create();

        let token = client.refresh_token("old-refresh").unwrap();
        assert_eq!(token.access_token, "new");
        assert_eq!(token.token_type, "Bearer");
        assert_eq!(token.refresh_token.as_deref(), Some("old-refresh"));
    }

    #[test]
    fn test_token_refresher_refreshes_once() {
        let mut server = Server::new();
        let storage = Arc::new(MemoryStorage::new());
        let client = Arc::new(OAuthClient::new(
            test_config(format!("{}/token", server.url())),
            storage,
        ));

        let expired = Token {
            access_token: "stale".to_string(),
            refresh_token: Some("rt".to_string()),
            token_type: "Bearer".to_string(),
            expires_in: Some(3600),
            expires_at: Some(now_secs() - 10),
            scope: None,
            id_token: None,
        };
        client.save_token("digilocker:user", expired).unwrap();

        let mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_body(r#"{"access_token":"fresh","expires_in":3600,"refresh_token":"rt2"}"#)
            .expect(1)
            .create();

        let refresher = Arc::new(TokenRefresher::new(client.clone()));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let refresher = refresher.clone();
                thread::spawn(move || refresher.get_valid_token("digilocker:user").unwrap())
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap().access_token, "fresh");
        }
        mock.assert();
    }

    #[test]
    fn test_token_refresher_without_refresh_token() {
        let storage = Arc::new(MemoryStorage::new());
        let client = Arc::new(OAuthClient::new(
            test_config("https://auth.example/token".into()),
            storage,
        ));
        let expired = Token {
            access_token: "stale".to_string(),
            refresh_token: None,
            token_type: "Bearer".to_string(),
            expires_in: None,
            expires_at: Some(now_secs() - 10),
            scope: None,
            id_token: None,
        };
        client.save_token("digilocker:user", expired).unwrap();

        let refresher = TokenRefresher::new(client);
        assert!(matches!(
            refresher.get_valid_token("digilocker:user"),
            Err(OAuthError::NoRefreshToken)
        ));
    }
}
