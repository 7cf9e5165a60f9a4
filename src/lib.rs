//! Raitha DigiLocker - OAuth 2.0 with PKCE for the land-registration portal
//!
//! Landowners sign in to the portal through DigiLocker using the
//! authorization code flow with PKCE (Proof Key for Code Exchange).
//!
//! # Features
//!
//! - RFC 7636 code verifier and S256 challenge generation from the OS CSPRNG
//! - Injected session storage carrying the verifier between redirect and callback
//! - Token exchange and refresh against the DigiLocker token endpoint
//! - Per-key refresh coordination
//!
//! # Example
//!
//! ```
//! use raitha_digilocker::prelude::*;
//! use std::sync::Arc;
//!
//! let storage = Arc::new(MemoryStorage::new());
//! let config = OAuthConfig::digilocker("your-client-id", "https://portal.example/callback");
//!
//! let client = OAuthClient::new(config, storage);
//! let result = client.start_auth_flow(Some("9876543210")).unwrap();
//! println!("Authorization URL: {}", result.url);
//! ```

pub mod callback;
pub mod config;
pub mod error;
pub mod oauth;
pub mod pkce;
pub mod session;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::callback::{CallbackParams, CallbackServer};
    pub use crate::config::{OAuthConfig, Settings};
    pub use crate::error::{OAuthError, Result};
    pub use crate::oauth::{AuthFlowResult, AuthOutcome, OAuthClient, TokenRefresher};
    pub use crate::pkce::{generate_pkce_pair, Pkce, PkcePair, VerifierLength};
    pub use crate::session::{FileStorage, MemoryStorage, Session, SessionStorage, Token};
}

#[cfg(test)]
mod tests {
    use super::prelude::*;
    use std::sync::Arc;

    #[test]
    fn test_full_oauth_flow() {
        let mut server = mockito::Server::new();
        let _token = server
            .mock("POST", "/token")
            .with_status(200)
            .with_body(r#"{"access_token":"digilocker-access","expires_in":3600}"#)
            .create();

        let storage = Arc::new(MemoryStorage::new());
        let mut config = OAuthConfig::digilocker("test-client", "https://portal.example/callback");
        config.token_endpoint = format!("{}/token", server.url());

        let client = Arc::new(OAuthClient::new(config, storage.clone()));
        let flow = client.start_auth_flow(None).unwrap();
        assert!(storage.get_session(&flow.state).unwrap().is_some());

        let callback_url = format!(
            "https://portal.example/callback?code=abc&state={}",
            flow.state
        );
        let callback = CallbackParams::from_url(&callback_url).unwrap();
        let outcome = client.complete_auth_flow(&callback).unwrap();
        client.save_token("digilocker:user", outcome.token).unwrap();

        let refresher = TokenRefresher::new(client.clone());
        let token = refresher.get_valid_token("digilocker:user").unwrap();

        assert_eq!(token.access_token, "digilocker-access");
        assert!(!token.is_expired());
        assert!(storage.get_session(&flow.state).unwrap().is_none());
    }
}
