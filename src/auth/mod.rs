//! OAuth2 token lifecycle: persistent storage and rotating refresh.

pub mod oauth;
pub mod token_store;

pub use oauth::{AuthStatus, OAuthManager, DEFAULT_REFRESH_SKEW_SECS};
pub use token_store::{TokenBundle, TokenStore};
