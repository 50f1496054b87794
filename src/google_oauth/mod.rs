pub mod endpoints;
pub mod service;

pub use service::{FreshToken, GoogleOauthService, RefreshGrant};
