//! Authentication.
//!
//! Requests are authenticated with an HS256 JWT, read from the
//! `Authorization` header, the `auth_token` cookie or a `token` query
//! parameter. In dev mode an `X-Dev-User` header is accepted instead.

mod claims;
mod config;
mod error;
mod middleware;

pub use claims::Claims;
pub use config::{AuthConfig, ConfigValidationError};
pub use error::AuthError;
pub use middleware::{AuthState, CurrentUser, DEV_USER_HEADER, auth_middleware};
