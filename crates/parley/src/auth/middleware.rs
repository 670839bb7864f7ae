//! Authentication middleware.

use axum::{
    extract::{FromRequestParts, State},
    http::{
        header::{AUTHORIZATION, COOKIE},
        request::Parts,
    },
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use log::{debug, warn};
use std::sync::Arc;

use super::{AuthConfig, AuthError, Claims, ConfigValidationError};

/// Header carrying the user id in dev mode.
pub const DEV_USER_HEADER: &str = "x-dev-user";

/// Cookie carrying the token for browser clients.
const AUTH_COOKIE: &str = "auth_token";

/// Lifetime of tokens minted by [`AuthState::generate_token`].
const TOKEN_TTL_SECS: i64 = 3600 * 24;

/// Extract a Bearer token from an Authorization header value.
fn bearer_token_from_header(header_value: &str) -> Result<&str, AuthError> {
    let mut parts = header_value.split_whitespace();
    let scheme = parts.next().ok_or(AuthError::InvalidAuthHeader)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::InvalidAuthHeader);
    }
    let token = parts.next().ok_or(AuthError::InvalidAuthHeader)?;
    if parts.next().is_some() {
        return Err(AuthError::InvalidAuthHeader);
    }
    Ok(token)
}

fn token_from_cookie_header<'a>(cookie_header: &'a str, cookie_name: &str) -> Option<&'a str> {
    cookie_header.split(';').map(str::trim).find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        (name.trim() == cookie_name).then(|| value.trim())
    })
}

fn token_from_query(query: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key == "token" {
            urlencoding::decode(value).ok().map(|s| s.into_owned())
        } else {
            None
        }
    })
}

/// Authentication state shared across handlers.
#[derive(Clone)]
pub struct AuthState {
    dev_mode: bool,
    secret: Option<Arc<String>>,
    decoding_key: Option<DecodingKey>,
}

impl AuthState {
    /// Create auth state from config. Resolves `env:VAR_NAME` in the secret.
    pub fn new(config: &AuthConfig) -> Result<Self, ConfigValidationError> {
        let secret = config.resolve_jwt_secret()?;
        let decoding_key = secret
            .as_ref()
            .map(|s| DecodingKey::from_secret(s.as_bytes()));
        Ok(Self {
            dev_mode: config.dev_mode,
            secret: secret.map(Arc::new),
            decoding_key,
        })
    }

    pub fn is_dev_mode(&self) -> bool {
        self.dev_mode
    }

    /// Validate a JWT token.
    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        let decoding_key = self
            .decoding_key
            .as_ref()
            .ok_or_else(|| AuthError::Internal("no JWT secret configured".to_string()))?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.required_spec_claims.clear();

        let token_data = decode::<Claims>(token, decoding_key, &validation).map_err(|e| {
            warn!("JWT validation failed: {:?}", e);
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken(e.to_string()),
            }
        })?;

        Ok(token_data.claims)
    }

    /// Mint a token for a user.
    pub fn generate_token(&self, user_id: &str, name: Option<&str>) -> Result<String, AuthError> {
        let secret = self
            .secret
            .as_ref()
            .ok_or_else(|| AuthError::Internal("no JWT secret configured".to_string()))?;

        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            iss: Some("parley".to_string()),
            exp: now + TOKEN_TTL_SECS,
            iat: Some(now),
            email: None,
            name: name.map(str::to_string),
            preferred_username: None,
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .map_err(|e| AuthError::Internal(e.to_string()))
    }

    fn dev_claims(user_id: &str) -> Claims {
        Claims {
            sub: user_id.to_string(),
            iss: Some("dev".to_string()),
            exp: Utc::now().timestamp() + TOKEN_TTL_SECS,
            iat: Some(Utc::now().timestamp()),
            email: None,
            name: None,
            preferred_username: Some(user_id.to_string()),
        }
    }
}

/// Authenticated user extracted from request.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub claims: Claims,
}

impl CurrentUser {
    /// The user ID, used as actor id.
    pub fn id(&self) -> &str {
        &self.claims.sub
    }

    pub fn display_name(&self) -> &str {
        self.claims.display_name()
    }
}

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentUser>()
            .cloned()
            .ok_or(AuthError::MissingAuthHeader)
    }
}

/// Authentication middleware.
///
/// Validates the request and injects `CurrentUser` into request extensions.
/// Credentials are taken in priority order:
/// 1. Authorization: Bearer <token> header
/// 2. auth_token cookie
/// 3. token query parameter (EventSource clients cannot set headers)
/// 4. X-Dev-User header (dev mode only)
pub async fn auth_middleware(
    State(auth): State<AuthState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, AuthError> {
    let headers = req.headers();
    let auth_header = headers.get(AUTHORIZATION).and_then(|h| h.to_str().ok());
    let cookie_token = headers
        .get(COOKIE)
        .and_then(|h| h.to_str().ok())
        .and_then(|cookie| token_from_cookie_header(cookie, AUTH_COOKIE));
    let query_token = req.uri().query().and_then(token_from_query);

    let claims = if let Some(header) = auth_header {
        auth.validate_token(bearer_token_from_header(header)?)?
    } else if let Some(token) = cookie_token {
        auth.validate_token(token)?
    } else if let Some(token) = query_token.as_deref() {
        auth.validate_token(token)?
    } else if auth.is_dev_mode() {
        let user_id = headers
            .get(DEV_USER_HEADER)
            .and_then(|h| h.to_str().ok())
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or(AuthError::MissingAuthHeader)?;
        debug!("Using dev user: {}", user_id);
        AuthState::dev_claims(user_id)
    } else {
        return Err(AuthError::MissingAuthHeader);
    };

    req.extensions_mut().insert(CurrentUser { claims });
    Ok(next.run(req).await)
}
