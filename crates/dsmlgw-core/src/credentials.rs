//! Caller credentials and identity.
//!
//! The transport hands over the raw `Authorization` header value, if any.
//! Decoding it is the only thing done here; checking it against the
//! directory happens in [`Gateway::authenticate`](crate::Gateway::authenticate).
//!
//! # Security
//!
//! - **Debug Redaction**: The `Debug` impl of [`Credentials`] redacts the
//!   password so credentials never reach the logs.

use base64::{Engine, engine::general_purpose::STANDARD};

use crate::{directory::DirectoryError, pool::PoolError};

/// Credentials presented with a batch.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// No `Authorization` header.
    Anonymous,
    /// HTTP Basic credentials.
    Basic {
        /// User name: a DN, or a user id resolved under the search base.
        principal: String,
        /// Password.
        password: String,
    },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anonymous => f.write_str("Anonymous"),
            Self::Basic { principal, password } => f
                .debug_struct("Basic")
                .field("principal", principal)
                .field("password", &format!("<redacted {} bytes>", password.len()))
                .finish(),
        }
    }
}

impl Credentials {
    /// Decode an optional `Authorization` header value.
    pub fn from_basic_auth(header: Option<&str>) -> Result<Self, AuthError> {
        let Some(header) = header.map(str::trim).filter(|h| !h.is_empty()) else {
            return Ok(Self::Anonymous);
        };

        let (scheme, encoded) = header
            .split_once(char::is_whitespace)
            .ok_or_else(|| AuthError::MalformedHeader("missing credentials".to_string()))?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return Err(AuthError::MalformedHeader(format!("unsupported scheme {scheme}")));
        }

        let decoded = STANDARD
            .decode(encoded.trim())
            .map_err(|e| AuthError::MalformedHeader(format!("invalid base64: {e}")))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|_| AuthError::MalformedHeader("credentials are not UTF-8".to_string()))?;
        let (principal, password) = decoded
            .split_once(':')
            .ok_or_else(|| AuthError::MalformedHeader("missing ':' separator".to_string()))?;

        Ok(Self::Basic { principal: principal.to_string(), password: password.to_string() })
    }
}

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// Anonymous access.
    Anonymous,
    /// A user bound successfully as this DN.
    User {
        /// Bound DN.
        dn: String,
    },
}

impl Identity {
    /// Authorization identity for the proxied authorization control.
    pub fn authz_id(&self) -> String {
        match self {
            Self::Anonymous => "dn:".to_string(),
            Self::User { dn } => format!("dn:{dn}"),
        }
    }
}

/// Why a caller could not be authenticated.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The `Authorization` header could not be decoded.
    #[error("malformed Authorization header: {0}")]
    MalformedHeader(String),

    /// Anonymous access is disabled.
    #[error("anonymous access is not allowed")]
    AnonymousNotAllowed,

    /// The principal did not resolve to an entry.
    #[error("unknown principal {0}")]
    UnknownPrincipal(String),

    /// The principal resolved to more than one entry.
    #[error("principal {0} is ambiguous")]
    AmbiguousPrincipal(String),

    /// The directory rejected the password.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// The directory refused the bind for another reason.
    #[error("bind rejected: {0}")]
    Rejected(String),

    /// No connection was available for the check.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// The directory did not answer.
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}
