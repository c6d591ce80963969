use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{EnvelopeError, Result};

/// Authentication schemes a server may offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthenticationScheme {
    Guest,
    Plain,
    Key,
    Transport,
    External,
}

impl fmt::Display for AuthenticationScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Guest => "guest",
            Self::Plain => "plain",
            Self::Key => "key",
            Self::Transport => "transport",
            Self::External => "external",
        })
    }
}

/// Credential presented while the session is authenticating.
///
/// Secrets are kept decoded in memory and base64-encoded on the wire.
/// Debug output never contains the secret material.
#[derive(Clone, PartialEq, Eq)]
pub enum Authentication {
    Guest,
    Plain { password: String },
    Key { key: String },
    Transport,
    External { token: String, issuer: String },
}

impl Authentication {
    pub fn plain(password: impl Into<String>) -> Self {
        Self::Plain {
            password: password.into(),
        }
    }

    pub fn key(key: impl Into<String>) -> Self {
        Self::Key { key: key.into() }
    }

    pub fn scheme(&self) -> AuthenticationScheme {
        match self {
            Self::Guest => AuthenticationScheme::Guest,
            Self::Plain { .. } => AuthenticationScheme::Plain,
            Self::Key { .. } => AuthenticationScheme::Key,
            Self::Transport => AuthenticationScheme::Transport,
            Self::External { .. } => AuthenticationScheme::External,
        }
    }

    /// The wire document for this credential.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Guest | Self::Transport => json!({}),
            Self::Plain { password } => json!({ "password": STANDARD.encode(password) }),
            Self::Key { key } => json!({ "key": STANDARD.encode(key) }),
            Self::External { token, issuer } => json!({ "token": token, "issuer": issuer }),
        }
    }

    /// Decode a wire document declared with `scheme`.
    pub fn from_value(scheme: AuthenticationScheme, value: &Value) -> Result<Self> {
        match scheme {
            AuthenticationScheme::Guest => Ok(Self::Guest),
            AuthenticationScheme::Transport => Ok(Self::Transport),
            AuthenticationScheme::Plain => Ok(Self::Plain {
                password: decode_field(value, "password")?,
            }),
            AuthenticationScheme::Key => Ok(Self::Key {
                key: decode_field(value, "key")?,
            }),
            AuthenticationScheme::External => Ok(Self::External {
                token: string_field(value, "token")?.to_string(),
                issuer: string_field(value, "issuer")?.to_string(),
            }),
        }
    }
}

fn string_field<'a>(value: &'a Value, field: &str) -> Result<&'a str> {
    value.get(field).and_then(Value::as_str).ok_or_else(|| {
        EnvelopeError::InvalidAuthentication(format!("missing '{field}' field"))
    })
}

fn decode_field(value: &Value, field: &str) -> Result<String> {
    let encoded = string_field(value, field)?;
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|err| EnvelopeError::InvalidAuthentication(format!("'{field}': {err}")))?;
    String::from_utf8(bytes)
        .map_err(|err| EnvelopeError::InvalidAuthentication(format!("'{field}': {err}")))
}

impl fmt::Debug for Authentication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Guest => f.write_str("Guest"),
            Self::Transport => f.write_str("Transport"),
            Self::Plain { password } => f
                .debug_struct("Plain")
                .field(
                    "password",
                    &format_args!("<redacted:{} bytes>", password.len()),
                )
                .finish(),
            Self::Key { key } => f
                .debug_struct("Key")
                .field("key", &format_args!("<redacted:{} bytes>", key.len()))
                .finish(),
            Self::External { token, issuer } => f
                .debug_struct("External")
                .field("token", &format_args!("<redacted:{} bytes>", token.len()))
                .field("issuer", issuer)
                .finish(),
        }
    }
}
