use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::authentication::{Authentication, AuthenticationScheme};
use crate::envelope::{envelope_header_builders, EnvelopeHeader, Reason};
use crate::error::Result;

/// Lifecycle state of a session.
///
/// Declaration order follows the lifecycle; `Failed` is reachable from any
/// non-terminal state.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    New,
    Negotiating,
    Authenticating,
    Established,
    Finishing,
    Finished,
    Failed,
}

impl SessionState {
    /// Finished and Failed end the session.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Negotiating => "negotiating",
            Self::Authenticating => "authenticating",
            Self::Established => "established",
            Self::Finishing => "finishing",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Compression applied to the transport stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionCompression {
    #[default]
    None,
    Gzip,
}

/// Encryption applied to the transport stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionEncryption {
    #[default]
    None,
    Tls,
}

impl fmt::Display for SessionCompression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Gzip => "gzip",
        })
    }
}

impl fmt::Display for SessionEncryption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Tls => "tls",
        })
    }
}

/// Negotiation and lifecycle envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(flatten)]
    pub header: EnvelopeHeader,
    pub state: SessionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_options: Option<Vec<SessionEncryption>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<SessionEncryption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_options: Option<Vec<SessionCompression>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<SessionCompression>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme_options: Option<Vec<AuthenticationScheme>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<AuthenticationScheme>,
    /// Scheme-specific authentication document, interpreted with `scheme`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
}

impl Session {
    pub fn new(state: SessionState) -> Self {
        Self {
            header: EnvelopeHeader::default(),
            state,
            encryption_options: None,
            encryption: None,
            compression_options: None,
            compression: None,
            scheme_options: None,
            scheme: None,
            authentication: None,
            reason: None,
        }
    }

    /// A `failed` session carrying its reason.
    pub fn failed(reason: Reason) -> Self {
        Self {
            reason: Some(reason),
            ..Self::new(SessionState::Failed)
        }
    }

    /// Set both the scheme and the authentication document.
    pub fn with_authentication(mut self, authentication: &Authentication) -> Self {
        self.scheme = Some(authentication.scheme());
        self.authentication = Some(authentication.to_value());
        self
    }

    /// Interpret the authentication document with the declared scheme.
    pub fn authentication(&self) -> Result<Option<Authentication>> {
        match self.scheme {
            Some(scheme) => {
                let value = self.authentication.clone().unwrap_or(Value::Null);
                Authentication::from_value(scheme, &value).map(Some)
            }
            None => Ok(None),
        }
    }
}

envelope_header_builders!(Session);

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn state_order_and_terminals() {
        assert!(SessionState::New < SessionState::Negotiating);
        assert!(SessionState::Authenticating < SessionState::Established);
        assert!(SessionState::Finishing < SessionState::Finished);
        assert!(SessionState::Finished.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert!(!SessionState::Finishing.is_terminal());
    }

    #[test]
    fn negotiation_fields_use_camel_case() {
        let session = Session {
            encryption_options: Some(vec![SessionEncryption::None, SessionEncryption::Tls]),
            compression_options: Some(vec![SessionCompression::None]),
            ..Session::new(SessionState::Negotiating)
        }
        .with_id("s1");
        let value = serde_json::to_value(&session).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "s1",
                "state": "negotiating",
                "encryptionOptions": ["none", "tls"],
                "compressionOptions": ["none"]
            })
        );
    }

    #[test]
    fn authentication_roundtrip_through_scheme() {
        let session = Session::new(SessionState::Authenticating)
            .with_authentication(&Authentication::plain("secret"));
        let value = serde_json::to_value(&session).unwrap();
        assert_eq!(value["scheme"], "plain");
        assert_eq!(value["authentication"]["password"], "c2VjcmV0");

        let decoded: Session = serde_json::from_value(value).unwrap();
        assert_eq!(
            decoded.authentication().unwrap(),
            Some(Authentication::plain("secret"))
        );
    }

    #[test]
    fn failed_session_reason() {
        let session: Session = serde_json::from_value(json!({
            "state": "failed",
            "reason": { "code": 13, "description": "invalid credentials" }
        }))
        .unwrap();
        assert_eq!(session.reason.map(|r| r.code), Some(13));
    }
}
