use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::EnvelopeError;

/// An identity in the form `name@domain`.
///
/// Either part may be absent; a bare string without `@` is a name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Identity {
    pub name: Option<String>,
    pub domain: Option<String>,
}

/// An addressable endpoint in the form `name@domain/instance`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Node {
    pub name: Option<String>,
    pub domain: Option<String>,
    pub instance: Option<String>,
}

impl Identity {
    /// Create an identity from its parts.
    pub fn new(name: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: non_empty(name.into()),
            domain: non_empty(domain.into()),
        }
    }

    /// Attach an instance, producing a full node address.
    pub fn with_instance(&self, instance: impl Into<String>) -> Node {
        Node {
            name: self.name.clone(),
            domain: self.domain.clone(),
            instance: non_empty(instance.into()),
        }
    }
}

impl Node {
    /// Create a node from its parts. Empty parts are treated as absent.
    pub fn new(
        name: impl Into<String>,
        domain: impl Into<String>,
        instance: impl Into<String>,
    ) -> Self {
        Self {
            name: non_empty(name.into()),
            domain: non_empty(domain.into()),
            instance: non_empty(instance.into()),
        }
    }

    /// The `name@domain` part of this node.
    pub fn to_identity(&self) -> Identity {
        Identity {
            name: self.name.clone(),
            domain: self.domain.clone(),
        }
    }

    /// True if no part of the address is set.
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.domain.is_none() && self.instance.is_none()
    }
}

impl From<Identity> for Node {
    fn from(identity: Identity) -> Self {
        Self {
            name: identity.name,
            domain: identity.domain,
            instance: None,
        }
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn split_identity(s: &str) -> (Option<String>, Option<String>) {
    match s.split_once('@') {
        Some((name, domain)) => (non_empty(name.to_string()), non_empty(domain.to_string())),
        None => (non_empty(s.to_string()), None),
    }
}

impl FromStr for Identity {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() || s.contains('/') {
            return Err(EnvelopeError::InvalidNode(s.to_string()));
        }
        let (name, domain) = split_identity(s);
        Ok(Self { name, domain })
    }
}

impl FromStr for Node {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(EnvelopeError::InvalidNode(s.to_string()));
        }
        let (identity, instance) = match s.split_once('/') {
            Some((identity, instance)) => (identity, non_empty(instance.to_string())),
            None => (s, None),
        };
        let (name, domain) = split_identity(identity);
        Ok(Self {
            name,
            domain,
            instance,
        })
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.name {
            f.write_str(name)?;
        }
        if let Some(domain) = &self.domain {
            write!(f, "@{domain}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_identity())?;
        if let Some(instance) = &self.instance {
            write!(f, "/{instance}")?;
        }
        Ok(())
    }
}

macro_rules! string_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

string_serde!(Identity);
string_serde!(Node);
