use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(InstanceId, "inst");
branded_id!(SessionId, "sess");

impl InstanceId {
    /// Identifier for a child instance created at a parent's call site.
    /// Deterministic: replaying the parent derives the same child id.
    pub fn child(&self, sequence_no: u32) -> Self {
        Self(format!("{}:{sequence_no}", self.0))
    }
}

/// Registry key for an agent definition. Not a generated id; names are
/// chosen at registration time.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentName(String);

impl AgentName {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AgentName {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_owned()))
    }
}

impl AsRef<str> for AgentName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Addresses one conversation: an agent name plus a session id.
/// Canonical form is `agent--session`, which is also the storage key.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionKey {
    pub agent: AgentName,
    pub session: SessionId,
}

impl SessionKey {
    pub fn new(agent: AgentName, session: SessionId) -> Self {
        Self { agent, session }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}--{}", self.agent, self.session)
    }
}

impl FromStr for SessionKey {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (agent, session) = s
            .split_once("--")
            .ok_or_else(|| format!("invalid session key: {s}"))?;
        if agent.is_empty() || session.is_empty() {
            return Err(format!("invalid session key: {s}"));
        }
        Ok(Self {
            agent: AgentName::new(agent),
            session: SessionId::from_raw(session),
        })
    }
}
