//! Identifiers for sessions, participants, relay endpoints and signaling contexts

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new identifier
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the raw identifier
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Stable identity of one exam-taking attempt.
    ///
    /// Primary key for all stream state, independent of relay socket ids.
    SessionId
);

string_id!(
    /// Identifier of an exam taker (the `studentId` carried on the wire)
    ParticipantId
);

string_id!(
    /// Relay-assigned transient socket id of a remote endpoint.
    ///
    /// May change across reconnects of the remote side.
    EndpointRef
);

/// Local role within a signaling context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Media source (exam taker)
    Publisher,
    /// Media sink (proctor)
    Viewer,
}

impl Role {
    /// Wire name of the role, as tagged on the relay connection
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Publisher => "publisher",
            Role::Viewer => "viewer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scope of one signaling channel: an exam, seen from one local role and participant
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignalingContext {
    /// Exam identifier
    pub exam_id: String,
    /// Local role
    pub role: Role,
    /// Local participant identifier
    pub participant_id: ParticipantId,
}

impl SignalingContext {
    /// Create a new signaling context
    pub fn new(exam_id: impl Into<String>, role: Role, participant_id: impl Into<ParticipantId>) -> Self {
        Self {
            exam_id: exam_id.into(),
            role,
            participant_id: participant_id.into(),
        }
    }
}

impl fmt::Display for SignalingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.exam_id, self.role, self.participant_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_serialize_transparently() {
        let id = SessionId::new("attempt-42");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"attempt-42\"");
        let back: SessionId = serde_json::from_str("\"attempt-42\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_context_identity() {
        let a = SignalingContext::new("exam-1", Role::Viewer, "proctor-1");
        let b = SignalingContext::new("exam-1", Role::Viewer, "proctor-1");
        let c = SignalingContext::new("exam-1", Role::Publisher, "proctor-1");

        let set: HashSet<_> = [a.clone(), b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
        assert_eq!(a.to_string(), "exam-1/viewer/proctor-1");
    }
}
