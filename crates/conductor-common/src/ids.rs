use serde::{Deserialize, Serialize};
use std::fmt;

/// Declares an opaque, prefixed string id type (e.g. `run_…`, `evt_…`).
///
/// Generated ids are `<prefix>_<uuidv4-simple>`; any non-empty string is
/// accepted on deserialize so ids round-trip through storage without the
/// crate re-validating its own output.
macro_rules! prefixed_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            /// Generates a fresh random id with this type's prefix.
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, uuid::Uuid::new_v4().simple()))
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

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl rusqlite::types::FromSql for $name {
            fn column_result(
                value: rusqlite::types::ValueRef<'_>,
            ) -> rusqlite::types::FromSqlResult<Self> {
                String::column_result(value).map(Self)
            }
        }

        impl rusqlite::types::ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
                Ok(rusqlite::types::ToSqlOutput::from(self.0.clone()))
            }
        }
    };
}

prefixed_id!(UserId, "user");
prefixed_id!(ProjectId, "proj");
prefixed_id!(RepoId, "repo");
prefixed_id!(TaskId, "task");
prefixed_id!(RunId, "run");
prefixed_id!(GateEvalId, "ge");
prefixed_id!(OperatorActionId, "oa");
prefixed_id!(OverrideId, "ov");
prefixed_id!(WorktreeId, "wt");
prefixed_id!(EventId, "evt");
prefixed_id!(WebhookDeliveryId, "wd");
prefixed_id!(GithubWriteId, "gw");
prefixed_id!(AgentInvocationId, "ai");
prefixed_id!(PendingInstallationId, "pi");
prefixed_id!(SessionId, "sess");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_id_carries_its_prefix() {
        let id = RunId::new();
        assert!(id.as_str().starts_with("run_"));
    }

    #[test]
    fn ids_round_trip_through_serde_json() {
        let id = EventId::new();
        let json = serde_json::to_string(&id).unwrap();
        let back: EventId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn distinct_ids_are_not_equal() {
        assert_ne!(RunId::new(), RunId::new());
    }
}
