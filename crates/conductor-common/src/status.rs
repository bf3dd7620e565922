use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $repr:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $repr),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($repr => Ok(Self::$variant),)+
                    other => Err(format!(concat!("unknown ", stringify!($name), " '{}'"), other)),
                }
            }
        }
    };
}

string_enum!(RepoStatus {
    Active => "active",
    Inactive => "inactive",
    Syncing => "syncing",
    Error => "error",
});

string_enum!(GateKind {
    Human => "human",
    Automatic => "automatic",
});

string_enum!(GateStatus {
    Pending => "pending",
    Passed => "passed",
    Failed => "failed",
});

string_enum!(EventClass {
    Decision => "decision",
    External => "external",
    Agent => "agent",
    Operator => "operator",
    Gate => "gate",
});

string_enum!(WebhookDeliveryStatus {
    Received => "received",
    Processing => "processing",
    Processed => "processed",
    Ignored => "ignored",
    Failed => "failed",
});

string_enum!(GithubWriteStatus {
    Pending => "pending",
    InFlight => "in_flight",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

string_enum!(WorktreeStatus {
    Active => "active",
    Cleaned => "cleaned",
    Orphaned => "orphaned",
});

string_enum!(OverrideScope {
    ThisRun => "this_run",
    ThisTask => "this_task",
    ThisRepo => "this_repo",
    ProjectWide => "project_wide",
});

string_enum!(ActorType {
    Human => "human",
    System => "system",
});

string_enum!(AgentInvocationStatus {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    TimedOut => "timed_out",
});

string_enum!(QueueName {
    Webhooks => "webhooks",
    Runs => "runs",
    Agents => "agents",
    Cleanup => "cleanup",
    GithubWrites => "github_writes",
});

impl QueueName {
    pub const ALL: [QueueName; 5] = [
        QueueName::Webhooks,
        QueueName::Runs,
        QueueName::Agents,
        QueueName::Cleanup,
        QueueName::GithubWrites,
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_enum_round_trips() {
        for s in [
            GateStatus::Pending,
            GateStatus::Passed,
            GateStatus::Failed,
        ] {
            assert_eq!(s.to_string().parse::<GateStatus>().unwrap(), s);
        }
    }

    #[test]
    fn unknown_variant_is_rejected() {
        assert!(GateStatus::from_str("maybe").is_err());
    }

    #[test]
    fn queue_name_all_has_five_entries() {
        assert_eq!(QueueName::ALL.len(), 5);
    }
}
