use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Closed,
    Failed,
    Offline,
}

impl ConnectionState {
    /// Indicator colour shown next to every user of the connection.
    pub fn fill(&self) -> StatusFill {
        match self {
            ConnectionState::Connecting => StatusFill::Orange,
            ConnectionState::Connected => StatusFill::Green,
            ConnectionState::Closed | ConnectionState::Failed | ConnectionState::Offline => {
                StatusFill::Red
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StatusFill {
    Orange,
    Green,
    Red,
}

/// Sent to every registered user on each state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StatusUpdate {
    pub state: ConnectionState,
    pub fill: StatusFill,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}

impl StatusUpdate {
    pub fn new(state: ConnectionState, message: Option<String>) -> Self {
        Self {
            state,
            fill: state.fill(),
            text: state.to_string(),
            message,
            at: Utc::now(),
        }
    }
}

/// Something that depends on a connection and wants its status.
///
/// Connections only keep weak references to users; a dropped user simply
/// stops receiving updates.
pub trait ConnectionUser: Send + Sync {
    fn id(&self) -> &str;
    fn status(&self, update: &StatusUpdate);
}
