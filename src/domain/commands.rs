use super::collaborators::DeviceIdentity;
use crate::mqtt::{Broker, Qos};
use crate::security::{NotAuthorized, Principal, COMMAND_SUFFIX};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Remote actions a device understands on its command topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandVerb {
    ReportLocation,
    SetWaypoints,
    ClearWaypoints,
    Status,
    Dump,
    SetConfiguration,
    Restart,
    Action,
}

impl CommandVerb {
    pub const ALL: [CommandVerb; 8] = [
        CommandVerb::ReportLocation,
        CommandVerb::SetWaypoints,
        CommandVerb::ClearWaypoints,
        CommandVerb::Status,
        CommandVerb::Dump,
        CommandVerb::SetConfiguration,
        CommandVerb::Restart,
        CommandVerb::Action,
    ];

    /// Wire name carried in the `action` field.
    pub fn as_str(self) -> &'static str {
        match self {
            CommandVerb::ReportLocation => "reportLocation",
            CommandVerb::SetWaypoints => "setWaypoints",
            CommandVerb::ClearWaypoints => "clearWaypoints",
            CommandVerb::Status => "status",
            CommandVerb::Dump => "dump",
            CommandVerb::SetConfiguration => "setConfiguration",
            CommandVerb::Restart => "restart",
            CommandVerb::Action => "action",
        }
    }
}

impl fmt::Display for CommandVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandVerb {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|verb| verb.as_str() == s)
            .ok_or_else(|| CommandError::InvalidPayload(format!("unknown command verb {s:?}")))
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("invalid command payload: {0}")]
    InvalidPayload(String),
    #[error("invalid command target {0:?}")]
    InvalidTarget(String),
    #[error(transparent)]
    NotAuthorized(#[from] NotAuthorized),
    #[error(transparent)]
    Encode(#[from] serde_json::Error),
}

/// A serialized command bound to its device topic.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub topic: String,
    pub body: Value,
}

impl Command {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CommandError> {
        Ok(serde_json::to_vec(&self.body)?)
    }
}

/// Build `{"_type":"cmd","action":<verb>, ...payload}` for `root/{user}/{device}/cmd`.
pub fn build_command(
    root: &str,
    target: &DeviceIdentity,
    verb: CommandVerb,
    payload: Option<&Value>,
) -> Result<Command, CommandError> {
    for level in [&target.user, &target.device] {
        if crate::pki::validate_identity(level).is_err() {
            return Err(CommandError::InvalidTarget(target.to_string()));
        }
    }
    let mut body = match payload {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(fields)) => fields.clone(),
        Some(other) => {
            return Err(CommandError::InvalidPayload(format!(
                "{verb} payload must be a JSON object, got {other}"
            )))
        }
    };
    match verb {
        CommandVerb::SetWaypoints if !body.get("waypoints").is_some_and(Value::is_array) => {
            return Err(CommandError::InvalidPayload(
                "setWaypoints requires a waypoints array".into(),
            ));
        }
        CommandVerb::SetConfiguration
            if !body.get("configuration").is_some_and(Value::is_object) =>
        {
            return Err(CommandError::InvalidPayload(
                "setConfiguration requires a configuration object".into(),
            ));
        }
        CommandVerb::Action if !body.get("name").is_some_and(Value::is_string) => {
            return Err(CommandError::InvalidPayload("action requires a name".into()));
        }
        _ => {}
    }
    body.insert("_type".into(), Value::String("cmd".into()));
    body.insert("action".into(), Value::String(verb.as_str().into()));
    Ok(Command {
        topic: format!("{root}/{}/{}/{COMMAND_SUFFIX}", target.user, target.device),
        body: Value::Object(body),
    })
}

/// Publishes commands through the broker as the system principal.
#[derive(Clone)]
pub struct CommandPublisher {
    broker: Arc<Broker>,
    root: String,
}

impl CommandPublisher {
    pub fn new(broker: Arc<Broker>, root: impl Into<String>) -> Self {
        Self {
            broker,
            root: root.into(),
        }
    }

    /// Build and publish a command; returns how many sessions it was queued for.
    /// QoS defaults to at-least-once.
    pub async fn build_and_publish_command(
        &self,
        identity: &str,
        device: &str,
        verb: CommandVerb,
        payload: Option<&Value>,
        qos: Option<Qos>,
    ) -> Result<usize, CommandError> {
        let target = DeviceIdentity::new(identity, device);
        let command = build_command(&self.root, &target, verb, payload)?;
        let bytes = command.to_bytes()?;
        let delivered = self
            .broker
            .publish(
                &Principal::System,
                &command.topic,
                Arc::from(bytes),
                qos.unwrap_or(Qos::AtLeastOnce),
                None,
            )
            .await?;
        tracing::info!(device = %target, verb = %verb, delivered, "published command");
        Ok(delivered)
    }
}
