//! Outgoing AMI commands and their wire encoding

use crate::{
    constants::{ACTION_LOGIN, ACTION_STOP, LINE_TERMINATOR},
    error::{BridgeError, BridgeResult},
    event::validate_field,
    headers::AmiField,
};
use indexmap::IndexMap;
use std::fmt::{self, Write};

/// A manager action to be written upstream.
///
/// Encodes as `Action:<name>`, an optional `ActionID:<id>` line, one line per
/// field, and a terminating blank line:
///
/// ```
/// use ami_bridge::AmiCommand;
///
/// let cmd = AmiCommand::new("Status").with_action_id("T1");
/// assert_eq!(cmd.to_wire_format().unwrap(), "Action:Status\r\nActionID:T1\r\n\r\n");
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct AmiCommand {
    action: String,
    action_id: Option<String>,
    fields: IndexMap<String, String>,
}

impl AmiCommand {
    /// Start a command for the given action name.
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            action_id: None,
            fields: IndexMap::new(),
        }
    }

    /// `Action:Login` carrying credentials.
    pub fn login(username: &str, secret: &str) -> Self {
        Self::new(ACTION_LOGIN)
            .field(AmiField::Username.as_str(), username)
            .field(AmiField::Secret.as_str(), secret)
    }

    /// Queue-stop sentinel; never written upstream.
    pub fn stop() -> Self {
        Self::new(ACTION_STOP)
    }

    /// Set the correlation id.
    pub fn with_action_id(mut self, id: impl Into<String>) -> Self {
        self.action_id = Some(id.into());
        self
    }

    /// Add a field (builder style).
    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_field(name, value);
        self
    }

    /// Add or overwrite a field.
    ///
    /// `Action` and `ActionID` are owned by the command itself; fields with
    /// those names are dropped at encoding time.
    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields
            .insert(name.into(), value.into());
    }

    /// Action name.
    pub fn action(&self) -> &str {
        &self.action
    }

    /// Correlation id, if assigned.
    pub fn action_id(&self) -> Option<&str> {
        self.action_id
            .as_deref()
    }

    /// Extra fields in insertion order.
    pub fn fields(&self) -> &IndexMap<String, String> {
        &self.fields
    }

    /// `true` for the dispatcher stop sentinel.
    pub fn is_stop(&self) -> bool {
        self.action == ACTION_STOP
    }

    /// Encode into the wire framing.
    ///
    /// Fails if the action, correlation id, or any field contains a line
    /// break (frame injection) or a field name is empty.
    pub fn to_wire_format(&self) -> BridgeResult<String> {
        if self
            .action
            .trim()
            .is_empty()
        {
            return Err(BridgeError::protocol("action name must not be empty"));
        }
        validate_field(AmiField::Action.as_str(), &self.action)?;

        let mut out = String::new();
        let _ = write!(
            out,
            "{}:{}{}",
            AmiField::Action,
            self.action,
            LINE_TERMINATOR
        );

        if let Some(id) = &self.action_id {
            validate_field(AmiField::ActionId.as_str(), id)?;
            let _ = write!(out, "{}:{}{}", AmiField::ActionId, id, LINE_TERMINATOR);
        }

        for (key, value) in &self.fields {
            if key == AmiField::Action.as_str() || key == AmiField::ActionId.as_str() {
                continue;
            }
            validate_field(key, value)?;
            let _ = write!(out, "{}:{}{}", key, value, LINE_TERMINATOR);
        }

        out.push_str(LINE_TERMINATOR);
        Ok(out)
    }
}

impl fmt::Debug for AmiCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields: Vec<(&str, &str)> = self
            .fields
            .iter()
            .map(|(k, v)| {
                if k.eq_ignore_ascii_case(AmiField::Secret.as_str()) {
                    (k.as_str(), "[REDACTED]")
                } else {
                    (k.as_str(), v.as_str())
                }
            })
            .collect();
        f.debug_struct("AmiCommand")
            .field("action", &self.action)
            .field("action_id", &self.action_id)
            .field("fields", &fields)
            .finish()
    }
}
