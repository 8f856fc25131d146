//! Event records: one blank-line-delimited block of `key:value` lines

use crate::{
    constants::LINE_TERMINATOR,
    error::{BridgeError, BridgeResult},
    headers::AmiField,
};
use indexmap::IndexMap;
use std::fmt::Write;

/// Reject keys and values that would break line framing.
pub(crate) fn validate_field(key: &str, value: &str) -> BridgeResult<()> {
    if key.is_empty() {
        return Err(BridgeError::protocol("field name must not be empty"));
    }
    if key.contains(':') {
        return Err(BridgeError::protocol(format!(
            "field name {:?} must not contain ':'",
            key
        )));
    }
    for (what, s) in [("name", key), ("value", value)] {
        if s.contains('\n') || s.contains('\r') {
            return Err(BridgeError::protocol(format!(
                "field {} {:?} must not contain newlines",
                what, key
            )));
        }
    }
    Ok(())
}

/// A single record received from (or echoed back to) the upstream system.
///
/// Fields keep their wire order so serialization is deterministic. Keys are
/// unique; setting an existing key overwrites its value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventRecord {
    fields: IndexMap<String, String>,
}

impl EventRecord {
    /// Create an empty record
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a record from `(key, value)` pairs.
    ///
    /// ```
    /// # use ami_bridge::EventRecord;
    /// let record = EventRecord::from_fields([("Event", "FullyBooted"), ("Status", "Ready")]);
    /// assert_eq!(record.field("Status"), Some("Ready"));
    /// ```
    pub fn from_fields<K, V>(fields: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut record = Self::new();
        for (k, v) in fields {
            record.set_field(k, v);
        }
        record
    }

    /// Look up a field by name (case-sensitive).
    pub fn field(&self, name: impl AsRef<str>) -> Option<&str> {
        self.fields
            .get(name.as_ref())
            .map(|s| s.as_str())
    }

    /// All fields in wire order.
    pub fn fields(&self) -> &IndexMap<String, String> {
        &self.fields
    }

    /// Set or overwrite a field.
    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields
            .insert(name.into(), value.into());
    }

    /// Remove a field, returning its value if it existed.
    pub fn remove_field(&mut self, name: &str) -> Option<String> {
        self.fields
            .shift_remove(name)
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields
            .len()
    }

    /// `true` if the record has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields
            .is_empty()
    }

    /// Correlation id, if present and non-empty.
    pub fn action_id(&self) -> Option<&str> {
        self.field(AmiField::ActionId)
            .filter(|id| !id.is_empty())
    }

    /// `Event` field of unsolicited records (e.g. `Newchannel`, `Hangup`).
    pub fn event_name(&self) -> Option<&str> {
        self.field(AmiField::Event)
    }

    /// `Response` field of command replies (`Success`, `Error`, `Follows`).
    pub fn response(&self) -> Option<&str> {
        self.field(AmiField::Response)
    }

    /// `Message` field carried by most command replies.
    pub fn message(&self) -> Option<&str> {
        self.field(AmiField::Message)
    }

    /// `true` for a response announcing that list events follow (`EventList: start`).
    pub fn starts_event_list(&self) -> bool {
        self.field(AmiField::EventList)
            .is_some_and(|v| v.eq_ignore_ascii_case("start"))
    }

    /// `true` for the record closing an event list: `EventList: Complete`,
    /// or an event named `...Complete` such as `StatusComplete`.
    pub fn completes_event_list(&self) -> bool {
        self.field(AmiField::EventList)
            .is_some_and(|v| v.eq_ignore_ascii_case("complete"))
            || self
                .event_name()
                .is_some_and(|e| e.ends_with("Complete"))
    }

    /// Append the record in wire shape (`key:value\r\n` lines and a blank line).
    ///
    /// Nothing is written if any field would break framing.
    pub fn write_wire(&self, out: &mut String) -> BridgeResult<()> {
        for (key, value) in &self.fields {
            validate_field(key, value)?;
        }
        for (key, value) in &self.fields {
            let _ = write!(out, "{}:{}{}", key, value, LINE_TERMINATOR);
        }
        out.push_str(LINE_TERMINATOR);
        Ok(())
    }

    /// Serialize to the wire shape.
    pub fn to_wire_format(&self) -> BridgeResult<String> {
        let mut out = String::new();
        self.write_wire(&mut out)?;
        Ok(out)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EventRecord {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::from_fields(iter)
    }
}
