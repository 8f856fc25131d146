//! Typed field names for AMI commands and event records.

/// Error returned when parsing an unrecognized field name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseAmiFieldError(pub String);

impl std::fmt::Display for ParseAmiFieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown AMI field: {}", self.0)
    }
}

impl std::error::Error for ParseAmiFieldError {}

define_field_enum! {
    error_type: ParseAmiFieldError,
    /// Well-known field names used by the Asterisk Manager Interface.
    ///
    /// Records carry arbitrary fields; these are the ones the bridge itself
    /// reads or writes. Use with [`EventRecord::field()`](crate::EventRecord::field).
    pub enum AmiField {
        Action => "Action",
        ActionId => "ActionID",
        Response => "Response",
        Event => "Event",
        Message => "Message",
        EventList => "EventList",
        Username => "Username",
        Secret => "Secret",
        Privilege => "Privilege",
        Uniqueid => "Uniqueid",
        Channel => "Channel",
    }
}
