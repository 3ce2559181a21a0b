use serde::{Deserialize, Deserializer};
use std::fmt::{Display, Formatter};

/// Identifies one logical FIX conversation between two counterparties.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Hash)]
pub struct SessionId {
    pub begin_string: String,
    pub sender_comp_id: String,
    pub target_comp_id: String,
    #[serde(default, deserialize_with = "non_empty")]
    pub session_qualifier: Option<String>,
}

fn non_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let qualifier = Option::<String>::deserialize(deserializer)?;
    Ok(qualifier.filter(|qualifier| !qualifier.is_empty()))
}

impl SessionId {
    pub fn new(
        begin_string: impl Into<String>,
        sender_comp_id: impl Into<String>,
        target_comp_id: impl Into<String>,
    ) -> Self {
        Self {
            begin_string: begin_string.into(),
            sender_comp_id: sender_comp_id.into(),
            target_comp_id: target_comp_id.into(),
            session_qualifier: None,
        }
    }

    /// An empty qualifier is the same as none.
    pub fn with_qualifier(mut self, qualifier: impl Into<String>) -> Self {
        let qualifier = qualifier.into();
        self.session_qualifier = (!qualifier.is_empty()).then_some(qualifier);
        self
    }

    /// The qualifier, or an empty string when the session has none.
    pub fn qualifier(&self) -> &str {
        self.session_qualifier.as_deref().unwrap_or_default()
    }

    /// A key naming this session's storage, usable as a file name or table name,
    /// e.g. `FIX.4.4-SENDER-TARGET`.
    ///
    /// Distinct sessions always get distinct keys: parts are joined with `-`, and
    /// every byte outside `[A-Za-z0-9._]` (the separator included) is written as
    /// `%XX`. A qualifier adds a trailing part.
    pub fn storage_key(&self) -> String {
        let mut key = [
            self.begin_string.as_str(),
            self.sender_comp_id.as_str(),
            self.target_comp_id.as_str(),
        ]
        .map(escape)
        .join("-");

        if let Some(qualifier) = &self.session_qualifier {
            key.push('-');
            key.push_str(&escape(qualifier));
        }
        key
    }
}

fn escape(part: &str) -> String {
    let mut escaped = String::with_capacity(part.len());
    for byte in part.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' => escaped.push(char::from(byte)),
            _ => escaped.push_str(&format!("%{:02X}", byte)),
        }
    }
    escaped
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}->{}",
            self.begin_string, self.sender_comp_id, self.target_comp_id
        )?;
        if let Some(qualifier) = &self.session_qualifier {
            write!(f, ":{}", qualifier)?;
        }

        Ok(())
    }
}
