//! Identification payload carried by `Auth` frames.
//!
//! The client's first frame after (optional) TLS setup identifies it as
//! UTF-8 `name|guid|user_domain|os_version` - exactly four fields.

use crate::errors::{ProtocolError, Result};

/// Identity fields exchanged at session start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPayload {
    /// Human-readable client name.
    pub name: String,
    /// Peer-chosen stable identifier.
    pub guid: String,
    /// Informational user/domain string.
    pub user_domain: String,
    /// Informational OS description.
    pub os_version: String,
}

impl AuthPayload {
    /// Serialize to the pipe-separated wire form.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::MalformedAuth`] if any field contains the `|`
    /// separator; there is no escaping on the wire.
    pub fn encode(&self) -> Result<Vec<u8>> {
        for (field, value) in [
            ("name", &self.name),
            ("guid", &self.guid),
            ("user_domain", &self.user_domain),
            ("os_version", &self.os_version),
        ] {
            if value.contains('|') {
                return Err(ProtocolError::MalformedAuth(format!(
                    "{field} may not contain '|'"
                )));
            }
        }
        Ok(format!("{}|{}|{}|{}", self.name, self.guid, self.user_domain, self.os_version)
            .into_bytes())
    }

    /// Parse the pipe-separated wire form.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::MalformedAuth`] if the payload is not UTF-8 or does
    /// not split into exactly four fields.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| ProtocolError::MalformedAuth("payload is not valid UTF-8".into()))?;

        let mut fields = text.split('|');
        let (Some(name), Some(guid), Some(user_domain), Some(os_version), None) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            return Err(ProtocolError::MalformedAuth(format!(
                "expected 4 fields, got {}",
                text.split('|').count()
            )));
        };

        Ok(Self {
            name: name.to_owned(),
            guid: guid.to_owned(),
            user_domain: user_domain.to_owned(),
            os_version: os_version.to_owned(),
        })
    }
}
