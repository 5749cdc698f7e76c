//! Provisioning profiles.
//!
//! A `.mobileprovision` is a CMS SignedData blob whose content is an XML
//! plist. The profile is installed verbatim as `embedded.mobileprovision`;
//! the plist supplies the entitlements baked into the main executable.

use chrono::{DateTime, Utc};
use cryptographic_message_syntax::SignedData;
use plist::{Dictionary, Value};

use crate::{Error, Result};

/// An opaque provisioning profile plus the fields read from its payload.
#[derive(Clone)]
pub struct ProvisioningProfile {
    data: Vec<u8>,
    payload: Dictionary,
}

impl std::fmt::Debug for ProvisioningProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisioningProfile")
            .field("name", &self.name())
            .field("uuid", &self.uuid())
            .field("len", &self.data.len())
            .finish()
    }
}

impl ProvisioningProfile {
    /// Parse a profile from its raw bytes.
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        let plist_bytes = match SignedData::parse_ber(&data) {
            Ok(signed) => signed
                .signed_content()
                .map(<[u8]>::to_vec)
                .ok_or_else(|| Error::ProfileGenerationFailed("profile has no content".into()))?,
            Err(_) => find_plist(&data)
                .ok_or_else(|| Error::ProfileGenerationFailed("profile has no plist".into()))?
                .to_vec(),
        };

        let payload = plist::from_bytes::<Value>(&plist_bytes)?
            .into_dictionary()
            .ok_or_else(|| Error::ProfileGenerationFailed("profile payload is not a dictionary".into()))?;
        Ok(Self { data, payload })
    }

    /// Raw bytes, written unchanged into the bundle.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn name(&self) -> Option<&str> {
        self.payload.get("Name").and_then(Value::as_string)
    }

    pub fn uuid(&self) -> Option<&str> {
        self.payload.get("UUID").and_then(Value::as_string)
    }

    pub fn team_id(&self) -> Option<&str> {
        self.payload
            .get("TeamIdentifier")
            .and_then(Value::as_array)
            .and_then(|ids| ids.first())
            .and_then(Value::as_string)
    }

    pub fn expiration(&self) -> Option<DateTime<Utc>> {
        let date = self.payload.get("ExpirationDate")?.as_date()?;
        Some(std::time::SystemTime::from(date).into())
    }

    /// The `Entitlements` dictionary, empty when absent.
    pub fn entitlements(&self) -> Dictionary {
        self.payload
            .get("Entitlements")
            .and_then(Value::as_dictionary)
            .cloned()
            .unwrap_or_default()
    }

    /// Bundle identifier granted by `application-identifier`, without the
    /// team prefix. Wildcard profiles return `None`.
    pub fn bundle_id(&self) -> Option<&str> {
        let app_id = self
            .payload
            .get("Entitlements")
            .and_then(Value::as_dictionary)
            .and_then(|e| e.get("application-identifier"))
            .and_then(Value::as_string)?;
        let (_, bundle_id) = app_id.split_once('.')?;
        (!bundle_id.contains('*')).then_some(bundle_id)
    }
}

fn find_plist(data: &[u8]) -> Option<&[u8]> {
    let start = data.windows(6).position(|w| w == b"<?xml ")?;
    let end = data.windows(8).rposition(|w| w == b"</plist>")? + 8;
    (start < end).then(|| &data[start..end])
}
