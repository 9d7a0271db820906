//! Contact identity types

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::mutation::Scope;

/// Type of a channel associated with a contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Email,
    Sms,
    Open,
}

impl ChannelType {
    /// Wire name used as `device_type` in associate requests.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Email => "email",
            ChannelType::Sms => "sms",
            ChannelType::Open => "open",
        }
    }
}

/// A non-push channel associated with the contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociatedChannel {
    pub channel_id: String,
    pub channel_type: ChannelType,
}

/// The last server-resolved identity. Last-write-wins, overwritten atomically
/// on each successful identify/reset/resolve response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactIdentity {
    pub contact_id: String,
    pub is_anonymous: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub named_user_id: Option<String>,
}

impl ContactIdentity {
    pub fn new(contact_id: impl Into<String>, is_anonymous: bool, named_user_id: Option<String>) -> Self {
        Self {
            contact_id: contact_id.into(),
            is_anonymous,
            named_user_id,
        }
    }
}

/// Shadow state accumulated while the identity is anonymous. If the anonymous
/// contact later merges into a named contact, the conflict listener receives
/// this data so the application can decide what to carry over.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContactData {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tag_groups: HashMap<String, HashSet<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub associated_channels: Vec<AssociatedChannel>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub subscription_lists: HashMap<String, HashSet<Scope>>,
}

impl ContactData {
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
            && self.tag_groups.is_empty()
            && self.associated_channels.is_empty()
            && self.subscription_lists.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identity_serde_round_trip() {
        let identity = ContactIdentity::new("some-contact-id", false, Some("named".to_string()));
        let value = serde_json::to_value(&identity).unwrap();
        assert_eq!(
            value,
            json!({"contact_id": "some-contact-id", "is_anonymous": false, "named_user_id": "named"})
        );
        assert_eq!(
            serde_json::from_value::<ContactIdentity>(value).unwrap(),
            identity
        );
    }

    #[test]
    fn test_identity_named_user_optional() {
        let identity: ContactIdentity =
            serde_json::from_value(json!({"contact_id": "id", "is_anonymous": true})).unwrap();
        assert_eq!(identity.named_user_id, None);
    }

    #[test]
    fn test_contact_data_is_empty() {
        let mut data = ContactData::default();
        assert!(data.is_empty());

        data.attributes.insert("name".to_string(), json!("value"));
        assert!(!data.is_empty());
    }

    #[test]
    fn test_channel_type_wire_name() {
        assert_eq!(ChannelType::Open.as_str(), "open");
        assert_eq!(
            serde_json::to_value(ChannelType::Email).unwrap(),
            json!("email")
        );
    }
}
