//! Pending contact operations
//!
//! One queued mutation request against the contact API. The queue persists
//! these as a JSON array; the adjacent `type`/`payload` tagging keeps stored
//! entries readable and forward-parseable.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::identity::ChannelType;
use super::mutation::{AttributeMutation, ScopedSubscriptionListMutation, TagGroupsMutation};

/// Email registration options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmailRegistrationOptions {
    /// Commercial opt-in time in epoch millis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commercial_opted_in: Option<i64>,
    /// Transactional opt-in time in epoch millis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transactional_opted_in: Option<i64>,
    #[serde(default)]
    pub double_opt_in: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<serde_json::Value>,
}

/// SMS registration options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmsRegistrationOptions {
    pub sender_id: String,
}

/// Open channel registration options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenChannelRegistrationOptions {
    pub platform_name: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub identifiers: HashMap<String, String>,
}

/// A single pending mutation request against the contact API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContactOperation {
    Identify {
        identifier: String,
    },
    Reset,
    Resolve,
    Update {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tag_group_mutations: Vec<TagGroupsMutation>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attribute_mutations: Vec<AttributeMutation>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        subscription_list_mutations: Vec<ScopedSubscriptionListMutation>,
    },
    RegisterEmail {
        address: String,
        options: EmailRegistrationOptions,
    },
    RegisterSms {
        msisdn: String,
        options: SmsRegistrationOptions,
    },
    RegisterOpenChannel {
        address: String,
        options: OpenChannelRegistrationOptions,
    },
    AssociateChannel {
        channel_id: String,
        channel_type: ChannelType,
    },
}

impl ContactOperation {
    pub fn update_tags(mutations: Vec<TagGroupsMutation>) -> Self {
        ContactOperation::Update {
            tag_group_mutations: mutations,
            attribute_mutations: Vec::new(),
            subscription_list_mutations: Vec::new(),
        }
    }

    pub fn update_attributes(mutations: Vec<AttributeMutation>) -> Self {
        ContactOperation::Update {
            tag_group_mutations: Vec::new(),
            attribute_mutations: mutations,
            subscription_list_mutations: Vec::new(),
        }
    }

    pub fn update_subscription_lists(mutations: Vec<ScopedSubscriptionListMutation>) -> Self {
        ContactOperation::Update {
            tag_group_mutations: Vec::new(),
            attribute_mutations: Vec::new(),
            subscription_list_mutations: mutations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contacts::mutation::Scope;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn test_unit_operations_serialize_without_payload() {
        assert_eq!(
            serde_json::to_value(&ContactOperation::Reset).unwrap(),
            json!({"type": "RESET"})
        );
        assert_eq!(
            serde_json::to_value(&ContactOperation::Resolve).unwrap(),
            json!({"type": "RESOLVE"})
        );
    }

    #[test]
    fn test_identify_round_trip() {
        let operation = ContactOperation::Identify {
            identifier: "some-user".to_string(),
        };
        let value = serde_json::to_value(&operation).unwrap();
        assert_eq!(
            value,
            json!({"type": "IDENTIFY", "payload": {"identifier": "some-user"}})
        );
        assert_eq!(
            serde_json::from_value::<ContactOperation>(value).unwrap(),
            operation
        );
    }

    #[test]
    fn test_update_round_trip() {
        let operation = ContactOperation::update_subscription_lists(vec![
            ScopedSubscriptionListMutation::subscribe("list1", Scope::App, "t1"),
        ]);
        let value = serde_json::to_value(&operation).unwrap();
        assert_eq!(
            serde_json::from_value::<ContactOperation>(value).unwrap(),
            operation
        );
    }

    #[test]
    fn test_register_email_round_trip() {
        let operation = ContactOperation::RegisterEmail {
            address: "user@example.com".to_string(),
            options: EmailRegistrationOptions {
                commercial_opted_in: Some(1_600_000_000_000),
                double_opt_in: true,
                ..Default::default()
            },
        };
        let value = serde_json::to_value(&operation).unwrap();
        assert_eq!(
            serde_json::from_value::<ContactOperation>(value).unwrap(),
            operation
        );
    }

    #[test]
    fn test_queue_array_round_trip() {
        let operations = vec![
            ContactOperation::Resolve,
            ContactOperation::update_tags(vec![TagGroupsMutation::add_tags(
                "group",
                HashSet::from(["a".to_string()]),
            )]),
            ContactOperation::AssociateChannel {
                channel_id: "channel".to_string(),
                channel_type: ChannelType::Sms,
            },
        ];

        let value = serde_json::to_value(&operations).unwrap();
        assert_eq!(
            serde_json::from_value::<Vec<ContactOperation>>(value).unwrap(),
            operations
        );
    }
}
