//! Contact API client
//!
//! The [`ContactApiClient`] trait is the engine's network boundary; tests
//! substitute it wholesale. [`HttpContactApiClient`] is the production
//! implementation speaking JSON over the device API with basic app
//! credentials.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::clock::iso_timestamp;
use crate::config::RuntimeConfig;

use super::identity::{AssociatedChannel, ChannelType, ContactIdentity};
use super::mutation::{AttributeMutation, Scope, ScopedSubscriptionListMutation, TagGroupsMutation};

const RESOLVE_PATH: &str = "api/contacts/resolve/";
const IDENTIFY_PATH: &str = "api/contacts/identify/";
const RESET_PATH: &str = "api/contacts/reset/";
const UPDATE_PATH: &str = "api/contacts/";
const EMAIL_PATH: &str = "api/channels/restricted/email/";
const SMS_PATH: &str = "api/channels/restricted/sms/";
const OPEN_CHANNEL_PATH: &str = "api/channels/restricted/open/";
const SUBSCRIPTION_LIST_PATH: &str = "api/subscription_lists/contacts/";

/// Request-level failures. All of these are treated as retryable by the
/// engine.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid response body: {0}")]
    InvalidBody(#[from] serde_json::Error),
    #[error("missing response field: {0}")]
    MissingField(&'static str),
}

/// An HTTP status paired with the parsed result, when the call succeeded.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse<T> {
    pub status: u16,
    pub result: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn new(status: u16, result: Option<T>) -> Self {
        Self { status, result }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status)
    }

    pub fn is_too_many_requests(&self) -> bool {
        self.status == 429
    }
}

/// Network boundary for contact operations.
#[async_trait]
pub trait ContactApiClient: Send + Sync {
    async fn resolve(&self, channel_id: &str) -> Result<ApiResponse<ContactIdentity>, RequestError>;

    async fn identify(
        &self,
        named_user_id: &str,
        channel_id: &str,
        contact_id: Option<&str>,
    ) -> Result<ApiResponse<ContactIdentity>, RequestError>;

    async fn reset(&self, channel_id: &str) -> Result<ApiResponse<ContactIdentity>, RequestError>;

    async fn update(
        &self,
        contact_id: &str,
        tag_group_mutations: &[TagGroupsMutation],
        attribute_mutations: &[AttributeMutation],
        subscription_list_mutations: &[ScopedSubscriptionListMutation],
    ) -> Result<ApiResponse<()>, RequestError>;

    async fn register_email(
        &self,
        contact_id: &str,
        address: &str,
        options: &super::operation::EmailRegistrationOptions,
    ) -> Result<ApiResponse<AssociatedChannel>, RequestError>;

    async fn register_sms(
        &self,
        contact_id: &str,
        msisdn: &str,
        options: &super::operation::SmsRegistrationOptions,
    ) -> Result<ApiResponse<AssociatedChannel>, RequestError>;

    async fn register_open_channel(
        &self,
        contact_id: &str,
        address: &str,
        options: &super::operation::OpenChannelRegistrationOptions,
    ) -> Result<ApiResponse<AssociatedChannel>, RequestError>;

    async fn associate_channel(
        &self,
        contact_id: &str,
        channel_id: &str,
        channel_type: ChannelType,
    ) -> Result<ApiResponse<AssociatedChannel>, RequestError>;

    async fn subscription_lists(
        &self,
        contact_id: &str,
    ) -> Result<ApiResponse<HashMap<String, HashSet<Scope>>>, RequestError>;
}

/// Production client over reqwest.
pub struct HttpContactApiClient {
    config: RuntimeConfig,
    client: reqwest::Client,
}

impl HttpContactApiClient {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    async fn post(&self, path: &str, body: Value) -> Result<(u16, Option<Value>), RequestError> {
        let response = self
            .client
            .post(self.config.device_api_url(path))
            .basic_auth(&self.config.app_key, Some(&self.config.app_secret))
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await?;
        Self::read(response).await
    }

    async fn get(&self, path: &str) -> Result<(u16, Option<Value>), RequestError> {
        let response = self
            .client
            .get(self.config.device_api_url(path))
            .basic_auth(&self.config.app_key, Some(&self.config.app_secret))
            .header("Accept", "application/json")
            .send()
            .await?;
        Self::read(response).await
    }

    async fn read(response: reqwest::Response) -> Result<(u16, Option<Value>), RequestError> {
        let status = response.status().as_u16();
        let text = response.text().await?;
        if !(200..300).contains(&status) || text.is_empty() {
            return Ok((status, None));
        }
        Ok((status, Some(serde_json::from_str(&text)?)))
    }

    fn parse_identity(
        body: Option<&Value>,
        is_anonymous: bool,
        named_user_id: Option<&str>,
    ) -> Result<ContactIdentity, RequestError> {
        let contact_id = body
            .and_then(|body| body.get("contact_id"))
            .and_then(Value::as_str)
            .ok_or(RequestError::MissingField("contact_id"))?;

        Ok(ContactIdentity::new(
            contact_id,
            is_anonymous,
            named_user_id.map(str::to_string),
        ))
    }

    fn log_update_warnings(body: Option<&Value>) {
        let Some(body) = body else { return };
        if let Some(warning) = body.get("tag_warnings").and_then(Value::as_str) {
            warn!("Contact update tag warnings: {}", warning);
        }
        if let Some(warning) = body.get("attribute_warnings").and_then(Value::as_str) {
            warn!("Contact update attribute warnings: {}", warning);
        }
    }

    /// Registers a channel and, on success, associates it with the contact.
    async fn register_and_associate(
        &self,
        contact_id: &str,
        path: &str,
        payload: Value,
        channel_type: ChannelType,
    ) -> Result<ApiResponse<AssociatedChannel>, RequestError> {
        let (status, body) = self.post(path, payload).await?;
        if !(200..300).contains(&status) {
            return Ok(ApiResponse::new(status, None));
        }

        let channel_id = body
            .as_ref()
            .and_then(|body| body.get("channel_id"))
            .and_then(Value::as_str)
            .ok_or(RequestError::MissingField("channel_id"))?;

        self.associate_channel(contact_id, channel_id, channel_type)
            .await
    }
}

#[async_trait]
impl ContactApiClient for HttpContactApiClient {
    async fn resolve(&self, channel_id: &str) -> Result<ApiResponse<ContactIdentity>, RequestError> {
        let payload = json!({
            "channel_id": channel_id,
            "device_type": self.config.device_type,
        });

        let (status, body) = self.post(RESOLVE_PATH, payload).await?;
        if !(200..300).contains(&status) {
            return Ok(ApiResponse::new(status, None));
        }

        let is_anonymous = body
            .as_ref()
            .and_then(|body| body.get("is_anonymous"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let identity = Self::parse_identity(body.as_ref(), is_anonymous, None)?;
        Ok(ApiResponse::new(status, Some(identity)))
    }

    async fn identify(
        &self,
        named_user_id: &str,
        channel_id: &str,
        contact_id: Option<&str>,
    ) -> Result<ApiResponse<ContactIdentity>, RequestError> {
        let mut payload = json!({
            "named_user_id": named_user_id,
            "channel_id": channel_id,
            "device_type": self.config.device_type,
        });
        if let Some(contact_id) = contact_id {
            payload["contact_id"] = json!(contact_id);
        }

        let (status, body) = self.post(IDENTIFY_PATH, payload).await?;
        if !(200..300).contains(&status) {
            return Ok(ApiResponse::new(status, None));
        }

        let identity = Self::parse_identity(body.as_ref(), false, Some(named_user_id))?;
        Ok(ApiResponse::new(status, Some(identity)))
    }

    async fn reset(&self, channel_id: &str) -> Result<ApiResponse<ContactIdentity>, RequestError> {
        let payload = json!({
            "channel_id": channel_id,
            "device_type": self.config.device_type,
        });

        let (status, body) = self.post(RESET_PATH, payload).await?;
        if !(200..300).contains(&status) {
            return Ok(ApiResponse::new(status, None));
        }

        let identity = Self::parse_identity(body.as_ref(), true, None)?;
        Ok(ApiResponse::new(status, Some(identity)))
    }

    async fn update(
        &self,
        contact_id: &str,
        tag_group_mutations: &[TagGroupsMutation],
        attribute_mutations: &[AttributeMutation],
        subscription_list_mutations: &[ScopedSubscriptionListMutation],
    ) -> Result<ApiResponse<()>, RequestError> {
        let mut payload = serde_json::Map::new();

        let tags = TagGroupsMutation::collapse(tag_group_mutations.to_vec());
        if !tags.is_empty() {
            // Collapsed mutations merge into one wire object
            let mut tag_payload = serde_json::Map::new();
            for mutation in &tags {
                if let Value::Object(map) = serde_json::to_value(mutation)? {
                    tag_payload.extend(map);
                }
            }
            payload.insert("tags".to_string(), Value::Object(tag_payload));
        }

        let attributes = AttributeMutation::collapse(attribute_mutations.to_vec());
        if !attributes.is_empty() {
            payload.insert("attributes".to_string(), serde_json::to_value(attributes)?);
        }

        let subscriptions =
            ScopedSubscriptionListMutation::collapse(subscription_list_mutations.to_vec());
        if !subscriptions.is_empty() {
            payload.insert(
                "subscription_lists".to_string(),
                serde_json::to_value(subscriptions)?,
            );
        }

        let path = format!("{}{}", UPDATE_PATH, contact_id);
        let (status, body) = self.post(&path, Value::Object(payload)).await?;
        debug!("Contact update response status: {}", status);

        if (200..300).contains(&status) {
            Self::log_update_warnings(body.as_ref());
            Ok(ApiResponse::new(status, Some(())))
        } else {
            Ok(ApiResponse::new(status, None))
        }
    }

    async fn register_email(
        &self,
        contact_id: &str,
        address: &str,
        options: &super::operation::EmailRegistrationOptions,
    ) -> Result<ApiResponse<AssociatedChannel>, RequestError> {
        let mut channel = json!({
            "type": "email",
            "address": address,
        });
        if let Some(millis) = options.commercial_opted_in {
            channel["commercial_opted_in"] = json!(iso_timestamp(millis));
        }
        if let Some(millis) = options.transactional_opted_in {
            channel["transactional_opted_in"] = json!(iso_timestamp(millis));
        }

        let mut payload = json!({
            "channel": channel,
            "opt_in_mode": if options.double_opt_in { "double" } else { "classic" },
        });
        if let Some(properties) = &options.properties {
            payload["properties"] = properties.clone();
        }

        self.register_and_associate(contact_id, EMAIL_PATH, payload, ChannelType::Email)
            .await
    }

    async fn register_sms(
        &self,
        contact_id: &str,
        msisdn: &str,
        options: &super::operation::SmsRegistrationOptions,
    ) -> Result<ApiResponse<AssociatedChannel>, RequestError> {
        let payload = json!({
            "msisdn": msisdn,
            "sender": options.sender_id,
        });

        self.register_and_associate(contact_id, SMS_PATH, payload, ChannelType::Sms)
            .await
    }

    async fn register_open_channel(
        &self,
        contact_id: &str,
        address: &str,
        options: &super::operation::OpenChannelRegistrationOptions,
    ) -> Result<ApiResponse<AssociatedChannel>, RequestError> {
        let payload = json!({
            "channel": {
                "type": "open",
                "opt_in": true,
                "address": address,
                "open": {
                    "open_platform_name": options.platform_name,
                    "identifiers": options.identifiers,
                },
            },
        });

        self.register_and_associate(contact_id, OPEN_CHANNEL_PATH, payload, ChannelType::Open)
            .await
    }

    async fn associate_channel(
        &self,
        contact_id: &str,
        channel_id: &str,
        channel_type: ChannelType,
    ) -> Result<ApiResponse<AssociatedChannel>, RequestError> {
        let payload = json!({
            "associate": [{
                "channel_id": channel_id,
                "device_type": channel_type.as_str(),
            }],
        });

        let path = format!("{}{}", UPDATE_PATH, contact_id);
        let (status, _) = self.post(&path, payload).await?;
        debug!("Associate channel response status: {}", status);

        if (200..300).contains(&status) {
            Ok(ApiResponse::new(
                status,
                Some(AssociatedChannel {
                    channel_id: channel_id.to_string(),
                    channel_type,
                }),
            ))
        } else {
            Ok(ApiResponse::new(status, None))
        }
    }

    async fn subscription_lists(
        &self,
        contact_id: &str,
    ) -> Result<ApiResponse<HashMap<String, HashSet<Scope>>>, RequestError> {
        let path = format!("{}{}", SUBSCRIPTION_LIST_PATH, contact_id);
        let (status, body) = self.get(&path).await?;
        if !(200..300).contains(&status) {
            return Ok(ApiResponse::new(status, None));
        }

        let mut subscriptions: HashMap<String, HashSet<Scope>> = HashMap::new();
        let entries = body
            .as_ref()
            .and_then(|body| body.get("subscription_lists"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for entry in entries {
            let scope = match entry.get("scope").cloned() {
                Some(value) => match serde_json::from_value::<Scope>(value) {
                    Ok(scope) => scope,
                    Err(error) => {
                        warn!("Ignoring subscription entry with unknown scope: {}", error);
                        continue;
                    }
                },
                None => continue,
            };

            let list_ids = entry
                .get("list_ids")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for list_id in list_ids {
                if let Some(list_id) = list_id.as_str() {
                    subscriptions
                        .entry(list_id.to_string())
                        .or_default()
                        .insert(scope);
                }
            }
        }

        Ok(ApiResponse::new(status, Some(subscriptions)))
    }
}
