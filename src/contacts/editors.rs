//! Fluent editors for contact tag groups, attributes, and subscription lists
//!
//! Editors batch mutations locally; nothing is queued until `apply` is
//! called, and an editor with no surviving mutations queues nothing.

use std::collections::HashSet;

use tracing::warn;

use super::mutation::{AttributeMutation, Scope, ScopedSubscriptionListMutation, TagGroupsMutation};
use super::Contact;

const MAX_ATTRIBUTE_FIELD_LENGTH: usize = 1024;

/// Batches tag group mutations for a contact.
pub struct TagGroupsEditor<'a> {
    contact: &'a Contact,
    mutations: Vec<TagGroupsMutation>,
}

impl<'a> TagGroupsEditor<'a> {
    pub(crate) fn new(contact: &'a Contact) -> Self {
        Self {
            contact,
            mutations: Vec::new(),
        }
    }

    pub fn add_tags<I, S>(mut self, group: impl Into<String>, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tags: HashSet<String> = tags.into_iter().map(Into::into).collect();
        self.mutations.push(TagGroupsMutation::add_tags(group, tags));
        self
    }

    pub fn remove_tags<I, S>(mut self, group: impl Into<String>, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tags: HashSet<String> = tags.into_iter().map(Into::into).collect();
        self.mutations
            .push(TagGroupsMutation::remove_tags(group, tags));
        self
    }

    /// Replaces the group with exactly the given tags. An empty set clears
    /// the group.
    pub fn set_tags<I, S>(mut self, group: impl Into<String>, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tags: HashSet<String> = tags.into_iter().map(Into::into).collect();
        self.mutations.push(TagGroupsMutation::set_tags(group, tags));
        self
    }

    pub async fn apply(self) {
        self.contact.apply_tag_edits(self.mutations).await;
    }
}

/// Batches attribute mutations for a contact.
pub struct AttributesEditor<'a> {
    contact: &'a Contact,
    mutations: Vec<AttributeMutation>,
}

impl<'a> AttributesEditor<'a> {
    pub(crate) fn new(contact: &'a Contact) -> Self {
        Self {
            contact,
            mutations: Vec::new(),
        }
    }

    /// Sets an attribute. Names and string values are limited to 1024
    /// characters; anything longer is dropped with a warning.
    pub fn set_attribute(
        mut self,
        name: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        let name = name.into();
        let value = value.into();
        if !is_valid_attribute_field(&name, Some(&value)) {
            return self;
        }

        let timestamp = self.contact.now_timestamp();
        self.mutations
            .push(AttributeMutation::set(name, value, timestamp));
        self
    }

    pub fn remove_attribute(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !is_valid_attribute_field(&name, None) {
            return self;
        }

        let timestamp = self.contact.now_timestamp();
        self.mutations.push(AttributeMutation::remove(name, timestamp));
        self
    }

    pub async fn apply(self) {
        self.contact.apply_attribute_edits(self.mutations).await;
    }
}

fn is_valid_attribute_field(name: &str, value: Option<&serde_json::Value>) -> bool {
    if name.is_empty() || name.len() > MAX_ATTRIBUTE_FIELD_LENGTH {
        warn!(
            "Ignoring attribute mutation: name must be 1-{} characters",
            MAX_ATTRIBUTE_FIELD_LENGTH
        );
        return false;
    }

    if let Some(serde_json::Value::String(string_value)) = value {
        if string_value.len() > MAX_ATTRIBUTE_FIELD_LENGTH {
            warn!(
                "Ignoring attribute '{}': string values are limited to {} characters",
                name, MAX_ATTRIBUTE_FIELD_LENGTH
            );
            return false;
        }
    }

    true
}

/// Batches scoped subscription list mutations for a contact.
pub struct SubscriptionListEditor<'a> {
    contact: &'a Contact,
    mutations: Vec<ScopedSubscriptionListMutation>,
}

impl<'a> SubscriptionListEditor<'a> {
    pub(crate) fn new(contact: &'a Contact) -> Self {
        Self {
            contact,
            mutations: Vec::new(),
        }
    }

    pub fn subscribe(mut self, list_id: impl Into<String>, scope: Scope) -> Self {
        let timestamp = self.contact.now_timestamp();
        self.mutations
            .push(ScopedSubscriptionListMutation::subscribe(
                list_id, scope, timestamp,
            ));
        self
    }

    pub fn unsubscribe(mut self, list_id: impl Into<String>, scope: Scope) -> Self {
        let timestamp = self.contact.now_timestamp();
        self.mutations
            .push(ScopedSubscriptionListMutation::unsubscribe(
                list_id, scope, timestamp,
            ));
        self
    }

    /// Subscribes or unsubscribes depending on `subscribe`.
    pub fn mutate(self, list_id: impl Into<String>, scope: Scope, subscribe: bool) -> Self {
        if subscribe {
            self.subscribe(list_id, scope)
        } else {
            self.unsubscribe(list_id, scope)
        }
    }

    pub async fn apply(self) {
        self.contact.apply_subscription_edits(self.mutations).await;
    }
}
