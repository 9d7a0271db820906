//! Mutation types and collapsing
//!
//! Tag-group, attribute, and subscription-list mutations are immutable
//! values queued inside UPDATE operations. Collapsing reduces a mutation
//! sequence to its net effect so redundant toggles never reach the wire.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Scope of a subscription list mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    App,
    Web,
    Email,
    Sms,
}

/// Subscribe/unsubscribe action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionAction {
    Subscribe,
    Unsubscribe,
}

/// A single scoped subscription list change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopedSubscriptionListMutation {
    pub action: SubscriptionAction,
    pub list_id: String,
    pub scope: Scope,
    pub timestamp: String,
}

impl ScopedSubscriptionListMutation {
    pub fn subscribe(list_id: impl Into<String>, scope: Scope, timestamp: impl Into<String>) -> Self {
        Self {
            action: SubscriptionAction::Subscribe,
            list_id: list_id.into(),
            scope,
            timestamp: timestamp.into(),
        }
    }

    pub fn unsubscribe(list_id: impl Into<String>, scope: Scope, timestamp: impl Into<String>) -> Self {
        Self {
            action: SubscriptionAction::Unsubscribe,
            list_id: list_id.into(),
            scope,
            timestamp: timestamp.into(),
        }
    }

    /// Applies this mutation to a `list_id -> scopes` projection. Lists with
    /// no remaining scopes are removed entirely.
    pub fn apply(&self, subscriptions: &mut HashMap<String, HashSet<Scope>>) {
        match self.action {
            SubscriptionAction::Subscribe => {
                subscriptions
                    .entry(self.list_id.clone())
                    .or_default()
                    .insert(self.scope);
            }
            SubscriptionAction::Unsubscribe => {
                if let Some(scopes) = subscriptions.get_mut(&self.list_id) {
                    scopes.remove(&self.scope);
                    if scopes.is_empty() {
                        subscriptions.remove(&self.list_id);
                    }
                }
            }
        }
    }

    /// Keeps only the last mutation per `(list_id, scope)` key, preserving
    /// the relative order of distinct keys.
    pub fn collapse(mutations: Vec<Self>) -> Vec<Self> {
        let mut seen: HashSet<(String, Scope)> = HashSet::new();
        let mut collapsed: Vec<Self> = Vec::new();

        for mutation in mutations.into_iter().rev() {
            let key = (mutation.list_id.clone(), mutation.scope);
            if seen.insert(key) {
                collapsed.push(mutation);
            }
        }

        collapsed.reverse();
        collapsed
    }
}

/// A channel-level subscription list change, mirrored from app-scoped
/// contact mutations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionListMutation {
    pub action: SubscriptionAction,
    pub list_id: String,
    pub timestamp: String,
}

/// A tag group change: tags added to, removed from, or replacing groups.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagGroupsMutation {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub add: HashMap<String, HashSet<String>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub remove: HashMap<String, HashSet<String>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub set: HashMap<String, HashSet<String>>,
}

impl TagGroupsMutation {
    pub fn add_tags(group: impl Into<String>, tags: HashSet<String>) -> Self {
        Self {
            add: HashMap::from([(group.into(), tags)]),
            ..Default::default()
        }
    }

    pub fn remove_tags(group: impl Into<String>, tags: HashSet<String>) -> Self {
        Self {
            remove: HashMap::from([(group.into(), tags)]),
            ..Default::default()
        }
    }

    pub fn set_tags(group: impl Into<String>, tags: HashSet<String>) -> Self {
        Self {
            set: HashMap::from([(group.into(), tags)]),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty() && self.set.is_empty()
    }

    /// Applies this mutation to a `group -> tags` projection.
    pub fn apply(&self, tag_groups: &mut HashMap<String, HashSet<String>>) {
        for (group, tags) in &self.add {
            tag_groups
                .entry(group.clone())
                .or_default()
                .extend(tags.iter().cloned());
        }

        for (group, tags) in &self.remove {
            if let Some(existing) = tag_groups.get_mut(group) {
                for tag in tags {
                    existing.remove(tag);
                }
            }
        }

        for (group, tags) in &self.set {
            tag_groups.insert(group.clone(), tags.clone());
        }
    }

    /// Collapses a mutation sequence down to at most two mutations: one
    /// carrying set operations, one carrying the surviving adds/removes.
    ///
    /// An add cancels a pending remove of the same tag and vice versa; a set
    /// supersedes any pending add/remove for its group, and later adds or
    /// removes fold directly into a pending set.
    pub fn collapse(mutations: Vec<Self>) -> Vec<Self> {
        let mut add: HashMap<String, HashSet<String>> = HashMap::new();
        let mut remove: HashMap<String, HashSet<String>> = HashMap::new();
        let mut set: HashMap<String, HashSet<String>> = HashMap::new();

        for mutation in mutations {
            for (group, tags) in mutation.add {
                let group = group.trim().to_string();
                if group.is_empty() || tags.is_empty() {
                    continue;
                }

                if let Some(existing_set) = set.get_mut(&group) {
                    existing_set.extend(tags);
                    continue;
                }

                if let Some(existing_remove) = remove.get_mut(&group) {
                    existing_remove.retain(|tag| !tags.contains(tag));
                    if existing_remove.is_empty() {
                        remove.remove(&group);
                    }
                }

                add.entry(group).or_default().extend(tags);
            }

            for (group, tags) in mutation.remove {
                let group = group.trim().to_string();
                if group.is_empty() || tags.is_empty() {
                    continue;
                }

                if let Some(existing_set) = set.get_mut(&group) {
                    existing_set.retain(|tag| !tags.contains(tag));
                    continue;
                }

                if let Some(existing_add) = add.get_mut(&group) {
                    existing_add.retain(|tag| !tags.contains(tag));
                    if existing_add.is_empty() {
                        add.remove(&group);
                    }
                }

                remove.entry(group).or_default().extend(tags);
            }

            for (group, tags) in mutation.set {
                let group = group.trim().to_string();
                if group.is_empty() {
                    continue;
                }

                set.insert(group.clone(), tags);
                add.remove(&group);
                remove.remove(&group);
            }
        }

        let mut collapsed = Vec::new();

        // Sets must stay a separate mutation on the wire
        if !set.is_empty() {
            collapsed.push(TagGroupsMutation {
                set,
                ..Default::default()
            });
        }

        if !add.is_empty() || !remove.is_empty() {
            collapsed.push(TagGroupsMutation {
                add,
                remove,
                ..Default::default()
            });
        }

        collapsed
    }
}

/// Attribute set/remove action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeAction {
    Set,
    Remove,
}

/// A single attribute change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeMutation {
    pub action: AttributeAction,
    #[serde(rename = "key")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    pub timestamp: String,
}

impl AttributeMutation {
    pub fn set(name: impl Into<String>, value: serde_json::Value, timestamp: impl Into<String>) -> Self {
        Self {
            action: AttributeAction::Set,
            name: name.into(),
            value: Some(value),
            timestamp: timestamp.into(),
        }
    }

    pub fn remove(name: impl Into<String>, timestamp: impl Into<String>) -> Self {
        Self {
            action: AttributeAction::Remove,
            name: name.into(),
            value: None,
            timestamp: timestamp.into(),
        }
    }

    /// Keeps only the last mutation per attribute name, preserving the
    /// relative order of distinct names.
    pub fn collapse(mutations: Vec<Self>) -> Vec<Self> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut collapsed: Vec<Self> = Vec::new();

        for mutation in mutations.into_iter().rev() {
            if seen.insert(mutation.name.clone()) {
                collapsed.push(mutation);
            }
        }

        collapsed.reverse();
        collapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tags(values: &[&str]) -> HashSet<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn test_subscription_collapse_keeps_last_per_key() {
        let mutations = vec![
            ScopedSubscriptionListMutation::subscribe("list1", Scope::App, "t1"),
            ScopedSubscriptionListMutation::unsubscribe("list1", Scope::App, "t2"),
            ScopedSubscriptionListMutation::subscribe("list2", Scope::App, "t3"),
            ScopedSubscriptionListMutation::subscribe("list1", Scope::App, "t4"),
        ];

        let collapsed = ScopedSubscriptionListMutation::collapse(mutations);
        assert_eq!(
            collapsed,
            vec![
                ScopedSubscriptionListMutation::subscribe("list2", Scope::App, "t3"),
                ScopedSubscriptionListMutation::subscribe("list1", Scope::App, "t4"),
            ]
        );
    }

    #[test]
    fn test_subscription_collapse_distinct_scopes_kept() {
        let mutations = vec![
            ScopedSubscriptionListMutation::subscribe("list1", Scope::App, "t1"),
            ScopedSubscriptionListMutation::subscribe("list1", Scope::Email, "t2"),
        ];
        assert_eq!(
            ScopedSubscriptionListMutation::collapse(mutations.clone()),
            mutations
        );
    }

    #[test]
    fn test_subscription_apply_removes_empty_lists() {
        let mut subscriptions = HashMap::new();
        ScopedSubscriptionListMutation::subscribe("list1", Scope::App, "t1").apply(&mut subscriptions);
        assert_eq!(
            subscriptions.get("list1"),
            Some(&HashSet::from([Scope::App]))
        );

        ScopedSubscriptionListMutation::unsubscribe("list1", Scope::App, "t2").apply(&mut subscriptions);
        assert!(subscriptions.is_empty());
    }

    #[test]
    fn test_tag_collapse_add_then_remove() {
        let collapsed = TagGroupsMutation::collapse(vec![
            TagGroupsMutation::add_tags("group", tags(&["a", "b"])),
            TagGroupsMutation::remove_tags("group", tags(&["b"])),
        ]);

        assert_eq!(
            collapsed,
            vec![TagGroupsMutation {
                add: HashMap::from([("group".to_string(), tags(&["a"]))]),
                ..Default::default()
            }]
        );
    }

    #[test]
    fn test_tag_collapse_set_supersedes() {
        let collapsed = TagGroupsMutation::collapse(vec![
            TagGroupsMutation::add_tags("group", tags(&["a"])),
            TagGroupsMutation::set_tags("group", tags(&["c"])),
            TagGroupsMutation::add_tags("group", tags(&["d"])),
        ]);

        assert_eq!(
            collapsed,
            vec![TagGroupsMutation {
                set: HashMap::from([("group".to_string(), tags(&["c", "d"]))]),
                ..Default::default()
            }]
        );
    }

    #[test]
    fn test_tag_collapse_drops_empty_groups() {
        let collapsed = TagGroupsMutation::collapse(vec![
            TagGroupsMutation::add_tags("  ", tags(&["a"])),
            TagGroupsMutation::add_tags("group", HashSet::new()),
        ]);
        assert!(collapsed.is_empty());
    }

    #[test]
    fn test_tag_apply() {
        let mut groups = HashMap::new();
        TagGroupsMutation::add_tags("group", tags(&["a", "b"])).apply(&mut groups);
        TagGroupsMutation::remove_tags("group", tags(&["a"])).apply(&mut groups);
        TagGroupsMutation::set_tags("other", tags(&["c"])).apply(&mut groups);

        assert_eq!(groups.get("group"), Some(&tags(&["b"])));
        assert_eq!(groups.get("other"), Some(&tags(&["c"])));
    }

    #[test]
    fn test_attribute_collapse_keeps_last_per_name() {
        let collapsed = AttributeMutation::collapse(vec![
            AttributeMutation::set("name", serde_json::json!("first"), "t1"),
            AttributeMutation::set("other", serde_json::json!(1), "t2"),
            AttributeMutation::remove("name", "t3"),
        ]);

        assert_eq!(
            collapsed,
            vec![
                AttributeMutation::set("other", serde_json::json!(1), "t2"),
                AttributeMutation::remove("name", "t3"),
            ]
        );
    }

    #[test]
    fn test_attribute_serde_uses_key_field() {
        let mutation = AttributeMutation::set("nickname", serde_json::json!("bob"), "t1");
        let value = serde_json::to_value(&mutation).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "action": "set",
                "key": "nickname",
                "value": "bob",
                "timestamp": "t1"
            })
        );
    }

    #[test]
    fn test_tag_mutation_serde_skips_empty() {
        let mutation = TagGroupsMutation::add_tags("group", tags(&["a"]));
        let value = serde_json::to_value(&mutation).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"add": {"group": ["a"]}})
        );
    }
}
