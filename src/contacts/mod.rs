//! Contact engine
//!
//! A contact is distinct from the device channel and represents a "user" of
//! the application. Contacts may be named and have additional channels
//! associated with them.
//!
//! ## Architecture
//!
//! Public mutators are fire-and-forget: they append a [`ContactOperation`]
//! to a persisted FIFO queue and dispatch a background job through the
//! [`JobDispatcher`](crate::jobs::JobDispatcher). The job worker calls
//! [`Contact::perform_next_operation`], which selects the next runnable
//! operation (skipping satisfied ones and merging consecutive updates),
//! executes it against the [`ContactApiClient`](api::ContactApiClient), and
//! reconciles the locally cached identity with the response.
//!
//! ## Key invariants
//!
//! - The queue is only ever read-modified-written as a whole, under a single
//!   lock, so concurrent producers never lose writes.
//! - The selected operation is persisted back at the queue head before it
//!   executes; a crash between selection and completion re-runs it.
//! - Listeners fire only after a successful response has been processed.

pub mod api;
pub mod editors;
pub mod identity;
pub mod mutation;
pub mod operation;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, warn};

use crate::channel::ChannelProvider;
use crate::clock::{iso_timestamp, CachedValue, Clock};
use crate::error::OperationError;
use crate::jobs::{ConflictStrategy, JobDispatcher, JobInfo, JobResult};
use crate::privacy::{Feature, PrivacyManager};
use crate::store::PreferenceStore;

use api::{ApiResponse, ContactApiClient};
use editors::{AttributesEditor, SubscriptionListEditor, TagGroupsEditor};
use identity::{AssociatedChannel, ChannelType, ContactData, ContactIdentity};
use mutation::{
    AttributeMutation, Scope, ScopedSubscriptionListMutation, SubscriptionListMutation,
    TagGroupsMutation,
};
use operation::{
    ContactOperation, EmailRegistrationOptions, OpenChannelRegistrationOptions,
    SmsRegistrationOptions,
};

/// Job action for contact updates.
pub const ACTION_UPDATE_CONTACT: &str = "ACTION_UPDATE_CONTACT";

/// Rate limit key for identify/reset/resolve operations.
pub const IDENTITY_RATE_LIMIT: &str = "contact.identity";

/// Rate limit key for contact update jobs.
pub const UPDATE_RATE_LIMIT: &str = "contact.update";

const OPERATIONS_KEY: &str = "contacts.operations";
const LAST_CONTACT_IDENTITY_KEY: &str = "contacts.last_identity";
const LAST_RESOLVED_DATE_KEY: &str = "contacts.last_resolved_date";
const ANON_CONTACT_DATA_KEY: &str = "contacts.anonymous_data";

const SUBSCRIPTION_CACHE_LIFETIME_MS: i64 = 10 * 60 * 1000;
const SUBSCRIPTION_LOCAL_HISTORY_LIFETIME_MS: i64 = 10 * 60 * 1000;
const FOREGROUND_RESOLVE_INTERVAL_MS: i64 = 24 * 60 * 60 * 1000;

const MAX_NAMED_USER_ID_LENGTH: usize = 128;

/// Notified when an anonymous contact with pending data is about to merge
/// into a named contact.
pub trait ContactConflictListener: Send + Sync {
    fn on_conflict(&self, anonymous_data: ContactData, named_user_id: Option<String>);
}

/// Notified after the resolved contact changes.
pub trait ContactChangeListener: Send + Sync {
    fn on_contact_changed(&self);
}

/// Notified after attribute mutations upload successfully.
pub trait AttributeListener: Send + Sync {
    fn on_attribute_mutations_uploaded(&self, mutations: &[AttributeMutation]);
}

/// Notified after tag group mutations upload successfully.
pub trait TagGroupListener: Send + Sync {
    fn on_tag_group_mutations_uploaded(&self, mutations: &[TagGroupsMutation]);
}

/// The contact engine.
pub struct Contact {
    store: Arc<dyn PreferenceStore>,
    api: Arc<dyn ContactApiClient>,
    channel: Arc<dyn ChannelProvider>,
    privacy: Arc<PrivacyManager>,
    dispatcher: Arc<dyn JobDispatcher>,
    clock: Arc<dyn Clock>,

    /// Serializes whole-queue read-modify-write cycles.
    queue_lock: tokio::sync::Mutex<()>,
    /// Serializes operation execution and subscription resolution.
    worker_lock: tokio::sync::Mutex<()>,

    is_contact_id_refreshed: AtomicBool,
    subscription_cache: CachedValue<HashMap<String, HashSet<Scope>>>,
    local_history: Mutex<Vec<CachedValue<ScopedSubscriptionListMutation>>>,

    conflict_listener: Mutex<Option<Arc<dyn ContactConflictListener>>>,
    attribute_listeners: Mutex<Vec<Arc<dyn AttributeListener>>>,
    tag_group_listeners: Mutex<Vec<Arc<dyn TagGroupListener>>>,
    contact_change_listeners: Mutex<Vec<Arc<dyn ContactChangeListener>>>,
}

impl Contact {
    pub fn new(
        store: Arc<dyn PreferenceStore>,
        api: Arc<dyn ContactApiClient>,
        channel: Arc<dyn ChannelProvider>,
        privacy: Arc<PrivacyManager>,
        dispatcher: Arc<dyn JobDispatcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            api,
            channel,
            privacy,
            dispatcher,
            clock: clock.clone(),
            queue_lock: tokio::sync::Mutex::new(()),
            worker_lock: tokio::sync::Mutex::new(()),
            is_contact_id_refreshed: AtomicBool::new(false),
            subscription_cache: CachedValue::new(clock),
            local_history: Mutex::new(Vec::new()),
            conflict_listener: Mutex::new(None),
            attribute_listeners: Mutex::new(Vec::new()),
            tag_group_listeners: Mutex::new(Vec::new()),
            contact_change_listeners: Mutex::new(Vec::new()),
        }
    }

    /// Registers rate limits, reacts to the current privacy state, and kicks
    /// the queue in case operations survived a restart.
    pub async fn init(&self) {
        self.dispatcher
            .set_rate_limit(IDENTITY_RATE_LIMIT, 1, Duration::from_secs(5));
        self.dispatcher
            .set_rate_limit(UPDATE_RATE_LIMIT, 1, Duration::from_millis(500));

        self.notify_privacy_changed().await;
        self.dispatch_update_job(ConflictStrategy::Keep).await;

        let pending = self.pending_subscription_updates().await;
        self.notify_channel_subscription_mutations(&pending);
    }

    /// Associates the contact with the given external identifier
    /// (1-128 characters).
    pub async fn identify(&self, external_id: &str) {
        if !self.privacy.is_enabled(Feature::CONTACTS) {
            debug!("Contacts are disabled, ignoring contact identify");
            return;
        }

        if external_id.is_empty() || external_id.len() > MAX_NAMED_USER_ID_LENGTH {
            error!("Ignoring contact identify: identifier must be 1-128 characters");
            return;
        }

        self.add_operations(vec![ContactOperation::Identify {
            identifier: external_id.to_string(),
        }])
        .await;
        self.dispatch_update_job(ConflictStrategy::Keep).await;
    }

    /// Disassociates the channel from its current contact and creates a new
    /// anonymous contact.
    pub async fn reset(&self) {
        if !self.privacy.is_enabled(Feature::CONTACTS) {
            debug!("Contacts are disabled, ignoring contact reset");
            return;
        }

        self.add_operations(vec![ContactOperation::Reset]).await;
        self.dispatch_update_job(ConflictStrategy::Keep).await;
    }

    /// Forces re-resolution of the contact identity against the server.
    pub async fn resolve(&self) {
        if !self.privacy.is_enabled(Feature::CONTACTS) {
            debug!("Contacts are disabled, ignoring contact resolve");
            return;
        }

        self.is_contact_id_refreshed.store(false, Ordering::SeqCst);
        self.add_operations(vec![ContactOperation::Resolve]).await;
        self.dispatch_update_job(ConflictStrategy::Keep).await;
    }

    /// Edits the tag groups associated with this contact.
    pub fn edit_tag_groups(&self) -> TagGroupsEditor<'_> {
        TagGroupsEditor::new(self)
    }

    /// Edits the attributes associated with this contact.
    pub fn edit_attributes(&self) -> AttributesEditor<'_> {
        AttributesEditor::new(self)
    }

    /// Edits the subscription lists associated with this contact.
    pub fn edit_subscription_lists(&self) -> SubscriptionListEditor<'_> {
        SubscriptionListEditor::new(self)
    }

    /// Registers an email channel and associates it with the contact.
    pub async fn register_email(&self, address: &str, options: EmailRegistrationOptions) {
        if !self.privacy.is_enabled(Feature::CONTACTS) {
            warn!("Ignoring email registration while contacts are disabled");
            return;
        }

        self.add_operations(vec![
            ContactOperation::Resolve,
            ContactOperation::RegisterEmail {
                address: address.to_string(),
                options,
            },
        ])
        .await;
        self.dispatch_update_job(ConflictStrategy::Keep).await;
    }

    /// Registers an SMS channel and associates it with the contact.
    pub async fn register_sms(&self, msisdn: &str, options: SmsRegistrationOptions) {
        if !self.privacy.is_enabled(Feature::CONTACTS) {
            warn!("Ignoring SMS registration while contacts are disabled");
            return;
        }

        self.add_operations(vec![
            ContactOperation::Resolve,
            ContactOperation::RegisterSms {
                msisdn: msisdn.to_string(),
                options,
            },
        ])
        .await;
        self.dispatch_update_job(ConflictStrategy::Keep).await;
    }

    /// Registers an open channel and associates it with the contact.
    pub async fn register_open_channel(
        &self,
        address: &str,
        options: OpenChannelRegistrationOptions,
    ) {
        if !self.privacy.is_enabled(Feature::CONTACTS) {
            warn!("Ignoring open channel registration while contacts are disabled");
            return;
        }

        self.add_operations(vec![
            ContactOperation::Resolve,
            ContactOperation::RegisterOpenChannel {
                address: address.to_string(),
                options,
            },
        ])
        .await;
        self.dispatch_update_job(ConflictStrategy::Keep).await;
    }

    /// Associates an existing channel with the contact.
    pub async fn associate_channel(&self, channel_id: &str, channel_type: ChannelType) {
        if !self.privacy.is_enabled(Feature::CONTACTS) {
            warn!("Ignoring associate channel request while contacts are disabled");
            return;
        }

        self.add_operations(vec![
            ContactOperation::Resolve,
            ContactOperation::AssociateChannel {
                channel_id: channel_id.to_string(),
                channel_type,
            },
        ])
        .await;
        self.dispatch_update_job(ConflictStrategy::Keep).await;
    }

    /// The named user id, taking pending identify operations into account.
    pub async fn named_user_id(&self) -> Option<String> {
        let _guard = self.queue_lock.lock().await;
        let operations = self.read_operations().await;
        for operation in operations.iter().rev() {
            if let ContactOperation::Identify { identifier } = operation {
                return Some(identifier.clone());
            }
        }
        self.last_contact_identity()
            .await
            .and_then(|identity| identity.named_user_id)
    }

    pub fn set_contact_conflict_listener(&self, listener: Arc<dyn ContactConflictListener>) {
        *self.conflict_listener.lock().unwrap() = Some(listener);
    }

    pub fn add_contact_change_listener(&self, listener: Arc<dyn ContactChangeListener>) {
        self.contact_change_listeners.lock().unwrap().push(listener);
    }

    pub fn add_attribute_listener(&self, listener: Arc<dyn AttributeListener>) {
        self.attribute_listeners.lock().unwrap().push(listener);
    }

    pub fn add_tag_group_listener(&self, listener: Arc<dyn TagGroupListener>) {
        self.tag_group_listeners.lock().unwrap().push(listener);
    }

    /// Foreground lifecycle hook: re-resolves the identity when the last
    /// successful resolve is more than 24 hours old.
    pub async fn notify_foreground(&self) {
        let last_resolved = self.last_resolved_date().await;
        if self.clock.now_millis() >= last_resolved + FOREGROUND_RESOLVE_INTERVAL_MS {
            self.resolve().await;
        }
    }

    /// Channel lifecycle hook: resolves the contact once the device channel
    /// exists, which also unblocks any deferred queue processing.
    pub async fn notify_channel_created(&self) {
        if self.privacy.is_enabled(Feature::CONTACTS) {
            self.resolve().await;
        }
    }

    /// Privacy lifecycle hook. Disabling contacts resets any named or
    /// data-bearing identity; disabling tags/attributes drops cached
    /// subscription state.
    pub async fn notify_privacy_changed(&self) {
        if !self.privacy.is_enabled(Feature::TAGS_AND_ATTRIBUTES)
            || !self.privacy.is_enabled(Feature::CONTACTS)
        {
            self.subscription_cache.invalidate();
            self.local_history.lock().unwrap().clear();
        }

        if !self.privacy.is_enabled(Feature::CONTACTS) {
            let Some(identity) = self.last_contact_identity().await else {
                return;
            };

            if !identity.is_anonymous || self.anon_contact_data().await.is_some() {
                self.add_operations(vec![ContactOperation::Reset]).await;
                self.dispatch_update_job(ConflictStrategy::Keep).await;
            }
        }
    }

    /// Entry point for the embedding scheduler's worker loop.
    pub async fn on_perform_job(&self, job: &JobInfo) -> JobResult {
        if job.action == ACTION_UPDATE_CONTACT {
            self.perform_next_operation().await
        } else {
            JobResult::Success
        }
    }

    /// Selects and executes the next runnable operation. Returns
    /// [`JobResult::Retry`] when the operation should run again later.
    pub async fn perform_next_operation(&self) -> JobResult {
        let _worker = self.worker_lock.lock().await;

        let Some(channel_id) = self.channel.channel_id() else {
            debug!("The channel ID does not exist. Will retry when the channel is available");
            return JobResult::Success;
        };

        let Some(operation) = self.prepare_next_operation().await else {
            return JobResult::Success;
        };

        match self.perform_operation(operation.clone(), &channel_id).await {
            Ok(status) if is_retryable_status(status) => JobResult::Retry,
            Ok(status) => {
                debug!("Operation {:?} finished with status {}", operation, status);
                self.remove_first_operation().await;
                self.dispatch_update_job(ConflictStrategy::Replace).await;
                JobResult::Success
            }
            Err(OperationError::Request(request_error)) => {
                debug!("Failed to update operation: {}, will retry", request_error);
                JobResult::Retry
            }
            Err(state_error @ OperationError::MissingIdentity) => {
                error!(
                    "Unable to process operation {:?}, skipping: {}",
                    operation, state_error
                );
                self.remove_first_operation().await;
                self.dispatch_update_job(ConflictStrategy::Replace).await;
                JobResult::Success
            }
        }
    }

    /// The current subscription lists, optionally projecting pending queued
    /// mutations on top of the server state.
    pub async fn subscription_lists(
        &self,
        include_pending_updates: bool,
    ) -> Option<HashMap<String, HashSet<Scope>>> {
        if !self
            .privacy
            .is_enabled(Feature::CONTACTS | Feature::TAGS_AND_ATTRIBUTES)
        {
            return None;
        }

        let contact_id = self.current_contact_id().await?;

        // Shares the worker lock with operation execution so pending
        // mutations cannot move to local history mid-read.
        let _worker = self.worker_lock.lock().await;

        let mut subscriptions = match self.subscription_cache.get() {
            Some(cached) => cached,
            None => {
                let fetched = self.fetch_subscription_lists(&contact_id).await?;
                self.subscription_cache
                    .set(fetched.clone(), SUBSCRIPTION_CACHE_LIFETIME_MS);
                fetched
            }
        };

        self.apply_local_history(&mut subscriptions);

        if include_pending_updates {
            for mutation in self.pending_subscription_updates().await {
                mutation.apply(&mut subscriptions);
            }
        }

        Some(subscriptions)
    }

    /// Pending tag mutations, collapsed across queued updates.
    pub async fn pending_tag_updates(&self) -> Vec<TagGroupsMutation> {
        let _guard = self.queue_lock.lock().await;
        let mut mutations = Vec::new();
        for operation in self.read_operations().await {
            if let ContactOperation::Update {
                tag_group_mutations,
                ..
            } = operation
            {
                mutations.extend(tag_group_mutations);
            }
        }
        TagGroupsMutation::collapse(mutations)
    }

    /// Pending attribute mutations, collapsed across queued updates.
    pub async fn pending_attribute_updates(&self) -> Vec<AttributeMutation> {
        let _guard = self.queue_lock.lock().await;
        let mut mutations = Vec::new();
        for operation in self.read_operations().await {
            if let ContactOperation::Update {
                attribute_mutations,
                ..
            } = operation
            {
                mutations.extend(attribute_mutations);
            }
        }
        AttributeMutation::collapse(mutations)
    }

    /// Pending subscription mutations, collapsed across queued updates.
    pub async fn pending_subscription_updates(&self) -> Vec<ScopedSubscriptionListMutation> {
        let _guard = self.queue_lock.lock().await;
        let mut mutations = Vec::new();
        for operation in self.read_operations().await {
            if let ContactOperation::Update {
                subscription_list_mutations,
                ..
            } = operation
            {
                mutations.extend(subscription_list_mutations);
            }
        }
        ScopedSubscriptionListMutation::collapse(mutations)
    }

    // Editor plumbing

    pub(crate) fn now_timestamp(&self) -> String {
        iso_timestamp(self.clock.now_millis())
    }

    pub(crate) async fn apply_tag_edits(&self, mutations: Vec<TagGroupsMutation>) {
        if !self
            .privacy
            .is_enabled(Feature::CONTACTS | Feature::TAGS_AND_ATTRIBUTES)
        {
            warn!("Ignoring tag edits while contacts and/or tags and attributes are disabled");
            return;
        }

        let collapsed = TagGroupsMutation::collapse(mutations);
        if collapsed.is_empty() {
            return;
        }

        self.add_operations(vec![
            ContactOperation::Resolve,
            ContactOperation::update_tags(collapsed),
        ])
        .await;
        self.dispatch_update_job(ConflictStrategy::Keep).await;
    }

    pub(crate) async fn apply_attribute_edits(&self, mutations: Vec<AttributeMutation>) {
        if !self
            .privacy
            .is_enabled(Feature::CONTACTS | Feature::TAGS_AND_ATTRIBUTES)
        {
            warn!("Ignoring attribute edits while contacts and/or tags and attributes are disabled");
            return;
        }

        let collapsed = AttributeMutation::collapse(mutations);
        if collapsed.is_empty() {
            return;
        }

        self.add_operations(vec![
            ContactOperation::Resolve,
            ContactOperation::update_attributes(collapsed),
        ])
        .await;
        self.dispatch_update_job(ConflictStrategy::Keep).await;
    }

    pub(crate) async fn apply_subscription_edits(
        &self,
        mutations: Vec<ScopedSubscriptionListMutation>,
    ) {
        if !self
            .privacy
            .is_enabled(Feature::CONTACTS | Feature::TAGS_AND_ATTRIBUTES)
        {
            warn!(
                "Ignoring subscription list edits while contacts and/or tags and attributes are disabled"
            );
            return;
        }

        let collapsed = ScopedSubscriptionListMutation::collapse(mutations);
        if collapsed.is_empty() {
            return;
        }

        // App-scoped changes are understood without identity resolution, so
        // mirror them to the channel immediately.
        self.notify_channel_subscription_mutations(&collapsed);

        self.add_operations(vec![
            ContactOperation::Resolve,
            ContactOperation::update_subscription_lists(collapsed),
        ])
        .await;
        self.dispatch_update_job(ConflictStrategy::Keep).await;
    }

    // Queue management

    async fn add_operations(&self, new_operations: Vec<ContactOperation>) {
        let _guard = self.queue_lock.lock().await;
        let mut operations = self.read_operations().await;
        operations.extend(new_operations);
        self.write_operations(operations).await;
    }

    async fn remove_first_operation(&self) {
        let _guard = self.queue_lock.lock().await;
        let mut operations = self.read_operations().await;
        if !operations.is_empty() {
            operations.remove(0);
            self.write_operations(operations).await;
        }
    }

    async fn read_operations(&self) -> Vec<ContactOperation> {
        let value = match self.store.get(OPERATIONS_KEY).await {
            Ok(value) => value,
            Err(store_error) => {
                error!("Failed to read contact operations: {}", store_error);
                return Vec::new();
            }
        };

        let Some(Value::Array(items)) = value else {
            return Vec::new();
        };

        let mut operations = Vec::with_capacity(items.len());
        for item in items {
            match serde_json::from_value::<ContactOperation>(item) {
                Ok(operation) => operations.push(operation),
                Err(parse_error) => {
                    error!("Failed to parse contact operation: {}", parse_error);
                }
            }
        }
        operations
    }

    async fn write_operations(&self, operations: Vec<ContactOperation>) {
        let value = match serde_json::to_value(&operations) {
            Ok(value) => value,
            Err(serialize_error) => {
                error!("Failed to serialize contact operations: {}", serialize_error);
                return;
            }
        };

        if let Err(store_error) = self.store.put(OPERATIONS_KEY, value).await {
            error!("Failed to store contact operations: {}", store_error);
        }
    }

    async fn dispatch_update_job(&self, conflict_strategy: ConflictStrategy) {
        if self.channel.channel_id().is_none() {
            return;
        }

        let Some(operation) = self.prepare_next_operation().await else {
            return;
        };

        let mut builder = JobInfo::builder(ACTION_UPDATE_CONTACT)
            .network_required(true)
            .conflict_strategy(conflict_strategy)
            .rate_limit(UPDATE_RATE_LIMIT);

        if matches!(
            operation,
            ContactOperation::Identify { .. } | ContactOperation::Reset | ContactOperation::Resolve
        ) {
            builder = builder.rate_limit(IDENTITY_RATE_LIMIT);
        }

        self.dispatcher.dispatch(builder.build());
    }

    /// Pops skippable operations off the queue head, merges mergeable ones
    /// into the selected operation, and persists the queue with the selected
    /// operation back at the head.
    async fn prepare_next_operation(&self) -> Option<ContactOperation> {
        let _guard = self.queue_lock.lock().await;
        let mut operations = self.read_operations().await;
        let mut next: Option<ContactOperation> = None;

        while !operations.is_empty() {
            let first = operations.remove(0);
            if !self.should_skip_operation(&first, true).await {
                next = Some(first);
                break;
            }
        }

        match next {
            Some(ContactOperation::Update {
                mut tag_group_mutations,
                mut attribute_mutations,
                mut subscription_list_mutations,
            }) => {
                // Merge any consecutive updates, ignoring skippable
                // operations in between
                while let Some(peek) = operations.first() {
                    if self.should_skip_operation(peek, false).await {
                        operations.remove(0);
                        continue;
                    }

                    if matches!(peek, ContactOperation::Update { .. }) {
                        if let ContactOperation::Update {
                            tag_group_mutations: tags,
                            attribute_mutations: attributes,
                            subscription_list_mutations: subscriptions,
                        } = operations.remove(0)
                        {
                            tag_group_mutations.extend(tags);
                            attribute_mutations.extend(attributes);
                            subscription_list_mutations.extend(subscriptions);
                        }
                        continue;
                    }
                    break;
                }

                next = Some(ContactOperation::Update {
                    tag_group_mutations,
                    attribute_mutations,
                    subscription_list_mutations,
                });
            }

            Some(ContactOperation::Identify { identifier }) => {
                // Once the identity is refreshed and non-anonymous, only the
                // final identify matters
                let mut selected = identifier;
                let identity = self.last_contact_identity().await;
                let settled = identity
                    .map(|identity| !identity.is_anonymous)
                    .unwrap_or(true);

                if self.is_contact_id_refreshed.load(Ordering::SeqCst) && settled {
                    while let Some(peek) = operations.first() {
                        if self.should_skip_operation(peek, false).await {
                            operations.remove(0);
                            continue;
                        }

                        if matches!(peek, ContactOperation::Identify { .. }) {
                            if let ContactOperation::Identify { identifier } = operations.remove(0)
                            {
                                selected = identifier;
                            }
                            continue;
                        }
                        break;
                    }
                }

                next = Some(ContactOperation::Identify {
                    identifier: selected,
                });
            }

            _ => {}
        }

        // Persist with the selection back at the head so a crash after
        // selection does not lose it
        match &next {
            Some(operation) => {
                let mut persisted = Vec::with_capacity(operations.len() + 1);
                persisted.push(operation.clone());
                persisted.extend(operations);
                self.write_operations(persisted).await;
            }
            None => self.write_operations(operations).await,
        }

        next
    }

    async fn should_skip_operation(&self, operation: &ContactOperation, is_next: bool) -> bool {
        match operation {
            ContactOperation::Update { .. }
            | ContactOperation::RegisterEmail { .. }
            | ContactOperation::RegisterSms { .. }
            | ContactOperation::RegisterOpenChannel { .. }
            | ContactOperation::AssociateChannel { .. } => false,

            ContactOperation::Identify { identifier } => {
                let Some(identity) = self.last_contact_identity().await else {
                    return false;
                };
                self.is_contact_id_refreshed.load(Ordering::SeqCst)
                    && identity.named_user_id.as_deref() == Some(identifier.as_str())
            }

            ContactOperation::Reset => {
                if !is_next {
                    return false;
                }
                let Some(identity) = self.last_contact_identity().await else {
                    return false;
                };
                identity.is_anonymous && self.anon_contact_data().await.is_none()
            }

            ContactOperation::Resolve => self.is_contact_id_refreshed.load(Ordering::SeqCst),
        }
    }

    // Operation execution

    async fn perform_operation(
        &self,
        operation: ContactOperation,
        channel_id: &str,
    ) -> Result<u16, OperationError> {
        let last_identity = self.last_contact_identity().await;

        match operation {
            ContactOperation::Update {
                tag_group_mutations,
                attribute_mutations,
                subscription_list_mutations,
            } => {
                let identity = last_identity.ok_or(OperationError::MissingIdentity)?;
                let response = self
                    .api
                    .update(
                        &identity.contact_id,
                        &tag_group_mutations,
                        &attribute_mutations,
                        &subscription_list_mutations,
                    )
                    .await?;

                if response.is_success() {
                    if identity.is_anonymous {
                        self.update_anon_data(
                            &tag_group_mutations,
                            &attribute_mutations,
                            &subscription_list_mutations,
                            None,
                        )
                        .await;
                    }

                    if !attribute_mutations.is_empty() {
                        for listener in self.attribute_listeners.lock().unwrap().iter() {
                            listener.on_attribute_mutations_uploaded(&attribute_mutations);
                        }
                    }

                    if !tag_group_mutations.is_empty() {
                        for listener in self.tag_group_listeners.lock().unwrap().iter() {
                            listener.on_tag_group_mutations_uploaded(&tag_group_mutations);
                        }
                    }

                    if !subscription_list_mutations.is_empty() {
                        self.cache_in_local_history(&subscription_list_mutations);
                    }
                }

                Ok(response.status)
            }

            ContactOperation::Identify { identifier } => {
                // Pass the anonymous contact id so the server can merge it
                let contact_id = last_identity
                    .as_ref()
                    .filter(|identity| identity.is_anonymous)
                    .map(|identity| identity.contact_id.clone());

                let response = self
                    .api
                    .identify(&identifier, channel_id, contact_id.as_deref())
                    .await?;
                self.process_identity_response(&response, last_identity)
                    .await;
                Ok(response.status)
            }

            ContactOperation::Reset => {
                let response = self.api.reset(channel_id).await?;
                self.process_identity_response(&response, last_identity)
                    .await;
                Ok(response.status)
            }

            ContactOperation::Resolve => {
                let response = self.api.resolve(channel_id).await?;
                if response.is_success() {
                    self.set_last_resolved_date(self.clock.now_millis()).await;
                }
                self.process_identity_response(&response, last_identity)
                    .await;
                Ok(response.status)
            }

            ContactOperation::RegisterEmail { address, options } => {
                let identity = last_identity.ok_or(OperationError::MissingIdentity)?;
                let response = self
                    .api
                    .register_email(&identity.contact_id, &address, &options)
                    .await?;
                self.process_channel_response(&response).await;
                Ok(response.status)
            }

            ContactOperation::RegisterSms { msisdn, options } => {
                let identity = last_identity.ok_or(OperationError::MissingIdentity)?;
                let response = self
                    .api
                    .register_sms(&identity.contact_id, &msisdn, &options)
                    .await?;
                self.process_channel_response(&response).await;
                Ok(response.status)
            }

            ContactOperation::RegisterOpenChannel { address, options } => {
                let identity = last_identity.ok_or(OperationError::MissingIdentity)?;
                let response = self
                    .api
                    .register_open_channel(&identity.contact_id, &address, &options)
                    .await?;
                self.process_channel_response(&response).await;
                Ok(response.status)
            }

            ContactOperation::AssociateChannel {
                channel_id: associate_id,
                channel_type,
            } => {
                let identity = last_identity.ok_or(OperationError::MissingIdentity)?;
                let response = self
                    .api
                    .associate_channel(&identity.contact_id, &associate_id, channel_type)
                    .await?;
                self.process_channel_response(&response).await;
                Ok(response.status)
            }
        }
    }

    /// Reconciles the cached identity with an identify/reset/resolve
    /// response.
    async fn process_identity_response(
        &self,
        response: &ApiResponse<ContactIdentity>,
        last_identity: Option<ContactIdentity>,
    ) {
        if !response.is_success() {
            return;
        }
        let Some(new_identity) = response.result.clone() else {
            return;
        };

        match last_identity {
            Some(last) if last.contact_id == new_identity.contact_id => {
                // Same contact; keep a previously learned named user id
                let named_user_id = new_identity.named_user_id.or(last.named_user_id);
                let updated = ContactIdentity::new(
                    new_identity.contact_id,
                    new_identity.is_anonymous,
                    named_user_id,
                );
                let is_anonymous = updated.is_anonymous;
                self.set_last_contact_identity(&updated).await;
                if !is_anonymous {
                    self.set_anon_contact_data(None).await;
                }
            }
            previous => {
                // Identity switch
                let was_anonymous = previous
                    .map(|identity| identity.is_anonymous)
                    .unwrap_or(false);
                if was_anonymous {
                    self.notify_conflict(new_identity.named_user_id.clone())
                        .await;
                }

                self.subscription_cache.invalidate();
                self.set_last_contact_identity(&new_identity).await;
                self.set_anon_contact_data(None).await;
                self.channel.update_registration();

                for listener in self.contact_change_listeners.lock().unwrap().iter() {
                    listener.on_contact_changed();
                }
            }
        }

        self.is_contact_id_refreshed.store(true, Ordering::SeqCst);
    }

    async fn process_channel_response(&self, response: &ApiResponse<AssociatedChannel>) {
        if !response.is_success() {
            return;
        }
        let Some(associated) = response.result.clone() else {
            return;
        };

        let anonymous = self
            .last_contact_identity()
            .await
            .map(|identity| identity.is_anonymous)
            .unwrap_or(false);
        if anonymous {
            self.update_anon_data(&[], &[], &[], Some(associated)).await;
        }
    }

    async fn notify_conflict(&self, named_user_id: Option<String>) {
        let listener = self.conflict_listener.lock().unwrap().clone();
        let Some(listener) = listener else {
            return;
        };

        let Some(data) = self.anon_contact_data().await else {
            return;
        };

        listener.on_conflict(data, named_user_id);
    }

    // Anonymous shadow data

    async fn update_anon_data(
        &self,
        tag_group_mutations: &[TagGroupsMutation],
        attribute_mutations: &[AttributeMutation],
        subscription_list_mutations: &[ScopedSubscriptionListMutation],
        associated_channel: Option<AssociatedChannel>,
    ) {
        let mut data = self.anon_contact_data().await.unwrap_or_default();

        for mutation in attribute_mutations {
            match mutation.action {
                mutation::AttributeAction::Set => {
                    if let Some(value) = &mutation.value {
                        data.attributes.insert(mutation.name.clone(), value.clone());
                    }
                }
                mutation::AttributeAction::Remove => {
                    data.attributes.remove(&mutation.name);
                }
            }
        }

        for mutation in tag_group_mutations {
            mutation.apply(&mut data.tag_groups);
        }

        for mutation in subscription_list_mutations {
            mutation.apply(&mut data.subscription_lists);
        }

        if let Some(channel) = associated_channel {
            data.associated_channels.push(channel);
        }

        self.set_anon_contact_data(Some(data)).await;
    }

    async fn anon_contact_data(&self) -> Option<ContactData> {
        let value = match self.store.get(ANON_CONTACT_DATA_KEY).await {
            Ok(value) => value?,
            Err(store_error) => {
                error!("Failed to read anonymous contact data: {}", store_error);
                return None;
            }
        };

        match serde_json::from_value::<ContactData>(value) {
            Ok(data) => Some(data),
            Err(parse_error) => {
                error!("Invalid anonymous contact data: {}", parse_error);
                if let Err(store_error) = self.store.remove(ANON_CONTACT_DATA_KEY).await {
                    error!("Failed to remove anonymous contact data: {}", store_error);
                }
                None
            }
        }
    }

    async fn set_anon_contact_data(&self, data: Option<ContactData>) {
        let result = match data {
            Some(data) => match serde_json::to_value(&data) {
                Ok(value) => self.store.put(ANON_CONTACT_DATA_KEY, value).await,
                Err(serialize_error) => {
                    error!(
                        "Failed to serialize anonymous contact data: {}",
                        serialize_error
                    );
                    return;
                }
            },
            None => self.store.remove(ANON_CONTACT_DATA_KEY).await,
        };

        if let Err(store_error) = result {
            error!("Failed to store anonymous contact data: {}", store_error);
        }
    }

    // Identity persistence

    async fn last_contact_identity(&self) -> Option<ContactIdentity> {
        let value = match self.store.get(LAST_CONTACT_IDENTITY_KEY).await {
            Ok(value) => value?,
            Err(store_error) => {
                error!("Failed to read contact identity: {}", store_error);
                return None;
            }
        };

        match serde_json::from_value::<ContactIdentity>(value) {
            Ok(identity) => Some(identity),
            Err(parse_error) => {
                error!("Unable to parse contact identity: {}", parse_error);
                None
            }
        }
    }

    async fn set_last_contact_identity(&self, identity: &ContactIdentity) {
        let value = match serde_json::to_value(identity) {
            Ok(value) => value,
            Err(serialize_error) => {
                error!("Failed to serialize contact identity: {}", serialize_error);
                return;
            }
        };

        if let Err(store_error) = self.store.put(LAST_CONTACT_IDENTITY_KEY, value).await {
            error!("Failed to store contact identity: {}", store_error);
        }
    }

    async fn last_resolved_date(&self) -> i64 {
        match self.store.get(LAST_RESOLVED_DATE_KEY).await {
            Ok(value) => value.and_then(|value| value.as_i64()).unwrap_or(-1),
            Err(store_error) => {
                error!("Failed to read last resolved date: {}", store_error);
                -1
            }
        }
    }

    async fn set_last_resolved_date(&self, millis: i64) {
        if let Err(store_error) = self
            .store
            .put(LAST_RESOLVED_DATE_KEY, Value::from(millis))
            .await
        {
            error!("Failed to store last resolved date: {}", store_error);
        }
    }

    /// The cached contact id, unless a pending identify/reset would change
    /// it.
    async fn current_contact_id(&self) -> Option<String> {
        let _guard = self.queue_lock.lock().await;
        let identity = self.last_contact_identity().await?;

        for operation in self.read_operations().await {
            match operation {
                ContactOperation::Identify { identifier } => {
                    if identity.named_user_id.as_deref() != Some(identifier.as_str()) {
                        return None;
                    }
                }
                ContactOperation::Reset => return None,
                _ => {}
            }
        }

        Some(identity.contact_id)
    }

    // Subscription list helpers

    async fn fetch_subscription_lists(
        &self,
        contact_id: &str,
    ) -> Option<HashMap<String, HashSet<Scope>>> {
        let response = match self.api.subscription_lists(contact_id).await {
            Ok(response) => response,
            Err(request_error) => {
                error!("Failed to fetch contact subscription lists: {}", request_error);
                return None;
            }
        };

        if response.is_success() {
            response.result
        } else {
            error!(
                "Failed to fetch contact subscription lists, status: {}",
                response.status
            );
            None
        }
    }

    fn cache_in_local_history(&self, mutations: &[ScopedSubscriptionListMutation]) {
        let mut history = self.local_history.lock().unwrap();
        for mutation in mutations {
            let cached = CachedValue::new(self.clock.clone());
            cached.set(mutation.clone(), SUBSCRIPTION_LOCAL_HISTORY_LIFETIME_MS);
            history.push(cached);
        }
    }

    fn apply_local_history(&self, subscriptions: &mut HashMap<String, HashSet<Scope>>) {
        let mut history = self.local_history.lock().unwrap();
        history.retain(|cached| match cached.get() {
            Some(mutation) => {
                mutation.apply(subscriptions);
                true
            }
            None => false, // expired
        });
    }

    fn notify_channel_subscription_mutations(
        &self,
        mutations: &[ScopedSubscriptionListMutation],
    ) {
        let channel_mutations: Vec<SubscriptionListMutation> = mutations
            .iter()
            .filter(|mutation| mutation.scope == Scope::App)
            .map(|mutation| SubscriptionListMutation {
                action: mutation.action,
                list_id: mutation.list_id.clone(),
                timestamp: mutation.timestamp.clone(),
            })
            .collect();

        if !channel_mutations.is_empty() {
            self.channel
                .process_contact_subscription_mutations(&channel_mutations);
        }
    }
}

fn is_retryable_status(status: u16) -> bool {
    (500..600).contains(&status) || status == 429
}
