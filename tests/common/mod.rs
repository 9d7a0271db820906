//! Shared test doubles for the contact engine integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use skysync::channel::ChannelProvider;
use skysync::clock::TestClock;
use skysync::contacts::api::{ApiResponse, ContactApiClient, RequestError};
use skysync::contacts::identity::{AssociatedChannel, ChannelType, ContactData, ContactIdentity};
use skysync::contacts::mutation::{
    AttributeMutation, Scope, ScopedSubscriptionListMutation, SubscriptionListMutation,
    TagGroupsMutation,
};
use skysync::contacts::operation::{
    EmailRegistrationOptions, OpenChannelRegistrationOptions, SmsRegistrationOptions,
};
use skysync::contacts::{Contact, ContactConflictListener};
use skysync::jobs::{JobDispatcher, JobInfo};
use skysync::privacy::{Feature, PrivacyManager};
use skysync::store::MemoryStore;

/// One recorded API invocation.
#[derive(Debug, Clone)]
pub enum ApiCall {
    Resolve,
    Identify {
        named_user_id: String,
        contact_id: Option<String>,
    },
    Reset,
    Update {
        contact_id: String,
        tag_group_mutations: Vec<TagGroupsMutation>,
        attribute_mutations: Vec<AttributeMutation>,
        subscription_list_mutations: Vec<ScopedSubscriptionListMutation>,
    },
    RegisterEmail {
        address: String,
    },
    RegisterSms {
        msisdn: String,
    },
    RegisterOpenChannel {
        address: String,
    },
    AssociateChannel {
        channel_id: String,
        channel_type: ChannelType,
    },
    SubscriptionLists {
        contact_id: String,
    },
}

/// Scriptable API client. Responses are consumed FIFO per response kind;
/// when a queue is empty a benign success response is synthesized so tests
/// only script the interesting calls.
#[derive(Default)]
pub struct MockApiClient {
    identity_responses: Mutex<VecDeque<Result<ApiResponse<ContactIdentity>, RequestError>>>,
    update_responses: Mutex<VecDeque<Result<ApiResponse<()>, RequestError>>>,
    channel_responses: Mutex<VecDeque<Result<ApiResponse<AssociatedChannel>, RequestError>>>,
    subscription_responses:
        Mutex<VecDeque<Result<ApiResponse<HashMap<String, HashSet<Scope>>>, RequestError>>>,
    calls: Mutex<Vec<ApiCall>>,
}

impl MockApiClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_identity(&self, response: Result<ApiResponse<ContactIdentity>, RequestError>) {
        self.identity_responses.lock().unwrap().push_back(response);
    }

    pub fn queue_update(&self, response: Result<ApiResponse<()>, RequestError>) {
        self.update_responses.lock().unwrap().push_back(response);
    }

    pub fn queue_channel(&self, response: Result<ApiResponse<AssociatedChannel>, RequestError>) {
        self.channel_responses.lock().unwrap().push_back(response);
    }

    pub fn queue_subscriptions(
        &self,
        response: Result<ApiResponse<HashMap<String, HashSet<Scope>>>, RequestError>,
    ) {
        self.subscription_responses
            .lock()
            .unwrap()
            .push_back(response);
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn identify_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, ApiCall::Identify { .. }))
            .count()
    }

    pub fn reset_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, ApiCall::Reset))
            .count()
    }

    pub fn update_calls(&self) -> Vec<ApiCall> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, ApiCall::Update { .. }))
            .collect()
    }

    fn record(&self, call: ApiCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn next_identity(
        &self,
        fallback: ContactIdentity,
    ) -> Result<ApiResponse<ContactIdentity>, RequestError> {
        self.identity_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ApiResponse::new(200, Some(fallback))))
    }

    fn next_channel(
        &self,
        channel_type: ChannelType,
    ) -> Result<ApiResponse<AssociatedChannel>, RequestError> {
        self.channel_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Ok(ApiResponse::new(
                    200,
                    Some(AssociatedChannel {
                        channel_id: "mock-registered-channel".to_string(),
                        channel_type,
                    }),
                ))
            })
    }
}

#[async_trait]
impl ContactApiClient for MockApiClient {
    async fn resolve(
        &self,
        _channel_id: &str,
    ) -> Result<ApiResponse<ContactIdentity>, RequestError> {
        self.record(ApiCall::Resolve);
        self.next_identity(ContactIdentity::new("mock-contact-id", true, None))
    }

    async fn identify(
        &self,
        named_user_id: &str,
        _channel_id: &str,
        contact_id: Option<&str>,
    ) -> Result<ApiResponse<ContactIdentity>, RequestError> {
        self.record(ApiCall::Identify {
            named_user_id: named_user_id.to_string(),
            contact_id: contact_id.map(str::to_string),
        });
        self.next_identity(ContactIdentity::new(
            "mock-contact-id",
            false,
            Some(named_user_id.to_string()),
        ))
    }

    async fn reset(&self, _channel_id: &str) -> Result<ApiResponse<ContactIdentity>, RequestError> {
        self.record(ApiCall::Reset);
        self.next_identity(ContactIdentity::new("mock-reset-contact-id", true, None))
    }

    async fn update(
        &self,
        contact_id: &str,
        tag_group_mutations: &[TagGroupsMutation],
        attribute_mutations: &[AttributeMutation],
        subscription_list_mutations: &[ScopedSubscriptionListMutation],
    ) -> Result<ApiResponse<()>, RequestError> {
        self.record(ApiCall::Update {
            contact_id: contact_id.to_string(),
            tag_group_mutations: tag_group_mutations.to_vec(),
            attribute_mutations: attribute_mutations.to_vec(),
            subscription_list_mutations: subscription_list_mutations.to_vec(),
        });
        self.update_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ApiResponse::new(200, Some(()))))
    }

    async fn register_email(
        &self,
        _contact_id: &str,
        address: &str,
        _options: &EmailRegistrationOptions,
    ) -> Result<ApiResponse<AssociatedChannel>, RequestError> {
        self.record(ApiCall::RegisterEmail {
            address: address.to_string(),
        });
        self.next_channel(ChannelType::Email)
    }

    async fn register_sms(
        &self,
        _contact_id: &str,
        msisdn: &str,
        _options: &SmsRegistrationOptions,
    ) -> Result<ApiResponse<AssociatedChannel>, RequestError> {
        self.record(ApiCall::RegisterSms {
            msisdn: msisdn.to_string(),
        });
        self.next_channel(ChannelType::Sms)
    }

    async fn register_open_channel(
        &self,
        _contact_id: &str,
        address: &str,
        _options: &OpenChannelRegistrationOptions,
    ) -> Result<ApiResponse<AssociatedChannel>, RequestError> {
        self.record(ApiCall::RegisterOpenChannel {
            address: address.to_string(),
        });
        self.next_channel(ChannelType::Open)
    }

    async fn associate_channel(
        &self,
        _contact_id: &str,
        channel_id: &str,
        channel_type: ChannelType,
    ) -> Result<ApiResponse<AssociatedChannel>, RequestError> {
        self.record(ApiCall::AssociateChannel {
            channel_id: channel_id.to_string(),
            channel_type,
        });
        self.channel_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Ok(ApiResponse::new(
                    200,
                    Some(AssociatedChannel {
                        channel_id: channel_id.to_string(),
                        channel_type,
                    }),
                ))
            })
    }

    async fn subscription_lists(
        &self,
        contact_id: &str,
    ) -> Result<ApiResponse<HashMap<String, HashSet<Scope>>>, RequestError> {
        self.record(ApiCall::SubscriptionLists {
            contact_id: contact_id.to_string(),
        });
        self.subscription_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ApiResponse::new(200, Some(HashMap::new()))))
    }
}

/// Records dispatched jobs instead of scheduling them.
#[derive(Default)]
pub struct TestDispatcher {
    pub jobs: Mutex<Vec<JobInfo>>,
    pub rate_limits: Mutex<Vec<(String, u32, Duration)>>,
}

impl TestDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispatched_actions(&self) -> Vec<String> {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .map(|job| job.action.clone())
            .collect()
    }

    pub fn last_job(&self) -> Option<JobInfo> {
        self.jobs.lock().unwrap().last().cloned()
    }
}

impl JobDispatcher for TestDispatcher {
    fn dispatch(&self, job: JobInfo) {
        self.jobs.lock().unwrap().push(job);
    }

    fn set_rate_limit(&self, key: &str, max: u32, window: Duration) {
        self.rate_limits
            .lock()
            .unwrap()
            .push((key.to_string(), max, window));
    }
}

/// Channel provider with a settable channel id.
#[derive(Default)]
pub struct FixedChannel {
    pub id: Mutex<Option<String>>,
    pub registration_updates: AtomicUsize,
    pub mutations: Mutex<Vec<SubscriptionListMutation>>,
}

impl FixedChannel {
    pub fn with_id(id: &str) -> Self {
        Self {
            id: Mutex::new(Some(id.to_string())),
            ..Default::default()
        }
    }

    pub fn without_id() -> Self {
        Self::default()
    }

    pub fn set_id(&self, id: Option<&str>) {
        *self.id.lock().unwrap() = id.map(str::to_string);
    }

    pub fn registration_update_count(&self) -> usize {
        self.registration_updates.load(Ordering::SeqCst)
    }

    pub fn mirrored_mutations(&self) -> Vec<SubscriptionListMutation> {
        self.mutations.lock().unwrap().clone()
    }
}

impl ChannelProvider for FixedChannel {
    fn channel_id(&self) -> Option<String> {
        self.id.lock().unwrap().clone()
    }

    fn update_registration(&self) {
        self.registration_updates.fetch_add(1, Ordering::SeqCst);
    }

    fn process_contact_subscription_mutations(&self, mutations: &[SubscriptionListMutation]) {
        self.mutations.lock().unwrap().extend_from_slice(mutations);
    }
}

/// Captures conflict notifications.
#[derive(Default)]
pub struct RecordingConflictListener {
    events: Mutex<Vec<(ContactData, Option<String>)>>,
}

impl RecordingConflictListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(ContactData, Option<String>)> {
        self.events.lock().unwrap().clone()
    }
}

impl ContactConflictListener for RecordingConflictListener {
    fn on_conflict(&self, anonymous_data: ContactData, named_user_id: Option<String>) {
        self.events
            .lock()
            .unwrap()
            .push((anonymous_data, named_user_id));
    }
}

/// Fully wired engine over in-memory doubles.
pub struct TestHarness {
    pub contact: Contact,
    pub api: Arc<MockApiClient>,
    pub channel: Arc<FixedChannel>,
    pub dispatcher: Arc<TestDispatcher>,
    pub store: Arc<MemoryStore>,
    pub privacy: Arc<PrivacyManager>,
    pub clock: Arc<TestClock>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_channel(FixedChannel::with_id("test-channel"))
    }

    pub fn with_channel(channel: FixedChannel) -> Self {
        let api = Arc::new(MockApiClient::new());
        let channel = Arc::new(channel);
        let dispatcher = Arc::new(TestDispatcher::new());
        let store = Arc::new(MemoryStore::new());
        let privacy = Arc::new(PrivacyManager::new(Feature::ALL));
        let clock = Arc::new(TestClock::new(1_700_000_000_000));

        let contact = Contact::new(
            store.clone(),
            api.clone(),
            channel.clone(),
            privacy.clone(),
            dispatcher.clone(),
            clock.clone(),
        );

        Self {
            contact,
            api,
            channel,
            dispatcher,
            store,
            privacy,
            clock,
        }
    }

    /// A second engine sharing this harness's store, as after a restart.
    pub fn restarted(&self) -> Contact {
        Contact::new(
            self.store.clone(),
            self.api.clone(),
            self.channel.clone(),
            self.privacy.clone(),
            self.dispatcher.clone(),
            self.clock.clone(),
        )
    }
}
