//! SkySync - Contact synchronization engine
//!
//! SkySync keeps a device's contact identity and contact data in sync with a
//! remote service while tolerating being offline. Every public mutation is
//! recorded in a durable operation queue and replayed by a background job
//! worker once connectivity and a device channel are available.
//!
//! # Overview
//!
//! This library provides:
//! - A persisted FIFO operation queue (identify, reset, resolve, update,
//!   channel registration, channel association)
//! - Operation collapsing so redundant work never hits the network
//! - Identity reconciliation with conflict notification when an anonymous
//!   contact merges into a named one
//! - Cached subscription list reads with a short-lived local history overlay
//!
//! # Module Structure
//!
//! - **`contacts`** - The engine itself: [`contacts::Contact`], the
//!   operation queue, mutation types, fluent editors, and the API client
//! - **`store`** - Key-value persistence ([`store::SqliteStore`] for
//!   production, [`store::MemoryStore`] for tests)
//! - **`jobs`** - Job dispatch and per-key rate limiting
//! - **`channel`** - Seam to the device channel owned by the embedding app
//! - **`privacy`** - Feature flags gating contact and tag/attribute work
//! - **`config`** - Runtime configuration for the remote endpoints
//! - **`clock`** - Injectable time source and expiring cached values
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use skysync::clock::SystemClock;
//! use skysync::config::RuntimeConfig;
//! use skysync::contacts::api::HttpContactApiClient;
//! use skysync::contacts::Contact;
//! use skysync::jobs::LocalJobDispatcher;
//! use skysync::privacy::{Feature, PrivacyManager};
//! use skysync::store::MemoryStore;
//! # use skysync::channel::ChannelProvider;
//! # use skysync::contacts::mutation::SubscriptionListMutation;
//! # struct NoChannel;
//! # impl ChannelProvider for NoChannel {
//! #     fn channel_id(&self) -> Option<String> { None }
//! #     fn update_registration(&self) {}
//! #     fn process_contact_subscription_mutations(&self, _: &[SubscriptionListMutation]) {}
//! # }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RuntimeConfig::builder()
//!     .device_url("https://device-api.example.com")
//!     .app_key("app key")
//!     .app_secret("app secret")
//!     .build()?;
//!
//! let clock = Arc::new(SystemClock);
//! let contact = Contact::new(
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(HttpContactApiClient::new(config)),
//!     Arc::new(NoChannel),
//!     Arc::new(PrivacyManager::new(Feature::ALL)),
//!     Arc::new(LocalJobDispatcher::new(clock.clone())),
//!     clock,
//! );
//!
//! contact.init().await;
//! contact.identify("some-user").await;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod clock;
pub mod config;
pub mod contacts;
pub mod error;
pub mod jobs;
pub mod privacy;
pub mod store;

pub use contacts::Contact;
pub use error::OperationError;
