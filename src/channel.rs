//! Channel provider contract
//!
//! The contact engine never owns the device channel; it consumes this trait
//! to read the channel id, request registration updates after identity
//! changes, and mirror channel-scoped subscription edits.

use crate::contacts::mutation::SubscriptionListMutation;

/// Collaborator exposing the device-local channel.
pub trait ChannelProvider: Send + Sync {
    /// Returns the channel id, or `None` if the channel has not been created.
    fn channel_id(&self) -> Option<String>;

    /// Requests a channel registration update, e.g. after the contact id
    /// changes.
    fn update_registration(&self);

    /// Receives app-scoped subscription list mutations mirrored at edit time,
    /// before the contact sync completes.
    fn process_contact_subscription_mutations(&self, mutations: &[SubscriptionListMutation]);
}
