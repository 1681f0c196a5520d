//! Subscription arbitration for remote members.
//!
//! A member advertises several candidate streams. The
//! [`MemberSubscriptionService`] picks one with [`next_candidate`],
//! subscribes to every token it offers in parallel and only hands the
//! subscriptions over once each of them reports data. The
//! [`MemberSubscriptionController`] drives the member's connection state
//! from what the service and the live subscriptions report.

mod controller;
mod live;
mod selector;
mod service;

pub use controller::{MemberOptions, MemberSubscriptionController};
pub use live::LiveSubscription;
pub use selector::next_candidate;
pub use service::{
    MemberSubscriptionService, ServiceMsg, ServicePoster, SubscribeDecision, SubscriptionFailure,
    SubscriptionServiceDelegate,
};
