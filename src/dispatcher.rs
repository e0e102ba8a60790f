//! Message dispatcher
//!
//! Subscribes to the service's subjects under one shared queue group so
//! multiple instances load-balance consumption. Messages are handled on
//! parallel tasks; each handler sends exactly one reply, whatever the
//! error path. A reply that cannot be published is logged and dropped -
//! the requester times out.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, error, info, info_span, warn};

use crate::bus::BusClient;
use crate::service::UserService;
use crate::{Error, Result};

/// Queue group shared by every service instance.
pub const QUEUE_GROUP: &str = "lfx.auth-service.queue";

/// The service's subject table.
pub mod subjects {
    /// Resolve a primary email to a username
    pub const EMAIL_TO_USERNAME: &str = "lfx.auth-service.email_to_username";
    /// Resolve a primary email to a canonical subject
    pub const EMAIL_TO_SUB: &str = "lfx.auth-service.email_to_sub";
    /// Read the full user projection
    pub const METADATA_READ: &str = "lfx.auth-service.user_metadata.read";
    /// Update profile metadata
    pub const METADATA_UPDATE: &str = "lfx.auth-service.user_metadata.update";
    /// Email linking step 1: send the one-time code
    pub const SEND_VERIFICATION: &str = "lfx.auth-service.email_linking.send_verification";
    /// Email linking step 2: exchange the code
    pub const VERIFY: &str = "lfx.auth-service.email_linking.verify";
    /// Email linking step 3: attach the identity
    pub const LINK: &str = "lfx.auth-service.user_identity.link";

    /// Every subject the dispatcher subscribes to.
    pub const ALL: [&str; 7] = [
        EMAIL_TO_USERNAME,
        EMAIL_TO_SUB,
        METADATA_READ,
        METADATA_UPDATE,
        SEND_VERIFICATION,
        VERIFY,
        LINK,
    ];
}

/// Routes bus messages to the orchestrator.
pub struct Dispatcher {
    bus: BusClient,
    service: Arc<UserService>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Dispatcher {
    /// Create a dispatcher over an established bus connection.
    #[must_use]
    pub fn new(bus: BusClient, service: Arc<UserService>) -> Self {
        Self {
            bus,
            service,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Establish every subscription and start consuming.
    ///
    /// Returns once all subscriptions are in place (the readiness signal);
    /// consumption continues on background tasks.
    pub async fn run(&self) -> Result<()> {
        for subject in subjects::ALL {
            let subscriber = self
                .bus
                .queue_subscribe(subject.to_string(), QUEUE_GROUP.to_string())
                .await?;

            let bus = self.bus.clone();
            let service = Arc::clone(&self.service);
            let tracker = self.tracker.clone();
            let cancel = self.cancel.clone();
            self.tracker
                .spawn(consume(subscriber, bus, service, tracker, cancel));
        }

        info!(subjects = subjects::ALL.len(), queue_group = QUEUE_GROUP, "dispatcher running");
        Ok(())
    }

    /// Stop consuming and give in-flight handlers `timeout` to drain.
    pub async fn shutdown(&self, timeout: Duration) {
        self.cancel.cancel();
        self.tracker.close();

        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_err() {
            warn!("handlers did not drain in time; forcing exit");
        }
    }
}

/// Consume one subscription until cancellation or unsubscribe.
async fn consume(
    mut subscriber: async_nats::Subscriber,
    bus: BusClient,
    service: Arc<UserService>,
    tracker: TaskTracker,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            message = subscriber.next() => {
                let Some(message) = message else { break };
                let bus = bus.clone();
                let service = Arc::clone(&service);
                tracker.spawn(handle_message(bus, service, message));
            }
        }
    }
}

/// Handle one message: route, shape the reply, send it exactly once.
async fn handle_message(bus: BusClient, service: Arc<UserService>, message: async_nats::Message) {
    let subject = message.subject.clone();
    let span = info_span!("handle", subject = %subject.as_str());

    async {
        let payload = process(&service, subject.as_str(), &message.payload).await;

        match message.reply {
            Some(reply_subject) => {
                if let Err(e) = bus.publish(reply_subject, Bytes::from(payload)).await {
                    warn!(error = %e, "failed to send reply");
                }
            }
            None => warn!("request carried no reply subject"),
        }
    }
    .instrument(span)
    .await;
}

/// Route one request and render its reply bytes.
async fn process(service: &UserService, subject: &str, payload: &[u8]) -> String {
    let reply_value = match route(service, subject, payload).await {
        Ok(value) => value,
        Err(e) => {
            error!(error = %e, "operation failed");
            error_reply(subject, &e)
        }
    };
    reply_value.to_string()
}

/// Error reply in the shape the subject's happy path uses: the linking
/// operations carry the `{success, ...}` envelope, every other subject
/// replies with a bare error object.
fn error_reply(subject: &str, e: &Error) -> Value {
    match subject {
        subjects::SEND_VERIFICATION | subjects::VERIFY | subjects::LINK => {
            serde_json::json!({"success": false, "error": e.reply_message()})
        }
        _ => serde_json::json!({"error": e.reply_message()}),
    }
}

/// Subject table lookup.
async fn route(service: &UserService, subject: &str, payload: &[u8]) -> Result<Value> {
    match subject {
        subjects::EMAIL_TO_USERNAME => service.email_to_username(payload).await,
        subjects::EMAIL_TO_SUB => service.email_to_sub(payload).await,
        subjects::METADATA_READ => service.metadata_read(payload).await,
        subjects::METADATA_UPDATE => service.metadata_update(payload).await,
        subjects::SEND_VERIFICATION => service.send_verification(payload).await,
        subjects::VERIFY => service.verify(payload).await,
        subjects::LINK => service.link(payload).await,
        _ => Err(Error::Validation("unknown subject".to_string())),
    }
}
