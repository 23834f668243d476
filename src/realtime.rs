//! Watches the insert feed and alerts the operator for each new RSVP.
//!
//! The MySQL store publishes every inserted row as JSON on the
//! [`INSERT_CHANNEL`] Redis channel. A bad event or a failed send is logged
//! and skipped; only [`TaskHandle::teardown`] or the feed closing ends the
//! subscription.

use std::sync::Arc;
use std::time::Duration;

use rocket::futures::stream::{BoxStream, Stream, StreamExt};
use rocket::serde::json;
use rocket::tokio::time::timeout;
use rocket_db_pools::deadpool_redis::redis;
use tracing::{debug, info, warn};

use crate::error::FeedError;
use crate::models::{Attendee, Submission};
use crate::notify::{Notifier, SendOutcome};
use crate::store::INSERT_CHANNEL;
use crate::task::TaskHandle;

/// A live realtime subscription. Release it with [`TaskHandle::teardown`].
pub type Subscription = TaskHandle;

pub type InsertFeed = BoxStream<'static, Result<Submission, FeedError>>;

/// Subscribes to the Redis insert channel.
pub async fn redis_insert_feed(url: &str, limit: Duration) -> Result<InsertFeed, FeedError> {
    let client = redis::Client::open(url).map_err(|e| FeedError::Connection(e.to_string()))?;

    let mut pubsub = timeout(limit, client.get_async_pubsub())
        .await
        .map_err(|_| FeedError::Connection(format!("timed out after {limit:?}")))?
        .map_err(|e| FeedError::Connection(e.to_string()))?;

    pubsub
        .subscribe(INSERT_CHANNEL)
        .await
        .map_err(|e| FeedError::Connection(e.to_string()))?;
    info!("Subscribed to {INSERT_CHANNEL}");

    let feed = pubsub.into_on_message().map(|msg| {
        let payload: String = msg
            .get_payload()
            .map_err(|e| FeedError::Payload(e.to_string()))?;
        json::from_str::<Submission>(&payload).map_err(|e| FeedError::Payload(e.to_string()))
    });

    Ok(feed.boxed())
}

/// Starts handling insert events until torn down or the feed ends.
pub fn watch<S>(feed: S, notifier: Arc<Notifier>) -> Subscription
where
    S: Stream<Item = Result<Submission, FeedError>> + Send + 'static,
{
    TaskHandle::spawn("realtime watcher", move |mut shutdown| async move {
        let mut feed = Box::pin(feed);

        loop {
            rocket::tokio::select! {
                _ = &mut shutdown => break,
                event = feed.next() => match event {
                    Some(Ok(row)) => {
                        handle_insert(&notifier, &row).await;
                    }
                    Some(Err(e)) => warn!("Skipping realtime event: {e}"),
                    None => {
                        warn!("Realtime feed closed");
                        break;
                    }
                },
            }
        }
    })
}

async fn handle_insert(notifier: &Notifier, row: &Submission) -> Option<SendOutcome> {
    if !notifier.is_configured() {
        debug!("Email not configured, no alert for {}", row.id);
        return None;
    }

    let outcome = notifier
        .send_admin_notification(&Attendee::from(row))
        .await;
    if let Some(e) = outcome.error() {
        warn!("Admin alert for {} not sent: {e}", row.id);
    }
    Some(outcome)
}
