//! Deferred reminder emails.
//!
//! A successful RSVP schedules its reminder for `event_at - lead` on a Redis
//! sorted set scored by due time. The dispatcher polls the set, claims due
//! entries with `ZREM` so only one server instance sends each, and records a
//! `reminder` notification for every email that went out.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use rocket::serde::json;
use rocket::tokio::time::{interval, timeout, MissedTickBehavior};
use rocket_db_pools::deadpool_redis;
use rocket_db_pools::deadpool_redis::redis::AsyncCommands;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::models::{Attendee, NotificationKind, NotificationRecord};
use crate::notify::{Notifier, SendOutcome};
use crate::store::SubmissionStore;
use crate::task::TaskHandle;

const REMINDER_KEY: &str = "rsvp:reminders";

/// When reminders go out relative to the event.
#[derive(Debug, Clone, Copy)]
pub struct ReminderPolicy {
    pub event_at: Option<NaiveDateTime>,
    pub lead: chrono::Duration,
}

impl ReminderPolicy {
    /// Event times are UTC. `None` once the event has started, or when no
    /// event time is set.
    /// A reminder whose lead window already opened is due immediately.
    pub fn due_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let event_at = self.event_at?.and_utc();
        if event_at <= now {
            return None;
        }
        Some((event_at - self.lead).max(now))
    }
}

#[rocket::async_trait]
pub trait ReminderQueue: Send + Sync {
    async fn schedule(&self, attendee: &Attendee, due: DateTime<Utc>) -> Result<(), StoreError>;

    /// Removes and returns every reminder due at `now`.
    async fn take_due(&self, now: DateTime<Utc>) -> Result<Vec<Attendee>, StoreError>;
}

pub struct RedisReminderQueue {
    pool: deadpool_redis::Pool,
    timeout: Duration,
}

impl RedisReminderQueue {
    pub fn new(pool: deadpool_redis::Pool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection, StoreError> {
        timeout(self.timeout, self.pool.get())
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    /// `false` when another instance removed the entry first.
    async fn claim(&self, member: String) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let removed: i64 = timeout(self.timeout, conn.zrem(REMINDER_KEY, member))
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))??;
        Ok(removed > 0)
    }
}

#[rocket::async_trait]
impl ReminderQueue for RedisReminderQueue {
    async fn schedule(&self, attendee: &Attendee, due: DateTime<Utc>) -> Result<(), StoreError> {
        let member = json::to_string(attendee).map_err(|e| StoreError::Backend(e.to_string()))?;
        let mut conn = self.connection().await?;

        let _: i64 = timeout(self.timeout, conn.zadd(REMINDER_KEY, member, due.timestamp()))
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))??;
        debug!("Reminder for {} scheduled at {due}", attendee.email);
        Ok(())
    }

    async fn take_due(&self, now: DateTime<Utc>) -> Result<Vec<Attendee>, StoreError> {
        let members: Vec<String> = {
            let mut conn = self.connection().await?;
            timeout(
                self.timeout,
                conn.zrangebyscore(REMINDER_KEY, "-inf", now.timestamp()),
            )
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))??
        };

        Ok(claim_due(members, |member| self.claim(member)).await)
    }
}

/// Claims each member in turn. A failed claim ends the pass, but whatever
/// was already claimed is still returned: it is gone from the queue.
async fn claim_due<F, Fut>(members: Vec<String>, mut claim: F) -> Vec<Attendee>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<bool, StoreError>>,
{
    let mut due = Vec::with_capacity(members.len());
    for member in members {
        match claim(member.clone()).await {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                warn!("Stopped claiming reminders after {}: {e}", due.len());
                break;
            }
        }
        match json::from_str::<Attendee>(&member) {
            Ok(attendee) => due.push(attendee),
            Err(e) => warn!("Dropping unreadable reminder entry: {e}"),
        }
    }
    due
}

/// Sends every due reminder once. Returns how many were delivered.
pub async fn dispatch_due(
    queue: &dyn ReminderQueue,
    notifier: &Notifier,
    store: &dyn SubmissionStore,
    now: DateTime<Utc>,
) -> usize {
    let due = match queue.take_due(now).await {
        Ok(due) => due,
        Err(e) => {
            warn!("Could not read the reminder queue: {e}");
            return 0;
        }
    };

    let mut records = Vec::new();
    for attendee in &due {
        match notifier.send_reminder(attendee).await {
            SendOutcome::Sent => records.push(NotificationRecord::new(
                &attendee.email,
                NotificationKind::Reminder,
                now.naive_utc(),
            )),
            SendOutcome::NotConfigured => {
                warn!("Email not configured, reminder for {} dropped", attendee.email)
            }
            SendOutcome::Failed(e) => warn!("Reminder for {} failed: {e}", attendee.email),
        }
    }

    let sent = records.len();
    if let Err(e) = store.record_notifications(records).await {
        warn!("Could not record {sent} reminder notifications: {e}");
    }
    sent
}

/// Polls the queue every `every` until torn down.
pub fn spawn_dispatcher(
    queue: Arc<dyn ReminderQueue>,
    notifier: Arc<Notifier>,
    store: Arc<dyn SubmissionStore>,
    every: Duration,
) -> TaskHandle {
    TaskHandle::spawn("reminder dispatcher", move |mut shutdown| async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            rocket::tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    let sent = dispatch_due(queue.as_ref(), &notifier, store.as_ref(), Utc::now()).await;
                    if sent > 0 {
                        info!("Sent {sent} reminders");
                    }
                }
            }
        }
    })
}
