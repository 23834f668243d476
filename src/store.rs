//! Persistence client for the submissions table.
//!
//! The unique index on `submissions.email` is the real duplicate guard.
//! [`SubmissionStore::find_by_email`] only lets the flow answer with a
//! friendlier message before the insert would hit that index.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use rand::{distributions::Alphanumeric, Rng};
use rocket::serde::json;
use rocket::tokio::time::timeout;
use rocket_db_pools::deadpool_redis;
use rocket_db_pools::deadpool_redis::redis::AsyncCommands;
use rocket_db_pools::diesel::prelude::*;
use rocket_db_pools::diesel::{MysqlPool, RunQueryDsl};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::models::{NewSubmission, NotificationRecord, Submission};

/// Redis channel carrying every inserted row as JSON.
pub const INSERT_CHANNEL: &str = "rsvp_submissions";

const ID_LEN: usize = 12;
const ID_ATTEMPTS: usize = 3;

#[rocket::async_trait]
pub trait SubmissionStore: Send + Sync {
    /// `Ok(None)` when no row has this email.
    async fn find_by_email(&self, email: &str) -> Result<Option<Submission>, StoreError>;

    /// Fails with [`StoreError::DuplicateKey`] when the email is already taken.
    async fn insert(&self, new: NewSubmission) -> Result<Submission, StoreError>;

    /// Every submission, newest first.
    async fn list_all(&self) -> Result<Vec<Submission>, StoreError>;

    async fn record_notifications(&self, records: Vec<NotificationRecord>) -> Result<(), StoreError>;
}

pub fn generate_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ID_LEN)
        .map(char::from)
        .collect::<String>()
        .to_ascii_uppercase()
}

pub struct MysqlStore {
    pool: MysqlPool,
    feed: Option<deadpool_redis::Pool>,
    timeout: Duration,
}

impl MysqlStore {
    pub fn new(pool: MysqlPool, feed: Option<deadpool_redis::Pool>, timeout: Duration) -> Self {
        Self { pool, feed, timeout }
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>> + Send,
    {
        timeout(self.timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?
    }

    async fn publish_insert(&self, submission: &Submission) {
        let Some(feed) = &self.feed else {
            return;
        };

        let payload = match json::to_string(submission) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Could not encode submission {} for the feed: {e}", submission.id);
                return;
            }
        };

        let published = self
            .bounded(async {
                let mut conn = feed
                    .get()
                    .await
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                let receivers: i64 = conn.publish(INSERT_CHANNEL, payload).await?;
                Ok(receivers)
            })
            .await;

        match published {
            Ok(receivers) => debug!("Published submission {} to {receivers} watchers", submission.id),
            Err(e) => warn!("Could not publish submission {}: {e}", submission.id),
        }
    }
}

#[rocket::async_trait]
impl SubmissionStore for MysqlStore {
    async fn find_by_email(&self, address: &str) -> Result<Option<Submission>, StoreError> {
        use crate::schema::submissions::dsl::*;

        self.bounded(async {
            let mut conn = self
                .pool
                .get()
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;

            let found = submissions
                .filter(email.eq(address))
                .select(Submission::as_select())
                .first(&mut conn)
                .await
                .optional()?;
            Ok(found)
        })
        .await
    }

    async fn insert(&self, new: NewSubmission) -> Result<Submission, StoreError> {
        use crate::schema::submissions::dsl::*;
        use diesel::result::{DatabaseErrorKind, Error};

        let created = self
            .bounded(async {
                let mut conn = self
                    .pool
                    .get()
                    .await
                    .map_err(|e| StoreError::Backend(e.to_string()))?;

                let mut attempt = 0;
                loop {
                    attempt += 1;
                    let row = new
                        .clone()
                        .into_submission(generate_id(), Utc::now().naive_utc());

                    match diesel::insert_into(submissions)
                        .values(&row)
                        .execute(&mut conn)
                        .await
                    {
                        Ok(_) => return Ok(row),
                        // An id collision, not an email one: draw a new code.
                        Err(Error::DatabaseError(DatabaseErrorKind::UniqueViolation, info))
                            if info.message().contains("PRIMARY") && attempt < ID_ATTEMPTS =>
                        {
                            debug!("Submission id {} already taken, retrying", row.id);
                        }
                        Err(e) => return Err(StoreError::from(e)),
                    }
                }
            })
            .await?;

        self.publish_insert(&created).await;
        Ok(created)
    }

    async fn list_all(&self) -> Result<Vec<Submission>, StoreError> {
        use crate::schema::submissions::dsl::*;

        self.bounded(async {
            let mut conn = self
                .pool
                .get()
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;

            let rows = submissions
                .order(created_at.desc())
                .select(Submission::as_select())
                .load(&mut conn)
                .await?;
            Ok(rows)
        })
        .await
    }

    async fn record_notifications(&self, records: Vec<NotificationRecord>) -> Result<(), StoreError> {
        use crate::schema::notifications::dsl::*;

        if records.is_empty() {
            return Ok(());
        }

        self.bounded(async {
            let mut conn = self
                .pool
                .get()
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;

            diesel::insert_into(notifications)
                .values(&records)
                .execute(&mut conn)
                .await?;
            Ok(())
        })
        .await
    }
}
