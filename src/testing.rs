//! In-memory stand-ins for the store, the mail relay and the reminder queue.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use rocket::tokio::time::sleep;
use rocket_db_pools::deadpool_redis;

use crate::error::{NotificationError, StoreError};
use crate::models::{Attendee, NewSubmission, NotificationRecord, RsvpForm, Submission};
use crate::notify::{Mailer, Notifier, Operator, OutgoingEmail};
use crate::reminders::ReminderQueue;
use crate::store::{generate_id, SubmissionStore};

pub fn jane_form() -> RsvpForm {
    RsvpForm {
        first_name: "Jane".into(),
        last_name: "Doe".into(),
        email: "jane@example.com".into(),
        phone: "+61412345678".into(),
        ..RsvpForm::default()
    }
}

pub fn attendee(first_name: &str, email: &str) -> Attendee {
    Attendee {
        first_name: first_name.into(),
        last_name: "Doe".into(),
        email: email.into(),
        phone: Some("+61412345678".into()),
        preferred_date: None,
    }
}

pub fn submission(first_name: &str, email: &str, created: &str) -> Submission {
    let created = NaiveDate::parse_from_str(created, "%Y-%m-%d")
        .expect("test date")
        .and_hms_opt(10, 30, 0)
        .expect("test time");

    NewSubmission {
        first_name: first_name.into(),
        last_name: "Doe".into(),
        email: email.into(),
        phone: "+61412345678".into(),
        plus_one: false,
        plus_one_name: None,
        dietary_restrictions: None,
        preferred_date: None,
    }
    .into_submission(generate_id(), created)
}

/// A Redis pool whose every connection attempt is refused.
pub fn unreachable_redis() -> deadpool_redis::Pool {
    deadpool_redis::Config::from_url("redis://127.0.0.1:1/")
        .create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .expect("redis pool")
}

pub fn notifier(mailer: &RecordingMailer) -> Notifier {
    Notifier::new(
        Some(Arc::new(mailer.clone())),
        "Graduation",
        "August 2, 2025",
        Some(Operator {
            name: "Admin".into(),
            email: "admin@example.com".into(),
        }),
        Duration::from_secs(1),
    )
}

#[derive(Clone, Default)]
pub struct RecordingMailer {
    sent: Arc<Mutex<Vec<OutgoingEmail>>>,
    attempts: Arc<AtomicUsize>,
    failing: Arc<HashSet<String>>,
    stalling: Arc<HashSet<String>>,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_for(recipients: &[&str]) -> Self {
        Self {
            failing: Arc::new(recipients.iter().map(|r| r.to_string()).collect()),
            ..Self::default()
        }
    }

    /// Sends to these recipients hang until the caller gives up.
    pub fn stalling_for(recipients: &[&str]) -> Self {
        Self {
            stalling: Arc::new(recipients.iter().map(|r| r.to_string()).collect()),
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent.lock().expect("mailer lock").clone()
    }

    pub fn sent_to(&self, address: &str) -> usize {
        self.sent().iter().filter(|e| e.to_email == address).count()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Waits for detached sends to reach the mailer.
    pub async fn wait_for_attempts(&self, attempts: usize) {
        for _ in 0..200 {
            if self.attempts() >= attempts {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {attempts} sends, saw {}", self.attempts());
    }
}

#[rocket::async_trait]
impl Mailer for RecordingMailer {
    async fn deliver(&self, email: &OutgoingEmail) -> Result<(), NotificationError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.stalling.contains(&email.to_email) {
            sleep(Duration::from_secs(60)).await;
        }
        if self.failing.contains(&email.to_email) {
            return Err(NotificationError::Transport("relay refused".into()));
        }
        self.sent.lock().expect("mailer lock").push(email.clone());
        Ok(())
    }
}

/// Enforces the unique email index the way MySQL does.
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<Vec<Submission>>,
    records: Mutex<Vec<NotificationRecord>>,
    calls: AtomicUsize,
    /// Lookups always miss, as if another request inserted in between.
    pub blind_lookup: bool,
    pub fail_lookup: bool,
    pub fail_insert: bool,
    pub fail_list: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: Vec<Submission>) -> Self {
        Self {
            rows: Mutex::new(rows),
            ..Self::default()
        }
    }

    pub fn rows(&self) -> Vec<Submission> {
        self.rows.lock().expect("store lock").clone()
    }

    pub fn records(&self) -> Vec<NotificationRecord> {
        self.records.lock().expect("store lock").clone()
    }

    /// Number of store operations made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[rocket::async_trait]
impl SubmissionStore for MemoryStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<Submission>, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_lookup {
            return Err(StoreError::Backend("connection refused".into()));
        }
        if self.blind_lookup {
            return Ok(None);
        }
        Ok(self.rows().into_iter().find(|row| row.email == email))
    }

    async fn insert(&self, new: NewSubmission) -> Result<Submission, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_insert {
            return Err(StoreError::Timeout(Duration::from_secs(10)));
        }

        let mut rows = self.rows.lock().expect("store lock");
        if rows.iter().any(|row| row.email == new.email) {
            return Err(StoreError::DuplicateKey);
        }
        let row = new.into_submission(generate_id(), Utc::now().naive_utc());
        rows.push(row.clone());
        Ok(row)
    }

    async fn list_all(&self) -> Result<Vec<Submission>, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_list {
            return Err(StoreError::Backend("connection refused".into()));
        }
        let mut rows = self.rows();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn record_notifications(&self, records: Vec<NotificationRecord>) -> Result<(), StoreError> {
        self.records.lock().expect("store lock").extend(records);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryReminders {
    entries: Mutex<Vec<(DateTime<Utc>, Attendee)>>,
    pub fail: bool,
}

impl MemoryReminders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scheduled(&self) -> Vec<(DateTime<Utc>, Attendee)> {
        self.entries.lock().expect("queue lock").clone()
    }
}

#[rocket::async_trait]
impl ReminderQueue for MemoryReminders {
    async fn schedule(&self, attendee: &Attendee, due: DateTime<Utc>) -> Result<(), StoreError> {
        if self.fail {
            return Err(StoreError::Backend("redis down".into()));
        }
        self.entries
            .lock()
            .expect("queue lock")
            .push((due, attendee.clone()));
        Ok(())
    }

    async fn take_due(&self, now: DateTime<Utc>) -> Result<Vec<Attendee>, StoreError> {
        let mut entries = self.entries.lock().expect("queue lock");
        let (due, pending): (Vec<_>, Vec<_>) = entries.drain(..).partition(|(at, _)| *at <= now);
        *entries = pending;
        Ok(due.into_iter().map(|(_, attendee)| attendee).collect())
    }
}
