//! Admin dashboard: the loaded submissions, their counts, CSV export and
//! bulk notices.

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::models::{NotificationKind, NotificationRecord, Submission};
use crate::notify::{BulkOutcome, Notifier};
use crate::store::SubmissionStore;
use crate::submission::{Notice, NoticeLevel};

pub const CSV_HEADER: [&str; 9] = [
    "First Name",
    "Last Name",
    "Email",
    "Phone",
    "Graduation Date",
    "Plus One",
    "Plus One Name",
    "Dietary Restrictions",
    "Created At",
];

pub const CSV_FILENAME: &str = "event-rsvps.csv";

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub total: usize,
    pub plus_ones: usize,
    pub dietary: usize,
}

#[derive(Serialize, Debug, Clone, Default)]
pub struct Dashboard {
    pub submissions: Vec<Submission>,
    pub load_error: Option<String>,
}

impl Dashboard {
    /// Never fails: a store error leaves the list empty and sets `load_error`.
    pub async fn load(store: &dyn SubmissionStore) -> Self {
        match store.list_all().await {
            Ok(submissions) => Self {
                submissions,
                load_error: None,
            },
            Err(e) => {
                error!("Could not load submissions: {e}");
                Self {
                    submissions: Vec::new(),
                    load_error: Some("Failed to load RSVPs. Please refresh the page.".to_string()),
                }
            }
        }
    }

    pub fn stats(&self) -> Stats {
        Stats {
            total: self.submissions.len(),
            plus_ones: self.submissions.iter().filter(|s| s.plus_one).count(),
            dietary: self
                .submissions
                .iter()
                .filter(|s| s.has_dietary_note())
                .count(),
        }
    }

    pub fn recipients(&self) -> Vec<String> {
        self.submissions.iter().map(|s| s.email.clone()).collect()
    }

    /// One row per loaded submission under a fixed header. Fields holding
    /// commas, quotes or newlines are quoted.
    pub fn export_csv(&self) -> Result<Vec<u8>, csv::Error> {
        let mut writer = csv::WriterBuilder::new()
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(Vec::new());

        writer.write_record(CSV_HEADER)?;
        for s in &self.submissions {
            let preferred_date = s
                .preferred_date
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_default();
            let created_at = s.created_at.format("%Y-%m-%dT%H:%M:%S").to_string();

            writer.write_record([
                s.first_name.as_str(),
                s.last_name.as_str(),
                s.email.as_str(),
                s.phone.as_str(),
                preferred_date.as_str(),
                if s.plus_one { "Yes" } else { "No" },
                s.plus_one_name.as_deref().unwrap_or(""),
                s.dietary_restrictions.as_deref().unwrap_or(""),
                created_at.as_str(),
            ])?;
        }

        writer
            .into_inner()
            .map_err(|e| csv::Error::from(e.into_error()))
    }

    /// Sends the operator's notice to everyone loaded and records who got it.
    pub async fn send_bulk(
        &self,
        notifier: &Notifier,
        store: &dyn SubmissionStore,
        subject: &str,
        body: &str,
    ) -> Notice {
        let (subject, body) = (subject.trim(), body.trim());
        if subject.is_empty() || body.is_empty() {
            return notice(NoticeLevel::Error, "Please enter both a subject and a message.");
        }

        let recipients = self.recipients();
        if recipients.is_empty() {
            return notice(NoticeLevel::Info, "There are no RSVPs to notify yet.");
        }

        match notifier.send_bulk_notification(&recipients, subject, body).await {
            BulkOutcome::NotConfigured => notice(
                NoticeLevel::Error,
                "Email is not configured, so the notification could not be sent.",
            ),
            BulkOutcome::Completed { sent, failed } => {
                let now = Utc::now().naive_utc();
                let records: Vec<NotificationRecord> = sent
                    .iter()
                    .map(|email| NotificationRecord::new(email, NotificationKind::General, now))
                    .collect();
                if let Err(e) = store.record_notifications(records).await {
                    warn!("Could not record bulk notice deliveries: {e}");
                }

                info!("Bulk notice \"{subject}\" sent to {} of {}", sent.len(), recipients.len());
                if failed.is_empty() {
                    notice(
                        NoticeLevel::Success,
                        &format!("Notification sent successfully to {} recipients", sent.len()),
                    )
                } else {
                    notice(
                        NoticeLevel::Error,
                        &format!(
                            "Notification sent to {} of {} recipients. Failed: {}",
                            sent.len(),
                            recipients.len(),
                            failed.join(", ")
                        ),
                    )
                }
            }
        }
    }
}

fn notice(level: NoticeLevel, text: &str) -> Notice {
    Notice {
        level,
        text: text.to_string(),
    }
}
