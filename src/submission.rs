//! The public RSVP flow.
//!
//! ```text
//! Idle -> Validating -> CheckingDuplicate -> Persisting -> Notifying -> Done
//! ```
//!
//! Every stage can exit straight to `Done`. Only a failed store call is an
//! error the visitor sees; email trouble downgrades the success message but
//! never undoes the saved row.

use std::sync::Arc;

use chrono::{NaiveDateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::models::{Attendee, NewSubmission, RsvpForm, Submission};
use crate::notify::{Notifier, SendOutcome};
use crate::reminders::{ReminderPolicy, ReminderQueue};
use crate::store::SubmissionStore;
use crate::validation::{self, normalize_email, FieldErrors};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Validating,
    CheckingDuplicate,
    Persisting,
    Notifying,
    Done,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionOutcome {
    Invalid(FieldErrors),
    /// The email already has an RSVP. `submitted_at` is unknown only when
    /// the insert lost a race and the winning row could not be read back.
    AlreadySubmitted { submitted_at: Option<NaiveDateTime> },
    Failed(StoreError),
    Accepted {
        submission: Submission,
        confirmation: SendOutcome,
    },
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Success,
    Info,
    Error,
}

/// The message shown above the form after a submit.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub text: String,
}

impl SubmissionOutcome {
    pub fn notice(&self) -> Notice {
        let (level, text) = match self {
            SubmissionOutcome::Invalid(_) => (
                NoticeLevel::Error,
                "Please correct the highlighted fields and try again.".to_string(),
            ),
            SubmissionOutcome::AlreadySubmitted {
                submitted_at: Some(at),
            } => (
                NoticeLevel::Info,
                format!("You have already RSVP'd on {}.", at.format("%B %-d, %Y")),
            ),
            SubmissionOutcome::AlreadySubmitted { submitted_at: None } => {
                (NoticeLevel::Info, "You have already RSVP'd.".to_string())
            }
            SubmissionOutcome::Failed(_) => (
                NoticeLevel::Error,
                "There was an error submitting your RSVP. Please try again.".to_string(),
            ),
            SubmissionOutcome::Accepted { confirmation, .. } => match confirmation {
                SendOutcome::Sent => (
                    NoticeLevel::Success,
                    "Thank you for your RSVP! You will receive a confirmation email shortly."
                        .to_string(),
                ),
                SendOutcome::NotConfigured => (
                    NoticeLevel::Success,
                    "Thank you for your RSVP! Your response has been recorded.".to_string(),
                ),
                SendOutcome::Failed(_) => (
                    NoticeLevel::Success,
                    "RSVP submitted successfully, but there was an issue sending the confirmation email."
                        .to_string(),
                ),
            },
        };
        Notice { level, text }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SubmissionOutcome::Accepted { .. })
    }

    /// The form is emptied only after a successful RSVP.
    pub fn clears_form(&self) -> bool {
        self.is_success()
    }

    pub fn field_errors(&self) -> Option<&FieldErrors> {
        match self {
            SubmissionOutcome::Invalid(errors) => Some(errors),
            _ => None,
        }
    }
}

pub struct SubmissionFlow {
    store: Arc<dyn SubmissionStore>,
    notifier: Arc<Notifier>,
    reminders: Option<Arc<dyn ReminderQueue>>,
    policy: ReminderPolicy,
}

/// Tracks one run through the stages.
struct Run {
    stage: Stage,
}

impl Run {
    fn advance(&mut self, next: Stage) {
        debug!("RSVP {:?} -> {:?}", self.stage, next);
        self.stage = next;
    }

    fn finish(&mut self, outcome: SubmissionOutcome) -> SubmissionOutcome {
        self.advance(Stage::Done);
        outcome
    }
}

impl SubmissionFlow {
    pub fn new(
        store: Arc<dyn SubmissionStore>,
        notifier: Arc<Notifier>,
        reminders: Option<Arc<dyn ReminderQueue>>,
        policy: ReminderPolicy,
    ) -> Self {
        Self {
            store,
            notifier,
            reminders,
            policy,
        }
    }

    pub async fn submit(&self, form: &RsvpForm) -> SubmissionOutcome {
        let mut run = Run { stage: Stage::Idle };

        run.advance(Stage::Validating);
        let errors = validation::validate(form);
        if !errors.is_empty() {
            debug!("RSVP rejected with {} field errors", errors.len());
            return run.finish(SubmissionOutcome::Invalid(errors));
        }

        run.advance(Stage::CheckingDuplicate);
        let email = normalize_email(&form.email);
        match self.store.find_by_email(&email).await {
            Ok(Some(existing)) => {
                info!("Duplicate RSVP for {email}, first submitted {}", existing.created_at);
                return run.finish(SubmissionOutcome::AlreadySubmitted {
                    submitted_at: Some(existing.created_at),
                });
            }
            Ok(None) => {}
            Err(e) => {
                error!("Duplicate check for {email} failed: {e}");
                return run.finish(SubmissionOutcome::Failed(e));
            }
        }

        run.advance(Stage::Persisting);
        let submission = match self.store.insert(NewSubmission::from_form(form)).await {
            Ok(submission) => submission,
            Err(StoreError::DuplicateKey) => {
                info!("RSVP for {email} lost an insert race");
                let submitted_at = match self.store.find_by_email(&email).await {
                    Ok(existing) => existing.map(|row| row.created_at),
                    Err(e) => {
                        warn!("Could not read back the existing RSVP for {email}: {e}");
                        None
                    }
                };
                return run.finish(SubmissionOutcome::AlreadySubmitted { submitted_at });
            }
            Err(e) => {
                error!("Could not save RSVP for {email}: {e}");
                return run.finish(SubmissionOutcome::Failed(e));
            }
        };
        info!("Saved RSVP {} for {email}", submission.id);

        run.advance(Stage::Notifying);
        let attendee = Attendee::from(&submission);
        self.alert_admin(&submission.id, &attendee);
        let confirmation = self.notifier.send_confirmation(&attendee).await;
        if let Some(e) = confirmation.error() {
            warn!("Confirmation for {} not sent: {e}", submission.id);
        }

        self.schedule_reminder(&attendee).await;

        run.finish(SubmissionOutcome::Accepted {
            submission,
            confirmation,
        })
    }

    /// Runs beside the confirmation without holding up the visitor's response.
    fn alert_admin(&self, id: &str, attendee: &Attendee) {
        let notifier = self.notifier.clone();
        let (id, attendee) = (id.to_string(), attendee.clone());
        rocket::tokio::spawn(async move {
            if let Some(e) = notifier.send_admin_notification(&attendee).await.error() {
                warn!("Admin alert for {id} not sent: {e}");
            }
        });
    }

    async fn schedule_reminder(&self, attendee: &Attendee) {
        let Some(queue) = &self.reminders else {
            return;
        };
        let Some(due) = self.policy.due_at(Utc::now()) else {
            debug!("No reminder for {}, event date unset or passed", attendee.email);
            return;
        };
        if let Err(e) = queue.schedule(attendee, due).await {
            warn!("Could not schedule reminder for {}: {e}", attendee.email);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::Notifier;
    use crate::testing::{jane_form, notifier, MemoryReminders, MemoryStore, RecordingMailer};
    use crate::validation::Field;
    use chrono::NaiveDate;
    use std::time::Duration;

    fn far_future_policy() -> ReminderPolicy {
        ReminderPolicy {
            event_at: NaiveDate::from_ymd_opt(2100, 1, 1).and_then(|d| d.and_hms_opt(9, 0, 0)),
            lead: chrono::Duration::hours(24),
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        mailer: RecordingMailer,
        reminders: Arc<MemoryReminders>,
        flow: SubmissionFlow,
    }

    fn harness(store: MemoryStore, mailer: RecordingMailer) -> Harness {
        let store = Arc::new(store);
        let reminders = Arc::new(MemoryReminders::new());
        let flow = SubmissionFlow::new(
            store.clone(),
            Arc::new(notifier(&mailer)),
            Some(reminders.clone()),
            far_future_policy(),
        );
        Harness {
            store,
            mailer,
            reminders,
            flow,
        }
    }

    #[rocket::async_test]
    async fn jane_is_saved_confirmed_and_announced() {
        let h = harness(MemoryStore::new(), RecordingMailer::new());

        let outcome = h.flow.submit(&jane_form()).await;

        assert!(outcome.is_success());
        assert!(outcome.clears_form());
        assert_eq!(outcome.notice().level, NoticeLevel::Success);
        assert!(outcome.notice().text.contains("confirmation email shortly"));

        let rows = h.store.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].email, "jane@example.com");
        h.mailer.wait_for_attempts(2).await;
        assert_eq!(h.mailer.sent_to("jane@example.com"), 1);
        assert_eq!(h.mailer.sent_to("admin@example.com"), 1);
    }

    #[rocket::async_test]
    async fn slow_admin_alert_does_not_hold_the_response() {
        let h = harness(
            MemoryStore::new(),
            RecordingMailer::stalling_for(&["admin@example.com"]),
        );

        let outcome = rocket::tokio::time::timeout(
            Duration::from_millis(500),
            h.flow.submit(&jane_form()),
        )
        .await
        .expect("answered before the admin alert resolved");

        assert!(outcome.is_success());
        assert!(outcome.notice().text.contains("confirmation email shortly"));
        assert_eq!(h.mailer.sent_to("jane@example.com"), 1);
    }

    #[rocket::async_test]
    async fn second_submit_is_informational_and_stores_nothing() {
        let h = harness(MemoryStore::new(), RecordingMailer::new());

        let first = h.flow.submit(&jane_form()).await;
        let created = match &first {
            SubmissionOutcome::Accepted { submission, .. } => submission.created_at,
            other => panic!("unexpected {other:?}"),
        };

        let mut again = jane_form();
        again.email = "  JANE@example.com ".into();
        let second = h.flow.submit(&again).await;

        assert_eq!(
            second,
            SubmissionOutcome::AlreadySubmitted {
                submitted_at: Some(created)
            }
        );
        assert_eq!(second.notice().level, NoticeLevel::Info);
        assert_eq!(
            second.notice().text,
            format!("You have already RSVP'd on {}.", created.format("%B %-d, %Y"))
        );
        assert!(!second.clears_form());
        assert_eq!(h.store.rows().len(), 1);
        assert_eq!(h.mailer.sent_to("jane@example.com"), 1);
    }

    #[rocket::async_test]
    async fn invalid_input_never_reaches_store_or_mailer() {
        let h = harness(MemoryStore::new(), RecordingMailer::new());
        let bad_forms = [
            RsvpForm { first_name: "".into(), ..jane_form() },
            RsvpForm { last_name: "D4ve".into(), ..jane_form() },
            RsvpForm { email: "jane@".into(), ..jane_form() },
            RsvpForm { phone: "555-1234".into(), ..jane_form() },
        ];

        for form in &bad_forms {
            let outcome = h.flow.submit(form).await;
            assert!(matches!(outcome, SubmissionOutcome::Invalid(_)), "{form:?}");
            assert_eq!(outcome.notice().level, NoticeLevel::Error);
        }

        assert_eq!(h.store.calls(), 0);
        assert_eq!(h.mailer.attempts(), 0);
        assert!(h.reminders.scheduled().is_empty());
    }

    #[rocket::async_test]
    async fn all_field_errors_come_back_together() {
        let h = harness(MemoryStore::new(), RecordingMailer::new());
        let form = RsvpForm {
            first_name: "".into(),
            email: "nope".into(),
            ..jane_form()
        };

        let outcome = h.flow.submit(&form).await;
        let errors = outcome.field_errors().expect("invalid");
        assert_eq!(errors.len(), 2);
        assert!(errors.contains_key(&Field::FirstName));
        assert!(errors.contains_key(&Field::Email));
    }

    #[rocket::async_test]
    async fn lost_insert_race_reads_as_duplicate() {
        let existing = crate::testing::submission("Jane", "jane@example.com", "2025-07-01");
        let mut store = MemoryStore::with_rows(vec![existing]);
        store.blind_lookup = true;
        let h = harness(store, RecordingMailer::new());

        let outcome = h.flow.submit(&jane_form()).await;

        assert!(matches!(outcome, SubmissionOutcome::AlreadySubmitted { .. }));
        assert_eq!(outcome.notice().level, NoticeLevel::Info);
        assert_eq!(h.store.rows().len(), 1);
        assert_eq!(h.mailer.attempts(), 0);
    }

    #[rocket::async_test]
    async fn store_failure_is_a_generic_error() {
        let mut store = MemoryStore::new();
        store.fail_insert = true;
        let h = harness(store, RecordingMailer::new());

        let outcome = h.flow.submit(&jane_form()).await;

        assert!(matches!(outcome, SubmissionOutcome::Failed(StoreError::Timeout(_))));
        assert_eq!(
            outcome.notice().text,
            "There was an error submitting your RSVP. Please try again."
        );
        assert_eq!(h.mailer.attempts(), 0);
    }

    #[rocket::async_test]
    async fn lookup_failure_stops_before_insert() {
        let mut store = MemoryStore::new();
        store.fail_lookup = true;
        let h = harness(store, RecordingMailer::new());

        let outcome = h.flow.submit(&jane_form()).await;

        assert!(matches!(outcome, SubmissionOutcome::Failed(StoreError::Backend(_))));
        assert!(h.store.rows().is_empty());
    }

    #[rocket::async_test]
    async fn provider_failure_still_reports_success() {
        let h = harness(
            MemoryStore::new(),
            RecordingMailer::failing_for(&["jane@example.com", "admin@example.com"]),
        );

        let outcome = h.flow.submit(&jane_form()).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.notice().level, NoticeLevel::Success);
        assert!(outcome.notice().text.contains("issue sending the confirmation email"));
        assert_eq!(h.store.rows().len(), 1);
        h.mailer.wait_for_attempts(2).await;
        assert_eq!(h.mailer.attempts(), 2);
    }

    #[rocket::async_test]
    async fn unconfigured_email_gives_degraded_success() {
        let store = Arc::new(MemoryStore::new());
        let flow = SubmissionFlow::new(
            store.clone(),
            Arc::new(Notifier::new(None, "Gala", "TBD", None, Duration::from_secs(1))),
            None,
            far_future_policy(),
        );

        let outcome = flow.submit(&jane_form()).await;

        assert!(outcome.is_success());
        assert_eq!(
            outcome.notice().text,
            "Thank you for your RSVP! Your response has been recorded."
        );
        assert_eq!(store.rows().len(), 1);
    }

    #[rocket::async_test]
    async fn reminder_is_deferred_not_sent() {
        let h = harness(MemoryStore::new(), RecordingMailer::new());

        h.flow.submit(&jane_form()).await;

        let scheduled = h.reminders.scheduled();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].1.email, "jane@example.com");
        assert!(scheduled[0].0 > Utc::now());
        assert!(h
            .mailer
            .sent()
            .iter()
            .all(|email| !email.subject.starts_with("Reminder")));
    }

    #[rocket::async_test]
    async fn reminder_queue_failure_does_not_fail_the_rsvp() {
        let store = Arc::new(MemoryStore::new());
        let mut queue = MemoryReminders::new();
        queue.fail = true;
        let mailer = RecordingMailer::new();
        let flow = SubmissionFlow::new(
            store.clone(),
            Arc::new(notifier(&mailer)),
            Some(Arc::new(queue)),
            far_future_policy(),
        );

        assert!(flow.submit(&jane_form()).await.is_success());
    }
}
