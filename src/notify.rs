//! Transactional email.
//!
//! Every send reports a [`SendOutcome`] instead of an error: a record that
//! was saved stays saved even when its email could not go out. The SMTP
//! settings are checked once, all together, when the [`Notifier`] is built;
//! if any is missing every send answers [`SendOutcome::NotConfigured`].

use std::sync::Arc;
use std::time::Duration;

use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use rocket::futures::future::join_all;
use rocket::tokio::time::timeout;
use tracing::{error, info, warn};

use crate::config::{AppConfig, SmtpSettings};
use crate::error::NotificationError;
use crate::models::Attendee;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub to_name: Option<String>,
    pub to_email: String,
    pub subject: String,
    pub body: String,
}

#[rocket::async_trait]
pub trait Mailer: Send + Sync {
    async fn deliver(&self, email: &OutgoingEmail) -> Result<(), NotificationError>;
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(settings: &SmtpSettings) -> Result<Self, NotificationError> {
        let creds = Credentials::new(settings.username.clone(), settings.password.clone());

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.relay)
            .map_err(|e| NotificationError::Transport(e.to_string()))?
            .credentials(creds)
            .build();

        let from = settings
            .from
            .parse()
            .map_err(|_| NotificationError::Address(settings.from.clone()))?;

        Ok(Self { transport, from })
    }
}

#[rocket::async_trait]
impl Mailer for SmtpMailer {
    async fn deliver(&self, email: &OutgoingEmail) -> Result<(), NotificationError> {
        let address: Address = email
            .to_email
            .parse()
            .map_err(|_| NotificationError::Address(email.to_email.clone()))?;

        let message = Message::builder()
            .from(self.from.clone())
            .reply_to(self.from.clone())
            .to(Mailbox::new(email.to_name.clone(), address))
            .subject(email.subject.as_str())
            .header(ContentType::TEXT_PLAIN)
            .body(email.body.clone())
            .map_err(|e| NotificationError::Message(e.to_string()))?;

        self.transport
            .send(message)
            .await
            .map_err(|e| NotificationError::Transport(e.to_string()))?;

        Ok(())
    }
}

/// What a single send came to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    NotConfigured,
    Failed(NotificationError),
}

impl SendOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, SendOutcome::Sent)
    }

    pub fn error(&self) -> Option<String> {
        match self {
            SendOutcome::Sent => None,
            SendOutcome::NotConfigured => Some(NotificationError::NotConfigured.to_string()),
            SendOutcome::Failed(e) => Some(e.to_string()),
        }
    }
}

/// Result of a fan-out send. Success means every recipient was reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkOutcome {
    NotConfigured,
    Completed { sent: Vec<String>, failed: Vec<String> },
}

impl BulkOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, BulkOutcome::Completed { failed, .. } if failed.is_empty())
    }
}

/// The email kinds the service sends. Each one fills the same parameter
/// set: recipient name and address, a free-text message and the event date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailTemplate {
    Confirmation,
    Reminder,
    AdminAlert,
    Bulk,
}

#[derive(Debug, Clone)]
pub struct TemplateParams {
    pub to_name: Option<String>,
    pub to_email: String,
    pub message: String,
    pub event_date: String,
}

impl EmailTemplate {
    fn render(self, event_name: &str, subject: Option<&str>, params: TemplateParams) -> OutgoingEmail {
        let subject = match self {
            EmailTemplate::Confirmation => format!("Your RSVP for {event_name} is confirmed"),
            EmailTemplate::Reminder => format!("Reminder: {event_name} is coming up"),
            EmailTemplate::AdminAlert => format!("New RSVP for {event_name}"),
            EmailTemplate::Bulk => subject.unwrap_or(event_name).to_string(),
        };

        let greeting = match &params.to_name {
            Some(name) => format!("Hi {name},\n\n"),
            None => String::new(),
        };

        let body = format!(
            "{greeting}{}\n\nEvent: {event_name}\nDate: {}\n",
            params.message, params.event_date
        );

        OutgoingEmail {
            to_name: params.to_name,
            to_email: params.to_email,
            subject,
            body,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Operator {
    pub name: String,
    pub email: String,
}

pub struct Notifier {
    mailer: Option<Arc<dyn Mailer>>,
    event_name: String,
    event_date: String,
    admin: Option<Operator>,
    timeout: Duration,
}

impl Notifier {
    pub fn new(
        mailer: Option<Arc<dyn Mailer>>,
        event_name: impl Into<String>,
        event_date: impl Into<String>,
        admin: Option<Operator>,
        timeout: Duration,
    ) -> Self {
        Self {
            mailer,
            event_name: event_name.into(),
            event_date: event_date.into(),
            admin,
            timeout,
        }
    }

    /// Builds the SMTP-backed notifier, or an unconfigured one when the
    /// provider settings fail the gate.
    pub fn from_config(config: &AppConfig) -> Self {
        let mailer: Option<Arc<dyn Mailer>> = match config.smtp.settings() {
            Ok(settings) => match SmtpMailer::new(&settings) {
                Ok(mailer) => {
                    info!("Email enabled through {}", settings.relay);
                    Some(Arc::new(mailer))
                }
                Err(e) => {
                    error!("Email disabled, could not build SMTP transport: {e}");
                    None
                }
            },
            Err(missing) => {
                warn!("Email disabled, missing settings: {}", missing.join(", "));
                None
            }
        };

        let admin = config.admin_address().map(|email| Operator {
            name: config.admin_name.clone(),
            email: email.to_string(),
        });
        if admin.is_none() {
            warn!("admin_email not set, new RSVP alerts are disabled");
        }

        Self::new(
            mailer,
            config.event_name.clone(),
            config.event_date_label(),
            admin,
            config.call_timeout(),
        )
    }

    pub fn is_configured(&self) -> bool {
        self.mailer.is_some()
    }

    async fn send(&self, email: OutgoingEmail) -> SendOutcome {
        let Some(mailer) = &self.mailer else {
            return SendOutcome::NotConfigured;
        };

        match timeout(self.timeout, mailer.deliver(&email)).await {
            Ok(Ok(())) => {
                info!("Email \"{}\" sent to {}", email.subject, email.to_email);
                SendOutcome::Sent
            }
            Ok(Err(e)) => {
                error!("Could not send email to {}: {e}", email.to_email);
                SendOutcome::Failed(e)
            }
            Err(_) => {
                error!("Email to {} timed out", email.to_email);
                SendOutcome::Failed(NotificationError::Timeout(self.timeout))
            }
        }
    }

    fn attendee_date(&self, attendee: &Attendee) -> String {
        attendee
            .preferred_date
            .map(|date| date.format("%B %-d, %Y").to_string())
            .unwrap_or_else(|| self.event_date.clone())
    }

    pub async fn send_confirmation(&self, attendee: &Attendee) -> SendOutcome {
        let params = TemplateParams {
            to_name: Some(attendee.full_name()),
            to_email: attendee.email.clone(),
            message: format!(
                "Thank you for RSVPing to {}! We'll keep you updated with all the details.",
                self.event_name
            ),
            event_date: self.attendee_date(attendee),
        };
        self.send(EmailTemplate::Confirmation.render(&self.event_name, None, params))
            .await
    }

    pub async fn send_reminder(&self, attendee: &Attendee) -> SendOutcome {
        let params = TemplateParams {
            to_name: Some(attendee.full_name()),
            to_email: attendee.email.clone(),
            message: format!(
                "This is a friendly reminder that {} is coming up! Please mark your calendar and arrive on time.",
                self.event_name
            ),
            event_date: self.attendee_date(attendee),
        };
        self.send(EmailTemplate::Reminder.render(&self.event_name, None, params))
            .await
    }

    pub async fn send_admin_notification(&self, attendee: &Attendee) -> SendOutcome {
        if self.mailer.is_none() {
            return SendOutcome::NotConfigured;
        }
        let Some(admin) = &self.admin else {
            return SendOutcome::NotConfigured;
        };

        let phone = attendee
            .phone
            .as_deref()
            .map(|phone| format!(" - Phone: {phone}"))
            .unwrap_or_default();

        let params = TemplateParams {
            to_name: Some(admin.name.clone()),
            to_email: admin.email.clone(),
            message: format!(
                "New RSVP received from {} ({}){phone}. Total RSVPs can be viewed in the admin dashboard.",
                attendee.full_name(),
                attendee.email
            ),
            event_date: self.event_date.clone(),
        };
        self.send(EmailTemplate::AdminAlert.render(&self.event_name, None, params))
            .await
    }

    /// Sends the same notice to every recipient concurrently.
    pub async fn send_bulk_notification(
        &self,
        recipients: &[String],
        subject: &str,
        body: &str,
    ) -> BulkOutcome {
        if self.mailer.is_none() {
            warn!("Email not configured, skipping bulk notice to {} recipients", recipients.len());
            return BulkOutcome::NotConfigured;
        }

        let sends = recipients.iter().map(|recipient| {
            let params = TemplateParams {
                to_name: None,
                to_email: recipient.clone(),
                message: body.to_string(),
                event_date: self.event_date.clone(),
            };
            let email = EmailTemplate::Bulk.render(&self.event_name, Some(subject), params);
            async move { (recipient, self.send(email).await) }
        });

        let (sent, failed): (Vec<_>, Vec<_>) = join_all(sends)
            .await
            .into_iter()
            .partition(|(_, outcome)| outcome.is_sent());

        let sent: Vec<String> = sent.into_iter().map(|(r, _)| r.clone()).collect();
        let failed: Vec<String> = failed.into_iter().map(|(r, _)| r.clone()).collect();

        if !failed.is_empty() {
            warn!("Bulk notice failed for {} of {} recipients", failed.len(), recipients.len());
        }

        BulkOutcome::Completed { sent, failed }
    }
}
