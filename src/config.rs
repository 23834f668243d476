use std::env;
use std::time::Duration;

use chrono::NaiveDateTime;
use serde::Deserialize;
use tracing::{info, warn};

/// Application settings pulled from Rocket's figment (`Rocket.toml` plus
/// `ROCKET_*` environment variables).
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct AppConfig {
    pub event_name: String,
    #[serde(deserialize_with = "de::optional_datetime")]
    pub event_at: Option<NaiveDateTime>,
    pub admin_name: String,
    pub admin_email: Option<String>,
    pub call_timeout_secs: u64,
    pub reminder_lead_hours: i64,
    pub reminder_poll_secs: u64,
    pub throttle_limit: u32,
    pub realtime_alerts: bool,
    pub smtp: SmtpConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            event_name: "Graduation Ceremony".to_string(),
            event_at: None,
            admin_name: "Event Admin".to_string(),
            admin_email: None,
            call_timeout_secs: 10,
            reminder_lead_hours: 24,
            reminder_poll_secs: 60,
            throttle_limit: 20,
            realtime_alerts: false,
            smtp: SmtpConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs.max(1))
    }

    pub fn reminder_lead(&self) -> chrono::Duration {
        chrono::Duration::hours(self.reminder_lead_hours.max(0))
    }

    pub fn reminder_poll(&self) -> Duration {
        Duration::from_secs(self.reminder_poll_secs.max(1))
    }

    /// The operator address, unless it is missing or still a placeholder.
    pub fn admin_address(&self) -> Option<&str> {
        present(self.admin_email.as_deref())
    }

    /// Human readable event date for email bodies.
    pub fn event_date_label(&self) -> String {
        match self.event_at {
            Some(at) => at.format("%B %-d, %Y").to_string(),
            None => "TBD".to_string(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct SmtpConfig {
    pub relay: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: Option<String>,
}

/// SMTP settings that passed the configuration gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpSettings {
    pub relay: String,
    pub username: String,
    pub password: String,
    pub from: String,
}

impl SmtpConfig {
    /// Checks every provider setting together. Returns the names of the
    /// missing ones if any are absent or placeholders.
    pub fn settings(&self) -> Result<SmtpSettings, Vec<&'static str>> {
        let password = self.password.clone().or_else(|| var("SMTP_PASSWORD"));

        let fields = [
            ("smtp.relay", present(self.relay.as_deref())),
            ("smtp.username", present(self.username.as_deref())),
            ("smtp.password", present(password.as_deref())),
            ("smtp.from", present(self.from.as_deref())),
        ];

        let missing: Vec<&'static str> = fields
            .iter()
            .filter(|(_, value)| value.is_none())
            .map(|(key, _)| *key)
            .collect();

        match fields {
            [(_, Some(relay)), (_, Some(username)), (_, Some(password)), (_, Some(from))] => {
                Ok(SmtpSettings {
                    relay: relay.to_string(),
                    username: username.to_string(),
                    password: password.to_string(),
                    from: from.to_string(),
                })
            }
            _ => Err(missing),
        }
    }
}

fn var(key: &str) -> Option<String> {
    env::var(key)
        .map_err(|_| {
            info!("{key} not set");
        })
        .ok()
}

/// Treats empty strings and template placeholders as absent.
pub fn present(value: Option<&str>) -> Option<&str> {
    let value = value?.trim();
    if value.is_empty() || is_placeholder(value) {
        if !value.is_empty() {
            warn!("Ignoring placeholder setting value {value:?}");
        }
        return None;
    }
    Some(value)
}

fn is_placeholder(value: &str) -> bool {
    let lowered = value.to_ascii_lowercase();
    lowered.contains("placeholder") || lowered.starts_with("your_")
}

mod de {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer};

    pub fn optional_datetime<'de, D>(deserializer: D) -> Result<Option<NaiveDateTime>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(value) => NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S")
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}
