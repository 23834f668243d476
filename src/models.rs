use super::schema::{notifications, submissions};
use chrono::{NaiveDate, NaiveDateTime};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::validation::{normalize_email, normalize_phone, parse_preferred_date};

/// One attendee's RSVP row.
#[derive(Insertable, Selectable, Queryable, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[diesel(table_name = submissions)]
pub struct Submission {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    pub plus_one: bool,
    pub plus_one_name: Option<String>,
    pub dietary_restrictions: Option<String>,
    pub preferred_date: Option<NaiveDate>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Submission {
    pub fn has_dietary_note(&self) -> bool {
        self.dietary_restrictions
            .as_deref()
            .is_some_and(|note| !note.trim().is_empty())
    }
}

/// Raw form fields as posted by the public RSVP page.
#[derive(FromForm, Serialize, Debug, Clone, Default)]
pub struct RsvpForm {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    pub plus_one: bool,
    pub plus_one_name: Option<String>,
    pub dietary_restrictions: Option<String>,
    pub preferred_date: Option<String>,
}

/// A validated submission waiting for the store to assign its id and timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSubmission {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    pub plus_one: bool,
    pub plus_one_name: Option<String>,
    pub dietary_restrictions: Option<String>,
    pub preferred_date: Option<NaiveDate>,
}

impl NewSubmission {
    /// Normalises a form that already passed validation.
    pub fn from_form(form: &RsvpForm) -> Self {
        let plus_one_name = if form.plus_one {
            non_empty(form.plus_one_name.as_deref())
        } else {
            None
        };

        Self {
            first_name: form.first_name.trim().to_string(),
            last_name: form.last_name.trim().to_string(),
            email: normalize_email(&form.email),
            phone: normalize_phone(&form.phone),
            plus_one: form.plus_one,
            plus_one_name,
            dietary_restrictions: non_empty(form.dietary_restrictions.as_deref()),
            preferred_date: form
                .preferred_date
                .as_deref()
                .and_then(|date| parse_preferred_date(date).ok().flatten()),
        }
    }

    pub fn into_submission(self, id: String, now: NaiveDateTime) -> Submission {
        Submission {
            id,
            first_name: self.first_name,
            last_name: self.last_name,
            email: self.email,
            phone: self.phone,
            plus_one: self.plus_one,
            plus_one_name: self.plus_one_name,
            dietary_restrictions: self.dietary_restrictions,
            preferred_date: self.preferred_date,
            created_at: now,
            updated_at: now,
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// The fields every outgoing email needs about its recipient.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Attendee {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: Option<String>,
    pub preferred_date: Option<NaiveDate>,
}

impl Attendee {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

impl From<&Submission> for Attendee {
    fn from(submission: &Submission) -> Self {
        Self {
            first_name: submission.first_name.clone(),
            last_name: submission.last_name.clone(),
            email: submission.email.clone(),
            phone: Some(submission.phone.clone()).filter(|p| !p.is_empty()),
            preferred_date: submission.preferred_date,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Reminder,
    Update,
    General,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::Reminder => "reminder",
            NotificationKind::Update => "update",
            NotificationKind::General => "general",
        }
    }
}

#[derive(Insertable, Debug, Clone, PartialEq)]
#[diesel(table_name = notifications)]
pub struct NotificationRecord {
    pub email: String,
    pub kind: String,
    pub sent_at: NaiveDateTime,
}

impl NotificationRecord {
    pub fn new(email: &str, kind: NotificationKind, sent_at: NaiveDateTime) -> Self {
        Self {
            email: email.to_string(),
            kind: kind.as_str().to_string(),
            sent_at,
        }
    }
}
