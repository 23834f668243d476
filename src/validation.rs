//! Field rules for the public RSVP form.
//!
//! [`validate`] checks every field and reports all failures at once so the
//! page can highlight them together. [`validate_field`] re-checks a single
//! field when the visitor leaves it.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::models::RsvpForm;

static NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\p{L}\p{M} '’-]+$").expect("name pattern"));

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?)*\.[A-Za-z]{2,}$")
        .expect("email pattern")
});

static PHONE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+?[0-9]{7,15}$").expect("phone pattern"));

const MIN_PHONE_DIGITS: usize = 10;

// Column widths of the `submissions` table.
const MAX_NAME_LEN: usize = 100;
const MAX_EMAIL_LEN: usize = 254;
const MAX_NOTE_LEN: usize = 500;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    FirstName,
    LastName,
    Email,
    Phone,
    PreferredDate,
    PlusOneName,
    DietaryRestrictions,
}

impl Field {
    pub fn as_str(self) -> &'static str {
        match self {
            Field::FirstName => "first_name",
            Field::LastName => "last_name",
            Field::Email => "email",
            Field::Phone => "phone",
            Field::PreferredDate => "preferred_date",
            Field::PlusOneName => "plus_one_name",
            Field::DietaryRestrictions => "dietary_restrictions",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "first_name" => Some(Field::FirstName),
            "last_name" => Some(Field::LastName),
            "email" => Some(Field::Email),
            "phone" => Some(Field::Phone),
            "preferred_date" => Some(Field::PreferredDate),
            "plus_one_name" => Some(Field::PlusOneName),
            "dietary_restrictions" => Some(Field::DietaryRestrictions),
            _ => None,
        }
    }
}

/// Field name to message, empty when the form is valid.
pub type FieldErrors = BTreeMap<Field, String>;

pub fn validate(form: &RsvpForm) -> FieldErrors {
    // The guest name is discarded unless a plus one is coming.
    let plus_one_name = if form.plus_one {
        form.plus_one_name.as_deref().unwrap_or("")
    } else {
        ""
    };

    let checks = [
        (Field::FirstName, form.first_name.as_str()),
        (Field::LastName, form.last_name.as_str()),
        (Field::Email, form.email.as_str()),
        (Field::Phone, form.phone.as_str()),
        (Field::PreferredDate, form.preferred_date.as_deref().unwrap_or("")),
        (Field::PlusOneName, plus_one_name),
        (Field::DietaryRestrictions, form.dietary_restrictions.as_deref().unwrap_or("")),
    ];

    checks
        .into_iter()
        .filter_map(|(field, value)| validate_field(field, value).map(|msg| (field, msg)))
        .collect()
}

/// Checks one field, returning its error message if it fails.
pub fn validate_field(field: Field, value: &str) -> Option<String> {
    match field {
        Field::FirstName => check_name("First name", value),
        Field::LastName => check_name("Last name", value),
        Field::Email => check_email(value),
        Field::Phone => check_phone(value),
        Field::PreferredDate => parse_preferred_date(value).err(),
        Field::PlusOneName => check_length("Guest name", value, MAX_NAME_LEN),
        Field::DietaryRestrictions => check_length("Dietary restrictions", value, MAX_NOTE_LEN),
    }
}

fn check_length(label: &str, value: &str, max: usize) -> Option<String> {
    if value.trim().chars().count() > max {
        return Some(format!("{label} must be at most {max} characters"));
    }
    None
}

fn check_name(label: &str, value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        return Some(format!("{label} is required"));
    }
    if let Some(too_long) = check_length(label, value, MAX_NAME_LEN) {
        return Some(too_long);
    }
    if !NAME.is_match(value) {
        return Some(format!(
            "{label} can only contain letters, spaces, hyphens, and apostrophes"
        ));
    }
    None
}

fn check_email(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        return Some("Email is required".to_string());
    }
    if let Some(too_long) = check_length("Email", value, MAX_EMAIL_LEN) {
        return Some(too_long);
    }
    if !EMAIL.is_match(value) {
        return Some("Please enter a valid email address".to_string());
    }
    None
}

fn check_phone(value: &str) -> Option<String> {
    if value.trim().is_empty() {
        return Some("Phone number is required".to_string());
    }

    let normalized = normalize_phone(value);
    let digits = normalized.chars().filter(char::is_ascii_digit).count();
    if !PHONE.is_match(&normalized) || digits < MIN_PHONE_DIGITS {
        return Some("Please enter a valid phone number with at least 10 digits".to_string());
    }
    None
}

/// Keeps the digits and a leading `+`, dropping spaces, dashes and brackets.
pub fn normalize_phone(value: &str) -> String {
    let value = value.trim();
    let mut normalized = String::with_capacity(value.len());
    if value.starts_with('+') {
        normalized.push('+');
    }
    normalized.extend(value.chars().filter(char::is_ascii_digit));
    normalized
}

pub fn normalize_email(value: &str) -> String {
    value.trim().to_lowercase()
}

/// An empty value means no preference.
pub fn parse_preferred_date(value: &str) -> Result<Option<NaiveDate>, String> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map(Some)
        .map_err(|_| "Please enter a valid date".to_string())
}
