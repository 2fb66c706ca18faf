use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::ApiError;
use crate::live::LiveHub;

#[derive(Clone)]
pub struct AppState {
    pub db: sqlx::PgPool,
    pub live: LiveHub,
    pub auth: Arc<AuthSettings>,
    pub webhook_secret: Option<Arc<str>>,
}

#[derive(Debug)]
pub struct AuthSettings {
    pub password_hash: Option<String>,
    pub disabled: bool,
    pub session_ttl_hours: i64,
    pub cookie_secure: bool,
}

/* -------------------------
   API envelopes
--------------------------*/

#[derive(Debug, Serialize)]
pub struct ApiOk<T> {
    pub data: T,
}

#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub data: OkData,
}

#[derive(Debug, Serialize)]
pub struct OkData {
    pub ok: bool,
}

impl OkResponse {
    pub fn ok() -> Self {
        OkResponse {
            data: OkData { ok: true },
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Paging {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl Paging {
    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(50).clamp(1, 200)
    }

    pub fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }
}

/* -------------------------
   Shared DB rows
--------------------------*/

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct PatientRow {
    pub patient_id: Uuid,
    pub clinic_id: Option<Uuid>,
    pub full_name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub age: Option<i32>,
    pub gender: String,
    pub status: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_contact_at: Option<DateTime<Utc>>,
}

pub const PATIENT_COLUMNS: &str = "patient_id, clinic_id, full_name, phone, email, age, gender, \
     status, source, created_at, updated_at, last_contact_at";

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct AssessmentRow {
    pub assessment_id: Uuid,
    pub patient_id: Uuid,
    pub clinic_id: Option<Uuid>,
    pub condition_id: Option<Uuid>,
    pub consultation_id: Option<Uuid>,
    pub external_session_id: Option<String>,
    pub risk_level: String,
    pub status: String,
    pub summary: Option<String>,
    pub flagged_count: i32,
    pub created_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

pub const ASSESSMENT_COLUMNS: &str = "assessment_id, patient_id, clinic_id, condition_id, \
     consultation_id, external_session_id, risk_level, status, summary, flagged_count, \
     created_at, reviewed_at";

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ResponseRow {
    pub response_id: Uuid,
    pub assessment_id: Uuid,
    pub question_id: Option<Uuid>,
    pub position: i32,
    pub question_text: String,
    pub answer_text: String,
    pub is_flagged: bool,
    pub flag_reason: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub review_note: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub const RESPONSE_COLUMNS: &str = "response_id, assessment_id, question_id, position, \
     question_text, answer_text, is_flagged, flag_reason, reviewed_at, review_note, created_at";

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct CommunicationRow {
    pub communication_id: Uuid,
    pub patient_id: Uuid,
    pub channel: String,
    pub direction: String,
    pub subject: Option<String>,
    pub body: String,
    pub staff_name: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

pub const COMMUNICATION_COLUMNS: &str = "communication_id, patient_id, channel, direction, \
     subject, body, staff_name, occurred_at, created_at";

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct FollowUpRow {
    pub follow_up_id: Uuid,
    pub patient_id: Uuid,
    pub assessment_id: Option<Uuid>,
    pub follow_up_type: String,
    pub scheduled_for: DateTime<Utc>,
    pub status: String,
    pub notes: Option<String>,
    pub assigned_to: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const FOLLOW_UP_COLUMNS: &str = "follow_up_id, patient_id, assessment_id, follow_up_type, \
     scheduled_for, status, notes, assigned_to, completed_at, created_at, updated_at";

/* -------------------------
   Enumerations stored as TEXT
--------------------------*/

pub const GENDERS: &[&str] = &["male", "female", "other", "unknown"];
pub const PATIENT_STATUSES: &[&str] = &["active", "archived"];
pub const RISK_LEVELS: &[&str] = &["low", "medium", "high"];
pub const ASSESSMENT_STATUSES: &[&str] = &["new", "in_review", "reviewed", "closed"];
pub const CHANNELS: &[&str] = &["sms", "email", "call", "whatsapp", "note"];
pub const DIRECTIONS: &[&str] = &["inbound", "outbound"];
pub const FOLLOW_UP_TYPES: &[&str] = &["appointment", "call", "check_in", "message"];
pub const FOLLOW_UP_STATUSES: &[&str] = &["scheduled", "completed", "cancelled", "missed"];

/// Lower-cases `value` and checks it against `allowed`, returning the canonical form.
pub fn one_of(field: &str, value: &str, allowed: &[&'static str]) -> Result<&'static str, ApiError> {
    let v = value.trim().to_lowercase();
    allowed
        .iter()
        .copied()
        .find(|a| *a == v)
        .ok_or_else(|| ApiError::validation(format!("{field} must be one of: {}", allowed.join(", "))))
}

/// Trim, and treat blank as absent.
pub fn clean(s: Option<&str>) -> Option<String> {
    s.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

/// `%keyword%` for a substring `ILIKE ... ESCAPE '\'`, with the pattern
/// metacharacters in `keyword` matched literally.
pub fn like_pattern(keyword: &str) -> String {
    let mut out = String::with_capacity(keyword.len() + 2);
    out.push('%');
    for c in keyword.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

pub fn deserialize_double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    // Only called when the field is present: null => Some(None), value => Some(Some(v)).
    let inner = Option::<T>::deserialize(deserializer)?;
    Ok(Some(inner))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("ann"), "%ann%");
        assert_eq!(like_pattern("100%"), "%100\\%%");
        assert_eq!(like_pattern("a_b"), "%a\\_b%");
        assert_eq!(like_pattern(r"c:\x"), r"%c:\\x%");
    }

    #[test]
    fn paging_is_clamped() {
        let p = Paging { limit: Some(10_000), offset: Some(-5) };
        assert_eq!(p.limit(), 200);
        assert_eq!(p.offset(), 0);
        let d = Paging { limit: None, offset: None };
        assert_eq!(d.limit(), 50);
        assert_eq!(d.offset(), 0);
        assert_eq!(Paging { limit: Some(0), offset: None }.limit(), 1);
    }

    #[test]
    fn one_of_canonicalizes_and_rejects() {
        assert_eq!(one_of("channel", " SMS ", CHANNELS).unwrap(), "sms");
        let err = one_of("risk_level", "extreme", RISK_LEVELS).unwrap_err();
        assert_eq!(
            err.to_string(),
            "VALIDATION_ERROR: risk_level must be one of: low, medium, high"
        );
    }

    #[test]
    fn clean_drops_blank_strings() {
        assert_eq!(clean(Some("  ")), None);
        assert_eq!(clean(Some(" x ")), Some("x".to_string()));
        assert_eq!(clean(None), None);
    }

    #[derive(Deserialize)]
    struct Patch {
        #[serde(default, deserialize_with = "deserialize_double_option")]
        email: Option<Option<String>>,
    }

    #[test]
    fn double_option_distinguishes_missing_from_null() {
        let missing: Patch = serde_json::from_str("{}").unwrap();
        let null: Patch = serde_json::from_str(r#"{"email":null}"#).unwrap();
        let set: Patch = serde_json::from_str(r#"{"email":"a@b.co"}"#).unwrap();
        assert_eq!(missing.email, None);
        assert_eq!(null.email, Some(None));
        assert_eq!(set.email, Some(Some("a@b.co".into())));
    }
}
