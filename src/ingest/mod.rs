//! Chatbot consultation ingestion.
//!
//! The raw payload is committed first so that nothing the chatbot sent is lost,
//! then normalised into patient / assessment / response rows in one transaction.

pub mod clinic_name;
pub mod extract;
pub mod flags;
mod store;

use serde::Serialize;
use serde_json::{json, Value};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::ApiError;
use crate::live::{LiveEvent, LiveEventKind, LiveHub};
use extract::ExtractedConsultation;
use flags::{FlagMatch, RiskLevel};

const SUMMARY_MAX_CHARS: usize = 280;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("payload must be a JSON object")]
    NotAnObject,
    #[error("payload carries no patient name, phone, email or session id")]
    NoIdentity,
    #[error("consultation not found")]
    UnknownConsultation,
    #[error("consultation is already {0}")]
    AlreadyProcessed(String),
    #[error("db error: {0}")]
    Db(#[from] sqlx::Error),
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::Db(inner) => ApiError::db(inner),
            IngestError::UnknownConsultation => ApiError::not_found("consultation"),
            e @ IngestError::AlreadyProcessed(_) => {
                ApiError::Conflict("ALREADY_PROCESSED", e.to_string())
            }
            other => ApiError::validation(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedAnswer {
    pub question: String,
    pub answer: String,
    pub flags: Vec<FlagMatch>,
    pub flag_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssessmentPlan {
    pub risk_level: RiskLevel,
    pub summary: Option<String>,
    pub flagged_count: i32,
    pub answers: Vec<PlannedAnswer>,
}

/// Flag every answer and derive the assessment-level risk and summary.
///
/// The risk is the higher of what the chatbot reported and what the flags imply.
pub fn plan_assessment(x: &ExtractedConsultation) -> AssessmentPlan {
    let answers: Vec<PlannedAnswer> = x
        .answers
        .iter()
        .map(|qa| {
            let flags = flags::detect(&qa.answer);
            let flag_reason = flags::flag_reason(&flags);
            PlannedAnswer {
                question: qa.question.clone(),
                answer: qa.answer.clone(),
                flags,
                flag_reason,
            }
        })
        .collect();

    let from_flags = flags::risk_from_flags(answers.iter().flat_map(|a| a.flags.iter()));
    let risk_level = x.risk_hint.map_or(from_flags, |hint| hint.max(from_flags));
    let flagged_count = answers.iter().filter(|a| a.flag_reason.is_some()).count() as i32;

    let joined = answers
        .iter()
        .map(|a| a.answer.as_str())
        .collect::<Vec<_>>()
        .join("; ");
    let summary = (!joined.is_empty()).then(|| joined.chars().take(SUMMARY_MAX_CHARS).collect());

    AssessmentPlan {
        risk_level,
        summary,
        flagged_count,
        answers,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReceipt {
    pub consultation_id: Uuid,
    pub status: &'static str,
    pub patient_id: Option<Uuid>,
    pub assessment_id: Option<Uuid>,
    pub risk_level: Option<RiskLevel>,
    pub flagged_count: i32,
    pub error: Option<String>,
}

impl IngestReceipt {
    fn failed(consultation_id: Uuid, error: String) -> Self {
        IngestReceipt {
            consultation_id,
            status: "failed",
            patient_id: None,
            assessment_id: None,
            risk_level: None,
            flagged_count: 0,
            error: Some(error),
        }
    }
}

struct Outcome {
    duplicate: bool,
    patient_id: Uuid,
    assessment_id: Uuid,
    risk_level: RiskLevel,
    flagged_count: i32,
    flagged: Vec<(Uuid, String)>,
}

/// Store a webhook payload verbatim and normalise it.
pub async fn ingest(
    db: &PgPool,
    live: &LiveHub,
    payload: Value,
    source: &str,
) -> Result<IngestReceipt, ApiError> {
    if !payload.is_object() {
        return Err(IngestError::NotAnObject.into());
    }

    let consultation_id = store::insert_consultation(db, &payload, source)
        .await
        .map_err(ApiError::db)?;
    live.publish(
        LiveEvent::new(LiveEventKind::NewConsultation, consultation_id)
            .with_payload(json!({ "source": source })),
    );

    process(db, live, consultation_id, &payload).await
}

/// Normalise an already-stored consultation. Failures are recorded on the
/// consultation row and reported in the receipt rather than returned as errors.
/// Only a consultation that is missing, or that another attempt already
/// finished, is an `Err`.
pub async fn process(
    db: &PgPool,
    live: &LiveHub,
    consultation_id: Uuid,
    payload: &Value,
) -> Result<IngestReceipt, ApiError> {
    let receipt = match normalize(db, consultation_id, payload).await {
        Ok(out) => {
            tracing::info!(
                %consultation_id,
                assessment_id = %out.assessment_id,
                risk = out.risk_level.as_str(),
                flagged = out.flagged_count,
                duplicate = out.duplicate,
                "consultation ingested"
            );

            if !out.duplicate {
                live.publish(
                    LiveEvent::new(LiveEventKind::NewAssessment, out.assessment_id)
                        .for_patient(out.patient_id)
                        .with_payload(json!({
                            "risk_level": out.risk_level,
                            "flagged_count": out.flagged_count,
                        })),
                );
                for (response_id, reason) in &out.flagged {
                    live.publish(
                        LiveEvent::new(LiveEventKind::FlaggedResponse, *response_id)
                            .for_patient(out.patient_id)
                            .with_payload(json!({
                                "assessment_id": out.assessment_id,
                                "flag_reason": reason,
                            })),
                    );
                }
            }

            IngestReceipt {
                consultation_id,
                status: if out.duplicate { "duplicate" } else { "processed" },
                patient_id: Some(out.patient_id),
                assessment_id: Some(out.assessment_id),
                risk_level: Some(out.risk_level),
                flagged_count: out.flagged_count,
                error: None,
            }
        }
        Err(e @ (IngestError::AlreadyProcessed(_) | IngestError::UnknownConsultation)) => {
            tracing::info!(%consultation_id, reason = %e, "consultation not reprocessed");
            return Err(e.into());
        }
        Err(e) => {
            let message = e.to_string();
            tracing::warn!(%consultation_id, error = %message, "consultation normalisation failed");
            if let Err(mark_err) = store::mark_failed(db, consultation_id, &message).await {
                tracing::error!(%consultation_id, error = %mark_err, "could not record ingestion failure");
            }
            IngestReceipt::failed(consultation_id, message)
        }
    };
    Ok(receipt)
}

async fn normalize(
    db: &PgPool,
    consultation_id: Uuid,
    payload: &Value,
) -> Result<Outcome, IngestError> {
    let mut tx = db.begin().await?;
    match normalize_in(&mut tx, consultation_id, payload).await {
        Ok(out) => {
            tx.commit().await?;
            Ok(out)
        }
        Err(e) => {
            // Release the row lock before the caller records the failure.
            if let Err(rollback_err) = tx.rollback().await {
                tracing::warn!(%consultation_id, error = %rollback_err, "rollback failed");
            }
            Err(e)
        }
    }
}

async fn normalize_in(
    tx: &mut store::Tx<'_>,
    consultation_id: Uuid,
    payload: &Value,
) -> Result<Outcome, IngestError> {
    // Held until commit: a second attempt on this consultation waits here and
    // then sees the finished status.
    match store::lock_consultation(tx, consultation_id).await? {
        None => return Err(IngestError::UnknownConsultation),
        Some(status) if !matches!(status.as_str(), "received" | "failed") => {
            return Err(IngestError::AlreadyProcessed(status));
        }
        Some(_) => {}
    }

    let Value::Object(root) = payload else {
        return Err(IngestError::NotAnObject);
    };

    let x = extract::extract(root);
    if !x.has_identity() {
        return Err(IngestError::NoIdentity);
    }

    if let Some(session_id) = x.session_id.as_deref() {
        store::lock_session(tx, session_id).await?;
        if let Some(existing) = store::find_assessment_by_session(tx, session_id).await? {
            finish(tx, consultation_id, "duplicate", Some(session_id), existing.assessment_id)
                .await?;
            return Ok(Outcome {
                duplicate: true,
                patient_id: existing.patient_id,
                assessment_id: existing.assessment_id,
                risk_level: RiskLevel::parse_loose(&existing.risk_level).unwrap_or(RiskLevel::Low),
                flagged_count: existing.flagged_count,
                flagged: Vec::new(),
            });
        }
    }

    let plan = plan_assessment(&x);

    let clinic_id = match x.clinic.as_deref() {
        Some(raw) => store::resolve_clinic(tx, raw).await?,
        None => None,
    };
    let patient_id = store::upsert_patient(tx, &x, clinic_id).await?;
    let condition_id = match x.condition.as_deref() {
        Some(name) => Some(store::resolve_condition(tx, name).await?),
        None => None,
    };

    let assessment_id = store::insert_assessment(
        tx,
        &store::NewAssessment {
            patient_id,
            clinic_id,
            condition_id,
            consultation_id,
            session_id: x.session_id.as_deref(),
            risk_level: plan.risk_level.as_str(),
            summary: plan.summary.as_deref(),
            flagged_count: plan.flagged_count,
        },
    )
    .await?;

    let mut flagged = Vec::new();
    for (position, answer) in plan.answers.iter().enumerate() {
        let question_id = store::resolve_question(tx, &answer.question, condition_id).await?;
        let response_id =
            store::insert_response(tx, assessment_id, question_id, position as i32, answer).await?;
        if let Some(reason) = &answer.flag_reason {
            flagged.push((response_id, reason.clone()));
        }
    }

    finish(tx, consultation_id, "processed", x.session_id.as_deref(), assessment_id).await?;

    Ok(Outcome {
        duplicate: false,
        patient_id,
        assessment_id,
        risk_level: plan.risk_level,
        flagged_count: plan.flagged_count,
        flagged,
    })
}

async fn finish(
    tx: &mut store::Tx<'_>,
    consultation_id: Uuid,
    status: &str,
    session_id: Option<&str>,
    assessment_id: Uuid,
) -> Result<(), IngestError> {
    if store::mark_processed(tx, consultation_id, status, session_id, assessment_id).await? {
        Ok(())
    } else {
        Err(IngestError::AlreadyProcessed("processed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use extract::QaPair;
    use sqlx::PgPool;

    fn consultation(answers: &[(&str, &str)]) -> ExtractedConsultation {
        ExtractedConsultation {
            full_name: Some("Test Patient".into()),
            answers: answers
                .iter()
                .map(|(q, a)| QaPair { question: q.to_string(), answer: a.to_string() })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn plan_flags_answers_and_derives_risk() {
        let plan = plan_assessment(&consultation(&[
            ("How are you feeling?", "Tired, some dizziness"),
            ("Any pain?", "Chest pain when climbing stairs"),
            ("Smoker?", "no"),
        ]));
        assert_eq!(plan.risk_level, RiskLevel::High);
        assert_eq!(plan.flagged_count, 2);
        assert_eq!(plan.answers[0].flag_reason.as_deref(), Some("medium: dizziness"));
        assert_eq!(plan.answers[1].flag_reason.as_deref(), Some("high: chest pain"));
        assert_eq!(plan.answers[2].flag_reason, None);
        assert_eq!(
            plan.summary.as_deref(),
            Some("Tired, some dizziness; Chest pain when climbing stairs; no")
        );
    }

    #[test]
    fn chatbot_risk_hint_only_raises_the_level() {
        let mut x = consultation(&[("Symptoms?", "mild fever")]);
        x.risk_hint = Some(RiskLevel::Low);
        assert_eq!(plan_assessment(&x).risk_level, RiskLevel::Medium);

        x.risk_hint = Some(RiskLevel::High);
        assert_eq!(plan_assessment(&x).risk_level, RiskLevel::High);
    }

    #[test]
    fn empty_conversation_has_low_risk_and_no_summary() {
        let plan = plan_assessment(&consultation(&[]));
        assert_eq!(plan.risk_level, RiskLevel::Low);
        assert_eq!(plan.flagged_count, 0);
        assert_eq!(plan.summary, None);
    }

    #[test]
    fn summary_is_truncated_on_char_boundaries() {
        let long = "é".repeat(400);
        let plan = plan_assessment(&consultation(&[("Q", long.as_str())]));
        assert_eq!(plan.summary.unwrap().chars().count(), SUMMARY_MAX_CHARS);
    }

    #[test]
    fn ingest_errors_map_to_validation_failures() {
        let e: ApiError = IngestError::NoIdentity.into();
        assert_eq!(e.status(), axum::http::StatusCode::BAD_REQUEST);
        let e: ApiError = IngestError::NotAnObject.into();
        assert_eq!(e.to_string(), "VALIDATION_ERROR: payload must be a JSON object");
        let e: ApiError = IngestError::AlreadyProcessed("duplicate".into()).into();
        assert_eq!(e.status(), axum::http::StatusCode::CONFLICT);
        assert_eq!(e.to_string(), "ALREADY_PROCESSED: consultation is already duplicate");
        let e: ApiError = IngestError::UnknownConsultation.into();
        assert_eq!(e.status(), axum::http::StatusCode::NOT_FOUND);
    }

    // Database-backed: each test gets a fresh database with the migrations applied.

    fn delivery(session_id: Option<&str>) -> Value {
        let mut p = json!({
            "name": "Dana Reyes",
            "phone": "+1 555 010 2030",
            "clinic": "Northside Clinic",
            "condition": "Migraine",
            "answers": [
                { "question": "What brings you in?", "answer": "Headache and some dizziness" },
                { "question": "Anything else?", "answer": "no" }
            ]
        });
        if let Some(id) = session_id {
            p["session_id"] = json!(id);
        }
        p
    }

    async fn count(pool: &PgPool, sql: &str) -> i64 {
        sqlx::query_scalar(sql).fetch_one(pool).await.unwrap()
    }

    async fn consultation_state(pool: &PgPool, id: Uuid) -> (String, Option<String>) {
        sqlx::query_as("SELECT status, error FROM consultation WHERE consultation_id = $1")
            .bind(id)
            .fetch_one(pool)
            .await
            .unwrap()
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn delivery_creates_patient_assessment_and_responses(pool: PgPool) {
        let live = LiveHub::new(16);
        let mut events = live.subscribe();

        let r = ingest(&pool, &live, delivery(Some("sess-1")), "chatbot").await.unwrap();
        assert_eq!(r.status, "processed");
        assert_eq!(r.risk_level, Some(RiskLevel::Medium));
        assert_eq!(r.flagged_count, 1);

        let (status, error) = consultation_state(&pool, r.consultation_id).await;
        assert_eq!(status, "processed");
        assert_eq!(error, None);
        assert_eq!(count(&pool, "SELECT COUNT(*) FROM response").await, 2);
        assert_eq!(
            count(&pool, "SELECT COUNT(*) FROM patient WHERE source = 'chatbot' AND phone = '+15550102030'").await,
            1
        );

        let kinds: Vec<LiveEventKind> = std::iter::from_fn(|| events.try_recv().ok()).map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                LiveEventKind::NewConsultation,
                LiveEventKind::NewAssessment,
                LiveEventKind::FlaggedResponse
            ]
        );
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn redelivered_session_is_a_duplicate(pool: PgPool) {
        let live = LiveHub::new(16);
        let first = ingest(&pool, &live, delivery(Some("sess-2")), "chatbot").await.unwrap();

        let mut events = live.subscribe();
        let again = ingest(&pool, &live, delivery(Some("sess-2")), "chatbot").await.unwrap();
        assert_eq!(again.status, "duplicate");
        assert_eq!(again.assessment_id, first.assessment_id);
        assert_eq!(again.patient_id, first.patient_id);

        let (status, _) = consultation_state(&pool, again.consultation_id).await;
        assert_eq!(status, "duplicate");
        assert_eq!(count(&pool, "SELECT COUNT(*) FROM assessment").await, 1);

        let kinds: Vec<LiveEventKind> = std::iter::from_fn(|| events.try_recv().ok()).map(|e| e.kind).collect();
        assert_eq!(kinds, vec![LiveEventKind::NewConsultation]);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn simultaneous_deliveries_of_one_session_store_one_assessment(pool: PgPool) {
        let live = LiveHub::new(16);
        let (a, b) = tokio::join!(
            ingest(&pool, &live, delivery(Some("sess-3")), "chatbot"),
            ingest(&pool, &live, delivery(Some("sess-3")), "chatbot"),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        let mut statuses = vec![a.status, b.status];
        statuses.sort();
        assert_eq!(statuses, vec!["duplicate", "processed"]);
        assert_eq!(a.assessment_id, b.assessment_id);
        assert_eq!(count(&pool, "SELECT COUNT(*) FROM assessment").await, 1);
        assert_eq!(count(&pool, "SELECT COUNT(*) FROM patient").await, 1);
        assert_eq!(
            count(&pool, "SELECT COUNT(*) FROM consultation WHERE status = 'failed'").await,
            0
        );
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn failure_is_recorded_on_the_consultation(pool: PgPool) {
        let live = LiveHub::new(16);
        let r = ingest(&pool, &live, json!({ "answers": [] }), "chatbot").await.unwrap();
        assert_eq!(r.status, "failed");
        assert!(r.error.as_deref().unwrap().contains("no patient name"));

        let (status, error) = consultation_state(&pool, r.consultation_id).await;
        assert_eq!(status, "failed");
        assert_eq!(error, r.error);
        assert_eq!(count(&pool, "SELECT COUNT(*) FROM assessment").await, 0);

        // A failed row may be retried; it fails the same way and stays retryable.
        let retry = process(&pool, &live, r.consultation_id, &json!({ "answers": [] }))
            .await
            .unwrap();
        assert_eq!(retry.status, "failed");
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn finished_consultations_are_not_reprocessed(pool: PgPool) {
        let live = LiveHub::new(16);
        let payload = delivery(None);
        let r = ingest(&pool, &live, payload.clone(), "chatbot").await.unwrap();
        assert_eq!(r.status, "processed");

        let err = process(&pool, &live, r.consultation_id, &payload).await.unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::CONFLICT);
        assert_eq!(err.to_string(), "ALREADY_PROCESSED: consultation is already processed");
        assert_eq!(count(&pool, "SELECT COUNT(*) FROM assessment").await, 1);

        let missing = process(&pool, &live, Uuid::new_v4(), &payload).await.unwrap_err();
        assert_eq!(missing.status(), axum::http::StatusCode::NOT_FOUND);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn concurrent_processing_of_one_consultation_runs_once(pool: PgPool) {
        let live = LiveHub::new(16);
        let payload = delivery(None);
        let id = store::insert_consultation(&pool, &payload, "chatbot").await.unwrap();

        let (a, b) = tokio::join!(
            process(&pool, &live, id, &payload),
            process(&pool, &live, id, &payload),
        );
        let (done, refused) = match (a, b) {
            (Ok(done), Err(refused)) | (Err(refused), Ok(done)) => (done, refused),
            other => panic!("expected one success and one refusal, got {other:?}"),
        };
        assert_eq!(done.status, "processed");
        assert_eq!(refused.status(), axum::http::StatusCode::CONFLICT);

        assert_eq!(count(&pool, "SELECT COUNT(*) FROM assessment").await, 1);
        assert_eq!(count(&pool, "SELECT COUNT(*) FROM response").await, 2);
        let (status, _) = consultation_state(&pool, id).await;
        assert_eq!(status, "processed");
    }

    async fn upsert(pool: &PgPool, x: ExtractedConsultation, clinic_id: Option<Uuid>) -> Uuid {
        let mut tx = pool.begin().await.unwrap();
        let id = store::upsert_patient(&mut tx, &x, clinic_id).await.unwrap();
        tx.commit().await.unwrap();
        id
    }

    fn person(name: &str, phone: Option<&str>, email: Option<&str>) -> ExtractedConsultation {
        ExtractedConsultation {
            full_name: Some(name.into()),
            phone: phone.map(str::to_string),
            email: email.map(str::to_string),
            ..Default::default()
        }
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn patients_match_by_phone_then_email_then_name_within_clinic(pool: PgPool) {
        let mut tx = pool.begin().await.unwrap();
        let north = store::resolve_clinic(&mut tx, "Northside Clinic").await.unwrap();
        let south = store::resolve_clinic(&mut tx, "Southbank").await.unwrap();
        tx.commit().await.unwrap();
        assert_ne!(north, south);

        let ann = upsert(&pool, person("Ann Moss", Some("5550100"), None), north).await;
        let bea = upsert(&pool, person("Bea Holt", None, Some("bea@example.com")), north).await;
        let cal = upsert(&pool, person("Cal Frey", None, None), north).await;

        // Email outranks a name that belongs to someone else.
        assert_eq!(upsert(&pool, person("Cal Frey", None, Some("bea@example.com")), north).await, bea);
        // Name matching ignores case but is scoped to the clinic.
        assert_eq!(upsert(&pool, person("cal frey", None, None), north).await, cal);
        assert_ne!(upsert(&pool, person("Cal Frey", None, None), south).await, cal);
        // Phone outranks email, and the missing email is filled in.
        assert_eq!(
            upsert(&pool, person("Someone Else", Some("5550100"), Some("ann@example.com")), north).await,
            ann
        );

        let email: Option<String> = sqlx::query_scalar("SELECT email FROM patient WHERE patient_id = $1")
            .bind(ann)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(email.as_deref(), Some("ann@example.com"));
        assert_eq!(count(&pool, "SELECT COUNT(*) FROM patient").await, 4);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn clinics_are_found_before_being_created(pool: PgPool) {
        let mut tx = pool.begin().await.unwrap();
        let first = store::resolve_clinic(&mut tx, "  northside   clinic ").await.unwrap();
        let same = store::resolve_clinic(&mut tx, "The Northside Medical Centre").await.unwrap();
        let other = store::resolve_clinic(&mut tx, "Riverside").await.unwrap();
        let none = store::resolve_clinic(&mut tx, "The Clinic").await.unwrap();
        tx.commit().await.unwrap();

        assert!(first.is_some());
        assert_eq!(first, same);
        assert_ne!(first, other);
        assert_eq!(none, None);

        let (name, slug): (String, String) =
            sqlx::query_as("SELECT name, slug FROM clinic WHERE clinic_id = $1")
                .bind(first)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(name, "Northside Clinic");
        assert_eq!(slug, "northside-clinic");
        assert_eq!(count(&pool, "SELECT COUNT(*) FROM clinic").await, 2);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn conditions_created_concurrently_resolve_to_one_row(pool: PgPool) {
        let resolve = |name: &'static str| {
            let pool = pool.clone();
            async move {
                let mut tx = pool.begin().await.unwrap();
                let id = store::resolve_condition(&mut tx, name).await.unwrap();
                tx.commit().await.unwrap();
                id
            }
        };
        let (a, b) = tokio::join!(resolve("Migraine"), resolve("migraine"));
        assert_eq!(a, b);
        assert_eq!(count(&pool, "SELECT COUNT(*) FROM condition").await, 1);
    }
}
