//! Database side of consultation ingestion. Everything except the raw-payload
//! insert and the failure marker runs inside the caller's transaction.

use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::extract::ExtractedConsultation;
use super::{clinic_name, PlannedAnswer};

pub type Tx<'a> = Transaction<'a, Postgres>;

pub async fn insert_consultation(
    db: &PgPool,
    payload: &serde_json::Value,
    source: &str,
) -> Result<Uuid, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        INSERT INTO consultation (source, raw_payload, status)
        VALUES ($1, $2, 'received')
        RETURNING consultation_id
        "#,
    )
    .bind(source)
    .bind(payload)
    .fetch_one(db)
    .await
}

/// Row-locks the consultation for the rest of the transaction and returns its
/// current status, or `None` if it does not exist.
pub async fn lock_consultation(
    tx: &mut Tx<'_>,
    consultation_id: Uuid,
) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        SELECT status FROM consultation
        WHERE consultation_id = $1
        FOR UPDATE
        "#,
    )
    .bind(consultation_id)
    .fetch_optional(&mut **tx)
    .await
}

/// Serialises every transaction normalising the same chatbot session until commit.
pub async fn lock_session(tx: &mut Tx<'_>, session_id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(session_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Never overwrites a consultation that another attempt already finished.
pub async fn mark_failed(db: &PgPool, consultation_id: Uuid, error: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE consultation
        SET status = 'failed', error = $2, processed_at = now()
        WHERE consultation_id = $1
          AND status IN ('received', 'failed')
        "#,
    )
    .bind(consultation_id)
    .bind(error)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn mark_processed(
    tx: &mut Tx<'_>,
    consultation_id: Uuid,
    status: &str,
    session_id: Option<&str>,
    assessment_id: Uuid,
) -> Result<bool, sqlx::Error> {
    let done = sqlx::query(
        r#"
        UPDATE consultation
        SET status = $2,
            external_session_id = $3,
            assessment_id = $4,
            error = NULL,
            processed_at = now()
        WHERE consultation_id = $1
          AND status IN ('received', 'failed')
        "#,
    )
    .bind(consultation_id)
    .bind(status)
    .bind(session_id)
    .bind(assessment_id)
    .execute(&mut **tx)
    .await?;
    Ok(done.rows_affected() == 1)
}

#[derive(Debug, sqlx::FromRow)]
pub struct ExistingAssessment {
    pub assessment_id: Uuid,
    pub patient_id: Uuid,
    pub risk_level: String,
    pub flagged_count: i32,
}

pub async fn find_assessment_by_session(
    tx: &mut Tx<'_>,
    session_id: &str,
) -> Result<Option<ExistingAssessment>, sqlx::Error> {
    sqlx::query_as::<_, ExistingAssessment>(
        r#"
        SELECT assessment_id, patient_id, risk_level, flagged_count
        FROM assessment
        WHERE external_session_id = $1
        "#,
    )
    .bind(session_id)
    .fetch_optional(&mut **tx)
    .await
}

/// Resolve the chatbot's free-text clinic onto a clinic row, creating one if unknown.
pub async fn resolve_clinic(tx: &mut Tx<'_>, raw: &str) -> Result<Option<Uuid>, sqlx::Error> {
    if clinic_name::clinic_key(raw).is_empty() {
        return Ok(None);
    }

    let known: Vec<(Uuid, String)> = sqlx::query_as(
        r#"
        SELECT clinic_id, name
        FROM clinic
        "#,
    )
    .fetch_all(&mut **tx)
    .await?;

    if let Some(id) = clinic_name::best_match(raw, known.iter().map(|(id, n)| (*id, n.as_str()))) {
        return Ok(Some(id));
    }

    let name = clinic_name::display_name(raw);
    let slug = clinic_name::slugify(raw);
    tracing::info!(clinic = %name, "creating clinic from chatbot payload");

    let id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO clinic (name, slug)
        VALUES ($1, $2)
        ON CONFLICT (slug) DO UPDATE SET updated_at = now()
        RETURNING clinic_id
        "#,
    )
    .bind(&name)
    .bind(&slug)
    .fetch_one(&mut **tx)
    .await?;

    Ok(Some(id))
}

/// Find the patient by phone, then email, then name within the clinic; fill in
/// whatever the record is missing. Creates a `chatbot`-sourced patient otherwise.
pub async fn upsert_patient(
    tx: &mut Tx<'_>,
    x: &ExtractedConsultation,
    clinic_id: Option<Uuid>,
) -> Result<Uuid, sqlx::Error> {
    let mut existing: Option<Uuid> = None;

    if let Some(phone) = x.phone.as_deref() {
        existing = sqlx::query_scalar(
            r#"
            SELECT patient_id FROM patient
            WHERE phone = $1
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(phone)
        .fetch_optional(&mut **tx)
        .await?;
    }

    if existing.is_none() {
        if let Some(email) = x.email.as_deref() {
            existing = sqlx::query_scalar(
                r#"
                SELECT patient_id FROM patient
                WHERE lower(email) = $1
                ORDER BY created_at ASC
                LIMIT 1
                "#,
            )
            .bind(email)
            .fetch_optional(&mut **tx)
            .await?;
        }
    }

    if existing.is_none() {
        if let Some(name) = x.full_name.as_deref() {
            existing = sqlx::query_scalar(
                r#"
                SELECT patient_id FROM patient
                WHERE lower(full_name) = lower($1)
                  AND clinic_id IS NOT DISTINCT FROM $2
                ORDER BY created_at ASC
                LIMIT 1
                "#,
            )
            .bind(name)
            .bind(clinic_id)
            .fetch_optional(&mut **tx)
            .await?;
        }
    }

    let gender = x.gender.unwrap_or("unknown");

    if let Some(patient_id) = existing {
        sqlx::query(
            r#"
            UPDATE patient
            SET phone = COALESCE(phone, $2),
                email = COALESCE(email, $3),
                age = COALESCE($4, age),
                gender = CASE WHEN gender = 'unknown' THEN $5 ELSE gender END,
                clinic_id = COALESCE(clinic_id, $6),
                last_contact_at = now(),
                updated_at = now()
            WHERE patient_id = $1
            "#,
        )
        .bind(patient_id)
        .bind(x.phone.as_deref())
        .bind(x.email.as_deref())
        .bind(x.age)
        .bind(gender)
        .bind(clinic_id)
        .execute(&mut **tx)
        .await?;
        return Ok(patient_id);
    }

    sqlx::query_scalar(
        r#"
        INSERT INTO patient (clinic_id, full_name, phone, email, age, gender, source, last_contact_at)
        VALUES ($1, $2, $3, $4, $5, $6, 'chatbot', now())
        RETURNING patient_id
        "#,
    )
    .bind(clinic_id)
    .bind(x.display_name())
    .bind(x.phone.as_deref())
    .bind(x.email.as_deref())
    .bind(x.age)
    .bind(gender)
    .fetch_one(&mut **tx)
    .await
}

async fn find_condition(tx: &mut Tx<'_>, name: &str) -> Result<Option<Uuid>, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        SELECT condition_id FROM condition
        WHERE lower(name) = lower($1)
        "#,
    )
    .bind(name)
    .fetch_optional(&mut **tx)
    .await
}

/// Case-insensitive find-or-create. A concurrent creator of the same name wins
/// the unique index and its row is returned.
pub async fn resolve_condition(tx: &mut Tx<'_>, name: &str) -> Result<Uuid, sqlx::Error> {
    if let Some(id) = find_condition(tx, name).await? {
        return Ok(id);
    }

    let inserted: Option<Uuid> = sqlx::query_scalar(
        r#"
        INSERT INTO condition (name)
        VALUES ($1)
        ON CONFLICT DO NOTHING
        RETURNING condition_id
        "#,
    )
    .bind(name)
    .fetch_optional(&mut **tx)
    .await?;

    match inserted {
        Some(id) => Ok(id),
        None => find_condition(tx, name).await?.ok_or(sqlx::Error::RowNotFound),
    }
}

pub async fn resolve_question(
    tx: &mut Tx<'_>,
    text: &str,
    condition_id: Option<Uuid>,
) -> Result<Uuid, sqlx::Error> {
    let found: Option<Uuid> = sqlx::query_scalar(
        r#"
        SELECT question_id FROM question
        WHERE text = $1
        ORDER BY (condition_id IS NOT DISTINCT FROM $2) DESC, created_at ASC
        LIMIT 1
        "#,
    )
    .bind(text)
    .bind(condition_id)
    .fetch_optional(&mut **tx)
    .await?;

    if let Some(id) = found {
        return Ok(id);
    }

    sqlx::query_scalar(
        r#"
        INSERT INTO question (condition_id, text, category)
        VALUES ($1, $2, 'chatbot')
        RETURNING question_id
        "#,
    )
    .bind(condition_id)
    .bind(text)
    .fetch_one(&mut **tx)
    .await
}

pub struct NewAssessment<'a> {
    pub patient_id: Uuid,
    pub clinic_id: Option<Uuid>,
    pub condition_id: Option<Uuid>,
    pub consultation_id: Uuid,
    pub session_id: Option<&'a str>,
    pub risk_level: &'a str,
    pub summary: Option<&'a str>,
    pub flagged_count: i32,
}

pub async fn insert_assessment(tx: &mut Tx<'_>, a: &NewAssessment<'_>) -> Result<Uuid, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        INSERT INTO assessment
            (patient_id, clinic_id, condition_id, consultation_id, external_session_id,
             risk_level, status, summary, flagged_count)
        VALUES ($1, $2, $3, $4, $5, $6, 'new', $7, $8)
        RETURNING assessment_id
        "#,
    )
    .bind(a.patient_id)
    .bind(a.clinic_id)
    .bind(a.condition_id)
    .bind(a.consultation_id)
    .bind(a.session_id)
    .bind(a.risk_level)
    .bind(a.summary)
    .bind(a.flagged_count)
    .fetch_one(&mut **tx)
    .await
}

pub async fn insert_response(
    tx: &mut Tx<'_>,
    assessment_id: Uuid,
    question_id: Uuid,
    position: i32,
    answer: &PlannedAnswer,
) -> Result<Uuid, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        INSERT INTO response
            (assessment_id, question_id, position, question_text, answer_text, is_flagged, flag_reason)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING response_id
        "#,
    )
    .bind(assessment_id)
    .bind(question_id)
    .bind(position)
    .bind(&answer.question)
    .bind(&answer.answer)
    .bind(answer.flag_reason.is_some())
    .bind(answer.flag_reason.as_deref())
    .fetch_one(&mut **tx)
    .await
}
