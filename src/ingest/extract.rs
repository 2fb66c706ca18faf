//! Field extraction from loosely-shaped chatbot payloads.
//!
//! The chatbot vendor has changed its export shape several times, so every field is
//! looked up under a list of aliases, first on the top-level object and then inside
//! the usual wrapper objects. Key comparison ignores case, `_`, `-` and spaces.

use serde_json::{Map, Value};

use super::flags::RiskLevel;

const CONTAINERS: &[&str] = &["patient", "user", "contact", "customer", "data", "metadata"];

const NAME_KEYS: &[&str] = &["name", "full_name", "patient_name", "user_name", "contact_name"];
const FIRST_NAME_KEYS: &[&str] = &["first_name", "given_name", "firstname"];
const LAST_NAME_KEYS: &[&str] = &["last_name", "family_name", "surname", "lastname"];
const PHONE_KEYS: &[&str] = &[
    "phone",
    "phone_number",
    "mobile",
    "whatsapp",
    "telephone",
    "tel",
    "wa_id",
];
const EMAIL_KEYS: &[&str] = &["email", "email_address", "mail"];
const AGE_KEYS: &[&str] = &["age", "patient_age"];
const GENDER_KEYS: &[&str] = &["gender", "sex"];
const CLINIC_KEYS: &[&str] = &[
    "clinic",
    "clinic_name",
    "location",
    "branch",
    "site",
    "clinic_location",
];
const CONDITION_KEYS: &[&str] = &["condition", "concern", "topic", "category", "service", "reason"];
const SESSION_KEYS: &[&str] = &["session_id", "conversation_id", "chat_id", "thread_id", "id"];
// A bare `id` inside `patient` or `customer` names the person, not the conversation.
const NESTED_SESSION_KEYS: &[&str] = &["session_id", "conversation_id", "chat_id", "thread_id"];
const RISK_KEYS: &[&str] = &["risk", "risk_level", "urgency", "severity", "triage"];

const ANSWER_CONTAINERS: &[&str] = &[
    "responses",
    "answers",
    "qa",
    "questions",
    "messages",
    "conversation",
    "transcript",
];
const QUESTION_KEYS: &[&str] = &["question", "q", "prompt", "title", "label"];
const ANSWER_KEYS: &[&str] = &["answer", "a", "response", "value", "text", "reply"];
const ROLE_KEYS: &[&str] = &["role", "sender", "from", "author", "speaker"];
const MESSAGE_KEYS: &[&str] = &["content", "text", "message", "body"];

const BOT_ROLES: &[&str] = &["bot", "assistant", "system", "agent", "ai", "chatbot"];
const PATIENT_ROLES: &[&str] = &["user", "human", "patient", "customer", "client", "contact"];

/// Label used when the patient writes without a preceding bot prompt.
pub const UNPROMPTED_QUESTION: &str = "Patient message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QaPair {
    pub question: String,
    pub answer: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedConsultation {
    pub full_name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub age: Option<i32>,
    pub gender: Option<&'static str>,
    pub clinic: Option<String>,
    pub condition: Option<String>,
    pub session_id: Option<String>,
    pub risk_hint: Option<RiskLevel>,
    pub answers: Vec<QaPair>,
}

impl ExtractedConsultation {
    pub fn has_identity(&self) -> bool {
        self.full_name.is_some()
            || self.phone.is_some()
            || self.email.is_some()
            || self.session_id.is_some()
    }

    /// Name stored on a newly created patient row.
    pub fn display_name(&self) -> String {
        self.full_name
            .clone()
            .or_else(|| self.email.clone())
            .or_else(|| self.phone.clone())
            .unwrap_or_else(|| "Unknown patient".to_string())
    }
}

pub fn extract(root: &Map<String, Value>) -> ExtractedConsultation {
    let full_name = lookup_text(root, NAME_KEYS, CONTAINERS)
        .map(|s| collapse_whitespace(&s))
        .or_else(|| {
            let first = lookup_text(root, FIRST_NAME_KEYS, CONTAINERS);
            let last = lookup_text(root, LAST_NAME_KEYS, CONTAINERS);
            let joined = [first, last].into_iter().flatten().collect::<Vec<_>>().join(" ");
            Some(collapse_whitespace(&joined)).filter(|s| !s.is_empty())
        });

    let phone = lookup_text(root, PHONE_KEYS, CONTAINERS).and_then(|s| normalize_phone(&s));
    let email = lookup_text(root, EMAIL_KEYS, CONTAINERS).and_then(|s| normalize_email(&s));
    let age = lookup(root, AGE_KEYS, CONTAINERS).and_then(parse_age);
    let gender = lookup_text(root, GENDER_KEYS, CONTAINERS).map(|s| normalize_gender(&s));
    let clinic = lookup_text(root, CLINIC_KEYS, CONTAINERS).map(|s| collapse_whitespace(&s));
    let condition =
        lookup_text(root, CONDITION_KEYS, CONTAINERS).map(|s| collapse_whitespace(&s));
    let session_id = lookup_text(root, SESSION_KEYS, &["session"])
        .or_else(|| lookup_text(root, NESTED_SESSION_KEYS, CONTAINERS));
    let risk_hint = lookup_text(root, RISK_KEYS, CONTAINERS).and_then(|s| RiskLevel::parse_loose(&s));

    ExtractedConsultation {
        full_name,
        phone,
        email,
        age,
        gender,
        clinic,
        condition,
        session_id,
        risk_hint,
        answers: extract_answers(root),
    }
}

fn norm_key(k: &str) -> String {
    k.chars()
        .filter(|c| !matches!(*c, '_' | '-' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}

fn get_alias<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|wanted| {
        let wanted = norm_key(wanted);
        obj.iter()
            .find(|(k, v)| norm_key(k) == wanted && !is_blank(v))
            .map(|(_, v)| v)
    })
}

fn lookup<'a>(
    root: &'a Map<String, Value>,
    keys: &[&str],
    containers: &[&str],
) -> Option<&'a Value> {
    get_alias(root, keys).or_else(|| {
        containers.iter().find_map(|c| match get_alias(root, &[*c]) {
            Some(Value::Object(inner)) => get_alias(inner, keys),
            _ => None,
        })
    })
}

fn lookup_text(root: &Map<String, Value>, keys: &[&str], containers: &[&str]) -> Option<String> {
    lookup(root, keys, containers).and_then(value_to_text)
}

fn is_blank(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        _ => false,
    }
}

/// Best-effort rendering of an arbitrary JSON value as display text.
pub fn value_to_text(v: &Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(String::from(if *b { "yes" } else { "no" })),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(value_to_text).collect();
            Some(parts.join(", ")).filter(|s| !s.is_empty())
        }
        Value::Object(obj) => get_alias(obj, &["name", "value", "text", "label"]).and_then(value_to_text),
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Digits only, keeping an international `+` (a `00` prefix is read as `+`).
pub fn normalize_phone(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let mut international = trimmed.starts_with('+');
    let mut digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();

    if !international && trimmed.starts_with("00") && digits.len() > 2 {
        digits.drain(..2);
        international = true;
    }

    if digits.len() < 7 || digits.len() > 15 {
        return None;
    }
    Some(if international { format!("+{digits}") } else { digits })
}

pub fn normalize_email(raw: &str) -> Option<String> {
    let e = raw.trim().to_lowercase();
    let (local, domain) = e.split_once('@')?;
    if local.is_empty() || e.contains(char::is_whitespace) {
        return None;
    }
    let dot = domain.find('.')?;
    if dot == 0 || dot == domain.len() - 1 {
        return None;
    }
    Some(e)
}

fn parse_age(v: &Value) -> Option<i32> {
    let n = match v {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => {
            let start = s.find(|c: char| c.is_ascii_digit())?;
            if s[..start].ends_with('-') {
                return None;
            }
            let digits: String = s[start..].chars().take_while(char::is_ascii_digit).collect();
            digits.parse::<f64>().ok()?
        }
        _ => return None,
    };
    if (0.0..=130.0).contains(&n) {
        Some(n.trunc() as i32)
    } else {
        None
    }
}

pub fn normalize_gender(raw: &str) -> &'static str {
    match raw.trim().to_lowercase().as_str() {
        "m" | "male" | "man" | "boy" => "male",
        "f" | "female" | "woman" | "girl" => "female",
        "other" | "non-binary" | "nonbinary" | "non binary" | "nb" | "x" => "other",
        _ => "unknown",
    }
}

fn extract_answers(root: &Map<String, Value>) -> Vec<QaPair> {
    let container = lookup(root, ANSWER_CONTAINERS, CONTAINERS);
    match container {
        Some(Value::Array(items)) if looks_like_transcript(items) => pair_transcript(items),
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .filter_map(|(i, item)| qa_from_item(i, item))
            .collect(),
        Some(Value::Object(map)) => map
            .iter()
            .filter_map(|(q, a)| {
                let answer = value_to_text(a)?;
                let question = collapse_whitespace(q);
                (!question.is_empty()).then_some(QaPair { question, answer })
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn looks_like_transcript(items: &[Value]) -> bool {
    items.iter().any(|item| match item {
        Value::Object(obj) => get_alias(obj, ROLE_KEYS).is_some() && get_alias(obj, QUESTION_KEYS).is_none(),
        _ => false,
    })
}

fn qa_from_item(index: usize, item: &Value) -> Option<QaPair> {
    let Value::Object(obj) = item else {
        return None;
    };
    let answer = get_alias(obj, ANSWER_KEYS).and_then(value_to_text)?;
    let question = get_alias(obj, QUESTION_KEYS)
        .and_then(value_to_text)
        .map(|q| collapse_whitespace(&q))
        .unwrap_or_else(|| format!("Question {}", index + 1));
    Some(QaPair { question, answer })
}

fn pair_transcript(items: &[Value]) -> Vec<QaPair> {
    let mut out = Vec::new();
    let mut pending: Option<String> = None;

    for item in items {
        let Value::Object(obj) = item else { continue };
        let Some(text) = get_alias(obj, MESSAGE_KEYS).and_then(value_to_text) else {
            continue;
        };
        let role = get_alias(obj, ROLE_KEYS)
            .and_then(value_to_text)
            .map(|r| r.to_lowercase())
            .unwrap_or_default();

        if BOT_ROLES.contains(&role.as_str()) {
            pending = Some(collapse_whitespace(&text));
        } else if PATIENT_ROLES.contains(&role.as_str()) {
            let question = pending.take().unwrap_or_else(|| UNPROMPTED_QUESTION.to_string());
            out.push(QaPair { question, answer: text });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("fixture must be an object"),
        }
    }

    #[test]
    fn reads_flat_payload() {
        let p = obj(json!({
            "Full Name": "  Jane   Doe ",
            "phone_number": "+44 (0)20 7946-0958",
            "Email": "Jane.Doe@Example.com",
            "age": "42 years",
            "sex": "F",
            "clinic": "Northside Clinic",
            "concern": "Back pain",
            "conversation_id": "conv-981",
            "answers": [
                { "question": "Where does it hurt?", "answer": "Lower back" },
                { "q": "Since when?", "a": 3 }
            ]
        }));
        let x = extract(&p);
        assert_eq!(x.full_name.as_deref(), Some("Jane Doe"));
        assert_eq!(x.phone.as_deref(), Some("+4402079460958"));
        assert_eq!(x.email.as_deref(), Some("jane.doe@example.com"));
        assert_eq!(x.age, Some(42));
        assert_eq!(x.gender, Some("female"));
        assert_eq!(x.clinic.as_deref(), Some("Northside Clinic"));
        assert_eq!(x.condition.as_deref(), Some("Back pain"));
        assert_eq!(x.session_id.as_deref(), Some("conv-981"));
        assert_eq!(
            x.answers,
            vec![
                QaPair { question: "Where does it hurt?".into(), answer: "Lower back".into() },
                QaPair { question: "Since when?".into(), answer: "3".into() },
            ]
        );
    }

    #[test]
    fn falls_back_to_nested_containers_and_split_names() {
        let p = obj(json!({
            "session_id": "s-1",
            "user": { "first_name": "Ahmed", "last_name": "Khan", "mobile": 447700900123u64 },
            "metadata": { "location": { "name": "Riverside Branch" } }
        }));
        let x = extract(&p);
        assert_eq!(x.full_name.as_deref(), Some("Ahmed Khan"));
        assert_eq!(x.phone.as_deref(), Some("447700900123"));
        assert_eq!(x.clinic.as_deref(), Some("Riverside Branch"));
    }

    #[test]
    fn top_level_wins_over_containers_and_blanks_are_skipped() {
        let p = obj(json!({
            "name": "",
            "patient": { "name": "From Container" },
            "phone": "   "
        }));
        let x = extract(&p);
        assert_eq!(x.full_name.as_deref(), Some("From Container"));
        assert_eq!(x.phone, None);
    }

    #[test]
    fn pairs_chat_transcripts() {
        let p = obj(json!({
            "chat_id": "c-7",
            "messages": [
                { "role": "user", "content": "hi" },
                { "role": "assistant", "content": "What brings you in today?" },
                { "role": "user", "content": "Chest pain since last night" },
                { "role": "assistant", "content": "Any fever?" },
                { "role": "assistant", "content": "Do you have a fever?" },
                { "role": "user", "content": "   " },
                { "role": "user", "content": "no" }
            ]
        }));
        let x = extract(&p);
        assert_eq!(x.answers.len(), 3);
        assert_eq!(x.answers[0].question, UNPROMPTED_QUESTION);
        assert_eq!(x.answers[1].question, "What brings you in today?");
        assert_eq!(x.answers[1].answer, "Chest pain since last night");
        assert_eq!(x.answers[2].question, "Do you have a fever?");
        assert_eq!(x.answers[2].answer, "no");
    }

    #[test]
    fn answer_maps_keep_payload_order() {
        let p = obj(json!({
            "email": "a@b.co",
            "responses": { "Smoker?": false, "Medications": ["ibuprofen", "statin"], "Notes": null }
        }));
        let x = extract(&p);
        assert_eq!(
            x.answers,
            vec![
                QaPair { question: "Smoker?".into(), answer: "no".into() },
                QaPair { question: "Medications".into(), answer: "ibuprofen, statin".into() },
            ]
        );
    }

    #[test]
    fn unlabeled_answers_get_positional_questions() {
        let p = obj(json!({ "id": 5, "answers": [{ "value": "yes" }, "stray string"] }));
        let x = extract(&p);
        assert_eq!(x.session_id.as_deref(), Some("5"));
        assert_eq!(x.answers, vec![QaPair { question: "Question 1".into(), answer: "yes".into() }]);
    }

    #[test]
    fn session_and_answers_are_found_in_any_wrapper() {
        let x = extract(&obj(json!({ "name": "A", "customer": { "session_id": "s-1" } })));
        assert_eq!(x.session_id.as_deref(), Some("s-1"));

        let y = extract(&obj(json!({
            "patient": { "name": "B", "id": 77, "answers": { "Any allergies?": "penicillin" } }
        })));
        assert_eq!(y.session_id, None);
        assert_eq!(
            y.answers,
            vec![QaPair { question: "Any allergies?".into(), answer: "penicillin".into() }]
        );

        let z = extract(&obj(json!({ "name": "C", "session": { "id": "chat-9" } })));
        assert_eq!(z.session_id.as_deref(), Some("chat-9"));
    }

    #[test]
    fn payload_without_identity_is_detected() {
        let x = extract(&obj(json!({ "answers": [] })));
        assert!(!x.has_identity());
        assert_eq!(x.display_name(), "Unknown patient");
    }

    #[test]
    fn phone_normalization() {
        assert_eq!(normalize_phone("0044 7700 900123").as_deref(), Some("+447700900123"));
        assert_eq!(normalize_phone("(555) 010-9999").as_deref(), Some("5550109999"));
        assert_eq!(normalize_phone("12345"), None);
        assert_eq!(normalize_phone("+1234567890123456"), None);
    }

    #[test]
    fn email_normalization() {
        assert_eq!(normalize_email(" Bob@Clinic.ORG ").as_deref(), Some("bob@clinic.org"));
        assert_eq!(normalize_email("bob@clinic"), None);
        assert_eq!(normalize_email("@clinic.org"), None);
        assert_eq!(normalize_email("bob@.org"), None);
        assert_eq!(normalize_email("not an email"), None);
    }

    #[test]
    fn age_bounds() {
        assert_eq!(parse_age(&json!(31.9)), Some(31));
        assert_eq!(parse_age(&json!("about 70")), Some(70));
        assert_eq!(parse_age(&json!(150)), None);
        assert_eq!(parse_age(&json!("unknown")), None);
        assert_eq!(parse_age(&json!(true)), None);
        assert_eq!(parse_age(&json!("-5")), None);
        assert_eq!(parse_age(&json!(-5)), None);
        assert_eq!(parse_age(&json!("age: -40 years")), None);
    }

    #[test]
    fn gender_mapping() {
        assert_eq!(normalize_gender("Man"), "male");
        assert_eq!(normalize_gender("non-binary"), "other");
        assert_eq!(normalize_gender("prefer not to say"), "unknown");
    }

    #[test]
    fn risk_hint_is_read_when_recognized() {
        let x = extract(&obj(json!({ "name": "A", "urgency": "URGENT" })));
        assert_eq!(x.risk_hint, Some(RiskLevel::High));
        let y = extract(&obj(json!({ "name": "A", "triage": "purple" })));
        assert_eq!(y.risk_hint, None);
    }
}
