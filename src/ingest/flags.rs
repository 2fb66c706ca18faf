//! Concern-keyword detection over patient answers and the resulting risk level.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }

    /// Accepts the vocabulary chatbots tend to use for urgency.
    pub fn parse_loose(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "high" | "urgent" | "emergency" | "severe" | "red" | "critical" => Some(RiskLevel::High),
            "medium" | "moderate" | "amber" | "yellow" | "elevated" => Some(RiskLevel::Medium),
            "low" | "routine" | "mild" | "green" | "none" | "minimal" => Some(RiskLevel::Low),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Medium,
    High,
}

const KEYWORDS: &[(&str, Severity)] = &[
    ("suicide", Severity::High),
    ("suicidal", Severity::High),
    ("kill myself", Severity::High),
    ("end my life", Severity::High),
    ("self-harm", Severity::High),
    ("self harm", Severity::High),
    ("hurt myself", Severity::High),
    ("overdose", Severity::High),
    ("chest pain", Severity::High),
    ("can't breathe", Severity::High),
    ("cannot breathe", Severity::High),
    ("difficulty breathing", Severity::High),
    ("shortness of breath", Severity::High),
    ("unconscious", Severity::High),
    ("passed out", Severity::High),
    ("seizure", Severity::High),
    ("severe bleeding", Severity::High),
    ("heart attack", Severity::High),
    ("stroke", Severity::High),
    ("coughing blood", Severity::High),
    ("vomiting blood", Severity::High),
    ("bleeding", Severity::Medium),
    ("fever", Severity::Medium),
    ("fainting", Severity::Medium),
    ("fainted", Severity::Medium),
    ("dizziness", Severity::Medium),
    ("dizzy", Severity::Medium),
    ("worsening", Severity::Medium),
    ("getting worse", Severity::Medium),
    ("severe pain", Severity::Medium),
    ("pregnant", Severity::Medium),
    ("infection", Severity::Medium),
    ("swelling", Severity::Medium),
    ("blurred vision", Severity::Medium),
    ("numbness", Severity::Medium),
    ("panic attack", Severity::Medium),
    ("hopeless", Severity::Medium),
    ("vomiting", Severity::Medium),
];

const NEGATORS: &[&str] = &[
    "no", "not", "never", "without", "denies", "deny", "don't", "dont", "nor", "none",
];
const CLAUSE_BREAKERS: &[&str] = &["but", "however", "although", "though", "except"];
const CONJUNCTIONS: &[&str] = &["and", "or", "with", "plus"];
const NEGATION_WINDOW: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagMatch {
    pub keyword: &'static str,
    pub severity: Severity,
}

/// All concern keywords found in `text`, in order of appearance.
///
/// A keyword nested inside a longer match ("bleeding" in "severe bleeding") is
/// reported once, as the longer phrase. Negated mentions ("no chest pain") are ignored.
pub fn detect(text: &str) -> Vec<FlagMatch> {
    let lowered = text.to_lowercase().replace(['\u{2019}', '\u{2018}'], "'");
    let mut spans: Vec<(usize, usize, FlagMatch)> = Vec::new();

    for &(keyword, severity) in KEYWORDS {
        let mut from = 0;
        while let Some(pos) = lowered[from..].find(keyword) {
            let start = from + pos;
            let end = start + keyword.len();
            from = end;

            if !at_word_boundary(&lowered, start, end) || is_negated(&lowered[..start]) {
                continue;
            }
            spans.push((start, end, FlagMatch { keyword, severity }));
        }
    }

    let covered: Vec<bool> = spans
        .iter()
        .map(|(s, e, _)| {
            spans
                .iter()
                .any(|(os, oe, _)| os <= s && e <= oe && (oe - os) > (e - s))
        })
        .collect();

    let mut kept: Vec<(usize, FlagMatch)> = spans
        .iter()
        .zip(covered)
        .filter(|(_, inside)| !inside)
        .map(|((s, _, m), _)| (*s, *m))
        .collect();
    kept.sort_by_key(|(s, _)| *s);

    let mut out: Vec<FlagMatch> = Vec::new();
    for (_, m) in kept {
        if !out.iter().any(|o| o.keyword == m.keyword) {
            out.push(m);
        }
    }
    out
}

fn at_word_boundary(text: &str, start: usize, end: usize) -> bool {
    let before = text[..start].chars().next_back();
    let after = text[end..].chars().next();
    !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
}

fn is_negated(preceding: &str) -> bool {
    let clause = match preceding.rfind(['.', ',', ';', '!', '?', '\n']) {
        Some(i) => &preceding[i + 1..],
        None => preceding,
    };

    // Walks backwards from the keyword. A conjunction ends the negated phrase
    // unless it is itself followed by a negator ("no fever and no chest pain").
    let mut after: Option<&str> = None;
    for word in clause.split_whitespace().rev().take(NEGATION_WINDOW) {
        let word = word.trim_matches(|c: char| !c.is_alphanumeric() && c != '\'');
        if CLAUSE_BREAKERS.contains(&word) {
            return false;
        }
        if CONJUNCTIONS.contains(&word) {
            return after.is_some_and(|next| NEGATORS.contains(&next));
        }
        if NEGATORS.contains(&word) {
            return true;
        }
        after = Some(word);
    }
    false
}

/// `"high: chest pain; medium: fever"`, or `None` when nothing matched.
pub fn flag_reason(matches: &[FlagMatch]) -> Option<String> {
    if matches.is_empty() {
        return None;
    }
    let group = |sev: Severity, label: &str| {
        let words: Vec<&str> = matches
            .iter()
            .filter(|m| m.severity == sev)
            .map(|m| m.keyword)
            .collect();
        (!words.is_empty()).then(|| format!("{label}: {}", words.join(", ")))
    };
    let parts: Vec<String> = [group(Severity::High, "high"), group(Severity::Medium, "medium")]
        .into_iter()
        .flatten()
        .collect();
    Some(parts.join("; "))
}

/// Risk implied by the flags raised across all answers.
pub fn risk_from_flags<'a>(matches: impl IntoIterator<Item = &'a FlagMatch>) -> RiskLevel {
    matches
        .into_iter()
        .map(|m| match m.severity {
            Severity::High => RiskLevel::High,
            Severity::Medium => RiskLevel::Medium,
        })
        .max()
        .unwrap_or(RiskLevel::Low)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keywords(text: &str) -> Vec<&'static str> {
        detect(text).into_iter().map(|m| m.keyword).collect()
    }

    #[test]
    fn finds_keywords_case_insensitively() {
        assert_eq!(keywords("Sudden CHEST PAIN and a Fever"), vec!["chest pain", "fever"]);
    }

    #[test]
    fn respects_word_boundaries() {
        assert!(keywords("I had a nosebleeding stop").is_empty());
        assert!(keywords("strokes of luck").is_empty());
        assert_eq!(keywords("stroke?"), vec!["stroke"]);
    }

    #[test]
    fn longer_phrase_wins_over_nested_keyword() {
        let found = detect("there is severe bleeding from the cut");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].keyword, "severe bleeding");
        assert_eq!(found[0].severity, Severity::High);
    }

    #[test]
    fn negated_mentions_are_ignored() {
        assert!(keywords("No chest pain, not suicidal").is_empty());
        assert!(keywords("I don't have a fever").is_empty());
        assert!(keywords("denies any dizziness").is_empty());
    }

    #[test]
    fn negation_stops_at_clause_boundaries() {
        assert_eq!(keywords("no fever, but chest pain"), vec!["chest pain"]);
        assert_eq!(keywords("no cough but fever"), vec!["fever"]);
        assert_eq!(keywords("Not sleeping. Feeling hopeless"), vec!["hopeless"]);
        assert_eq!(keywords("I have no appetite and chest pain"), vec!["chest pain"]);
        assert!(keywords("no fever and no chest pain").is_empty());
        assert_eq!(keywords("no cough, just aches with vomiting"), vec!["vomiting"]);
    }

    #[test]
    fn curly_apostrophes_are_normalized() {
        assert_eq!(keywords("I can\u{2019}t breathe properly"), vec!["can't breathe"]);
    }

    #[test]
    fn repeated_keyword_reported_once() {
        assert_eq!(keywords("fever at night, fever in the morning"), vec!["fever"]);
    }

    #[test]
    fn reason_groups_by_severity() {
        let m = detect("fever and chest pain, also dizzy");
        assert_eq!(
            flag_reason(&m).as_deref(),
            Some("high: chest pain; medium: fever, dizzy")
        );
        assert_eq!(flag_reason(&[]), None);
    }

    #[test]
    fn risk_levels() {
        assert_eq!(risk_from_flags(&detect("fine thanks")), RiskLevel::Low);
        assert_eq!(risk_from_flags(&detect("mild fever")), RiskLevel::Medium);
        assert_eq!(risk_from_flags(&detect("fever, overdose")), RiskLevel::High);
    }

    #[test]
    fn loose_risk_parsing() {
        assert_eq!(RiskLevel::parse_loose(" Moderate "), Some(RiskLevel::Medium));
        assert_eq!(RiskLevel::parse_loose("routine"), Some(RiskLevel::Low));
        assert_eq!(RiskLevel::parse_loose("??"), None);
        assert_eq!(RiskLevel::High.as_str(), "high");
    }
}
