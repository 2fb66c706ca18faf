//! Clinic-name normalisation: mapping free-text locations typed into the chatbot
//! ("the northside clinic", "NORTHSIDE", "Northside Medical Centre") onto one row.

use std::collections::HashSet;

use uuid::Uuid;

const FILLER_WORDS: &[&str] = &[
    "the", "clinic", "clinics", "centre", "center", "branch", "medical", "health",
    "hospital", "practice", "surgery", "of", "at",
];

const MIN_CONTAINMENT_LEN: usize = 3;
const MIN_TOKEN_OVERLAP: f64 = 0.5;

fn tokens(raw: &str) -> Vec<String> {
    raw.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Comparison key: lower-case words with punctuation and filler words removed.
pub fn clinic_key(raw: &str) -> String {
    tokens(raw)
        .into_iter()
        .filter(|t| !FILLER_WORDS.contains(&t.as_str()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// URL-friendly identifier stored in `clinic.slug`.
pub fn slugify(raw: &str) -> String {
    tokens(raw).join("-")
}

/// Trimmed, whitespace-collapsed, title-cased name for a newly created clinic.
pub fn display_name(raw: &str) -> String {
    raw.split_whitespace()
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

fn token_overlap(a: &str, b: &str) -> f64 {
    let a: HashSet<&str> = a.split(' ').collect();
    let b: HashSet<&str> = b.split(' ').collect();
    let union = a.union(&b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(&b).count() as f64 / union as f64
}

/// Picks the known clinic that `raw` most plausibly refers to.
///
/// Exact key match first, then containment in either direction (longest candidate
/// wins), then the best token overlap of at least one half.
pub fn best_match<'a>(raw: &str, known: impl IntoIterator<Item = (Uuid, &'a str)>) -> Option<Uuid> {
    let key = clinic_key(raw);
    if key.is_empty() {
        return None;
    }

    let candidates: Vec<(Uuid, String)> = known
        .into_iter()
        .map(|(id, name)| (id, clinic_key(name)))
        .filter(|(_, k)| !k.is_empty())
        .collect();

    if let Some((id, _)) = candidates.iter().find(|(_, k)| *k == key) {
        return Some(*id);
    }

    let contained = candidates
        .iter()
        .filter(|(_, k)| {
            let shorter = k.len().min(key.len());
            shorter >= MIN_CONTAINMENT_LEN && (k.contains(&key) || key.contains(k.as_str()))
        })
        .max_by_key(|(_, k)| k.len());
    if let Some((id, _)) = contained {
        return Some(*id);
    }

    candidates
        .iter()
        .map(|(id, k)| (*id, token_overlap(&key, k)))
        .filter(|(_, score)| *score >= MIN_TOKEN_OVERLAP)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(id, _)| id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (Uuid, Uuid, Uuid) {
        (Uuid::from_u128(1), Uuid::from_u128(2), Uuid::from_u128(3))
    }

    fn known() -> Vec<(Uuid, &'static str)> {
        let (a, b, c) = ids();
        vec![
            (a, "Northside Clinic"),
            (b, "St. Mary's Medical Centre"),
            (c, "East Harbor Family Practice"),
        ]
    }

    #[test]
    fn key_drops_filler_and_punctuation() {
        assert_eq!(clinic_key("The Northside Clinic!"), "northside");
        assert_eq!(clinic_key("St. Mary's Medical Centre"), "st mary s");
        assert_eq!(clinic_key("The Clinic"), "");
    }

    #[test]
    fn slug_and_display_name() {
        assert_eq!(slugify("  St. Mary's  Centre "), "st-mary-s-centre");
        assert_eq!(display_name("  dOWNTOWN   walk-in "), "Downtown Walk-in");
    }

    #[test]
    fn exact_key_match() {
        let (a, ..) = ids();
        assert_eq!(best_match("northside", known()), Some(a));
        assert_eq!(best_match("NORTHSIDE CENTER", known()), Some(a));
    }

    #[test]
    fn containment_match() {
        let (_, b, c) = ids();
        assert_eq!(best_match("St Mary's", known()), Some(b));
        assert_eq!(best_match("harbor", known()), Some(c));
    }

    #[test]
    fn token_overlap_match() {
        let (.., c) = ids();
        assert_eq!(best_match("Harbor Family", known()), Some(c));
        assert_eq!(best_match("East Family Clinic", known()), Some(c));
    }

    #[test]
    fn no_match_for_unrelated_or_empty_names() {
        assert_eq!(best_match("Westfield", known()), None);
        assert_eq!(best_match("the clinic", known()), None);
        assert_eq!(best_match("st", known()), None);
        assert_eq!(best_match("anything", Vec::new()), None);
    }
}
