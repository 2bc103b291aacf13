//! Field parsers for Indian KYC documents.
//!
//! Works on recognized text lines and pulls out every identifier the
//! classifier and the response schemas care about: PAN, Aadhaar and EPIC
//! (voter ID) numbers, date of birth, gender, and the holder's name in
//! Latin and Devanagari script. Parsing is type-agnostic; the orchestrator
//! later keeps only the fields belonging to the classified type (see
//! [`DocumentType::field_schema`](crate::models::DocumentType::field_schema)).
//!
//! Every rule is conservative: a field is emitted only when the text
//! contains something with the exact expected shape.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::TextRegion;

static TOKEN_10: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[A-Z0-9]{10}\b").unwrap());
static PAN_SHAPE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z]{5}[0-9]{4}[A-Z]$").unwrap());
static EPIC_SHAPE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z]{3}[0-9]{7}$").unwrap());
static DIGIT_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+(?: \d+)*").unwrap());
static DOB: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d{2}/\d{2}/\d{4})\b").unwrap());
static FEMALE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bfemale\b").unwrap());
static MALE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bmale\b").unwrap());
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Words that appear in card headers and labels and can never be part of
/// a holder's name.
const NAME_STOPWORDS: &[&str] = &[
    "ACCOUNT",
    "AADHAAR",
    "AUTHORITY",
    "BHARAT",
    "BIRTH",
    "CARD",
    "COMMISSION",
    "DEPARTMENT",
    "DOB",
    "ELECTION",
    "ELECTOR",
    "ENROLLMENT",
    "ENROLMENT",
    "FATHER",
    "FEMALE",
    "GOVERNMENT",
    "GOVT",
    "IDENTIFICATION",
    "IDENTITY",
    "INCOME",
    "INDIA",
    "MALE",
    "NAME",
    "NUMBER",
    "PERMANENT",
    "SARKAR",
    "SIGNATURE",
    "TAX",
    "UNIQUE",
];

/// Parse every recognizable field out of `regions`.
pub fn parse_fields(regions: &[TextRegion]) -> BTreeMap<String, String> {
    let lines: Vec<&str> = regions
        .iter()
        .map(|r| r.text.trim())
        .filter(|l| !l.is_empty())
        .collect();

    let mut out = BTreeMap::new();
    let mut put = |key: &str, value: Option<String>| {
        if let Some(v) = value {
            out.insert(key.to_string(), v);
        }
    };

    put("pan_number", find_token(&lines, &PAN_SHAPE));
    put("voter_id", find_token(&lines, &EPIC_SHAPE));
    put("aadhaar_number", find_aadhaar(&lines));
    put("date_of_birth", find_dob(&lines));
    put("gender", find_gender(&lines));

    let (latin, devanagari) = find_names(&lines);
    put("name", latin);
    put("name_hindi", devanagari);

    out
}

/// First 10-character alphanumeric token whose shape matches `shape`.
fn find_token(lines: &[&str], shape: &Regex) -> Option<String> {
    lines.iter().find_map(|line| {
        let upper = line.to_uppercase();
        TOKEN_10
            .find_iter(&upper)
            .map(|m| m.as_str())
            .find(|t| shape.is_match(t))
            .map(str::to_string)
    })
}

/// A run of exactly twelve digits, optionally grouped by single spaces.
/// Lines carrying the 16-digit virtual ID are skipped.
fn find_aadhaar(lines: &[&str]) -> Option<String> {
    lines
        .iter()
        .filter(|line| !line.to_uppercase().contains("VID"))
        .find_map(|line| {
            DIGIT_RUN.find_iter(line).find_map(|m| {
                let digits: String = m.as_str().chars().filter(char::is_ascii_digit).collect();
                (digits.len() == 12).then_some(digits)
            })
        })
}

fn find_dob(lines: &[&str]) -> Option<String> {
    lines
        .iter()
        .find_map(|line| DOB.captures(line).map(|c| c[1].to_string()))
}

fn find_gender(lines: &[&str]) -> Option<String> {
    let text = lines.join("\n");
    if FEMALE.is_match(&text) || text.contains("महिला") {
        Some("Female".to_string())
    } else if MALE.is_match(&text) || text.contains("पुरुष") {
        Some("Male".to_string())
    } else {
        None
    }
}

fn is_devanagari(text: &str) -> bool {
    text.chars().any(|c| ('\u{0900}'..='\u{097F}').contains(&c))
}

fn clean(text: &str) -> String {
    WHITESPACE
        .replace_all(text.replace(':', " ").trim(), " ")
        .trim()
        .to_string()
}

fn is_label_line(line: &str) -> bool {
    let upper = line.to_uppercase();
    (upper.contains("NAME") || line.contains("नाम")) && !upper.contains("FATHER")
}

fn is_plausible_latin_name(candidate: &str) -> bool {
    let words: Vec<&str> = candidate.split_whitespace().collect();
    if words.len() < 2 || words.len() > 5 {
        return false;
    }
    if candidate.chars().any(|c| c.is_ascii_digit()) || is_devanagari(candidate) {
        return false;
    }
    !words.iter().any(|w| {
        let bare: String = w
            .chars()
            .filter(|c| c.is_alphabetic())
            .collect::<String>()
            .to_uppercase();
        NAME_STOPWORDS.contains(&bare.as_str())
    })
}

/// Collect name candidates from labels, the line above the date of birth,
/// and all-caps lines, then keep the longest plausible one per script.
fn find_names(lines: &[&str]) -> (Option<String>, Option<String>) {
    let mut candidates: Vec<String> = Vec::new();

    for (i, line) in lines.iter().enumerate() {
        if is_label_line(line) {
            match line.split_once(':') {
                Some((_, rest)) if !rest.trim().is_empty() => candidates.push(clean(rest)),
                _ => {
                    if let Some(next) = lines.get(i + 1) {
                        candidates.push(clean(next));
                    }
                }
            }
        }
        if i > 0 && DOB.is_match(line) {
            candidates.push(clean(lines[i - 1]));
        }
        let cleaned = clean(line);
        if cleaned.chars().any(char::is_alphabetic)
            && cleaned == cleaned.to_uppercase()
            && !is_devanagari(&cleaned)
        {
            candidates.push(cleaned);
        }
    }

    let latin = longest(
        candidates
            .iter()
            .filter(|c| is_plausible_latin_name(c)),
    );
    let devanagari = longest(
        candidates
            .iter()
            .filter(|c| is_devanagari(c) && !c.contains("नाम")),
    );
    (latin, devanagari)
}

/// Longest candidate by character count; the first one wins ties.
fn longest<'a>(candidates: impl Iterator<Item = &'a String>) -> Option<String> {
    candidates
        .fold(None::<&String>, |best, c| match best {
            Some(b) if b.chars().count() >= c.chars().count() => Some(b),
            _ => Some(c),
        })
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regions(lines: &[&str]) -> Vec<TextRegion> {
        lines.iter().map(|l| TextRegion::new(*l, 0.9)).collect()
    }

    #[test]
    fn test_pan_card() {
        let fields = parse_fields(&regions(&[
            "INCOME TAX DEPARTMENT",
            "GOVT. OF INDIA",
            "RAVI KUMAR SHARMA",
            "MOHAN LAL SHARMA",
            "14/08/1988",
            "Permanent Account Number",
            "ABCPS1234K",
        ]));
        assert_eq!(fields.get("pan_number").unwrap(), "ABCPS1234K");
        assert_eq!(fields.get("date_of_birth").unwrap(), "14/08/1988");
        assert_eq!(fields.get("name").unwrap(), "RAVI KUMAR SHARMA");
        assert!(fields.get("aadhaar_number").is_none());
    }

    #[test]
    fn test_aadhaar_card() {
        let fields = parse_fields(&regions(&[
            "Government of India",
            "Anita Devi Verma",
            "DOB: 02/03/1991",
            "FEMALE",
            "4821 7730 1942",
            "VID : 9123 4567 8901 2345",
        ]));
        assert_eq!(fields.get("aadhaar_number").unwrap(), "482177301942");
        assert_eq!(fields.get("gender").unwrap(), "Female");
        assert_eq!(fields.get("date_of_birth").unwrap(), "02/03/1991");
        assert_eq!(fields.get("name").unwrap(), "Anita Devi Verma");
    }

    #[test]
    fn test_sixteen_digit_run_is_not_aadhaar() {
        let fields = parse_fields(&regions(&["1234 5678 9012 3456"]));
        assert!(fields.get("aadhaar_number").is_none());
    }

    #[test]
    fn test_voter_id_with_hindi_name() {
        let fields = parse_fields(&regions(&[
            "ELECTION COMMISSION OF INDIA",
            "IDENTITY CARD",
            "XYZ1234567",
            "निर्वाचक का नाम : रवि कुमार",
            "Elector's Name : RAVI KUMAR",
            "Father's Name : MOHAN KUMAR",
        ]));
        assert_eq!(fields.get("voter_id").unwrap(), "XYZ1234567");
        assert_eq!(fields.get("name").unwrap(), "RAVI KUMAR");
        assert_eq!(fields.get("name_hindi").unwrap(), "रवि कुमार");
    }

    #[test]
    fn test_gender_prefers_female_match() {
        let fields = parse_fields(&regions(&["महिला / Female"]));
        assert_eq!(fields.get("gender").unwrap(), "Female");
        let fields = parse_fields(&regions(&["पुरुष / MALE"]));
        assert_eq!(fields.get("gender").unwrap(), "Male");
    }

    #[test]
    fn test_header_lines_are_not_names() {
        let fields = parse_fields(&regions(&["GOVERNMENT OF INDIA", "INCOME TAX DEPARTMENT"]));
        assert!(fields.get("name").is_none());
    }

    #[test]
    fn test_empty_input() {
        assert!(parse_fields(&[]).is_empty());
    }
}
