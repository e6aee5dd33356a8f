//! Turn intent classification and entity extraction (SPEC_FULL.md S9.2), grounded in the
//! original `metadata.py` middleware.

use std::sync::LazyLock;

use regex::Regex;

use crate::types::{Entity, Intent};

const GREETING_WORDS: &[&str] = &["hello", "hi", "hey", "안녕", "你好", "こんにちは"];
const THANKS_WORDS: &[&str] = &["thank", "thanks", "감사", "谢谢", "ありがとう"];
const FAREWELL_WORDS: &[&str] = &["bye", "goodbye", "see you", "안녕히", "再见", "さようなら"];
const QUESTION_WORDS: &[&str] = &["what", "where", "when", "how", "why", "which", "can you"];
const SEARCH_WORDS: &[&str] = &["find", "search", "look for", "recommend", "suggest"];
const DIRECTIONS_WORDS: &[&str] = &["direction", "route", "how to get", "way to"];
const ITINERARY_WORDS: &[&str] = &["itinerary", "schedule", "plan", "day trip"];
const SAVE_WORDS: &[&str] = &["save", "remember", "note"];
const MODIFICATION_WORDS: &[&str] = &["change", "modify", "update", "instead"];

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|w| haystack.contains(w))
}

/// Classify a user message's intent via an ordered keyword-rule cascade; first match
/// wins, default [`Intent::General`].
pub fn classify_intent(message: &str) -> Intent {
    let lower = message.to_lowercase();

    if contains_any(&lower, GREETING_WORDS) {
        return Intent::Greeting;
    }
    if contains_any(&lower, THANKS_WORDS) {
        return Intent::Thanks;
    }
    if contains_any(&lower, FAREWELL_WORDS) {
        return Intent::Farewell;
    }
    if message.contains('?') || contains_any(&lower, QUESTION_WORDS) {
        return Intent::Question;
    }
    if contains_any(&lower, SEARCH_WORDS) {
        return Intent::SearchRequest;
    }
    if contains_any(&lower, DIRECTIONS_WORDS) {
        return Intent::DirectionsRequest;
    }
    if contains_any(&lower, ITINERARY_WORDS) {
        return Intent::ItineraryRequest;
    }
    if contains_any(&lower, SAVE_WORDS) {
        return Intent::SaveRequest;
    }
    if contains_any(&lower, MODIFICATION_WORDS) {
        return Intent::Modification;
    }

    Intent::General
}

static KOREAN_PLACE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\p{Hangul}]{2,}(?:궁|사|역|동|구|시|도|산|강|해변|공원|시장|거리)").unwrap()
});

static ENGLISH_PLACE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:Gyeongbokgung|Bukchon|Myeongdong|Hongdae|Gangnam|Itaewon|Insadong|Namdaemun|Dongdaemun|N Seoul Tower|Lotte Tower|Namsan|Han River|Cheonggyecheon)\b",
    )
    .unwrap()
});

static DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:\d{1,2}/\d{1,2}|\d{4}-\d{2}-\d{2}|(?:Jan|Feb|Mar|Apr|May|Jun|Jul|Aug|Sep|Oct|Nov|Dec)[a-z]* \d{1,2}|tomorrow|today|next (?:week|month)|(?:Mon|Tue|Wed|Thu|Fri|Sat|Sun)[a-z]*day)\b",
    )
    .unwrap()
});

static BUDGET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(\d{1,3}(?:,\d{3})*)\s*(?:won|krw|원)\b").unwrap());

static TIME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(\d{1,2}(?::\d{2})?\s*(?:am|pm|AM|PM)?)\b").unwrap());

/// Extract lightweight entities (places, dates, budgets, times) from a turn's text via
/// regex pattern matching, in extraction order with duplicates removed case-insensitively.
pub fn extract_entities(user_message: &str, assistant_message: Option<&str>) -> Vec<Entity> {
    let combined = match assistant_message {
        Some(reply) => format!("{user_message} {reply}"),
        None => user_message.to_string(),
    };

    let mut entities = Vec::new();

    for m in KOREAN_PLACE_RE.find_iter(&combined) {
        entities.push(Entity {
            entity_type: "place".to_string(),
            value: m.as_str().to_string(),
        });
    }
    for m in ENGLISH_PLACE_RE.find_iter(&combined) {
        entities.push(Entity {
            entity_type: "place".to_string(),
            value: m.as_str().to_string(),
        });
    }
    for m in DATE_RE.find_iter(&combined) {
        entities.push(Entity {
            entity_type: "date".to_string(),
            value: m.as_str().to_string(),
        });
    }
    for cap in BUDGET_RE.captures_iter(&combined) {
        entities.push(Entity {
            entity_type: "budget".to_string(),
            value: cap[1].to_string(),
        });
    }
    for m in TIME_RE.find_iter(&combined) {
        let value = m.as_str().trim();
        if !value.is_empty() {
            entities.push(Entity {
                entity_type: "time".to_string(),
                value: value.to_string(),
            });
        }
    }

    let mut seen = std::collections::HashSet::new();
    entities.retain(|e| {
        let key = format!("{}:{}", e.entity_type, e.value.to_lowercase());
        seen.insert(key)
    });

    entities
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greeting_detected() {
        assert_eq!(classify_intent("Hello there!"), Intent::Greeting);
        assert_eq!(classify_intent("안녕하세요"), Intent::Greeting);
    }

    #[test]
    fn test_question_detected_by_mark_or_keyword() {
        assert_eq!(classify_intent("What time does it open?"), Intent::Question);
        assert_eq!(classify_intent("is this open"), Intent::General);
    }

    #[test]
    fn test_search_request() {
        assert_eq!(classify_intent("can you recommend a good restaurant"), Intent::Question);
        assert_eq!(classify_intent("find me a good restaurant"), Intent::SearchRequest);
    }

    #[test]
    fn test_itinerary_and_modification() {
        assert_eq!(classify_intent("help me plan my itinerary"), Intent::ItineraryRequest);
        assert_eq!(classify_intent("can we change the plan"), Intent::Question);
        assert_eq!(classify_intent("please modify the schedule"), Intent::ItineraryRequest);
    }

    #[test]
    fn test_default_general() {
        assert_eq!(classify_intent("the weather is nice today"), Intent::General);
    }

    #[test]
    fn test_extract_english_place_entities() {
        let entities = extract_entities("Let's meet at Gangnam tomorrow", None);
        assert!(entities.iter().any(|e| e.entity_type == "place" && e.value == "Gangnam"));
        assert!(entities.iter().any(|e| e.entity_type == "date" && e.value == "tomorrow"));
    }

    #[test]
    fn test_extract_budget_entities() {
        let entities = extract_entities("my budget is 50,000 won", None);
        assert!(entities.iter().any(|e| e.entity_type == "budget" && e.value == "50,000"));
    }

    #[test]
    fn test_extract_deduplicates_case_insensitively() {
        let entities = extract_entities("Gangnam is great, gangnam is fun", None);
        let place_count = entities
            .iter()
            .filter(|e| e.entity_type == "place")
            .count();
        assert_eq!(place_count, 1);
    }

    #[test]
    fn test_extract_combines_user_and_assistant_messages() {
        let entities = extract_entities("where should I go", Some("Try Myeongdong"));
        assert!(entities.iter().any(|e| e.value == "Myeongdong"));
    }
}
