//! Input validation and prompt-injection screening (SPEC_FULL.md S4.E), grounded in the
//! original `input_validation.py` middleware.

use regex::RegexSet;

use crate::{Error, Result};

/// Default maximum input length, in characters.
pub const MAX_INPUT_LENGTH: usize = 4000;

/// Patterns that may indicate a prompt-injection attempt. Checked case-insensitively.
const PROMPT_INJECTION_PATTERNS: &[&str] = &[
    r"ignore\s+(previous|all|above)\s+(instructions?|prompts?|rules?)",
    r"disregard\s+(previous|all|above)",
    r"forget\s+(everything|all|previous)",
    r"new\s+instructions?:",
    r"system\s*:\s*",
    r"<\|system\|>",
    r"<\|assistant\|>",
    r"you\s+are\s+now\s+(a\s+)?different",
    r"pretend\s+(to\s+be|you\s+are)",
    r"act\s+as\s+(if|a)",
    r"roleplay\s+as",
    r"DAN\s+mode",
    r"developer\s+mode",
    r"bypass\s+(filters?|restrictions?|safety)",
    r"unlock\s+(hidden|secret)",
    r"\[\s*INST\s*\]",
    r"\[\s*SYS(TEM)?\s*\]",
    r"</?(system|user|assistant)>",
];

/// Character-markup escapes applied after injection screening, so the escaped form of a
/// blocked pattern is never what gets checked against it.
const ESCAPE_REPLACEMENTS: &[(&str, &str)] = &[
    ("<script", "&lt;script"),
    ("</script", "&lt;/script"),
    ("javascript:", "javascript&#58;"),
];

/// Metadata describing what a [`Validator::validate`] pass did to the input.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationMetadata {
    pub original_length: usize,
    pub sanitized: bool,
    pub sanitized_length: usize,
}

/// Compiled input validator. Construction compiles the injection pattern set once;
/// `validate` is cheap to call repeatedly.
pub struct Validator {
    max_length: usize,
    check_injection: bool,
    injection_patterns: RegexSet,
}

impl Validator {
    /// Build a validator with the default pattern set and length limit.
    pub fn new() -> Self {
        Self::with_config(MAX_INPUT_LENGTH, true, &[])
    }

    /// Build a validator with a custom length limit, injection toggle, and additional
    /// patterns appended to the built-in set.
    pub fn with_config(max_length: usize, check_injection: bool, custom_patterns: &[&str]) -> Self {
        let patterns: Vec<&str> = PROMPT_INJECTION_PATTERNS
            .iter()
            .copied()
            .chain(custom_patterns.iter().copied())
            .collect();

        let injection_patterns = RegexSet::new(
            patterns
                .iter()
                .map(|p| format!("(?i){p}")),
        )
        .expect("built-in prompt-injection patterns must compile");

        Self {
            max_length,
            check_injection,
            injection_patterns,
        }
    }

    /// Validate and sanitize a piece of user input.
    ///
    /// Returns the sanitized text plus metadata describing the transformation, or an
    /// `Error::EmptyInput` / `Error::InputTooLong` / `Error::PromptInjection` on rejection.
    pub fn validate(&self, text: &str) -> Result<(String, ValidationMetadata)> {
        let original_length = text.chars().count();

        if text.trim().is_empty() {
            return Err(Error::EmptyInput);
        }

        if original_length > self.max_length {
            return Err(Error::input_too_long(original_length, self.max_length));
        }

        let normalized = normalize_whitespace(text);

        if self.check_injection {
            if let Some(idx) = self.injection_patterns.matches(&normalized).iter().next() {
                let pattern = PROMPT_INJECTION_PATTERNS
                    .get(idx)
                    .copied()
                    .unwrap_or("custom pattern");
                tracing::warn!(
                    pattern,
                    preview = %normalized.chars().take(100).collect::<String>(),
                    "prompt injection detected"
                );
                return Err(Error::prompt_injection(pattern));
            }
        }

        let sanitized = escape_special_chars(&normalized);
        let sanitized_length = sanitized.chars().count();

        let metadata = ValidationMetadata {
            original_length,
            sanitized: sanitized != text,
            sanitized_length,
        };

        Ok((sanitized, metadata))
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize_whitespace(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut last_was_space = false;
    let mut newline_run = 0usize;

    for ch in text.chars() {
        match ch {
            ' ' | '\t' => {
                if !last_was_space {
                    result.push(' ');
                }
                last_was_space = true;
                newline_run = 0;
            }
            '\n' => {
                newline_run += 1;
                if newline_run <= 2 {
                    result.push('\n');
                }
                last_was_space = false;
            }
            _ => {
                result.push(ch);
                last_was_space = false;
                newline_run = 0;
            }
        }
    }

    result.trim().to_string()
}

fn escape_special_chars(text: &str) -> String {
    let mut out = text.to_string();
    for (old, new) in ESCAPE_REPLACEMENTS {
        out = out.replace(old, new);
    }
    out
}

/// Validate a single piece of input using the default validator configuration.
pub fn validate_input(text: &str) -> Result<String> {
    let validator = Validator::new();
    validator.validate(text).map(|(sanitized, _)| sanitized)
}
