//! Language detection and routing for bilingual queries.
//!
//! Decides the response language once per query, before retrieval or
//! generation start. Resolution is a pure function of the query text, the
//! caller's preference, and the configured fallback language.

use serde::{Deserialize, Serialize};

/// A supported response language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Fr,
    Ar,
}

impl Language {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Fr => "fr",
            Self::Ar => "ar",
        }
    }

    /// Parse a language code leniently. Returns `None` for `auto`, empty, or
    /// unrecognized input (callers fall back to script detection).
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_lowercase();
        match normalized.as_str() {
            "fr" | "french" | "francais" | "français" => Some(Self::Fr),
            "ar" | "arabic" | "العربية" => Some(Self::Ar),
            "" | "auto" => None,
            other => {
                tracing::warn!(code = %other, "Unknown language code, falling back to auto");
                None
            }
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Caller-supplied language preference, as received on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LanguagePreference {
    #[default]
    Auto,
    Fr,
    Ar,
}

impl LanguagePreference {
    pub fn as_override(&self) -> Option<Language> {
        match self {
            Self::Auto => None,
            Self::Fr => Some(Language::Fr),
            Self::Ar => Some(Language::Ar),
        }
    }
}

/// How the response language was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RouteMethod {
    /// The caller set the language explicitly in the request.
    Explicit,
    /// The query contained a natural-language "answer in ..." instruction.
    KeywordOverride,
    /// Decided by counting script characters, or the configured fallback.
    ScriptDetection,
}

/// The routing decision for one query. Produced once, never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LanguageDecision {
    pub language: Language,
    pub method: RouteMethod,
}

// Phrases that request a response language regardless of the query's script.
// Checked as substrings of the lowercased query, French requests first.
const FRENCH_REQUESTS: &[&str] = &[
    "en francais",
    "in french",
    "بالفرنسية",
    "answer in french",
    "repondre en francais",
    "أجب بالفرنسية",
];

const ARABIC_REQUESTS: &[&str] = &[
    "en arabe",
    "in arabic",
    "بالعربية",
    "answer in arabic",
    "repondre en arabe",
    "أجب بالعربية",
];

/// Resolve the response language for a query.
///
/// Precedence: explicit override, then in-text request phrases, then script
/// detection with `fallback` covering ties and unclassifiable input.
pub fn resolve(text: &str, explicit: Option<Language>, fallback: Language) -> LanguageDecision {
    if let Some(language) = explicit {
        return LanguageDecision {
            language,
            method: RouteMethod::Explicit,
        };
    }

    let lowered = text.to_lowercase();
    for phrase in FRENCH_REQUESTS {
        if lowered.contains(phrase) {
            return LanguageDecision {
                language: Language::Fr,
                method: RouteMethod::KeywordOverride,
            };
        }
    }
    for phrase in ARABIC_REQUESTS {
        if lowered.contains(phrase) {
            return LanguageDecision {
                language: Language::Ar,
                method: RouteMethod::KeywordOverride,
            };
        }
    }

    LanguageDecision {
        language: detect_script(text, fallback),
        method: RouteMethod::ScriptDetection,
    }
}

/// Classify text as Arabic or French by script prevalence.
///
/// Counts characters in the Arabic block (U+0600..=U+06FF) against all
/// alphabetic characters; a strict majority wins. Ties and text with no
/// alphabetic characters resolve to `fallback`.
fn detect_script(text: &str, fallback: Language) -> Language {
    let mut arabic = 0usize;
    let mut total = 0usize;
    for c in text.chars() {
        if ('\u{0600}'..='\u{06FF}').contains(&c) {
            arabic += 1;
            total += 1;
        } else if c.is_alphabetic() {
            total += 1;
        }
    }

    if total == 0 {
        return fallback;
    }
    match (arabic * 2).cmp(&total) {
        std::cmp::Ordering::Greater => Language::Ar,
        std::cmp::Ordering::Less => Language::Fr,
        std::cmp::Ordering::Equal => fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_override_beats_script() {
        // Arabic-script query, explicit French request wins
        let decision = resolve("ما هي مدة عقد الإيجار؟", Some(Language::Fr), Language::Fr);
        assert_eq!(decision.language, Language::Fr);
        assert_eq!(decision.method, RouteMethod::Explicit);
    }

    #[test]
    fn latin_script_resolves_french() {
        let decision = resolve("Résumé l'article 15", None, Language::Fr);
        assert_eq!(decision.language, Language::Fr);
        assert_eq!(decision.method, RouteMethod::ScriptDetection);
    }

    #[test]
    fn arabic_script_resolves_arabic() {
        let decision = resolve("ما هي شروط الطلاق في القانون؟", None, Language::Fr);
        assert_eq!(decision.language, Language::Ar);
        assert_eq!(decision.method, RouteMethod::ScriptDetection);
    }

    #[test]
    fn keyword_override_in_arabic_query() {
        // Arabic query asking for a French answer
        let decision = resolve("اشرح المادة 15 بالفرنسية", None, Language::Fr);
        assert_eq!(decision.language, Language::Fr);
        assert_eq!(decision.method, RouteMethod::KeywordOverride);
    }

    #[test]
    fn keyword_override_case_insensitive() {
        let decision = resolve("Explain article 340, ANSWER IN ARABIC", None, Language::Fr);
        assert_eq!(decision.language, Language::Ar);
        assert_eq!(decision.method, RouteMethod::KeywordOverride);
    }

    #[test]
    fn no_alphabetic_chars_uses_fallback() {
        let decision = resolve("12345 ?!", None, Language::Ar);
        assert_eq!(decision.language, Language::Ar);
        assert_eq!(decision.method, RouteMethod::ScriptDetection);

        let decision = resolve("", None, Language::Fr);
        assert_eq!(decision.language, Language::Fr);
    }

    #[test]
    fn mixed_script_majority_wins() {
        // Mostly Arabic with a couple of Latin letters
        let decision = resolve("ما حكم عقد BOT في القانون", None, Language::Fr);
        assert_eq!(decision.language, Language::Ar);
    }

    #[test]
    fn resolve_is_deterministic() {
        let a = resolve("Quels sont les délais de recours ?", None, Language::Fr);
        let b = resolve("Quels sont les délais de recours ?", None, Language::Fr);
        assert_eq!(a, b);
    }

    #[test]
    fn parse_is_lenient() {
        assert_eq!(Language::parse("FR"), Some(Language::Fr));
        assert_eq!(Language::parse("français"), Some(Language::Fr));
        assert_eq!(Language::parse("arabic"), Some(Language::Ar));
        assert_eq!(Language::parse("auto"), None);
        assert_eq!(Language::parse("klingon"), None);
    }
}
