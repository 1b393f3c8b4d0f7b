//! Keyword-signal query classifier — the fast path's decision oracle.
//!
//! Classification is a pure function over the query text, the caller's
//! modality hint, and any context key/values. It makes no network calls and
//! holds no locks, so it finishes in well under ten milliseconds even for
//! the largest accepted queries.
//!
//! Two stages:
//!
//! 1. **Keyword votes.** A static table maps lowercased patterns to weighted
//!    votes for a use case. Single-word patterns match token prefixes
//!    (`analy` → "analyze", "analysis"); multi-word patterns match as
//!    substrings of the lowered query.
//! 2. **Modality tiebreak.** A non-unknown modality hint adds a fixed boost
//!    to every use case whose affinity set contains it.
//!
//! The winner is the highest score; ties break lexicographically by use-case
//! name so classification is deterministic. Below a minimum summed score the
//! result defaults to `agent` — the safe general-purpose fallback.

use std::collections::BTreeMap;

use crate::usecase::{Modality, UseCase};

/// Fixed boost granted by a matching modality hint.
const MODALITY_BOOST: f64 = 0.5;

/// Context values vote with this fraction of a query match's weight.
const CONTEXT_WEIGHT: f64 = 0.5;

/// Summed score below which the classifier falls back to `agent`.
const SCORE_FLOOR: f64 = 0.2;

const EPS: f64 = 1e-9;

/// Weighted signal patterns per use case.
///
/// Weights encode precedence between conflicting signals: `transcribe`
/// outweighs `speak`, so "transcribe this, then speak it back" routes to
/// `stt` rather than `tts`.
const SIGNALS: &[(UseCase, &[(&str, f64)])] = &[
    (
        UseCase::Agent,
        &[
            ("code", 1.0),
            ("function", 1.0),
            ("write", 0.8),
            ("generate", 0.6),
            ("reason", 0.8),
            ("analy", 0.8),
            ("summar", 0.8),
            ("explain", 0.6),
        ],
    ),
    (
        UseCase::Avatar,
        &[
            ("avatar", 1.5),
            ("lip sync", 1.5),
            ("lip-sync", 1.5),
            ("talking head", 1.5),
            ("face", 0.8),
        ],
    ),
    (
        UseCase::Multimodal,
        &[
            ("image", 1.2),
            ("picture", 1.2),
            ("photo", 1.2),
            ("visual", 1.0),
            ("diagram", 1.0),
        ],
    ),
    (
        UseCase::Stt,
        &[
            ("transcri", 1.6),
            ("speech to text", 1.6),
            ("audio", 1.0),
            ("recording", 1.0),
            ("voice", 0.6),
        ],
    ),
    (
        UseCase::Tts,
        &[
            ("text to speech", 1.6),
            ("synthesize", 1.2),
            ("read aloud", 1.2),
            ("speak", 1.0),
            ("narrate", 1.0),
        ],
    ),
    (
        UseCase::Video,
        &[("video", 1.4), ("clip", 0.8), ("frame", 0.8), ("scene", 0.8)],
    ),
];

/// Outcome of a classification. Pure value; never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationResult {
    pub use_case: UseCase,
    /// Winning share of the total score, clamped to `[0, 1]`. A value of 0
    /// tells callers the decision is a pure default.
    pub confidence: f64,
    /// Patterns that voted for the winner, in table order.
    pub matched_signals: Vec<String>,
}

/// Classify a request. Never fails; the weakest possible outcome is
/// `agent` with confidence 0.
pub fn classify(
    query: &str,
    modality: Modality,
    context: &BTreeMap<String, String>,
) -> ClassificationResult {
    if query.trim().is_empty() {
        return ClassificationResult {
            use_case: UseCase::Agent,
            confidence: 0.0,
            matched_signals: Vec::new(),
        };
    }

    let lowered = query.to_lowercase();
    let tokens = tokenize(&lowered);
    let context_lowered: Vec<String> = context.values().map(|v| v.to_lowercase()).collect();

    let mut scores = [0.0_f64; UseCase::ALL.len()];
    let mut matched: Vec<Vec<String>> = vec![Vec::new(); UseCase::ALL.len()];

    for (idx, case) in UseCase::ALL.iter().enumerate() {
        for (pattern, weight) in signal_table(*case).iter().copied() {
            if pattern_matches(pattern, &lowered, &tokens) {
                scores[idx] += weight;
                matched[idx].push(pattern.to_string());
            } else if context_lowered.iter().any(|v| {
                let ctx_tokens = tokenize(v);
                pattern_matches(pattern, v, &ctx_tokens)
            }) {
                scores[idx] += weight * CONTEXT_WEIGHT;
                matched[idx].push(pattern.to_string());
            }
        }
        if modality != Modality::Unknown && case.modality_affinity().contains(&modality) {
            scores[idx] += MODALITY_BOOST;
        }
    }

    let sum: f64 = scores.iter().sum();
    if sum < SCORE_FLOOR {
        return ClassificationResult {
            use_case: UseCase::Agent,
            confidence: sum.min(0.2),
            matched_signals: Vec::new(),
        };
    }

    // First strictly-greater score wins; ALL is in lexicographic order, so
    // ties resolve to the lexicographically smaller name.
    let mut winner = 0;
    for idx in 1..UseCase::ALL.len() {
        if scores[idx] > scores[winner] {
            winner = idx;
        }
    }

    ClassificationResult {
        use_case: UseCase::ALL[winner],
        confidence: (scores[winner] / (sum + EPS)).clamp(0.0, 1.0),
        matched_signals: std::mem::take(&mut matched[winner]),
    }
}

/// All signal patterns matched by `query`, deduplicated, in table order.
///
/// This is the keyword bag the context fingerprint is built from — a query
/// matching none of the tables carries no routing signal at all.
pub fn signal_keywords(query: &str) -> Vec<&'static str> {
    let lowered = query.to_lowercase();
    let tokens = tokenize(&lowered);
    let mut out: Vec<&'static str> = Vec::new();
    for (_, table) in SIGNALS {
        for (pattern, _) in table.iter().copied() {
            if !out.contains(&pattern) && pattern_matches(pattern, &lowered, &tokens) {
                out.push(pattern);
            }
        }
    }
    out
}

fn signal_table(case: UseCase) -> &'static [(&'static str, f64)] {
    SIGNALS
        .iter()
        .find(|(c, _)| *c == case)
        .map(|(_, t)| *t)
        .unwrap_or(&[])
}

/// Lowercased alphanumeric tokens of `lowered`.
fn tokenize(lowered: &str) -> Vec<&str> {
    lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Multi-word patterns match as substrings; single-word patterns match
/// token prefixes so stems like `transcri` cover their inflections.
fn pattern_matches(pattern: &str, lowered: &str, tokens: &[&str]) -> bool {
    if pattern.contains(' ') || pattern.contains('-') {
        lowered.contains(pattern)
    } else {
        tokens.iter().any(|t| t.starts_with(pattern))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify_text(query: &str) -> ClassificationResult {
        classify(query, Modality::Text, &BTreeMap::new())
    }

    // -----------------------------------------------------------------------
    // Basic routing
    // -----------------------------------------------------------------------

    #[test]
    fn code_request_routes_to_agent() {
        let result = classify_text("Write a Python function to sort a list");
        assert_eq!(result.use_case, UseCase::Agent);
        assert!(result.confidence > 0.5, "confidence was {}", result.confidence);
        assert!(result.matched_signals.iter().any(|s| s == "function"));
    }

    #[test]
    fn transcription_request_routes_to_stt() {
        let result = classify("Transcribe this audio clip", Modality::Audio, &BTreeMap::new());
        assert_eq!(result.use_case, UseCase::Stt);
        assert!(result.confidence > 0.5);
    }

    #[test]
    fn speech_synthesis_routes_to_tts() {
        let result = classify_text("Read aloud the following announcement");
        assert_eq!(result.use_case, UseCase::Tts);
    }

    #[test]
    fn avatar_request_routes_to_avatar() {
        let result = classify_text("Generate a talking head avatar for this script");
        assert_eq!(result.use_case, UseCase::Avatar);
    }

    #[test]
    fn image_request_routes_to_multimodal() {
        let result = classify("What is in this picture?", Modality::Image, &BTreeMap::new());
        assert_eq!(result.use_case, UseCase::Multimodal);
    }

    #[test]
    fn video_request_routes_to_video() {
        let result = classify("Describe the third scene of the video", Modality::Video, &BTreeMap::new());
        assert_eq!(result.use_case, UseCase::Video);
    }

    // -----------------------------------------------------------------------
    // Edge cases
    // -----------------------------------------------------------------------

    #[test]
    fn empty_query_defaults_to_agent_with_zero_confidence() {
        let result = classify_text("");
        assert_eq!(result.use_case, UseCase::Agent);
        assert_eq!(result.confidence, 0.0);
        assert!(result.matched_signals.is_empty());

        let whitespace = classify_text("   \n\t ");
        assert_eq!(whitespace.use_case, UseCase::Agent);
        assert_eq!(whitespace.confidence, 0.0);
    }

    #[test]
    fn signal_free_query_defaults_to_agent() {
        let result = classify_text("what language was that?");
        assert_eq!(result.use_case, UseCase::Agent);
    }

    #[test]
    fn conflicting_signals_resolve_by_weight() {
        // "transcri" (1.6) outweighs "speak" (1.0)
        let result = classify_text("transcribe this and then speak it back to me");
        assert_eq!(result.use_case, UseCase::Stt);
    }

    #[test]
    fn classification_is_deterministic() {
        let a = classify_text("summarize the recording of the meeting");
        let b = classify_text("summarize the recording of the meeting");
        assert_eq!(a, b);
    }

    #[test]
    fn confidence_is_always_in_unit_range() {
        for query in [
            "",
            "hello",
            "transcribe audio voice recording speech to text",
            "write code generate function analyze reason explain",
        ] {
            for modality in [Modality::Text, Modality::Audio, Modality::Image, Modality::Unknown] {
                let result = classify(query, modality, &BTreeMap::new());
                assert!(
                    (0.0..=1.0).contains(&result.confidence),
                    "confidence {} out of range for {query:?}/{modality}",
                    result.confidence
                );
            }
        }
    }

    // -----------------------------------------------------------------------
    // Modality boost
    // -----------------------------------------------------------------------

    #[test]
    fn audio_modality_tips_voice_toward_stt() {
        // "voice" votes for both stt and nothing else strongly; the audio
        // hint boosts stt past the tts-affine cases.
        let result = classify("clean up this voice message", Modality::Audio, &BTreeMap::new());
        assert_eq!(result.use_case, UseCase::Stt);
    }

    #[test]
    fn unknown_modality_grants_no_boost() {
        let hinted = classify("describe it", Modality::Video, &BTreeMap::new());
        let unhinted = classify("describe it", Modality::Unknown, &BTreeMap::new());
        assert_eq!(hinted.use_case, UseCase::Video);
        assert_eq!(unhinted.use_case, UseCase::Agent);
    }

    // -----------------------------------------------------------------------
    // Context votes
    // -----------------------------------------------------------------------

    #[test]
    fn context_values_contribute_reduced_votes() {
        let mut context = BTreeMap::new();
        context.insert("topic".to_string(), "avatar lip sync pipeline".to_string());
        let result = classify("make it look natural", Modality::Unknown, &context);
        assert_eq!(result.use_case, UseCase::Avatar);
    }

    // -----------------------------------------------------------------------
    // signal_keywords — shared with the context fingerprint
    // -----------------------------------------------------------------------

    #[test]
    fn signal_keywords_reports_matches_across_use_cases() {
        let keywords = signal_keywords("Transcribe the audio from this video");
        assert!(keywords.contains(&"transcri"));
        assert!(keywords.contains(&"audio"));
        assert!(keywords.contains(&"video"));
    }

    #[test]
    fn signal_keywords_is_empty_for_generic_text() {
        assert!(signal_keywords("now add error handling").is_empty());
        assert!(signal_keywords("what language was that?").is_empty());
    }

    #[test]
    fn stem_patterns_match_inflections() {
        assert!(signal_keywords("analyzing transcriptions").contains(&"analy"));
        assert!(signal_keywords("analyzing transcriptions").contains(&"transcri"));
    }
}
