//! Stable conversational-context fingerprint for change detection.
//!
//! The fingerprint is deliberately coarse: it digests the *routing-relevant
//! shape* of a request — the signal keywords the classifier would vote on,
//! the modality, and the sorted context key/values — not the full query
//! text. Paraphrases on the same topic keep their keywords and therefore
//! their hash; a sudden switch ("write a function" → "now translate this
//! audio") changes the keyword bag and produces a different digest.
//!
//! The digest must be identical across processes, so it is the first eight
//! bytes of an unseeded SHA-256 over a canonical byte string. No random
//! seed, no per-process state.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::classifier::signal_keywords;
use crate::usecase::Modality;

/// Keep at most this many keywords, preferring longer (more specific) ones.
const TOP_K: usize = 8;

/// The routing-relevant shape of a request.
///
/// `neutral` marks a request that carries no routing signal at all — no
/// keywords matched and no non-text modality. Such requests cannot indicate
/// a context switch; the router treats them as matching any cached binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextFingerprint {
    pub hash: u64,
    pub neutral: bool,
}

/// Fingerprint a request.
pub fn fingerprint(
    query: &str,
    modality: Modality,
    context: &BTreeMap<String, String>,
) -> ContextFingerprint {
    // Keyword bag: dedup'd signal matches, longest-first selection capped at
    // TOP_K, then sorted for a canonical ordering.
    let mut keywords = signal_keywords(query);
    keywords.sort_unstable_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));
    keywords.truncate(TOP_K);
    keywords.sort_unstable();

    let neutral = keywords.is_empty() && matches!(modality, Modality::Text | Modality::Unknown);

    let mut hasher = Sha256::new();
    for keyword in &keywords {
        hasher.update(keyword.as_bytes());
        hasher.update(b"\x1f");
    }
    hasher.update(b"|");
    // BTreeMap iterates in key order, giving the sorted-kv canonical form.
    for (key, value) in context {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\x1f");
    }
    hasher.update(b"|");
    hasher.update(modality.as_str().as_bytes());

    let digest = hasher.finalize();
    let mut first8 = [0u8; 8];
    first8.copy_from_slice(&digest[..8]);

    ContextFingerprint {
        hash: u64::from_be_bytes(first8),
        neutral,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(query: &str, modality: Modality) -> ContextFingerprint {
        fingerprint(query, modality, &BTreeMap::new())
    }

    // -----------------------------------------------------------------------
    // Stability
    // -----------------------------------------------------------------------

    #[test]
    fn identical_input_produces_identical_hash() {
        let a = fp("transcribe this audio clip", Modality::Audio);
        let b = fp("transcribe this audio clip", Modality::Audio);
        assert_eq!(a, b);
    }

    #[test]
    fn filler_words_do_not_affect_the_hash() {
        let a = fp("write a function", Modality::Text);
        let b = fp("could you write the function for me", Modality::Text);
        assert_eq!(a.hash, b.hash);
    }

    #[test]
    fn paraphrases_with_same_keywords_share_a_hash() {
        let a = fp("please transcribe the audio", Modality::Audio);
        let b = fp("the audio — transcribe it", Modality::Audio);
        assert_eq!(a.hash, b.hash);
    }

    // -----------------------------------------------------------------------
    // Change detection
    // -----------------------------------------------------------------------

    #[test]
    fn modality_switch_changes_the_hash() {
        let text = fp("transcribe the recording", Modality::Text);
        let audio = fp("transcribe the recording", Modality::Audio);
        assert_ne!(text.hash, audio.hash);
    }

    #[test]
    fn topic_switch_changes_the_hash() {
        let code = fp("write a function to sort a list", Modality::Text);
        let audio = fp("now translate this audio", Modality::Audio);
        assert_ne!(code.hash, audio.hash);
    }

    #[test]
    fn context_kv_is_order_independent_but_value_sensitive() {
        let mut ab = BTreeMap::new();
        ab.insert("a".to_string(), "1".to_string());
        ab.insert("b".to_string(), "2".to_string());

        let mut ba = BTreeMap::new();
        ba.insert("b".to_string(), "2".to_string());
        ba.insert("a".to_string(), "1".to_string());

        assert_eq!(
            fingerprint("q", Modality::Text, &ab).hash,
            fingerprint("q", Modality::Text, &ba).hash
        );

        let mut changed = ab.clone();
        changed.insert("b".to_string(), "3".to_string());
        assert_ne!(
            fingerprint("q", Modality::Text, &ab).hash,
            fingerprint("q", Modality::Text, &changed).hash
        );
    }

    // -----------------------------------------------------------------------
    // Neutrality
    // -----------------------------------------------------------------------

    #[test]
    fn generic_follow_up_is_neutral() {
        assert!(fp("now add error handling", Modality::Text).neutral);
        assert!(fp("what language was that?", Modality::Text).neutral);
    }

    #[test]
    fn signal_bearing_query_is_not_neutral() {
        assert!(!fp("transcribe this audio clip", Modality::Audio).neutral);
        assert!(!fp("write a function", Modality::Text).neutral);
    }

    #[test]
    fn non_text_modality_is_never_neutral() {
        assert!(!fp("hello there", Modality::Audio).neutral);
        assert!(!fp("hello there", Modality::Image).neutral);
    }
}
