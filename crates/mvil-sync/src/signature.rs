//! MinHash signatures over word 3-shingles for near-duplicate descriptions.

use std::collections::BTreeSet;

use sha2::{Digest, Sha256};

pub const SIGNATURE_LEN: usize = 64;
pub const SHINGLE_WORDS: usize = 3;
/// Shorter descriptions carry too few shingles to compare meaningfully.
pub const MIN_SIGNATURE_WORDS: usize = 8;

fn splitmix64(x: u64) -> u64 {
    let mut z = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

fn words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn shingle_hash(shingle: &str) -> u64 {
    let digest = Sha256::digest(shingle.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(head)
}

/// Empty when the text has fewer than [`MIN_SIGNATURE_WORDS`] words.
pub fn content_signature(text: &str) -> Vec<u64> {
    let words = words(text);
    if words.len() < MIN_SIGNATURE_WORDS {
        return Vec::new();
    }
    let shingles = words
        .windows(SHINGLE_WORDS)
        .map(|w| shingle_hash(&w.join(" ")))
        .collect::<BTreeSet<_>>();

    (0..SIGNATURE_LEN as u64)
        .map(|i| {
            let seed = splitmix64(i);
            shingles
                .iter()
                .map(|base| splitmix64(base ^ seed))
                .min()
                .unwrap_or(u64::MAX)
        })
        .collect()
}

/// Estimated Jaccard similarity, or `None` if either side has no signature.
pub fn signature_similarity(a: &[u64], b: &[u64]) -> Option<f64> {
    if a.is_empty() || a.len() != b.len() {
        return None;
    }
    let equal = a.iter().zip(b).filter(|(x, y)| x == y).count();
    Some(equal as f64 / a.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEXT: &str = "We are looking for a data analyst to join our growing analytics team in Lagos. \
        You will build dashboards in Power BI, write SQL against our warehouse, clean messy \
        spreadsheets, and present findings to product and finance stakeholders every week. \
        Two years of experience with Excel and one scripting language is expected.";

    #[test]
    fn identical_text_is_identical() {
        let a = content_signature(TEXT);
        assert_eq!(a.len(), SIGNATURE_LEN);
        assert_eq!(signature_similarity(&a, &content_signature(TEXT)), Some(1.0));
        let shouting = content_signature(&TEXT.to_uppercase());
        assert_eq!(signature_similarity(&a, &shouting), Some(1.0));
    }

    #[test]
    fn small_edits_stay_close_and_unrelated_text_does_not() {
        let a = content_signature(TEXT);
        let edited = content_signature(&TEXT.replace("every week", "every fortnight"));
        assert!(signature_similarity(&a, &edited).unwrap() > 0.7);

        let other = content_signature(
            "Registered nurse needed for night shifts at a private hospital in Abuja, \
             must hold a valid council licence and basic life support certificate.",
        );
        assert!(signature_similarity(&a, &other).unwrap() < 0.2);
    }

    #[test]
    fn short_text_has_no_signature() {
        assert!(content_signature("apply within").is_empty());
        assert!(content_signature("").is_empty());
        assert_eq!(signature_similarity(&[], &[]), None);
    }
}
