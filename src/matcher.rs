// =============================================================================
// matcher.rs — THE FUZZY NAME ARBITRATION TRIBUNAL
// =============================================================================
//
// The regulator calls a company "PORTO SEGURO COMPANHIA DE SEGUROS GERAIS".
// The complaint portal calls it "Porto Seguro". A CNPJ would settle this
// instantly, but the portal's extracts only sometimes carry one, so the
// join of last resort is the names themselves.
//
// The scoring is deliberately unclever:
//
//   score = Jaccard(query tokens, candidate tokens)
//         + 0.10 if one space-stripped name contains the other
//
// The containment bonus rescues abbreviation cases where token sets diverge
// but one string is literally an extension of the other.
//
// The interesting part is not the score, it is the refusal logic. A match is
// accepted only when it clears the threshold AND beats the runner-up by a
// minimum margin. Two near-tied candidates mean the answer is "no answer":
// attaching the wrong insurer's complaint history is strictly worse than
// attaching none. And a single-token query (one generic brand word) has to
// clear a much higher bar, because "Porto" alone matches half the harbor.
// =============================================================================

use std::collections::{BTreeMap, HashSet};

use tracing::debug;

use crate::normalize::{get_name_tokens, normalize_strong};

pub const DEFAULT_THRESHOLD: f64 = 0.85;
pub const DEFAULT_MIN_MARGIN: f64 = 0.08;

/// Floors applied when the query tokenizes to exactly one token.
const SINGLE_TOKEN_THRESHOLD: f64 = 0.92;
const SINGLE_TOKEN_MARGIN: f64 = 0.12;

const CONTAINMENT_BONUS: f64 = 0.10;

/// An accepted match: the candidate's key and the score that won it.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchHit {
    pub key: String,
    pub score: f64,
}

struct Candidate {
    key: String,
    tokens: HashSet<String>,
    strong: String,
}

/// A matcher over a fixed candidate registry (key -> display name).
/// Token sets and strong forms are computed once at construction; queries
/// are then a single pass over the candidates.
pub struct NameMatcher {
    candidates: Vec<Candidate>,
}

impl NameMatcher {
    pub fn new(registry: &BTreeMap<String, String>) -> Self {
        let candidates = registry
            .iter()
            .filter_map(|(key, name)| {
                let tokens = get_name_tokens(name);
                // A candidate whose name is all stopwords can never be
                // matched honestly; it does not get to play.
                if tokens.is_empty() {
                    return None;
                }
                Some(Candidate {
                    key: key.clone(),
                    tokens,
                    strong: normalize_strong(name),
                })
            })
            .collect();
        Self { candidates }
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Best match under the default threshold and margin.
    pub fn best_match(&self, query: &str) -> Option<MatchHit> {
        self.best_match_with(query, DEFAULT_THRESHOLD, DEFAULT_MIN_MARGIN)
    }

    /// Best match under caller-supplied knobs. Returns None when the query
    /// is empty after tokenization, when nothing clears the threshold, or
    /// when the top two candidates are too close to call.
    pub fn best_match_with(
        &self,
        query: &str,
        threshold: f64,
        min_margin: f64,
    ) -> Option<MatchHit> {
        let q_tokens = get_name_tokens(query);
        if q_tokens.is_empty() {
            return None;
        }
        let q_strong = normalize_strong(query);

        // One generic brand word is not an identification. Raise the bar.
        let (threshold, min_margin) = if q_tokens.len() == 1 {
            (
                threshold.max(SINGLE_TOKEN_THRESHOLD),
                min_margin.max(SINGLE_TOKEN_MARGIN),
            )
        } else {
            (threshold, min_margin)
        };

        let mut best: Option<(&Candidate, f64)> = None;
        let mut second_score = 0.0_f64;

        for candidate in &self.candidates {
            let mut score = jaccard(&q_tokens, &candidate.tokens);
            if !q_strong.is_empty()
                && !candidate.strong.is_empty()
                && (candidate.strong.contains(&q_strong) || q_strong.contains(&candidate.strong))
            {
                score += CONTAINMENT_BONUS;
            }

            match &best {
                Some((_, best_score)) if score <= *best_score => {
                    if score > second_score {
                        second_score = score;
                    }
                }
                _ => {
                    if let Some((_, prev_best)) = best {
                        second_score = prev_best;
                    }
                    best = Some((candidate, score));
                }
            }
        }

        let (winner, top_score) = best?;
        if top_score < threshold || (top_score - second_score) < min_margin {
            debug!(
                query = query,
                top = format!("{:.3}", top_score),
                second = format!("{:.3}", second_score),
                "match rejected by threshold or margin"
            );
            return None;
        }

        Some(MatchHit {
            key: winner.key.clone(),
            score: top_score,
        })
    }
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn porto_registry() -> BTreeMap<String, String> {
        registry(&[
            ("a", "Porto Seguro Companhia de Seguros Gerais"),
            ("b", "Porto Real Serviços"),
        ])
    }

    #[test]
    fn test_two_token_query_matches_with_margin() {
        let matcher = NameMatcher::new(&porto_registry());
        let hit = matcher.best_match("Porto Seguro").expect("should match");
        assert_eq!(hit.key, "a");
        assert!(hit.score >= DEFAULT_THRESHOLD);
    }

    #[test]
    fn test_single_token_query_is_rejected() {
        let matcher = NameMatcher::new(&porto_registry());
        assert_eq!(matcher.best_match("Porto"), None);
    }

    #[test]
    fn test_empty_query_is_rejected_immediately() {
        let matcher = NameMatcher::new(&porto_registry());
        assert_eq!(matcher.best_match(""), None);
        // All-stopword queries tokenize to nothing and behave the same.
        assert_eq!(matcher.best_match("Companhia de Seguros"), None);
    }

    #[test]
    fn test_empty_registry_matches_nothing() {
        let matcher = NameMatcher::new(&BTreeMap::new());
        assert!(matcher.is_empty());
        assert_eq!(matcher.best_match("Porto Seguro"), None);
    }

    #[test]
    fn test_near_tied_candidates_are_ambiguous() {
        // Both candidates tokenize to {mapfre, vida} and both strong forms
        // contain the query, so their scores are identical. Margin says no.
        let matcher = NameMatcher::new(&registry(&[
            ("a", "Mapfre Vida S.A."),
            ("b", "Mapfre Vida Previdência"),
        ]));
        assert_eq!(matcher.best_match("Mapfre Vida"), None);
    }

    #[test]
    fn test_containment_bonus_applies_to_glued_forms() {
        let matcher = NameMatcher::new(&registry(&[
            ("glued", "SulAmerica"),
            ("other", "Bradesco Auto"),
        ]));
        // Token sets are disjoint ("sul america" vs "sulamerica"), so the
        // containment bonus is the only score either side can earn; with
        // permissive knobs it alone decides the winner.
        let hit = matcher.best_match_with("Sul America", 0.05, 0.05);
        assert_eq!(hit.map(|h| h.key), Some("glued".to_string()));
    }

    #[test]
    fn test_all_stopword_candidates_are_dropped() {
        let matcher = NameMatcher::new(&registry(&[("x", "Companhia de Seguros Gerais")]));
        assert!(matcher.is_empty());
    }

    #[test]
    fn test_jaccard_basics() {
        let a: HashSet<String> = ["porto", "seguro"].iter().map(|s| s.to_string()).collect();
        let b: HashSet<String> = ["porto"].iter().map(|s| s.to_string()).collect();
        assert!((jaccard(&a, &a) - 1.0).abs() < 1e-9);
        assert!((jaccard(&a, &b) - 0.5).abs() < 1e-9);
        assert_eq!(jaccard(&a, &HashSet::new()), 0.0);
    }
}
