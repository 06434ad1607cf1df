// =============================================================================
// columns.rs — THE HEADER DIVINATION CHAMBER
// =============================================================================
//
// The consumer portal's monthly extracts are not schema-stable. Column names
// drift between releases: casing changes, accents appear and disappear, and
// some months the supplier-CNPJ column simply does not exist. Worse, the file
// routinely carries TWO identifier columns: the supplier's CNPJ (which we
// want) and the complaining consumer's CPF or CNPJ (which we absolutely do
// not want, because attributing a month of complaints to a random citizen's
// tax id would be both wrong and rude).
//
// Picking the wrong column does not crash anything. It silently corrupts an
// entire month of identifier-keyed aggregates. So instead of hardcoding a
// header name, we score every header and let the heuristics fight it out:
//
//   - must contain "cnpj", must not contain "cpf"
//   - big bonus for supplier-side words (fornecedor, empresa, ...)
//   - bigger penalty for consumer-side words (consumidor, reclamante, ...)
//   - small penalty for the generic "documento"
//   - small bonus for the canonical short form "cnpj" itself
//   - length penalty, so the shortest plausible header wins
//
// Ties keep the first header encountered. No winner means None, and the
// aggregator falls back to a fixed synonym list.
// =============================================================================

use std::collections::HashMap;

use crate::normalize::normalize_strong;

/// Supplier-side hints: a header containing one of these is talking about the
/// company being complained about.
const BUSINESS_HINTS: &[&str] = &[
    "fornecedor",
    "empresa",
    "companhia",
    "instituicao",
    "prestador",
    "razaosocial",
    "nomefantasia",
];

/// Consumer-side hints: a header containing one of these is talking about the
/// person doing the complaining. Hard pass.
const CONSUMER_HINTS: &[&str] = &[
    "consumidor",
    "reclamante",
    "cidadao",
    "usuario",
    "cliente",
];

const BASE_SCORE: i64 = 10;
const BUSINESS_BONUS: i64 = 50;
const CONSUMER_PENALTY: i64 = 60;
const DOCUMENT_PENALTY: i64 = 5;
const EXACT_CNPJ_BONUS: i64 = 8;

/// The winning header, in both its raw and normalized forms. The raw form
/// goes into parse metadata so a human can audit what we picked; the
/// normalized form is what cross-month drift tracking compares.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedColumn {
    pub raw: String,
    pub normalized: String,
    pub index: usize,
    pub score: i64,
}

/// Score every header and return the most plausible supplier-CNPJ column,
/// or None when nothing qualifies.
pub fn detect_cnpj_column(headers: &[String]) -> Option<DetectedColumn> {
    let mut best: Option<DetectedColumn> = None;

    for (index, raw) in headers.iter().enumerate() {
        let norm = normalize_strong(raw);
        if !norm.contains("cnpj") {
            continue;
        }
        if norm.contains("cpf") {
            continue;
        }

        let mut score = BASE_SCORE;
        if BUSINESS_HINTS.iter().any(|h| norm.contains(h)) {
            score += BUSINESS_BONUS;
        }
        if CONSUMER_HINTS.iter().any(|h| norm.contains(h)) {
            score -= CONSUMER_PENALTY;
        }
        if norm.contains("documento") {
            score -= DOCUMENT_PENALTY;
        }
        if norm == "cnpj" {
            score += EXACT_CNPJ_BONUS;
        }
        score -= norm.len() as i64;

        // Strictly greater: on a tie the earlier header keeps its seat.
        let is_better = best.as_ref().map(|b| score > b.score).unwrap_or(true);
        if is_better {
            best = Some(DetectedColumn {
                raw: raw.clone(),
                normalized: norm,
                index,
                score,
            });
        }
    }

    best
}

/// A tolerant header index for per-row field lookups.
///
/// The monthly extracts cannot agree on "Nota do Consumidor" vs
/// "nota_consumidor" vs "NOTA CONSUMIDOR", so every logical field is read
/// through an ordered synonym list: exact header match first, then a match
/// on the strongly-normalized form. First occurrence of a duplicate header
/// wins in both maps.
#[derive(Debug)]
pub struct FieldIndex {
    exact: HashMap<String, usize>,
    folded: HashMap<String, usize>,
}

impl FieldIndex {
    pub fn new(headers: &[String]) -> Self {
        let mut exact = HashMap::new();
        let mut folded = HashMap::new();
        for (i, h) in headers.iter().enumerate() {
            exact.entry(h.clone()).or_insert(i);
            let norm = normalize_strong(h);
            if !norm.is_empty() {
                folded.entry(norm).or_insert(i);
            }
        }
        Self { exact, folded }
    }

    /// Resolve an ordered synonym list to a column index.
    /// All synonyms are tried exactly before any are tried normalized, so a
    /// precise header always beats a fuzzy one.
    pub fn resolve(&self, synonyms: &[&str]) -> Option<usize> {
        for syn in synonyms {
            if let Some(&i) = self.exact.get(*syn) {
                return Some(i);
            }
        }
        for syn in synonyms {
            let norm = normalize_strong(syn);
            if let Some(&i) = self.folded.get(&norm) {
                return Some(i);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_supplier_column_beats_consumer_column() {
        let h = headers(&["nome_consumidor_cnpj", "cnpj_fornecedor", "cpf_consumidor"]);
        let detected = detect_cnpj_column(&h).expect("a column should be detected");
        assert_eq!(detected.raw, "cnpj_fornecedor");
    }

    #[test]
    fn test_cpf_columns_are_rejected_outright() {
        let h = headers(&["cpf_cnpj_consumidor", "cpf"]);
        assert_eq!(detect_cnpj_column(&h), None);
    }

    #[test]
    fn test_exact_short_form_beats_longer_generic() {
        let h = headers(&["cnpj_documento_geral", "cnpj"]);
        let detected = detect_cnpj_column(&h).expect("detected");
        assert_eq!(detected.raw, "cnpj");
    }

    #[test]
    fn test_tie_keeps_first_header() {
        // Identical scores: same length, no hints on either side.
        let h = headers(&["cnpj_raiz", "cnpj_alvo"]);
        let detected = detect_cnpj_column(&h).expect("detected");
        assert_eq!(detected.raw, "cnpj_raiz");
    }

    #[test]
    fn test_shorter_header_wins_with_equal_hints() {
        let h = headers(&["cnpj_da_empresa", "cnpj_empresa"]);
        let detected = detect_cnpj_column(&h).expect("detected");
        assert_eq!(detected.raw, "cnpj_empresa");
    }

    #[test]
    fn test_accented_headers_are_normalized() {
        let h = headers(&["CNPJ do Fornecedor Reclamação"]);
        let detected = detect_cnpj_column(&h).expect("detected");
        assert_eq!(detected.normalized, "cnpjdofornecedorreclamacao");
    }

    #[test]
    fn test_no_plausible_header_yields_none() {
        let h = headers(&["nome", "situacao", "nota"]);
        assert_eq!(detect_cnpj_column(&h), None);
    }

    #[test]
    fn test_field_index_exact_beats_normalized() {
        let h = headers(&["Nome Fantasia", "nome_fantasia"]);
        let idx = FieldIndex::new(&h);
        // Exact match on the second synonym outranks a normalized match on
        // the first.
        assert_eq!(idx.resolve(&["nomefantasia", "nome_fantasia"]), Some(1));
    }

    #[test]
    fn test_field_index_normalized_fallback() {
        let h = headers(&["Nota do Consumidor", "Situação"]);
        let idx = FieldIndex::new(&h);
        assert_eq!(idx.resolve(&["nota_do_consumidor"]), Some(0));
        assert_eq!(idx.resolve(&["situacao"]), Some(1));
        assert_eq!(idx.resolve(&["inexistente"]), None);
    }
}
