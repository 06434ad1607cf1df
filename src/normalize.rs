// =============================================================================
// normalize.rs — THE NAME LAUNDERING FACILITY
// =============================================================================
//
// Brazilian company names arrive in every imaginable state of disrepair:
// UPPERCASE WITH CEDILLAS, Title Case With Stray Periods, "S.A." vs "S/A" vs
// "SA", and the occasional razão social long enough to need its own CNPJ.
// This module turns all of that into stable, comparable keys.
//
// Three levels of aggression:
//
// 1. normalize_name_key — strip diacritics, lowercase, collapse every run of
//    non-alphanumeric characters into a single space. Good for indexing.
//
// 2. normalize_strong — same, but spaces don't survive either. Good for
//    substring containment checks ("sulamerica" vs "sul america").
//
// 3. get_name_tokens — tokenized and stopword-filtered. The stopword list is
//    the corporate boilerplate of the Brazilian insurance market: legal-form
//    suffixes, prepositions, and the words that appear in EVERY razão social
//    and therefore distinguish nothing.
//
// We also run Aho-Corasick automatons over strongly-normalized names to flag
// B2B/reinsurance entities and to evict brokers from the insurer universe.
// Yes, we are using antivirus-grade multi-pattern matching to decide whether
// a company name contains the word "resseguros". Let that sink in.
// =============================================================================

use aho_corasick::AhoCorasick;
use std::collections::HashSet;
use std::sync::LazyLock;
use unicode_normalization::UnicodeNormalization;

/// Tokens that carry zero discriminating power in this market.
/// If two insurers can only be told apart by these words, they cannot be
/// told apart at all.
static STOPWORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        // legal form / corporate boilerplate
        "sa",
        "ltda",
        "me",
        "epp",
        "eireli",
        "cia",
        "companhia",
        "comp",
        "grupo",
        "holding",
        "sucursal",
        // sector boilerplate. Note the singular "seguro" is NOT here: it is
        // load-bearing in brand names (Porto Seguro), while the plural and
        // the "gerais" suffix are pure razão-social filler.
        "seguros",
        "seguradora",
        "seguradoras",
        "resseguros",
        "previdencia",
        "previdenciaria",
        "capitalizacao",
        "assistencia",
        "gerais",
        "instituto",
        "fundo",
        "fundos",
        "garantidor",
        "garantidores",
        "garantias",
        // foreign corporate forms
        "insurance",
        "insurances",
        "company",
        "co",
        "corp",
        "corporation",
        "limited",
        "ltd",
        "plc",
        "se",
        "ag",
        // country names that multinationals bolt onto their local branches
        "brasil",
        "brazil",
        "portugal",
        "argentina",
        // connectives
        "de",
        "da",
        "do",
        "das",
        "dos",
        "e",
        "em",
        "para",
        "por",
        "y",
        "and",
        "the",
        "of",
    ]
    .into_iter()
    .collect()
});

/// High-precision substrings that mark an entity as B2B / reinsurance /
/// specialty. These companies do not sell to consumers, so consumer-complaint
/// reputation data about them is either absent or somebody else's complaint
/// that fuzzy-matched too enthusiastically. We skip reputation matching for
/// them entirely.
///
/// Matched against normalize_strong output, so every pattern is already in
/// its accent-free, space-free, lowercase form.
static B2B_PATTERNS: &[&str] = &[
    // reinsurance
    "resseguro",
    "resseguradora",
    "reinsurance",
    "reinsur",
    "rueck",
    "lloyd",
    "syndicate",
    // corporate / specialty lines
    "corporatesolutions",
    "globalcorporate",
    "corporateandspecialty",
    "specialtyinsurance",
    "marineandenergy",
    // trade credit / surety (B2B by construction)
    "tradecredit",
    "creditoycaucion",
    "creditoexportacao",
    "creditoaexportacao",
    "exportcredit",
    "surety",
    "caucion",
    // well-known B2B players that show up in the supervisor's dumps
    "swissre",
    "munichre",
    "hannover",
    "scor",
    "starr",
    "markel",
    "eulerhermes",
    "atradius",
    "sbce",
    "abgf",
];

/// Entities that are not insurers at all but sneak into the master list
/// anyway: brokers, broker associations, and other intermediaries.
static EXCLUDED_PROVIDER_PATTERNS: &[&str] = &[
    "ibracor",
    "corretora",
    "corretor",
    "corretagem",
    "broker",
];

static B2B_AUTOMATON: LazyLock<AhoCorasick> = LazyLock::new(|| {
    AhoCorasick::new(B2B_PATTERNS).expect("B2B pattern set failed to compile")
});

static EXCLUDED_AUTOMATON: LazyLock<AhoCorasick> = LazyLock::new(|| {
    AhoCorasick::new(EXCLUDED_PROVIDER_PATTERNS)
        .expect("excluded-provider pattern set failed to compile")
});

/// Strip diacritics the Unicode way: NFKD decomposition, then drop every
/// combining mark. "Previdência" becomes "Previdencia", "Caução" becomes
/// "Caucao", and the pipeline stops caring which intern typed the accents.
fn strip_accents(s: &str) -> String {
    s.nfkd()
        .filter(|c| !unicode_normalization::char::is_combining_mark(*c))
        .collect()
}

/// Light normalization: the indexing key.
/// Diacritics stripped, lowercased, every run of non-alphanumeric characters
/// collapsed to one space, trimmed. Empty input yields an empty key.
pub fn normalize_name_key(name: &str) -> String {
    let stripped = strip_accents(name).to_lowercase();
    let mut out = String::with_capacity(stripped.len());
    let mut pending_space = false;
    for c in stripped.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.push(c);
        } else {
            pending_space = true;
        }
    }
    out
}

/// Strong normalization: alphanumerics only, no spaces at all.
/// This is the form used for substring containment ("sulamerica" is a
/// substring of "sulamericacapitalizacao") and for the pattern automatons.
pub fn normalize_strong(name: &str) -> String {
    strip_accents(name)
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

/// Tokens for matching: whitespace-split over the light key, dropping
/// single-character tokens and stopwords. Returns an owned set because the
/// matcher caches these per candidate.
pub fn get_name_tokens(name: &str) -> HashSet<String> {
    normalize_name_key(name)
        .split_whitespace()
        .filter(|t| t.len() >= 2 && !STOPWORDS.contains(*t))
        .map(str::to_string)
        .collect()
}

/// Does this name belong to a B2B / reinsurance / specialty entity?
/// High precision by design: a false positive here silently drops a retail
/// insurer's reputation block, so the pattern list stays conservative.
pub fn is_likely_b2b(name: &str) -> bool {
    let strong = normalize_strong(name);
    if strong.is_empty() {
        return false;
    }
    B2B_AUTOMATON.is_match(&strong)
}

/// Is this entity a broker or other intermediary that should not appear in
/// the insurer universe at all?
pub fn is_excluded_provider(name: &str) -> bool {
    let strong = normalize_strong(name);
    if strong.is_empty() {
        return false;
    }
    EXCLUDED_AUTOMATON.is_match(&strong)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name_key_strips_accents_and_punctuation() {
        assert_eq!(
            normalize_name_key("Caixa Previdência S.A."),
            "caixa previdencia s a"
        );
        assert_eq!(normalize_name_key("TOKIO---MARINE"), "tokio marine");
    }

    #[test]
    fn test_normalize_name_key_empty_input() {
        assert_eq!(normalize_name_key(""), "");
        assert_eq!(normalize_name_key("  ...  "), "");
    }

    #[test]
    fn test_normalize_strong_removes_spaces() {
        assert_eq!(normalize_strong("Sul América Cia. Nacional"), "sulamericacianacional");
    }

    #[test]
    fn test_tokens_drop_boilerplate_but_keep_brand() {
        let tokens = get_name_tokens("Porto Seguro Companhia de Seguros Gerais");
        let expected: HashSet<String> =
            ["porto", "seguro"].into_iter().map(String::from).collect();
        assert_eq!(tokens, expected);
    }

    #[test]
    fn test_tokens_drop_short_tokens() {
        let tokens = get_name_tokens("A B Vida");
        let expected: HashSet<String> = ["vida"].into_iter().map(String::from).collect();
        assert_eq!(tokens, expected);
    }

    #[test]
    fn test_empty_name_yields_empty_tokens() {
        assert!(get_name_tokens("").is_empty());
    }

    #[test]
    fn test_b2b_detection() {
        assert!(is_likely_b2b("IRB Brasil Resseguros S.A."));
        assert!(is_likely_b2b("Swiss Re Corporate Solutions Brasil"));
        assert!(!is_likely_b2b("Porto Seguro Companhia de Seguros Gerais"));
        assert!(!is_likely_b2b(""));
    }

    #[test]
    fn test_excluded_provider_detection() {
        assert!(is_excluded_provider("Fulano Corretora de Seguros Ltda"));
        assert!(is_excluded_provider("IBRACOR"));
        assert!(!is_excluded_provider("Bradesco Vida e Previdência"));
    }
}
