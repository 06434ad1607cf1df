// =============================================================================
// aggregator.rs — THE MONTHLY COMPLAINT THRESHER
// =============================================================================
//
// One month of the consumer portal's "Base Completa" is a multi-hundred-
// megabyte CSV of individual complaints, gzipped, encoded in Latin-1 (the
// portal has heard of UTF-8 and wants nothing to do with it), delimited by
// semicolons except when it's commas, with column names that drift between
// releases like continental plates.
//
// This module streams one such file and produces two aggregate maps:
//
//   by_name  — keyed by the normalized supplier name (always populated)
//   by_cnpj  — keyed by the supplier's 14-digit CNPJ (populated only for
//              rows whose identifier survives validation)
//
// plus parse statistics, because when the identifier column vanishes for a
// month we want a paper trail, not a mystery.
//
// Failure policy, from least to most dramatic:
//   - unparseable score/response-time: treated as absent. Never zero, never
//     fatal. A garbage "nota" must not drag an average down.
//   - no extractable supplier name: the row is skipped. A complaint we can't
//     attribute to anyone is a complaint about the void.
//   - invalid CNPJ: the row still counts by name, just not by identifier.
//   - unreadable gzip/CSV stream: the only fatal case, and it aborts exactly
//     one month.
// =============================================================================

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::columns::{detect_cnpj_column, FieldIndex};
use crate::identifier::normalize_cnpj_str;
use crate::models::{Agg, ParseStats};
use crate::normalize::normalize_name_key;

/// Ordered synonyms for the supplier display name. First exact header match
/// wins, then first normalized match. A row with none of these is skipped.
const NAME_SYNONYMS: &[&str] = &[
    "fornecedor",
    "nome_fornecedor",
    "razao_social",
    "nomefantasia",
    "nome_fantasia",
    "empresa",
    "nomeempresa",
    "nome_empresa",
    "fornecedor_razao_social",
];

/// Fallback synonyms for the CNPJ column, used only when the heuristic
/// detector found nothing. This list is intentionally NOT the detector's
/// hint list: the two paths diverged in the source material and the safer
/// move is to keep both nets as they were cast.
const CNPJ_FALLBACK_SYNONYMS: &[&str] = &[
    "cnpj",
    "cnpj_fornecedor",
    "cnpjempresa",
    "cnpj_empresa",
    "cnpj_raiz",
    "documento",
    "documento_fornecedor",
];

const STATUS_SYNONYMS: &[&str] = &[
    "situacao",
    "situacao_reclamacao",
    "status",
    "status_reclamacao",
];

const RESPONDIDA_SYNONYMS: &[&str] = &[
    "respondida",
    "foi_respondida",
    "status_respondida",
    "respondida_flag",
];

const RESOLVIDA_SYNONYMS: &[&str] = &[
    "resolvida",
    "foi_resolvida",
    "status_resolvida",
    "resolvida_flag",
    "avaliacao_reclamacao",
];

const NOTA_SYNONYMS: &[&str] = &[
    "nota_consumidor",
    "nota_do_consumidor",
    "nota",
    "satisfacao",
    "satisfacao_consumidor",
];

const TEMPO_SYNONYMS: &[&str] = &[
    "tempo_resposta_dias",
    "dias_resposta",
    "tempo_resposta",
    "prazo_resposta_dias",
];

/// The portal's many spellings of "yes". One shared set for the answered and
/// resolved flags, matching the source data's habit of putting full words
/// where booleans should be.
const TRUTHY_TOKENS: &[&str] = &[
    "1",
    "true",
    "sim",
    "s",
    "yes",
    "y",
    "finalizada",
    "respondida",
    "resolvida",
];

/// What one month's aggregation produced.
#[derive(Debug, Clone)]
pub struct MonthAggregation {
    pub by_name: BTreeMap<String, Agg>,
    pub by_cnpj: BTreeMap<String, Agg>,
    pub parse: ParseStats,
}

/// The only errors that abort a month. Everything row-shaped is absorbed.
#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("failed to read monthly extract {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decompress monthly extract: {0}")]
    Decompress(#[source] std::io::Error),
    #[error("monthly extract is empty")]
    EmptyExtract,
    #[error("failed to read CSV header: {0}")]
    Header(#[from] csv::Error),
}

/// Aggregate one month from a gzipped CSV on disk.
pub fn aggregate_month(path: &Path) -> Result<MonthAggregation, AggregateError> {
    let bytes = std::fs::read(path).map_err(|source| AggregateError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    aggregate_gzip_bytes(&bytes)
}

/// Aggregate one month from gzipped CSV bytes. Split out from the file path
/// entry point so tests can feed synthetic extracts without touching disk.
pub fn aggregate_gzip_bytes(gz: &[u8]) -> Result<MonthAggregation, AggregateError> {
    let mut raw = Vec::new();
    GzDecoder::new(gz)
        .read_to_end(&mut raw)
        .map_err(AggregateError::Decompress)?;
    if raw.is_empty() {
        return Err(AggregateError::EmptyExtract);
    }

    // Latin-1 decodes byte-for-byte into the first 256 code points, so this
    // conversion is total: a mangled byte becomes a mangled character, never
    // an error. Exactly the tolerance government extracts require.
    let text = decode_latin1(&raw);
    aggregate_csv_text(&text)
}

fn aggregate_csv_text(text: &str) -> Result<MonthAggregation, AggregateError> {
    let delimiter = sniff_delimiter(text);

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    let index = FieldIndex::new(&headers);

    // One detector pass fixes the identifier column for the whole file.
    let detected = detect_cnpj_column(&headers);
    match &detected {
        Some(col) => debug!(
            column = col.raw.as_str(),
            score = col.score,
            "identifier column detected"
        ),
        None => warn!("no identifier column detected; falling back to synonym search"),
    }

    let name_idx = index.resolve(NAME_SYNONYMS);
    let cnpj_idx = detected
        .as_ref()
        .map(|c| c.index)
        .or_else(|| index.resolve(CNPJ_FALLBACK_SYNONYMS));
    let status_idx = index.resolve(STATUS_SYNONYMS);
    let respondida_idx = index.resolve(RESPONDIDA_SYNONYMS);
    let resolvida_idx = index.resolve(RESOLVIDA_SYNONYMS);
    let nota_idx = index.resolve(NOTA_SYNONYMS);
    let tempo_idx = index.resolve(TEMPO_SYNONYMS);

    let mut by_name: BTreeMap<String, Agg> = BTreeMap::new();
    let mut by_cnpj: BTreeMap<String, Agg> = BTreeMap::new();

    let mut rows_total: u64 = 0;
    let mut rows_with_cnpj_valid: u64 = 0;

    for record in reader.records() {
        rows_total += 1;
        let record = match record {
            Ok(r) => r,
            // A mangled row is that row's problem, not the month's.
            Err(e) => {
                debug!(row = rows_total, error = %e, "skipping unparseable CSV row");
                continue;
            }
        };

        let field = |idx: Option<usize>| idx.and_then(|i| record.get(i)).unwrap_or("");

        let display_name = field(name_idx).trim();
        if display_name.is_empty() {
            continue;
        }
        let name_key = normalize_name_key(display_name);
        if name_key.is_empty() {
            continue;
        }

        let cnpj_key = normalize_cnpj_str(field(cnpj_idx));
        if cnpj_key.is_some() {
            rows_with_cnpj_valid += 1;
        }

        let status = field(status_idx).trim();
        let facts = RowFacts {
            display_name,
            status_present: !status.is_empty(),
            finalizada: status.to_lowercase().contains("final"),
            respondida: is_truthy(field(respondida_idx)),
            resolvida: is_truthy(field(resolvida_idx)),
            nota: parse_locale_decimal(field(nota_idx)).filter(|v| *v > 0.0),
            tempo: parse_locale_decimal(field(tempo_idx)).filter(|v| *v > 0.0),
        };

        absorb(&mut by_name, &name_key, &facts);
        if let Some(key) = cnpj_key {
            absorb(&mut by_cnpj, &key, &facts);
        }
    }

    let parse = ParseStats {
        delimiter: (delimiter as char).to_string(),
        detected_cnpj_column: detected.as_ref().map(|c| c.raw.clone()),
        detected_cnpj_column_norm: detected.as_ref().map(|c| c.normalized.clone()),
        rows_total,
        rows_with_cnpj_valid,
        unique_cnpj_keys: by_cnpj.len() as u64,
    };

    info!(
        rows = parse.rows_total,
        suppliers = by_name.len(),
        cnpj_keys = by_cnpj.len(),
        delimiter = parse.delimiter.as_str(),
        "month aggregated"
    );

    Ok(MonthAggregation {
        by_name,
        by_cnpj,
        parse,
    })
}

/// Everything one row contributes, extracted once and applied to both maps.
struct RowFacts<'a> {
    display_name: &'a str,
    status_present: bool,
    finalizada: bool,
    respondida: bool,
    resolvida: bool,
    nota: Option<f64>,
    tempo: Option<f64>,
}

fn absorb(map: &mut BTreeMap<String, Agg>, key: &str, facts: &RowFacts<'_>) {
    let agg = map
        .entry(key.to_string())
        .or_insert_with(|| Agg::new(facts.display_name));

    if facts.status_present {
        agg.total += 1;
    }
    if facts.finalizada {
        agg.finalizadas += 1;
    }
    if facts.respondida {
        agg.respondidas += 1;
    }
    if facts.resolvida {
        agg.resolvidas_indicador += 1;
    }
    if let Some(n) = facts.nota {
        agg.nota_sum += n;
        agg.nota_count += 1;
    }
    if let Some(d) = facts.tempo {
        agg.tempo_sum += d;
        agg.tempo_count += 1;
    }
}

/// Latin-1 to String, one byte per code point. Total function: every byte
/// decodes to something, so a corrupted file degrades instead of aborting.
pub fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Sniff the field delimiter from the first ~4 KB: whichever of semicolon
/// and comma appears more often wins, with semicolon taking ties because
/// that is what the portal actually ships.
fn sniff_delimiter(text: &str) -> u8 {
    let bytes = text.as_bytes();
    let sample = &bytes[..bytes.len().min(4096)];
    let semicolons = memchr::memchr_iter(b';', sample).count();
    let commas = memchr::memchr_iter(b',', sample).count();
    if semicolons >= commas {
        b';'
    } else {
        b','
    }
}

fn is_truthy(value: &str) -> bool {
    let v = value.trim().to_lowercase();
    TRUTHY_TOKENS.contains(&v.as_str())
}

/// Parse a pt-BR decimal: "4,5" is four and a half, "1.234,56" has a
/// thousands separator, and "NA"/"-"/"" are all spellings of nothing.
/// Anything unparseable is absent, never zero.
fn parse_locale_decimal(value: &str) -> Option<f64> {
    let s = value.trim();
    if s.is_empty() {
        return None;
    }
    let lower = s.to_lowercase();
    if matches!(lower.as_str(), "na" | "n/a" | "-" | "nan") {
        return None;
    }

    let cleaned = if s.contains('.') && s.contains(',') {
        s.replace('.', "").replace(',', ".")
    } else {
        s.replace(',', ".")
    };
    cleaned.parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(bytes).unwrap();
        enc.finish().unwrap()
    }

    fn aggregate(csv_bytes: &[u8]) -> MonthAggregation {
        aggregate_gzip_bytes(&gzip(csv_bytes)).expect("aggregation should succeed")
    }

    #[test]
    fn test_basic_month_with_semicolons() {
        let csv = b"Fornecedor;CNPJ Fornecedor;Situa\xe7\xe3o;Respondida;Resolvida;Nota do Consumidor;Tempo Resposta Dias\n\
            Porto Seguro;04.544.720/0001-03;Finalizada avaliada;S;sim;4,5;7\n\
            Porto Seguro;04544720000103;Finalizada nao avaliada;S;nao;;10\n\
            Azul Seguros;;Em andamento;N;nao;2,0;\n";
        let out = aggregate(csv);

        assert_eq!(out.parse.delimiter, ";");
        assert_eq!(out.parse.rows_total, 3);
        assert_eq!(out.parse.rows_with_cnpj_valid, 2);
        assert_eq!(out.parse.unique_cnpj_keys, 1);

        let porto = &out.by_name["porto seguro"];
        assert_eq!(porto.display_name, "Porto Seguro");
        assert_eq!(porto.total, 2);
        assert_eq!(porto.finalizadas, 2);
        assert_eq!(porto.respondidas, 2);
        assert_eq!(porto.resolvidas_indicador, 1);
        assert_eq!(porto.nota_count, 1);
        assert!((porto.nota_sum - 4.5).abs() < 1e-9);
        assert_eq!(porto.tempo_count, 2);
        assert!((porto.tempo_sum - 17.0).abs() < 1e-9);

        // Azul had no valid CNPJ: present by name, absent by identifier.
        assert!(out.by_name.contains_key("azul seguros"));
        assert_eq!(out.by_cnpj.len(), 1);
        assert!(out.by_cnpj.contains_key("04544720000103"));
    }

    #[test]
    fn test_latin1_headers_resolve() {
        // "Situação" in Latin-1: the ç is 0xE7, the ã is 0xE3.
        let csv = b"Fornecedor;Situa\xe7\xe3o\nAcme Corretora Fake;Finalizada\n";
        let out = aggregate(csv);
        let agg = &out.by_name["acme corretora fake"];
        assert_eq!(agg.total, 1);
        assert_eq!(agg.finalizadas, 1);
    }

    #[test]
    fn test_comma_delimited_files_are_accepted() {
        let csv = b"fornecedor,situacao,nota\nBeta Vida,Finalizada,3\n";
        let out = aggregate(csv);
        assert_eq!(out.parse.delimiter, ",");
        assert_eq!(out.by_name["beta vida"].nota_count, 1);
    }

    #[test]
    fn test_rows_without_name_are_skipped_entirely() {
        let csv = b"fornecedor;situacao\n;Finalizada\n   ;Finalizada\nGama Seguros;Finalizada\n";
        let out = aggregate(csv);
        assert_eq!(out.parse.rows_total, 3);
        assert_eq!(out.by_name.len(), 1);
    }

    #[test]
    fn test_blank_status_does_not_count_toward_total() {
        let csv = b"fornecedor;situacao;respondida\nDelta;;S\nDelta;Finalizada;S\n";
        let out = aggregate(csv);
        let agg = &out.by_name["delta"];
        // Both rows answered, but only one had any status at all.
        assert_eq!(agg.total, 1);
        assert_eq!(agg.respondidas, 2);
    }

    #[test]
    fn test_garbage_nota_is_absent_not_zero() {
        let csv = b"fornecedor;situacao;nota\nEps;Finalizada;abc\nEps;Finalizada;4,0\n";
        let out = aggregate(csv);
        let agg = &out.by_name["eps"];
        assert_eq!(agg.nota_count, 1);
        assert!((agg.nota_sum - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_detector_prefers_supplier_over_consumer_column() {
        let csv = b"fornecedor;cnpj_consumidor;cnpj_fornecedor;situacao\n\
            Zeta;11111111111111;04544720000103;Finalizada\n";
        let out = aggregate(csv);
        assert_eq!(
            out.parse.detected_cnpj_column.as_deref(),
            Some("cnpj_fornecedor")
        );
        assert!(out.by_cnpj.contains_key("04544720000103"));
        assert!(!out.by_cnpj.contains_key("11111111111111"));
    }

    #[test]
    fn test_fallback_synonyms_when_detector_fails() {
        // No header contains "cnpj", so the detector never fires; the
        // fallback list still finds the identifier via its "documento" entry.
        let csv = b"fornecedor;documento;situacao\nEta;04544720000103;Finalizada\n";
        let out = aggregate(csv);
        assert_eq!(out.parse.detected_cnpj_column, None);
        assert!(out.by_cnpj.contains_key("04544720000103"));
    }

    #[test]
    fn test_thirteen_digit_cnpj_recovers_leading_zero() {
        let csv = b"fornecedor;cnpj;situacao\nTheta;4544720000103;Finalizada\n";
        let out = aggregate(csv);
        assert!(out.by_cnpj.contains_key("04544720000103"));
    }

    #[test]
    fn test_garbage_gzip_is_fatal() {
        let err = aggregate_gzip_bytes(b"this is not gzip").unwrap_err();
        assert!(matches!(err, AggregateError::Decompress(_)));
    }

    #[test]
    fn test_locale_decimal_parsing() {
        assert_eq!(parse_locale_decimal("4,5"), Some(4.5));
        assert_eq!(parse_locale_decimal("1.234,56"), Some(1234.56));
        assert_eq!(parse_locale_decimal("7"), Some(7.0));
        assert_eq!(parse_locale_decimal(""), None);
        assert_eq!(parse_locale_decimal("NA"), None);
        assert_eq!(parse_locale_decimal("abc"), None);
    }

    #[test]
    fn test_sniffer_prefers_semicolon_on_tie() {
        assert_eq!(sniff_delimiter("a;b,c"), b';');
        assert_eq!(sniff_delimiter("a,b,c;d"), b',');
    }
}
