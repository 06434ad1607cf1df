// =============================================================================
// models.rs — THE SACRED DATA STRUCTURES OF CONSUMER DESPAIR
// =============================================================================
//
// These structs represent the fundamental building blocks of our reliability
// pipeline. Each field has been carefully chosen to capture every conceivable
// statistic about a seguradora's relationship with its unhappy customers.
//
// Is it overkill to track eight separate counters per company per month?
// Yes. Do we care? Absolutely not.
// =============================================================================

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The per-key running aggregate of complaint statistics. One of these exists
/// for every normalized company name (and separately for every valid CNPJ)
/// seen in a month, and they sum cleanly across months.
///
/// Every counter and every sum/count pair is monotonically non-decreasing
/// under [`Agg::merge_raw`] and [`Agg::absorb`]: merging is pure addition,
/// which is what makes the rolling window associative, commutative, and
/// boring in exactly the way aggregation code should be.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Agg {
    /// First non-empty human-readable name seen for this key. Display only;
    /// the key itself is the identity.
    pub display_name: String,

    /// Rows where the status field was present at all. This is the scoping
    /// denominator for the finalization rate, which means rows with a blank
    /// status are invisible to it. Known quirk, intentionally preserved.
    pub total: u64,

    /// Rows whose status, case-folded, contains a "final" indicator.
    pub finalizadas: u64,

    /// Rows the portal marked as answered by the supplier.
    pub respondidas: u64,

    /// Rows the consumer marked as resolved.
    pub resolvidas_indicador: u64,

    /// Running sum/count of the consumer satisfaction score (1..5).
    /// Invalid values never land here, so the average never lies.
    pub nota_sum: f64,
    pub nota_count: u64,

    /// Running sum/count of the response time in days.
    pub tempo_sum: f64,
    pub tempo_count: u64,
}

impl Agg {
    pub fn new(display_name: &str) -> Self {
        Self {
            display_name: display_name.to_string(),
            ..Self::default()
        }
    }

    /// Fold another raw aggregate into this one. Pure summation: the only
    /// non-additive field is the display name, where first-non-empty wins.
    pub fn merge_raw(&mut self, other: &Agg) {
        if self.display_name.is_empty() && !other.display_name.is_empty() {
            self.display_name = other.display_name.clone();
        }
        self.total += other.total;
        self.finalizadas += other.finalizadas;
        self.respondidas += other.respondidas;
        self.resolvidas_indicador += other.resolvidas_indicador;
        self.nota_sum += other.nota_sum;
        self.nota_count += other.nota_count;
        self.tempo_sum += other.tempo_sum;
        self.tempo_count += other.tempo_count;
    }

    /// Derive the public, averaged view. Never divides by zero: a count of
    /// zero yields a null average, not a NaN and not a panic.
    pub fn to_public(&self) -> PublicAgg {
        let nota_avg = if self.nota_count > 0 {
            Some(self.nota_sum / self.nota_count as f64)
        } else {
            None
        };
        let tempo_avg = if self.tempo_count > 0 {
            Some(self.tempo_sum / self.tempo_count as f64)
        } else {
            None
        };
        PublicAgg {
            display_name: self.display_name.clone(),
            total: self.total,
            finalizadas: self.finalizadas,
            respondidas: self.respondidas,
            resolvidas_indicador: self.resolvidas_indicador,
            nota_avg,
            tempo_resposta_avg_dias: tempo_avg,
        }
    }
}

/// The consumer-facing view of an aggregate: raw counters plus derived
/// averages, no running sums. This is what lands in the published artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicAgg {
    pub display_name: String,
    pub total: u64,
    pub finalizadas: u64,
    pub respondidas: u64,
    pub resolvidas_indicador: u64,
    pub nota_avg: Option<f64>,
    pub tempo_resposta_avg_dias: Option<f64>,
}

/// Diagnostic metadata about one monthly parse. None of this feeds back into
/// aggregation; all of it exists so a human can discover that the portal
/// renamed the CNPJ column again without diffing raw CSVs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParseStats {
    /// The delimiter the sniffer settled on, as a one-character string.
    pub delimiter: String,
    /// The supplier-CNPJ header as it appeared in the file, if one was
    /// detected heuristically.
    pub detected_cnpj_column: Option<String>,
    /// The same header in its normalized form, for cross-month comparison.
    pub detected_cnpj_column_norm: Option<String>,
    /// Every data row the reader yielded, parseable or not.
    pub rows_total: u64,
    /// Rows that produced a validly-shaped 14-digit CNPJ.
    pub rows_with_cnpj_valid: u64,
    /// Distinct CNPJ keys in this month's identifier-keyed map.
    pub unique_cnpj_keys: u64,
}

/// The identifier-quality block surfaced in monthly artifact metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonthlyCnpjMeta {
    pub detected_column: Option<String>,
    pub rows_with_cnpj_valid: u64,
    pub unique_cnpj_keys: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonthlyMeta {
    /// "YYYY-MM" of the extract this payload was computed from.
    pub month: String,
    /// Where the raw file came from, for auditability.
    pub source_url: Option<String>,
    pub generated_at: String,
    pub parse: ParseStats,
    pub cnpj: MonthlyCnpjMeta,
}

/// One month's aggregate artifact. Owns its two maps exclusively; the rolling
/// merge reads these and never writes them back.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonthlyPayload {
    pub meta: MonthlyMeta,
    pub by_name_key_raw: BTreeMap<String, Agg>,
    pub by_cnpj_key_raw: BTreeMap<String, Agg>,
}

impl MonthlyPayload {
    pub fn new(
        month: &str,
        source_url: Option<String>,
        by_name: BTreeMap<String, Agg>,
        by_cnpj: BTreeMap<String, Agg>,
        parse: ParseStats,
    ) -> Self {
        let cnpj = MonthlyCnpjMeta {
            detected_column: parse.detected_cnpj_column.clone(),
            rows_with_cnpj_valid: parse.rows_with_cnpj_valid,
            unique_cnpj_keys: parse.unique_cnpj_keys,
        };
        Self {
            meta: MonthlyMeta {
                month: month.to_string(),
                source_url,
                generated_at: now_iso(),
                parse,
                cnpj,
            },
            by_name_key_raw: by_name,
            by_cnpj_key_raw: by_cnpj,
        }
    }
}

/// Cross-month identifier-detection diagnostics for the rolling artifact.
/// The frequency map is the drift detector: a healthy dataset has one column
/// name with a count equal to the window size, and anything else is the
/// portal quietly changing its schema under us.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CnpjDiagnostics {
    /// Months in which an identifier column was detected at all.
    pub detected_months: Vec<String>,
    /// Normalized column name -> number of months it was the winner.
    pub detected_column_counts: BTreeMap<String, u64>,
    /// The most frequent winner, if any month detected a column.
    pub detected_column_most_freq: Option<String>,
    /// Sum of valid-CNPJ row counts across used months.
    pub rows_with_cnpj_valid_total: u64,
    /// Distinct CNPJ keys in the consolidated map.
    pub unique_keys: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RollingMeta {
    pub generated_at: String,
    /// Unique id for this pipeline run, stamped into every artifact the run
    /// produced so they can be correlated later.
    pub run_id: String,
    pub window_months: usize,
    /// The months the caller asked for, newest first.
    pub months_requested: Vec<String>,
    /// The months that actually contributed. A shorter list than requested
    /// is the official signal that something was skipped.
    pub months_used: Vec<String>,
    pub cnpj: CnpjDiagnostics,
}

/// The consolidated rolling-window artifact: raw maps for downstream merging,
/// public maps for downstream consumption.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RollingPayload {
    pub meta: RollingMeta,
    pub by_name_key_raw: BTreeMap<String, Agg>,
    pub by_cnpj_key_raw: BTreeMap<String, Agg>,
    pub by_name_key: BTreeMap<String, PublicAgg>,
    pub by_cnpj_key: BTreeMap<String, PublicAgg>,
}

/// One entry in the supervisor's master list: the canonical identity an
/// insurer has with the regulator, keyed by its FIP code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub fip_code: String,
    pub name: String,
    /// Normalized 14-digit CNPJ, when the master list had a usable one.
    pub cnpj: Option<String>,
}

/// How a reputation block got attached to an insurer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchInfo {
    /// The aggregate key that matched: "cnpj:<digits>" or a name key.
    pub consumer_key: String,
    pub matched_name: String,
    pub score: f64,
    /// "cnpj" for direct identifier hits, "token_jaccard_margin" for fuzzy.
    pub method: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationBlock {
    #[serde(rename = "match")]
    pub match_info: MatchInfo,
    pub metrics: PublicAgg,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InsurerFlags {
    #[serde(rename = "openInsuranceParticipant")]
    pub open_insurance_participant: bool,
}

/// One insurer in the published universe: registry identity, directory flags,
/// and (when matching succeeded) a reputation block. Composite scores are
/// deliberately absent from this pipeline; the field stays null downstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsurerRecord {
    pub id: String,
    pub name: String,
    pub cnpj: Option<String>,
    /// The same CNPJ in display form (XX.XXX.XXX/XXXX-XX), for the widget.
    #[serde(rename = "cnpjFormatted", skip_serializing_if = "Option::is_none")]
    pub cnpj_formatted: Option<String>,
    pub flags: InsurerFlags,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reputation: Option<ReputationBlock>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InsurersMeta {
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceNote {
    pub dataset: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesMeta {
    #[serde(rename = "consumidorGov")]
    pub consumidor_gov: SourceNote,
    pub opin: SourceNote,
    pub registry: SourceNote,
}

/// The top-level insurers artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsurersPayload {
    #[serde(rename = "schemaVersion")]
    pub schema_version: String,
    #[serde(rename = "generatedAt")]
    pub generated_at: String,
    pub run_id: String,
    pub sources: SourcesMeta,
    pub insurers: Vec<InsurerRecord>,
    pub meta: InsurersMeta,
}

/// One audited match, kept in the match report so a human can spot-check
/// what the fuzzy matcher decided while nobody was looking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchAudit {
    pub insurer_id: String,
    pub insurer_name: String,
    pub consumer_key: String,
    pub consumer_name: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnmatchedAudit {
    pub insurer_id: String,
    pub insurer_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchReportStats {
    pub insurers_total: u64,
    pub matched: u64,
    pub unmatched: u64,
    pub low_confidence: u64,
    pub b2b_skipped: u64,
    pub excluded_providers: u64,
}

/// The auditable record of one matching run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchReport {
    #[serde(rename = "generatedAt")]
    pub generated_at: String,
    pub threshold: f64,
    pub min_margin: f64,
    pub stats: MatchReportStats,
    pub matched: Vec<MatchAudit>,
    pub low_confidence: Vec<MatchAudit>,
    pub unmatched: Vec<UnmatchedAudit>,
}

/// A slimmed-down Open Insurance participant, shaped for the public artifact.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlimParticipant {
    pub id: Option<String>,
    pub name: Option<String>,
    #[serde(rename = "registrationNumber")]
    pub registration_number: Option<String>,
    pub status: Option<String>,
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParticipantsSource {
    pub url: String,
    #[serde(rename = "fetchedAt")]
    pub fetched_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParticipantsMeta {
    pub count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParticipantsPayload {
    pub source: ParticipantsSource,
    pub participants: Vec<SlimParticipant>,
    pub meta: ParticipantsMeta,
}

/// UTC now as an RFC 3339 string with a trailing Z, second precision.
/// Every artifact stamps one of these so nobody has to guess how stale it is.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(total: u64, nota_sum: f64, nota_count: u64) -> Agg {
        Agg {
            display_name: "Porto Seguro".to_string(),
            total,
            finalizadas: total / 2,
            respondidas: total / 3,
            resolvidas_indicador: total / 4,
            nota_sum,
            nota_count,
            tempo_sum: 10.0,
            tempo_count: 2,
        }
    }

    #[test]
    fn test_merge_raw_is_pure_addition() {
        let a = sample(12, 40.0, 10);
        let b = sample(6, 15.0, 5);
        let mut merged = Agg::default();
        merged.merge_raw(&a);
        merged.merge_raw(&b);
        assert_eq!(merged.total, 18);
        assert_eq!(merged.finalizadas, 9);
        assert_eq!(merged.nota_count, 15);
        assert!((merged.nota_sum - 55.0).abs() < 1e-9);
    }

    #[test]
    fn test_merge_order_does_not_matter() {
        let a = sample(3, 9.0, 3);
        let b = sample(5, 20.0, 4);
        let c = sample(7, 14.0, 7);

        let mut abc = Agg::default();
        abc.merge_raw(&a);
        abc.merge_raw(&b);
        abc.merge_raw(&c);

        let mut bca = Agg::default();
        bca.merge_raw(&b);
        bca.merge_raw(&c);
        bca.merge_raw(&a);

        // Display name differs only if inputs disagree; these agree, so the
        // whole struct must be identical field-by-field.
        assert_eq!(abc, bca);
    }

    #[test]
    fn test_display_name_first_non_empty_wins() {
        let mut agg = Agg::default();
        agg.merge_raw(&Agg::default());
        assert_eq!(agg.display_name, "");
        agg.merge_raw(&Agg::new("Azul Seguros"));
        assert_eq!(agg.display_name, "Azul Seguros");
        agg.merge_raw(&Agg::new("AZUL COMPANHIA DE SEGUROS"));
        assert_eq!(agg.display_name, "Azul Seguros");
    }

    #[test]
    fn test_to_public_never_divides_by_zero() {
        let agg = Agg::new("Quiet Corp");
        let public = agg.to_public();
        assert_eq!(public.nota_avg, None);
        assert_eq!(public.tempo_resposta_avg_dias, None);
    }

    #[test]
    fn test_to_public_averages() {
        let agg = sample(10, 42.0, 10);
        let public = agg.to_public();
        assert!((public.nota_avg.unwrap() - 4.2).abs() < 1e-9);
        assert!((public.tempo_resposta_avg_dias.unwrap() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_agg_deserializes_with_missing_fields() {
        // Older monthly artifacts may predate a field; absent means zero.
        let agg: Agg = serde_json::from_str(r#"{"display_name":"X","total":3}"#).unwrap();
        assert_eq!(agg.total, 3);
        assert_eq!(agg.nota_count, 0);
    }
}
