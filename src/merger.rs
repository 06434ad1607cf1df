// =============================================================================
// merger.rs — THE ROLLING WINDOW CONSOLIDATOR
// =============================================================================
//
// Twelve monthly aggregates walk into a fold. One consolidated aggregate
// walks out. That is the entire job, and the reason it gets its own module
// is the list of things that must NOT happen while doing it:
//
//   - a missing or corrupt month must not abort the merge. It is skipped,
//     and the skip is visible: months_used comes back shorter than the
//     window that was requested.
//   - source monthly payloads must never be mutated. The merge owns a fresh
//     map and only ever reads its inputs.
//   - the result must be deterministic. Per-key merging is pure summation,
//     so it is associative and commutative; the caller-supplied order is
//     honored anyway, single-threaded, no cleverness.
//
// Along the way we compile identifier-detection diagnostics across the
// window, because the month where the CNPJ column silently disappeared is
// precisely the month somebody will ask about in six weeks.
// =============================================================================

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::models::{
    now_iso, Agg, CnpjDiagnostics, MonthlyPayload, PublicAgg, RollingMeta, RollingPayload,
};

/// The consolidated result of folding a window of months.
#[derive(Debug, Clone)]
pub struct RollingOutcome {
    pub by_name: BTreeMap<String, Agg>,
    pub by_cnpj: BTreeMap<String, Agg>,
    pub months_used: Vec<String>,
    pub cnpj: CnpjDiagnostics,
}

/// Fold a window of months, in the given order, into one consolidated
/// aggregate. `load` returns the monthly payload for a month, or None when
/// the month's artifact is missing or unreadable; such months are skipped
/// without ceremony, as are months whose by-name map came back empty.
pub fn merge_months<F>(window: &[String], mut load: F) -> RollingOutcome
where
    F: FnMut(&str) -> Option<MonthlyPayload>,
{
    let mut by_name: BTreeMap<String, Agg> = BTreeMap::new();
    let mut by_cnpj: BTreeMap<String, Agg> = BTreeMap::new();
    let mut months_used: Vec<String> = Vec::new();

    let mut detected_months: Vec<String> = Vec::new();
    let mut detected_column_counts: BTreeMap<String, u64> = BTreeMap::new();
    let mut rows_with_cnpj_valid_total: u64 = 0;

    for month in window {
        let Some(payload) = load(month) else {
            warn!(month = month.as_str(), "month unavailable; skipping");
            continue;
        };
        if payload.by_name_key_raw.is_empty() {
            warn!(month = month.as_str(), "month has no by-name data; skipping");
            continue;
        }

        months_used.push(month.clone());

        for (key, agg) in &payload.by_name_key_raw {
            by_name.entry(key.clone()).or_default().merge_raw(agg);
        }
        for (key, agg) in &payload.by_cnpj_key_raw {
            by_cnpj.entry(key.clone()).or_default().merge_raw(agg);
        }

        rows_with_cnpj_valid_total += payload.meta.parse.rows_with_cnpj_valid;
        if let Some(col) = &payload.meta.parse.detected_cnpj_column_norm {
            detected_months.push(month.clone());
            *detected_column_counts.entry(col.clone()).or_insert(0) += 1;
        }
    }

    // Most frequent detected column. Ties resolve to the alphabetically
    // first name via the BTreeMap iteration order, which keeps the whole
    // diagnostics block deterministic.
    let mut detected_column_most_freq: Option<String> = None;
    let mut best_count: u64 = 0;
    for (name, count) in &detected_column_counts {
        if *count > best_count {
            best_count = *count;
            detected_column_most_freq = Some(name.clone());
        }
    }

    let cnpj = CnpjDiagnostics {
        detected_months,
        detected_column_counts,
        detected_column_most_freq,
        rows_with_cnpj_valid_total,
        unique_keys: by_cnpj.len() as u64,
    };

    info!(
        requested = window.len(),
        used = months_used.len(),
        suppliers = by_name.len(),
        cnpj_keys = by_cnpj.len(),
        "rolling merge complete"
    );

    RollingOutcome {
        by_name,
        by_cnpj,
        months_used,
        cnpj,
    }
}

/// Package a merge outcome into the published rolling artifact, deriving the
/// public (averaged) views from the raw maps.
pub fn to_rolling_payload(
    outcome: RollingOutcome,
    window: &[String],
    run_id: &str,
) -> RollingPayload {
    let by_name_key: BTreeMap<String, PublicAgg> = outcome
        .by_name
        .iter()
        .map(|(k, v)| (k.clone(), v.to_public()))
        .collect();
    let by_cnpj_key: BTreeMap<String, PublicAgg> = outcome
        .by_cnpj
        .iter()
        .map(|(k, v)| (k.clone(), v.to_public()))
        .collect();

    RollingPayload {
        meta: RollingMeta {
            generated_at: now_iso(),
            run_id: run_id.to_string(),
            window_months: window.len(),
            months_requested: window.to_vec(),
            months_used: outcome.months_used,
            cnpj: outcome.cnpj,
        },
        by_name_key_raw: outcome.by_name,
        by_cnpj_key_raw: outcome.by_cnpj,
        by_name_key,
        by_cnpj_key,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ParseStats;

    fn month_payload(month: &str, key: &str, total: u64, column: Option<&str>) -> MonthlyPayload {
        let mut by_name = BTreeMap::new();
        by_name.insert(
            key.to_string(),
            Agg {
                display_name: key.to_uppercase(),
                total,
                finalizadas: total / 2,
                nota_sum: total as f64,
                nota_count: total,
                ..Agg::default()
            },
        );
        let mut by_cnpj = BTreeMap::new();
        by_cnpj.insert(
            "04544720000103".to_string(),
            Agg {
                display_name: key.to_uppercase(),
                total,
                ..Agg::default()
            },
        );
        MonthlyPayload::new(
            month,
            None,
            by_name,
            by_cnpj,
            ParseStats {
                delimiter: ";".to_string(),
                detected_cnpj_column: column.map(str::to_string),
                detected_cnpj_column_norm: column.map(str::to_string),
                rows_total: total,
                rows_with_cnpj_valid: total,
                unique_cnpj_keys: 1,
            },
        )
    }

    fn window(months: &[&str]) -> Vec<String> {
        months.iter().map(|m| m.to_string()).collect()
    }

    #[test]
    fn test_missing_months_are_skipped_not_fatal() {
        let w = window(&["2025-12", "2025-11", "2025-10"]);
        let outcome = merge_months(&w, |m| match m {
            "2025-12" => Some(month_payload(m, "porto seguro", 10, Some("cnpjfornecedor"))),
            "2025-10" => Some(month_payload(m, "porto seguro", 5, Some("cnpjfornecedor"))),
            _ => None,
        });

        assert_eq!(outcome.months_used, window(&["2025-12", "2025-10"]));
        assert_eq!(outcome.by_name["porto seguro"].total, 15);
        assert_eq!(outcome.cnpj.rows_with_cnpj_valid_total, 15);
        assert_eq!(outcome.cnpj.detected_months.len(), 2);
    }

    #[test]
    fn test_empty_by_name_month_is_skipped() {
        let w = window(&["2025-12", "2025-11"]);
        let outcome = merge_months(&w, |m| match m {
            "2025-12" => Some(month_payload(m, "azul", 4, None)),
            "2025-11" => Some(MonthlyPayload::default()),
            _ => None,
        });
        assert_eq!(outcome.months_used, window(&["2025-12"]));
    }

    #[test]
    fn test_merge_is_order_independent_per_key() {
        let a = month_payload("2025-12", "porto seguro", 3, Some("cnpj"));
        let b = month_payload("2025-11", "porto seguro", 5, Some("cnpj"));
        let c = month_payload("2025-10", "porto seguro", 7, Some("cnpj"));

        let forward = merge_months(&window(&["2025-12", "2025-11", "2025-10"]), |m| match m {
            "2025-12" => Some(a.clone()),
            "2025-11" => Some(b.clone()),
            "2025-10" => Some(c.clone()),
            _ => None,
        });
        let backward = merge_months(&window(&["2025-10", "2025-11", "2025-12"]), |m| match m {
            "2025-12" => Some(a.clone()),
            "2025-11" => Some(b.clone()),
            "2025-10" => Some(c.clone()),
            _ => None,
        });

        assert_eq!(forward.by_name, backward.by_name);
        assert_eq!(forward.by_cnpj, backward.by_cnpj);
    }

    #[test]
    fn test_column_drift_diagnostics() {
        let w = window(&["2025-12", "2025-11", "2025-10"]);
        let outcome = merge_months(&w, |m| match m {
            "2025-12" => Some(month_payload(m, "x", 1, Some("cnpjfornecedor"))),
            "2025-11" => Some(month_payload(m, "x", 1, Some("cnpjfornecedor"))),
            "2025-10" => Some(month_payload(m, "x", 1, Some("cnpjdofornecedor"))),
            _ => None,
        });
        assert_eq!(
            outcome.cnpj.detected_column_most_freq.as_deref(),
            Some("cnpjfornecedor")
        );
        assert_eq!(outcome.cnpj.detected_column_counts["cnpjfornecedor"], 2);
        assert_eq!(outcome.cnpj.detected_column_counts["cnpjdofornecedor"], 1);
        assert_eq!(outcome.cnpj.unique_keys, 1);
    }

    #[test]
    fn test_month_without_detected_column_still_merges() {
        let w = window(&["2025-12"]);
        let outcome = merge_months(&w, |m| Some(month_payload(m, "y", 2, None)));
        assert_eq!(outcome.months_used.len(), 1);
        assert!(outcome.cnpj.detected_months.is_empty());
        assert_eq!(outcome.cnpj.detected_column_most_freq, None);
    }

    #[test]
    fn test_rolling_payload_public_views() {
        let w = window(&["2025-12"]);
        let outcome = merge_months(&w, |m| Some(month_payload(m, "z", 4, None)));
        let payload = to_rolling_payload(outcome, &w, "run-1");
        let public = &payload.by_name_key["z"];
        assert!((public.nota_avg.unwrap() - 1.0).abs() < 1e-9);
        assert_eq!(payload.meta.window_months, 1);
        assert_eq!(payload.meta.run_id, "run-1");
    }
}
