// =============================================================================
// builder.rs — THE UNIVERSE ASSEMBLY LINE
// =============================================================================
//
// This is where the three data streams finally meet:
//
//   registry   — who the insurers officially are (FIP code, name, CNPJ)
//   rolling    — how their customers feel about them (complaint aggregates)
//   directory  — whether they participate in Open Insurance (CNPJ set)
//
// The join ladder, per insurer, strictest first:
//
//   1. CNPJ hit against the identifier-keyed aggregates: score 1.0, no
//      fuzzy anything, done.
//   2. B2B check: reinsurers and specialty carriers have no consumer
//      reputation to find, so we do not go looking for one.
//   3. Fuzzy name match with threshold + margin. Accepted matches just
//      above the threshold are additionally flagged as low-confidence in
//      the report, because "barely passed" is worth a human glance.
//
// Every decision is written down in the match report. And before anything
// is published, the count-regression guardrails get a veto: a universe that
// suddenly shrank did not get healthier, it got a broken upstream source.
// =============================================================================

use std::collections::{BTreeMap, HashSet};

use anyhow::{bail, Result};
use rayon::prelude::*;
use tracing::{info, warn};

use crate::config::Config;
use crate::identifier::format_cnpj;
use crate::matcher::{MatchHit, NameMatcher};
use crate::metrics::PipelineMetrics;
use crate::models::{
    now_iso, InsurerFlags, InsurerRecord, InsurersMeta, InsurersPayload, MatchAudit, MatchInfo,
    MatchReport, MatchReportStats, RegistryEntry, ReputationBlock, RollingPayload, SourceNote,
    SourcesMeta, UnmatchedAudit,
};
use crate::normalize::{is_excluded_provider, is_likely_b2b};

/// Caps on report list sizes, so one pathological month cannot turn the
/// audit file into a second Base Completa.
const REPORT_MATCHED_CAP: usize = 500;
const REPORT_LOW_CONF_CAP: usize = 200;
const REPORT_UNMATCHED_CAP: usize = 500;

/// Accepted matches scoring below threshold + this slack are flagged for
/// human review.
const LOW_CONFIDENCE_SLACK: f64 = 0.03;

/// How one insurer fared in the join, before report assembly.
enum JoinOutcome {
    MatchedByCnpj,
    MatchedByName { low_confidence: bool },
    B2bSkipped,
    Unmatched,
}

/// Assemble the insurers payload and its match report.
pub fn build_insurers(
    registry: &BTreeMap<String, RegistryEntry>,
    rolling: &RollingPayload,
    opin_cnpjs: &HashSet<String>,
    config: &Config,
    metrics: &PipelineMetrics,
    run_id: &str,
) -> (InsurersPayload, MatchReport) {
    // Fuzzy-match candidates come from the name-keyed aggregates.
    let candidates: BTreeMap<String, String> = rolling
        .by_name_key_raw
        .iter()
        .map(|(key, agg)| (key.clone(), agg.display_name.clone()))
        .collect();
    let matcher = NameMatcher::new(&candidates);
    if matcher.is_empty() {
        warn!("no reputation candidates; every join will fall through to unmatched");
    }
    info!(
        insurers = registry.len(),
        candidates = matcher.len(),
        "assembling insurer universe"
    );

    // Brokers and other intermediaries leave the universe before matching.
    let universe: Vec<&RegistryEntry> = registry
        .values()
        .filter(|entry| {
            if is_excluded_provider(&entry.name) {
                metrics.incr_excluded_providers();
                false
            } else {
                true
            }
        })
        .collect();

    // The join is embarrassingly parallel per insurer: the matcher and the
    // aggregate maps are read-only from here on. Ordering is restored by
    // collect, so the output stays deterministic.
    let joined: Vec<(InsurerRecord, JoinOutcome)> = universe
        .par_iter()
        .map(|entry| join_one(entry, rolling, opin_cnpjs, &matcher, config))
        .collect();

    let mut insurers = Vec::with_capacity(joined.len());
    let mut matched: Vec<MatchAudit> = Vec::new();
    let mut low_conf: Vec<MatchAudit> = Vec::new();
    let mut unmatched: Vec<UnmatchedAudit> = Vec::new();
    let mut stats = MatchReportStats {
        excluded_providers: (registry.len() - universe.len()) as u64,
        ..MatchReportStats::default()
    };

    for (record, outcome) in joined {
        stats.insurers_total += 1;
        match outcome {
            JoinOutcome::MatchedByCnpj => {
                stats.matched += 1;
                metrics.incr_matched_by_cnpj();
                if let Some(rep) = &record.reputation {
                    matched.push(audit_entry(&record, rep));
                }
            }
            JoinOutcome::MatchedByName { low_confidence } => {
                stats.matched += 1;
                metrics.incr_matched_by_name();
                if let Some(rep) = &record.reputation {
                    let audit = audit_entry(&record, rep);
                    if low_confidence {
                        stats.low_confidence += 1;
                        metrics.incr_low_confidence();
                        low_conf.push(audit.clone());
                    }
                    matched.push(audit);
                }
            }
            JoinOutcome::B2bSkipped => {
                stats.b2b_skipped += 1;
                metrics.incr_b2b_skipped();
            }
            JoinOutcome::Unmatched => {
                stats.unmatched += 1;
                metrics.incr_unmatched();
                unmatched.push(UnmatchedAudit {
                    insurer_id: record.id.clone(),
                    insurer_name: record.name.clone(),
                });
            }
        }
        insurers.push(record);
    }

    metrics.set_insurers_total(stats.insurers_total);

    matched.truncate(REPORT_MATCHED_CAP);
    low_conf.truncate(REPORT_LOW_CONF_CAP);
    unmatched.truncate(REPORT_UNMATCHED_CAP);

    let report = MatchReport {
        generated_at: now_iso(),
        threshold: config.match_threshold,
        min_margin: config.match_min_margin,
        stats,
        matched,
        low_confidence: low_conf,
        unmatched,
    };

    let count = insurers.len() as u64;
    let payload = InsurersPayload {
        schema_version: "1.0.0".to_string(),
        generated_at: now_iso(),
        run_id: run_id.to_string(),
        sources: sources_meta(config, rolling),
        insurers,
        meta: InsurersMeta { count },
    };

    (payload, report)
}

fn join_one(
    entry: &RegistryEntry,
    rolling: &RollingPayload,
    opin_cnpjs: &HashSet<String>,
    matcher: &NameMatcher,
    config: &Config,
) -> (InsurerRecord, JoinOutcome) {
    let is_opin = entry
        .cnpj
        .as_ref()
        .map(|c| opin_cnpjs.contains(c))
        .unwrap_or(false);

    let mut record = InsurerRecord {
        id: format!("ses:{}", entry.fip_code),
        name: entry.name.clone(),
        cnpj: entry.cnpj.clone(),
        cnpj_formatted: entry.cnpj.as_deref().and_then(format_cnpj),
        flags: InsurerFlags {
            open_insurance_participant: is_opin,
        },
        reputation: None,
    };

    // Rung 1: the identifier join. Exact, boring, correct.
    if let Some(cnpj) = &entry.cnpj {
        if let Some(metrics_block) = rolling.by_cnpj_key.get(cnpj) {
            let block = ReputationBlock {
                match_info: MatchInfo {
                    consumer_key: format!("cnpj:{cnpj}"),
                    matched_name: metrics_block.display_name.clone(),
                    score: 1.0,
                    method: "cnpj".to_string(),
                },
                metrics: metrics_block.clone(),
            };
            record.reputation = Some(block);
            return (record, JoinOutcome::MatchedByCnpj);
        }
    }

    // Rung 2: B2B entities sit this one out.
    if is_likely_b2b(&entry.name) {
        return (record, JoinOutcome::B2bSkipped);
    }

    // Rung 3: fuzzy name match.
    match matcher.best_match_with(&entry.name, config.match_threshold, config.match_min_margin) {
        Some(MatchHit { key, score }) => {
            let Some(metrics_block) = rolling.by_name_key.get(&key) else {
                // Matcher candidates came from this very map; a miss here
                // means the maps went out of sync, which is a bug upstream.
                warn!(key = key.as_str(), "matched key missing from public map");
                return (record, JoinOutcome::Unmatched);
            };
            let is_low_confidence = score < config.match_threshold + LOW_CONFIDENCE_SLACK;
            let block = ReputationBlock {
                match_info: MatchInfo {
                    consumer_key: key,
                    matched_name: metrics_block.display_name.clone(),
                    score,
                    method: "token_jaccard_margin".to_string(),
                },
                metrics: metrics_block.clone(),
            };
            record.reputation = Some(block);
            (
                record,
                JoinOutcome::MatchedByName {
                    low_confidence: is_low_confidence,
                },
            )
        }
        None => (record, JoinOutcome::Unmatched),
    }
}

fn audit_entry(record: &InsurerRecord, rep: &ReputationBlock) -> MatchAudit {
    MatchAudit {
        insurer_id: record.id.clone(),
        insurer_name: record.name.clone(),
        consumer_key: rep.match_info.consumer_key.clone(),
        consumer_name: rep.match_info.matched_name.clone(),
        score: rep.match_info.score,
    }
}

fn sources_meta(config: &Config, rolling: &RollingPayload) -> SourcesMeta {
    SourcesMeta {
        consumidor_gov: SourceNote {
            dataset: "Consumidor.gov.br (Dados Abertos, Base Completa)".to_string(),
            url: config.ckan_api_base.clone(),
            note: Some(format!(
                "rolling window of {} months, {} used",
                rolling.meta.window_months,
                rolling.meta.months_used.len()
            )),
        },
        opin: SourceNote {
            dataset: "Open Insurance Brasil participants".to_string(),
            url: config.opin_participants_url.clone(),
            note: None,
        },
        registry: SourceNote {
            dataset: "SUSEP LISTAEMPRESAS".to_string(),
            url: config.registry_url.clone(),
            note: None,
        },
    }
}

/// The publication veto. A new universe must be non-empty, above the
/// configured floor, and not abruptly smaller than the previous artifact.
pub fn guard_count_regression(
    new_count: u64,
    old_count: Option<u64>,
    config: &Config,
) -> Result<()> {
    if new_count == 0 {
        bail!("refusing to publish: new insurer count is zero");
    }
    if new_count < config.min_insurers_count {
        bail!(
            "refusing to publish: insurer count {} is below the floor of {}",
            new_count,
            config.min_insurers_count
        );
    }
    if let Some(old) = old_count.filter(|c| *c > 0) {
        if new_count < old {
            let drop_pct = (old - new_count) as f64 / old as f64;
            if drop_pct > config.max_count_drop_pct {
                bail!(
                    "refusing to publish: insurer count dropped {} -> {} ({:.1}% > {:.0}% allowed)",
                    old,
                    new_count,
                    drop_pct * 100.0,
                    config.max_count_drop_pct * 100.0
                );
            }
        }
    }
    info!(old = ?old_count, new = new_count, "count regression check passed");
    Ok(())
}
