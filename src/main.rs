// ███████╗██╗███╗   ██╗██╗███████╗████████╗██████╗  ██████╗
// ██╔════╝██║████╗  ██║██║██╔════╝╚══██╔══╝██╔══██╗██╔═══██╗
// ███████╗██║██╔██╗ ██║██║███████╗   ██║   ██████╔╝██║   ██║
// ╚════██║██║██║╚██╗██║██║╚════██║   ██║   ██╔══██╗██║   ██║
// ███████║██║██║ ╚████║██║███████║   ██║   ██║  ██║╚██████╔╝
// ╚══════╝╚═╝╚═╝  ╚═══╝╚═╝╚══════╝   ╚═╝   ╚═╝  ╚═╝ ╚═════╝
//
// E N G I N E
//
// The most overkill insurance-market reliability pipeline ever conceived.
// Rust + Tokio + Rayon + Aho-Corasick + circuit breakers.
// All to figure out which seguradora actually answers its complaints.

mod aggregator;
mod builder;
mod circuit_breaker;
mod columns;
mod config;
mod fetchers;
mod identifier;
mod matcher;
mod merger;
mod metrics;
mod models;
mod normalize;
mod storage;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use rayon::prelude::*;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

use crate::circuit_breaker::CircuitBreaker;
use crate::config::Config;
use crate::fetchers::{ckan, opin, registry};
use crate::metrics::PipelineMetrics;
use crate::models::MonthlyPayload;

fn print_banner() {
    let banner = r#"

    ╔══════════════════════════════════════════════════════════════════╗
    ║                                                                  ║
    ║   ███████╗██╗███╗   ██╗██╗███████╗████████╗██████╗  ██████╗      ║
    ║   ██╔════╝██║████╗  ██║██║██╔════╝╚══██╔══╝██╔══██╗██╔═══██╗     ║
    ║   ███████╗██║██╔██╗ ██║██║███████╗   ██║   ██████╔╝██║   ██║     ║
    ║   ╚════██║██║██║╚██╗██║██║╚════██║   ██║   ██╔══██╗██║   ██║     ║
    ║   ███████║██║██║ ╚████║██║███████║   ██║   ██║  ██║╚██████╔╝     ║
    ║   ╚══════╝╚═╝╚═╝  ╚═══╝╚═╝╚══════╝   ╚═╝   ╚═╝  ╚═╝ ╚═════╝      ║
    ║                                                                  ║
    ║        ⚡ INSURANCE MARKET RELIABILITY ENGINE ⚡                 ║
    ║                                                                  ║
    ║   Sources:  Consumidor.gov | SUSEP | Open Insurance Brasil       ║
    ║   Keys:     normalized names + 14-digit CNPJs                    ║
    ║   Window:   rolling months, additive merges only                 ║
    ║   Matching: Jaccard + containment, margin-gated                  ║
    ║   Resilience: circuit breakers on ALL endpoints                  ║
    ║                                                                  ║
    ║   "When a seguradora stops answering, we notice."                ║
    ║                                                                  ║
    ╚══════════════════════════════════════════════════════════════════╝

    "#;
    println!("{}", banner);
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_ansi(true)
        .init();

    print_banner();

    info!("🛡️  SINISTRO ENGINE initializing...");

    let config = Arc::new(Config::from_env());
    let run_id = Uuid::new_v4().to_string();
    info!(
        run_id = run_id.as_str(),
        months_back = config.months_back,
        data_dir = %config.data_dir.display(),
        "configuration loaded"
    );

    let metrics = Arc::new(PipelineMetrics::new());

    let client = reqwest::Client::builder()
        .timeout(config.http_timeout)
        .user_agent(config.user_agent.clone())
        .build()
        .context("building HTTP client")?;

    // One breaker per endpoint family: the portal having a bad day says
    // nothing about the directory, and vice versa.
    let portal_breaker = Arc::new(CircuitBreaker::new(
        "consumidor-portal",
        config.cb_failure_threshold,
        config.cb_reset_timeout,
        config.cb_success_threshold,
    ));
    let directory_breaker = Arc::new(CircuitBreaker::new(
        "opin-directory",
        config.cb_failure_threshold,
        config.cb_reset_timeout,
        config.cb_success_threshold,
    ));
    let registry_breaker = Arc::new(CircuitBreaker::new(
        "susep-registry",
        config.cb_failure_threshold,
        config.cb_reset_timeout,
        config.cb_success_threshold,
    ));

    // ═══════════════════════════════════════════
    // STAGE 1: DISCOVER AND PLAN THE WINDOW
    // ═══════════════════════════════════════════
    let available = ckan::discover_monthly_resources(&client, &config, &portal_breaker)
        .await
        .context("discovering Base Completa months")?;
    metrics.set_months_discovered(available.len() as u64);

    let window = ckan::plan_window(
        &available,
        config.months_back,
        config.force_month.as_deref(),
    )?;
    info!(window = ?window, "processing window");

    // ═══════════════════════════════════════════
    // STAGE 2: ENSURE RAW EXTRACTS ON DISK
    // ═══════════════════════════════════════════
    // Months whose monthly artifact already exists are reused without
    // touching the network at all. The rest get their raw .csv.gz fetched,
    // sequentially and politely: twelve concurrent multi-hundred-megabyte
    // downloads from one government server is how you meet their firewall.
    let mut reused: BTreeMap<String, MonthlyPayload> = BTreeMap::new();
    let mut to_aggregate: Vec<String> = Vec::new();

    for month in &window {
        let artifact_path = config.monthly_artifact_path(month);
        if !config.force_download && artifact_path.exists() {
            match storage::read_json_gz::<MonthlyPayload>(&artifact_path) {
                Ok(payload) => {
                    info!(month = month.as_str(), "reusing cached monthly artifact");
                    metrics.incr_months_reused();
                    reused.insert(month.clone(), payload);
                    continue;
                }
                Err(e) => {
                    warn!(month = month.as_str(), error = %e, "cached artifact unreadable; reprocessing");
                }
            }
        }

        let raw_path = config.raw_month_path(month);
        let have_raw = !config.force_download
            && raw_path.exists()
            && std::fs::metadata(&raw_path).map(|m| m.len() > 0).unwrap_or(false);
        if !have_raw {
            let resource = &available[month];
            match ckan::download_month(
                &client,
                resource,
                &raw_path,
                config.download_timeout,
                &portal_breaker,
            )
            .await
            {
                Ok(()) => metrics.incr_months_downloaded(),
                Err(e) => {
                    error!(month = month.as_str(), error = %e, "download failed; month will be skipped");
                    metrics.incr_download_failures();
                    metrics.incr_months_failed();
                    continue;
                }
            }
        }
        to_aggregate.push(month.clone());
    }

    // ═══════════════════════════════════════════
    // STAGE 3: AGGREGATE MONTHS (PARALLEL)
    // ═══════════════════════════════════════════
    // Each month owns its maps exclusively, so months parallelize across
    // cores without a single lock. The rolling merge later stays strictly
    // single-threaded and ordered; only the independent per-month work
    // fans out.
    let aggregated: Vec<(String, Option<MonthlyPayload>)> = {
        let config = Arc::clone(&config);
        let available_urls: BTreeMap<String, String> = to_aggregate
            .iter()
            .filter_map(|m| available.get(m).map(|r| (m.clone(), r.url.clone())))
            .collect();
        let months = to_aggregate.clone();
        tokio::task::spawn_blocking(move || {
            months
                .par_iter()
                .map(|month| {
                    let raw_path = config.raw_month_path(month);
                    match aggregator::aggregate_month(&raw_path) {
                        Ok(result) => {
                            let payload = MonthlyPayload::new(
                                month,
                                available_urls.get(month).cloned(),
                                result.by_name,
                                result.by_cnpj,
                                result.parse,
                            );
                            (month.clone(), Some(payload))
                        }
                        Err(e) => {
                            error!(month = month.as_str(), error = %e, "aggregation failed");
                            (month.clone(), None)
                        }
                    }
                })
                .collect()
        })
        .await
        .context("aggregation task panicked")?
    };

    let mut monthlies: BTreeMap<String, MonthlyPayload> = reused;
    for (month, maybe_payload) in aggregated {
        match maybe_payload {
            Some(payload) => {
                metrics.incr_months_aggregated();
                metrics.add_rows_parsed(payload.meta.parse.rows_total);
                metrics.add_rows_with_cnpj_valid(payload.meta.parse.rows_with_cnpj_valid);
                storage::write_json_gz(&payload, &config.monthly_artifact_path(&month))
                    .with_context(|| format!("writing monthly artifact for {month}"))?;
                monthlies.insert(month, payload);
            }
            None => metrics.incr_months_failed(),
        }
    }

    // ═══════════════════════════════════════════
    // STAGE 4: ROLLING MERGE
    // ═══════════════════════════════════════════
    let outcome = merger::merge_months(&window, |month| monthlies.get(month).cloned());
    if outcome.months_used.len() < window.len() {
        warn!(
            requested = window.len(),
            used = outcome.months_used.len(),
            "rolling window is incomplete; see months_used in the artifact"
        );
    }
    let rolling = merger::to_rolling_payload(outcome, &window, &run_id);

    storage::write_json_gz(&rolling, &config.rolling_artifact_path())
        .context("writing rolling artifact")?;
    storage::snapshot_json_gz(&rolling, &config.snapshots_dir(), "consumidor_gov_agg")?;
    storage::prune_snapshots(
        &config.snapshots_dir(),
        "consumidor_gov_agg",
        config.snapshots_keep,
    )?;

    // ═══════════════════════════════════════════
    // STAGE 5: DIRECTORY AND REGISTRY (CONCURRENT)
    // ═══════════════════════════════════════════
    // Different hosts, independent failures: fetch them side by side.
    // A directory outage must not take the reputation pipeline down with
    // it: the flag set degrades to empty and the artifacts still publish.
    // The registry is different; without the insurer universe there is
    // nothing to publish, so its failure is fatal.
    let (opin_result, registry_result) = futures::join!(
        opin::fetch_participants(&client, &config, &directory_breaker),
        registry::fetch_registry(&client, &config, &registry_breaker),
    );

    let opin_cnpjs = match opin_result {
        Ok(directory) => {
            storage::write_json_atomic(&directory.payload, &config.participants_path())
                .context("writing participants artifact")?;
            directory.cnpjs
        }
        Err(e) => {
            warn!(error = %e, "participants directory unavailable; OPIN flags will be empty");
            Default::default()
        }
    };

    let insurer_registry = registry_result.context("loading insurer registry")?;

    // ═══════════════════════════════════════════
    // STAGE 6: REGISTRY JOIN AND PUBLICATION
    // ═══════════════════════════════════════════

    let (payload, report) = builder::build_insurers(
        &insurer_registry,
        &rolling,
        &opin_cnpjs,
        &config,
        &metrics,
        &run_id,
    );

    let old_count = storage::read_existing_count(&config.insurers_path());
    builder::guard_count_regression(payload.meta.count, old_count, &config)?;

    storage::write_json_atomic(&report, &config.match_report_path())
        .context("writing match report")?;
    storage::write_json_atomic(&payload, &config.insurers_path())
        .context("writing insurers artifact")?;
    storage::snapshot_json_gz(&payload, &config.snapshots_dir(), "insurers_full")?;
    storage::prune_snapshots(
        &config.snapshots_dir(),
        "insurers_full",
        config.snapshots_keep,
    )?;

    info!("═══════════════════════════════════════════════════════");
    info!("  🟢 RUN COMPLETE");
    info!(
        "  📦 {} insurers published, {} months merged",
        payload.meta.count,
        rolling.meta.months_used.len()
    );
    info!(
        "  🔌 breakers: portal={} directory={} registry={}",
        portal_breaker.state_label(),
        directory_breaker.state_label(),
        registry_breaker.state_label()
    );
    info!("═══════════════════════════════════════════════════════");

    metrics.log_summary();
    Ok(())
}
