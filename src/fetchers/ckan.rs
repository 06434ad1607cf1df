// =============================================================================
// fetchers/ckan.rs — THE BASE COMPLETA PROCUREMENT OFFICE
// =============================================================================
//
// The consumer portal publishes its complaint database through a CKAN
// instance: one dataset, one resource per month, each resource a CSV (or
// CSV.GZ, depending on the month and, apparently, the weather). Resource
// names look like "basecompleta2025-12" except when they look like
// "Base Completa 2025_12", because consistency in government metadata is
// aspirational.
//
// Our job here:
//   1. Ask CKAN for the dataset's resource list (package_show).
//   2. Keep the resources that smell like Base Completa and carry a
//      recognizable YYYY-MM somewhere in their name or URL.
//   3. Plan a rolling window anchored on the newest month available.
//   4. Download each month to a local .csv.gz, compressing on the way in
//      when the portal serves plain CSV. Raw artifacts on disk are ALWAYS
//      gzip, so the aggregator only ever deals with one shape.
// =============================================================================

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::config::Config;

/// One downloadable month of the complaint database.
#[derive(Debug, Clone)]
pub struct MonthlyResource {
    pub month: String,
    pub name: String,
    pub url: String,
    pub format: Option<String>,
}

impl MonthlyResource {
    fn is_csv(&self) -> bool {
        self.format
            .as_deref()
            .map(|f| f.eq_ignore_ascii_case("csv"))
            .unwrap_or(false)
            || self.url.to_lowercase().ends_with(".csv")
    }
}

/// Query CKAN for the dataset and map out which months are available.
/// Returns month -> resource, preferring CSV when a month appears twice.
pub async fn discover_monthly_resources(
    client: &reqwest::Client,
    config: &Config,
    breaker: &CircuitBreaker,
) -> Result<BTreeMap<String, MonthlyResource>> {
    if !breaker.allow_request() {
        bail!("portal circuit breaker is open; skipping discovery");
    }

    let url = format!(
        "{}/package_show",
        config.ckan_api_base.trim_end_matches('/')
    );
    debug!(url = url.as_str(), dataset = config.ckan_dataset_id.as_str(), "querying CKAN");

    let response = client
        .get(&url)
        .query(&[("id", config.ckan_dataset_id.as_str())])
        .send()
        .await
        .and_then(|r| r.error_for_status());

    let body: Value = match response {
        Ok(r) => match r.json().await {
            Ok(v) => v,
            Err(e) => {
                breaker.record_failure();
                return Err(e).context("parsing CKAN package_show response");
            }
        },
        Err(e) => {
            breaker.record_failure();
            return Err(e).context("fetching CKAN package_show");
        }
    };
    breaker.record_success();

    if !body.get("success").and_then(Value::as_bool).unwrap_or(false) {
        bail!("CKAN package_show reported failure for {}", config.ckan_dataset_id);
    }

    let resources = body
        .get("result")
        .and_then(|r| r.get("resources"))
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("CKAN response has no resources array"))?;

    let mut out: BTreeMap<String, MonthlyResource> = BTreeMap::new();
    for res in resources {
        let Some(obj) = res.as_object() else { continue };
        let name = obj
            .get("name")
            .or_else(|| obj.get("title"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let resource_url = obj.get("url").and_then(Value::as_str).unwrap_or("").to_string();
        if resource_url.is_empty() {
            continue;
        }
        let format = obj
            .get("format")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        // CKAN metadata occasionally carries relative paths or plain junk
        // in the url field; only absolute, parseable URLs are downloadable.
        if url::Url::parse(&resource_url).is_err() {
            debug!(url = resource_url.as_str(), "skipping resource with unparseable URL");
            continue;
        }

        let hay = format!("{} {}", name, resource_url).to_lowercase();
        if !hay.contains("basecompleta") && !hay.contains("base completa") {
            continue;
        }
        let Some(month) = extract_month(&hay) else { continue };

        let candidate = MonthlyResource {
            month: month.clone(),
            name,
            url: resource_url,
            format,
        };

        // Duplicate month: the CSV variant wins over whatever else the
        // portal uploaded that day.
        let replace = match out.get(&month) {
            Some(existing) => !existing.is_csv() && candidate.is_csv(),
            None => true,
        };
        if replace {
            out.insert(month, candidate);
        }
    }

    info!(months = out.len(), "Base Completa months discovered");
    Ok(out)
}

/// Pull a "YYYY-MM" out of free text: a 20xx year, an optional -, _ or /
/// separator, then a plausible month. The portal has used every one of
/// these spellings at some point.
pub fn extract_month(text: &str) -> Option<String> {
    let b = text.as_bytes();
    let mut i = 0;
    while i + 4 <= b.len().saturating_sub(2) {
        if b[i] == b'2'
            && b[i + 1] == b'0'
            && b[i + 2].is_ascii_digit()
            && b[i + 3].is_ascii_digit()
        {
            let mut j = i + 4;
            if j < b.len() && matches!(b[j], b'-' | b'_' | b'/') {
                j += 1;
            }
            if j + 1 < b.len() && b[j].is_ascii_digit() && b[j + 1].is_ascii_digit() {
                let month = (b[j] - b'0') * 10 + (b[j + 1] - b'0');
                if (1..=12).contains(&month) {
                    let year = &text[i..i + 4];
                    return Some(format!("{year}-{month:02}"));
                }
            }
        }
        i += 1;
    }
    None
}

/// Plan the rolling window: anchor on the newest available month (or the
/// forced one), walk back `months_back` calendar months, and keep only the
/// months the portal actually has. Newest first.
pub fn plan_window(
    available: &BTreeMap<String, MonthlyResource>,
    months_back: usize,
    force_month: Option<&str>,
) -> Result<Vec<String>> {
    if available.is_empty() {
        bail!("no Base Completa months available to plan a window from");
    }

    let anchor = match force_month {
        Some(m) => {
            if !available.contains_key(m) {
                bail!(
                    "forced month {m} is not in the dataset; newest available is {}",
                    available.keys().last().expect("non-empty map")
                );
            }
            m.to_string()
        }
        // BTreeMap keys are sorted, so the last one is the newest month.
        None => available.keys().last().expect("non-empty map").clone(),
    };

    let mut window = Vec::new();
    for i in 0..months_back {
        let Some(month) = month_minus(&anchor, i as u32) else { break };
        if available.contains_key(&month) {
            window.push(month);
        }
    }

    if window.is_empty() {
        bail!("window planning produced no processable months");
    }
    info!(anchor = anchor.as_str(), months = window.len(), "window planned");
    Ok(window)
}

/// "YYYY-MM" minus N calendar months, or None when the input is malformed.
fn month_minus(ym: &str, delta: u32) -> Option<String> {
    let (y, m) = ym.split_once('-')?;
    let year: i64 = y.parse().ok()?;
    let month: i64 = m.parse().ok()?;
    if !(1..=12).contains(&month) {
        return None;
    }
    let idx = year * 12 + (month - 1) - delta as i64;
    if idx < 0 {
        return None;
    }
    Some(format!("{:04}-{:02}", idx / 12, idx % 12 + 1))
}

/// Download one month to `dest`, always landing as gzip. Plain-CSV responses
/// are compressed on the way down; already-gzipped payloads pass through.
/// Tmp-then-rename, so a dropped connection never leaves a torn file that a
/// later run would mistake for a cache hit.
pub async fn download_month(
    client: &reqwest::Client,
    resource: &MonthlyResource,
    dest: &Path,
    timeout: std::time::Duration,
    breaker: &CircuitBreaker,
) -> Result<()> {
    if !breaker.allow_request() {
        bail!("portal circuit breaker is open; not downloading {}", resource.month);
    }

    info!(month = resource.month.as_str(), url = resource.url.as_str(), "downloading extract");

    let outcome = async {
        let response = client
            .get(&resource.url)
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_lowercase();
        let is_gz = resource.url.to_lowercase().ends_with(".gz") || content_type.contains("gzip");

        let bytes = response.bytes().await?;
        Ok::<_, reqwest::Error>((bytes, is_gz))
    }
    .await;

    let (bytes, is_gz) = match outcome {
        Ok(v) => {
            breaker.record_success();
            v
        }
        Err(e) => {
            breaker.record_failure();
            return Err(e).with_context(|| format!("downloading {}", resource.url));
        }
    };

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }
    let tmp = dest.with_extension("gz.tmp");
    if is_gz {
        std::fs::write(&tmp, &bytes).with_context(|| format!("writing {}", tmp.display()))?;
    } else {
        let file = std::fs::File::create(&tmp)
            .with_context(|| format!("creating {}", tmp.display()))?;
        let mut enc = GzEncoder::new(file, Compression::default());
        enc.write_all(&bytes)
            .with_context(|| format!("compressing into {}", tmp.display()))?;
        enc.finish()
            .with_context(|| format!("finishing gzip stream {}", tmp.display()))?;
    }
    std::fs::rename(&tmp, dest)
        .with_context(|| format!("renaming {} into place", tmp.display()))?;

    let size = std::fs::metadata(dest).map(|m| m.len()).unwrap_or(0);
    if size == 0 {
        warn!(month = resource.month.as_str(), "downloaded extract is empty");
    }
    info!(month = resource.month.as_str(), bytes = size, "extract stored");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(month: &str, url: &str, format: Option<&str>) -> MonthlyResource {
        MonthlyResource {
            month: month.to_string(),
            name: format!("basecompleta{month}"),
            url: url.to_string(),
            format: format.map(str::to_string),
        }
    }

    #[test]
    fn test_extract_month_spellings() {
        assert_eq!(extract_month("basecompleta2025-12.csv"), Some("2025-12".to_string()));
        assert_eq!(extract_month("base completa 2024_03"), Some("2024-03".to_string()));
        assert_eq!(extract_month("dump/2023/07/basecompleta.csv"), Some("2023-07".to_string()));
        assert_eq!(extract_month("basecompleta202511.csv.gz"), Some("2025-11".to_string()));
    }

    #[test]
    fn test_extract_month_rejects_nonsense() {
        assert_eq!(extract_month("basecompleta.csv"), None);
        assert_eq!(extract_month("release 2025-13"), None);
        assert_eq!(extract_month(""), None);
    }

    #[test]
    fn test_month_minus_crosses_year_boundaries() {
        assert_eq!(month_minus("2025-03", 0), Some("2025-03".to_string()));
        assert_eq!(month_minus("2025-03", 3), Some("2024-12".to_string()));
        assert_eq!(month_minus("2025-01", 13), Some("2023-12".to_string()));
        assert_eq!(month_minus("garbage", 1), None);
    }

    #[test]
    fn test_plan_window_skips_absent_months() {
        let mut available = BTreeMap::new();
        for m in ["2025-12", "2025-11", "2025-09"] {
            available.insert(m.to_string(), resource(m, "https://x/a.csv", Some("CSV")));
        }
        let window = plan_window(&available, 4, None).unwrap();
        // 2025-10 is missing from the portal and therefore from the window.
        assert_eq!(window, vec!["2025-12", "2025-11", "2025-09"]);
    }

    #[test]
    fn test_plan_window_respects_forced_anchor() {
        let mut available = BTreeMap::new();
        for m in ["2025-12", "2025-11"] {
            available.insert(m.to_string(), resource(m, "https://x/a.csv", Some("CSV")));
        }
        let window = plan_window(&available, 2, Some("2025-11")).unwrap();
        assert_eq!(window, vec!["2025-11"]);
        assert!(plan_window(&available, 2, Some("2020-01")).is_err());
    }

    #[test]
    fn test_plan_window_empty_dataset_errors() {
        assert!(plan_window(&BTreeMap::new(), 12, None).is_err());
    }
}
