// =============================================================================
// config.rs — THE GRAND CONFIGURATION CATHEDRAL
// =============================================================================
//
// Every system needs configuration, but not every system needs THIS MUCH
// configuration. We have knobs for knobs. Thresholds for thresholds that
// gate other thresholds.
//
// All values can be overridden via environment variables, because hardcoding
// configuration is how you end up on the front page of Hacker News for the
// wrong reasons.
//
// Default values have been carefully chosen through a rigorous process of
// "that is what the portal actually serves" and "the regulator will probably
// rate-limit us if we go faster than this."
// =============================================================================

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// The Grand Configuration Struct. Every tunable parameter in the entire
/// pipeline lives here. Think of it as the cockpit of a fighter jet, except
/// instead of weapons systems you are controlling how politely we download
/// complaint spreadsheets from the Ministry of Justice.
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // DATA LAYOUT
    // =========================================================================
    /// Root of the on-disk data tree. Raw downloads, derived aggregates and
    /// snapshots all live under here.
    pub data_dir: PathBuf,

    /// Where the public artifacts (insurers.json, participants.json) land.
    pub api_dir: PathBuf,

    // =========================================================================
    // CONSUMER-PORTAL SOURCE (CKAN)
    // =========================================================================
    /// Base URL of the open-data portal's CKAN action API.
    pub ckan_api_base: String,

    /// CKAN dataset id of the complaint database.
    pub ckan_dataset_id: String,

    /// How many months back the rolling window reaches. Default: 12, because
    /// "the last year" is what everyone means and nobody says.
    pub months_back: usize,

    /// Pin the window anchor to a specific "YYYY-MM" instead of the newest
    /// month the portal offers. For reprocessing history.
    pub force_month: Option<String>,

    /// Re-download and re-aggregate months even when cached artifacts exist.
    pub force_download: bool,

    // =========================================================================
    // DIRECTORY AND REGISTRY SOURCES
    // =========================================================================
    /// Open Insurance participants directory endpoint.
    pub opin_participants_url: String,

    /// The regulator's master list of supervised entities (name + CNPJ per
    /// FIP code). This is the canonical insurer universe everything joins to.
    pub registry_url: String,

    // =========================================================================
    // HTTP BEHAVIOR
    // Because checking once is barely adequate, but checking impolitely
    // gets us IP-banned from every government site at once.
    // =========================================================================
    /// Timeout for small requests (discovery, directories).
    pub http_timeout: Duration,

    /// Timeout for monthly extract downloads. These files are measured in
    /// hundreds of megabytes and served at government speed.
    pub download_timeout: Duration,

    /// User agent. We identify ourselves honestly; the portal admins have
    /// enough problems without wondering who is scraping them.
    pub user_agent: String,

    // =========================================================================
    // CIRCUIT BREAKER PARAMETERS
    // Because government endpoints go down more often than you'd think.
    // =========================================================================
    /// Consecutive failures before a breaker trips. Default: 5, because
    /// everyone deserves five chances.
    pub cb_failure_threshold: u32,

    /// How long a tripped breaker stays open before probing again.
    pub cb_reset_timeout: Duration,

    /// Probe successes needed to close the breaker. Default: 2, because
    /// fool me once, shame on you...
    pub cb_success_threshold: u32,

    // =========================================================================
    // MATCHING KNOBS
    // =========================================================================
    /// Minimum similarity for a fuzzy name match to be accepted.
    pub match_threshold: f64,

    /// Minimum lead over the runner-up. Two near-tied candidates mean no
    /// match at all.
    pub match_min_margin: f64,

    // =========================================================================
    // PUBLICATION GUARDRAILS
    // =========================================================================
    /// Refuse to publish an insurers artifact smaller than this. A sudden
    /// tiny universe means an upstream source broke, not that the Brazilian
    /// insurance market evaporated overnight.
    pub min_insurers_count: u64,

    /// Refuse to publish if the universe shrank by more than this fraction
    /// versus the previous artifact.
    pub max_count_drop_pct: f64,

    /// How many dated snapshots to keep per artifact.
    pub snapshots_keep: usize,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    /// "Sensible" here meaning "works out of the box against the real
    /// endpoints but respects your wishes if you set them."
    ///
    /// Every parameter is overridable via env vars prefixed with SINISTRO_,
    /// because namespacing your env vars is what separates the professionals
    /// from the amateurs.
    pub fn from_env() -> Self {
        // Try to load .env if present. Fail silently if not, because not
        // everyone has their life together enough to create a .env file.
        let _ = dotenvy::dotenv();

        Config {
            data_dir: PathBuf::from(env_or_default("SINISTRO_DATA_DIR", "data")),
            api_dir: PathBuf::from(env_or_default("SINISTRO_API_DIR", "api/v1")),

            ckan_api_base: env_or_default(
                "SINISTRO_CKAN_API_BASE",
                "https://dados.mj.gov.br/api/3/action",
            ),
            ckan_dataset_id: env_or_default(
                "SINISTRO_CKAN_DATASET_ID",
                "reclamacoes-do-consumidor-gov-br",
            ),
            months_back: env_or_default("SINISTRO_MONTHS_BACK", "12")
                .parse()
                .unwrap_or(12),
            force_month: env::var("SINISTRO_FORCE_MONTH").ok().filter(|s| !s.is_empty()),
            force_download: env_or_default("SINISTRO_FORCE_DOWNLOAD", "0").trim() == "1",

            opin_participants_url: env_or_default(
                "SINISTRO_OPIN_PARTICIPANTS_URL",
                "https://data.directory.opinbrasil.com.br/participants",
            ),
            registry_url: env_or_default(
                "SINISTRO_REGISTRY_URL",
                "https://www2.susep.gov.br/menuestatistica/ses/download/LISTAEMPRESAS.csv",
            ),

            http_timeout: Duration::from_secs(
                env_or_default("SINISTRO_HTTP_TIMEOUT_SECS", "30")
                    .parse()
                    .unwrap_or(30),
            ),
            download_timeout: Duration::from_secs(
                env_or_default("SINISTRO_DOWNLOAD_TIMEOUT_SECS", "300")
                    .parse()
                    .unwrap_or(300),
            ),
            user_agent: env_or_default(
                "SINISTRO_USER_AGENT",
                "SinistroEngine/0.1 (insurance-reliability-research; educational-project)",
            ),

            cb_failure_threshold: env_or_default("SINISTRO_CB_FAILURE_THRESHOLD", "5")
                .parse()
                .unwrap_or(5),
            cb_reset_timeout: Duration::from_secs(
                env_or_default("SINISTRO_CB_RESET_TIMEOUT_SECS", "60")
                    .parse()
                    .unwrap_or(60),
            ),
            cb_success_threshold: env_or_default("SINISTRO_CB_SUCCESS_THRESHOLD", "2")
                .parse()
                .unwrap_or(2),

            match_threshold: env_or_default("SINISTRO_MATCH_THRESHOLD", "0.85")
                .parse()
                .unwrap_or(0.85),
            match_min_margin: env_or_default("SINISTRO_MATCH_MIN_MARGIN", "0.08")
                .parse()
                .unwrap_or(0.08),

            min_insurers_count: env_or_default("SINISTRO_MIN_INSURERS_COUNT", "200")
                .parse()
                .unwrap_or(200),
            max_count_drop_pct: env_or_default("SINISTRO_MAX_COUNT_DROP_PCT", "0.20")
                .parse()
                .unwrap_or(0.20),
            snapshots_keep: env_or_default("SINISTRO_SNAPSHOTS_KEEP", "30")
                .parse()
                .unwrap_or(30),
        }
    }

    // Path helpers. The layout is boring on purpose: raw inputs under raw/,
    // derived aggregates under derived/, dated history under snapshots/.

    pub fn raw_consumidor_dir(&self) -> PathBuf {
        self.data_dir.join("raw").join("consumidor_gov")
    }

    pub fn monthly_dir(&self) -> PathBuf {
        self.data_dir
            .join("derived")
            .join("consumidor_gov")
            .join("monthly")
    }

    pub fn derived_consumidor_dir(&self) -> PathBuf {
        self.data_dir.join("derived").join("consumidor_gov")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }

    pub fn registry_cache_path(&self) -> PathBuf {
        self.data_dir.join("raw").join("ses").join("LISTAEMPRESAS.csv")
    }

    pub fn raw_month_path(&self, month: &str) -> PathBuf {
        self.raw_consumidor_dir()
            .join(format!("basecompleta_{month}.csv.gz"))
    }

    pub fn monthly_artifact_path(&self, month: &str) -> PathBuf {
        self.monthly_dir()
            .join(format!("consumidor_gov_{month}.json.gz"))
    }

    pub fn rolling_artifact_path(&self) -> PathBuf {
        self.derived_consumidor_dir()
            .join("consumidor_gov_agg.json.gz")
    }

    pub fn match_report_path(&self) -> PathBuf {
        self.derived_consumidor_dir()
            .join("match_report_insurers.json")
    }

    pub fn insurers_path(&self) -> PathBuf {
        self.api_dir.join("insurers.json")
    }

    pub fn participants_path(&self) -> PathBuf {
        self.api_dir.join("participants.json")
    }
}

/// Helper to read an environment variable with a default fallback.
/// Because unwrap_or on env::var is ugly and we have standards.
fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
