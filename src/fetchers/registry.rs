// =============================================================================
// fetchers/registry.rs — THE MASTER LIST CUSTODIAN
// =============================================================================
//
// The regulator publishes LISTAEMPRESAS.csv: every supervised entity with
// its FIP code, legal name, and CNPJ. This is the canonical insurer universe
// that everything else in the pipeline joins onto, which makes it the one
// file we really, really want to parse correctly.
//
// Naturally, it is also a file with unstable column names, an encoding that
// depends on which decade exported it, and the occasional row with more
// fields than the header. We parse defensively:
//
//   - UTF-8 first (BOM tolerated), Latin-1 as the fallback that cannot fail
//   - delimiter sniffed, not assumed
//   - columns resolved by synonym, with a positional fallback for the day
//     the header gives up entirely
//
// Downloads fall back to the on-disk cache when the endpoint is sulking:
// a slightly stale master list beats an empty insurer universe every time.
// =============================================================================

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use crate::aggregator::decode_latin1;
use crate::circuit_breaker::CircuitBreaker;
use crate::columns::FieldIndex;
use crate::config::Config;
use crate::identifier::normalize_cnpj_str;
use crate::models::RegistryEntry;

const CODE_SYNONYMS: &[&str] = &["codigofip", "codigo_fip", "coenti", "cod_fip", "codigo"];
const NAME_SYNONYMS: &[&str] = &["nomeentidade", "nome_entidade", "noenti", "nome"];
const CNPJ_SYNONYMS: &[&str] = &["cnpj"];

/// Fetch the master list, preferring a fresh download but surviving on the
/// cached copy when the endpoint is unreachable.
pub async fn fetch_registry(
    client: &reqwest::Client,
    config: &Config,
    breaker: &CircuitBreaker,
) -> Result<BTreeMap<String, RegistryEntry>> {
    let cache = config.registry_cache_path();

    let downloaded: Result<Vec<u8>> = async {
        if !breaker.allow_request() {
            bail!("registry circuit breaker is open");
        }
        let response = client
            .get(&config.registry_url)
            .send()
            .await
            .and_then(|r| r.error_for_status());
        match response {
            Ok(r) => match r.bytes().await {
                Ok(b) => {
                    breaker.record_success();
                    Ok(b.to_vec())
                }
                Err(e) => {
                    breaker.record_failure();
                    Err(e).context("reading registry body")
                }
            },
            Err(e) => {
                breaker.record_failure();
                Err(e).context("fetching registry")
            }
        }
    }
    .await;

    let bytes = match downloaded {
        Ok(bytes) if !bytes.is_empty() => {
            // Refresh the cache; failure to cache is not failure to proceed.
            if let Some(parent) = cache.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            if let Err(e) = std::fs::write(&cache, &bytes) {
                warn!(error = %e, "could not refresh registry cache");
            }
            bytes
        }
        other => {
            let err_note = match other {
                Ok(_) => "registry download returned an empty body".to_string(),
                Err(e) => e.to_string(),
            };
            warn!(error = err_note.as_str(), "registry download failed; trying cache");
            std::fs::read(&cache).with_context(|| {
                format!(
                    "registry unavailable and no cache at {}",
                    cache.display()
                )
            })?
        }
    };

    parse_registry(&bytes)
}

/// Parse LISTAEMPRESAS bytes into `fip_code -> entry`.
pub fn parse_registry(bytes: &[u8]) -> Result<BTreeMap<String, RegistryEntry>> {
    let text = decode_registry_bytes(bytes);
    let delimiter = sniff(&text);

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .context("reading registry header")?
        .iter()
        .map(str::to_string)
        .collect();
    if headers.is_empty() {
        bail!("registry CSV has no header row");
    }

    let index = FieldIndex::new(&headers);
    // Positional fallback: the historical layout is code, name, CNPJ, and a
    // header too mangled to resolve is no reason to discard the whole list.
    let code_idx = index.resolve(CODE_SYNONYMS).unwrap_or(0);
    let name_idx = index
        .resolve(NAME_SYNONYMS)
        .unwrap_or(usize::min(1, headers.len() - 1));
    let cnpj_idx = index
        .resolve(CNPJ_SYNONYMS)
        .unwrap_or(usize::min(2, headers.len() - 1));

    let mut out = BTreeMap::new();
    for record in reader.records() {
        let Ok(record) = record else { continue };

        let code: String = record
            .get(code_idx)
            .unwrap_or("")
            .chars()
            .filter(|c| c.is_ascii_digit())
            .collect();
        if code.is_empty() {
            continue;
        }

        let name = record.get(name_idx).unwrap_or("").trim().to_string();
        let cnpj = record.get(cnpj_idx).and_then(normalize_cnpj_str);

        out.insert(
            code.clone(),
            RegistryEntry {
                fip_code: code,
                name,
                cnpj,
            },
        );
    }

    if out.is_empty() {
        bail!("registry parse produced zero entities");
    }
    info!(entities = out.len(), "registry parsed");
    Ok(out)
}

/// UTF-8 when it decodes cleanly (BOM stripped), Latin-1 otherwise.
fn decode_registry_bytes(bytes: &[u8]) -> String {
    let without_bom = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);
    match std::str::from_utf8(without_bom) {
        Ok(s) => s.to_string(),
        Err(_) => decode_latin1(without_bom),
    }
}

fn sniff(text: &str) -> u8 {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_well_formed_registry() {
        let csv = b"CodigoFIP;NomeEntidade;CNPJ\n\
            05631;PORTO SEGURO COMPANHIA DE SEGUROS GERAIS;61.198.164/0001-60\n\
            06785;AZUL COMPANHIA DE SEGUROS GERAIS;33448150000100\n";
        let registry = parse_registry(csv).unwrap();
        assert_eq!(registry.len(), 2);
        let porto = &registry["05631"];
        assert_eq!(porto.name, "PORTO SEGURO COMPANHIA DE SEGUROS GERAIS");
        assert_eq!(porto.cnpj.as_deref(), Some("61198164000160"));
    }

    #[test]
    fn test_parse_latin1_registry() {
        // "Código" with an ó in Latin-1 (0xF3).
        let csv = b"C\xf3digo;Nome;CNPJ\n123;SEGURADORA A\xc7UCENA;04544720000103\n";
        let registry = parse_registry(csv).unwrap();
        assert_eq!(registry["123"].name, "SEGURADORA A\u{c7}UCENA");
    }

    #[test]
    fn test_positional_fallback_for_alien_headers() {
        let csv = b"col_a;col_b;col_c\n999;ENTIDADE MISTERIOSA;04544720000103\n";
        let registry = parse_registry(csv).unwrap();
        assert_eq!(registry["999"].name, "ENTIDADE MISTERIOSA");
        assert_eq!(registry["999"].cnpj.as_deref(), Some("04544720000103"));
    }

    #[test]
    fn test_rows_without_code_are_dropped() {
        let csv = b"CodigoFIP;NomeEntidade;CNPJ\n;SEM CODIGO;04544720000103\n77;COM CODIGO;\n";
        let registry = parse_registry(csv).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry["77"].cnpj, None);
    }

    #[test]
    fn test_empty_registry_is_an_error() {
        assert!(parse_registry(b"CodigoFIP;Nome;CNPJ\n").is_err());
    }

    #[test]
    fn test_bom_is_stripped() {
        let mut csv = vec![0xEF, 0xBB, 0xBF];
        csv.extend_from_slice(b"CodigoFIP;NomeEntidade;CNPJ\n11;ALFA;04544720000103\n");
        let registry = parse_registry(&csv).unwrap();
        assert!(registry.contains_key("11"));
    }
}
