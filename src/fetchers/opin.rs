// =============================================================================
// fetchers/opin.rs — THE OPEN INSURANCE DIRECTORY LIAISON
// =============================================================================
//
// The Open Insurance directory lists every participating organization as a
// JSON document whose schema has been through several committees. Keys
// arrive in PascalCase, camelCase, and at least one spelling of
// "Organisation" per continent. We cope the same way we cope with CSV
// headers: ordered synonym lists, first hit wins.
//
// Two things come out of here:
//   1. A slim participants artifact: id, name, registration number, status,
//      roles. The full document is interesting to auditors and nobody else.
//   2. The set of every valid CNPJ found anywhere in the document, which is
//      what flags an insurer as an Open Insurance participant downstream.
// =============================================================================

use std::collections::HashSet;

use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::config::Config;
use crate::identifier::normalize_cnpj;
use crate::models::{
    now_iso, ParticipantsMeta, ParticipantsPayload, ParticipantsSource, SlimParticipant,
};

/// Key hints that mark a value as a registration identifier.
const CNPJ_KEY_HINTS: &[&str] = &["cnpj", "registrationnumber", "document", "documentnumber"];

/// The directory, digested: the slim artifact plus the CNPJ flag set.
#[derive(Debug, Clone)]
pub struct OpinDirectory {
    pub payload: ParticipantsPayload,
    pub cnpjs: HashSet<String>,
}

/// Fetch and digest the participants directory.
pub async fn fetch_participants(
    client: &reqwest::Client,
    config: &Config,
    breaker: &CircuitBreaker,
) -> Result<OpinDirectory> {
    if !breaker.allow_request() {
        bail!("directory circuit breaker is open; skipping participants fetch");
    }

    let fetched_at = now_iso();
    let response = client
        .get(&config.opin_participants_url)
        .header(reqwest::header::ACCEPT, "application/json")
        .send()
        .await
        .and_then(|r| r.error_for_status());

    let document: Value = match response {
        Ok(r) => match r.json().await {
            Ok(v) => v,
            Err(e) => {
                breaker.record_failure();
                return Err(e).context("parsing participants directory JSON");
            }
        },
        Err(e) => {
            breaker.record_failure();
            return Err(e).context("fetching participants directory");
        }
    };
    breaker.record_success();

    Ok(digest(document, &config.opin_participants_url, fetched_at))
}

/// Pure digestion step, split from the fetch for testability.
pub fn digest(document: Value, url: &str, fetched_at: String) -> OpinDirectory {
    let participants: Vec<SlimParticipant> = extract_participants(&document)
        .into_iter()
        .map(slim_participant)
        .collect();

    let mut cnpjs = HashSet::new();
    harvest_cnpjs(&document, &mut cnpjs);

    if participants.is_empty() {
        warn!("participants directory yielded zero participants");
    }
    info!(
        participants = participants.len(),
        cnpjs = cnpjs.len(),
        "participants directory digested"
    );

    let count = participants.len() as u64;
    OpinDirectory {
        payload: ParticipantsPayload {
            source: ParticipantsSource {
                url: url.to_string(),
                fetched_at,
            },
            participants,
            meta: ParticipantsMeta { count },
        },
        cnpjs,
    }
}

/// The participant list may be the document itself or live under one of a
/// few conventional wrapper keys.
fn extract_participants(document: &Value) -> Vec<&Map<String, Value>> {
    fn as_objects(list: &[Value]) -> Vec<&Map<String, Value>> {
        list.iter().filter_map(Value::as_object).collect()
    }

    if let Some(list) = document.as_array() {
        return as_objects(list);
    }
    if let Some(obj) = document.as_object() {
        for key in ["participants", "data", "result", "items"] {
            if let Some(list) = obj.get(key).and_then(Value::as_array) {
                return as_objects(list);
            }
        }
    }
    Vec::new()
}

fn pick<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    for key in keys {
        match obj.get(*key) {
            Some(Value::Null) | None => continue,
            Some(v) if v.as_str().map(|s| s.is_empty()).unwrap_or(false) => continue,
            Some(v) => return Some(v),
        }
    }
    None
}

fn pick_string(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    pick(obj, keys).map(|v| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

fn slim_participant(obj: &Map<String, Value>) -> SlimParticipant {
    let roles = pick(obj, &["Roles", "roles"])
        .map(|v| match v {
            Value::Array(items) => items
                .iter()
                .filter_map(|i| i.as_str().map(str::to_string))
                .collect(),
            Value::String(s) => vec![s.clone()],
            _ => Vec::new(),
        })
        .unwrap_or_default();

    SlimParticipant {
        id: pick_string(
            obj,
            &[
                "OrganisationId",
                "OrganizationId",
                "organisationId",
                "organizationId",
                "id",
            ],
        ),
        name: pick_string(
            obj,
            &[
                "OrganisationName",
                "OrganizationName",
                "organisationName",
                "organizationName",
                "legalName",
                "name",
            ],
        ),
        registration_number: pick_string(
            obj,
            &[
                "RegistrationNumber",
                "registrationNumber",
                "registration_number",
                "cnpj",
                "CNPJ",
            ],
        ),
        status: pick_string(obj, &["Status", "status"]),
        roles,
    }
}

/// Walk the whole document collecting valid CNPJs from any key that smells
/// like a registration identifier, at any depth. The directory nests
/// organizations inside authorization servers inside resources, and we are
/// not going to model all of that just to find fourteen digits.
fn harvest_cnpjs(value: &Value, out: &mut HashSet<String>) {
    match value {
        Value::Object(obj) => {
            for (key, v) in obj {
                let lk = key.to_lowercase();
                if CNPJ_KEY_HINTS.iter().any(|hint| lk.contains(hint)) {
                    if let Some(cnpj) = normalize_cnpj(v) {
                        out.insert(cnpj);
                    }
                }
                harvest_cnpjs(v, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                harvest_cnpjs(item, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_digest_wrapped_participant_list() {
        let doc = json!({
            "participants": [
                {
                    "OrganisationId": "org-1",
                    "OrganisationName": "Porto Seguro",
                    "RegistrationNumber": "04.544.720/0001-03",
                    "Status": "Active",
                    "Roles": ["DADOS"]
                },
                {
                    "organizationName": "Azul Seguros",
                    "cnpj": 33448150000100_u64,
                    "status": "Active"
                }
            ]
        });
        let dir = digest(doc, "https://directory/participants", "t".to_string());
        assert_eq!(dir.payload.meta.count, 2);
        assert_eq!(dir.payload.participants[0].name.as_deref(), Some("Porto Seguro"));
        assert_eq!(
            dir.payload.participants[0].registration_number.as_deref(),
            Some("04.544.720/0001-03")
        );
        assert!(dir.cnpjs.contains("04544720000103"));
        assert!(dir.cnpjs.contains("33448150000100"));
    }

    #[test]
    fn test_digest_bare_array() {
        let doc = json!([{"name": "Solo Org", "registrationNumber": "04544720000103"}]);
        let dir = digest(doc, "u", "t".to_string());
        assert_eq!(dir.payload.meta.count, 1);
        assert!(dir.cnpjs.contains("04544720000103"));
    }

    #[test]
    fn test_harvest_reaches_nested_structures() {
        let doc = json!({
            "data": [{
                "name": "Nested Org",
                "AuthorisationServers": [
                    {"Issuer": "x", "OrgCnpj": "4544720000103"}
                ]
            }]
        });
        let dir = digest(doc, "u", "t".to_string());
        // 13 digits recovers its leading zero on the way in.
        assert!(dir.cnpjs.contains("04544720000103"));
    }

    #[test]
    fn test_invalid_identifiers_are_not_harvested() {
        let doc = json!({"participants": [{"cnpj": true}, {"cnpj": "123"}]});
        let dir = digest(doc, "u", "t".to_string());
        assert!(dir.cnpjs.is_empty());
    }

    #[test]
    fn test_unrecognized_shape_yields_empty_directory() {
        let dir = digest(json!("not a directory"), "u", "t".to_string());
        assert_eq!(dir.payload.meta.count, 0);
        assert!(dir.cnpjs.is_empty());
    }
}
