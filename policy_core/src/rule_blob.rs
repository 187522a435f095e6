// Export/import envelope for rule sets.
//
// {
//   "version": 1,
//   "exported_at": "...",
//   "digest": "<sha256 hex of the serialized rules array>",
//   "rules": [ ... ]
// }
//
// Entries are decoded one by one so a blob written by a newer daemon can
// still be imported partially: whatever this version understands is kept,
// the rest is counted as skipped.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{PolicyError, PolicyResult};
use crate::rule::Rule;

pub const RULE_BLOB_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    #[serde(default)]
    exported_at: Option<DateTime<Utc>>,
    #[serde(default)]
    digest: Option<String>,
    rules: Vec<Value>,
}

/// Outcome of decoding a blob
#[derive(Debug, Default)]
pub struct DecodedRules {
    pub rules: Vec<Rule>,
    pub skipped: usize,
    /// Set when the blob was written with a different format version
    pub version_mismatch: Option<PolicyError>,
}

fn digest_of(rules: &[Value]) -> PolicyResult<String> {
    let bytes = serde_json::to_vec(rules).map_err(|e| PolicyError::InvalidBlob(e.to_string()))?;
    let hash = Sha256::digest(&bytes);
    Ok(hash.iter().map(|b| format!("{:02x}", b)).collect())
}

/// Serializes rules into a versioned blob
pub fn encode(rules: &[Rule]) -> PolicyResult<Vec<u8>> {
    let values = rules
        .iter()
        .map(serde_json::to_value)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| PolicyError::InvalidBlob(e.to_string()))?;
    let envelope = Envelope {
        version: RULE_BLOB_VERSION,
        exported_at: Some(Utc::now()),
        digest: Some(digest_of(&values)?),
        rules: values,
    };
    serde_json::to_vec_pretty(&envelope).map_err(|e| PolicyError::InvalidBlob(e.to_string()))
}

/// Decodes a blob. Fails only when the envelope itself is unusable or its
/// digest does not match; individual bad entries are skipped.
pub fn decode(bytes: &[u8]) -> PolicyResult<DecodedRules> {
    let envelope: Envelope =
        serde_json::from_slice(bytes).map_err(|e| PolicyError::InvalidBlob(e.to_string()))?;

    if let Some(expected) = &envelope.digest {
        let actual = digest_of(&envelope.rules)?;
        if !expected.eq_ignore_ascii_case(&actual) {
            return Err(PolicyError::InvalidBlob(format!(
                "digest mismatch (expected {}, computed {})",
                expected, actual
            )));
        }
    }

    let version_mismatch = if envelope.version != RULE_BLOB_VERSION {
        let e = PolicyError::UnsupportedVersion {
            found: envelope.version,
            supported: RULE_BLOB_VERSION,
        };
        warn!("{}; importing entries best-effort", e);
        Some(e)
    } else {
        None
    };

    let mut decoded = DecodedRules {
        version_mismatch,
        ..Default::default()
    };
    for (idx, value) in envelope.rules.into_iter().enumerate() {
        match serde_json::from_value::<Rule>(value) {
            Ok(rule) => decoded.rules.push(rule),
            Err(e) => {
                debug!("Skipping rule entry {}: {}", idx, e);
                decoded.skipped += 1;
            }
        }
    }
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::Protocol;
    use crate::rule::{AddressMatch, RuleAction};
    use serde_json::json;

    fn sample_rules() -> Vec<Rule> {
        vec![
            Rule::builder("com.example.app", RuleAction::Allow)
                .address(AddressMatch::parse("93.184.216.34").unwrap())
                .port(443)
                .protocol(Protocol::Tcp)
                .build(),
            Rule::builder("/usr/bin/nc", RuleAction::Block).enabled(false).build(),
        ]
    }

    #[test]
    fn decode_reads_back_encoded_rules() {
        let rules = sample_rules();
        let blob = encode(&rules).unwrap();
        let decoded = decode(&blob).unwrap();

        assert_eq!(decoded.rules, rules);
        assert_eq!(decoded.skipped, 0);
        assert!(decoded.version_mismatch.is_none());
    }

    #[test]
    fn tampered_blob_is_rejected() {
        let blob = encode(&sample_rules()).unwrap();
        let mut value: Value = serde_json::from_slice(&blob).unwrap();
        value["rules"][0]["action"] = json!("block");
        let tampered = serde_json::to_vec(&value).unwrap();

        assert!(matches!(decode(&tampered), Err(PolicyError::InvalidBlob(_))));
    }

    #[test]
    fn newer_version_imports_what_it_can() {
        let good = serde_json::to_value(&sample_rules()[0]).unwrap();
        let blob = json!({
            "version": 7,
            "rules": [good, {"id": "not-a-uuid", "action": "teleport"}]
        });
        let decoded = decode(&serde_json::to_vec(&blob).unwrap()).unwrap();

        assert_eq!(decoded.rules.len(), 1);
        assert_eq!(decoded.skipped, 1);
        assert!(matches!(
            decoded.version_mismatch,
            Some(PolicyError::UnsupportedVersion { found: 7, supported: 1 })
        ));
    }

    #[test]
    fn garbage_is_invalid() {
        assert!(matches!(decode(b"not json"), Err(PolicyError::InvalidBlob(_))));
    }
}
