use anyhow::{Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;

mod settings;

pub use settings::{
    BufferSettings, CaptureSettings, CircuitSettings, FlushSettings, IngestSettings,
    KafkaSettings, OutboxSettings,
};

/// Read a stack of YAML layers, overlay each onto the previous, and produce
/// typed settings plus a canonical hash. The hash is what ties a running
/// process to a reviewed config; the daemon logs it at startup.
pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());

    for path in paths {
        let text =
            fs::read_to_string(path).with_context(|| format!("config layer {path} unreadable"))?;
        let layer: serde_yaml::Value = serde_yaml::from_str(&text)
            .with_context(|| format!("config layer {path} is not valid yaml"))?;
        let layer = serde_json::to_value(layer)
            .with_context(|| format!("config layer {path} not representable as json"))?;
        merged = overlay(merged, layer);
    }

    let canonical = canonical_string(&merged);
    let config_hash = hex::encode(Sha256::digest(canonical.as_bytes()));

    let settings: CaptureSettings =
        serde_json::from_value(merged.clone()).context("config does not match settings schema")?;

    Ok(LoadedConfig {
        config_json: merged,
        canonical_json: canonical,
        config_hash,
        settings,
    })
}

/// Settings with every key at its documented default, used when no config
/// file is supplied and by tests.
pub fn default_settings() -> CaptureSettings {
    CaptureSettings::default()
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_json: Value,
    pub canonical_json: String,
    pub config_hash: String,
    pub settings: CaptureSettings,
}

/// Overlay `upper` onto `base`, consuming both. Two objects merge key-wise;
/// any other pairing resolves to `upper`, so a later layer can replace
/// arrays and scalars wholesale while still overriding one nested key at a
/// time.
fn overlay(base: Value, upper: Value) -> Value {
    match (base, upper) {
        (Value::Object(mut below), Value::Object(above)) => {
            for (key, val) in above {
                let merged = match below.remove(&key) {
                    Some(existing) => overlay(existing, val),
                    None => val,
                };
                below.insert(key, merged);
            }
            Value::Object(below)
        }
        (_, upper) => upper,
    }
}

/// Render compact JSON with object keys in sorted order, so equal configs
/// hash equally no matter how their files were laid out.
fn canonical_string(v: &Value) -> String {
    match v {
        Value::Object(map) => {
            let ordered: BTreeMap<&String, &Value> = map.iter().collect();
            let fields: Vec<String> = ordered
                .into_iter()
                .map(|(key, val)| {
                    let key = serde_json::to_string(key).expect("string keys always serialize");
                    format!("{key}:{}", canonical_string(val))
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let elems: Vec<String> = items.iter().map(canonical_string).collect();
            format!("[{}]", elems.join(","))
        }
        leaf => serde_json::to_string(leaf).expect("json leaves always serialize"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let s = default_settings();
        assert_eq!(s.ingest.batch.max_size, 500);
        assert_eq!(s.ingest.batch.flush_interval_ms, 100);
        assert_eq!(s.ingest.buffer.capacity, 10_000);
        assert_eq!(s.ingest.buffer.resume_threshold(), 1_000);
        assert_eq!(s.ingest.db_retry_backoff_ms, 5_000);
        assert_eq!(s.outbox.min_batch, 10);
        assert_eq!(s.outbox.max_batch, 2_000);
        assert_eq!(s.outbox.target_latency_ms, 200);
        assert_eq!(s.outbox.system_failure_backoff_ms, 1_000);
        assert_eq!(s.outbox.max_backoff_ms, 30_000);
        assert_eq!(s.outbox.kafka_send_timeout_ms, 5_000);
    }

    #[test]
    fn later_layer_overrides_single_nested_key() {
        let base = serde_json::json!({
            "ingest": { "batch": { "max-size": 500, "flush-interval-ms": 100 } }
        });
        let merged = overlay(
            base,
            serde_json::json!({ "ingest": { "batch": { "max-size": 64 } } }),
        );
        let s: CaptureSettings = serde_json::from_value(merged).unwrap();
        assert_eq!(s.ingest.batch.max_size, 64);
        // Untouched sibling keys survive the merge.
        assert_eq!(s.ingest.batch.flush_interval_ms, 100);
    }

    #[test]
    fn later_layer_replaces_non_object_values() {
        let merged = overlay(
            serde_json::json!({ "a": [1, 2, 3], "b": { "c": 1 } }),
            serde_json::json!({ "a": [9], "b": 7 }),
        );
        assert_eq!(merged, serde_json::json!({ "a": [9], "b": 7 }));
    }

    #[test]
    fn canonical_hash_is_key_order_independent() {
        let a = canonical_string(&serde_json::json!({"b": 1, "a": {"d": 2, "c": 3}}));
        let b = canonical_string(&serde_json::json!({"a": {"c": 3, "d": 2}, "b": 1}));
        assert_eq!(a, b);
    }

    #[test]
    fn canonical_string_is_valid_compact_json() {
        let v = serde_json::json!({"z": ["a\"b", 1.5], "a": {"k": null, "b": true}});
        let rendered = canonical_string(&v);
        let reparsed: Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(reparsed, v);
        assert!(!rendered.contains(' '));
    }

    #[test]
    fn explicit_resume_threshold_wins() {
        let s: CaptureSettings = serde_json::from_value(serde_json::json!({
            "ingest": { "buffer": { "capacity": 100, "resume-threshold": 25 } }
        }))
        .unwrap();
        assert_eq!(s.ingest.buffer.resume_threshold(), 25);
    }
}
