//! Content fingerprints of generation inputs

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Parameter excluded from the fingerprint unless the model opts in
pub const SEED_KEY: &str = "seed";

/// Everything that identifies a batch's inputs
#[derive(Debug, Clone, Copy)]
pub struct FingerprintInput<'a> {
    pub model: &'a str,
    pub prompt: &'a str,
    pub batch_count: usize,
    pub seed: u64,
    /// Fold the seed into the digest (per-model `seed_sensitive`)
    pub include_seed: bool,
    pub parameters: &'a Map<String, Value>,
}

/// Sorted-key, whitespace-free JSON
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// `sha256` of the canonical JSON array
/// `[model, prompt, batch_count, seed, parameters - seed]` as lowercase hex.
/// The seed is `null` unless `include_seed` is set. Fields are JSON-encoded,
/// so no field can run into the next.
pub fn fingerprint(input: &FingerprintInput<'_>) -> String {
    let mut parameters = input.parameters.clone();
    parameters.remove(SEED_KEY);
    let seed = if input.include_seed {
        Value::from(input.seed)
    } else {
        Value::Null
    };
    let material = canonical_json(&Value::Array(vec![
        Value::from(input.model),
        Value::from(input.prompt),
        Value::from(input.batch_count),
        seed,
        Value::Object(parameters),
    ]));
    let digest = Sha256::digest(material.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn fp(seed: u64, include_seed: bool, parameters: &Map<String, Value>) -> String {
        fingerprint(&FingerprintInput {
            model: "flux",
            prompt: "a cat",
            batch_count: 2,
            seed,
            include_seed,
            parameters,
        })
    }

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let value = json!({"b": 1, "a": {"d": [1, {"z": 0, "y": "s"}], "c": null}});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":{"c":null,"d":[1,{"y":"s","z":0}]},"b":1}"#
        );
    }

    #[test]
    fn seed_is_ignored_unless_model_opts_in() {
        let a = params(json!({"size": "1K", "seed": 1}));
        let b = params(json!({"size": "1K", "seed": 2}));
        assert_eq!(fp(1, false, &a), fp(2, false, &b));
        assert_ne!(fp(1, true, &a), fp(2, true, &b));
    }

    #[test]
    fn is_hex_sha256() {
        let f = fp(0, false, &Map::new());
        assert_eq!(f.len(), 64);
        assert!(f.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn sensitive_to_every_input() {
        let p = params(json!({"size": "1K"}));
        let base = fp(0, false, &p);
        assert_ne!(base, fp(0, false, &params(json!({"size": "2K"}))));
        let other_prompt = fingerprint(&FingerprintInput {
            model: "flux",
            prompt: "a dog",
            batch_count: 2,
            seed: 0,
            include_seed: false,
            parameters: &p,
        });
        assert_ne!(base, other_prompt);
        let other_count = fingerprint(&FingerprintInput {
            model: "flux",
            prompt: "a cat",
            batch_count: 3,
            seed: 0,
            include_seed: false,
            parameters: &p,
        });
        assert_ne!(base, other_count);
    }

    #[test]
    fn fields_do_not_bleed_into_each_other() {
        let p = Map::new();
        let input = |model: &'static str, prompt: &'static str| FingerprintInput {
            model,
            prompt,
            batch_count: 1,
            seed: 0,
            include_seed: false,
            parameters: &p,
        };
        assert_ne!(
            fingerprint(&input("a|b", "c")),
            fingerprint(&input("a", "b|c"))
        );
        assert_ne!(
            fingerprint(&input("a\",\"b", "c")),
            fingerprint(&input("a", "b\",\"c"))
        );
    }

    proptest! {
        #[test]
        fn key_order_and_seed_never_matter(
            entries in proptest::collection::btree_map("[a-r]{1,6}", 0i64..1000, 0..8),
            seed_a in any::<u64>(),
            seed_b in any::<u64>(),
        ) {
            let forward: Map<String, Value> = entries
                .iter()
                .map(|(k, v)| (k.clone(), json!(v)))
                .collect();
            let reversed: Map<String, Value> = entries
                .iter()
                .rev()
                .map(|(k, v)| (k.clone(), json!(v)))
                .chain(std::iter::once((SEED_KEY.to_string(), json!(seed_b))))
                .collect();
            prop_assert_eq!(fp(seed_a, false, &forward), fp(seed_b, false, &reversed));
        }

        #[test]
        fn changing_a_value_changes_the_fingerprint(
            entries in proptest::collection::btree_map("[a-r]{1,6}", 0i64..1000, 1..8),
        ) {
            let original: Map<String, Value> = entries
                .iter()
                .map(|(k, v)| (k.clone(), json!(v)))
                .collect();
            let mut changed = original.clone();
            if let Some((key, value)) = entries.iter().next() {
                changed.insert(key.clone(), json!(value + 1));
            }
            prop_assert_ne!(fp(0, false, &original), fp(0, false, &changed));
        }
    }
}
