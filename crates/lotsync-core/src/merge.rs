//! Partial-update merge for change-feed payloads.

use serde_json::{Map, Value as JsonValue};

/// Marker on payload keys that carry the new value of the unprefixed field.
pub const DELTA_PREFIX: &str = "new_";

/// Fold `incoming` onto `existing`.
///
/// `new_<field>` keys overwrite `<field>`; every other key overwrites itself.
/// Delta keys are applied after plain keys, so `new_price` beats `price` in
/// the same payload. Keys absent from `incoming` are left untouched. A
/// non-object `existing` is replaced by an empty object first.
pub fn merge_payload(existing: &mut JsonValue, incoming: &JsonValue) {
    let Some(incoming) = incoming.as_object() else {
        return;
    };
    if !existing.is_object() {
        *existing = JsonValue::Object(Map::new());
    }
    let Some(target) = existing.as_object_mut() else {
        return;
    };

    for (key, value) in incoming {
        if delta_field(key).is_none() {
            target.insert(key.clone(), value.clone());
        }
    }
    for (key, value) in incoming {
        if let Some(field) = delta_field(key) {
            target.insert(field.to_string(), value.clone());
        }
    }
}

/// The field a `new_<field>` key targets. A bare prefix is not a delta.
fn delta_field(key: &str) -> Option<&str> {
    key.strip_prefix(DELTA_PREFIX).filter(|field| !field.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn delta_keys_overwrite_only_their_field() {
        let mut existing = json!({"price": 100, "mark": "BYD", "year": 2019});
        merge_payload(&mut existing, &json!({"new_price": 90}));
        assert_eq!(existing, json!({"price": 90, "mark": "BYD", "year": 2019}));
    }

    #[test]
    fn plain_keys_overwrite_directly() {
        let mut existing = json!({"color": "red"});
        merge_payload(&mut existing, &json!({"color": "blue", "vin": "X1"}));
        assert_eq!(existing, json!({"color": "blue", "vin": "X1"}));
    }

    #[test]
    fn delta_wins_over_plain_key_in_same_payload() {
        let mut existing = json!({"price": 100});
        merge_payload(&mut existing, &json!({"price": 95, "new_price": 90}));
        assert_eq!(existing, json!({"price": 90}));
    }

    #[test]
    fn bare_prefix_key_is_kept_verbatim() {
        let mut existing = json!({});
        merge_payload(&mut existing, &json!({"new_": 1}));
        assert_eq!(existing, json!({"new_": 1}));
    }

    #[test]
    fn non_object_existing_is_replaced() {
        let mut existing = JsonValue::Null;
        merge_payload(&mut existing, &json!({"new_km_age": 5000}));
        assert_eq!(existing, json!({"km_age": 5000}));
    }
}
