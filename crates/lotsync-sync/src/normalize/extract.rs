//! Pure extraction of typed listing fields from a raw payload.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use lotsync_core::{translate_json, ConfigParam, ListingFields, Translator};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

/// Configuration parameter ids kept on the normalized record.
pub const CONFIG_PARAM_WHITELIST: [i64; 33] = [
    3, 6, 11, 13, 14, 17, 20, 23, 24, 38, 40, 41, 42, 43, 44, 46, 47, 48, 49, 50, 53, 58, 88, 90,
    91, 92, 93, 95, 97, 101, 108, 115, 116,
];

pub const MIN_YEAR: i32 = 1900;
pub const MAX_PRICE: i64 = 100_000_000;
pub const MAX_KM_AGE: i64 = 10_000_000;
pub const MAX_POWER: i32 = 10_000;
pub const MAX_DISPLACEMENT: f64 = 20.0;

#[derive(Debug, Error, PartialEq)]
pub enum ExtractError {
    #[error("record has no external id")]
    MissingExternalId,
    #[error("payload is not a JSON object")]
    PayloadNotObject,
    #[error("year {year} outside {min}..={max}", min = MIN_YEAR)]
    YearOutOfRange { year: i32, max: i32 },
    #[error("price {0} outside 0..={max}", max = MAX_PRICE)]
    PriceOutOfRange(i64),
    #[error("mileage {0} outside 0..={max}", max = MAX_KM_AGE)]
    MileageOutOfRange(i64),
    #[error("power {0} outside 0..={max}", max = MAX_POWER)]
    PowerOutOfRange(i32),
    #[error("displacement {0} outside 0..={max}", max = MAX_DISPLACEMENT)]
    DisplacementOutOfRange(f64),
}

/// Extract and validate one record. `current_year` bounds the model year.
pub fn extract_listing(
    external_id: &str,
    payload: &JsonValue,
    translator: &dyn Translator,
    current_year: i32,
) -> Result<ListingFields, ExtractError> {
    if external_id.trim().is_empty() {
        return Err(ExtractError::MissingExternalId);
    }
    let payload = payload.as_object().ok_or(ExtractError::PayloadNotObject)?;
    let fields = extract_fields(payload, translator);
    validate(&fields, current_year)?;
    Ok(fields)
}

pub fn extract_fields(payload: &Map<String, JsonValue>, translator: &dyn Translator) -> ListingFields {
    let text = |key: &str| translated_text(payload.get(key), translator);
    ListingFields {
        url: plain_text(payload.get("url")),
        mark: text("mark"),
        model: text("model"),
        year: integer(payload.get("year")).and_then(|v| i32::try_from(v).ok()),
        color: text("color"),
        price: integer(payload.get("price")),
        km_age: integer(payload.get("km_age")),
        engine_type: text("engine_type"),
        transmission_type: text("transmission_type"),
        body_type: text("body_type"),
        address: text("address"),
        section: text("section"),
        offer_created: date(payload.get("offer_created")),
        description: text("description"),
        displacement: decimal(payload.get("displacement")),
        vin: plain_text(payload.get("vin")),
        first_registration: date(payload.get("first_registration")),
        power: integer(payload.get("power")).and_then(|v| i32::try_from(v).ok()),
        drive_type: text("drive_type"),
        images: images(payload.get("images")),
        options: options(payload.get("extra"), translator),
        configuration: configuration(payload, translator),
    }
}

pub fn validate(fields: &ListingFields, current_year: i32) -> Result<(), ExtractError> {
    if let Some(year) = fields.year {
        let max = current_year + 1;
        if !(MIN_YEAR..=max).contains(&year) {
            return Err(ExtractError::YearOutOfRange { year, max });
        }
    }
    if let Some(price) = fields.price {
        if !(0..=MAX_PRICE).contains(&price) {
            return Err(ExtractError::PriceOutOfRange(price));
        }
    }
    if let Some(km) = fields.km_age {
        if !(0..=MAX_KM_AGE).contains(&km) {
            return Err(ExtractError::MileageOutOfRange(km));
        }
    }
    if let Some(power) = fields.power {
        if !(0..=MAX_POWER).contains(&power) {
            return Err(ExtractError::PowerOutOfRange(power));
        }
    }
    if let Some(displacement) = fields.displacement {
        if !(0.0..=MAX_DISPLACEMENT).contains(&displacement) {
            return Err(ExtractError::DisplacementOutOfRange(displacement));
        }
    }
    Ok(())
}

fn plain_text(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn translated_text(value: Option<&JsonValue>, translator: &dyn Translator) -> Option<String> {
    match value? {
        JsonValue::String(s) if !s.is_empty() => Some(translator.translate(s)),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Whole number from a JSON number or from the digits of a string.
fn integer(value: Option<&JsonValue>) -> Option<i64> {
    match value? {
        JsonValue::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && f.abs() < i64::MAX as f64)
                .map(|f| f.trunc() as i64)
        }),
        JsonValue::String(s) => {
            let digits: String = s.chars().filter(char::is_ascii_digit).collect();
            digits.parse().ok()
        }
        _ => None,
    }
}

fn decimal(value: Option<&JsonValue>) -> Option<f64> {
    match value? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => {
            let kept: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.')
                .collect();
            kept.parse().ok()
        }
        _ => None,
    }
}

/// `YYYY-MM-DD`, or `YYYY-MM` completed to the first of the month.
fn date(value: Option<&JsonValue>) -> Option<NaiveDate> {
    let raw = value?.as_str()?.trim();
    if raw.len() == 7 && raw.as_bytes()[4] == b'-' {
        return NaiveDate::parse_from_str(&format!("{raw}-01"), "%Y-%m-%d").ok();
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()
}

fn images(value: Option<&JsonValue>) -> Vec<String> {
    let decoded;
    let list = match value {
        Some(JsonValue::Array(items)) => items,
        Some(JsonValue::String(encoded)) => match serde_json::from_str::<JsonValue>(encoded) {
            Ok(JsonValue::Array(items)) => {
                decoded = items;
                &decoded
            }
            _ => return Vec::new(),
        },
        _ => return Vec::new(),
    };
    list.iter()
        .filter_map(|item| item.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Option labels from `extra.option.displayopts` then
/// `extra.option.moreoptions[].opts`, translated and de-duplicated.
fn options(extra: Option<&JsonValue>, translator: &dyn Translator) -> Vec<String> {
    let Some(option) = extra.and_then(|e| e.get("option")) else {
        return Vec::new();
    };

    let flat = option
        .get("displayopts")
        .and_then(JsonValue::as_array)
        .into_iter()
        .flatten();
    let grouped = option
        .get("moreoptions")
        .and_then(JsonValue::as_array)
        .into_iter()
        .flatten()
        .filter_map(|group| group.get("opts").and_then(JsonValue::as_array))
        .flatten();

    let mut labels: Vec<String> = Vec::new();
    for opt in flat.chain(grouped) {
        let Some(name) = opt.get("optionname").and_then(JsonValue::as_str) else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        let label = translator.translate(name);
        if !label.is_empty() && !labels.contains(&label) {
            labels.push(label);
        }
    }
    labels
}

fn is_present(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(a) => !a.is_empty(),
        JsonValue::Object(o) => !o.is_empty(),
        JsonValue::Number(_) => true,
    }
}

/// First non-empty of `configuration` and `extra.configuration`.
fn configuration_source(payload: &Map<String, JsonValue>) -> Option<&JsonValue> {
    payload
        .get("configuration")
        .filter(|v| is_present(v))
        .or_else(|| {
            payload
                .get("extra")
                .and_then(|extra| extra.get("configuration"))
                .filter(|v| is_present(v))
        })
}

fn param_id(value: Option<&JsonValue>) -> Option<i64> {
    match value? {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn param_text(value: Option<&JsonValue>) -> String {
    match value {
        None | Some(JsonValue::Null) => String::new(),
        Some(JsonValue::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn configuration(
    payload: &Map<String, JsonValue>,
    translator: &dyn Translator,
) -> Option<BTreeMap<String, ConfigParam>> {
    let tree = translate_json(translator, configuration_source(payload)?);
    let groups = tree.get("paramtypeitems")?.as_array()?;

    let mut params = BTreeMap::new();
    for item in groups
        .iter()
        .filter_map(|group| group.get("paramitems").and_then(JsonValue::as_array))
        .flatten()
    {
        let Some(id) = param_id(item.get("id")) else {
            continue;
        };
        if !CONFIG_PARAM_WHITELIST.contains(&id) {
            continue;
        }
        params.insert(
            id.to_string(),
            ConfigParam {
                name: param_text(item.get("name")),
                value: param_text(item.get("value")),
            },
        );
    }
    (!params.is_empty()).then_some(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lotsync_core::{DictionaryTranslator, IdentityTranslator};
    use serde_json::json;

    fn extract(payload: JsonValue) -> ListingFields {
        extract_fields(payload.as_object().expect("object"), &IdentityTranslator)
    }

    #[test]
    fn numeric_strings_keep_only_digits() {
        let fields = extract(json!({
            "year": "2 019",
            "price": "150,000",
            "km_age": 42000,
            "power": "150 hp",
            "displacement": "1.5T"
        }));
        assert_eq!(fields.year, Some(2019));
        assert_eq!(fields.price, Some(150_000));
        assert_eq!(fields.km_age, Some(42_000));
        assert_eq!(fields.power, Some(150));
        assert_eq!(fields.displacement, Some(1.5));
    }

    #[test]
    fn unconvertible_numbers_become_null() {
        let fields = extract(json!({"year": "n/a", "price": "", "displacement": "..", "power": true}));
        assert_eq!(fields.year, None);
        assert_eq!(fields.price, None);
        assert_eq!(fields.displacement, None);
        assert_eq!(fields.power, None);
    }

    #[test]
    fn truncated_dates_complete_to_first_of_month() {
        let fields = extract(json!({
            "first_registration": "2020-05",
            "offer_created": "2024-02-29",
        }));
        assert_eq!(fields.first_registration, NaiveDate::from_ymd_opt(2020, 5, 1));
        assert_eq!(fields.offer_created, NaiveDate::from_ymd_opt(2024, 2, 29));
        assert_eq!(extract(json!({"offer_created": "May 2020"})).offer_created, None);
    }

    #[test]
    fn images_accept_list_or_encoded_list() {
        assert_eq!(extract(json!({"images": ["a.jpg", "b.jpg"]})).images, vec!["a.jpg", "b.jpg"]);
        assert_eq!(extract(json!({"images": "[\"c.jpg\"]"})).images, vec!["c.jpg"]);
        assert!(extract(json!({"images": "not json"})).images.is_empty());
        assert!(extract(json!({"images": {"0": "x"}})).images.is_empty());
    }

    #[test]
    fn options_translate_then_deduplicate_in_order() {
        let dict = DictionaryTranslator::from([
            ("天窗", "Sunroof"),
            ("全景天窗", "Sunroof"),
            ("倒车影像", "Rear camera"),
        ]);
        let payload = json!({
            "extra": {"option": {
                "displayopts": [{"optionname": "天窗"}, {"optionname": ""}, {"nope": 1}],
                "moreoptions": [
                    {"opts": [{"optionname": "全景天窗"}, {"optionname": "倒车影像"}]},
                    {"opts": "broken"}
                ]
            }}
        });
        let fields = extract_fields(payload.as_object().expect("object"), &dict);
        assert_eq!(fields.options, vec!["Sunroof", "Rear camera"]);
    }

    #[test]
    fn configuration_keeps_whitelisted_ids_only() {
        let dict = DictionaryTranslator::from([("排量", "Displacement")]);
        let payload = json!({
            "configuration": {},
            "extra": {"configuration": {"paramtypeitems": [
                {"paramitems": [
                    {"id": 3, "name": "排量", "value": "1.5T"},
                    {"id": "13", "name": "Seats", "value": 5},
                    {"id": 999, "name": "Ignored", "value": "x"},
                    {"id": "abc", "name": "Bad id", "value": "y"}
                ]}
            ]}}
        });
        let config = extract_fields(payload.as_object().expect("object"), &dict)
            .configuration
            .expect("configuration");
        assert_eq!(config.len(), 2);
        assert_eq!(
            config["3"],
            ConfigParam {
                name: "Displacement".into(),
                value: "1.5T".into()
            }
        );
        assert_eq!(config["13"].value, "5");
    }

    #[test]
    fn empty_configuration_is_absent() {
        let fields = extract(json!({"configuration": {"paramtypeitems": [{"paramitems": [{"id": 1}]}]}}));
        assert_eq!(fields.configuration, None);
    }

    #[test]
    fn url_and_vin_bypass_translation() {
        let dict = DictionaryTranslator::from([("LSVAA", "translated"), ("红色", "Red")]);
        let payload = json!({"vin": "LSVAA", "url": "LSVAA", "color": "红色"});
        let fields = extract_fields(payload.as_object().expect("object"), &dict);
        assert_eq!(fields.vin.as_deref(), Some("LSVAA"));
        assert_eq!(fields.url.as_deref(), Some("LSVAA"));
        assert_eq!(fields.color.as_deref(), Some("Red"));
    }

    #[test]
    fn year_boundary_is_next_year_inclusive() {
        let current = 2025;
        let accepted = ListingFields {
            year: Some(current + 1),
            ..Default::default()
        };
        assert!(validate(&accepted, current).is_ok());
        let rejected = ListingFields {
            year: Some(current + 2),
            ..Default::default()
        };
        assert_eq!(
            validate(&rejected, current),
            Err(ExtractError::YearOutOfRange {
                year: current + 2,
                max: current + 1
            })
        );
        let ancient = ListingFields {
            year: Some(1899),
            ..Default::default()
        };
        assert!(validate(&ancient, current).is_err());
    }

    #[test]
    fn magnitude_bounds_reject_outliers() {
        let over = |f: ListingFields| validate(&f, 2025);
        assert!(over(ListingFields { price: Some(-1), ..Default::default() }).is_err());
        assert!(over(ListingFields { price: Some(MAX_PRICE + 1), ..Default::default() }).is_err());
        assert!(over(ListingFields { km_age: Some(MAX_KM_AGE + 1), ..Default::default() }).is_err());
        assert!(over(ListingFields { power: Some(MAX_POWER + 1), ..Default::default() }).is_err());
        assert!(over(ListingFields { displacement: Some(20.5), ..Default::default() }).is_err());
        assert!(over(ListingFields { displacement: Some(20.0), ..Default::default() }).is_ok());
    }

    #[test]
    fn blank_identity_and_non_object_payloads_are_rejected() {
        assert_eq!(
            extract_listing(" ", &json!({}), &IdentityTranslator, 2025),
            Err(ExtractError::MissingExternalId)
        );
        assert_eq!(
            extract_listing("a", &json!([1, 2]), &IdentityTranslator, 2025),
            Err(ExtractError::PayloadNotObject)
        );
    }
}
