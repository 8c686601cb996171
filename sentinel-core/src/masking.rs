//! Column masking transforms.
//!
//! A [`MaskingRule`] is resolved once per column at the start of a run from
//! the column's masking type, its JSON parameters, and the engine settings.
//! Applying a rule is pure apart from the injected RNG used by `randomize`.
//!
//! Resolution never fails: parameters that cannot be interpreted, unknown
//! masking types, and a `hash` rule without a configured secret all resolve
//! to [`MaskingRule::Redact`] together with a warning for the job record.

use crate::config::EngineSettings;
use crate::models::{ColumnConfig, MaskingType};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime};
use hmac::{Hmac, Mac};
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Placeholder written for every value of a redacted column.
pub const REDACTED: &str = "***REDACTED***";

/// Default date shift window for `randomize`, in days.
pub const DEFAULT_JITTER_DAYS: i64 = 30;

const NAIVE_DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
];

/// Coarse value category used to produce same-type synthetic values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Text,
    Integer,
    Float,
    Boolean,
    Date,
    DateTime,
    Uuid,
    Json,
    Other,
}

impl ValueKind {
    /// Classifies a declared SQL type name.
    pub fn from_declared(data_type: &str) -> Self {
        let t = data_type.trim().to_ascii_lowercase();
        if t.contains("interval") {
            Self::Other
        } else if t.contains("bool") || t == "bit" {
            Self::Boolean
        } else if t.contains("int") || t.contains("serial") {
            Self::Integer
        } else if ["numeric", "decimal", "float", "double", "real", "money", "number"]
            .iter()
            .any(|k| t.contains(k))
        {
            Self::Float
        } else if t.contains("timestamp") || t.contains("datetime") {
            Self::DateTime
        } else if t.contains("date") {
            Self::Date
        } else if t.contains("uuid") || t.contains("uniqueidentifier") {
            Self::Uuid
        } else if t.contains("json") {
            Self::Json
        } else if ["char", "text", "string", "clob"].iter().any(|k| t.contains(k)) {
            Self::Text
        } else {
            Self::Other
        }
    }

    /// Infers the category of an extracted value.
    pub fn infer(value: &Value) -> Self {
        match value {
            Value::Null => Self::Other,
            Value::Bool(_) => Self::Boolean,
            Value::Number(n) if n.is_i64() || n.is_u64() => Self::Integer,
            Value::Number(_) => Self::Float,
            Value::String(s) => {
                if uuid::Uuid::parse_str(s).is_ok() {
                    Self::Uuid
                } else if NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok() {
                    Self::Date
                } else if parse_datetime(s).is_some() {
                    Self::DateTime
                } else {
                    Self::Text
                }
            }
            Value::Array(_) | Value::Object(_) => Self::Json,
        }
    }
}

/// Resolved per-column transform.
#[derive(Clone)]
pub enum MaskingRule {
    /// Identity
    None,
    /// Fixed placeholder, including for nulls
    Redact,
    /// HMAC-SHA256 of the canonical text, hex encoded
    Hash {
        /// Keyed MAC, cloned per value
        mac: HmacSha256,
    },
    /// Same-type synthetic value
    Randomize {
        /// Declared kind, if the column declared one
        kind: Option<ValueKind>,
        /// Inclusive numeric bounds
        range: Option<(f64, f64)>,
        /// Maximum date shift in either direction
        jitter_days: i64,
    },
    /// Keep the first `prefix` and last `suffix` characters
    Partial {
        prefix: usize,
        suffix: usize,
        mask_char: char,
    },
}

impl std::fmt::Debug for MaskingRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Redact => f.write_str("Redact"),
            Self::Hash { .. } => f.write_str("Hash"),
            Self::Randomize {
                kind,
                range,
                jitter_days,
            } => f
                .debug_struct("Randomize")
                .field("kind", kind)
                .field("range", range)
                .field("jitter_days", jitter_days)
                .finish(),
            Self::Partial {
                prefix,
                suffix,
                mask_char,
            } => f
                .debug_struct("Partial")
                .field("prefix", prefix)
                .field("suffix", suffix)
                .field("mask_char", mask_char)
                .finish(),
        }
    }
}

/// A resolved rule plus the warning produced while resolving it, if any.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub rule: MaskingRule,
    pub warning: Option<String>,
}

impl Resolution {
    const fn clean(rule: MaskingRule) -> Self {
        Self {
            rule,
            warning: None,
        }
    }

    fn fail_closed(column: &ColumnConfig, reason: &str) -> Self {
        let error = crate::SentinelError::MaskingParameters {
            column: column.source_column.clone(),
            reason: reason.to_string(),
        };
        Self {
            rule: MaskingRule::Redact,
            warning: Some(format!("{error}; column redacted")),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RandomizeParams {
    min: Option<f64>,
    max: Option<f64>,
    days: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct PartialParams {
    prefix: usize,
    suffix: usize,
    #[serde(alias = "maskChar")]
    mask_char: String,
}

impl Default for PartialParams {
    fn default() -> Self {
        Self {
            prefix: 0,
            suffix: 4,
            mask_char: "*".to_string(),
        }
    }
}

fn parse_params<T>(raw: Option<&str>) -> Result<T, String>
where
    T: Default + for<'de> Deserialize<'de>,
{
    match raw.map(str::trim) {
        None | Some("") => Ok(T::default()),
        Some(text) => serde_json::from_str(text).map_err(|e| e.to_string()),
    }
}

/// Resolves the rule for one column.
///
/// A primary-key column configured for `randomize` is upgraded to `hash`
/// unless `allow_nondeterministic_pk_masking` is set, so keys stay stable
/// across runs.
pub fn resolve_rule(column: &ColumnConfig, settings: &EngineSettings) -> Resolution {
    match column.masking_type {
        MaskingType::None => Resolution::clean(MaskingRule::None),
        MaskingType::Redact => Resolution::clean(MaskingRule::Redact),
        MaskingType::Hash => resolve_hash(column, settings, None),
        MaskingType::Randomize
            if column.is_primary_key && !settings.allow_nondeterministic_pk_masking =>
        {
            resolve_hash(
                column,
                settings,
                Some(format!(
                    "Primary-key column '{}' uses randomize; hashing instead to keep keys stable",
                    column.source_column
                )),
            )
        }
        MaskingType::Randomize => resolve_randomize(column),
        MaskingType::Partial => resolve_partial(column),
        MaskingType::Unrecognized => Resolution::fail_closed(column, "unknown masking type"),
    }
}

fn resolve_hash(
    column: &ColumnConfig,
    settings: &EngineSettings,
    warning: Option<String>,
) -> Resolution {
    if settings.hash_secret.is_empty() {
        return Resolution::fail_closed(column, "hash masking requires a configured secret");
    }
    match HmacSha256::new_from_slice(settings.hash_secret.expose().as_bytes()) {
        Ok(mac) => Resolution {
            rule: MaskingRule::Hash { mac },
            warning,
        },
        Err(e) => Resolution::fail_closed(column, &e.to_string()),
    }
}

fn resolve_randomize(column: &ColumnConfig) -> Resolution {
    let params: RandomizeParams = match parse_params(column.masking_config.as_deref()) {
        Ok(p) => p,
        Err(reason) => return Resolution::fail_closed(column, &reason),
    };

    let range = match (params.min, params.max) {
        (Some(min), Some(max)) if min <= max && (max - min).is_finite() => Some((min, max)),
        (None, None) => None,
        _ => {
            return Resolution::fail_closed(
                column,
                "randomize needs finite min <= max with a finite span",
            );
        }
    };

    let jitter_days = params.days.unwrap_or(DEFAULT_JITTER_DAYS);
    if !(0..=36_500).contains(&jitter_days) {
        return Resolution::fail_closed(column, "randomize days must be between 0 and 36500");
    }

    Resolution::clean(MaskingRule::Randomize {
        kind: column.data_type.as_deref().map(ValueKind::from_declared),
        range,
        jitter_days,
    })
}

fn resolve_partial(column: &ColumnConfig) -> Resolution {
    let params: PartialParams = match parse_params(column.masking_config.as_deref()) {
        Ok(p) => p,
        Err(reason) => return Resolution::fail_closed(column, &reason),
    };

    let mut chars = params.mask_char.chars();
    match (chars.next(), chars.next()) {
        (Some(mask_char), None) => Resolution::clean(MaskingRule::Partial {
            prefix: params.prefix,
            suffix: params.suffix,
            mask_char,
        }),
        _ => Resolution::fail_closed(column, "mask_char must be a single character"),
    }
}

impl MaskingRule {
    /// Masks one value.
    pub fn apply<R: Rng + ?Sized>(&self, value: Value, rng: &mut R) -> Value {
        match self {
            Self::None => value,
            Self::Redact => Value::String(REDACTED.to_string()),
            _ if value.is_null() => Value::Null,
            Self::Hash { mac } => {
                let mut mac = mac.clone();
                mac.update(canonical_text(&value).as_bytes());
                Value::String(hex::encode(mac.finalize().into_bytes()))
            }
            Self::Randomize {
                kind,
                range,
                jitter_days,
            } => randomize(value, *kind, *range, *jitter_days, rng),
            Self::Partial {
                prefix,
                suffix,
                mask_char,
            } => Value::String(partial_mask(
                &canonical_text(&value),
                *prefix,
                *suffix,
                *mask_char,
            )),
        }
    }

    /// True for rules that give the same output for the same input.
    pub const fn is_deterministic(&self) -> bool {
        !matches!(self, Self::Randomize { .. })
    }
}

/// Text a value is hashed and partially masked over.
pub fn canonical_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn partial_mask(text: &str, prefix: usize, suffix: usize, mask_char: char) -> String {
    let chars: Vec<char> = text.chars().collect();
    let len = chars.len();
    if len <= prefix.saturating_add(suffix) {
        return std::iter::repeat_n(mask_char, len).collect();
    }
    let masked_end = len.saturating_sub(suffix);
    chars
        .iter()
        .enumerate()
        .map(|(i, c)| {
            if i < prefix || i >= masked_end {
                *c
            } else {
                mask_char
            }
        })
        .collect()
}

fn randomize<R: Rng + ?Sized>(
    value: Value,
    declared: Option<ValueKind>,
    range: Option<(f64, f64)>,
    jitter_days: i64,
    rng: &mut R,
) -> Value {
    let inferred = ValueKind::infer(&value);
    let kind = match declared {
        Some(ValueKind::Other) | None => inferred,
        Some(kind) => kind,
    };

    match (kind, &value) {
        (ValueKind::Integer, _) => match as_f64(&value) {
            Some(original) => random_integer(original, range, rng),
            None => random_text(&value, rng),
        },
        (ValueKind::Float, _) => match as_f64(&value) {
            Some(original) => random_float(original, range, rng),
            None => random_text(&value, rng),
        },
        (ValueKind::Boolean, _) => Value::Bool(rng.random_bool(0.5)),
        (ValueKind::Date | ValueKind::DateTime, Value::String(s)) => {
            shift_temporal(s, jitter_days, rng).map_or_else(|| random_text(&value, rng), Value::String)
        }
        (ValueKind::Uuid, _) => {
            let bytes: [u8; 16] = rng.random();
            Value::String(uuid::Builder::from_random_bytes(bytes).into_uuid().to_string())
        }
        (ValueKind::Json, Value::Array(items)) => Value::Array(
            items
                .iter()
                .map(|item| randomize(item.clone(), None, range, jitter_days, rng))
                .collect(),
        ),
        (ValueKind::Json, Value::Object(map)) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), randomize(v.clone(), None, range, jitter_days, rng)))
                .collect(),
        ),
        _ => random_text(&value, rng),
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Largest power of ten below `f64::MAX`.
const MAX_DEFAULT_DIGITS: f64 = 308.0;

/// Range `[0, 10^digits)` with the sign of the original, when no bounds are configured.
fn default_range(original: f64) -> (f64, f64) {
    let digits = (original.abs().log10().floor().max(0.0) + 1.0).min(MAX_DEFAULT_DIGITS);
    let upper = 10f64.powf(digits) - 1.0;
    if original < 0.0 {
        (-upper, 0.0)
    } else {
        (0.0, upper)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn random_integer<R: Rng + ?Sized>(original: f64, range: Option<(f64, f64)>, rng: &mut R) -> Value {
    let (min, max) = range.unwrap_or_else(|| default_range(original));
    let (low, high) = (min.ceil() as i64, max.floor() as i64);
    if low > high {
        return Value::from(low);
    }
    Value::from(rng.random_range(low..=high))
}

fn random_float<R: Rng + ?Sized>(original: f64, range: Option<(f64, f64)>, rng: &mut R) -> Value {
    let (min, max) = range.unwrap_or_else(|| default_range(original));
    serde_json::Number::from_f64(sample_between(min, max, rng)).map_or(Value::Null, Value::Number)
}

fn sample_between<R: Rng + ?Sized>(min: f64, max: f64, rng: &mut R) -> f64 {
    if !(min.is_finite() && max.is_finite() && min < max) {
        return if min.is_finite() { min } else { 0.0 };
    }
    if (max - min).is_finite() {
        return rng.random_range(min..=max);
    }
    // Span overflows f64; each half around the midpoint does not.
    let mid = min / 2.0 + max / 2.0;
    if rng.random_bool(0.5) {
        rng.random_range(min..=mid)
    } else {
        rng.random_range(mid..=max)
    }
}

fn random_text<R: Rng + ?Sized>(value: &Value, rng: &mut R) -> Value {
    let len = canonical_text(value).chars().count();
    Value::String(
        (0..len)
            .map(|_| char::from(rng.sample(Alphanumeric)))
            .collect(),
    )
}

fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    NAIVE_DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

/// Shifts a date or datetime string, keeping its textual format.
fn shift_temporal<R: Rng + ?Sized>(s: &str, jitter_days: i64, rng: &mut R) -> Option<String> {
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        let offset = rng.random_range(-jitter_days..=jitter_days);
        return date
            .checked_add_signed(Duration::days(offset))
            .map(|d| d.format("%Y-%m-%d").to_string());
    }

    let max_secs = jitter_days.saturating_mul(86_400);
    let offset = Duration::seconds(rng.random_range(-max_secs..=max_secs));

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.checked_add_signed(offset).map(|d| d.to_rfc3339());
    }

    NAIVE_DATETIME_FORMATS.iter().find_map(|fmt| {
        NaiveDateTime::parse_from_str(s, fmt)
            .ok()
            .and_then(|dt| dt.checked_add_signed(offset))
            .map(|dt| dt.format(fmt).to_string())
    })
}
