//! Legacy delta import: loosely typed JSON blobs to typed events.
//!
//! Older exports spell the same field several ways and leave instants out.
//! Everything is resolved here, once, so the stored scenario is fully typed
//! and concrete.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::core::errors::{Result, TsimError};
use crate::scenario::event::Event;
use crate::scenario::model::{ScenarioMeta, ScenarioOrigin};
use crate::signal::model::{Review, ReviewSource};

const EVENT_LIST_KEYS: &[&str] = &["events", "deltas", "steps", "changes"];
const KIND_KEYS: &[&str] = &["kind", "type", "op", "action"];
const ID_KEYS: &[&str] = &["id", "review_id", "reviewId"];
const SOURCE_KEYS: &[&str] = &["source", "from", "reviewer_type", "reviewerType"];
const WEIGHT_KEYS: &[&str] = &["weight", "w", "score"];
const INSTANT_KEYS: &[&str] = &["at", "timestamp", "ts", "created_at", "createdAt", "time"];
const NAME_KEYS: &[&str] = &["name", "title", "scenario_name", "scenarioName"];

/// Epoch numbers above this are milliseconds; below, seconds.
const EPOCH_MILLIS_THRESHOLD: f64 = 1e11;

/// Typed result of a delta import, ready for scenario creation.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedDelta {
    pub meta: ScenarioMeta,
    pub events: Vec<Event>,
}

/// Normalize `raw` into metadata plus events. `now` fills instants the blob
/// leaves out entirely.
pub fn normalize(raw: &Value, now: DateTime<Utc>) -> Result<NormalizedDelta> {
    let (meta, items) = match raw {
        Value::Array(items) => (ScenarioMeta::named("imported-delta"), items.as_slice()),
        Value::Object(obj) => {
            let items = field(obj, EVENT_LIST_KEYS)
                .ok_or_else(|| import_error(format!("no event list (expected one of {EVENT_LIST_KEYS:?})")))?
                .as_array()
                .ok_or_else(|| import_error("event list is not an array"))?;
            (parse_meta(obj)?, items.as_slice())
        }
        other => {
            return Err(import_error(format!(
                "expected an object or array, got {}",
                type_name(other)
            )));
        }
    };

    let drafts = items
        .iter()
        .enumerate()
        .map(|(i, item)| parse_delta(i, item))
        .collect::<Result<Vec<_>>>()?;

    // Missing instants inherit the previous event's; a leading gap takes the
    // first explicit instant, or `now` if there is none.
    let first_known = drafts.iter().find_map(DeltaDraft::known_instant);
    let mut previous = first_known.unwrap_or(now);
    let events = drafts
        .into_iter()
        .map(|draft| {
            let at = draft.known_instant().unwrap_or(previous);
            previous = at;
            draft.into_event(at)
        })
        .collect();

    Ok(NormalizedDelta { meta, events })
}

// ──────────────────── per-delta parsing ────────────────────

#[derive(Debug)]
enum DraftKind {
    Add {
        id: String,
        source: ReviewSource,
        weight: f64,
        review_ts: Option<DateTime<Utc>>,
    },
    Remove {
        id: String,
    },
    SetWeight {
        id: String,
        weight: f64,
    },
    Extension {
        name: String,
        payload: Value,
    },
}

#[derive(Debug)]
struct DeltaDraft {
    kind: DraftKind,
    at: Option<DateTime<Utc>>,
}

impl DeltaDraft {
    fn known_instant(&self) -> Option<DateTime<Utc>> {
        match (&self.kind, self.at) {
            (_, Some(at)) => Some(at),
            (DraftKind::Add { review_ts, .. }, None) => *review_ts,
            _ => None,
        }
    }

    fn into_event(self, at: DateTime<Utc>) -> Event {
        match self.kind {
            DraftKind::Add {
                id,
                source,
                weight,
                review_ts,
            } => Event::add(Review::new(id, source, weight, review_ts.unwrap_or(at)), at),
            DraftKind::Remove { id } => Event::remove(id, at),
            DraftKind::SetWeight { id, weight } => Event::set_weight(id, weight, at),
            DraftKind::Extension { name, payload } => Event::Extension { name, payload, at },
        }
    }
}

fn parse_delta(index: usize, item: &Value) -> Result<DeltaDraft> {
    let obj = item
        .as_object()
        .ok_or_else(|| import_error(format!("delta {index} is not an object")))?;
    // Review fields may be nested under `review`.
    let nested = obj.get("review").and_then(Value::as_object);
    let lookup = |keys: &[&str]| nested.and_then(|n| field(n, keys)).or_else(|| field(obj, keys));

    let raw_kind = field(obj, KIND_KEYS)
        .and_then(Value::as_str)
        .ok_or_else(|| import_error(format!("delta {index} has no kind")))?;
    let at = field(obj, INSTANT_KEYS)
        .map(|v| parse_instant(v).map_err(|e| import_error(format!("delta {index}: {e}"))))
        .transpose()?;

    let require_id = || {
        lookup(ID_KEYS)
            .and_then(value_as_string)
            .ok_or_else(|| import_error(format!("delta {index} has no review id")))
    };
    let require_weight = || {
        lookup(WEIGHT_KEYS)
            .and_then(value_as_f64)
            .ok_or_else(|| import_error(format!("delta {index} has no numeric weight")))
    };

    let kind = match canonical_kind(raw_kind).as_str() {
        "add_review" | "add" | "review_added" | "create_review" => {
            let source_raw = lookup(SOURCE_KEYS)
                .and_then(Value::as_str)
                .ok_or_else(|| import_error(format!("delta {index} has no review source")))?;
            let source = ReviewSource::parse(source_raw)
                .map_err(|e| import_error(format!("delta {index}: {e}")))?;
            let review_ts = nested
                .and_then(|n| field(n, INSTANT_KEYS))
                .map(|v| parse_instant(v).map_err(|e| import_error(format!("delta {index}: {e}"))))
                .transpose()?;
            DraftKind::Add {
                id: require_id()?,
                source,
                weight: require_weight()?,
                review_ts,
            }
        }
        "remove_review" | "remove" | "delete_review" | "delete" | "review_removed" => {
            DraftKind::Remove { id: require_id()? }
        }
        "set_weight" | "update_weight" | "reweight" | "weight_changed" => DraftKind::SetWeight {
            id: require_id()?,
            weight: require_weight()?,
        },
        "extension" | "custom" => DraftKind::Extension {
            name: field(obj, &["name", "extension"])
                .and_then(Value::as_str)
                .ok_or_else(|| import_error(format!("delta {index} extension has no name")))?
                .to_string(),
            payload: obj.get("payload").cloned().unwrap_or(Value::Null),
        },
        other => {
            return Err(import_error(format!(
                "delta {index} has unsupported kind {other:?}"
            )));
        }
    };
    Ok(DeltaDraft { kind, at })
}

fn parse_meta(obj: &Map<String, Value>) -> Result<ScenarioMeta> {
    let name = field(obj, NAME_KEYS)
        .and_then(Value::as_str)
        .unwrap_or("imported-delta")
        .to_string();
    let tags = match obj.get("tags") {
        Some(Value::Array(items)) => items.iter().filter_map(value_as_string).collect(),
        Some(Value::String(csv)) => csv
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(ToString::to_string)
            .collect(),
        _ => Vec::new(),
    };
    let industry = field(obj, &["industry", "sector"])
        .and_then(Value::as_str)
        .map(ToString::to_string);
    let origin = match field(obj, &["origin"]).and_then(Value::as_str) {
        None => ScenarioOrigin::Manual,
        Some(raw) => match canonical_kind(raw).as_str() {
            "manual" => ScenarioOrigin::Manual,
            "ai_generated" | "ai" | "generated" => ScenarioOrigin::AiGenerated,
            "fuzz" => ScenarioOrigin::Fuzz,
            other => return Err(import_error(format!("unknown origin {other:?}"))),
        },
    };
    let allow_empty = field(obj, &["allow_empty", "allowEmpty"])
        .and_then(Value::as_bool)
        .unwrap_or(false);
    Ok(ScenarioMeta {
        name,
        tags,
        industry,
        origin,
        allow_empty,
    })
}

// ──────────────────── value helpers ────────────────────

fn field<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .find_map(|k| obj.get(*k))
        .filter(|v| !v.is_null())
}

/// `addReview`, `Add-Review`, `ADD_REVIEW` → `add_review`.
fn canonical_kind(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 4);
    let mut prev_lower = false;
    for ch in raw.trim().chars() {
        if ch == '-' || ch == ' ' || ch == '_' {
            if !out.ends_with('_') {
                out.push('_');
            }
            prev_lower = false;
        } else if ch.is_ascii_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
            prev_lower = false;
        } else {
            out.push(ch);
            prev_lower = ch.is_ascii_lowercase() || ch.is_ascii_digit();
        }
    }
    out
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn parse_instant(value: &Value) -> std::result::Result<DateTime<Utc>, String> {
    let from_epoch = |n: f64| -> std::result::Result<DateTime<Utc>, String> {
        if !n.is_finite() || n < 0.0 {
            return Err(format!("invalid epoch instant {n}"));
        }
        let millis = if n > EPOCH_MILLIS_THRESHOLD { n } else { n * 1000.0 };
        Utc.timestamp_millis_opt(millis.round() as i64)
            .single()
            .ok_or_else(|| format!("epoch instant {n} out of range"))
    };
    match value {
        Value::Number(n) => from_epoch(n.as_f64().unwrap_or(f64::NAN)),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(n) = s.parse::<f64>() {
                return from_epoch(n);
            }
            DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| format!("unparseable instant {s:?}: {e}"))
        }
        other => Err(format!("instant must be a string or number, got {}", type_name(other))),
    }
}

const fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn import_error(details: impl Into<String>) -> TsimError {
    TsimError::DeltaImport {
        details: details.into(),
    }
}
