//! Realtime row events and their defensive decoding.
//!
//! The channel delivers rows as loose JSON: ids may arrive as strings,
//! integers or boolean-coded values, timestamps as RFC 3339 strings or
//! epoch numbers, flags as booleans, numbers or strings. Decoding never
//! panics; a payload that cannot be read is reported as
//! [`SyncError::Decode`] and the caller skips the event.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::stream::BoxStream;
use serde_json::Value;

use crate::error::SyncError;
use crate::model::{GenerationMetadata, ItemStatus, MediaItem, MediaKind};

/// One change delivered by the realtime channel.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    /// New row, as sent by the channel.
    Insert(Value),
    /// Old row's id field, in whatever representation the channel used.
    Delete(Value),
}

/// Per-owner push subscription. Delivery is at-least-once at best; the
/// engine never relies on seeing every event.
#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    async fn subscribe(&self, owner: &str) -> Result<BoxStream<'static, RealtimeEvent>>;
}

/// Decode a loosely-typed id: string, then integer, then boolean.
pub fn decode_id(raw: &Value) -> Result<String, SyncError> {
    // Some channels wrap the old row instead of sending the bare id.
    if let Value::Object(map) = raw {
        return match map.get("id") {
            Some(inner) => decode_id(inner),
            None => Err(SyncError::Decode(format!("object without id field: {raw}"))),
        };
    }
    decode_id_as_string(raw)
        .or_else(|| decode_id_as_integer(raw))
        .or_else(|| decode_id_as_bool(raw))
        .ok_or_else(|| SyncError::Decode(format!("unrecognised id representation: {raw}")))
}

fn decode_id_as_string(raw: &Value) -> Option<String> {
    raw.as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn decode_id_as_integer(raw: &Value) -> Option<String> {
    if let Some(n) = raw.as_i64() {
        return Some(n.to_string());
    }
    if let Some(n) = raw.as_u64() {
        return Some(n.to_string());
    }
    // Integral floats show up from JSON encoders that only know doubles.
    raw.as_f64()
        .filter(|f| f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e15)
        .map(|f| (f as i64).to_string())
}

fn decode_id_as_bool(raw: &Value) -> Option<String> {
    raw.as_bool().map(|b| if b { "1" } else { "0" }.to_string())
}

fn decode_flag(raw: Option<&Value>) -> bool {
    match raw {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => matches!(s.trim().to_lowercase().as_str(), "true" | "t" | "1" | "yes"),
        _ => false,
    }
}

fn decode_timestamp(raw: &Value) -> Option<DateTime<Utc>> {
    match raw {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                // Postgres style "2024-01-02 03:04:05.678+00"
                DateTime::parse_from_str(s.trim(), "%Y-%m-%d %H:%M:%S%.f%#z")
                    .map(|dt| dt.with_timezone(&Utc))
                    .ok()
            }),
        Value::Number(n) => {
            let n = n.as_i64()?;
            // Heuristic: values past year 2286 in seconds are milliseconds.
            if n.abs() >= 10_000_000_000 {
                Utc.timestamp_millis_opt(n).single()
            } else {
                Utc.timestamp_opt(n, 0).single()
            }
        }
        _ => None,
    }
}

fn decode_string(raw: Option<&Value>) -> Option<String> {
    match raw? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn decode_number(raw: Option<&Value>) -> Option<f64> {
    match raw? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn first_of<'a>(row: &'a serde_json::Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .find_map(|k| row.get(*k).filter(|v| !v.is_null()))
}

/// Decode a full row. `id`, `owner` and `created_at` are required; every
/// other field falls back to a default when missing or malformed.
pub fn decode_row(raw: &Value) -> Result<MediaItem, SyncError> {
    let row = raw
        .as_object()
        .ok_or_else(|| SyncError::Decode(format!("row is not an object: {raw}")))?;

    let id = first_of(row, &["id"])
        .ok_or_else(|| SyncError::Decode("row without id".into()))
        .and_then(decode_id)?;
    let owner_id = first_of(row, &["owner_id", "user_id"])
        .and_then(|v| decode_id(v).ok())
        .ok_or_else(|| SyncError::Decode(format!("row {id} without owner")))?;
    let created_at = first_of(row, &["created_at"])
        .and_then(decode_timestamp)
        .ok_or_else(|| SyncError::Decode(format!("row {id} without readable created_at")))?;

    let kind = decode_string(first_of(row, &["kind", "media_type", "type"]))
        .and_then(|k| k.parse::<MediaKind>().ok())
        .unwrap_or(MediaKind::Image);
    let status = decode_string(first_of(row, &["status"]))
        .and_then(|s| s.parse::<ItemStatus>().ok())
        .unwrap_or(ItemStatus::Success);

    let metadata = GenerationMetadata {
        prompt: decode_string(first_of(row, &["prompt"])),
        aspect_ratio: decode_string(first_of(row, &["aspect_ratio"])),
        cost: decode_number(first_of(row, &["cost", "credits"])),
        duration_seconds: decode_number(first_of(row, &["duration", "duration_seconds"])),
        resolution: decode_string(first_of(row, &["resolution"])),
    };
    let metadata = (metadata != GenerationMetadata::default()).then_some(metadata);

    Ok(MediaItem {
        id,
        owner_id,
        created_at,
        kind,
        model_name: decode_string(first_of(row, &["model_name", "model"])),
        favorite: decode_flag(first_of(row, &["favorite", "is_favorite"])),
        status,
        url: decode_string(first_of(row, &["url", "media_url"])).unwrap_or_default(),
        thumbnail_url: decode_string(first_of(row, &["thumbnail_url", "thumbnail"])),
        metadata,
    })
}
