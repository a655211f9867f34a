use super::DomainError;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 2000-01-01T00:00:00Z; older fixes are treated as bogus device clocks.
pub const EARLIEST_PLAUSIBLE_TST: i64 = 946_684_800;

/// A position report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    pub lat: f64,
    pub lon: f64,
    pub tst: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acc: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vel: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cog: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batt: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bs: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conn: Option<String>,
    /// Trigger of the report (`p` ping, `u` manual, `t` timer, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
    /// Tracker id shown on maps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tid: Option<String>,
}

/// Region enter/leave event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub event: String,
    pub tst: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acc: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wtst: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DomainMessage {
    Location(LocationFix),
    Lwt(Value),
    Transition(Transition),
    Waypoints(Value),
    /// Valid JSON of a type this handler does not act on.
    Ignored(String),
}

/// Bounds applied to device-supplied timestamps.
#[derive(Debug, Clone, Copy)]
pub struct Plausibility {
    pub now: DateTime<Utc>,
    pub max_future_skew: Duration,
}

pub fn parse_payload(bytes: &[u8], bounds: Plausibility) -> Result<DomainMessage, DomainError> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| DomainError::Malformed(format!("payload is not JSON: {e}")))?;
    let Value::Object(obj) = value else {
        return Err(DomainError::Malformed("payload is not a JSON object".into()));
    };
    let kind = match obj.get("_type") {
        Some(Value::String(kind)) => kind.clone(),
        Some(_) => return Err(DomainError::Malformed("_type is not a string".into())),
        None if obj.contains_key("lat") && obj.contains_key("lon") => "location".to_string(),
        None => return Err(DomainError::Malformed("payload has no _type".into())),
    };
    match kind.as_str() {
        "location" => parse_location(&obj, bounds).map(DomainMessage::Location),
        "lwt" => Ok(DomainMessage::Lwt(Value::Object(obj))),
        "transition" => parse_transition(&obj, bounds).map(DomainMessage::Transition),
        "waypoint" | "waypoints" => Ok(DomainMessage::Waypoints(Value::Object(obj))),
        _ => Ok(DomainMessage::Ignored(kind)),
    }
}

fn parse_location(obj: &Map<String, Value>, bounds: Plausibility) -> Result<LocationFix, DomainError> {
    let lat = required_f64(obj, "lat")?;
    let lon = required_f64(obj, "lon")?;
    if !(-90.0..=90.0).contains(&lat) {
        return Err(DomainError::Validation(format!("lat {lat} outside [-90, 90]")));
    }
    if !(-180.0..=180.0).contains(&lon) {
        return Err(DomainError::Validation(format!("lon {lon} outside [-180, 180]")));
    }
    let tst = match obj.get("tst") {
        None | Some(Value::Null) => bounds.now,
        Some(_) => timestamp(obj, "tst", bounds)?,
    };
    Ok(LocationFix {
        lat,
        lon,
        tst,
        acc: optional_f64(obj, "acc")?,
        alt: optional_f64(obj, "alt")?,
        vel: optional_f64(obj, "vel")?,
        cog: optional_f64(obj, "cog")?,
        batt: optional_i64(obj, "batt")?,
        bs: optional_i64(obj, "bs")?,
        conn: optional_string(obj, "conn")?,
        t: optional_string(obj, "t")?,
        tid: optional_string(obj, "tid")?,
    })
}

fn parse_transition(
    obj: &Map<String, Value>,
    bounds: Plausibility,
) -> Result<Transition, DomainError> {
    let event = optional_string(obj, "event")?
        .ok_or_else(|| DomainError::Validation("transition without event".into()))?;
    if !obj.contains_key("tst") {
        return Err(DomainError::Validation("transition without tst".into()));
    }
    let wtst = match obj.get("wtst") {
        None | Some(Value::Null) => None,
        Some(_) => Some(timestamp(obj, "wtst", bounds)?),
    };
    Ok(Transition {
        event,
        tst: timestamp(obj, "tst", bounds)?,
        desc: optional_string(obj, "desc")?,
        lat: optional_f64(obj, "lat")?,
        lon: optional_f64(obj, "lon")?,
        acc: optional_f64(obj, "acc")?,
        t: optional_string(obj, "t")?,
        rid: optional_string(obj, "rid")?,
        wtst,
    })
}

fn timestamp(
    obj: &Map<String, Value>,
    key: &str,
    bounds: Plausibility,
) -> Result<DateTime<Utc>, DomainError> {
    let secs = optional_i64(obj, key)?
        .ok_or_else(|| DomainError::Validation(format!("{key} is missing")))?;
    let latest = bounds.now + bounds.max_future_skew;
    let at = Utc
        .timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| DomainError::Validation(format!("{key} {secs} is not a timestamp")))?;
    if secs < EARLIEST_PLAUSIBLE_TST || at > latest {
        return Err(DomainError::Validation(format!(
            "{key} {secs} outside plausible range"
        )));
    }
    Ok(at)
}

fn required_f64(obj: &Map<String, Value>, key: &str) -> Result<f64, DomainError> {
    optional_f64(obj, key)?.ok_or_else(|| DomainError::Validation(format!("{key} is missing")))
}

fn optional_f64(obj: &Map<String, Value>, key: &str) -> Result<Option<f64>, DomainError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_f64()
            .filter(|v| v.is_finite())
            .map(Some)
            .ok_or_else(|| DomainError::Validation(format!("{key} is not finite"))),
        // Some clients send numbers as strings.
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(Some)
            .ok_or_else(|| DomainError::Validation(format!("{key} is not numeric"))),
        Some(_) => Err(DomainError::Validation(format!("{key} is not numeric"))),
    }
}

fn optional_i64(obj: &Map<String, Value>, key: &str) -> Result<Option<i64>, DomainError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|v| v.is_finite()).map(|v| v.trunc() as i64))
            .map(Some)
            .ok_or_else(|| DomainError::Validation(format!("{key} is not an integer"))),
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| DomainError::Validation(format!("{key} is not an integer"))),
        Some(_) => Err(DomainError::Validation(format!("{key} is not an integer"))),
    }
}

fn optional_string(obj: &Map<String, Value>, key: &str) -> Result<Option<String>, DomainError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(DomainError::Validation(format!("{key} is not a string"))),
    }
}
