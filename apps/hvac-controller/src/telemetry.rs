use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Namespace for reading identities. Stable across releases, changing it
/// breaks deduplication of redelivered readings.
const READING_NAMESPACE: Uuid = Uuid::from_u128(0x6f2d_4c1e_9b0a_4d3f_8e57_2a61_c0de_5e45);

#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    pub timestamp: String,
    pub temperature: f64,
}

impl SensorReading {
    pub fn identity(&self) -> Uuid {
        let key = format!("{}|{}", self.timestamp, self.temperature);
        Uuid::new_v5(&READING_NAMESPACE, key.as_bytes())
    }
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("event carried no arguments")]
    Empty,
    #[error("malformed sensor payload: {0}")]
    Shape(#[from] serde_json::Error),
    #[error("missing or blank field `{0}`")]
    MissingField(&'static str),
    #[error("temperature `{0}` is not numeric")]
    NotNumeric(String),
}

#[derive(Debug, Deserialize)]
struct SensorPayload {
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    data: Option<RawTemperature>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawTemperature {
    Str(String),
    Num(f64),
}

impl RawTemperature {
    fn to_celsius(&self) -> Result<f64, PayloadError> {
        let value = match self {
            RawTemperature::Str(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| PayloadError::NotNumeric(s.clone()))?,
            RawTemperature::Num(n) => *n,
        };
        if value.is_finite() {
            Ok(value)
        } else {
            Err(PayloadError::NotNumeric(value.to_string()))
        }
    }
}

/// Only the first argument of a `ReceiveSensorData` invocation is read.
pub fn parse_sensor_payload(arguments: &[Value]) -> Result<SensorReading, PayloadError> {
    let first = arguments.first().ok_or(PayloadError::Empty)?;
    let payload = SensorPayload::deserialize(first)?;

    let timestamp = payload
        .date
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(PayloadError::MissingField("date"))?
        .to_string();
    let temperature = payload
        .data
        .as_ref()
        .ok_or(PayloadError::MissingField("data"))?
        .to_celsius()?;

    Ok(SensorReading {
        timestamp,
        temperature,
    })
}
