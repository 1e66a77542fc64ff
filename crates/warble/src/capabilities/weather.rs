use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use super::{Capability, CapabilityMetadata};
use crate::errors::{AgentError, AgentResult};
use crate::models::content::Content;
use crate::models::tool::Tool;

pub const ID: &str = "weather";
pub const DEFAULT_HOST: &str = "https://api.open-meteo.com";

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    current: CurrentConditions,
}

#[derive(Debug, Deserialize)]
struct CurrentConditions {
    temperature_2m: f64,
    wind_speed_10m: f64,
    weather_code: u32,
}

/// Current conditions from an Open-Meteo compatible forecast API
pub struct WeatherCapability {
    metadata: CapabilityMetadata,
    tool: Tool,
    client: Client,
    host: String,
}

impl WeatherCapability {
    pub fn new(host: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            metadata: CapabilityMetadata::new(ID, "Weather")
                .with_description("Looks up current weather conditions")
                .with_category("information")
                .with_icon("cloud-sun"),
            tool: Tool::new(
                "get_weather",
                "Get the current weather at a location. Provide the coordinates of the place the user asks about.",
                json!({
                    "type": "object",
                    "required": ["latitude", "longitude"],
                    "properties": {
                        "latitude": {"type": "number"},
                        "longitude": {"type": "number"},
                        "location": {
                            "type": "string",
                            "description": "Human readable name of the place, used in the answer"
                        }
                    }
                }),
            ),
            client,
            host: host.trim_end_matches('/').to_string(),
        })
    }

    fn coordinate(arguments: &Value, key: &str, limit: f64) -> AgentResult<f64> {
        let value = arguments
            .get(key)
            .and_then(Value::as_f64)
            .ok_or_else(|| AgentError::InvalidParameters(format!("{} parameter required", key)))?;
        if value.abs() > limit {
            return Err(AgentError::InvalidParameters(format!(
                "{} must be within ±{}",
                key, limit
            )));
        }
        Ok(value)
    }
}

/// WMO weather interpretation codes
fn describe_code(code: u32) -> &'static str {
    match code {
        0 => "clear sky",
        1 | 2 => "partly cloudy",
        3 => "overcast",
        45 | 48 => "fog",
        51..=57 => "drizzle",
        61..=67 => "rain",
        71..=77 => "snow",
        80..=82 => "rain showers",
        85 | 86 => "snow showers",
        95..=99 => "thunderstorm",
        _ => "unknown conditions",
    }
}

#[async_trait]
impl Capability for WeatherCapability {
    fn metadata(&self) -> &CapabilityMetadata {
        &self.metadata
    }

    fn descriptor(&self) -> &Tool {
        &self.tool
    }

    async fn execute(&self, arguments: Value) -> AgentResult<Vec<Content>> {
        let latitude = Self::coordinate(&arguments, "latitude", 90.0)?;
        let longitude = Self::coordinate(&arguments, "longitude", 180.0)?;
        let location = arguments
            .get("location")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| format!("{:.2}, {:.2}", latitude, longitude));

        let response = self
            .client
            .get(format!("{}/v1/forecast", self.host))
            .query(&[
                ("latitude", latitude.to_string()),
                ("longitude", longitude.to_string()),
                (
                    "current",
                    "temperature_2m,wind_speed_10m,weather_code".to_string(),
                ),
            ])
            .send()
            .await
            .map_err(|e| AgentError::ExecutionError(format!("weather service unreachable: {}", e)))?;

        if !response.status().is_success() {
            return Err(AgentError::ExecutionError(format!(
                "weather service returned {}",
                response.status()
            )));
        }

        let forecast: ForecastResponse = response.json().await.map_err(|e| {
            AgentError::ExecutionError(format!("unexpected weather response: {}", e))
        })?;
        let current = forecast.current;

        Ok(vec![Content::text(format!(
            "Current weather in {}: {}, {:.1}°C, wind {:.1} km/h",
            location,
            describe_code(current.weather_code),
            current.temperature_2m,
            current.wind_speed_10m
        ))])
    }
}
