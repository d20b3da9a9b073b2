//! Weather tool backed by deterministic mock readings.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;

use super::{ParamType, Tool, ToolError, ToolParameter};

/// (city, temperature °C, condition, humidity %)
const READINGS: &[(&str, i64, &str, i64)] = &[
    ("seoul", 25, "Partly cloudy", 60),
    ("new york", 18, "Sunny", 45),
    ("london", 15, "Rainy", 80),
    ("tokyo", 28, "Clear", 55),
];

pub struct WeatherTool;

#[async_trait]
impl Tool for WeatherTool {
    fn name(&self) -> &str {
        "weather"
    }

    fn description(&self) -> &str {
        "Get current weather information for a specific city"
    }

    fn parameters(&self) -> Vec<ToolParameter> {
        vec![ToolParameter::required(
            "city",
            ParamType::String,
            "City name to get weather for (e.g., 'Seoul', 'New York')",
        )]
    }

    async fn execute(&self, args: HashMap<String, Value>) -> Result<Value, ToolError> {
        let Some(city) = args.get("city").and_then(Value::as_str) else {
            return Err(ToolError::InvalidArguments("'city' must be a string".into()));
        };

        let key = city.trim().to_lowercase();
        let reading = READINGS.iter().find(|(name, ..)| *name == key);

        Ok(match reading {
            Some((_, temperature, condition, humidity)) => json!({
                "success": true,
                "city": city,
                "temperature": temperature,
                "condition": condition,
                "humidity": humidity,
                "unit": "celsius",
            }),
            None => json!({
                "success": true,
                "city": city,
                "temperature": 20,
                "condition": "Partly cloudy",
                "humidity": 50,
                "unit": "celsius",
                "note": "Mock data - real API integration needed",
            }),
        })
    }
}
