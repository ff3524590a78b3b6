//! Built-in demonstration tools with deterministic, locally-computed
//! answers. They exercise the discovery and dispatch paths without any
//! external service; outputs are derived from the inputs so repeated calls
//! agree.

use crate::application::dispatch::{ExecutorError, ToolExecutor};
use crate::types::{ProviderRef, ToolDescriptor};
use serde_json::{Value, json};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

/// Descriptors and executors for every built-in tool, ready to be merged
/// into the catalog and registered with the dispatcher. Only `get_weather`
/// is eager; the rest must be discovered.
pub fn builtin_tools() -> Vec<(ToolDescriptor, Arc<dyn ToolExecutor>)> {
    vec![
        (
            descriptor(
                "get_weather",
                "Get the current weather in a given location",
                &[("location", "City and state, e.g. San Francisco, CA")],
                &["weather in Tokyo", "how hot is it in Denver"],
                true,
            ),
            Arc::new(get_weather) as Arc<dyn ToolExecutor>,
        ),
        (
            descriptor(
                "get_forecast",
                "Get a multi-day weather forecast for a location",
                &[
                    ("location", "City and state, e.g. San Francisco, CA"),
                    ("days", "Number of days to forecast"),
                ],
                &["5 day forecast for Seattle"],
                false,
            ),
            Arc::new(get_forecast),
        ),
        (
            descriptor(
                "get_timezone",
                "Get the timezone and UTC offset of a location",
                &[("location", "City name")],
                &["what timezone is Mumbai in"],
                false,
            ),
            Arc::new(get_timezone),
        ),
        (
            descriptor(
                "get_air_quality",
                "Get the current air quality index for a location",
                &[("location", "City name")],
                &["air quality in Beijing"],
                false,
            ),
            Arc::new(get_air_quality),
        ),
        (
            descriptor(
                "get_stock_price",
                "Get the latest price for a stock ticker",
                &[("ticker", "Stock ticker symbol, e.g. AAPL")],
                &["price of NVDA", "how is Apple stock doing"],
                false,
            ),
            Arc::new(get_stock_price),
        ),
        (
            descriptor(
                "convert_currency",
                "Convert an amount from one currency to another",
                &[
                    ("amount", "Amount to convert"),
                    ("from", "Source currency code, e.g. USD"),
                    ("to", "Target currency code, e.g. EUR"),
                ],
                &["convert 100 USD to JPY"],
                false,
            ),
            Arc::new(convert_currency),
        ),
        (
            descriptor(
                "calculate_compound_interest",
                "Calculate compound interest on a principal over time",
                &[
                    ("principal", "Initial amount"),
                    ("rate", "Annual interest rate as a decimal, e.g. 0.05"),
                    ("years", "Number of years"),
                    ("compounds_per_year", "Compounding periods per year"),
                ],
                &["grow 1000 at 5% for 10 years"],
                false,
            ),
            Arc::new(calculate_compound_interest),
        ),
        (
            descriptor(
                "get_market_news",
                "Get recent market news headlines for a topic",
                &[("topic", "Market topic or company name")],
                &["news about semiconductors"],
                false,
            ),
            Arc::new(get_market_news),
        ),
    ]
}

fn descriptor(
    id: &str,
    description: &str,
    params: &[(&str, &str)],
    examples: &[&str],
    eager: bool,
) -> ToolDescriptor {
    let mut properties = serde_json::Map::new();
    for (name, help) in params {
        properties.insert(
            (*name).to_string(),
            json!({ "type": "string", "description": help }),
        );
    }
    let required: Vec<&str> = params.iter().map(|(name, _)| *name).collect();
    ToolDescriptor {
        id: id.to_string(),
        description: description.to_string(),
        input_schema: json!({
            "type": "object",
            "properties": Value::Object(properties),
            "required": required,
        }),
        examples: examples.iter().map(|e| json!(e)).collect(),
        eager,
        provider: ProviderRef::Local,
    }
}

fn str_arg(arguments: &Value, key: &str) -> Result<String, ExecutorError> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ExecutorError::new(format!("missing required string argument '{key}'")))
}

fn num_arg(arguments: &Value, key: &str) -> Result<f64, ExecutorError> {
    arguments
        .get(key)
        .and_then(Value::as_f64)
        .ok_or_else(|| ExecutorError::new(format!("missing required numeric argument '{key}'")))
}

/// Stable per-input seed so every answer is a pure function of the call.
fn seed(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.to_lowercase().hash(&mut hasher);
    hasher.finish()
}

fn get_weather(arguments: &Value) -> Result<Value, ExecutorError> {
    let location = str_arg(arguments, "location")?;
    let s = seed(&location);
    let conditions = ["sunny", "cloudy", "rainy", "windy", "foggy"];
    Ok(json!({
        "location": location,
        "temperature_c": (s % 35) as i64 - 5,
        "condition": conditions[(s / 7 % conditions.len() as u64) as usize],
        "humidity_pct": 30 + (s / 13 % 60),
    }))
}

fn get_forecast(arguments: &Value) -> Result<Value, ExecutorError> {
    let location = str_arg(arguments, "location")?;
    let days = num_arg(arguments, "days")?.clamp(1.0, 14.0) as u64;
    let s = seed(&location);
    let daily: Vec<Value> = (0..days)
        .map(|day| {
            let d = s.wrapping_add(day.wrapping_mul(31));
            json!({
                "day": day + 1,
                "high_c": (d % 30) as i64,
                "low_c": (d % 30) as i64 - 8,
            })
        })
        .collect();
    Ok(json!({ "location": location, "daily": daily }))
}

fn get_timezone(arguments: &Value) -> Result<Value, ExecutorError> {
    let location = str_arg(arguments, "location")?;
    let offset = (seed(&location) % 27) as i64 - 12;
    Ok(json!({
        "location": location,
        "utc_offset_hours": offset,
        "timezone": format!("UTC{offset:+}"),
    }))
}

fn get_air_quality(arguments: &Value) -> Result<Value, ExecutorError> {
    let location = str_arg(arguments, "location")?;
    let aqi = seed(&location) % 300;
    let category = match aqi {
        0..=50 => "good",
        51..=100 => "moderate",
        101..=150 => "unhealthy for sensitive groups",
        151..=200 => "unhealthy",
        _ => "very unhealthy",
    };
    Ok(json!({ "location": location, "aqi": aqi, "category": category }))
}

fn get_stock_price(arguments: &Value) -> Result<Value, ExecutorError> {
    let ticker = str_arg(arguments, "ticker")?.to_uppercase();
    let s = seed(&ticker);
    let price = 10.0 + (s % 99_000) as f64 / 100.0;
    Ok(json!({
        "ticker": ticker,
        "price": (price * 100.0).round() / 100.0,
        "currency": "USD",
    }))
}

fn convert_currency(arguments: &Value) -> Result<Value, ExecutorError> {
    let amount = num_arg(arguments, "amount")?;
    let from = str_arg(arguments, "from")?.to_uppercase();
    let to = str_arg(arguments, "to")?.to_uppercase();
    // Synthetic but consistent: the rate depends only on the currency pair.
    let rate = if from == to {
        1.0
    } else {
        0.5 + (seed(&format!("{from}->{to}")) % 200) as f64 / 100.0
    };
    Ok(json!({
        "amount": amount,
        "from": from,
        "to": to,
        "rate": rate,
        "converted": (amount * rate * 100.0).round() / 100.0,
    }))
}

fn calculate_compound_interest(arguments: &Value) -> Result<Value, ExecutorError> {
    let principal = num_arg(arguments, "principal")?;
    let rate = num_arg(arguments, "rate")?;
    let years = num_arg(arguments, "years")?;
    let n = num_arg(arguments, "compounds_per_year").unwrap_or(1.0).max(1.0);
    let final_amount = principal * (1.0 + rate / n).powf(n * years);
    Ok(json!({
        "principal": principal,
        "rate": rate,
        "years": years,
        "compounds_per_year": n,
        "final_amount": (final_amount * 100.0).round() / 100.0,
        "interest_earned": ((final_amount - principal) * 100.0).round() / 100.0,
    }))
}

fn get_market_news(arguments: &Value) -> Result<Value, ExecutorError> {
    let topic = str_arg(arguments, "topic")?;
    let s = seed(&topic);
    let moods = ["rallies", "slides", "holds steady", "surges", "dips"];
    let headlines: Vec<String> = (0..3u64)
        .map(|i| {
            let mood = moods[((s / (i + 1)) % moods.len() as u64) as usize];
            format!("{topic} {mood} as analysts revise outlook")
        })
        .collect();
    Ok(json!({ "topic": topic, "headlines": headlines }))
}
