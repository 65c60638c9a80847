//! Command handlers.
//!
//! Each handler takes the plugin, the configuration snapshot for this
//! command and, where needed, the call's parameters, and always produces a
//! response. Errors never escape a handler.

pub mod comfyui;
pub mod containers;
pub mod generate;
pub mod health;
pub mod invokeai;
pub mod lifecycle;

use serde_json::{Map, Value};

/// Step count used when the call does not give one.
pub const DEFAULT_STEPS: u32 = 30;
pub const MIN_STEPS: u32 = 20;
pub const MAX_STEPS: u32 = 50;

/// The `prompt` parameter, or `""` when absent or not a string.
pub fn prompt_param(params: &Map<String, Value>) -> &str {
    params.get("prompt").and_then(Value::as_str).unwrap_or_default()
}

/// The `steps` parameter as an integer in `[MIN_STEPS, MAX_STEPS]`.
///
/// Integers and integer strings are accepted; the error is the message
/// returned to the host.
pub fn steps_param(params: &Map<String, Value>) -> Result<u32, &'static str> {
    let steps = match params.get("steps") {
        None => return Ok(DEFAULT_STEPS),
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        Some(_) => None,
    }
    .ok_or("Steps parameter must be an integer")?;

    u32::try_from(steps)
        .ok()
        .filter(|s| (MIN_STEPS..=MAX_STEPS).contains(s))
        .ok_or("Steps parameter must be between 20 and 50")
}

/// A boolean flag; strings `true`, `1`, `yes` and `on` count as true.
pub fn flag_param(params: &Map<String, Value>, key: &str, default: bool) -> bool {
    match params.get(key) {
        None => default,
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => matches!(s.to_lowercase().as_str(), "true" | "1" | "yes" | "on"),
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(_) => false,
    }
}
