//! Template model: a bounded random number, with an echo fallback for
//! anything that is not a usable `start`/`stop` pair.

use rand::Rng;
use serde_json::{json, Map, Value};

const TEMPLATE_PREDICTION: &str = "example_result";
const EMPTY_MESSAGE: &str = "Empty data received - replace with your actual model logic";
const TEMPLATE_MESSAGE: &str = "This is a template - replace with your actual model logic";

/// Run the template model on loosely-typed input. Never fails.
pub fn predict(input: &Value) -> Value {
    if let Some((start, stop)) = bounds(input) {
        return json!({ "a_random_number": random_number(start, stop) });
    }

    if is_empty(input) {
        return json!({
            "prediction": TEMPLATE_PREDICTION,
            "input_received": {},
            "message": EMPTY_MESSAGE,
        });
    }

    let echoed = match input {
        Value::Object(_) | Value::Array(_) => input.clone(),
        Value::String(s) => Value::String(s.clone()),
        other => Value::String(other.to_string()),
    };

    json!({
        "prediction": TEMPLATE_PREDICTION,
        "input_received": echoed,
        "message": TEMPLATE_MESSAGE,
    })
}

/// Convenience for callers that already hold the two bounds
pub fn predict_range(start: f64, stop: f64) -> Value {
    let mut input = Map::new();
    input.insert("start".to_string(), json!(start));
    input.insert("stop".to_string(), json!(stop));
    predict(&Value::Object(input))
}

/// Uniform sample in `[start, stop]`; requires `start <= stop` and a finite width
fn random_number(start: f64, stop: f64) -> f64 {
    if start == stop {
        return start;
    }
    let unit: f64 = rand::thread_rng().gen();
    (start + (stop - start) * unit).clamp(start, stop)
}

fn bounds(input: &Value) -> Option<(f64, f64)> {
    let object = input.as_object()?;
    let start = coerce_f64(object.get("start")?)?;
    let stop = coerce_f64(object.get("stop")?)?;
    // The sampler needs a finite width as well as finite ends
    let usable = start.is_finite() && stop.is_finite() && start <= stop && (stop - start).is_finite();
    usable.then_some((start, stop))
}

fn coerce_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn is_empty(input: &Value) -> bool {
    match input {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}
