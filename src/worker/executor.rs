//! Task execution on the worker thread.
//!
//! Pure synchronous CPU-bound work, one function per task kind, dispatched by
//! an exhaustive match. Errors are returned as strings and travel back to the
//! coordinator unchanged in an `error` reply.

use serde_json::{Value, json};

use crate::task::TaskKind;

/// Hard caps so a malformed payload cannot pin a worker forever.
const MAX_ITERATIONS: u64 = 100_000_000;
const MAX_GENERATED: usize = 10_000_000;
const MAX_SPIN_MS: u64 = 10_000;

/// Execute one task. Returns the kind-specific result value, or an error
/// string for malformed payloads.
pub fn execute(kind: TaskKind, payload: &Value) -> Result<Value, String> {
    match kind {
        TaskKind::Computation => computation(payload),
        TaskKind::Sorting => sorting(payload),
        TaskKind::Search => search(payload),
        TaskKind::Processing => processing(payload),
        TaskKind::Generic => generic(payload),
    }
}

/// Iterative floating-point accumulation: `{"iterations": n}`.
fn computation(payload: &Value) -> Result<Value, String> {
    let iterations = payload
        .get("iterations")
        .and_then(Value::as_u64)
        .ok_or("computation payload requires numeric 'iterations'")?;
    if iterations > MAX_ITERATIONS {
        return Err(format!("iterations exceeds maximum {MAX_ITERATIONS}"));
    }

    let mut accumulator = 0.0f64;
    for i in 0..iterations {
        accumulator += (i as f64).sqrt().sin();
    }
    Ok(json!({ "iterations": iterations, "accumulator": accumulator }))
}

/// Sort a provided array (`{"values": [..]}`) or a generated descending run
/// (`{"count": n}`); report length and a checksum.
fn sorting(payload: &Value) -> Result<Value, String> {
    let mut values: Vec<f64> = if let Some(raw) = payload.get("values") {
        raw.as_array()
            .ok_or("'values' must be an array")?
            .iter()
            .map(|v| v.as_f64().ok_or("'values' must contain only numbers"))
            .collect::<Result<_, _>>()?
    } else if let Some(count) = payload.get("count").and_then(Value::as_u64) {
        let count = count as usize;
        if count > MAX_GENERATED {
            return Err(format!("count exceeds maximum {MAX_GENERATED}"));
        }
        (0..count).rev().map(|n| n as f64).collect()
    } else {
        return Err("sorting payload requires 'values' or 'count'".to_string());
    };

    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let checksum: f64 = values.iter().sum();
    Ok(json!({ "sorted": values.len(), "checksum": checksum }))
}

/// Linear scan for `target` in a provided `haystack` array or a generated
/// `0..count` run; report the first matching index.
fn search(payload: &Value) -> Result<Value, String> {
    let target = payload
        .get("target")
        .and_then(Value::as_i64)
        .ok_or("search payload requires numeric 'target'")?;

    let haystack: Vec<i64> = if let Some(raw) = payload.get("haystack") {
        raw.as_array()
            .ok_or("'haystack' must be an array")?
            .iter()
            .map(|v| v.as_i64().ok_or("'haystack' must contain only integers"))
            .collect::<Result<_, _>>()?
    } else if let Some(count) = payload.get("count").and_then(Value::as_u64) {
        let count = count as usize;
        if count > MAX_GENERATED {
            return Err(format!("count exceeds maximum {MAX_GENERATED}"));
        }
        (0..count as i64).collect()
    } else {
        return Err("search payload requires 'haystack' or 'count'".to_string());
    };

    let index = haystack.iter().position(|&value| value == target);
    Ok(json!({ "scanned": haystack.len(), "found_at": index }))
}

/// Per-word transform plus frequency count over `{"text": "..."}`.
fn processing(payload: &Value) -> Result<Value, String> {
    let text = payload
        .get("text")
        .and_then(Value::as_str)
        .ok_or("processing payload requires string 'text'")?;

    let mut frequencies = std::collections::BTreeMap::new();
    let mut transformed = Vec::new();
    for word in text.split_whitespace() {
        let normalized: String = word
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        if normalized.is_empty() {
            continue;
        }
        *frequencies.entry(normalized.clone()).or_insert(0u64) += 1;
        transformed.push(normalized);
    }

    Ok(json!({
        "words": transformed.len(),
        "unique": frequencies.len(),
    }))
}

/// Bounded busy-wait echo: `{"spin_ms": n}` (optional). The `panic` key is a
/// fault-injection hook — it kills the worker thread after the spin,
/// exercising the crash recovery path end to end (combine with `spin_ms` to
/// crash at a chosen point in a task's lifetime).
fn generic(payload: &Value) -> Result<Value, String> {
    let spin_ms = payload
        .get("spin_ms")
        .and_then(Value::as_u64)
        .unwrap_or(0)
        .min(MAX_SPIN_MS);

    let deadline = std::time::Instant::now() + std::time::Duration::from_millis(spin_ms);
    let mut spins = 0u64;
    while std::time::Instant::now() < deadline {
        spins = spins.wrapping_add(1);
        std::hint::spin_loop();
    }

    if payload.get("panic").and_then(Value::as_bool) == Some(true) {
        panic!("fault injection: panic requested by task payload");
    }

    Ok(json!({ "echo": payload.clone(), "spins": spins }))
}
