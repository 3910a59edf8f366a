//! In-process JSON template interpreter.
//!
//! The transform source is a JSON document. String leaves of the form
//! `"$.path.to.field"` are replaced by the value found at that path; every
//! other value is copied as-is. `"$"` alone yields the whole context and a
//! leading `"$$"` escapes a literal dollar sign. Paths resolve against the
//! trace (`data`, `metadata`, `traceId`, `spanId`, `parentSpanId`, `orgId`,
//! `createdAt`) and against `destination` (`id`, `name`, `providerType`).
//! Numeric segments index into arrays. Missing paths resolve to `null`.
//!
//! Rendering charges every emitted value against a byte budget before it is
//! copied, so output can never grow past the ceiling. A render whose caller
//! stopped waiting sees its cancel flag and stops at the next node.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use serde_json::{Map, Value};

use super::{TransformInput, TransformSandbox};
use crate::error::{DeliveryError, Result};

/// Default nesting ceiling for templates and rendered output.
pub const DEFAULT_MAX_DEPTH: usize = 32;

/// Default ceiling on the serialized size of the rendered payload.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Template interpreter with depth and output-size ceilings.
///
/// Rendering has no I/O and runs on the blocking pool.
#[derive(Debug, Clone)]
pub struct TemplateSandbox {
    max_depth: usize,
    max_output_bytes: usize,
}

impl Default for TemplateSandbox {
    fn default() -> Self {
        Self { max_depth: DEFAULT_MAX_DEPTH, max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES }
    }
}

/// Output bytes left for one render, plus its cancel flag.
struct Budget<'a> {
    remaining: usize,
    limit: usize,
    cancelled: &'a AtomicBool,
}

impl Budget<'_> {
    fn charge(&mut self, bytes: usize) -> Result<()> {
        if self.cancelled.load(Ordering::Relaxed) {
            return Err(DeliveryError::transform("template render cancelled"));
        }
        self.remaining = self.remaining.checked_sub(bytes).ok_or_else(|| {
            DeliveryError::transform(format!(
                "rendered payload exceeds {} bytes",
                self.limit
            ))
        })?;
        Ok(())
    }

    /// Charges the serialized size of `value` without copying it.
    fn charge_value(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::Null => self.charge(4),
            Value::Bool(_) => self.charge(5),
            Value::Number(n) => self.charge(n.to_string().len()),
            Value::String(s) => self.charge(s.len() + 2),
            Value::Array(items) => {
                self.charge(items.len() + 2)?;
                items.iter().try_for_each(|item| self.charge_value(item))
            },
            Value::Object(fields) => {
                self.charge(2)?;
                fields.iter().try_for_each(|(key, item)| {
                    self.charge(key.len() + 4)?;
                    self.charge_value(item)
                })
            },
        }
    }
}

/// Sets the cancel flag when dropped.
///
/// Held across the blocking render, so a caller that times out and drops
/// the future also stops the render thread.
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

impl TemplateSandbox {
    /// Creates a sandbox with custom ceilings.
    pub fn new(max_depth: usize, max_output_bytes: usize) -> Self {
        Self { max_depth, max_output_bytes }
    }

    /// Renders a parsed template against a context value.
    fn render(
        &self,
        template: &Value,
        context: &Value,
        depth: usize,
        budget: &mut Budget<'_>,
    ) -> Result<Value> {
        if depth > self.max_depth {
            return Err(DeliveryError::transform(format!(
                "template nesting exceeds {} levels",
                self.max_depth
            )));
        }

        match template {
            Value::String(s) => resolve_string(s, context, budget),
            Value::Array(items) => {
                budget.charge(items.len() + 2)?;
                items
                    .iter()
                    .map(|item| self.render(item, context, depth + 1, budget))
                    .collect::<Result<Vec<_>>>()
                    .map(Value::Array)
            },
            Value::Object(fields) => {
                budget.charge(2)?;
                let mut rendered = Map::with_capacity(fields.len());
                for (key, value) in fields {
                    budget.charge(key.len() + 4)?;
                    rendered.insert(key.clone(), self.render(value, context, depth + 1, budget)?);
                }
                Ok(Value::Object(rendered))
            },
            other => {
                budget.charge_value(other)?;
                Ok(other.clone())
            },
        }
    }

    fn run(&self, source: &str, context: &Value, cancelled: &AtomicBool) -> Result<Value> {
        let template: Value = serde_json::from_str(source)
            .map_err(|e| DeliveryError::transform(format!("template is not valid JSON: {e}")))?;

        let mut budget =
            Budget { remaining: self.max_output_bytes, limit: self.max_output_bytes, cancelled };
        let rendered = self.render(&template, context, 0, &mut budget)?;

        // escapes are not charged, so the exact size is checked once more
        let size = serde_json::to_vec(&rendered)
            .map_err(|e| {
                DeliveryError::transform(format!("rendered payload unserializable: {e}"))
            })?
            .len();
        if size > self.max_output_bytes {
            return Err(DeliveryError::transform(format!(
                "rendered payload exceeds {} bytes",
                self.max_output_bytes
            )));
        }

        Ok(rendered)
    }
}

fn resolve_string(s: &str, context: &Value, budget: &mut Budget<'_>) -> Result<Value> {
    if let Some(literal) = s.strip_prefix("$$") {
        budget.charge(literal.len() + 3)?;
        return Ok(Value::String(format!("${literal}")));
    }
    let found = if s == "$" {
        Some(context)
    } else if let Some(path) = s.strip_prefix("$.") {
        lookup(context, path)
    } else {
        budget.charge(s.len() + 2)?;
        return Ok(Value::String(s.to_string()));
    };

    match found {
        Some(value) => {
            budget.charge_value(value)?;
            Ok(value.clone())
        },
        None => {
            budget.charge(4)?;
            Ok(Value::Null)
        },
    }
}

fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(root, |current, segment| match current {
        Value::Object(fields) => fields.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn context_for(input: &TransformInput) -> Result<Value> {
    let mut context = serde_json::to_value(&input.trace)
        .map_err(|e| DeliveryError::transform(format!("unserializable trace: {e}")))?;
    let destination = serde_json::to_value(&input.destination)
        .map_err(|e| DeliveryError::transform(format!("unserializable destination: {e}")))?;
    if let Value::Object(fields) = &mut context {
        fields.insert("destination".to_string(), destination);
    }
    Ok(context)
}

#[async_trait::async_trait]
impl TransformSandbox for TemplateSandbox {
    async fn execute(&self, source: &str, input: &TransformInput) -> Result<Value> {
        let context = context_for(input)?;
        let source = source.to_string();
        let sandbox = self.clone();

        let guard = CancelOnDrop(Arc::new(AtomicBool::new(false)));
        let cancelled = Arc::clone(&guard.0);
        let result =
            tokio::task::spawn_blocking(move || sandbox.run(&source, &context, &cancelled)).await;
        drop(guard);

        result.map_err(|e| DeliveryError::transform(format!("template task failed: {e}")))?
    }
}
