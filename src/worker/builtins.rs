//! Built-in diagnostic handlers, registered in every worker.
//!
//! They exist for smoke tests, boundary checks, and failure-path drills
//! without shipping application code:
//!
//! - `builtin.echo` answers with its payload
//! - `builtin.sleep` waits `ms` then answers with `echo`
//! - `builtin.fail` reports a handler error (`message`, payload as detail)
//! - `builtin.panic` panics, exercising crash recovery
//! - `builtin.bytes` emits byte buffers in both wire shapes
//! - `builtin.env` reports an environment variable as the worker sees it

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::adapter::{Handler, HandlerError, HandlerFactory, HandlerRegistry, HandlerResult};
use crate::error::Result;
use crate::wire::bytes_to_value;

pub fn install(registry: &HandlerRegistry) {
    registry.register("builtin.echo", Arc::new(BuiltinFactory(|| Arc::new(Echo))));
    registry.register("builtin.sleep", Arc::new(BuiltinFactory(|| Arc::new(Sleep))));
    registry.register("builtin.fail", Arc::new(BuiltinFactory(|| Arc::new(Fail))));
    registry.register("builtin.panic", Arc::new(BuiltinFactory(|| Arc::new(Panic))));
    registry.register("builtin.bytes", Arc::new(BuiltinFactory(|| Arc::new(Bytes))));
    registry.register("builtin.env", Arc::new(BuiltinFactory(|| Arc::new(Env))));
}

struct BuiltinFactory(fn() -> Arc<dyn Handler>);

#[async_trait]
impl HandlerFactory for BuiltinFactory {
    async fn load(&self, _options: &Value) -> Result<Arc<dyn Handler>> {
        Ok((self.0)())
    }
}

struct Echo;

#[async_trait]
impl Handler for Echo {
    async fn handle(&self, payload: Value) -> HandlerResult {
        Ok(payload)
    }
}

/// Payload: `{"ms": 250, "echo": <anything>}`.
struct Sleep;

#[async_trait]
impl Handler for Sleep {
    async fn handle(&self, payload: Value) -> HandlerResult {
        let ms = payload["ms"].as_u64().unwrap_or(0);
        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
        Ok(payload["echo"].clone())
    }
}

/// Payload: `{"message": "why"}`; the whole payload rides as detail.
struct Fail;

#[async_trait]
impl Handler for Fail {
    async fn handle(&self, payload: Value) -> HandlerResult {
        let message = payload["message"]
            .as_str()
            .unwrap_or("instructed to fail")
            .to_string();
        Err(HandlerError::with_detail(message, payload))
    }
}

struct Panic;

#[async_trait]
impl Handler for Panic {
    async fn handle(&self, payload: Value) -> HandlerResult {
        let message = payload["message"]
            .as_str()
            .unwrap_or("instructed to panic")
            .to_string();
        panic!("{message}");
    }
}

/// Payload: `{"data": [bytes...]}`. Answers with the same bytes in the
/// canonical tagged shape and in the indexed-object shape JSON mangles
/// buffers into, so callers can verify reconstruction end to end.
struct Bytes;

#[async_trait]
impl Handler for Bytes {
    async fn handle(&self, payload: Value) -> HandlerResult {
        let data: Vec<u8> = payload["data"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_u64())
                    .filter_map(|n| u8::try_from(n).ok())
                    .collect()
            })
            .unwrap_or_default();

        let indexed: Value = Value::Object(
            data.iter()
                .enumerate()
                .map(|(index, byte)| (index.to_string(), json!(byte)))
                .collect(),
        );
        Ok(json!({
            "len": data.len(),
            "tagged": bytes_to_value(&data),
            "indexed": indexed,
        }))
    }
}

/// Payload: `{"name": "VAR"}`. Answers the variable's value in the
/// worker's own environment, `null` when unset. Useful for checking what
/// a child process actually inherited.
struct Env;

#[async_trait]
impl Handler for Env {
    async fn handle(&self, payload: Value) -> HandlerResult {
        let name = payload["name"].as_str().unwrap_or_default();
        Ok(std::env::var(name).map(Value::String).unwrap_or(Value::Null))
    }
}
