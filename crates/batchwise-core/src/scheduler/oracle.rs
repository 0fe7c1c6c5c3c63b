use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::OracleError;
use crate::types::Batch;

/// The expensive external analysis service.
#[async_trait]
pub trait Oracle: Send + Sync {
    /// Evaluate `payload`: either a single item payload or a
    /// [`Batch::combined_payload`].
    async fn invoke(&self, payload: &Value) -> Result<Value, OracleError>;
}

#[async_trait]
impl<T: Oracle + ?Sized> Oracle for Arc<T> {
    async fn invoke(&self, payload: &Value) -> Result<Value, OracleError> {
        (**self).invoke(payload).await
    }
}

type BoxedInvoke =
    dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value, OracleError>> + Send>> + Send + Sync;

/// Adapts an async closure into an [`Oracle`].
pub struct FnOracle {
    f: Box<BoxedInvoke>,
}

impl FnOracle {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, OracleError>> + Send + 'static,
    {
        Self {
            f: Box::new(move |payload| Box::pin(f(payload))),
        }
    }
}

#[async_trait]
impl Oracle for FnOracle {
    async fn invoke(&self, payload: &Value) -> Result<Value, OracleError> {
        (self.f)(payload.clone()).await
    }
}

/// Splits a batch response into per-item values.
///
/// Items missing from the returned map are treated as unresolved and drained
/// to the single-item path.
pub trait ResultExtractor: Send + Sync {
    fn extract(
        &self,
        batch: &Batch,
        response: &Value,
    ) -> Result<HashMap<String, Value>, OracleError>;
}

/// Accepts any of the response shapes:
///
/// - `{"results": {"<item id>": value, ...}}`
/// - `{"results": [{"id": "<item id>", "result": value}, ...]}`
/// - a bare array of `{"id", "result"}` objects
///
/// Array elements without a string `id` are aligned with batch members by
/// position. Elements without a `result` field contribute the whole element.
/// Ids that are not members of the batch are ignored.
#[derive(Debug, Clone, Default)]
pub struct KeyedResults;

impl KeyedResults {
    fn from_array(batch: &Batch, items: &[Value]) -> Result<HashMap<String, Value>, OracleError> {
        let mut out = HashMap::new();
        for (idx, element) in items.iter().enumerate() {
            let id = match element.get("id").and_then(Value::as_str) {
                Some(id) => id,
                None => match batch.items.get(idx) {
                    Some(member) => member.id.as_str(),
                    None => {
                        return Err(OracleError::Extraction(format!(
                            "result element {idx} has no id and no matching batch member"
                        )))
                    }
                },
            };
            let value = element
                .get("result")
                .cloned()
                .unwrap_or_else(|| element.clone());
            out.insert(id.to_string(), value);
        }
        Ok(out)
    }
}

impl ResultExtractor for KeyedResults {
    fn extract(
        &self,
        batch: &Batch,
        response: &Value,
    ) -> Result<HashMap<String, Value>, OracleError> {
        let container = response.get("results").unwrap_or(response);
        let mut map = match container {
            Value::Object(obj) => obj
                .iter()
                .map(|(id, value)| (id.clone(), value.clone()))
                .collect(),
            Value::Array(items) => Self::from_array(batch, items)?,
            other => {
                return Err(OracleError::Extraction(format!(
                    "expected object or array of results, got {}",
                    json_kind(other)
                )))
            }
        };
        map.retain(|id, _| batch.items.iter().any(|item| &item.id == id));
        Ok(map)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
