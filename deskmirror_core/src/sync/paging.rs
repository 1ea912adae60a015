use crate::Result;
use crate::remote::error::RemoteError;
use crate::remote::traits::RemoteApi;
use serde_json::Value;

/// Walks a `page`/`per_page` list endpoint. The walk ends after the first
/// page holding fewer than `per_page` records.
pub struct Pager<'a> {
    remote: &'a dyn RemoteApi,
    path: String,
    query: Vec<(String, String)>,
    per_page: usize,
    next: Option<u32>,
    requests: u32,
}

impl<'a> Pager<'a> {
    pub fn new(remote: &'a dyn RemoteApi, path: impl Into<String>, per_page: usize) -> Self {
        Self {
            remote,
            path: path.into(),
            query: Vec::new(),
            per_page: per_page.max(1),
            next: Some(1),
            requests: 0,
        }
    }

    /// Add a query parameter sent with every page request.
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn requests(&self) -> u32 {
        self.requests
    }

    #[tracing::instrument(level = "debug", skip(self), fields(path = %self.path, page = ?self.next))]
    pub async fn next_page(&mut self) -> Result<Option<Vec<Value>>> {
        let Some(page) = self.next else {
            return Ok(None);
        };

        let mut query = self.query.clone();
        query.push(("page".to_string(), page.to_string()));
        query.push(("per_page".to_string(), self.per_page.to_string()));

        self.requests += 1;
        let items = match self.remote.get(&self.path, &query).await? {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => {
                return Err(RemoteError::Request(format!(
                    "expected a JSON array from {}, got {}",
                    self.path,
                    json_kind(&other)
                ))
                .into());
            }
        };

        self.next = if items.len() < self.per_page {
            None
        } else {
            Some(page + 1)
        };
        Ok(Some(items))
    }

    /// Drain every remaining page.
    pub async fn collect_all(mut self) -> Result<Vec<Value>> {
        let mut all = Vec::new();
        while let Some(items) = self.next_page().await? {
            all.extend(items);
        }
        Ok(all)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
