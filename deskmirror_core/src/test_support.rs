#![cfg(test)]

use crate::remote::error::{RemoteError, RemoteResult};
use crate::remote::traits::{RemoteApi, UploadFile};
use crate::store::sqlite::SqliteStore;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub(crate) async fn memory_store() -> Arc<SqliteStore> {
    Arc::new(SqliteStore::in_memory().await.unwrap())
}

pub(crate) fn contact_json(id: i64) -> Value {
    json!({
        "id": id,
        "name": format!("Contact {id}"),
        "email": format!("contact{id}@example.com"),
        "tags": [],
        "other_emails": [],
        "custom_fields": {},
        "updated_at": "2024-01-01T00:00:00Z",
    })
}

pub(crate) fn ticket_json(id: i64, updated_at: &str) -> Value {
    json!({
        "id": id,
        "subject": format!("Ticket {id}"),
        "description": "<p>It broke</p>",
        "description_text": "It broke",
        "status": 2,
        "priority": 1,
        "tags": [],
        "custom_fields": {},
        "created_at": "2024-01-01T00:00:00Z",
        "updated_at": updated_at,
    })
}

pub(crate) fn conversation_json(id: i64, ticket_id: i64) -> Value {
    json!({
        "id": id,
        "ticket_id": ticket_id,
        "body": format!("<p>reply {id}</p>"),
        "body_text": format!("reply {id}"),
        "incoming": true,
        "private": false,
        "attachments": [],
        "created_at": "2024-01-02T00:00:00Z",
        "updated_at": "2024-01-02T00:00:00Z",
    })
}

/// `count` minimal records with ids starting at `first_id`.
pub(crate) fn page_of(first_id: i64, count: usize) -> Value {
    Value::Array(
        (0..count as i64)
            .map(|i| json!({"id": first_id + i, "name": format!("n{i}"), "updated_at": "2024-01-01T00:00:00Z"}))
            .collect(),
    )
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RecordedCall {
    pub method: &'static str,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl RecordedCall {
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

enum Route {
    Pages(Vec<Value>),
    Fixed(Value),
    Fail(RemoteError),
}

/// Scripted `RemoteApi`: routes are keyed by method and path, every call is
/// recorded, and unregistered routes answer `NotFound`.
#[derive(Default)]
pub(crate) struct FakeRemote {
    routes: Mutex<HashMap<String, Route>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn key(method: &str, path: &str) -> String {
        format!("{method} {path}")
    }

    /// Serve `pages[n - 1]` for `?page=n`, and `[]` past the end.
    pub fn on_pages(&self, path: &str, pages: Vec<Value>) {
        self.routes
            .lock()
            .unwrap()
            .insert(Self::key("GET", path), Route::Pages(pages));
    }

    pub fn on(&self, method: &str, path: &str, response: Value) {
        self.routes
            .lock()
            .unwrap()
            .insert(Self::key(method, path), Route::Fixed(response));
    }

    pub fn fail(&self, method: &str, path: &str, error: RemoteError) {
        self.routes
            .lock()
            .unwrap()
            .insert(Self::key(method, path), Route::Fail(error));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, method: &str, path: &str) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.method == method && c.path == path)
            .collect()
    }

    fn respond(
        &self,
        method: &'static str,
        path: &str,
        query: &[(String, String)],
        body: Option<Value>,
    ) -> RemoteResult<Value> {
        self.calls.lock().unwrap().push(RecordedCall {
            method,
            path: path.to_string(),
            query: query.to_vec(),
            body,
        });

        let routes = self.routes.lock().unwrap();
        match routes.get(&Self::key(method, path)) {
            Some(Route::Fixed(v)) => Ok(v.clone()),
            Some(Route::Fail(e)) => Err(e.clone()),
            Some(Route::Pages(pages)) => {
                let page = query
                    .iter()
                    .find(|(k, _)| k == "page")
                    .and_then(|(_, v)| v.parse::<usize>().ok())
                    .unwrap_or(1);
                Ok(pages
                    .get(page.saturating_sub(1))
                    .cloned()
                    .unwrap_or_else(|| json!([])))
            }
            None => Err(RemoteError::NotFound(format!("{method} {path}"))),
        }
    }
}

#[async_trait]
impl RemoteApi for FakeRemote {
    async fn get(&self, path: &str, query: &[(String, String)]) -> RemoteResult<Value> {
        self.respond("GET", path, query, None)
    }

    async fn post(&self, path: &str, body: &Value) -> RemoteResult<Value> {
        self.respond("POST", path, &[], Some(body.clone()))
    }

    async fn put(&self, path: &str, body: &Value) -> RemoteResult<Value> {
        self.respond("PUT", path, &[], Some(body.clone()))
    }

    async fn delete(&self, path: &str) -> RemoteResult<Value> {
        self.respond("DELETE", path, &[], None)
    }

    async fn post_multipart(
        &self,
        path: &str,
        fields: &[(String, String)],
        files: Vec<UploadFile>,
    ) -> RemoteResult<Value> {
        let body = json!({
            "fields": fields.iter().map(|(k, v)| json!([k, v])).collect::<Vec<_>>(),
            "files": files.iter().map(|f| f.file_name.clone()).collect::<Vec<_>>(),
        });
        self.respond("POST", path, &[], Some(body))
    }
}
