use crate::remote::error::RemoteResult;
use async_trait::async_trait;
use serde_json::Value;

/// A file attached to a multipart create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    /// Form field name (e.g. `attachments[]`).
    pub field: String,
    pub file_name: String,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

impl UploadFile {
    pub fn attachment(file_name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            field: "attachments[]".to_string(),
            file_name: file_name.into(),
            content_type: None,
            data,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Transport to the remote helpdesk API.
///
/// Implementations authenticate every call and map HTTP failures onto
/// `RemoteError`. Successful calls return the parsed JSON body (`Value::Null`
/// for empty bodies). The engine never retries on its own.
///
/// The reqwest implementation lives in `deskmirror_client`.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn get(&self, path: &str, query: &[(String, String)]) -> RemoteResult<Value>;

    async fn post(&self, path: &str, body: &Value) -> RemoteResult<Value>;

    async fn put(&self, path: &str, body: &Value) -> RemoteResult<Value>;

    async fn delete(&self, path: &str) -> RemoteResult<Value>;

    /// POST a multipart form made of plain text `fields` and `files`.
    async fn post_multipart(
        &self,
        path: &str,
        fields: &[(String, String)],
        files: Vec<UploadFile>,
    ) -> RemoteResult<Value>;
}
