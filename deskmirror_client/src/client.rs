use crate::config::RemoteConfig;
use crate::error::{classify, transport_error};
use async_trait::async_trait;
use deskmirror_core::{Error, RemoteApi, RemoteError, RemoteResult, Result, UploadFile};
use reqwest::header::{ACCEPT, RETRY_AFTER};
use reqwest::multipart::{Form, Part};
use reqwest::{Method, RequestBuilder};
use serde_json::Value;

/// reqwest transport for the helpdesk REST API.
///
/// Every request is sent with HTTP basic auth (API key as user, `X` as
/// password). Non-success statuses are classified into `RemoteError`.
#[derive(Debug, Clone)]
pub struct HelpdeskClient {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl HelpdeskClient {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::backend("helpdesk http client", e))?;
        Ok(Self {
            base_url: config.base_url.trim().trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, self.url(path))
            .basic_auth(&self.api_key, Some("X"))
            .header(ACCEPT, "application/json")
    }

    async fn send(&self, req: RequestBuilder) -> RemoteResult<Value> {
        let resp = req.send().await.map_err(transport_error)?;
        let status = resp.status();
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let text = resp.text().await.map_err(transport_error)?;

        if !status.is_success() {
            let err = classify(status.as_u16(), retry_after.as_deref(), &text);
            tracing::debug!(status = status.as_u16(), error = %err, "helpdesk request failed");
            return Err(err);
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| RemoteError::Request(format!("invalid JSON response: {e}")))
    }
}

fn file_part(file: UploadFile) -> RemoteResult<Part> {
    let part = Part::bytes(file.data).file_name(file.file_name);
    match file.content_type {
        Some(ct) => part
            .mime_str(&ct)
            .map_err(|e| RemoteError::Request(format!("invalid content type '{ct}': {e}"))),
        None => Ok(part),
    }
}

#[async_trait]
impl RemoteApi for HelpdeskClient {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn get(&self, path: &str, query: &[(String, String)]) -> RemoteResult<Value> {
        self.send(self.request(Method::GET, path).query(query)).await
    }

    #[tracing::instrument(level = "debug", skip(self, body))]
    async fn post(&self, path: &str, body: &Value) -> RemoteResult<Value> {
        self.send(self.request(Method::POST, path).json(body)).await
    }

    #[tracing::instrument(level = "debug", skip(self, body))]
    async fn put(&self, path: &str, body: &Value) -> RemoteResult<Value> {
        self.send(self.request(Method::PUT, path).json(body)).await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn delete(&self, path: &str) -> RemoteResult<Value> {
        self.send(self.request(Method::DELETE, path)).await
    }

    #[tracing::instrument(level = "debug", skip(self, text_fields, files), fields(files = files.len()))]
    async fn post_multipart(
        &self,
        path: &str,
        text_fields: &[(String, String)],
        files: Vec<UploadFile>,
    ) -> RemoteResult<Value> {
        let mut form = Form::new();
        for (name, value) in text_fields {
            form = form.text(name.clone(), value.clone());
        }
        for file in files {
            let field = file.field.clone();
            form = form.part(field, file_part(file)?);
        }
        self.send(self.request(Method::POST, path).multipart(form))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_trailing_slash() {
        let c = HelpdeskClient::new(&RemoteConfig::new("https://acme.example.com/", "k")).unwrap();
        assert_eq!(c.base_url(), "https://acme.example.com");
        assert_eq!(c.url("/api/v2/tickets"), "https://acme.example.com/api/v2/tickets");
        assert_eq!(c.url("api/v2/tickets"), "https://acme.example.com/api/v2/tickets");
    }

    #[test]
    fn rejects_invalid_config() {
        assert!(HelpdeskClient::new(&RemoteConfig::new("", "k")).is_err());
    }

    #[test]
    fn unknown_content_type_is_a_request_error() {
        let file = UploadFile::attachment("a.bin", vec![1]).with_content_type("not a mime");
        assert!(matches!(file_part(file), Err(RemoteError::Request(_))));
    }
}
