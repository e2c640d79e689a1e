//! reqwest-backed [`HttpTransport`] with HTTP Basic auth

use super::{unwrap_data, HttpMethod, HttpRequest, HttpTransport, TransportError};
use async_trait::async_trait;
use reqwest::multipart::Form;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: String,
    app_key: String,
    secret_key: String,
}

impl ReqwestTransport {
    /// Build a transport for `base_url` (e.g. `https://monkey.criptext.com`)
    pub fn new(
        base_url: impl Into<String>,
        app_key: impl Into<String>,
        secret_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;

        Ok(Self::with_client(client, base_url, app_key, secret_key))
    }

    /// Use a pre-configured client
    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        app_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            app_key: app_key.into(),
            secret_key: secret_key.into(),
        }
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
}

/// Multipart form from the top-level fields of a JSON object
fn multipart_form(body: &Value) -> Form {
    let mut form = Form::new();
    if let Value::Object(fields) = body {
        for (name, value) in fields {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            form = form.text(name.clone(), text);
        }
    }
    form
}

/// Decode a response body; an empty body is `null`
fn parse_body(text: &str) -> Result<Value, TransportError> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    let value: Value =
        serde_json::from_str(text).map_err(|e| TransportError::InvalidBody(e.to_string()))?;
    Ok(unwrap_data(value))
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn request(&self, request: HttpRequest) -> Result<Value, TransportError> {
        let url = self.url(&request.path);
        debug!(method = ?request.method, path = %request.path, "API request");

        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&url),
            HttpMethod::Post => self.client.post(&url),
        }
        .basic_auth(&self.app_key, Some(&self.secret_key));

        if let Some(body) = &request.body {
            builder = if request.is_file {
                builder.multipart(multipart_form(body))
            } else {
                builder.json(body)
            };
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        parse_body(&text)
    }
}
