//! Purpose: Backend call channel speaking a CloudKit-style JSON web service over HTTP.
//! Exports: `HttpCallChannel`.
//! Role: Default `CallChannel` for the CLI; blocking `ureq` calls run off the async runtime.
//! Invariants: Every call carries the container API token and the session token as query params.
//! Invariants: Transport failures map to `NetworkFailure`; server envelopes keep their code.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::trace;
use url::Url;

use crate::api::response::server_error;
use crate::core::channel::CallChannel;
use crate::core::error::{Error, ErrorKind};
use crate::core::session::ContainerConfig;

const API_VERSION: &str = "1";

#[derive(Clone)]
pub struct HttpCallChannel {
    inner: Arc<HttpCallChannelInner>,
}

struct HttpCallChannelInner {
    base_url: Url,
    agent: ureq::Agent,
}

impl HttpCallChannel {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, Error> {
        let base_url = normalize_base_url(base_url.into())?;
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Ok(Self {
            inner: Arc::new(HttpCallChannelInner { base_url, agent }),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }

    fn call(
        &self,
        method: &str,
        token: &str,
        container: &ContainerConfig,
        args: &Value,
    ) -> Result<Value, Error> {
        let url = method_url(&self.inner.base_url, method, token, container)?;
        let payload = serde_json::to_string(args).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode request json")
                .with_source(err)
        })?;
        trace!(%method, url = %url.path(), "backend request");
        let response = self
            .inner
            .agent
            .post(url.as_str())
            .set("Accept", "application/json")
            .set("Content-Type", "application/json")
            .send_string(&payload);

        match response {
            Ok(resp) => read_json_response(resp),
            Err(ureq::Error::Status(code, resp)) => {
                Err(error_from_body(code, &resp.into_string().unwrap_or_default()))
            }
            Err(ureq::Error::Transport(err)) => Err(Error::new(ErrorKind::NetworkFailure)
                .with_message(format!("request to {method} failed"))
                .with_source(err)),
        }
    }
}

#[async_trait]
impl CallChannel for HttpCallChannel {
    async fn invoke(
        &self,
        method: &str,
        token: &str,
        container: &ContainerConfig,
        args: Value,
    ) -> Result<Value, Error> {
        let channel = self.clone();
        let method = method.to_string();
        let token = token.to_string();
        let container = container.clone();
        tokio::task::spawn_blocking(move || channel.call(&method, &token, &container, &args))
            .await
            .map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("backend call task failed")
                    .with_source(err)
            })?
    }
}

fn normalize_base_url(raw: String) -> Result<Url, Error> {
    let mut url = Url::parse(&raw).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid backend base url")
            .with_source(err)
    })?;
    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("backend base url must use http or https scheme"));
    }
    if url.path() != "/" && !url.path().is_empty() {
        return Err(
            Error::new(ErrorKind::Usage).with_message("backend base url must not include a path")
        );
    }
    url.set_path("/");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

// Device-level methods (push tokens) live under a separate service root.
fn service_for(method: &str) -> &'static str {
    if method.starts_with("tokens/") {
        "device"
    } else {
        "database"
    }
}

fn method_url(
    base_url: &Url,
    method: &str,
    token: &str,
    container: &ContainerConfig,
) -> Result<Url, Error> {
    if method.is_empty() || method.split('/').any(str::is_empty) {
        return Err(Error::new(ErrorKind::InvalidInput)
            .with_message(format!("invalid backend method `{method}`")));
    }
    let mut url = base_url.clone();
    {
        let mut path = url.path_segments_mut().map_err(|_| {
            Error::new(ErrorKind::Usage).with_message("backend base url cannot be a base")
        })?;
        path.clear();
        path.push(service_for(method));
        path.push(API_VERSION);
        path.push(&container.container_identifier);
        path.push(container.environment.as_str());
        path.extend(method.split('/'));
    }
    url.query_pairs_mut()
        .append_pair("ckAPIToken", &container.api_token)
        .append_pair("ckSession", token);
    Ok(url)
}

fn read_json_response(response: ureq::Response) -> Result<Value, Error> {
    let body = response.into_string().map_err(|err| {
        Error::new(ErrorKind::NetworkFailure)
            .with_message("failed to read response body")
            .with_source(err)
    })?;
    let value: Value = serde_json::from_str(&body).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("invalid response json")
            .with_source(err)
    })?;
    // Some failures arrive with a 200 and a top-level error envelope.
    if let Some(code) = value.get("serverErrorCode").and_then(Value::as_str) {
        return Err(server_error(
            code,
            value.get("reason").and_then(Value::as_str),
        ));
    }
    Ok(value)
}

fn error_from_body(status: u16, body: &str) -> Error {
    let envelope = serde_json::from_str::<Value>(body).ok();
    let code = envelope
        .as_ref()
        .and_then(|value| value.get("serverErrorCode"))
        .and_then(Value::as_str);
    let reason = envelope
        .as_ref()
        .and_then(|value| value.get("reason"))
        .and_then(Value::as_str);

    let err = match code {
        Some(code) => server_error(code, reason),
        None => Error::new(error_kind_from_status(status))
            .with_message(format!("backend error status {status}")),
    };
    if is_auth_status(status) && err.kind() != ErrorKind::NotAuthenticated {
        let mut auth = Error::new(ErrorKind::NotAuthenticated)
            .with_message(err.message().unwrap_or("session token rejected").to_string())
            .with_hint("Sign in again and set a fresh session token.");
        if let Some(code) = err.server_code() {
            auth = auth.with_server_code(code);
        }
        return auth;
    }
    err
}

fn is_auth_status(status: u16) -> bool {
    matches!(status, 401 | 421)
}

fn error_kind_from_status(status: u16) -> ErrorKind {
    match status {
        401 | 421 => ErrorKind::NotAuthenticated,
        400 => ErrorKind::InvalidInput,
        _ => ErrorKind::Server,
    }
}
