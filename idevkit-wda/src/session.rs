//! WebDriverAgent session client
//!
//! One [`SessionClient`] holds at most one agent session. The session state
//! lock is held for the whole of each request, so actions issued on one client
//! reach the agent strictly in call order.

use crate::types::{buttons, ActiveAppInfo, AgentStatus, SessionInfo, WindowSize};
use base64::Engine;
use futures::future::BoxFuture;
use idevkit_common::{AgentConfig, DeviceKitError, Result};
use reqwest::{Method, Url};
use serde_json::{json, Value};
use tokio::runtime::Handle;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionState {
    Closed,
    Open { session_id: String },
}

/// Client for one automation session against a device's agent
#[derive(Debug)]
pub struct SessionClient {
    device_id: String,
    config: AgentConfig,
    base_url: Url,
    http: reqwest::Client,
    state: Mutex<SessionState>,
}

impl SessionClient {
    /// Create a client; no request is made until a session is opened
    ///
    /// With `config.implicit_session` set, actions issued while no session is
    /// open create one first. Otherwise they fail with `NoActiveSession`.
    pub fn new<S: Into<String>>(device_id: S, config: AgentConfig) -> Result<Self> {
        let base_url = parse_base_url(&config.base_url)?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| DeviceKitError::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            device_id: device_id.into(),
            config,
            base_url,
            http,
            state: Mutex::new(SessionState::Closed),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Whether actions create a session on demand
    pub fn implicit_session(&self) -> bool {
        self.config.implicit_session
    }

    pub async fn session_id(&self) -> Option<String> {
        match &*self.state.lock().await {
            SessionState::Open { session_id } => Some(session_id.clone()),
            SessionState::Closed => None,
        }
    }

    pub async fn is_open(&self) -> bool {
        self.session_id().await.is_some()
    }

    /// Open a new session, closing the current one first
    pub async fn create_session(&self) -> Result<String> {
        let mut state = self.state.lock().await;

        if let SessionState::Open { session_id } = &*state {
            let previous = session_id.clone();
            if let Err(e) = self.delete_session(&previous).await {
                warn!("Abandoning session {} after failed teardown: {}", previous, e);
            }
            *state = SessionState::Closed;
        }

        let session_id = self.open_session().await?;
        *state = SessionState::Open {
            session_id: session_id.clone(),
        };
        Ok(session_id)
    }

    /// Details of the open session; never opens one
    pub async fn get_session_info(&self) -> Result<SessionInfo> {
        let state = self.state.lock().await;
        let SessionState::Open { session_id } = &*state else {
            return Err(DeviceKitError::NoActiveSession);
        };

        let response = self
            .send(Method::GET, &format!("session/{}", session_id), None)
            .await?;
        let value = response.get("value").cloned().unwrap_or(Value::Null);
        let capabilities = value.get("capabilities").cloned().unwrap_or(value);

        Ok(SessionInfo {
            session_id: session_id.clone(),
            capabilities,
        })
    }

    /// Touch the session so the agent does not expire it
    pub async fn keep_alive(&self) -> Result<()> {
        let state = self.state.lock().await;
        let SessionState::Open { session_id } = &*state else {
            return Err(DeviceKitError::NoActiveSession);
        };

        self.send(Method::GET, &format!("session/{}", session_id), None)
            .await?;
        debug!("Session {} kept alive", session_id);
        Ok(())
    }

    /// Screen size in the coordinate space used by `tap`
    pub async fn get_window_size(&self) -> Result<WindowSize> {
        let mut state = self.state.lock().await;
        let session_id = self.active_session(&mut state).await?;

        let response = self
            .send(
                Method::GET,
                &format!("session/{}/window/size", session_id),
                None,
            )
            .await?;
        decode_value(response)
    }

    pub async fn get_active_app(&self) -> Result<ActiveAppInfo> {
        let mut state = self.state.lock().await;
        let session_id = self.active_session(&mut state).await?;

        let response = self
            .send(
                Method::GET,
                &format!("session/{}/wda/activeAppInfo", session_id),
                None,
            )
            .await?;
        decode_value(response)
    }

    /// Single-point touch; range checking is left to the agent
    pub async fn tap(&self, x: f64, y: f64) -> Result<()> {
        let mut state = self.state.lock().await;
        let session_id = self.active_session(&mut state).await?;

        self.send(
            Method::POST,
            &format!("session/{}/wda/tap/0", session_id),
            Some(json!({ "x": x, "y": y })),
        )
        .await?;
        debug!("Tapped ({}, {}) on {}", x, y, self.device_id);
        Ok(())
    }

    /// Full-screen capture as raw image bytes (PNG)
    pub async fn screenshot(&self) -> Result<Vec<u8>> {
        let mut state = self.state.lock().await;
        let session_id = self.active_session(&mut state).await?;

        let response = self
            .send(
                Method::GET,
                &format!("session/{}/screenshot", session_id),
                None,
            )
            .await?;
        let encoded = response
            .get("value")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                DeviceKitError::Serialization("screenshot response has no image payload".into())
            })?;

        decode_image(encoded)
    }

    pub async fn press_home(&self) -> Result<()> {
        self.press_button(buttons::HOME).await
    }

    /// Press a hardware button by agent name (`home`, `volumeUp`, `volumeDown`)
    pub async fn press_button(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let session_id = self.active_session(&mut state).await?;

        self.send(
            Method::POST,
            &format!("session/{}/wda/pressButton", session_id),
            Some(json!({ "name": name })),
        )
        .await?;
        Ok(())
    }

    /// Tear down the open session; a no-op when none is open
    ///
    /// The session counts as closed even when the teardown request fails.
    pub async fn close_session(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let SessionState::Open { session_id } = std::mem::replace(&mut *state, SessionState::Closed)
        else {
            return Ok(());
        };

        self.delete_session(&session_id).await
    }

    /// Agent health; needs no session
    pub async fn agent_status(&self) -> Result<AgentStatus> {
        let response = self.send(Method::GET, "status", None).await?;
        let value = response.get("value").cloned().unwrap_or(Value::Null);

        let ready = value
            .get("ready")
            .and_then(Value::as_bool)
            .unwrap_or_else(|| value.get("state").and_then(Value::as_str) == Some("success"));

        Ok(AgentStatus {
            ready,
            message: value
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
            session_id: response
                .get("sessionId")
                .and_then(Value::as_str)
                .map(str::to_string),
            raw: response,
        })
    }

    /// Open a session, run `f`, and close the session whatever `f` returned
    pub async fn with_session<F, R>(&self, f: F) -> Result<R>
    where
        F: for<'a> FnOnce(&'a SessionClient) -> BoxFuture<'a, Result<R>>,
    {
        self.create_session().await?;
        let result = f(self).await;
        let closed = self.close_session().await;

        let value = result?;
        closed?;
        Ok(value)
    }

    async fn active_session(&self, state: &mut MutexGuard<'_, SessionState>) -> Result<String> {
        if let SessionState::Open { session_id } = &**state {
            return Ok(session_id.clone());
        }
        if !self.config.implicit_session {
            return Err(DeviceKitError::NoActiveSession);
        }

        debug!("No open session on {}, creating one", self.device_id);
        let session_id = self.open_session().await?;
        **state = SessionState::Open {
            session_id: session_id.clone(),
        };
        Ok(session_id)
    }

    async fn open_session(&self) -> Result<String> {
        let mut always_match = serde_json::Map::new();
        if let Some(bundle_id) = &self.config.bundle_id {
            always_match.insert("bundleId".to_string(), Value::String(bundle_id.clone()));
        }
        let body = json!({ "capabilities": { "alwaysMatch": always_match } });

        let response = self
            .send(Method::POST, "session", Some(body))
            .await
            .map_err(|e| match e {
                DeviceKitError::AgentProtocol { status, message } => {
                    DeviceKitError::SessionCreate {
                        status: Some(status),
                        message,
                    }
                }
                other => other,
            })?;

        let session_id = extract_session_id(&response).ok_or_else(|| {
            DeviceKitError::SessionCreate {
                status: None,
                message: "response did not contain a session id".to_string(),
            }
        })?;

        info!("Opened session {} on {}", session_id, self.device_id);
        Ok(session_id)
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        self.send(Method::DELETE, &format!("session/{}", session_id), None)
            .await?;
        info!("Closed session {} on {}", session_id, self.device_id);
        Ok(())
    }

    async fn send(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        send_request(&self.http, &self.base_url, method, path, body).await
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        let SessionState::Open { session_id } =
            std::mem::replace(self.state.get_mut(), SessionState::Closed)
        else {
            return;
        };

        match Handle::try_current() {
            Ok(handle) => {
                warn!("Session {} dropped while open, closing it", session_id);
                let http = self.http.clone();
                let base_url = self.base_url.clone();
                handle.spawn(async move {
                    let path = format!("session/{}", session_id);
                    if let Err(e) = send_request(&http, &base_url, Method::DELETE, &path, None).await {
                        warn!("Failed to close dropped session {}: {}", session_id, e);
                    }
                });
            }
            Err(_) => {
                warn!(
                    "Session {} dropped outside a runtime and could not be closed",
                    session_id
                );
            }
        }
    }
}

async fn send_request(
    http: &reqwest::Client,
    base_url: &Url,
    method: Method,
    path: &str,
    body: Option<Value>,
) -> Result<Value> {
    let url = base_url
        .join(path)
        .map_err(|e| DeviceKitError::invalid(format!("Invalid agent path {}: {}", path, e)))?;
    debug!("{} {}", method, url);

    let mut request = http.request(method.clone(), url);
    if let Some(body) = body {
        request = request.json(&body);
    }

    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            DeviceKitError::timeout(format!("{} /{}", method, path))
        } else {
            DeviceKitError::AgentUnreachable(e.to_string())
        }
    })?;

    let status = response.status();
    let text = response.text().await.map_err(|e| {
        if e.is_timeout() {
            DeviceKitError::timeout(format!("{} /{}", method, path))
        } else {
            DeviceKitError::AgentUnreachable(e.to_string())
        }
    })?;

    if !status.is_success() {
        return Err(DeviceKitError::AgentProtocol {
            status: status.as_u16(),
            message: error_message(&text),
        });
    }

    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&text)?)
}

fn parse_base_url(raw: &str) -> Result<Url> {
    // Without the trailing slash `join` would replace the last path segment
    let normalized = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{}/", raw)
    };
    Url::parse(&normalized)
        .map_err(|e| DeviceKitError::config(format!("Invalid agent URL {}: {}", raw, e)))
}

/// Session id from either the W3C (`value.sessionId`) or legacy (top-level) shape
fn extract_session_id(response: &Value) -> Option<String> {
    response
        .get("value")
        .and_then(|value| value.get("sessionId"))
        .or_else(|| response.get("sessionId"))
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

fn error_message(body: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let from_value = parsed.as_ref().and_then(|response| {
        let value = response.get("value")?;
        value
            .get("message")
            .or_else(|| value.get("error"))
            .and_then(Value::as_str)
            .map(str::to_string)
    });

    from_value.unwrap_or_else(|| body.chars().take(200).collect())
}

fn decode_value<T: serde::de::DeserializeOwned>(response: Value) -> Result<T> {
    let value = match response {
        Value::Object(mut map) => map.remove("value").unwrap_or(Value::Null),
        other => other,
    };
    Ok(serde_json::from_value(value)?)
}

fn decode_image(encoded: &str) -> Result<Vec<u8>> {
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    base64::engine::general_purpose::STANDARD
        .decode(compact)
        .map_err(|e| DeviceKitError::Serialization(format!("Invalid screenshot payload: {}", e)))
}
