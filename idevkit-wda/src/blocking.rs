//! Blocking mirror of the session client

use crate::session::SessionClient;
use crate::types::{ActiveAppInfo, AgentStatus, SessionInfo, WindowSize};
use idevkit_common::{build_runtime, AgentConfig, Result};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tracing::warn;

/// Blocking [`SessionClient`]; closes any open session when dropped
///
/// Must not be used from inside an async context.
#[derive(Debug)]
pub struct BlockingSessionClient {
    client: SessionClient,
    runtime: Arc<Runtime>,
}

impl BlockingSessionClient {
    pub fn new<S: Into<String>>(device_id: S, config: AgentConfig) -> Result<Self> {
        Self::with_runtime(device_id, config, build_runtime()?)
    }

    pub fn with_runtime<S: Into<String>>(
        device_id: S,
        config: AgentConfig,
        runtime: Arc<Runtime>,
    ) -> Result<Self> {
        // reqwest binds its connection pool to the runtime it is built in
        let client = {
            let _guard = runtime.enter();
            SessionClient::new(device_id, config)?
        };
        Ok(Self { client, runtime })
    }

    /// The async client driven by this wrapper
    pub fn client(&self) -> &SessionClient {
        &self.client
    }

    pub fn session_id(&self) -> Option<String> {
        self.runtime.block_on(self.client.session_id())
    }

    pub fn is_open(&self) -> bool {
        self.runtime.block_on(self.client.is_open())
    }

    pub fn create_session(&self) -> Result<String> {
        self.runtime.block_on(self.client.create_session())
    }

    pub fn get_session_info(&self) -> Result<SessionInfo> {
        self.runtime.block_on(self.client.get_session_info())
    }

    pub fn keep_alive(&self) -> Result<()> {
        self.runtime.block_on(self.client.keep_alive())
    }

    pub fn get_window_size(&self) -> Result<WindowSize> {
        self.runtime.block_on(self.client.get_window_size())
    }

    pub fn get_active_app(&self) -> Result<ActiveAppInfo> {
        self.runtime.block_on(self.client.get_active_app())
    }

    pub fn tap(&self, x: f64, y: f64) -> Result<()> {
        self.runtime.block_on(self.client.tap(x, y))
    }

    pub fn screenshot(&self) -> Result<Vec<u8>> {
        self.runtime.block_on(self.client.screenshot())
    }

    pub fn press_home(&self) -> Result<()> {
        self.runtime.block_on(self.client.press_home())
    }

    pub fn press_button(&self, name: &str) -> Result<()> {
        self.runtime.block_on(self.client.press_button(name))
    }

    pub fn close_session(&self) -> Result<()> {
        self.runtime.block_on(self.client.close_session())
    }

    pub fn agent_status(&self) -> Result<AgentStatus> {
        self.runtime.block_on(self.client.agent_status())
    }

    /// Open a session, run `f`, and close the session whatever `f` returned
    pub fn with_session<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&BlockingSessionClient) -> Result<R>,
    {
        self.create_session()?;
        let result = f(self);
        let closed = self.close_session();

        let value = result?;
        closed?;
        Ok(value)
    }
}

impl Drop for BlockingSessionClient {
    fn drop(&mut self) {
        if let Err(e) = self.runtime.block_on(self.client.close_session()) {
            warn!("Failed to close session on drop: {}", e);
        }
    }
}
