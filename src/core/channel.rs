//! Purpose: Define the boundary through which backend calls are executed.
//! Exports: `CallChannel`, `SharedChannel`.
//! Role: Seam between the queues and whatever transport reaches the backend.
//! Invariants: One invocation is one named remote call; results are returned, never thrown.
//! Invariants: Timeouts are the channel's concern and surface as `NetworkFailure`.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::error::Error;
use crate::core::session::ContainerConfig;

#[async_trait]
pub trait CallChannel: Send + Sync + 'static {
    /// Run `method` for `container` under the session `token`.
    ///
    /// A channel may report per-item failures by returning a `PartialFailure`
    /// error whose detail map names the failed items.
    async fn invoke(
        &self,
        method: &str,
        token: &str,
        container: &ContainerConfig,
        args: Value,
    ) -> Result<Value, Error>;
}

pub type SharedChannel = Arc<dyn CallChannel>;
