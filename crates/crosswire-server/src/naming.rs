//! Naming/discovery contract.
//!
//! Service discovery itself is an external collaborator; the server only
//! needs its two-method register/deregister shape at startup and shutdown.

use async_trait::async_trait;

use crosswire_core::error::Result;

/// What a service advertises to discovery.
#[derive(Debug, Clone)]
pub struct ServiceDesc {
    pub service: String,
    pub methods: Vec<String>,
    /// Listen addresses this process serves the service on.
    pub addrs: Vec<String>,
}

#[async_trait]
pub trait Naming: Send + Sync {
    async fn register(&self, desc: &ServiceDesc) -> Result<()>;
    async fn deregister(&self, desc: &ServiceDesc) -> Result<()>;
}
