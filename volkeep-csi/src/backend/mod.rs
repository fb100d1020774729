//! Storage backend seam.
//!
//! The controller owns validation and per-volume serialization; everything
//! that actually allocates or frees storage sits behind [`Backend`]. Errors
//! are gRPC statuses and reach the client unchanged, so a backend picks its
//! own codes (`NOT_FOUND`, `ALREADY_EXISTS`, `RESOURCE_EXHAUSTED`, ...).
//!
//! The controller never calls a backend concurrently for the same volume
//! name. Calls for different names may run in parallel.

mod memory;

pub use memory::MemoryBackend;

use tonic::Status;

use crate::context::CallContext;

#[tonic::async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Provision `name` with at least `min_bytes` (zero means "backend
    /// default") and return the size actually allocated. Creating a volume
    /// that already exists with a sufficient size returns that size.
    async fn create_volume(
        &self,
        ctx: &CallContext,
        name: &str,
        min_bytes: i64,
    ) -> Result<i64, Status>;

    /// Remove `name`. Deleting a volume that does not exist succeeds.
    async fn delete_volume(&self, ctx: &CallContext, name: &str) -> Result<(), Status>;

    /// `Ok` if the volume exists, `NOT_FOUND` (or another status) otherwise.
    async fn check_volume_exists(&self, ctx: &CallContext, id: &str) -> Result<(), Status>;

    /// Health check behind the Identity `Probe` RPC.
    async fn probe(&self, _ctx: &CallContext) -> Result<(), Status> {
        Ok(())
    }
}
