use async_trait::async_trait;

use tether_core::error::Result;

/// Host-side data sync, run once per authenticated session.
///
/// `sync_online` runs first, then `sync_offline`. A failure in either is
/// logged and does not block the transition to ready.
#[async_trait]
pub trait SyncSource: Send + Sync {
    async fn sync_online(&self) -> Result<()>;
    async fn sync_offline(&self) -> Result<()>;
}

/// Nothing to sync.
pub struct NoopSync;

#[async_trait]
impl SyncSource for NoopSync {
    async fn sync_online(&self) -> Result<()> {
        Ok(())
    }

    async fn sync_offline(&self) -> Result<()> {
        Ok(())
    }
}
