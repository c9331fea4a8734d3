//! `wardenutils::sleeper` abstracts waiting between retry attempts.

use std::time::Duration;

use async_trait::async_trait;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Sleeps on the tokio timer.
#[derive(Debug, Clone, Default)]
pub struct TokioSleeper;

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Waits for a fixed duration.
///
/// Every retry loop takes a `Sleeper` so tests can count and measure waits without real delays.
#[async_trait]
pub trait Sleeper: Send + Sync {
    /// Sleeps for `duration`.
    async fn sleep(&self, duration: Duration);
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
