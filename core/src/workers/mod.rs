//! Bridge between synchronous provider clients and the async runtime.
//!
//! Blocking work runs on tokio's blocking pool, so the caller suspends
//! instead of stalling an async worker thread.

use log::Level;
use tokio::task::spawn_blocking;
use uuid::Uuid;

use crate::errors::{NovelGenError, Result};
use crate::logging::log_event;

fn join_failure(provider: &str, job: &str, err: tokio::task::JoinError) -> NovelGenError {
    log_event(
        Level::Error,
        Some("AI-2003"),
        "novelgen::workers",
        "blocking provider job did not complete",
        None,
        Some(serde_json::json!({ "job": job, "provider": provider, "error": err.to_string() })),
    );
    NovelGenError::Provider {
        provider: provider.to_string(),
        status: None,
        body: format!("worker job {job} failed: {err}"),
    }
}

/// Run `job` on the blocking pool and await its result.
pub async fn run_blocking<T, F>(provider: &str, job: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let id = Uuid::new_v4().to_string();
    log::debug!(target: "novelgen::workers", "job {id} started for {provider}");
    match spawn_blocking(job).await {
        Ok(result) => result,
        Err(err) => Err(join_failure(provider, &id, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_blocking_returns_job_result() {
        let value = run_blocking("test", || Ok(21 * 2)).await.unwrap();
        assert_eq!(value, 42);
        let err = run_blocking::<(), _>("test", || Err(NovelGenError::Validation("x".into())))
            .await
            .unwrap_err();
        assert!(matches!(err, NovelGenError::Validation(_)));
    }

    #[tokio::test]
    async fn run_blocking_maps_panics_to_provider_error() {
        let err = run_blocking::<(), _>("gemini", || panic!("boom")).await.unwrap_err();
        assert!(matches!(err, NovelGenError::Provider { ref provider, .. } if provider == "gemini"));
    }
}
