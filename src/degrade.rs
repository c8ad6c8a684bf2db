//! Degradation pipeline for batch per-item computation.
//!
//! Every input item yields exactly one output item, in input order. An item
//! whose computation errors, panics or times out is replaced by its fallback.

use futures::stream::{self, StreamExt};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DegradedResult<T> {
    pub value: T,
    pub is_fallback: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl<T> DegradedResult<T> {
    pub fn ok(value: T) -> Self {
        Self {
            value,
            is_fallback: false,
            reason: None,
        }
    }

    pub fn fallback(value: T, reason: impl Into<String>) -> Self {
        Self {
            value,
            is_fallback: true,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub degraded: usize,
}

impl BatchSummary {
    pub fn of<T>(results: &[DegradedResult<T>]) -> Self {
        let degraded = results.iter().filter(|r| r.is_fallback).count();
        Self {
            total: results.len(),
            succeeded: results.len() - degraded,
            degraded,
        }
    }

    /// Every item degraded; an empty batch is not.
    pub fn all_degraded(&self) -> bool {
        self.total > 0 && self.succeeded == 0
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Each item gets its own budget; items never share one.
    pub item_timeout: Duration,
    pub concurrency: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            item_timeout: Duration::from_secs(2),
            concurrency: 8,
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run `compute` over `items` with bounded concurrency, substituting
/// `fallback(item)` for every item that fails.
pub async fn run<I, T, E, F, Fut, FB>(
    items: Vec<I>,
    settings: &PipelineSettings,
    compute: F,
    fallback: FB,
) -> Vec<DegradedResult<T>>
where
    I: Clone,
    E: Display,
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    FB: Fn(&I) -> T,
{
    let item_timeout = settings.item_timeout;

    stream::iter(items)
        .map(|item| {
            let work = AssertUnwindSafe(compute(item.clone())).catch_unwind();
            async move { (item, tokio::time::timeout(item_timeout, work).await) }
        })
        .buffered(settings.concurrency.max(1))
        .enumerate()
        .map(|(index, (item, outcome))| {
            let reason = match outcome {
                Ok(Ok(Ok(value))) => return DegradedResult::ok(value),
                Ok(Ok(Err(e))) => e.to_string(),
                Ok(Err(payload)) => format!("panicked: {}", panic_message(payload)),
                Err(_) => format!("timed out after {:?}", item_timeout),
            };
            warn!("Batch item {} degraded to fallback: {}", index, reason);
            DegradedResult::fallback(fallback(&item), reason)
        })
        .collect()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_preserved_with_failures() {
        let items: Vec<u32> = (0..10).collect();
        let results = run(
            items,
            &PipelineSettings::default(),
            |n| async move {
                if n % 3 == 0 {
                    Err(format!("item {} failed", n))
                } else {
                    Ok(n * 10)
                }
            },
            |_| 0,
        )
        .await;

        assert_eq!(results.len(), 10);
        for (n, result) in results.iter().enumerate() {
            if n % 3 == 0 {
                assert!(result.is_fallback);
                assert_eq!(result.value, 0);
                assert_eq!(result.reason.as_deref(), Some(format!("item {} failed", n).as_str()));
            } else {
                assert!(!result.is_fallback);
                assert_eq!(result.value, n as u32 * 10);
            }
        }
        assert_eq!(
            BatchSummary::of(&results),
            BatchSummary {
                total: 10,
                succeeded: 6,
                degraded: 4
            }
        );
    }

    #[tokio::test]
    async fn test_panicking_item_is_isolated() {
        let results = run(
            vec!["a", "boom", "c"],
            &PipelineSettings::default(),
            |s| async move {
                if s == "boom" {
                    panic!("model exploded");
                }
                Ok::<_, String>(s.to_uppercase())
            },
            |s| format!("fallback-{}", s),
        )
        .await;

        let values: Vec<&str> = results.iter().map(|r| r.value.as_str()).collect();
        assert_eq!(values, vec!["A", "fallback-boom", "C"]);
        assert_eq!(results[1].reason.as_deref(), Some("panicked: model exploded"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_items_time_out_independently() {
        let settings = PipelineSettings {
            item_timeout: Duration::from_millis(100),
            concurrency: 2,
        };
        let results = run(
            vec![50u64, 500, 10, 500],
            &settings,
            |ms| async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok::<_, String>(ms)
            },
            |_| 0,
        )
        .await;

        let flags: Vec<bool> = results.iter().map(|r| r.is_fallback).collect();
        assert_eq!(flags, vec![false, true, false, true]);
        assert!(BatchSummary::of(&results).total == 4);
        assert!(!BatchSummary::of(&results).all_degraded());
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let settings = PipelineSettings::default();
        let results = run(Vec::<u8>::new(), &settings, |n| async move { Ok::<_, String>(n) }, |n| *n).await;
        assert!(results.is_empty());
        assert!(!BatchSummary::of(&results).all_degraded());
    }
}
