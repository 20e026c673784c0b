//! Concurrent tool execution with deduplication, parallelism capping, and
//! per-call timeouts.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::ToolError;
use crate::models::tool::{Tool, ToolCall, ToolResult};

/// The capability interface the engine executes tools against. Implemented
/// by the MCP host, the knowledge base, or whatever the embedding
/// application wires in.
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    fn list_tools(&self) -> Vec<Tool>;

    async fn execute(&self, name: &str, arguments: &Value) -> Result<String, ToolError>;
}

#[derive(Debug, Clone)]
pub struct ToolExecutionConfig {
    pub max_parallel_tools: usize,
    pub timeout: Duration,
    /// Structural provision; no retry behavior is attached yet.
    pub retry_attempts: u32,
    pub enable_deduplication: bool,
}

impl Default for ToolExecutionConfig {
    fn default() -> Self {
        Self {
            max_parallel_tools: 5,
            timeout: Duration::from_millis(30_000),
            retry_attempts: 0,
            enable_deduplication: true,
        }
    }
}

pub struct ToolExecutionManager {
    config: ToolExecutionConfig,
}

impl ToolExecutionManager {
    pub fn new(config: ToolExecutionConfig) -> Self {
        Self { config }
    }

    /// Execute a batch of calls and return one result per input call.
    ///
    /// Calls sharing a `(name, arguments)` pair execute once; each
    /// duplicate gets a value-identical result under its own id. Unique
    /// calls run in chunks of `max_parallel_tools`: everything inside a
    /// chunk runs concurrently, chunks run strictly one after another.
    /// Callers correlate by id or name, not by position.
    pub async fn execute_batch(
        &self,
        calls: &[ToolCall],
        registry: &dyn ToolRegistry,
        cancel: &CancellationToken,
    ) -> Vec<ToolResult> {
        let unique: Vec<&ToolCall> = if self.config.enable_deduplication {
            let mut seen = std::collections::HashSet::new();
            calls
                .iter()
                .filter(|call| seen.insert(call.dedup_key()))
                .collect()
        } else {
            calls.iter().collect()
        };

        let mut outcomes: HashMap<String, (String, bool, Duration)> = HashMap::new();
        'chunks: for chunk in unique.chunks(self.config.max_parallel_tools.max(1)) {
            if cancel.is_cancelled() {
                break;
            }
            let futures: Vec<_> = chunk
                .iter()
                .map(|call| self.execute_one(call, registry))
                .collect();

            let results = tokio::select! {
                _ = cancel.cancelled() => break 'chunks,
                results = futures::future::join_all(futures) => results,
            };
            for (call, outcome) in chunk.iter().zip(results) {
                outcomes.insert(call.dedup_key(), outcome);
            }
        }

        calls
            .iter()
            .filter_map(|call| {
                let (result, success, duration) = outcomes.get(&call.dedup_key())?.clone();
                Some(ToolResult {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    result,
                    success,
                    duration,
                })
            })
            .collect()
    }

    /// One call raced against the configured timeout. A timed-out call is
    /// recorded as failed; the underlying future is dropped best-effort and
    /// external work it started is not guaranteed to stop.
    async fn execute_one(
        &self,
        call: &ToolCall,
        registry: &dyn ToolRegistry,
    ) -> (String, bool, Duration) {
        let start = Instant::now();
        debug!(tool = %call.name, "executing tool call");

        match tokio::time::timeout(
            self.config.timeout,
            registry.execute(&call.name, &call.arguments),
        )
        .await
        {
            Ok(Ok(result)) => (result, true, start.elapsed()),
            Ok(Err(error)) => {
                let message = error.to_string();
                let classified = format!("Error ({}): {}", classify_error(&message), message);
                (classified, false, start.elapsed())
            }
            Err(_) => {
                let message = ToolError::Timeout(self.config.timeout.as_millis() as u64);
                (
                    format!("Error (timeout): {}", message),
                    false,
                    start.elapsed(),
                )
            }
        }
    }
}

impl Default for ToolExecutionManager {
    fn default() -> Self {
        Self::new(ToolExecutionConfig::default())
    }
}

/// Bucket a failure message into a coarse category the model can react to.
pub fn classify_error(message: &str) -> &'static str {
    let lower = message.to_lowercase();
    if lower.contains("timed out") || lower.contains("timeout") {
        "timeout"
    } else if lower.contains("not found") || lower.contains("unknown tool") {
        "not-found"
    } else if lower.contains("rate limit") || lower.contains("429") {
        "rate-limit"
    } else if lower.contains("unauthorized")
        || lower.contains("api key")
        || lower.contains("401")
        || lower.contains("auth")
    {
        "auth"
    } else if lower.contains("network") || lower.contains("connection") || lower.contains("dns") {
        "network"
    } else if lower.contains("invalid") || lower.contains("argument") || lower.contains("parameter")
    {
        "invalid-argument"
    } else {
        "other"
    }
}

/// Render a clearly delimited status block for optional display to the
/// caller. Never mistakable for model-generated content.
pub fn summarize(results: &[ToolResult]) -> String {
    let mut lines = vec!["--- tool results ---".to_string()];
    for result in results {
        lines.push(format!(
            "{}: {} ({}ms)",
            result.name,
            if result.success { "ok" } else { "failed" },
            result.duration.as_millis()
        ));
    }
    lines.push("--------------------".to_string());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Registry that sleeps for a fixed time and counts executions
    struct CountingRegistry {
        delay: Duration,
        executions: AtomicUsize,
    }

    impl CountingRegistry {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                executions: AtomicUsize::new(0),
            }
        }

        fn executions(&self) -> usize {
            self.executions.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ToolRegistry for CountingRegistry {
        fn list_tools(&self) -> Vec<Tool> {
            vec![Tool::new("echo", "Echoes input", json!({"type": "object"}))]
        }

        async fn execute(&self, _name: &str, arguments: &Value) -> Result<String, ToolError> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(format!("echo: {}", arguments))
        }
    }

    struct FailingRegistry;

    #[async_trait]
    impl ToolRegistry for FailingRegistry {
        fn list_tools(&self) -> Vec<Tool> {
            vec![]
        }

        async fn execute(&self, name: &str, _arguments: &Value) -> Result<String, ToolError> {
            Err(ToolError::NotFound(name.to_string()))
        }
    }

    fn calls(count: usize) -> Vec<ToolCall> {
        (0..count)
            .map(|i| ToolCall::new("echo", json!({"n": i})).with_id(format!("call_{}", i)))
            .collect()
    }

    #[tokio::test]
    async fn test_duplicates_execute_once_but_all_ids_answered() {
        let registry = CountingRegistry::new(Duration::ZERO);
        let manager = ToolExecutionManager::default();

        let batch = vec![
            ToolCall::new("echo", json!({"n": 1})).with_id("a"),
            ToolCall::new("echo", json!({"n": 1})).with_id("b"),
            ToolCall::new("echo", json!({"n": 2})).with_id("c"),
        ];
        let results = manager
            .execute_batch(&batch, &registry, &CancellationToken::new())
            .await;

        assert_eq!(registry.executions(), 2);
        assert_eq!(results.len(), 3);

        let by_id: HashMap<_, _> = results
            .iter()
            .map(|r| (r.id.clone().unwrap(), r))
            .collect();
        assert_eq!(by_id["a"].result, by_id["b"].result);
        assert_ne!(by_id["a"].result, by_id["c"].result);
    }

    #[tokio::test]
    async fn test_dedup_can_be_disabled() {
        let registry = CountingRegistry::new(Duration::ZERO);
        let manager = ToolExecutionManager::new(ToolExecutionConfig {
            enable_deduplication: false,
            ..Default::default()
        });

        let batch = vec![
            ToolCall::new("echo", json!({"n": 1})).with_id("a"),
            ToolCall::new("echo", json!({"n": 1})).with_id("b"),
        ];
        manager
            .execute_batch(&batch, &registry, &CancellationToken::new())
            .await;

        assert_eq!(registry.executions(), 2);
    }

    #[tokio::test]
    async fn test_batched_parallelism() {
        // 12 calls of 100ms at a cap of 5 is 3 chunks: roughly 300ms, well
        // under the 1200ms of sequential execution and over a single 100ms
        // chunk.
        let registry = CountingRegistry::new(Duration::from_millis(100));
        let manager = ToolExecutionManager::new(ToolExecutionConfig {
            max_parallel_tools: 5,
            ..Default::default()
        });

        let start = Instant::now();
        let results = manager
            .execute_batch(&calls(12), &registry, &CancellationToken::new())
            .await;
        let elapsed = start.elapsed();

        assert_eq!(results.len(), 12);
        assert_eq!(registry.executions(), 12);
        assert!(elapsed >= Duration::from_millis(300), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(900), "{:?}", elapsed);
    }

    #[tokio::test]
    async fn test_timeout_recorded_as_failure() {
        let registry = CountingRegistry::new(Duration::from_millis(200));
        let manager = ToolExecutionManager::new(ToolExecutionConfig {
            timeout: Duration::from_millis(50),
            ..Default::default()
        });

        let batch = calls(1);
        let results = manager
            .execute_batch(&batch, &registry, &CancellationToken::new())
            .await;

        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
        assert!(results[0].result.contains("timeout"));
    }

    #[tokio::test]
    async fn test_failures_are_results_not_errors() {
        let manager = ToolExecutionManager::default();
        let batch = vec![ToolCall::new("missing_tool", json!({})).with_id("x")];
        let results = manager
            .execute_batch(&batch, &FailingRegistry, &CancellationToken::new())
            .await;

        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
        assert!(results[0].result.contains("not-found"));
        assert!(results[0].result.contains("missing_tool"));
    }

    #[tokio::test]
    async fn test_cancelled_batch_stops_early() {
        let registry = CountingRegistry::new(Duration::from_millis(100));
        let manager = ToolExecutionManager::new(ToolExecutionConfig {
            max_parallel_tools: 2,
            ..Default::default()
        });

        let cancel = CancellationToken::new();
        cancel.cancel();
        let results = manager.execute_batch(&calls(6), &registry, &cancel).await;

        assert!(results.is_empty());
        assert_eq!(registry.executions(), 0);
    }

    #[test]
    fn test_classify_error() {
        assert_eq!(classify_error("operation timed out"), "timeout");
        assert_eq!(classify_error("Tool not found: x"), "not-found");
        assert_eq!(classify_error("429 rate limit exceeded"), "rate-limit");
        assert_eq!(classify_error("Unauthorized: bad api key"), "auth");
        assert_eq!(classify_error("connection refused"), "network");
        assert_eq!(classify_error("Invalid parameters: q"), "invalid-argument");
        assert_eq!(classify_error("something odd"), "other");
    }

    #[test]
    fn test_summarize_block() {
        let results = vec![
            ToolResult {
                id: Some("a".into()),
                name: "web_search".into(),
                result: "ok".into(),
                success: true,
                duration: Duration::from_millis(120),
            },
            ToolResult {
                id: Some("b".into()),
                name: "read_file".into(),
                result: "Error (timeout): ...".into(),
                success: false,
                duration: Duration::from_millis(30_000),
            },
        ];
        let block = summarize(&results);
        assert!(block.starts_with("--- tool results ---"));
        assert!(block.contains("web_search: ok (120ms)"));
        assert!(block.contains("read_file: failed (30000ms)"));
    }
}
