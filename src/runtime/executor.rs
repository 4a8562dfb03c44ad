// Copyright Motia LLC and/or licensed to Motia LLC under one or more
// contributor license agreements. Licensed under the Elastic License 2.0;
// you may not use this file except in compliance with the Elastic License 2.0.
// This software is patent protected. We welcome discussions - reach out at support@motia.dev
// See LICENSE and PATENTS files for details.

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use tokio::sync::{mpsc, oneshot};
use tracing::Instrument;

use super::{CacheScope, ExecutionResult, FunctionLookup, Invocation, Isolate};
use crate::{config::RuntimeConfig, error::RuntimeError};

const WORKER_STACK_SIZE: usize = 16 * 1024 * 1024;

enum Job {
    Execute {
        invocation: Box<Invocation>,
        reply: oneshot::Sender<ExecutionResult>,
    },
    ClearCache(CacheScope),
}

/// Pool of engine worker threads. Each worker owns one [`Isolate`]; an
/// owner's invocations always land on the same worker so its modules stay
/// warm.
pub struct Executor {
    workers: Vec<mpsc::UnboundedSender<Job>>,
    timeout: Duration,
    next: AtomicUsize,
}

impl Executor {
    pub fn new(config: &RuntimeConfig, lookup: Arc<dyn FunctionLookup>) -> anyhow::Result<Self> {
        let count = config.workers.max(1);
        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let (sender, receiver) = mpsc::unbounded_channel();
            let config = config.clone();
            let lookup = lookup.clone();
            std::thread::Builder::new()
                .name(format!("cloudfn-engine-{index}"))
                .stack_size(WORKER_STACK_SIZE)
                .spawn(move || worker_loop(index, receiver, config, lookup))?;
            workers.push(sender);
        }

        tracing::info!(workers = count, "Engine workers started");
        Ok(Self {
            workers,
            timeout: Duration::from_millis(config.timeout_ms),
            next: AtomicUsize::new(0),
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    fn worker_for(&self, owner_id: Option<&str>) -> &mpsc::UnboundedSender<Job> {
        let index = match owner_id {
            Some(owner_id) => {
                let mut hasher = DefaultHasher::new();
                owner_id.hash(&mut hasher);
                (hasher.finish() % self.workers.len() as u64) as usize
            }
            None => self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len(),
        };
        &self.workers[index]
    }

    /// Runs `invocation` on its owner's worker. Never fails: timeouts and
    /// worker loss are reported through [`ExecutionResult::error`].
    pub async fn execute(&self, invocation: Invocation) -> ExecutionResult {
        let started = Instant::now();
        let span = tracing::debug_span!(
            "execute",
            function = %invocation.path,
            owner_id = ?invocation.owner_id,
        );

        let (reply, result) = oneshot::channel();
        let worker = self.worker_for(invocation.owner_id.as_deref());
        let job = Job::Execute {
            invocation: Box::new(invocation),
            reply,
        };
        if worker.send(job).is_err() {
            tracing::error!("Engine worker is not running");
            return ExecutionResult::failed(
                "execution engine is unavailable",
                Vec::new(),
                started.elapsed(),
            );
        }

        match tokio::time::timeout(self.timeout, result).instrument(span).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => ExecutionResult::failed(
                "execution worker stopped before returning a result",
                Vec::new(),
                started.elapsed(),
            ),
            Err(_) => {
                let timeout_ms = self.timeout.as_millis() as u64;
                tracing::warn!(timeout_ms, "Invocation timed out");
                ExecutionResult::failed(
                    RuntimeError::Timeout(timeout_ms).to_string(),
                    Vec::new(),
                    started.elapsed(),
                )
            }
        }
    }

    /// Broadcasts a cache invalidation to every worker.
    pub fn clear_cache(&self, scope: CacheScope) {
        for worker in &self.workers {
            if worker.send(Job::ClearCache(scope.clone())).is_err() {
                tracing::warn!(scope = ?scope, "Failed to reach engine worker for cache invalidation");
            }
        }
    }
}

fn worker_loop(
    index: usize,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    config: RuntimeConfig,
    lookup: Arc<dyn FunctionLookup>,
) {
    let mut isolate = match Isolate::new(&config, lookup) {
        Ok(isolate) => isolate,
        Err(err) => {
            tracing::error!(worker = index, error = %err, "Failed to start engine worker");
            return;
        }
    };

    while let Some(job) = jobs.blocking_recv() {
        match job {
            Job::Execute { invocation, reply } => {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| isolate.execute(&invocation)));
                let result = match outcome {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::error!(
                            worker = index,
                            function = %invocation.path,
                            "Engine panicked while running function"
                        );
                        isolate.reset_frames();
                        ExecutionResult::failed(
                            "execution engine crashed while running the function",
                            Vec::new(),
                            Duration::ZERO,
                        )
                    }
                };
                if reply.send(result).is_err() {
                    tracing::debug!(worker = index, "Invocation result dropped, caller gave up");
                }
            }
            Job::ClearCache(scope) => {
                let removed = isolate.clear_cache(&scope);
                tracing::debug!(worker = index, removed, "Module cache invalidated");
            }
        }
    }

    tracing::debug!(worker = index, "Engine worker stopped");
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::*;
    use crate::{function::Function, runtime::RequestContext};

    struct Fixed(Vec<Function>);

    impl FunctionLookup for Fixed {
        fn find_function(&self, owner_id: &str, name: &str) -> Option<Function> {
            self.0
                .iter()
                .find(|f| f.owner_id == owner_id && (f.name == name || f.path == name))
                .cloned()
        }

        fn published_functions(&self, owner_id: &str) -> Vec<Function> {
            self.0
                .iter()
                .filter(|f| f.owner_id == owner_id && f.published)
                .cloned()
                .collect()
        }
    }

    fn executor(config: RuntimeConfig) -> Executor {
        Executor::new(&config, Arc::new(Fixed(Vec::new()))).unwrap()
    }

    fn invocation(owner_id: &str, name: &str, compiled: &str) -> Invocation {
        Invocation {
            function_id: name.to_string(),
            owner_id: Some(owner_id.to_string()),
            name: name.to_string(),
            path: name.to_string(),
            compiled: compiled.to_string(),
            hash: crate::function::content_hash(compiled),
            request: RequestContext::default(),
            env: Arc::new(HashMap::new()),
        }
    }

    #[tokio::test]
    async fn executes_on_a_worker_thread() {
        let executor = executor(RuntimeConfig {
            workers: 2,
            ..RuntimeConfig::default()
        });
        let result = executor
            .execute(invocation("u1", "hello", "exports.default = () => 'world'"))
            .await;

        assert_eq!(result.error, None);
        assert_eq!(result.data, Some(json!("world")));
        assert_eq!(executor.worker_count(), 2);
    }

    #[tokio::test]
    async fn slow_functions_time_out() {
        let executor = executor(RuntimeConfig {
            workers: 1,
            timeout_ms: 50,
            loop_iteration_limit: u64::MAX,
            ..RuntimeConfig::default()
        });
        let spin = r#"exports.default = () => { const end = Date.now() + 300; while (Date.now() < end) {} return 1; }"#;

        let result = executor.execute(invocation("u1", "spin", spin)).await;
        assert_eq!(result.error.as_deref(), Some("Timeout: function exceeded 50ms"));
        assert_eq!(result.data, None);
    }

    #[tokio::test]
    async fn cache_invalidation_reaches_the_owner_worker() {
        let executor = executor(RuntimeConfig {
            workers: 3,
            ..RuntimeConfig::default()
        });
        let code = "globalThis.n = (globalThis.n || 0) + 1; exports.default = () => globalThis.n;";

        let first = executor.execute(invocation("u1", "count", code)).await;
        let cached = executor.execute(invocation("u1", "count", code)).await;
        assert_eq!(first.data, Some(json!(1)));
        assert_eq!(cached.data, Some(json!(1)));

        executor.clear_cache(CacheScope::Owner("u1".into()));
        let reloaded = executor.execute(invocation("u1", "count", code)).await;
        assert_eq!(reloaded.data, Some(json!(2)));
    }
}
