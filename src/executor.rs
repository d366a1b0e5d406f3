//! Store executor seam.
//!
//! The compiler never talks to a database. A [`StoreExecutor`] runs compiled
//! pipelines; [`QueryService`] glues the two together for callers that want
//! documents back.
//!
//! # Example
//!
//! ```ignore
//! use intentql::executor::{QueryService, StoreExecutor};
//!
//! async fn run(service: &QueryService<impl StoreExecutor>, intent: &QueryIntent) {
//!     let result = service.run(intent).await?;
//!     for doc in &result.documents {
//!         println!("{doc}");
//!     }
//! }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::compile::{CompileOutput, Compiler};
use crate::error::{ExecutorError, ExecutorResult};
use crate::model::QueryIntent;

/// Default timeout for a single store call (30 seconds).
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Runs an aggregation pipeline against a named collection.
#[async_trait]
pub trait StoreExecutor: Send + Sync {
    async fn execute(&self, collection: &str, pipeline: &[Value]) -> ExecutorResult<Vec<Value>>;
}

/// Documents returned by the store plus what the compiler produced.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub documents: Vec<Value>,
    pub output: CompileOutput,
}

/// Compile, then execute.
pub struct QueryService<E> {
    compiler: Compiler,
    executor: E,
    timeout: Duration,
}

impl<E: StoreExecutor> QueryService<E> {
    pub fn new(compiler: Compiler, executor: E) -> Self {
        Self {
            compiler,
            executor,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn compiler(&self) -> &Compiler {
        &self.compiler
    }

    pub async fn run(&self, intent: &QueryIntent) -> ExecutorResult<QueryResult> {
        let output = self.compiler.compile(intent);
        self.execute(output).await
    }

    /// Execute an already compiled output.
    pub async fn execute(&self, output: CompileOutput) -> ExecutorResult<QueryResult> {
        let stages = output.stage_documents();
        debug!(
            collection = %output.collection,
            stages = stages.len(),
            "executing pipeline"
        );

        let call = self.executor.execute(&output.collection, &stages);
        let documents = match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(collection = %output.collection, "store call timed out");
                return Err(ExecutorError::Timeout(self.timeout));
            }
        };

        Ok(QueryResult { documents, output })
    }
}
