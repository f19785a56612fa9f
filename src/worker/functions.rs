// src/worker/functions.rs

//! Task functions a worker knows how to run, looked up by
//! [`TaskPayload::task_type`](crate::types::TaskPayload).

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

/// Everything a task function sees.
#[derive(Debug, Clone)]
pub struct TaskInput {
    pub config: Vec<u8>,
    /// Input contents in declaration order.
    pub inputs: Vec<Bytes>,
    /// Number of outputs the task must produce.
    pub outputs: usize,
}

pub type TaskFuture = Pin<Box<dyn Future<Output = Result<Vec<Bytes>, String>> + Send>>;
pub type TaskFn = Arc<dyn Fn(TaskInput) -> TaskFuture + Send + Sync>;

#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, TaskFn>,
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("FunctionRegistry")
            .field("functions", &names)
            .finish()
    }
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in functions:
    ///
    /// - `literal`: every output is the config bytes.
    /// - `concat`: every output is the concatenation of the inputs.
    /// - `identity`: output `i` is input `i`.
    /// - `sleep`: waits for the number of milliseconds in the config, then
    ///   behaves like `concat`.
    /// - `fail`: fails with the config as the message.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("literal", |input| async move {
            let bytes = Bytes::from(input.config);
            Ok(vec![bytes; input.outputs])
        });
        registry.register("concat", |input| async move { Ok(concat(&input)) });
        registry.register("identity", |input| async move {
            if input.inputs.len() != input.outputs {
                return Err(format!(
                    "identity needs as many inputs as outputs ({} != {})",
                    input.inputs.len(),
                    input.outputs
                ));
            }
            Ok(input.inputs)
        });
        registry.register("sleep", |input| async move {
            let text = String::from_utf8_lossy(&input.config);
            let millis: u64 = text
                .trim()
                .parse()
                .map_err(|_| format!("sleep expects milliseconds, got {text:?}"))?;
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok(concat(&input))
        });
        registry.register("fail", |input| async move {
            Err(String::from_utf8_lossy(&input.config).into_owned())
        });
        registry
    }

    pub fn register<F, Fut>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(TaskInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Bytes>, String>> + Send + 'static,
    {
        let boxed: TaskFn = Arc::new(move |input| Box::pin(function(input)));
        self.functions.insert(name.into(), boxed);
    }

    pub fn get(&self, name: &str) -> Option<TaskFn> {
        self.functions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }
}

fn concat(input: &TaskInput) -> Vec<Bytes> {
    let joined: Vec<u8> = input.inputs.iter().flat_map(|b| b.iter().copied()).collect();
    vec![Bytes::from(joined); input.outputs]
}
