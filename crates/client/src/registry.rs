//! The function registry: a mapping from function name to a type-erased
//! invoker that decodes an argument array, calls the typed function, and
//! encodes the result.
//!
//! Argument and output type tags are minted from the registered value
//! types. The tags are stable, language-neutral names (`int`, `float`,
//! `str`, `bool`, `bytes`, `data`) recorded in task inputs/outputs and
//! validated when graphs are built and submitted.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use spider_core::data::DATA_TAG;
use spider_core::envelope::{pack_value, unpack_value, CodecError};
use spider_core::error::FunctionInvokeError;

use crate::context::TaskContext;

/// Failure modes a task function can produce.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// Cancels the whole job, recording the message for the client.
    #[error("task aborted: {0}")]
    Abort(String),
    /// Ordinary execution failure; the job fails once retries run out.
    #[error("{0}")]
    Execution(String),
}

impl TaskError {
    pub fn abort(message: impl Into<String>) -> Self {
        TaskError::Abort(message.into())
    }

    pub fn execution(message: impl Into<String>) -> Self {
        TaskError::Execution(message.into())
    }
}

/// A value type that can cross the task boundary.
pub trait TaskValue: Serialize + DeserializeOwned + Send + 'static {
    /// Stable, portable tag recorded in task inputs and outputs.
    const TAG: &'static str;
}

impl TaskValue for i64 {
    const TAG: &'static str = "int";
}

impl TaskValue for f64 {
    const TAG: &'static str = "float";
}

impl TaskValue for String {
    const TAG: &'static str = "str";
}

impl TaskValue for bool {
    const TAG: &'static str = "bool";
}

impl TaskValue for Vec<u8> {
    const TAG: &'static str = "bytes";
}

/// Reference to a stored datum, passed between tasks by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRef(pub Uuid);

impl TaskValue for DataRef {
    const TAG: &'static str = DATA_TAG;
}

/// Positional argument tuples of a task function.
pub trait TaskArgs: Sized + Send + 'static {
    fn tags() -> Vec<&'static str>;

    fn decode(buffers: &[Vec<u8>]) -> Result<Self, CodecError>;

    fn encode(&self) -> Result<Vec<Vec<u8>>, CodecError>;
}

impl TaskArgs for () {
    fn tags() -> Vec<&'static str> {
        Vec::new()
    }

    fn decode(buffers: &[Vec<u8>]) -> Result<Self, CodecError> {
        if !buffers.is_empty() {
            return Err(CodecError::Invalid("expected no arguments".to_string()));
        }
        Ok(())
    }

    fn encode(&self) -> Result<Vec<Vec<u8>>, CodecError> {
        Ok(Vec::new())
    }
}

macro_rules! impl_task_args {
    ($($ty:ident : $idx:tt),+) => {
        impl<$($ty: TaskValue),+> TaskArgs for ($($ty,)+) {
            fn tags() -> Vec<&'static str> {
                vec![$($ty::TAG),+]
            }

            fn decode(buffers: &[Vec<u8>]) -> Result<Self, CodecError> {
                let expected = <Self as TaskArgs>::tags().len();
                if buffers.len() != expected {
                    return Err(CodecError::Invalid(format!(
                        "expected {expected} arguments, got {}",
                        buffers.len()
                    )));
                }
                Ok(($(unpack_value::<$ty>(&buffers[$idx])?,)+))
            }

            fn encode(&self) -> Result<Vec<Vec<u8>>, CodecError> {
                Ok(vec![$(pack_value(&self.$idx)?),+])
            }
        }
    };
}

impl_task_args!(A: 0);
impl_task_args!(A: 0, B: 1);
impl_task_args!(A: 0, B: 1, C: 2);
impl_task_args!(A: 0, B: 1, C: 2, D: 3);

/// Output values of a task function: a single value or a tuple.
pub trait TaskOutputs: Sized + Send + 'static {
    fn tags() -> Vec<&'static str>;

    fn encode(self) -> Result<Vec<Vec<u8>>, CodecError>;

    fn decode(buffers: &[Vec<u8>]) -> Result<Self, CodecError>;
}

macro_rules! impl_single_output {
    ($($ty:ty),+) => {
        $(
            impl TaskOutputs for $ty {
                fn tags() -> Vec<&'static str> {
                    vec![<$ty as TaskValue>::TAG]
                }

                fn encode(self) -> Result<Vec<Vec<u8>>, CodecError> {
                    Ok(vec![pack_value(&self)?])
                }

                fn decode(buffers: &[Vec<u8>]) -> Result<Self, CodecError> {
                    if buffers.len() != 1 {
                        return Err(CodecError::Invalid(format!(
                            "expected 1 result, got {}",
                            buffers.len()
                        )));
                    }
                    unpack_value(&buffers[0])
                }
            }
        )+
    };
}

impl_single_output!(i64, f64, String, bool, Vec<u8>, DataRef);

macro_rules! impl_tuple_outputs {
    ($($ty:ident : $idx:tt),+) => {
        impl<$($ty: TaskValue),+> TaskOutputs for ($($ty,)+) {
            fn tags() -> Vec<&'static str> {
                vec![$($ty::TAG),+]
            }

            fn encode(self) -> Result<Vec<Vec<u8>>, CodecError> {
                Ok(vec![$(pack_value(&self.$idx)?),+])
            }

            fn decode(buffers: &[Vec<u8>]) -> Result<Self, CodecError> {
                let expected = <Self as TaskOutputs>::tags().len();
                if buffers.len() != expected {
                    return Err(CodecError::Invalid(format!(
                        "expected {expected} results, got {}",
                        buffers.len()
                    )));
                }
                Ok(($(unpack_value::<$ty>(&buffers[$idx])?,)+))
            }
        }
    };
}

impl_tuple_outputs!(A: 0, B: 1);
impl_tuple_outputs!(A: 0, B: 1, C: 2);
impl_tuple_outputs!(A: 0, B: 1, C: 2, D: 3);

/// Result of invoking a registered function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvokeOutcome {
    /// One encoded fragment per output position.
    Success(Vec<Vec<u8>>),
    Error(FunctionInvokeError, String),
    /// The function requested a job-wide cancel.
    Abort(String),
}

type BoxedInvoker = Arc<
    dyn Fn(TaskContext, Vec<Vec<u8>>) -> Pin<Box<dyn Future<Output = InvokeOutcome> + Send>>
        + Send
        + Sync,
>;

/// A registered function: its portable signature plus the type-erased
/// invoker.
#[derive(Clone)]
pub struct TaskFunction {
    name: String,
    input_tags: Vec<&'static str>,
    output_tags: Vec<&'static str>,
    invoker: BoxedInvoker,
}

impl TaskFunction {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input_tags(&self) -> &[&'static str] {
        &self.input_tags
    }

    pub fn output_tags(&self) -> &[&'static str] {
        &self.output_tags
    }

    /// Decodes the argument fragments, runs the function, and encodes its
    /// result. Never panics on malformed input; failures map onto
    /// [`FunctionInvokeError`] codes.
    pub async fn invoke(&self, context: TaskContext, args: Vec<Vec<u8>>) -> InvokeOutcome {
        (self.invoker)(context, args).await
    }
}

impl std::fmt::Debug for TaskFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskFunction")
            .field("name", &self.name)
            .field("input_tags", &self.input_tags)
            .field("output_tags", &self.output_tags)
            .finish()
    }
}

/// Process-wide mapping from function name to invoker, populated when task
/// libraries are loaded.
#[derive(Debug, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, TaskFunction>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a typed async function under `name`.
    pub fn register<A, O, F, Fut>(&mut self, name: &str, handler: F)
    where
        A: TaskArgs,
        O: TaskOutputs,
        F: Fn(TaskContext, A) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<O, TaskError>> + Send + 'static,
    {
        let invoker: BoxedInvoker = Arc::new(move |context, buffers| {
            let handler = handler.clone();
            Box::pin(async move {
                let expected = A::tags().len();
                if buffers.len() != expected {
                    return InvokeOutcome::Error(
                        FunctionInvokeError::WrongNumberOfArguments,
                        format!(
                            "wrong number of arguments: expect {expected}, get {}",
                            buffers.len()
                        ),
                    );
                }
                let args = match A::decode(&buffers) {
                    Ok(args) => args,
                    Err(err) => {
                        return InvokeOutcome::Error(
                            FunctionInvokeError::ArgumentParsingError,
                            format!("cannot parse arguments: {err}"),
                        );
                    }
                };
                match handler(context, args).await {
                    Ok(outputs) => match outputs.encode() {
                        Ok(fragments) => InvokeOutcome::Success(fragments),
                        Err(err) => InvokeOutcome::Error(
                            FunctionInvokeError::ResultParsingError,
                            format!("cannot serialize result: {err}"),
                        ),
                    },
                    Err(TaskError::Abort(message)) => InvokeOutcome::Abort(message),
                    Err(TaskError::Execution(message)) => {
                        InvokeOutcome::Error(FunctionInvokeError::FunctionExecutionError, message)
                    }
                }
            })
        });
        self.functions.insert(
            name.to_string(),
            TaskFunction {
                name: name.to_string(),
                input_tags: A::tags(),
                output_tags: O::tags(),
                invoker,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&TaskFunction> {
        self.functions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.functions.keys().map(String::as_str).collect()
    }
}
