//! Invocation context and completion handling.
//!
//! A handler settles its invocation through [`InvocationContext::done`]. The
//! first settlement is written into a one-shot slot; every later call is
//! dropped. The evaluator waits on the matching [`Settlement`] and feeds the
//! result through [`classify`].

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use log::debug;
use serde_json::Value;
use simple_error::SimpleError;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::Error;

/// What a handler passes as the `result` argument of `done`.
pub enum HandlerResult {
    /// Nothing was returned.
    Empty,
    Value(Value),
    /// An error handed back as a value rather than through the error slot.
    Failed(Error),
    /// A result that is not available yet.
    Deferred(BoxFuture<'static, Result<Value, Error>>),
}

impl HandlerResult {
    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = Result<Value, Error>> + Send + 'static,
    {
        HandlerResult::Deferred(future.boxed())
    }
}

impl From<Value> for HandlerResult {
    fn from(value: Value) -> Self {
        HandlerResult::Value(value)
    }
}

impl fmt::Debug for HandlerResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerResult::Empty => write!(f, "Empty"),
            HandlerResult::Value(value) => f.debug_tuple("Value").field(value).finish(),
            HandlerResult::Failed(err) => f.debug_tuple("Failed").field(err).finish(),
            HandlerResult::Deferred(_) => write!(f, "Deferred(..)"),
        }
    }
}

/// The `(error, result)` pair a handler completed with.
#[derive(Debug)]
pub struct Completion {
    pub error: Option<Error>,
    pub result: HandlerResult,
}

impl Completion {
    pub fn failed<E: Into<Error>>(error: E) -> Self {
        Self {
            error: Some(error.into()),
            result: HandlerResult::Empty,
        }
    }
}

/// Terminal classification of a completion.
pub enum InvocationOutcome {
    Error(Error),
    Deferred(BoxFuture<'static, Result<Value, Error>>),
    /// `None` when the handler returned nothing.
    Value(Option<Value>),
}

impl fmt::Debug for InvocationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvocationOutcome::Error(err) => f.debug_tuple("Error").field(err).finish(),
            InvocationOutcome::Deferred(_) => write!(f, "Deferred(..)"),
            InvocationOutcome::Value(value) => f.debug_tuple("Value").field(value).finish(),
        }
    }
}

/// Classifies a completion. An error argument wins over any result.
pub fn classify(completion: Completion) -> InvocationOutcome {
    if let Some(err) = completion.error {
        return InvocationOutcome::Error(err);
    }
    match completion.result {
        HandlerResult::Deferred(future) => InvocationOutcome::Deferred(future),
        HandlerResult::Failed(err) => InvocationOutcome::Error(err),
        HandlerResult::Value(value) => InvocationOutcome::Value(Some(value)),
        HandlerResult::Empty => InvocationOutcome::Value(None),
    }
}

type Slot = Arc<Mutex<Option<oneshot::Sender<Completion>>>>;

// Stand-in deadline for timeouts too large to add to the current instant.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

/// The error an invocation settles with once its deadline passes.
pub fn timed_out(timeout: Duration) -> Error {
    Box::new(SimpleError::new(format!(
        "Task timed out after {:.2} seconds",
        timeout.as_secs_f64()
    )))
}

/// Per-invocation context handed to the handler.
#[derive(Clone)]
pub struct InvocationContext {
    pub aws_request_id: String,
    pub function_name: String,
    deadline: Instant,
    slot: Slot,
}

impl fmt::Debug for InvocationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationContext")
            .field("aws_request_id", &self.aws_request_id)
            .field("function_name", &self.function_name)
            .field("settled", &self.is_settled())
            .finish()
    }
}

impl InvocationContext {
    pub fn new(function_name: &str, timeout: Duration) -> (Self, Settlement) {
        let (sender, receiver) = oneshot::channel();
        let deadline = deadline_after(timeout);
        let context = Self {
            aws_request_id: nanoid::nanoid!(),
            function_name: function_name.to_string(),
            deadline,
            slot: Arc::new(Mutex::new(Some(sender))),
        };
        let settlement = Settlement {
            receiver,
            deadline,
            timeout,
        };
        (context, settlement)
    }

    /// Settles the invocation. Only the first call has any effect.
    pub fn done(&self, error: Option<Error>, result: HandlerResult) {
        let sender = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(sender) => {
                // The receiver is gone once the invocation timed out.
                let _ = sender.send(Completion { error, result });
            }
            None => debug!(
                "Ignoring repeated completion of {} ({})",
                self.function_name, self.aws_request_id
            ),
        }
    }

    pub fn succeed<R: Into<HandlerResult>>(&self, result: R) {
        self.done(None, result.into());
    }

    pub fn fail<E: Into<Error>>(&self, error: E) {
        self.done(Some(error.into()), HandlerResult::Empty);
    }

    pub fn is_settled(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    pub fn remaining_time(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// The evaluator's end of the completion slot.
pub struct Settlement {
    receiver: oneshot::Receiver<Completion>,
    deadline: Instant,
    timeout: Duration,
}

impl Settlement {
    /// When the invocation times out. Deferred results are held to it too.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Waits for the first completion. A context dropped without settling,
    /// or a deadline that passes first, completes with an error.
    pub async fn wait(self) -> Completion {
        match tokio::time::timeout_at(self.deadline, self.receiver).await {
            Ok(Ok(completion)) => completion,
            Ok(Err(_)) => Completion::failed(SimpleError::new(
                "Function finished without calling back",
            )),
            Err(_) => Completion::failed(timed_out(self.timeout)),
        }
    }
}
