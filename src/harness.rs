// Wrapper traits around the code that actually runs authorizer functions,
// so the evaluator can be driven by in-process closures in tests.
use std::future::Future;
use std::io::ErrorKind;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error};
use simple_error::SimpleError;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::apigateway::AuthorizationEvent;
use crate::config::{DeploymentOptions, FunctionDefinition};
use crate::context::{HandlerResult, InvocationContext};
use crate::Error;

/// A loaded authorizer function.
///
/// Implementations settle the invocation through the context; whatever they
/// do after the first settlement is not observed.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, event: AuthorizationEvent, context: InvocationContext);
}

/// Loads authorizer functions. Failing here means the function could not be
/// run at all, which is reported differently from a denial.
pub trait FunctionHarness: Send + Sync {
    fn create_handler(
        &self,
        runtime: &str,
        function: &FunctionDefinition,
        options: &DeploymentOptions,
    ) -> Result<Arc<dyn Handler>, Error>;
}

pub struct HandlerFn<F> {
    f: F,
}

/// Adapts an async closure into a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(AuthorizationEvent, InvocationContext) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(AuthorizationEvent, InvocationContext) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn handle(&self, event: AuthorizationEvent, context: InvocationContext) {
        (self.f)(event, context).await
    }
}

/// Hands out one pre-loaded handler, or always fails to load.
pub struct StaticHarness {
    handler: Result<Arc<dyn Handler>, String>,
}

impl StaticHarness {
    pub fn new<H: Handler + 'static>(handler: H) -> StaticHarness {
        StaticHarness {
            handler: Ok(Arc::new(handler)),
        }
    }

    pub fn failing(message: &str) -> StaticHarness {
        StaticHarness {
            handler: Err(message.to_string()),
        }
    }
}

impl FunctionHarness for StaticHarness {
    fn create_handler(
        &self,
        _runtime: &str,
        _function: &FunctionDefinition,
        _options: &DeploymentOptions,
    ) -> Result<Arc<dyn Handler>, Error> {
        match &self.handler {
            Ok(handler) => Ok(handler.clone()),
            Err(message) => Err(Box::new(SimpleError::new(message.as_str()))),
        }
    }
}

/// Runs the function's `handler` as a shell command.
///
/// The event is written to stdin as JSON and the policy is read back from
/// stdout. A non-zero exit status is the function denying the request. A
/// command still running at the invocation deadline is killed.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandHarness;

impl FunctionHarness for CommandHarness {
    fn create_handler(
        &self,
        runtime: &str,
        function: &FunctionDefinition,
        _options: &DeploymentOptions,
    ) -> Result<Arc<dyn Handler>, Error> {
        let command = function.handler.trim();
        if command.is_empty() {
            return Err(Box::new(SimpleError::new(
                "No handler command defined for function",
            )));
        }
        debug!("Loaded command handler `{}` for runtime {}", command, runtime);

        Ok(Arc::new(CommandHandler {
            command: command.to_string(),
        }))
    }
}

struct CommandHandler {
    command: String,
}

#[cfg(unix)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

impl CommandHandler {
    async fn run(&self, event: &AuthorizationEvent) -> Result<HandlerResult, Error> {
        let mut child = shell(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let payload = serde_json::to_vec(event)?;
        if let Some(mut stdin) = child.stdin.take() {
            // Commands are free to ignore the event and exit early.
            match stdin.write_all(&payload).await {
                Err(e) if e.kind() != ErrorKind::BrokenPipe => return Err(e.into()),
                _ => {}
            }
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(Box::new(SimpleError::new(format!(
                "`{}` exited with {}",
                self.command, output.status
            ))));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(HandlerResult::Empty);
        }
        Ok(HandlerResult::Value(serde_json::from_str(stdout.trim())?))
    }
}

#[async_trait]
impl Handler for CommandHandler {
    async fn handle(&self, event: AuthorizationEvent, context: InvocationContext) {
        // Dropping `run` at the deadline kills the child.
        let outcome = match tokio::time::timeout(context.remaining_time(), self.run(&event)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Box::new(SimpleError::new(format!(
                "`{}` did not finish before the deadline",
                self.command
            ))) as Error),
        };
        match outcome {
            Ok(result) => context.succeed(result),
            Err(e) => {
                error!("Authorizer command `{}` failed: {}", self.command, e);
                context.fail(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{classify, InvocationOutcome};
    use serde_json::json;
    use spectral::prelude::*;
    use std::time::Duration;

    fn function(handler: &str) -> FunctionDefinition {
        FunctionDefinition {
            handler: handler.to_string(),
            ..FunctionDefinition::default()
        }
    }

    async fn invoke(handler: Arc<dyn Handler>, token: Option<&str>) -> InvocationOutcome {
        invoke_within(handler, token, Duration::from_secs(5)).await
    }

    async fn invoke_within(
        handler: Arc<dyn Handler>,
        token: Option<&str>,
        timeout: Duration,
    ) -> InvocationOutcome {
        let (context, settlement) = InvocationContext::new("authorizerFunc", timeout);
        let event = AuthorizationEvent::token(token.map(str::to_string), "arn:test".to_string());
        handler.handle(event, context).await;
        classify(settlement.wait().await)
    }

    #[test]
    fn test_static_harness_failing_reports_load_error() {
        let harness = StaticHarness::failing("Cannot find module 'handler'");

        let result = harness.create_handler("provided", &function("h"), &DeploymentOptions::default());

        match result {
            Err(e) => assert_that!(e.to_string()).is_equal_to("Cannot find module 'handler'".to_string()),
            Ok(_) => panic!("expected a load error"),
        }
    }

    #[tokio::test]
    async fn test_handler_fn_receives_event() {
        let harness = StaticHarness::new(handler_fn(|event: AuthorizationEvent, ctx: InvocationContext| async move {
            ctx.succeed(json!({ "principalId": event.authorization_token }));
        }));
        let handler = harness
            .create_handler("provided", &function("h"), &DeploymentOptions::default())
            .unwrap();

        let outcome = invoke(handler, Some("abc123")).await;

        assert!(matches!(outcome, InvocationOutcome::Value(Some(v)) if v == json!({ "principalId": "abc123" })));
    }

    #[test]
    fn test_command_harness_requires_a_handler() {
        let result = CommandHarness.create_handler("provided", &function("   "), &DeploymentOptions::default());

        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_handler_reads_policy_from_stdout() {
        let handler = CommandHarness
            .create_handler(
                "provided",
                &function(r#"cat > /dev/null; echo '{"principalId":"cli-user"}'"#),
                &DeploymentOptions::default(),
            )
            .unwrap();

        let outcome = invoke(handler, Some("abc123")).await;

        match outcome {
            InvocationOutcome::Value(Some(value)) => {
                assert_that!(value).is_equal_to(json!({ "principalId": "cli-user" }))
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_handler_failure_is_an_error() {
        let handler = CommandHarness
            .create_handler("provided", &function("false"), &DeploymentOptions::default())
            .unwrap();

        let outcome = invoke(handler, None).await;

        assert!(matches!(outcome, InvocationOutcome::Error(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_handler_with_no_output_returns_nothing() {
        let handler = CommandHarness
            .create_handler("provided", &function("true"), &DeploymentOptions::default())
            .unwrap();

        let outcome = invoke(handler, None).await;

        assert!(matches!(outcome, InvocationOutcome::Value(None)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_still_running_at_deadline_is_killed() {
        let handler = CommandHarness
            .create_handler("provided", &function("sleep 60"), &DeploymentOptions::default())
            .unwrap();

        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            invoke_within(handler, None, Duration::from_millis(500)),
        )
        .await;

        assert!(matches!(outcome, Ok(InvocationOutcome::Error(_))));
    }
}
