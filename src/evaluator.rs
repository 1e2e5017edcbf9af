//! The per-authorizer authentication scheme.

use std::sync::Arc;

use http::request::Parts;
use log::{debug, error};
use serde_json::json;

use crate::apigateway::{method_arn, AuthorizationEvent};
use crate::config::AuthorizerConfig;
use crate::context::{classify, timed_out, InvocationContext, InvocationOutcome};
use crate::environment::{EnvironmentReset, ProcessEnvironment};
use crate::harness::FunctionHarness;
use crate::policy::{authorize, AuthFailure, Credentials};
use crate::Error;

/// Authenticates requests against one authorizer function.
///
/// Built once from a validated [`AuthorizerConfig`]; [`authenticate`] is then
/// called once per inbound request. The only state shared between requests
/// is the process environment the [`EnvironmentReset`] manages.
///
/// [`authenticate`]: AuthorizationSchemeEvaluator::authenticate
pub struct AuthorizationSchemeEvaluator {
    config: AuthorizerConfig,
    harness: Arc<dyn FunctionHarness>,
    environment: Arc<dyn EnvironmentReset>,
}

impl AuthorizationSchemeEvaluator {
    pub fn new(config: AuthorizerConfig, harness: Arc<dyn FunctionHarness>) -> Self {
        Self {
            config,
            harness,
            environment: Arc::new(ProcessEnvironment),
        }
    }

    pub fn with_environment(mut self, environment: Arc<dyn EnvironmentReset>) -> Self {
        self.environment = environment;
        self
    }

    pub fn config(&self) -> &AuthorizerConfig {
        &self.config
    }

    /// Builds the event for `request`, routed to the endpoint registered as
    /// `endpoint_path`. A missing header is passed on as a missing token.
    pub fn authorization_event(&self, request: &Parts, endpoint_path: &str) -> AuthorizationEvent {
        let token = request
            .headers
            .get(&self.config.identity_header)
            .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned());

        debug!(
            "Retrieved {} header {:?} for {} {}",
            self.config.identity_header, token, request.method, request.uri
        );

        AuthorizationEvent::token(
            token,
            method_arn(
                &self.config.deployment.region,
                &self.config.deployment.stage,
                &self.config.function_name,
                endpoint_path,
            ),
        )
    }

    /// Runs the authorizer function for `request` and returns the credentials
    /// to continue with, or the response to reject it with.
    pub async fn authenticate(
        &self,
        request: &Parts,
        endpoint_path: &str,
    ) -> Result<Credentials, AuthFailure> {
        let function_name = &self.config.function_name;
        let event = self.authorization_event(request, endpoint_path);
        let method_arn = event.method_arn.clone();

        self.environment.reset(&self.config.environment);

        let handler = self
            .harness
            .create_handler(
                &self.config.runtime,
                &self.config.function,
                &self.config.deployment,
            )
            .map_err(|e| {
                error!("Error while loading authorizer (function: {}): {}", function_name, e);
                AuthFailure::Internal(format!(
                    "Error while loading authorizer {}: {}",
                    function_name, e
                ))
            })?;

        let (context, settlement) = InvocationContext::new(function_name, self.config.timeout);
        debug!(
            "Invoking authorizer {} ({}) with {}",
            function_name,
            context.aws_request_id,
            json!(event)
        );

        // Never joined: the function runs on until it finishes or times out.
        tokio::spawn(async move {
            handler.handle(event, context).await;
        });

        let deadline = settlement.deadline();
        let policy = match classify(settlement.wait().await) {
            InvocationOutcome::Error(e) => return Err(self.denied(e)),
            InvocationOutcome::Deferred(deferred) => {
                match tokio::time::timeout_at(deadline, deferred).await {
                    Ok(Ok(policy)) => Some(policy),
                    Ok(Err(e)) => return Err(self.denied(e)),
                    Err(_) => return Err(self.denied(timed_out(self.config.timeout))),
                }
            }
            InvocationOutcome::Value(policy) => policy,
        };

        authorize(function_name, policy, &method_arn)
    }

    fn denied(&self, cause: Error) -> AuthFailure {
        error!(
            "Authorization function returned an error response (function: {}): {}",
            self.config.function_name, cause
        );
        AuthFailure::unauthorized()
    }
}
