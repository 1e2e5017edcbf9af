//! Offline emulation of an API Gateway TOKEN custom authorizer.
//!
//! An [`AuthorizationSchemeEvaluator`] is built once per authorizer function
//! and then authenticates inbound requests: it pulls the bearer token out of
//! the configured header, invokes the authorizer function through a
//! [`FunctionHarness`], and turns the returned policy into [`Credentials`] or
//! an [`AuthFailure`].

pub mod apigateway;
pub mod config;
pub mod context;
pub mod environment;
pub mod evaluator;
pub mod harness;
pub mod policy;

pub use apigateway::AuthorizationEvent;
pub use config::{AuthorizerConfig, ConfigError, DeploymentOptions, FunctionDefinition};
pub use context::{HandlerResult, InvocationContext, InvocationOutcome};
pub use environment::{EnvironmentReset, ProcessEnvironment};
pub use evaluator::AuthorizationSchemeEvaluator;
pub use harness::{handler_fn, CommandHarness, FunctionHarness, Handler, StaticHarness};
pub use policy::{AuthFailure, Credentials};

/// Error type used across collaborator boundaries (handlers, harnesses).
pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;
