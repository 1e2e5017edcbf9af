//! Static authorizer configuration.
//!
//! Everything here is validated once, when the evaluator is built; requests
//! never re-check it.

use std::collections::HashMap;
use std::time::Duration;

use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

static DEFAULT_IDENTITY_SOURCE: &str = "method.request.header.Authorization";
static DEFAULT_RUNTIME: &str = "provided";
static DEFAULT_TIMEOUT_SECS: u64 = 6;

static IDENTITY_SOURCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^method\.request\.header\.((?:\w+-?)+\w+)$").unwrap());

static VARIABLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\{([^}]*)\}").unwrap());

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not resolve variable `${{{variable}}}` (function: {function})")]
    UnresolvedVariable { function: String, variable: String },

    #[error("Unterminated variable reference in `{value}` (function: {function})")]
    UnterminatedVariable { function: String, value: String },

    #[error("Invalid definition (function: {function}): {cause}")]
    Definition {
        function: String,
        #[source]
        cause: serde_json::Error,
    },

    #[error("Only TOKEN authorizers are supported, got `{kind}` (function: {function})")]
    UnsupportedType { function: String, kind: String },

    #[error(
        "Only header identity sources (method.request.header.<name>) are supported, got `{identity_source}` (function: {function})"
    )]
    UnsupportedIdentitySource {
        function: String,
        identity_source: String,
    },
}

/// Deployment-wide options shared by every function.
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentOptions {
    pub stage: String,
    pub region: String,
    pub runtime: Option<String>,
    pub environment: HashMap<String, String>,
}

impl Default for DeploymentOptions {
    fn default() -> Self {
        Self {
            stage: "dev".to_string(),
            region: "us-east-1".to_string(),
            runtime: None,
            environment: HashMap::new(),
        }
    }
}

impl DeploymentOptions {
    pub fn new(stage: &str, region: &str) -> Self {
        Self {
            stage: stage.to_string(),
            region: region.to_string(),
            ..Self::default()
        }
    }

    fn resolve(&self, variable: &str) -> Option<&str> {
        match variable.trim() {
            "opt:stage" | "self:provider.stage" | "sls:stage" => Some(&self.stage),
            "opt:region" | "self:provider.region" => Some(&self.region),
            _ => None,
        }
    }
}

/// A function as declared in the service definition.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDefinition {
    #[serde(default)]
    pub handler: String,
    pub runtime: Option<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    pub timeout: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizerOptions {
    #[serde(rename = "type")]
    kind: Option<String>,
    identity_source: Option<String>,
    result_ttl_in_seconds: Option<u64>,
}

/// Validated, frozen configuration of one authorizer function.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthorizerConfig {
    pub function_name: String,
    pub identity_header: String,
    pub runtime: String,
    pub function: FunctionDefinition,
    pub deployment: DeploymentOptions,
    /// Provider environment overlaid with the function's own.
    pub environment: HashMap<String, String>,
    pub timeout: Duration,
}

impl AuthorizerConfig {
    /// Builds the configuration from the raw function `definition` and the
    /// raw `authorizer` options of the route.
    ///
    /// `authorizer` may be a bare string (the function name) or an object
    /// with `type`, `identitySource` and `resultTtlInSeconds`. Deployment
    /// variables are interpolated in both before any field is read.
    pub fn build(
        function_name: &str,
        definition: &Value,
        authorizer: &Value,
        deployment: &DeploymentOptions,
    ) -> Result<Self, ConfigError> {
        let definition = interpolate(function_name, definition, deployment)?;
        let authorizer = interpolate(function_name, authorizer, deployment)?;

        let function: FunctionDefinition =
            serde_json::from_value(definition).map_err(|cause| ConfigError::Definition {
                function: function_name.to_string(),
                cause,
            })?;

        let options: AuthorizerOptions = match authorizer {
            Value::String(_) | Value::Null => AuthorizerOptions::default(),
            other => serde_json::from_value(other).map_err(|cause| ConfigError::Definition {
                function: function_name.to_string(),
                cause,
            })?,
        };

        if let Some(kind) = &options.kind {
            if !kind.eq_ignore_ascii_case("token") {
                return Err(ConfigError::UnsupportedType {
                    function: function_name.to_string(),
                    kind: kind.clone(),
                });
            }
        }

        let identity_source = options
            .identity_source
            .as_deref()
            .unwrap_or(DEFAULT_IDENTITY_SOURCE);
        let identity_header = parse_identity_source(identity_source).ok_or_else(|| {
            ConfigError::UnsupportedIdentitySource {
                function: function_name.to_string(),
                identity_source: identity_source.to_string(),
            }
        })?;

        if let Some(ttl) = options.result_ttl_in_seconds.filter(|ttl| *ttl > 0) {
            warn!(
                "resultTtlInSeconds={} is ignored offline, every request invokes the authorizer (function: {})",
                ttl, function_name
            );
        }

        let runtime = function
            .runtime
            .clone()
            .or_else(|| deployment.runtime.clone())
            .unwrap_or_else(|| DEFAULT_RUNTIME.to_string());

        let mut environment = deployment.environment.clone();
        environment.extend(function.environment.clone());

        let timeout = Duration::from_secs(function.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS));

        debug!(
            "Configured authorizer {} reading header `{}` on runtime {}",
            function_name, identity_header, runtime
        );

        Ok(Self {
            function_name: function_name.to_string(),
            identity_header,
            runtime,
            function,
            deployment: deployment.clone(),
            environment,
            timeout,
        })
    }
}

/// Returns the lower-cased header name of a `method.request.header.<name>`
/// identity source.
pub fn parse_identity_source(identity_source: &str) -> Option<String> {
    IDENTITY_SOURCE
        .captures(identity_source)
        .and_then(|caps| caps.get(1))
        .map(|name| name.as_str().to_ascii_lowercase())
}

fn interpolate(
    function_name: &str,
    value: &Value,
    deployment: &DeploymentOptions,
) -> Result<Value, ConfigError> {
    Ok(match value {
        Value::String(s) => Value::String(interpolate_str(function_name, s, deployment)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| interpolate(function_name, item, deployment))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), interpolate(function_name, item, deployment)?);
            }
            Value::Object(out)
        }
        other => other.clone(),
    })
}

fn interpolate_str(
    function_name: &str,
    value: &str,
    deployment: &DeploymentOptions,
) -> Result<String, ConfigError> {
    if !value.contains("${") {
        return Ok(value.to_string());
    }

    let mut out = String::with_capacity(value.len());
    let mut last = 0;
    for caps in VARIABLE.captures_iter(value) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let resolved = deployment.resolve(name.as_str()).ok_or_else(|| {
            ConfigError::UnresolvedVariable {
                function: function_name.to_string(),
                variable: name.as_str().trim().to_string(),
            }
        })?;
        out.push_str(&value[last..whole.start()]);
        out.push_str(resolved);
        last = whole.end();
    }

    let rest = &value[last..];
    if rest.contains("${") {
        return Err(ConfigError::UnterminatedVariable {
            function: function_name.to_string(),
            value: value.to_string(),
        });
    }
    out.push_str(rest);
    Ok(out)
}
