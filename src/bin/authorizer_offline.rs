use std::sync::Arc;

use http::header::{HeaderName, HeaderValue};
use http::request::Parts;
use http::Request;
use log::{debug, info};
use offline_authorizer::{
    AuthFailure, AuthorizationSchemeEvaluator, AuthorizerConfig, CommandHarness,
    DeploymentOptions, Error,
};
use serde_json::{json, Value};
use simple_error::SimpleError;

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_ansi(false)
        .without_time()
        .json()
        .init();

    let definition_path = required_var("AUTHORIZER_DEFINITION")?;
    let function_name = std::env::var("AUTHORIZER_NAME").unwrap_or_else(|_| "authorizer".to_string());
    let identity_source = std::env::var("IDENTITY_SOURCE").ok();
    let stage = std::env::var("STAGE").unwrap_or_else(|_| "dev".to_string());
    let region = std::env::var("REGION").unwrap_or_else(|_| "us-east-1".to_string());
    let method = std::env::var("REQUEST_METHOD").unwrap_or_else(|_| "GET".to_string());
    let path = std::env::var("REQUEST_PATH").unwrap_or_else(|_| "/".to_string());
    let endpoint_path = std::env::var("ENDPOINT_PATH").unwrap_or_else(|_| path.clone());
    let token = std::env::var("AUTHORIZATION_TOKEN").ok();

    let definition: Value = serde_json::from_str(&std::fs::read_to_string(&definition_path)?)?;
    let authorizer = authorizer_options(&function_name, identity_source.as_deref());
    let deployment = DeploymentOptions::new(&stage, &region);

    let config = AuthorizerConfig::build(&function_name, &definition, &authorizer, &deployment)?;
    info!("Loaded authorizer {} from {}", function_name, definition_path);

    let request = build_request(&method, &path, &config.identity_header, token.as_deref())?;
    let evaluator = AuthorizationSchemeEvaluator::new(config, Arc::new(CommandHarness));

    match evaluator.authenticate(&request, &endpoint_path).await {
        Ok(credentials) => {
            println!("{}", json!({ "credentials": credentials }));
            Ok(())
        }
        Err(failure) => {
            println!(
                "{}",
                json!({
                    "statusCode": failure.status_code().as_u16(),
                    "message": failure.message(),
                })
            );
            std::process::exit(exit_code(&failure))
        }
    }
}

// 4 for client rejections, 5 for bad implementations; 1 stays for setup errors.
fn exit_code(failure: &AuthFailure) -> i32 {
    i32::from(failure.status_code().as_u16() / 100)
}

fn required_var(name: &str) -> Result<String, Error> {
    std::env::var(name).map_err(|_| {
        Box::new(SimpleError::new(format!(
            "A {} must be set in this tool's environment variables.",
            name
        ))) as Error
    })
}

fn authorizer_options(function_name: &str, identity_source: Option<&str>) -> Value {
    match identity_source {
        Some(identity_source) => json!({
            "name": function_name,
            "type": "TOKEN",
            "identitySource": identity_source,
        }),
        None => json!(function_name),
    }
}

// Builds the inbound request, carrying the token in the configured header.
fn build_request(
    method: &str,
    path: &str,
    identity_header: &str,
    token: Option<&str>,
) -> Result<Parts, Error> {
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(token) = token {
        builder = builder.header(
            HeaderName::from_bytes(identity_header.as_bytes())?,
            HeaderValue::from_str(token)?,
        );
    }
    let (parts, _) = builder.body(())?.into_parts();
    debug!("Request: {} {}", parts.method, parts.uri);
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use spectral::prelude::*;

    #[test]
    fn test_build_request_puts_token_in_identity_header() -> Result<(), Error> {
        let parts = build_request("POST", "/dev/users", "x-api-token", Some("abc123"))?;

        assert_that!(parts.method.as_str()).is_equal_to("POST");
        assert_that!(parts.uri.path()).is_equal_to("/dev/users");
        assert_that!(parts.headers.get("X-Api-Token").and_then(|v| v.to_str().ok()))
            .is_equal_to(Some("abc123"));

        Ok(())
    }

    #[test]
    fn test_build_request_without_token_has_no_header() -> Result<(), Error> {
        let parts = build_request("GET", "/", "authorization", None)?;

        assert_that!(parts.headers.is_empty()).is_true();

        Ok(())
    }

    #[test]
    fn test_build_request_rejects_invalid_method() {
        assert_that!(build_request("NOT A METHOD", "/", "authorization", None)).is_err();
    }

    #[test]
    fn test_exit_code_follows_status_class() {
        assert_that!(exit_code(&AuthFailure::unauthorized())).is_equal_to(4);
        assert_that!(exit_code(&AuthFailure::Forbidden("no".to_string()))).is_equal_to(4);
        assert_that!(exit_code(&AuthFailure::BadImplementation("bad".to_string()))).is_equal_to(5);
        assert_that!(exit_code(&AuthFailure::Internal("load".to_string()))).is_equal_to(5);
    }

    #[test]
    fn test_authorizer_options_defaults_to_bare_name() {
        assert_that!(authorizer_options("auth", None)).is_equal_to(json!("auth"));
        assert_that!(authorizer_options("auth", Some("method.request.header.X-Token")))
            .is_equal_to(json!({
                "name": "auth",
                "type": "TOKEN",
                "identitySource": "method.request.header.X-Token",
            }));
    }
}
