//! Validation of the policy an authorizer function returns, and its
//! translation into credentials or a rejection.

use http::StatusCode;
use log::{error, info};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::apigateway::APIGatewayCustomAuthorizerPolicy;

/// Credentials handed to the rest of the request pipeline.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Credentials {
    pub user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Map<String, Value>>,
}

/// Why a request was not allowed through.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthFailure {
    /// The function denied the request.
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    /// The function returned something no real gateway would accept.
    #[error("{0}")]
    BadImplementation(String),
    /// The function could not be run.
    #[error("{0}")]
    Internal(String),
}

impl AuthFailure {
    pub fn unauthorized() -> Self {
        AuthFailure::Unauthorized("Unauthorized".to_string())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AuthFailure::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AuthFailure::Forbidden(_) => StatusCode::FORBIDDEN,
            AuthFailure::BadImplementation(_) | AuthFailure::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn message(&self) -> &str {
        match self {
            AuthFailure::Unauthorized(message)
            | AuthFailure::Forbidden(message)
            | AuthFailure::BadImplementation(message)
            | AuthFailure::Internal(message) => message,
        }
    }
}

/// Validates `policy` and turns it into credentials for `method_arn`.
///
/// `None` means the function returned nothing at all.
pub fn authorize(
    function_name: &str,
    policy: Option<Value>,
    method_arn: &str,
) -> Result<Credentials, AuthFailure> {
    let policy = policy.unwrap_or(Value::Null);

    let serialized = serde_json::to_string(&policy).map_err(|e| {
        reject(
            function_name,
            AuthFailure::BadImplementation(format!("Authorizer response is not serializable: {}", e)),
        )
    })?;
    if let Some(position) = serialized.find("\\\"") {
        return Err(reject(
            function_name,
            AuthFailure::BadImplementation(format!(
                "Authorizer response contains an escaped quote at position {}: {}",
                position, serialized
            )),
        ));
    }

    let principal_id = match policy.get("principalId") {
        Some(principal) if !is_falsy(principal) => principal,
        _ => {
            return Err(reject(
                function_name,
                AuthFailure::Forbidden("No principalId set on the Response".to_string()),
            ))
        }
    };
    let user = match principal_id.as_str() {
        Some(user) => user.to_string(),
        None => {
            return Err(reject(
                function_name,
                AuthFailure::BadImplementation("principalId is not a string".to_string()),
            ))
        }
    };

    let context = match policy.get("context") {
        None | Some(Value::Null) => None,
        Some(Value::Object(context)) => {
            validate_context(function_name, context)?;
            Some(context.clone())
        }
        Some(other) => {
            return Err(reject(
                function_name,
                AuthFailure::BadImplementation(format!(
                    "Authorizer response context must be an object, found {}",
                    json_type(other)
                )),
            ))
        }
    };

    match policy.get("policyDocument") {
        None | Some(Value::Null) => {}
        Some(document) => check_policy_document(function_name, document, method_arn)?,
    }

    info!(
        "Authorization function returned a successful response (function: {}): principalId={}",
        function_name, user
    );
    Ok(Credentials { user, context })
}

fn validate_context(function_name: &str, context: &Map<String, Value>) -> Result<(), AuthFailure> {
    match context
        .iter()
        .find(|(_, value)| !matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_)))
    {
        Some((key, value)) => Err(reject(
            function_name,
            AuthFailure::BadImplementation(format!(
                "Authorizer response context values must be of type string, number, or boolean. Found type {} for key {}",
                json_type(value),
                key
            )),
        )),
        None => Ok(()),
    }
}

fn check_policy_document(
    function_name: &str,
    document: &Value,
    method_arn: &str,
) -> Result<(), AuthFailure> {
    let document: APIGatewayCustomAuthorizerPolicy = serde_json::from_value(document.clone())
        .map_err(|e| {
            reject(
                function_name,
                AuthFailure::BadImplementation(format!(
                    "Authorizer response policyDocument is malformed: {}",
                    e
                )),
            )
        })?;

    if document.authorizes(method_arn) {
        Ok(())
    } else {
        Err(reject(
            function_name,
            AuthFailure::Forbidden("User is not authorized to access this resource".to_string()),
        ))
    }
}

// Logs the rejection and hands it back.
fn reject(function_name: &str, failure: AuthFailure) -> AuthFailure {
    error!(
        "Authorization rejected (function: {}): {} {}",
        function_name,
        failure.status_code().as_u16(),
        failure.message()
    );
    failure
}

fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64().map_or(false, |n| n == 0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(_) | Value::Object(_) => false,
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apigateway::{method_arn, APIGatewayPolicyBuilder, Effect};
    use serde_json::json;
    use spectral::prelude::*;

    static FUNCTION: &str = "authorizerFunc";

    fn arn() -> String {
        method_arn("us-east-1", "dev", FUNCTION, "/users/{id}")
    }

    fn run(policy: Value) -> Result<Credentials, AuthFailure> {
        authorize(FUNCTION, Some(policy), &arn())
    }

    #[test]
    fn test_principal_only_policy_continues_without_context() {
        let credentials = run(json!({ "principalId": "user1" }));

        assert_that!(credentials).is_ok().is_equal_to(Credentials {
            user: "user1".to_string(),
            context: None,
        });
    }

    #[test]
    fn test_context_values_keep_their_types() {
        let credentials = run(json!({
            "principalId": "u",
            "context": { "role": "admin", "level": 3, "active": true }
        }))
        .unwrap();

        let context = credentials.context.unwrap();
        assert_that!(context.get("role")).is_equal_to(Some(&json!("admin")));
        assert_that!(context.get("level")).is_equal_to(Some(&json!(3)));
        assert_that!(context.get("active")).is_equal_to(Some(&json!(true)));
        assert_that!(context.len()).is_equal_to(3);
    }

    #[test]
    fn test_missing_principal_is_forbidden() {
        let failure = run(json!({})).unwrap_err();

        assert_that!(failure.status_code()).is_equal_to(StatusCode::FORBIDDEN);
        assert!(failure.message().contains("No principalId"));
    }

    #[test]
    fn test_falsy_principals_are_forbidden() {
        for principal in [json!(null), json!(""), json!(0), json!(false)] {
            let failure = run(json!({ "principalId": principal })).unwrap_err();

            assert_that!(failure.status_code()).is_equal_to(StatusCode::FORBIDDEN);
        }
    }

    #[test]
    fn test_nothing_returned_is_forbidden() {
        let failure = authorize(FUNCTION, None, &arn()).unwrap_err();

        assert_that!(failure.status_code()).is_equal_to(StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_non_string_principal_is_bad_implementation() {
        let failure = run(json!({ "principalId": 42 })).unwrap_err();

        assert_that!(failure).is_equal_to(AuthFailure::BadImplementation(
            "principalId is not a string".to_string(),
        ));
        assert_that!(failure.status_code()).is_equal_to(StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_object_context_value_is_bad_implementation() {
        let failure = run(json!({ "principalId": "u", "context": { "bad": {} } })).unwrap_err();

        assert_that!(failure.status_code()).is_equal_to(StatusCode::INTERNAL_SERVER_ERROR);
        assert!(failure.message().contains("Found type object for key bad"));
    }

    #[test]
    fn test_first_invalid_context_value_is_reported() {
        let failure = run(json!({
            "principalId": "u",
            "context": { "ok": 1, "list": [1], "nothing": null }
        }))
        .unwrap_err();

        assert!(failure.message().contains("Found type array for key list"));
    }

    #[test]
    fn test_context_must_be_an_object() {
        let failure = run(json!({ "principalId": "u", "context": "admin" })).unwrap_err();

        assert_that!(failure.status_code()).is_equal_to(StatusCode::INTERNAL_SERVER_ERROR);
        assert!(failure.message().contains("found string"));
    }

    #[test]
    fn test_null_context_is_ignored() {
        let credentials = run(json!({ "principalId": "u", "context": null })).unwrap();

        assert_that!(credentials.context).is_none();
    }

    #[test]
    fn test_escaped_quote_reports_position() {
        let failure = run(json!({ "principalId": "u", "context": { "q": "a\"b" } })).unwrap_err();

        assert_that!(failure.status_code()).is_equal_to(StatusCode::INTERNAL_SERVER_ERROR);
        assert!(failure.message().contains("at position 36"), "{}", failure.message());
        assert!(failure.message().contains(r#"{"principalId":"u","context":{"q":"a\"b"}}"#));
    }

    #[test]
    fn test_allowing_policy_document_continues() {
        let document = APIGatewayPolicyBuilder::new("us-east-1", "dev").allow_all().build();

        let credentials = run(json!({ "principalId": "u", "policyDocument": document }));

        assert_that!(credentials).is_ok();
    }

    #[test]
    fn test_denying_policy_document_is_forbidden() {
        let document = APIGatewayPolicyBuilder::new("us-east-1", "dev")
            .add_resource(Effect::Deny, FUNCTION, "/users/*")
            .allow_all()
            .build();

        let failure = run(json!({ "principalId": "u", "policyDocument": document })).unwrap_err();

        assert_that!(failure).is_equal_to(AuthFailure::Forbidden(
            "User is not authorized to access this resource".to_string(),
        ));
    }

    #[test]
    fn test_deny_all_policy_document_is_forbidden() {
        let document = APIGatewayPolicyBuilder::new("us-east-1", "dev").deny_all().build();

        let failure = run(json!({ "principalId": "u", "policyDocument": document })).unwrap_err();

        assert_that!(failure.status_code()).is_equal_to(StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_policy_document_for_other_stage_is_forbidden() {
        let document = APIGatewayPolicyBuilder::new("us-east-1", "prod").allow_all().build();

        let failure = run(json!({ "principalId": "u", "policyDocument": document })).unwrap_err();

        assert_that!(failure.status_code()).is_equal_to(StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_malformed_policy_document_is_bad_implementation() {
        let failure = run(json!({
            "principalId": "u",
            "policyDocument": { "Statement": [{ "Effect": "Maybe" }] }
        }))
        .unwrap_err();

        assert_that!(failure.status_code()).is_equal_to(StatusCode::INTERNAL_SERVER_ERROR);
        assert!(failure.message().contains("policyDocument is malformed"));
    }
}
