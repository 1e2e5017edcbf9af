use serde::{Deserialize, Deserializer, Serialize};

static POLICY_VERSION: &str = "2012-10-17"; // override if necessary

static TOKEN_EVENT_TYPE: &str = "TOKEN";

// Offline ARNs never point at a real account or API.
pub static ACCOUNT_PLACEHOLDER: &str = "random-account-id";
pub static API_PLACEHOLDER: &str = "random-api-id";

static INVOKE_ACTION: &str = "execute-api:Invoke";

/// The event handed to the authorizer function.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct APIGatewayCustomAuthorizerRequest {
    #[serde(rename = "type")]
    pub _type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_token: Option<String>,
    pub method_arn: String,
}

pub type AuthorizationEvent = APIGatewayCustomAuthorizerRequest;

impl APIGatewayCustomAuthorizerRequest {
    pub fn token(authorization_token: Option<String>, method_arn: String) -> Self {
        Self {
            _type: TOKEN_EVENT_TYPE.to_string(),
            authorization_token,
            method_arn,
        }
    }
}

/// Builds the synthetic method ARN for an endpoint served by `function_name`.
pub fn method_arn(region: &str, stage: &str, function_name: &str, endpoint_path: &str) -> String {
    format!(
        "arn:aws:execute-api:{}:{}:{}/{}/{}/{}",
        region,
        ACCOUNT_PLACEHOLDER,
        API_PLACEHOLDER,
        stage,
        function_name,
        endpoint_path.trim_start_matches('/')
    )
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[allow(non_snake_case)]
pub struct APIGatewayCustomAuthorizerPolicy {
    #[serde(default)]
    pub Version: String,
    #[serde(deserialize_with = "one_or_many")]
    pub Statement: Vec<IAMPolicyStatement>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[allow(non_snake_case)]
pub struct IAMPolicyStatement {
    #[serde(deserialize_with = "one_or_many")]
    pub Action: Vec<String>,
    pub Effect: Effect,
    #[serde(deserialize_with = "one_or_many")]
    pub Resource: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Copy)]
pub enum Effect {
    Allow,
    Deny,
}

// IAM accepts either a single value or a list wherever a list is expected.
#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(value) => vec![value],
        OneOrMany::Many(values) => values,
    })
}

impl APIGatewayCustomAuthorizerPolicy {
    /// Evaluates the document for an invocation of `method_arn`.
    ///
    /// An explicit `Deny` on a matching statement always wins; otherwise at
    /// least one matching `Allow` is required.
    pub fn authorizes(&self, method_arn: &str) -> bool {
        let mut allowed = false;
        for stmt in self.Statement.iter().filter(|s| s.applies_to(method_arn)) {
            match stmt.Effect {
                Effect::Deny => return false,
                Effect::Allow => allowed = true,
            }
        }
        allowed
    }
}

impl IAMPolicyStatement {
    fn applies_to(&self, method_arn: &str) -> bool {
        let action_matches = self.Action.iter().any(|action| {
            wildcard_match(&action.to_ascii_lowercase(), &INVOKE_ACTION.to_ascii_lowercase())
        });
        action_matches
            && self
                .Resource
                .iter()
                .any(|resource| wildcard_match(resource, method_arn))
    }
}

/// IAM-style glob: `*` matches any run of characters, `?` exactly one.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}

/// Builds policy documents scoped to the offline ARN space.
pub struct APIGatewayPolicyBuilder {
    region: String,
    stage: String,
    policy: APIGatewayCustomAuthorizerPolicy,
}

impl APIGatewayPolicyBuilder {
    pub fn new(region: &str, stage: &str) -> APIGatewayPolicyBuilder {
        Self {
            region: region.to_string(),
            stage: stage.to_string(),
            policy: APIGatewayCustomAuthorizerPolicy {
                Version: POLICY_VERSION.to_string(),
                Statement: vec![],
            },
        }
    }

    /// `function_name` and `resource` may be `*`.
    pub fn add_resource<T: Into<String>>(
        mut self,
        effect: Effect,
        function_name: &str,
        resource: T,
    ) -> Self {
        let resource_arn = method_arn(&self.region, &self.stage, function_name, &resource.into());

        let stmt = IAMPolicyStatement {
            Effect: effect,
            Action: vec![INVOKE_ACTION.to_string()],
            Resource: vec![resource_arn],
        };

        self.policy.Statement.push(stmt);
        self
    }

    pub fn allow_all(self) -> Self {
        self.add_resource(Effect::Allow, "*", "*")
    }

    pub fn deny_all(self) -> Self {
        self.add_resource(Effect::Deny, "*", "*")
    }

    pub fn build(self) -> APIGatewayCustomAuthorizerPolicy {
        self.policy
    }
}
