//! The Pre-Authorizer capability (§4.4): asks the cluster which RBAC rules
//! the extension's service account is missing to manage a revision's
//! manifests, and formats the shortfall into a deterministic, externally
//! load-bearing error message.

use k8s_openapi::api::rbac::v1::PolicyRule;
use snafu::Snafu;

use crate::revision::ServiceAccountRef;

/// `"system:serviceaccount:<namespace>:<name>"`, the identity string the
/// cluster's RBAC review endpoint expects.
pub fn service_account_user(service_account: &ServiceAccountRef) -> String {
    format!(
        "system:serviceaccount:{}:{}",
        service_account.namespace, service_account.name
    )
}

/// The RBAC rules a service account is missing within a single namespace.
/// An empty `namespace` denotes a cluster-scoped rule.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScopedPolicyRules {
    pub namespace: String,
    pub rules: Vec<PolicyRule>,
}

/// The result of a single pre-authorization check: zero or more missing
/// rules, and/or an error from evaluating the check itself (distinct from
/// "the account lacks permission").
#[derive(Clone, Debug, Default)]
pub struct PreAuthOutcome {
    pub missing_rules: Vec<ScopedPolicyRules>,
    pub eval_error: Option<String>,
}

impl PreAuthOutcome {
    pub fn is_authorized(&self) -> bool {
        self.missing_rules.is_empty() && self.eval_error.is_none()
    }
}

/// Given the service account identity, the revision's manifests (serialized
/// as a YAML-document stream), and any additional required rules beyond
/// what the manifests themselves imply, reports the missing RBAC coverage.
#[async_trait::async_trait]
pub trait PreAuthorizer: Send + Sync {
    async fn pre_authorize(
        &self,
        user: &str,
        manifest: &str,
        extra_rules: &[PolicyRule],
    ) -> PreAuthOutcome;
}

#[derive(Debug, Snafu)]
#[snafu(display("{message}"))]
pub struct PreAuthorizationError {
    message: String,
}

fn bracket_list(label: &str, items: &[String]) -> Option<String> {
    if items.is_empty() {
        return None;
    }
    let mut sorted: Vec<&str> = items.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    Some(format!("{label}:[{}]", sorted.join(",")))
}

/// `Namespace:"<ns>" APIGroups:[…] Resources:[…] ResourceNames:[…]
/// Verbs:[…] NonResourceURLs:[…]`, omitting any bracketed section whose
/// list is empty.
fn format_missing_rule(namespace: &str, rule: &PolicyRule) -> String {
    let mut parts = vec![format!("Namespace:\"{namespace}\"")];
    for section in [
        bracket_list("APIGroups", rule.api_groups.as_deref().unwrap_or_default()),
        bracket_list("Resources", rule.resources.as_deref().unwrap_or_default()),
        bracket_list(
            "ResourceNames",
            rule.resource_names.as_deref().unwrap_or_default(),
        ),
        bracket_list("Verbs", &rule.verbs),
        bracket_list(
            "NonResourceURLs",
            rule.non_resource_urls.as_deref().unwrap_or_default(),
        ),
    ]
    .into_iter()
    .flatten()
    {
        parts.push(section);
    }
    parts.join(" ")
}

/// Builds the §4.4 message, or `None` if `outcome` represents success.
pub fn format_pre_authorization_error(outcome: &PreAuthOutcome) -> Option<PreAuthorizationError> {
    if outcome.is_authorized() {
        return None;
    }

    let mut lines: Vec<String> = outcome
        .missing_rules
        .iter()
        .flat_map(|scoped| {
            scoped
                .rules
                .iter()
                .map(|rule| format_missing_rule(&scoped.namespace, rule))
        })
        .collect();
    lines.sort();

    let mut message = String::from("service account requires the following permissions to manage cluster extension:\n  ");
    message.push_str(&lines.join("\n  "));

    if let Some(eval_error) = &outcome.eval_error {
        message.push_str(&format!("\nauthorization evaluation error: {eval_error}"));
    }

    Some(PreAuthorizationError {
        message: format!("pre-authorization failed: {message}"),
    })
}
