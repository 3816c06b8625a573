use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Knative Service manages a Configuration and a Route for a single serverless workload
/// API: serving.knative.dev/v1
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "serving.knative.dev",
    version = "v1",
    kind = "Service",
    root = "KnativeService",
    plural = "services",
    namespaced
)]
#[kube(status = "KnativeServiceStatus")]
pub struct KnativeServiceSpec {
    /// Template for the Revisions stamped out by this Service
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<RevisionTemplateSpec>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct RevisionTemplateSpec {
    /// Metadata for the Revision; autoscaling is configured through its annotations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ObjectMeta>,

    /// Pod spec for the Revision, passed through as-is
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spec: Option<serde_json::Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KnativeServiceStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<KnativeCondition>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_ready_revision_name: Option<String>,

    /// URL the Service is reachable at
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Knative conditions leave reason and message unset while healthy, unlike meta/v1 Condition
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KnativeCondition {
    pub r#type: String,

    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl KnativeService {
    /// True once Knative reports the Service as routable
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .and_then(|c| c.iter().find(|cond| cond.r#type == "Ready"))
            .is_some_and(|c| c.status == "True")
    }
}
