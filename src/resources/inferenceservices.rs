use std::collections::BTreeMap;
use std::fmt;

use kube::CustomResource;
use schemars::schema::Schema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Selects between a Knative-served and a plain Deployment-backed predictor.
pub const DEPLOYMENT_MODE_ANNOTATION: &str = "serving.kserve.io/deploymentMode";
/// Selects the autoscaler that sizes a RawDeployment predictor.
pub const AUTOSCALER_CLASS_ANNOTATION: &str = "serving.kserve.io/autoscalerClass";
/// Present on every object created on behalf of an InferenceService.
pub const INFERENCE_SERVICE_LABEL: &str = "serving.kserve.io/inferenceservice";

/// InferenceService serves a model behind an autoscaled predictor.
/// Depending on its deployment mode the predictor is either a Knative Service, or a Deployment and
/// Service scaled by a HorizontalPodAutoscaler or a KEDA ScaledObject.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    kind = "InferenceService",
    group = "serving.kserve.io",
    version = "v1beta1",
    namespaced,
    printcolumn = r#"{"name":"URL", "type":"string", "jsonPath":".status.url"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Mode", "type":"string", "jsonPath":".status.deploymentMode"}"#,
    printcolumn = r#"{"name":"Autoscaler", "type":"string", "jsonPath":".status.autoscalerClass", "priority": 1}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(status = "InferenceServiceStatus", shortname = "isvc")]
#[serde(rename_all = "camelCase")]
pub struct InferenceServiceSpec {
    /// The predictor component, which serves the model.
    pub predictor: PredictorSpec,
}

/// Scaling configuration and pod template of the predictor.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PredictorSpec {
    /// Minimum number of replicas. Defaults to 0 for Serverless and 1 for RawDeployment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i32>,

    /// Maximum number of replicas. 0 or unset means unbounded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<i32>,

    /// Legacy single-metric form: the metric to scale on.
    /// Ignored when `autoScaling.metrics` is non-empty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale_metric: Option<ScaleMetric>,

    /// Legacy single-metric form: how `scaleTarget` is interpreted for cpu and memory. Defaults to Utilization.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale_metric_type: Option<MetricTargetType>,

    /// Legacy single-metric form: the target value of `scaleMetric`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale_target: Option<i32>,

    /// Structured multi-metric autoscaling configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_scaling: Option<AutoScalingSpec>,

    /// Template describes the predictor pods.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<PodTemplateSpec>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ScaleMetric {
    Concurrency,
    Rps,
    Cpu,
    Memory,
}

impl ScaleMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScaleMetric::Concurrency => "concurrency",
            ScaleMetric::Rps => "rps",
            ScaleMetric::Cpu => "cpu",
            ScaleMetric::Memory => "memory",
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum MetricTargetType {
    Utilization,
    AverageValue,
    Value,
}

impl MetricTargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricTargetType::Utilization => "Utilization",
            MetricTargetType::AverageValue => "AverageValue",
            MetricTargetType::Value => "Value",
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct AutoScalingSpec {
    /// Metrics to scale on, in priority order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<MetricsSpec>,
}

/// A single autoscaling metric. Exactly the source named by `type` must be set.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct MetricsSpec {
    #[serde(rename = "type")]
    pub type_: MetricSourceType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceMetricSource>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub external: Option<ExternalMetricSource>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum MetricSourceType {
    Resource,
    External,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct ResourceMetricSource {
    pub name: ResourceMetric,
    pub target: MetricTarget,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ResourceMetric {
    Cpu,
    Memory,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct ExternalMetricSource {
    pub metric: ExternalMetrics,
    pub target: MetricTarget,
}

/// Where an external metric is read from.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExternalMetrics {
    /// The KEDA scaler type, for example `prometheus`. Defaults to `prometheus`.
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Address of the metrics server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_address: Option<String>,

    /// Query evaluated by the metrics server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,

    /// Tenant namespace of the metrics server, where supported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

fn default_backend() -> String {
    "prometheus".into()
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MetricTarget {
    #[serde(rename = "type")]
    pub type_: MetricTargetType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<MetricQuantity>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_value: Option<MetricQuantity>,

    /// Percentage of the requested resource.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_utilization: Option<i32>,
}

/// A target value written either as a number or as a Kubernetes quantity string such as `500m`.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum MetricQuantity {
    Int(i64),
    Float(f64),
    String(String),
}

impl fmt::Display for MetricQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricQuantity::Int(i) => write!(f, "{i}"),
            MetricQuantity::Float(v) => write!(f, "{v}"),
            MetricQuantity::String(s) => f.write_str(s),
        }
    }
}

impl JsonSchema for MetricQuantity {
    fn schema_name() -> String {
        "MetricQuantity".into()
    }

    fn json_schema(_: &mut schemars::gen::SchemaGenerator) -> Schema {
        serde_json::from_value(serde_json::json!({
            "anyOf": [{"type": "integer"}, {"type": "string"}],
            "x-kubernetes-int-or-string": true,
        }))
        .unwrap()
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct PodTemplateSpec {
    /// Labels and annotations added to the predictor pods.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<PodTemplateMetadata>,

    /// Specification of the predictor pods.
    /// The contents of this field are passed through to the created Deployment or Knative Service and are not validated.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "pod_spec_schema")]
    pub spec: Option<serde_json::Value>,
}

fn pod_spec_schema(_g: &mut schemars::gen::SchemaGenerator) -> Schema {
    serde_json::from_value(serde_json::json!({
            "x-kubernetes-preserve-unknown-fields": true,
    }))
    .unwrap()
}

/// PodTemplateMetadata is a subset of ObjectMeta that is valid for pod templates
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct PodTemplateMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
}

/// Status of the InferenceService
/// This is set and managed automatically by the controller
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InferenceServiceStatus {
    /// The generation observed by the controller
    pub observed_generation: Option<i64>,

    /// Represents the latest available observations of current state
    pub conditions: Option<Vec<InferenceServiceCondition>>,

    /// The deployment mode the predictor was last reconciled in
    pub deployment_mode: Option<String>,

    /// The autoscaler sizing the predictor
    pub autoscaler_class: Option<String>,

    /// Address of the predictor
    pub url: Option<String>,

    /// Total number of non-terminated predictor pods, for RawDeployment
    pub replicas: Option<i32>,
}

/// Conditions for the InferenceService status
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InferenceServiceCondition {
    /// Last time the condition transitioned from one status to another
    pub last_transition_time: Option<k8s_openapi::apimachinery::pkg::apis::meta::v1::Time>,

    /// Human-readable message indicating details about last transition
    pub message: Option<String>,

    /// Reason for the condition's last transition
    pub reason: Option<String>,

    /// Status is the status of the condition (True, False, Unknown)
    pub status: String,

    /// Type of condition
    pub r#type: String,
}

impl InferenceService {
    pub fn ready_condition(&self) -> Option<&InferenceServiceCondition> {
        self.status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .and_then(|c| c.iter().find(|cond| cond.r#type == "Ready"))
    }
}
