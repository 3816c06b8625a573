use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// KEDA ScaledObject scales a workload from one or more triggers.
/// KEDA manages an HPA for the target under the hood.
/// API: keda.sh/v1alpha1
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "keda.sh",
    version = "v1alpha1",
    kind = "ScaledObject",
    namespaced
)]
#[kube(status = "ScaledObjectStatus")]
#[serde(rename_all = "camelCase")]
pub struct ScaledObjectSpec {
    /// Reference to the Deployment to scale
    pub scale_target_ref: ScaleTargetRef,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_replica_count: Option<i32>,

    /// Unset lets KEDA apply its own default
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_replica_count: Option<i32>,

    /// Scaling signals; KEDA scales to the highest replica count any of them asks for
    pub triggers: Vec<ScaledObjectTrigger>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScaleTargetRef {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    pub name: String,
}

/// A single KEDA trigger
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScaledObjectTrigger {
    /// Scaler type, for example `cpu`, `memory` or `prometheus`
    #[serde(rename = "type")]
    pub type_: String,

    /// Metric type for resource scalers, `Utilization` or `AverageValue`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_type: Option<String>,

    /// Scaler specific configuration
    pub metadata: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScaledObjectStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<ScaledObjectCondition>>,

    /// Name of the HPA KEDA created for this ScaledObject
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hpa_name: Option<String>,
}

/// KEDA conditions carry no transition time, so meta/v1 Condition cannot hold them
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct ScaledObjectCondition {
    pub r#type: String,

    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_written_by_keda_deserializes() {
        let scaled_object: ScaledObject = serde_json::from_value(json!({
            "apiVersion": "keda.sh/v1alpha1",
            "kind": "ScaledObject",
            "metadata": {"name": "sklearn-predictor", "namespace": "models"},
            "spec": {
                "scaleTargetRef": {"name": "sklearn-predictor"},
                "triggers": [{"type": "cpu", "metricType": "Utilization", "metadata": {"value": "60"}}]
            },
            "status": {
                "hpaName": "keda-hpa-sklearn-predictor",
                "conditions": [
                    {"type": "Ready", "status": "True", "reason": "ScaledObjectReady", "message": "ok"},
                    {"type": "Active", "status": "False"}
                ]
            }
        }))
        .unwrap();

        let conditions = scaled_object.status.unwrap().conditions.unwrap();
        assert_eq!(conditions[0].reason.as_deref(), Some("ScaledObjectReady"));
        assert_eq!(conditions[1].message, None);
    }
}
