use std::collections::BTreeMap;

use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, HorizontalPodAutoscalerSpec, MetricSpec as HpaMetricSpec,
    MetricTarget as HpaMetricTarget, ResourceMetricSource,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use tracing::*;

use crate::resources::inferenceservices::{MetricTargetType, ResourceMetric};
use crate::resources::keda::{ScaleTargetRef, ScaledObjectSpec, ScaledObjectTrigger};
use crate::scaling::{
    AutoscalerClass, DeploymentMode, MetricSpec, MetricTarget, ScalingIntent, TargetValue,
};

pub const KNATIVE_CLASS_ANNOTATION: &str = "autoscaling.knative.dev/class";
pub const KNATIVE_METRIC_ANNOTATION: &str = "autoscaling.knative.dev/metric";
pub const KNATIVE_TARGET_ANNOTATION: &str = "autoscaling.knative.dev/target";
pub const KNATIVE_MIN_SCALE_ANNOTATION: &str = "autoscaling.knative.dev/min-scale";
pub const KNATIVE_MAX_SCALE_ANNOTATION: &str = "autoscaling.knative.dev/max-scale";

const KPA_CLASS: &str = "kpa.autoscaling.knative.dev";
const KNATIVE_HPA_CLASS: &str = "hpa.autoscaling.knative.dev";

/// Applied when the InferenceService names no metric and the backend needs one
const DEFAULT_CPU_UTILIZATION: i64 = 80;

/// The scaling configuration the controller should converge the cluster to.
#[derive(Clone, Debug, PartialEq)]
pub enum DesiredChildResource {
    /// Annotations for the Knative revision template
    ServerlessAnnotations(BTreeMap<String, String>),
    Hpa(HpaSpec),
    ScaledObject(ScaledObjectSpec),
    /// Nothing to synthesize; replicas are left to another autoscaler or fixed at minReplicas
    Unmanaged,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HpaSpec {
    pub target: String,
    pub min_replicas: i32,
    /// None is unbounded
    pub max_replicas: Option<i32>,
    pub metrics: Vec<HpaMetric>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HpaMetric {
    pub resource: ResourceMetric,
    pub target: MetricTarget,
}

impl HpaSpec {
    /// The autoscaling/v1 view of this HPA: the CPU utilization percentage, if CPU is targeted by utilization
    pub fn target_cpu_utilization_percentage(&self) -> Option<i32> {
        self.metrics
            .iter()
            .find(|m| {
                m.resource == ResourceMetric::Cpu
                    && m.target.type_ == MetricTargetType::Utilization
            })
            .and_then(|m| m.target.value.as_whole())
            .and_then(|v| i32::try_from(v).ok())
    }

    /// Renders the autoscaling/v2 spec. The API requires an upper bound, so an unbounded HPA gets
    /// the largest value the field admits.
    pub fn to_autoscaling_v2(&self) -> HorizontalPodAutoscalerSpec {
        HorizontalPodAutoscalerSpec {
            scale_target_ref: CrossVersionObjectReference {
                api_version: Some("apps/v1".into()),
                kind: "Deployment".into(),
                name: self.target.clone(),
            },
            min_replicas: Some(self.min_replicas),
            max_replicas: self.max_replicas.unwrap_or(i32::MAX),
            metrics: Some(
                self.metrics
                    .iter()
                    .map(|m| HpaMetricSpec {
                        type_: "Resource".into(),
                        resource: Some(ResourceMetricSource {
                            name: resource_name(m.resource).into(),
                            target: hpa_target(&m.target),
                        }),
                        ..Default::default()
                    })
                    .collect(),
            ),
            behavior: None,
        }
    }
}

fn resource_name(resource: ResourceMetric) -> &'static str {
    match resource {
        ResourceMetric::Cpu => "cpu",
        ResourceMetric::Memory => "memory",
    }
}

fn hpa_target(target: &MetricTarget) -> HpaMetricTarget {
    match target.type_ {
        MetricTargetType::Utilization => HpaMetricTarget {
            type_: "Utilization".into(),
            average_utilization: target
                .value
                .as_whole()
                .and_then(|v| i32::try_from(v).ok()),
            ..Default::default()
        },
        MetricTargetType::AverageValue => HpaMetricTarget {
            type_: "AverageValue".into(),
            average_value: Some(Quantity(target.value.to_string())),
            ..Default::default()
        },
        MetricTargetType::Value => HpaMetricTarget {
            type_: "Value".into(),
            value: Some(Quantity(target.value.to_string())),
            ..Default::default()
        },
    }
}

fn default_cpu_metric() -> MetricSpec {
    MetricSpec::Cpu(MetricTarget {
        type_: MetricTargetType::Utilization,
        value: TargetValue::from_int(DEFAULT_CPU_UTILIZATION),
    })
}

/// Builds the desired scaling configuration for a predictor workload named `workload`.
///
/// The (intent, mode, class) triple must already have been accepted by
/// [`resolve_backend`](crate::scaling::resolve_backend); combinations it rejects are not
/// handled here.
pub fn synthesize(
    intent: &ScalingIntent,
    mode: DeploymentMode,
    class: AutoscalerClass,
    workload: &str,
) -> DesiredChildResource {
    match (mode, class) {
        (DeploymentMode::Serverless, _) => {
            DesiredChildResource::ServerlessAnnotations(serverless_annotations(intent))
        }
        (DeploymentMode::Raw, AutoscalerClass::Hpa) => {
            DesiredChildResource::Hpa(hpa_spec(intent, workload))
        }
        (DeploymentMode::Raw, AutoscalerClass::Keda) => {
            DesiredChildResource::ScaledObject(scaled_object_spec(intent, workload))
        }
        (DeploymentMode::Raw, _) => DesiredChildResource::Unmanaged,
    }
}

fn serverless_annotations(intent: &ScalingIntent) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::new();

    if let Some((metric, ignored)) = intent.metrics.split_first() {
        if !ignored.is_empty() {
            warn!(
                metric = metric.name(),
                ignored = ignored.len(),
                "Serverless autoscaling supports a single metric; ignoring the rest"
            );
        }
        let class = if metric.is_request_based() {
            KPA_CLASS
        } else {
            KNATIVE_HPA_CLASS
        };
        annotations.insert(KNATIVE_CLASS_ANNOTATION.into(), class.into());
        annotations.insert(KNATIVE_METRIC_ANNOTATION.into(), metric.name().into());
        annotations.insert(
            KNATIVE_TARGET_ANNOTATION.into(),
            metric.target().value.to_string(),
        );
    } else {
        annotations.insert(KNATIVE_CLASS_ANNOTATION.into(), KPA_CLASS.into());
    }

    annotations.insert(
        KNATIVE_MIN_SCALE_ANNOTATION.into(),
        intent.min_replicas.to_string(),
    );
    if let Some(max) = intent.max_bound() {
        annotations.insert(KNATIVE_MAX_SCALE_ANNOTATION.into(), max.to_string());
    }

    annotations
}

fn hpa_spec(intent: &ScalingIntent, workload: &str) -> HpaSpec {
    let default_metric = [default_cpu_metric()];
    let metrics = if intent.metrics.is_empty() {
        &default_metric[..]
    } else {
        &intent.metrics[..]
    };

    let mut hpa_metrics: Vec<HpaMetric> = Vec::with_capacity(2);
    for metric in metrics {
        let Some(resource) = metric.resource() else {
            continue;
        };
        if hpa_metrics.iter().any(|m| m.resource == resource) {
            warn!(
                metric = metric.name(),
                "A HorizontalPodAutoscaler takes one target per resource; using the first"
            );
            continue;
        }
        hpa_metrics.push(HpaMetric {
            resource,
            target: metric.target().clone(),
        });
    }

    HpaSpec {
        target: workload.into(),
        // HPAs cannot scale to zero
        min_replicas: intent.min_replicas.max(1),
        max_replicas: intent.max_bound(),
        metrics: hpa_metrics,
    }
}

fn scaled_object_spec(intent: &ScalingIntent, workload: &str) -> ScaledObjectSpec {
    let default_metric = [default_cpu_metric()];
    let metrics = if intent.metrics.is_empty() {
        &default_metric[..]
    } else {
        &intent.metrics[..]
    };

    let triggers = metrics
        .iter()
        .filter_map(|metric| match metric {
            MetricSpec::Cpu(target) | MetricSpec::Memory(target) => Some(ScaledObjectTrigger {
                type_: metric.name().into(),
                metric_type: Some(target.type_.as_str().into()),
                metadata: [("value".to_string(), target.value.to_string())].into(),
            }),
            MetricSpec::External { source, target } => {
                let mut metadata = BTreeMap::from([
                    ("serverAddress".to_string(), source.server_address.clone()),
                    ("query".to_string(), source.query.clone()),
                    ("threshold".to_string(), target.value.to_string()),
                ]);
                if let Some(namespace) = &source.namespace {
                    metadata.insert("namespace".into(), namespace.clone());
                }
                Some(ScaledObjectTrigger {
                    type_: source.backend.clone(),
                    metric_type: Some(target.type_.as_str().into()),
                    metadata,
                })
            }
            MetricSpec::Concurrency(_) | MetricSpec::Rps(_) => None,
        })
        .collect();

    ScaledObjectSpec {
        scale_target_ref: ScaleTargetRef {
            api_version: Some("apps/v1".into()),
            kind: Some("Deployment".into()),
            name: workload.into(),
        },
        min_replica_count: Some(intent.min_replicas),
        max_replica_count: intent.max_bound(),
        triggers,
    }
}
