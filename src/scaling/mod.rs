//! The decision logic that turns an InferenceService's autoscaling declaration into the
//! resource that scales its predictor. Everything in here is pure; the controller feeds it
//! the predictor and its annotations and applies what comes out.

mod mode;
mod normalizer;
mod quantity;
mod synthesizer;

pub use mode::{resolve_backend, select_mode, AutoscalerClass, Capabilities, DeploymentMode};
pub use normalizer::normalize;
pub use quantity::{ParseError, TargetValue};
pub use synthesizer::{
    synthesize, DesiredChildResource, HpaMetric, HpaSpec, KNATIVE_CLASS_ANNOTATION,
    KNATIVE_MAX_SCALE_ANNOTATION, KNATIVE_METRIC_ANNOTATION, KNATIVE_MIN_SCALE_ANNOTATION,
    KNATIVE_TARGET_ANNOTATION,
};

use crate::resources::inferenceservices::{MetricTargetType, ResourceMetric};

/// The canonical autoscaling intent for one reconcile pass.
#[derive(Clone, Debug, PartialEq)]
pub struct ScalingIntent {
    pub min_replicas: i32,
    /// 0 means unbounded
    pub max_replicas: i32,
    pub metrics: Vec<MetricSpec>,
}

impl ScalingIntent {
    pub fn max_bound(&self) -> Option<i32> {
        (self.max_replicas != 0).then_some(self.max_replicas)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MetricTarget {
    pub type_: MetricTargetType,
    pub value: TargetValue,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExternalSource {
    pub backend: String,
    pub server_address: String,
    pub query: String,
    pub namespace: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum MetricSpec {
    Concurrency(MetricTarget),
    Rps(MetricTarget),
    Cpu(MetricTarget),
    Memory(MetricTarget),
    External {
        source: ExternalSource,
        target: MetricTarget,
    },
}

impl MetricSpec {
    /// The metric name as the scaling backends spell it
    pub fn name(&self) -> &str {
        match self {
            MetricSpec::Concurrency(_) => "concurrency",
            MetricSpec::Rps(_) => "rps",
            MetricSpec::Cpu(_) => "cpu",
            MetricSpec::Memory(_) => "memory",
            MetricSpec::External { source, .. } => &source.backend,
        }
    }

    pub fn target(&self) -> &MetricTarget {
        match self {
            MetricSpec::Concurrency(target)
            | MetricSpec::Rps(target)
            | MetricSpec::Cpu(target)
            | MetricSpec::Memory(target)
            | MetricSpec::External { target, .. } => target,
        }
    }

    pub fn resource(&self) -> Option<ResourceMetric> {
        match self {
            MetricSpec::Cpu(_) => Some(ResourceMetric::Cpu),
            MetricSpec::Memory(_) => Some(ResourceMetric::Memory),
            _ => None,
        }
    }

    /// Concurrency and rps are only understood by the Knative pod autoscaler
    pub fn is_request_based(&self) -> bool {
        matches!(self, MetricSpec::Concurrency(_) | MetricSpec::Rps(_))
    }
}
