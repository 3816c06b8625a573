use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::resources::inferenceservices::{
    MetricTargetType, AUTOSCALER_CLASS_ANNOTATION, DEPLOYMENT_MODE_ANNOTATION,
};
use crate::scaling::{MetricSpec, ScalingIntent};
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeploymentMode {
    Serverless,
    Raw,
}

impl DeploymentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentMode::Serverless => "Serverless",
            DeploymentMode::Raw => "RawDeployment",
        }
    }

    pub fn default_min_replicas(&self) -> i32 {
        match self {
            DeploymentMode::Serverless => 0,
            DeploymentMode::Raw => 1,
        }
    }
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Serverless" => Ok(DeploymentMode::Serverless),
            "RawDeployment" => Ok(DeploymentMode::Raw),
            other => Err(Error::InvalidSpec(format!(
                "unknown deployment mode '{other}', expected Serverless or RawDeployment"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AutoscalerClass {
    /// Knative pod autoscaler, implied by Serverless
    Kpa,
    Hpa,
    Keda,
    /// Replicas are managed by something outside this controller
    External,
    /// No autoscaling; the Deployment stays at minReplicas
    None,
}

impl AutoscalerClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutoscalerClass::Kpa => "kpa",
            AutoscalerClass::Hpa => "hpa",
            AutoscalerClass::Keda => "keda",
            AutoscalerClass::External => "external",
            AutoscalerClass::None => "none",
        }
    }
}

impl fmt::Display for AutoscalerClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AutoscalerClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hpa" => Ok(AutoscalerClass::Hpa),
            "keda" => Ok(AutoscalerClass::Keda),
            "external" => Ok(AutoscalerClass::External),
            "none" => Ok(AutoscalerClass::None),
            other => Err(Error::UnsupportedBackend(format!(
                "unknown {AUTOSCALER_CLASS_ANNOTATION} '{other}', expected one of hpa, keda, external, none"
            ))),
        }
    }
}

/// Which optional scaling operators are installed in the cluster
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub knative: bool,
    pub keda: bool,
}

impl Capabilities {
    pub fn ensure_installed(&self, mode: DeploymentMode, class: AutoscalerClass) -> Result<()> {
        if mode == DeploymentMode::Serverless && !self.knative {
            return Err(Error::BackendNotInstalled {
                backend: "Knative Serving",
                required_by: format!("{DEPLOYMENT_MODE_ANNOTATION} Serverless"),
            });
        }
        if class == AutoscalerClass::Keda && !self.keda {
            return Err(Error::BackendNotInstalled {
                backend: "KEDA",
                required_by: format!("{AUTOSCALER_CLASS_ANNOTATION} keda"),
            });
        }
        Ok(())
    }
}

pub fn select_mode(
    annotations: &BTreeMap<String, String>,
    default: DeploymentMode,
) -> Result<DeploymentMode> {
    match annotations.get(DEPLOYMENT_MODE_ANNOTATION) {
        None => Ok(default),
        Some(value) => value.parse(),
    }
}

/// Picks the autoscaler for the given mode and rejects metric combinations it cannot express.
pub fn resolve_backend(
    mode: DeploymentMode,
    annotations: &BTreeMap<String, String>,
    intent: &ScalingIntent,
) -> Result<AutoscalerClass> {
    if mode == DeploymentMode::Serverless {
        for metric in &intent.metrics {
            match metric {
                MetricSpec::External { .. } => {
                    return Err(Error::UnsupportedBackend(format!(
                        "external metric '{}' cannot be used in Serverless mode; use RawDeployment with autoscalerClass keda",
                        metric.name()
                    )))
                }
                MetricSpec::Cpu(t) | MetricSpec::Memory(t)
                    if t.type_ != MetricTargetType::Utilization =>
                {
                    return Err(Error::UnsupportedBackend(format!(
                        "{} target type {} is not supported in Serverless mode, only Utilization",
                        metric.name(),
                        t.type_.as_str()
                    )))
                }
                _ => {}
            }
        }
        return Ok(AutoscalerClass::Kpa);
    }

    let class = match annotations.get(AUTOSCALER_CLASS_ANNOTATION) {
        None => AutoscalerClass::Hpa,
        Some(value) => value.parse()?,
    };

    if matches!(class, AutoscalerClass::Hpa | AutoscalerClass::Keda) {
        for metric in &intent.metrics {
            if metric.is_request_based() {
                return Err(Error::UnsupportedBackend(format!(
                    "metric '{}' requires Serverless mode; {class} cannot scale on it",
                    metric.name()
                )));
            }
            if metric.resource().is_some() && metric.target().type_ == MetricTargetType::Value {
                return Err(Error::UnsupportedBackend(format!(
                    "{} target type Value is not supported by {class}; use Utilization or AverageValue",
                    metric.name()
                )));
            }
            if class == AutoscalerClass::Hpa && matches!(metric, MetricSpec::External { .. }) {
                return Err(Error::UnsupportedBackend(format!(
                    "external metric '{}' cannot be expressed by a HorizontalPodAutoscaler; set {AUTOSCALER_CLASS_ANNOTATION} to keda",
                    metric.name()
                )));
            }
        }
    }

    Ok(class)
}
