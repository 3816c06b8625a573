use std::sync::OnceLock;

use regex::Regex;

use crate::resources::inferenceservices::{
    ExternalMetricSource, MetricSourceType, MetricTargetType, MetricsSpec, PredictorSpec,
    ResourceMetric, ResourceMetricSource, ScaleMetric,
};
use crate::resources::inferenceservices::MetricTarget as MetricTargetSpec;
use crate::scaling::{DeploymentMode, ExternalSource, MetricSpec, MetricTarget, ScalingIntent, TargetValue};
use crate::{Error, Result};

/// Reduces the legacy `scaleMetric`/`scaleTarget` fields or the structured `autoScaling.metrics`
/// list to one canonical intent. A non-empty structured list always wins.
pub fn normalize(predictor: &PredictorSpec, mode: DeploymentMode) -> Result<ScalingIntent> {
    let min_replicas = predictor
        .min_replicas
        .unwrap_or_else(|| mode.default_min_replicas());
    let max_replicas = predictor.max_replicas.unwrap_or(0);

    if min_replicas < 0 {
        return Err(Error::InvalidSpec(format!(
            "minReplicas must not be negative, got {min_replicas}"
        )));
    }
    if max_replicas < 0 {
        return Err(Error::InvalidSpec(format!(
            "maxReplicas must not be negative, got {max_replicas}"
        )));
    }
    if max_replicas != 0 && max_replicas < min_replicas {
        return Err(Error::InvalidSpec(format!(
            "maxReplicas ({max_replicas}) must not be less than minReplicas ({min_replicas})"
        )));
    }

    let structured = predictor
        .auto_scaling
        .as_ref()
        .map(|a| a.metrics.as_slice())
        .unwrap_or_default();

    let metrics = if structured.is_empty() {
        legacy_metric(predictor, mode)?.into_iter().collect()
    } else {
        structured
            .iter()
            .enumerate()
            .map(|(i, metric)| structured_metric(i, metric))
            .collect::<Result<Vec<_>>>()?
    };

    for metric in &metrics {
        let target = metric.target();
        if !target.value.is_positive() {
            return Err(Error::InvalidSpec(format!(
                "target of metric '{}' must be positive, got {}",
                metric.name(),
                target.value
            )));
        }
        if target.type_ == MetricTargetType::Utilization && target.value.as_whole().is_none() {
            return Err(Error::InvalidSpec(format!(
                "utilization target of metric '{}' must be a whole percentage, got {}",
                metric.name(),
                target.value
            )));
        }
    }

    Ok(ScalingIntent {
        min_replicas,
        max_replicas,
        metrics,
    })
}

fn legacy_metric(predictor: &PredictorSpec, mode: DeploymentMode) -> Result<Option<MetricSpec>> {
    let Some(scale_target) = predictor.scale_target else {
        return Ok(None);
    };

    let scale_metric = predictor.scale_metric.unwrap_or(match mode {
        DeploymentMode::Serverless => ScaleMetric::Concurrency,
        DeploymentMode::Raw => ScaleMetric::Cpu,
    });
    let value = TargetValue::from_int(scale_target.into());

    Ok(Some(match scale_metric {
        ScaleMetric::Concurrency => MetricSpec::Concurrency(MetricTarget {
            type_: MetricTargetType::AverageValue,
            value,
        }),
        ScaleMetric::Rps => MetricSpec::Rps(MetricTarget {
            type_: MetricTargetType::AverageValue,
            value,
        }),
        ScaleMetric::Cpu => MetricSpec::Cpu(MetricTarget {
            type_: predictor
                .scale_metric_type
                .unwrap_or(MetricTargetType::Utilization),
            value,
        }),
        ScaleMetric::Memory => MetricSpec::Memory(MetricTarget {
            type_: predictor
                .scale_metric_type
                .unwrap_or(MetricTargetType::Utilization),
            value,
        }),
    }))
}

fn structured_metric(index: usize, metric: &MetricsSpec) -> Result<MetricSpec> {
    let path = format!("autoScaling.metrics[{index}]");
    match (metric.type_, &metric.resource, &metric.external) {
        (MetricSourceType::Resource, Some(resource), None) => resource_metric(&path, resource),
        (MetricSourceType::External, None, Some(external)) => external_metric(&path, external),
        (MetricSourceType::Resource, _, _) => Err(Error::InvalidSpec(format!(
            "{path} has type Resource and must set exactly `resource`"
        ))),
        (MetricSourceType::External, _, _) => Err(Error::InvalidSpec(format!(
            "{path} has type External and must set exactly `external`"
        ))),
    }
}

fn resource_metric(path: &str, resource: &ResourceMetricSource) -> Result<MetricSpec> {
    let target = target_value(path, &resource.target)?;
    Ok(match resource.name {
        ResourceMetric::Cpu => MetricSpec::Cpu(target),
        ResourceMetric::Memory => MetricSpec::Memory(target),
    })
}

fn external_metric(path: &str, external: &ExternalMetricSource) -> Result<MetricSpec> {
    static BACKEND: OnceLock<Regex> = OnceLock::new();
    let backend_regex = BACKEND.get_or_init(|| Regex::new(r"^[a-z][a-z0-9-]*$").unwrap());

    let metric = &external.metric;
    if !backend_regex.is_match(&metric.backend) {
        return Err(Error::InvalidSpec(format!(
            "{path}: '{}' is not a valid external metric backend",
            metric.backend
        )));
    }

    let server_address = match metric.server_address.as_deref() {
        Some(address) if !address.trim().is_empty() => address.to_string(),
        _ => {
            return Err(Error::InvalidSpec(format!(
                "{path}: external metric requires serverAddress"
            )))
        }
    };
    let query = match metric.query.as_deref() {
        Some(query) if !query.trim().is_empty() => query.to_string(),
        _ => {
            return Err(Error::InvalidSpec(format!(
                "{path}: external metric requires a query"
            )))
        }
    };

    if external.target.type_ == MetricTargetType::Utilization {
        return Err(Error::InvalidSpec(format!(
            "{path}: external metrics take a Value or AverageValue target, not Utilization"
        )));
    }

    Ok(MetricSpec::External {
        source: ExternalSource {
            backend: metric.backend.clone(),
            server_address,
            query,
            namespace: metric.namespace.clone().filter(|ns| !ns.is_empty()),
        },
        target: target_value(path, &external.target)?,
    })
}

fn target_value(path: &str, target: &MetricTargetSpec) -> Result<MetricTarget> {
    let value = match target.type_ {
        MetricTargetType::Utilization => target
            .average_utilization
            .map(|u| TargetValue::from_int(u.into())),
        MetricTargetType::AverageValue => target
            .average_value
            .as_ref()
            .map(TargetValue::try_from)
            .transpose()
            .map_err(|e| Error::InvalidSpec(format!("{path}: averageValue: {e}")))?,
        MetricTargetType::Value => target
            .value
            .as_ref()
            .map(TargetValue::try_from)
            .transpose()
            .map_err(|e| Error::InvalidSpec(format!("{path}: value: {e}")))?,
    };

    let Some(value) = value else {
        let field = match target.type_ {
            MetricTargetType::Utilization => "averageUtilization",
            MetricTargetType::AverageValue => "averageValue",
            MetricTargetType::Value => "value",
        };
        return Err(Error::InvalidSpec(format!(
            "{path}: target type {} requires `{field}`",
            target.type_.as_str()
        )));
    };

    Ok(MetricTarget {
        type_: target.type_,
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::inferenceservices::{AutoScalingSpec, ExternalMetrics, MetricQuantity};

    fn predictor(value: serde_json::Value) -> PredictorSpec {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn legacy_request_metrics_map_directly() {
        for (name, metric) in [("concurrency", "concurrency"), ("rps", "rps")] {
            for target in [1, 5, 100] {
                let intent = normalize(
                    &predictor(serde_json::json!({"scaleMetric": name, "scaleTarget": target})),
                    DeploymentMode::Serverless,
                )
                .unwrap();
                assert_eq!(intent.metrics.len(), 1);
                assert_eq!(intent.metrics[0].name(), metric);
                assert_eq!(intent.metrics[0].target().value.to_string(), target.to_string());
            }
        }
    }

    #[test]
    fn legacy_cpu_is_a_utilization_resource_metric() {
        let intent = normalize(
            &predictor(serde_json::json!({"scaleMetric": "cpu", "scaleTarget": 50})),
            DeploymentMode::Raw,
        )
        .unwrap();
        assert_eq!(
            intent.metrics,
            vec![MetricSpec::Cpu(MetricTarget {
                type_: MetricTargetType::Utilization,
                value: TargetValue::from_int(50)
            })]
        );
        assert_eq!(intent.min_replicas, 1);
        assert_eq!(intent.max_replicas, 0);
    }

    #[test]
    fn legacy_memory_honours_metric_type() {
        let intent = normalize(
            &predictor(serde_json::json!({
                "scaleMetric": "memory",
                "scaleMetricType": "AverageValue",
                "scaleTarget": 512
            })),
            DeploymentMode::Raw,
        )
        .unwrap();
        assert_eq!(
            intent.metrics[0].target().type_,
            MetricTargetType::AverageValue
        );
    }

    #[test]
    fn legacy_target_without_metric_defaults_by_mode() {
        let p = predictor(serde_json::json!({"scaleTarget": 10}));
        assert_eq!(
            normalize(&p, DeploymentMode::Serverless).unwrap().metrics[0].name(),
            "concurrency"
        );
        assert_eq!(
            normalize(&p, DeploymentMode::Raw).unwrap().metrics[0].name(),
            "cpu"
        );
    }

    #[test]
    fn no_metric_yields_empty_list() {
        let intent = normalize(
            &predictor(serde_json::json!({"scaleMetric": "cpu"})),
            DeploymentMode::Raw,
        )
        .unwrap();
        assert!(intent.metrics.is_empty());
    }

    #[test]
    fn min_replicas_default_depends_on_mode() {
        let p = PredictorSpec::default();
        assert_eq!(normalize(&p, DeploymentMode::Serverless).unwrap().min_replicas, 0);
        assert_eq!(normalize(&p, DeploymentMode::Raw).unwrap().min_replicas, 1);
    }

    #[test]
    fn structured_metrics_win_over_legacy() {
        let intent = normalize(
            &predictor(serde_json::json!({
                "scaleMetric": "cpu",
                "scaleTarget": 10,
                "autoScaling": {"metrics": [{
                    "type": "Resource",
                    "resource": {"name": "memory", "target": {"type": "Utilization", "averageUtilization": 50}}
                }]}
            })),
            DeploymentMode::Raw,
        )
        .unwrap();
        assert_eq!(
            intent.metrics,
            vec![MetricSpec::Memory(MetricTarget {
                type_: MetricTargetType::Utilization,
                value: TargetValue::from_int(50)
            })]
        );
    }

    #[test]
    fn empty_structured_list_falls_back_to_legacy() {
        let mut p = predictor(serde_json::json!({"scaleMetric": "rps", "scaleTarget": 3}));
        p.auto_scaling = Some(AutoScalingSpec { metrics: vec![] });
        let intent = normalize(&p, DeploymentMode::Serverless).unwrap();
        assert_eq!(intent.metrics[0].name(), "rps");
    }

    #[test]
    fn external_metric_is_normalized() {
        let intent = normalize(
            &predictor(serde_json::json!({
                "minReplicas": 1,
                "maxReplicas": 5,
                "autoScaling": {"metrics": [{
                    "type": "External",
                    "external": {
                        "metric": {
                            "backend": "prometheus",
                            "serverAddress": "http://prometheus:9090",
                            "query": "http_requests_per_second"
                        },
                        "target": {"type": "Value", "value": 50}
                    }
                }]}
            })),
            DeploymentMode::Raw,
        )
        .unwrap();

        assert_eq!(intent.max_bound(), Some(5));
        assert_eq!(
            intent.metrics,
            vec![MetricSpec::External {
                source: ExternalSource {
                    backend: "prometheus".into(),
                    server_address: "http://prometheus:9090".into(),
                    query: "http_requests_per_second".into(),
                    namespace: None,
                },
                target: MetricTarget {
                    type_: MetricTargetType::Value,
                    value: TargetValue::from_int(50)
                }
            }]
        );
    }

    #[test]
    fn non_positive_targets_are_invalid() {
        for target in [0, -1] {
            let err = normalize(
                &predictor(serde_json::json!({"scaleMetric": "concurrency", "scaleTarget": target})),
                DeploymentMode::Serverless,
            )
            .unwrap_err();
            assert!(matches!(err, Error::InvalidSpec(_)), "{err}");
        }

        let err = normalize(
            &predictor(serde_json::json!({
                "autoScaling": {"metrics": [{
                    "type": "Resource",
                    "resource": {"name": "memory", "target": {"type": "AverageValue", "averageValue": "-1Gi"}}
                }]}
            })),
            DeploymentMode::Raw,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidSpec(_)));
    }

    #[test]
    fn replica_bounds_are_validated() {
        for bounds in [
            serde_json::json!({"minReplicas": 3, "maxReplicas": 2}),
            serde_json::json!({"minReplicas": -1}),
            serde_json::json!({"maxReplicas": -4}),
        ] {
            assert!(matches!(
                normalize(&predictor(bounds), DeploymentMode::Raw),
                Err(Error::InvalidSpec(_))
            ));
        }

        let unbounded = normalize(
            &predictor(serde_json::json!({"minReplicas": 3, "maxReplicas": 0})),
            DeploymentMode::Raw,
        )
        .unwrap();
        assert_eq!(unbounded.max_bound(), None);
    }

    #[test]
    fn mismatched_metric_source_is_invalid() {
        let err = normalize(
            &predictor(serde_json::json!({
                "autoScaling": {"metrics": [{"type": "External", "resource": {
                    "name": "cpu", "target": {"type": "Utilization", "averageUtilization": 50}
                }}]}
            })),
            DeploymentMode::Raw,
        )
        .unwrap_err();
        assert!(err.to_string().contains("autoScaling.metrics[0]"));
    }

    #[test]
    fn missing_target_field_is_invalid() {
        let err = normalize(
            &predictor(serde_json::json!({
                "autoScaling": {"metrics": [{"type": "Resource", "resource": {
                    "name": "cpu", "target": {"type": "Utilization", "value": 50}
                }}]}
            })),
            DeploymentMode::Raw,
        )
        .unwrap_err();
        assert!(err.to_string().contains("averageUtilization"));
    }

    #[test]
    fn external_metric_requires_query_and_valid_backend() {
        let external = |backend: &str, query: Option<&str>| PredictorSpec {
            auto_scaling: Some(AutoScalingSpec {
                metrics: vec![MetricsSpec {
                    type_: MetricSourceType::External,
                    resource: None,
                    external: Some(ExternalMetricSource {
                        metric: ExternalMetrics {
                            backend: backend.into(),
                            server_address: Some("http://prometheus:9090".into()),
                            query: query.map(String::from),
                            namespace: None,
                        },
                        target: MetricTargetSpec {
                            type_: MetricTargetType::Value,
                            value: Some(MetricQuantity::Int(10)),
                            average_value: None,
                            average_utilization: None,
                        },
                    }),
                }],
            }),
            ..Default::default()
        };

        assert!(normalize(&external("prometheus", Some("up")), DeploymentMode::Raw).is_ok());
        assert!(normalize(&external("prometheus", None), DeploymentMode::Raw).is_err());
        assert!(normalize(&external("Prom Etheus", Some("up")), DeploymentMode::Raw).is_err());
    }
}
