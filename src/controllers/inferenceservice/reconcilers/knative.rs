use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::Api;
use kube::ResourceExt;

use crate::resources::inferenceservices::{InferenceService, INFERENCE_SERVICE_LABEL};
use crate::resources::knative::{KnativeService, KnativeServiceSpec, RevisionTemplateSpec};
use crate::{Error, Result};

use super::owned::{apply_owned, exact, superset, OwnedField};
use super::{object_meta, propagated_annotations, ChildAction};

// each autoscaling annotation is owned individually so a dropped bound or metric shows up as drift
const OWNED_FIELDS: &[OwnedField] = &[
    superset("/metadata/labels"),
    superset("/metadata/annotations"),
    superset("/spec/template/metadata/labels"),
    superset("/spec/template/metadata/annotations"),
    exact("/spec/template/metadata/annotations/autoscaling.knative.dev~1class"),
    exact("/spec/template/metadata/annotations/autoscaling.knative.dev~1metric"),
    exact("/spec/template/metadata/annotations/autoscaling.knative.dev~1target"),
    exact("/spec/template/metadata/annotations/autoscaling.knative.dev~1min-scale"),
    exact("/spec/template/metadata/annotations/autoscaling.knative.dev~1max-scale"),
    superset("/spec/template/spec"),
];

/// The Knative Service for a Serverless InferenceService; `autoscaling` lands on the revision template
pub fn desired_knative_service(
    isvc: &InferenceService,
    namespace: &str,
    autoscaling: BTreeMap<String, String>,
) -> Result<KnativeService> {
    let template = isvc.spec.predictor.template.as_ref();
    let Some(pod_spec) = template.and_then(|t| t.spec.clone()) else {
        return Err(Error::InvalidSpec(
            "Serverless mode requires spec.predictor.template.spec".into(),
        ));
    };
    let template_metadata = template.and_then(|t| t.metadata.as_ref());

    let mut revision_annotations = propagated_annotations(isvc);
    if let Some(annotations) = template_metadata.and_then(|m| m.annotations.as_ref()) {
        revision_annotations.extend(annotations.clone());
    }
    // synthesized autoscaling settings override anything the user wrote by hand
    revision_annotations.extend(autoscaling);

    let mut revision_labels = template_metadata
        .and_then(|m| m.labels.clone())
        .unwrap_or_default();
    revision_labels.insert(INFERENCE_SERVICE_LABEL.into(), isvc.name_any());

    let mut metadata = object_meta(isvc, namespace)?;
    metadata.annotations = Some(propagated_annotations(isvc));

    let mut ksvc = KnativeService::new(
        &super::predictor_name(isvc),
        KnativeServiceSpec {
            template: Some(RevisionTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(revision_labels),
                    annotations: Some(revision_annotations),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            }),
        },
    );
    ksvc.metadata = metadata;
    Ok(ksvc)
}

pub async fn reconcile_knative_service(
    api: &Api<KnativeService>,
    isvc: &InferenceService,
    namespace: &str,
    autoscaling: BTreeMap<String, String>,
) -> Result<(ChildAction, KnativeService)> {
    let ksvc = desired_knative_service(isvc, namespace, autoscaling)?;
    let applied = apply_owned(api, &ksvc, OWNED_FIELDS).await?;
    Ok((applied.action, applied.current))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::inferenceservices::{InferenceServiceSpec, PredictorSpec};
    use crate::scaling::{KNATIVE_CLASS_ANNOTATION, KNATIVE_MIN_SCALE_ANNOTATION};
    use serde_json::json;

    fn isvc() -> InferenceService {
        let mut isvc = InferenceService::new(
            "sklearn",
            InferenceServiceSpec {
                predictor: PredictorSpec {
                    template: serde_json::from_value(json!({
                        "metadata": {
                            "annotations": {
                                "autoscaling.knative.dev/min-scale": "5",
                                "sidecar.istio.io/inject": "false"
                            }
                        },
                        "spec": {"containers": [{"image": "sklearn:1"}]}
                    }))
                    .unwrap(),
                    ..Default::default()
                },
            },
        );
        isvc.metadata.uid = Some("isvc-uid".into());
        isvc.metadata.annotations = Some(BTreeMap::from([(
            "serving.kserve.io/deploymentMode".to_string(),
            "Serverless".to_string(),
        )]));
        isvc
    }

    #[test]
    fn synthesized_annotations_win_on_the_revision() {
        let autoscaling = BTreeMap::from([
            (KNATIVE_CLASS_ANNOTATION.to_string(), "kpa.autoscaling.knative.dev".to_string()),
            (KNATIVE_MIN_SCALE_ANNOTATION.to_string(), "1".to_string()),
        ]);
        let ksvc = desired_knative_service(&isvc(), "models", autoscaling).unwrap();

        let revision = ksvc.spec.template.unwrap().metadata.unwrap();
        let annotations = revision.annotations.unwrap();
        assert_eq!(annotations[KNATIVE_MIN_SCALE_ANNOTATION], "1");
        assert_eq!(annotations[KNATIVE_CLASS_ANNOTATION], "kpa.autoscaling.knative.dev");
        assert_eq!(annotations["sidecar.istio.io/inject"], "false");
        assert_eq!(annotations["serving.kserve.io/deploymentMode"], "Serverless");
        assert_eq!(
            revision.labels.unwrap()[INFERENCE_SERVICE_LABEL],
            "sklearn"
        );

        assert_eq!(ksvc.metadata.name.as_deref(), Some("sklearn-predictor"));
        assert!(!ksvc
            .metadata
            .annotations
            .unwrap()
            .contains_key(KNATIVE_MIN_SCALE_ANNOTATION));
    }

    #[test]
    fn serverless_needs_a_pod_spec() {
        let mut isvc = isvc();
        isvc.spec.predictor.template = None;
        assert!(desired_knative_service(&isvc, "models", BTreeMap::new())
            .unwrap_err()
            .is_terminal());
    }
}
