use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PodSpec, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::Api;
use tracing::*;
use url::Url;

use crate::resources::inferenceservices::InferenceService;
use crate::{Error, Result};

use super::owned::{apply_owned, superset, OwnedField};
use super::{object_meta, selector_labels, ChildAction};

// Default port for model servers that declare none
const DEFAULT_PREDICTOR_PORT: i32 = 8080;
const SERVICE_PORT: i32 = 80;

const OWNED_FIELDS: &[OwnedField] = &[
    superset("/metadata/labels"),
    superset("/spec/selector"),
    superset("/spec/ports"),
];

/// Create or update the ClusterIP Service in front of the predictor Deployment.
/// The Service always listens on port 80, whatever port the model server uses.
pub async fn reconcile_service(
    svc_api: &Api<Service>,
    isvc: &InferenceService,
    namespace: &str,
    deployment: &Deployment,
) -> Result<ChildAction> {
    // Determine the port to expose
    let port = find_service_port(
        deployment
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref()),
    );

    let service = Service {
        metadata: object_meta(isvc, namespace)?,
        spec: Some(ServiceSpec {
            selector: Some(selector_labels(isvc)),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: SERVICE_PORT, // always expose 80, irrelevant of the target
                protocol: Some("TCP".to_string()),
                target_port: Some(IntOrString::Int(port)),
                ..Default::default()
            }]),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        status: None,
    };

    let applied = apply_owned(svc_api, &service, OWNED_FIELDS).await?;
    debug!(
        "Service {} in namespace {namespace} targets port {port}: {}",
        super::predictor_name(isvc),
        applied.action.as_str()
    );

    Ok(applied.action)
}

/// Find the appropriate target port by examining containers
fn find_service_port(pod_spec: Option<&PodSpec>) -> i32 {
    let mut all_ports = pod_spec
        .iter()
        .flat_map(|t| t.containers.iter())
        .flat_map(|c| c.ports.iter())
        .flat_map(|p| p.iter());

    let Some(first_port) = all_ports.next() else {
        // default to 8080 if there are no ports
        return DEFAULT_PREDICTOR_PORT;
    };

    if first_port.name.as_deref() == Some("http") {
        return first_port.container_port;
    }

    if let Some(http_port) = all_ports.find(|port| port.name.as_deref() == Some("http")) {
        return http_port.container_port;
    }

    // default to the first port if none are named http
    first_port.container_port
}

/// The in-cluster address of a raw predictor's Service
pub fn cluster_local_url(name: &str, namespace: &str) -> Result<String> {
    let url = Url::parse(&format!("http://{name}.{namespace}.svc.cluster.local"))
        .map_err(|err| Error::InvalidSpec(format!("{name} does not form a valid host: {err}")))?;
    Ok(url.as_str().trim_end_matches('/').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod_spec(containers: serde_json::Value) -> PodSpec {
        serde_json::from_value(json!({ "containers": containers })).unwrap()
    }

    #[test]
    fn port_named_http_wins() {
        let spec = pod_spec(json!([
            {"name": "model", "ports": [{"name": "metrics", "containerPort": 9090}]},
            {"name": "sidecar", "ports": [{"name": "http", "containerPort": 8081}]}
        ]));
        assert_eq!(find_service_port(Some(&spec)), 8081);
    }

    #[test]
    fn first_port_is_used_without_an_http_port() {
        let spec = pod_spec(json!([
            {"name": "model", "ports": [{"containerPort": 5000}, {"containerPort": 6000}]}
        ]));
        assert_eq!(find_service_port(Some(&spec)), 5000);
    }

    #[test]
    fn default_port_without_any_ports() {
        let spec = pod_spec(json!([{"name": "model"}]));
        assert_eq!(find_service_port(Some(&spec)), 8080);
        assert_eq!(find_service_port(None), 8080);
    }

    #[test]
    fn url_is_cluster_local() {
        assert_eq!(
            cluster_local_url("sklearn-predictor", "models").unwrap(),
            "http://sklearn-predictor.models.svc.cluster.local"
        );
        assert!(matches!(
            cluster_local_url("bad name", "models"),
            Err(Error::InvalidSpec(_))
        ));
    }
}
