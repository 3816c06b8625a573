use kube::CustomResourceExt;

fn main() {
    print!(
        "{}",
        serde_yaml::to_string(&isvc_scaling_operator::resources::inferenceservices::InferenceService::crd())
            .unwrap()
    )
}
