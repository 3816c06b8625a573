pub mod inferenceservices;
pub mod keda;
pub mod knative;
