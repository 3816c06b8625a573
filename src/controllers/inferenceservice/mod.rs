pub mod controller;

pub use controller::run;

pub mod reconcilers;
pub use reconcilers::{reconcile_children, ChildAction, ChildKind, ReconcileReport, Settings};

#[cfg(test)]
mod fixtures;
