use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Namespace;
use kube::api::ObjectMeta;

use crate::workload::MANAGED_BY;

/// Namespace isolating one environment on the shared cluster. Everything
/// except production is billed to development.
pub fn environment_namespace(environment: &str) -> Namespace {
    let cost_center = if environment == "production" {
        "production"
    } else {
        "development"
    };

    Namespace {
        metadata: ObjectMeta {
            name: Some(environment.to_string()),
            labels: Some(BTreeMap::from([
                ("environment".to_string(), environment.to_string()),
                ("cost-center".to_string(), cost_center.to_string()),
                ("managed-by".to_string(), MANAGED_BY.to_string()),
            ])),
            ..Default::default()
        },
        ..Default::default()
    }
}
