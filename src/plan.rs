use std::path::Path;

use k8s_openapi::api::core::v1::{Namespace, Secret};
use serde::Serialize;
use tracing::info;

use crate::config::is_dns_label;
use crate::edge::{edge_stack, EdgeError, EdgeStack};
use crate::loader::{load_service_configs, LoadError};
use crate::namespace::environment_namespace;
use crate::secrets::{load_secret_specs, materialize, SecretError};
use crate::workload::Workload;

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("{0:?} is not a valid environment name (lowercase alphanumerics and '-', at most 63 characters)")]
    InvalidEnvironment(String),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Secrets(#[from] SecretError),

    #[error(transparent)]
    Edge(#[from] EdgeError),

    #[error("service {service:?}: variable {var:?} references undeclared secret {secret:?}")]
    UnknownSecret {
        service: String,
        var: String,
        secret: String,
    },
}

/// Everything one environment deploys, in apply order.
#[derive(Debug, Clone)]
pub struct EnvironmentPlan {
    pub environment: String,
    pub namespace: Namespace,
    pub secrets: Vec<Secret>,
    pub edge: EdgeStack,
    pub workloads: Vec<Workload>,
}

/// Assembles the full plan for one environment: namespace, secrets, edge
/// proxy, and one workload per service declaration. Secret references in the
/// declarations are checked against the declared secrets here, so a dangling
/// reference fails the plan instead of a pod.
pub fn plan_environment(
    config_root: &Path,
    environment: &str,
    cluster_domain: &str,
) -> Result<EnvironmentPlan, PlanError> {
    if !is_dns_label(environment) {
        return Err(PlanError::InvalidEnvironment(environment.to_string()));
    }

    // The namespace carries the environment name, one namespace per
    // environment on the shared cluster.
    let namespace_name = environment;

    let secret_specs = load_secret_specs(config_root, environment)?;
    let services = load_service_configs(config_root, environment)?;

    for (service, config) in &services {
        for (var, secret) in &config.container.env_from_secret {
            if !secret_specs.contains_key(secret) {
                return Err(PlanError::UnknownSecret {
                    service: service.clone(),
                    var: var.clone(),
                    secret: secret.clone(),
                });
            }
        }
    }

    let secrets = secret_specs
        .iter()
        .map(|(name, spec)| materialize(name, namespace_name, spec))
        .collect::<Result<Vec<_>, _>>()?;

    let edge = edge_stack(config_root, environment, namespace_name, cluster_domain)?;

    let workloads: Vec<Workload> = services
        .values()
        .map(|config| Workload::from_config(config, cluster_domain))
        .collect();

    info!(
        "planned environment {environment}: {} secrets, {} services",
        secrets.len(),
        workloads.len()
    );

    Ok(EnvironmentPlan {
        environment: environment.to_string(),
        namespace: environment_namespace(environment),
        secrets,
        edge,
        workloads,
    })
}

/// Renders the whole plan as multi-document YAML, in apply order.
pub fn render_yaml(plan: &EnvironmentPlan) -> Result<String, serde_yaml::Error> {
    let mut out = String::new();

    append(&mut out, &plan.namespace)?;
    for secret in &plan.secrets {
        append(&mut out, secret)?;
    }
    append(&mut out, &plan.edge.config_map)?;
    append(&mut out, &plan.edge.deployment)?;
    append(&mut out, &plan.edge.service)?;
    append_workload(&mut out, &plan.edge.fallback)?;
    for workload in &plan.workloads {
        append_workload(&mut out, workload)?;
    }

    Ok(out)
}

fn append<T: Serialize>(out: &mut String, object: &T) -> Result<(), serde_yaml::Error> {
    out.push_str("---\n");
    out.push_str(&serde_yaml::to_string(object)?);
    Ok(())
}

fn append_workload(out: &mut String, workload: &Workload) -> Result<(), serde_yaml::Error> {
    append(out, &workload.deployment)?;
    append(out, &workload.service)?;
    if let Some(ingress) = &workload.ingress {
        append(out, ingress)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use tempfile::tempdir;

    use super::{plan_environment, render_yaml, PlanError};

    const DOMAIN: &str = "svc.cluster.local";

    fn scaffold(root: &Path) {
        let dir = root.join("sandbox");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("api.yml"),
            "name: api\n\
             namespace: sandbox\n\
             container:\n\
             \x20 image: org/api:1.0\n\
             \x20 port: 8080\n\
             \x20 env_from_secret: {ACTION_SECRET_KEY: action-secret}\n",
        )
        .unwrap();
        fs::write(
            dir.join("public.yml"),
            "name: public\n\
             namespace: sandbox\n\
             replicas: 2\n\
             container: {image: \"org/public:1.0\", port: 3000}\n\
             ingress: {enabled: true, host: public.example.org}\n",
        )
        .unwrap();
        fs::write(
            root.join("sandbox.secrets.yml"),
            "action-secret:\n\
             \x20 kind: literal\n\
             \x20 data: {ACTION_SECRET_KEY: s3cret}\n",
        )
        .unwrap();
    }

    #[test]
    fn plan_covers_every_declared_service() {
        let root = tempdir().unwrap();
        scaffold(root.path());

        let plan = plan_environment(root.path(), "sandbox", DOMAIN).unwrap();
        assert_eq!(plan.environment, "sandbox");
        assert_eq!(plan.secrets.len(), 1);
        assert_eq!(plan.workloads.len(), 2);
        assert_eq!(plan.workloads[0].name(), "api");
        assert_eq!(plan.workloads[1].name(), "public");
        assert!(plan.workloads[1].ingress.is_some());
        assert_eq!(plan.namespace.metadata.name.as_deref(), Some("sandbox"));
    }

    #[test]
    fn dangling_secret_reference_fails_the_plan() {
        let root = tempdir().unwrap();
        scaffold(root.path());
        fs::write(
            root.path().join("sandbox/worker.yml"),
            "name: worker\n\
             namespace: sandbox\n\
             container:\n\
             \x20 image: org/worker:1.0\n\
             \x20 port: 9000\n\
             \x20 env_from_secret: {API_TOKEN: missing-secret}\n",
        )
        .unwrap();

        let err = plan_environment(root.path(), "sandbox", DOMAIN).unwrap_err();
        match err {
            PlanError::UnknownSecret { service, var, secret } => {
                assert_eq!(service, "worker");
                assert_eq!(var, "API_TOKEN");
                assert_eq!(secret, "missing-secret");
            }
            other => panic!("expected UnknownSecret, got {other:?}"),
        }
    }

    #[test]
    fn environment_name_must_be_a_label() {
        let root = tempdir().unwrap();
        let err = plan_environment(root.path(), "Sand Box", DOMAIN).unwrap_err();
        assert!(matches!(err, PlanError::InvalidEnvironment(_)), "{err:?}");
    }

    #[test]
    fn rendered_plan_is_parseable_multi_document_yaml() {
        let root = tempdir().unwrap();
        scaffold(root.path());

        let plan = plan_environment(root.path(), "sandbox", DOMAIN).unwrap();
        let rendered = render_yaml(&plan).unwrap();

        let docs: Vec<serde_yaml::Value> = rendered
            .split("---\n")
            .filter(|doc| !doc.trim().is_empty())
            .map(|doc| serde_yaml::from_str(doc).unwrap())
            .collect();
        // namespace + secret + caddy (3) + fallback (2) + api (2) + public (3)
        assert_eq!(docs.len(), 12);
        assert_eq!(docs[0]["kind"], "Namespace");
        assert!(docs
            .iter()
            .any(|doc| doc["kind"] == "Ingress" && doc["metadata"]["name"] == "public"));
    }
}
