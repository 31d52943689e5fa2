use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use askama::Template;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, PodSpec,
    PodTemplateSpec, ResourceRequirements, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use tracing::{info, warn};

use crate::config::{ContainerConfig, WorkloadConfig};
use crate::workload::Workload;

#[derive(Debug, thiserror::Error)]
pub enum EdgeError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: io::Error,
    },

    #[error("{origin}: not valid Caddy JSON: {source}")]
    Malformed {
        origin: String,
        source: serde_json::Error,
    },

    #[error("failed to render the fallback Caddy config: {0}")]
    Template(#[from] askama::Error),
}

#[derive(Template)]
#[template(path = "caddy.json", escape = "none")]
struct CaddyConfigTemplate<'a> {
    environment: &'a str,
    fallback_upstream: &'a str,
}

/// The multi-tenant edge proxy for one environment: Caddy behind the cloud
/// load balancer, plus the catch-all backend it forwards unmatched hosts to.
#[derive(Debug, Clone)]
pub struct EdgeStack {
    pub config_map: ConfigMap,
    pub deployment: Deployment,
    pub service: Service,
    pub fallback: Workload,
}

/// Builds the edge stack. The Caddy config is taken from
/// `<config_root>/caddy/caddy-<environment>.json` when that file exists,
/// otherwise a minimal config routing everything to the fallback backend is
/// rendered. Either way the JSON is checked before it lands in a ConfigMap.
pub fn edge_stack(
    config_root: &Path,
    environment: &str,
    namespace: &str,
    cluster_domain: &str,
) -> Result<EdgeStack, EdgeError> {
    let fallback = fallback_workload(environment, namespace, cluster_domain);
    let caddy_config = load_caddy_config(config_root, environment, &fallback.endpoint)?;

    Ok(EdgeStack {
        config_map: build_config_map(namespace, &caddy_config),
        deployment: build_deployment(namespace),
        service: build_service(namespace, environment),
        fallback,
    })
}

fn load_caddy_config(
    config_root: &Path,
    environment: &str,
    fallback_endpoint: &str,
) -> Result<String, EdgeError> {
    let path = config_root
        .join("caddy")
        .join(format!("caddy-{environment}.json"));

    let (origin, contents) = match fs::read_to_string(&path) {
        Ok(contents) => {
            info!("caddy config loaded from {}", path.display());
            (path.display().to_string(), contents)
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            warn!(
                "caddy config not found at {}, using the built-in fallback",
                path.display()
            );
            let rendered = CaddyConfigTemplate {
                environment,
                fallback_upstream: &format!("{fallback_endpoint}:80"),
            }
            .render()?;
            ("fallback caddy config".to_string(), rendered)
        }
        Err(source) => return Err(EdgeError::Io { path, source }),
    };

    serde_json::from_str::<serde_json::Value>(&contents)
        .map_err(|source| EdgeError::Malformed { origin, source })?;
    Ok(contents)
}

/// Catch-all backend answering 200 for any host the proxy does not know,
/// so certificate provisioning for new tenant domains has something to hit.
fn fallback_workload(environment: &str, namespace: &str, cluster_domain: &str) -> Workload {
    let config = WorkloadConfig {
        name: "on-demand".to_string(),
        namespace: namespace.to_string(),
        replicas: 1,
        container: ContainerConfig {
            image: "nossas/tls-on-demand:latest".to_string(),
            image_pull_secrets: None,
            image_pull_policy: None,
            port: 3005,
            command: None,
            args: None,
            env: BTreeMap::from([("ENVIRONMENT".to_string(), environment.to_string())]),
            env_from_secret: BTreeMap::new(),
            resources: Default::default(),
            liveness_probe_path: Some("/healthz".to_string()),
            readiness_probe_path: Some("/healthz".to_string()),
            startup_probe_path: None,
        },
        service: Default::default(),
        ingress: Default::default(),
        labels: BTreeMap::from([("component".to_string(), "backend".to_string())]),
        annotations: BTreeMap::new(),
        volumes: Vec::new(),
        service_account: None,
    };

    Workload::from_config(&config, cluster_domain)
}

fn caddy_labels(extra: &[(&str, &str)]) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([("app".to_string(), "caddy".to_string())]);
    for (key, value) in extra {
        labels.insert(key.to_string(), value.to_string());
    }
    labels
}

fn build_config_map(namespace: &str, caddy_config: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some("caddy-config".to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(caddy_labels(&[])),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            "caddy.json".to_string(),
            caddy_config.to_string(),
        )])),
        ..Default::default()
    }
}

fn build_deployment(namespace: &str) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some("caddy".to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(caddy_labels(&[("component", "ingress")])),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(BTreeMap::from([(
                    "app".to_string(),
                    "caddy".to_string(),
                )])),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(caddy_labels(&[])),
                    // bumped to roll the pods when the config changes shape
                    annotations: Some(BTreeMap::from([(
                        "config/revision".to_string(),
                        "1".to_string(),
                    )])),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "caddy".to_string(),
                        image: Some("caddy:2-alpine".to_string()),
                        args: Some(vec![
                            "caddy".to_string(),
                            "run".to_string(),
                            "--config".to_string(),
                            "/etc/caddy/caddy.json".to_string(),
                        ]),
                        ports: Some(vec![
                            ContainerPort {
                                container_port: 80,
                                name: Some("http".to_string()),
                                ..Default::default()
                            },
                            ContainerPort {
                                container_port: 443,
                                name: Some("https".to_string()),
                                ..Default::default()
                            },
                        ]),
                        volume_mounts: Some(vec![
                            VolumeMount {
                                name: "caddy-config".to_string(),
                                mount_path: "/etc/caddy".to_string(),
                                ..Default::default()
                            },
                            VolumeMount {
                                name: "caddy-data".to_string(),
                                mount_path: "/data".to_string(),
                                ..Default::default()
                            },
                        ]),
                        resources: Some(ResourceRequirements {
                            requests: Some(BTreeMap::from([
                                ("memory".to_string(), Quantity("64Mi".to_string())),
                                ("cpu".to_string(), Quantity("50m".to_string())),
                            ])),
                            limits: Some(BTreeMap::from([
                                ("memory".to_string(), Quantity("128Mi".to_string())),
                                ("cpu".to_string(), Quantity("100m".to_string())),
                            ])),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }],
                    volumes: Some(vec![
                        Volume {
                            name: "caddy-config".to_string(),
                            config_map: Some(ConfigMapVolumeSource {
                                name: "caddy-config".to_string(),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                        Volume {
                            name: "caddy-data".to_string(),
                            empty_dir: Some(EmptyDirVolumeSource::default()),
                            ..Default::default()
                        },
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_service(namespace: &str, environment: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some("caddy".to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(caddy_labels(&[("environment", environment)])),
            annotations: Some(BTreeMap::from([
                (
                    "service.beta.kubernetes.io/aws-load-balancer-type".to_string(),
                    "nlb".to_string(),
                ),
                (
                    "service.beta.kubernetes.io/aws-load-balancer-scheme".to_string(),
                    "internet-facing".to_string(),
                ),
                (
                    "service.beta.kubernetes.io/aws-load-balancer-cross-zone-load-balancing-enabled"
                        .to_string(),
                    "true".to_string(),
                ),
            ])),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("LoadBalancer".to_string()),
            external_traffic_policy: Some("Local".to_string()),
            selector: Some(BTreeMap::from([(
                "app".to_string(),
                "caddy".to_string(),
            )])),
            ports: Some(vec![
                ServicePort {
                    name: Some("http".to_string()),
                    protocol: Some("TCP".to_string()),
                    port: 80,
                    target_port: Some(IntOrString::Int(80)),
                    ..Default::default()
                },
                ServicePort {
                    name: Some("https".to_string()),
                    protocol: Some("TCP".to_string()),
                    port: 443,
                    target_port: Some(IntOrString::Int(443)),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
