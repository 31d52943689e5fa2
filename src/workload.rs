use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, HTTPGetAction, LocalObjectReference, PodSpec,
    PodTemplateSpec, Probe, ResourceRequirements, SecretKeySelector, Service, ServicePort,
    ServiceSpec,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;

use crate::config::{ContainerConfig, WorkloadConfig};

pub const MANAGED_BY: &str = "flotilla";

const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";
const INGRESS_CLASS: &str = "caddy";

/// The Kubernetes objects one service declaration expands to.
#[derive(Debug, Clone)]
pub struct Workload {
    pub deployment: Deployment,
    pub service: Service,
    pub ingress: Option<Ingress>,
    /// In-cluster DNS name of the service.
    pub endpoint: String,
}

impl Workload {
    pub fn from_config(config: &WorkloadConfig, cluster_domain: &str) -> Workload {
        Workload {
            deployment: build_deployment(config),
            service: build_service(config),
            ingress: config.ingress.enabled.then(|| build_ingress(config)),
            endpoint: format!("{}.{}.{}", config.name, config.namespace, cluster_domain),
        }
    }

    pub fn name(&self) -> &str {
        self.deployment.metadata.name.as_deref().unwrap_or_default()
    }
}

fn labels(config: &WorkloadConfig) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([
        ("app".to_string(), config.name.clone()),
        ("managed-by".to_string(), MANAGED_BY.to_string()),
    ]);
    labels.extend(config.labels.clone());
    labels
}

fn match_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), name.to_string())])
}

fn non_empty(map: &BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    if map.is_empty() {
        None
    } else {
        Some(map.clone())
    }
}

/// Plain variables first, then secret-backed ones. The secret key is the
/// variable name itself, matching how the environment secrets are written.
fn env_vars(container: &ContainerConfig) -> Vec<EnvVar> {
    let mut vars = Vec::with_capacity(container.env.len() + container.env_from_secret.len());

    for (name, value) in &container.env {
        vars.push(EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        });
    }

    for (name, secret) in &container.env_from_secret {
        vars.push(EnvVar {
            name: name.clone(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: secret.clone(),
                    key: name.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    vars
}

fn http_probe(path: &str, port: i32, initial_delay_seconds: i32, period_seconds: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(port),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay_seconds),
        period_seconds: Some(period_seconds),
        ..Default::default()
    }
}

fn quantities(map: &BTreeMap<String, String>) -> BTreeMap<String, Quantity> {
    map.iter()
        .map(|(resource, amount)| (resource.clone(), Quantity(amount.clone())))
        .collect()
}

fn build_deployment(config: &WorkloadConfig) -> Deployment {
    let container = &config.container;

    Deployment {
        metadata: ObjectMeta {
            name: Some(config.name.clone()),
            namespace: Some(config.namespace.clone()),
            labels: Some(labels(config)),
            annotations: non_empty(&config.annotations),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(config.replicas),
            selector: LabelSelector {
                match_labels: Some(match_labels(&config.name)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels(config)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: config.service_account.clone(),
                    image_pull_secrets: container.image_pull_secrets.as_ref().map(|names| {
                        names
                            .iter()
                            .map(|name| LocalObjectReference {
                                name: name.clone(),
                            })
                            .collect()
                    }),
                    volumes: if config.volumes.is_empty() {
                        None
                    } else {
                        Some(config.volumes.clone())
                    },
                    containers: vec![Container {
                        name: config.name.clone(),
                        image: Some(container.image.clone()),
                        image_pull_policy: container.image_pull_policy.clone(),
                        command: container.command.clone(),
                        args: container.args.clone(),
                        ports: Some(vec![ContainerPort {
                            container_port: container.port,
                            ..Default::default()
                        }]),
                        env: Some(env_vars(container)),
                        resources: Some(ResourceRequirements {
                            requests: Some(quantities(&container.resources.requests)),
                            limits: Some(quantities(&container.resources.limits)),
                            ..Default::default()
                        }),
                        liveness_probe: container
                            .liveness_probe_path
                            .as_deref()
                            .map(|path| http_probe(path, container.port, 30, 10)),
                        readiness_probe: container
                            .readiness_probe_path
                            .as_deref()
                            .map(|path| http_probe(path, container.port, 5, 5)),
                        startup_probe: container
                            .startup_probe_path
                            .as_deref()
                            .map(|path| http_probe(path, container.port, 10, 10)),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_service(config: &WorkloadConfig) -> Service {
    let target_port = config
        .service
        .target_port
        .unwrap_or(config.container.port);

    Service {
        metadata: ObjectMeta {
            name: Some(config.name.clone()),
            namespace: Some(config.namespace.clone()),
            labels: Some(labels(config)),
            annotations: non_empty(&config.service.annotations),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(match_labels(&config.name)),
            ports: Some(vec![ServicePort {
                port: config.service.port,
                target_port: Some(IntOrString::Int(target_port)),
                ..Default::default()
            }]),
            type_: Some(config.service.type_.as_str().to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_ingress(config: &WorkloadConfig) -> Ingress {
    let mut annotations = BTreeMap::from([(
        INGRESS_CLASS_ANNOTATION.to_string(),
        INGRESS_CLASS.to_string(),
    )]);
    annotations.extend(config.ingress.annotations.clone());

    Ingress {
        metadata: ObjectMeta {
            name: Some(config.name.clone()),
            namespace: Some(config.namespace.clone()),
            labels: Some(labels(config)),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            rules: Some(vec![IngressRule {
                host: config.ingress.host.clone(),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some(config.ingress.path.clone()),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: config.name.clone(),
                                port: Some(ServiceBackendPort {
                                    number: Some(config.service.port),
                                    ..Default::default()
                                }),
                            }),
                            ..Default::default()
                        },
                    }],
                }),
            }]),
            tls: config.ingress.tls_secret.as_ref().map(|secret| {
                vec![IngressTLS {
                    hosts: config.ingress.host.as_ref().map(|host| vec![host.clone()]),
                    secret_name: Some(secret.clone()),
                }]
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}
