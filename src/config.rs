use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::Volume;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// One deployable service, as declared in `config/<environment>/<name>.yml`.
///
/// Deserialization is strict: unknown keys fail the load so that a typo in a
/// declaration is caught before anything reaches the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct WorkloadConfig {
    pub name: String,
    pub namespace: String,
    #[serde(default = "default_replicas")]
    pub replicas: i32,
    pub container: ContainerConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub ingress: IngressConfig,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Extra pod volumes, forwarded to the Deployment without interpretation.
    #[serde(default)]
    pub volumes: Vec<Volume>,
    pub service_account: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ContainerConfig {
    pub image: String,
    pub image_pull_secrets: Option<Vec<String>>,
    pub image_pull_policy: Option<String>,
    pub port: i32,
    pub command: Option<Vec<String>>,
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Variables read from Kubernetes secrets, `VAR -> secret name`. The key
    /// inside the secret must match the variable name.
    #[serde(default)]
    pub env_from_secret: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: ResourcesConfig,
    /// HTTP liveness probe path. Set to null to disable the probe.
    #[serde(default = "default_liveness_path")]
    pub liveness_probe_path: Option<String>,
    /// HTTP readiness probe path. Set to null to disable the probe.
    #[serde(default = "default_readiness_path")]
    pub readiness_probe_path: Option<String>,
    pub startup_probe_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct ResourcesConfig {
    pub requests: BTreeMap<String, String>,
    pub limits: BTreeMap<String, String>,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            requests: BTreeMap::from([
                ("memory".to_string(), "64Mi".to_string()),
                ("cpu".to_string(), "50m".to_string()),
            ]),
            limits: BTreeMap::from([
                ("memory".to_string(), "128Mi".to_string()),
                ("cpu".to_string(), "100m".to_string()),
            ]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub enum ServiceType {
    #[default]
    ClusterIP,
    NodePort,
    LoadBalancer,
}

impl ServiceType {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceType::ClusterIP => "ClusterIP",
            ServiceType::NodePort => "NodePort",
            ServiceType::LoadBalancer => "LoadBalancer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    #[serde(rename = "type")]
    pub type_: ServiceType,
    pub port: i32,
    /// Container port the service forwards to; defaults to `container.port`.
    pub target_port: Option<i32>,
    pub annotations: BTreeMap<String, String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            type_: ServiceType::ClusterIP,
            port: 80,
            target_port: None,
            annotations: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct IngressConfig {
    pub enabled: bool,
    pub host: Option<String>,
    pub path: String,
    pub tls_secret: Option<String>,
    pub annotations: BTreeMap<String, String>,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: None,
            path: "/".to_string(),
            tls_secret: None,
            annotations: BTreeMap::new(),
        }
    }
}

fn default_replicas() -> i32 {
    1
}

fn default_liveness_path() -> Option<String> {
    Some("/health".to_string())
}

fn default_readiness_path() -> Option<String> {
    Some("/ready".to_string())
}

/// A single failed constraint, located by its dotted field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub field: String,
    pub problem: String,
}

impl Violation {
    fn new(field: impl Into<String>, problem: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            problem: problem.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.problem)
    }
}

/// Every constraint a declaration broke, collected in one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violations(pub Vec<Violation>);

impl fmt::Display for Violations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, violation) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{violation}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Violations {}

impl WorkloadConfig {
    /// Semantic checks on top of what deserialization already enforces.
    /// Reports every violation instead of stopping at the first.
    pub fn validate(&self) -> Result<(), Violations> {
        let mut found = Vec::new();

        check_dns_label(&mut found, "name", &self.name);
        check_dns_label(&mut found, "namespace", &self.namespace);
        if self.replicas < 1 {
            found.push(Violation::new(
                "replicas",
                format!("must be at least 1, got {}", self.replicas),
            ));
        }
        if let Some(account) = &self.service_account {
            check_dns_label(&mut found, "service_account", account);
        }
        self.container.check(&mut found);
        self.service.check(&mut found);
        self.ingress.check(&mut found);

        if found.is_empty() {
            Ok(())
        } else {
            Err(Violations(found))
        }
    }
}

impl ContainerConfig {
    fn check(&self, found: &mut Vec<Violation>) {
        if self.image.trim().is_empty() {
            found.push(Violation::new("container.image", "must not be empty"));
        }
        check_port(found, "container.port", self.port);

        for var in self.env.keys().chain(self.env_from_secret.keys()) {
            if var.is_empty() {
                found.push(Violation::new(
                    "container.env",
                    "variable names must not be empty",
                ));
            }
        }
        for var in self.env.keys() {
            if self.env_from_secret.contains_key(var) {
                found.push(Violation::new(
                    format!("container.env.{var}"),
                    "also declared in env_from_secret; a variable can only have one source",
                ));
            }
        }
        for (var, secret) in &self.env_from_secret {
            if !is_dns_label(secret) {
                found.push(Violation::new(
                    format!("container.env_from_secret.{var}"),
                    format!("{secret:?} is not a valid secret name"),
                ));
            }
        }

        check_probe_path(
            found,
            "container.liveness_probe_path",
            &self.liveness_probe_path,
        );
        check_probe_path(
            found,
            "container.readiness_probe_path",
            &self.readiness_probe_path,
        );
        check_probe_path(
            found,
            "container.startup_probe_path",
            &self.startup_probe_path,
        );
    }
}

impl ServiceConfig {
    fn check(&self, found: &mut Vec<Violation>) {
        check_port(found, "service.port", self.port);
        if let Some(target_port) = self.target_port {
            check_port(found, "service.target_port", target_port);
        }
    }
}

impl IngressConfig {
    fn check(&self, found: &mut Vec<Violation>) {
        if self.enabled && self.host.is_none() {
            found.push(Violation::new(
                "ingress.host",
                "required when ingress.enabled is true",
            ));
        }
        if !self.path.starts_with('/') {
            found.push(Violation::new(
                "ingress.path",
                format!("{:?} must start with '/'", self.path),
            ));
        }
    }
}

/// RFC 1123 label: what Kubernetes accepts as an object name.
pub(crate) fn is_dns_label(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 63
        && !value.starts_with('-')
        && !value.ends_with('-')
        && value
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

fn check_dns_label(found: &mut Vec<Violation>, field: &str, value: &str) {
    if !is_dns_label(value) {
        found.push(Violation::new(
            field,
            format!("{value:?} is not a valid DNS label (lowercase alphanumerics and '-', at most 63 characters)"),
        ));
    }
}

fn check_port(found: &mut Vec<Violation>, field: &str, port: i32) {
    if !(1..=65535).contains(&port) {
        found.push(Violation::new(
            field,
            format!("must be between 1 and 65535, got {port}"),
        ));
    }
}

fn check_probe_path(found: &mut Vec<Violation>, field: &str, path: &Option<String>) {
    if let Some(path) = path {
        if !path.starts_with('/') {
            found.push(Violation::new(field, format!("{path:?} must start with '/'")));
        }
    }
}
