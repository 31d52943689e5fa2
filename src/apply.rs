use anyhow::{anyhow, Context, Result};
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use crate::plan::EnvironmentPlan;
use crate::workload::Workload;

const FIELD_MANAGER: &str = "flotilla";

/// Hands the plan to the cluster with server-side apply, one object at a
/// time in dependency order. Applying the same plan twice is a no-op: the
/// API server owns diffing and only changes what drifted.
pub async fn apply_environment(client: Client, plan: &EnvironmentPlan) -> Result<()> {
    let params = PatchParams::apply(FIELD_MANAGER).force();

    let namespaces: Api<Namespace> = Api::all(client.clone());
    apply(&namespaces, &plan.namespace, &params).await?;

    let namespace = plan
        .namespace
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| anyhow!("namespace is missing metadata.name"))?;

    for secret in &plan.secrets {
        apply(&Api::namespaced(client.clone(), namespace), secret, &params).await?;
    }

    apply(
        &Api::namespaced(client.clone(), namespace),
        &plan.edge.config_map,
        &params,
    )
    .await?;
    apply(
        &Api::namespaced(client.clone(), namespace),
        &plan.edge.deployment,
        &params,
    )
    .await?;
    apply(
        &Api::namespaced(client.clone(), namespace),
        &plan.edge.service,
        &params,
    )
    .await?;
    apply_workload(&client, namespace, &plan.edge.fallback, &params).await?;

    for workload in &plan.workloads {
        apply_workload(&client, namespace, workload, &params).await?;
        info!(
            "service {} available at {}",
            workload.name(),
            workload.endpoint
        );
    }

    info!("environment {} applied", plan.environment);
    Ok(())
}

async fn apply_workload(
    client: &Client,
    namespace: &str,
    workload: &Workload,
    params: &PatchParams,
) -> Result<()> {
    apply(
        &Api::namespaced(client.clone(), namespace),
        &workload.deployment,
        params,
    )
    .await?;
    apply(
        &Api::namespaced(client.clone(), namespace),
        &workload.service,
        params,
    )
    .await?;
    if let Some(ingress) = &workload.ingress {
        apply(&Api::namespaced(client.clone(), namespace), ingress, params).await?;
    }
    Ok(())
}

async fn apply<K>(api: &Api<K>, object: &K, params: &PatchParams) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + std::fmt::Debug,
{
    let kind = K::kind(&());
    let name = object
        .meta()
        .name
        .clone()
        .ok_or_else(|| anyhow!("{kind} object is missing metadata.name"))?;

    api.patch(&name, params, &Patch::Apply(object))
        .await
        .with_context(|| format!("failed to apply {kind} {name}"))?;
    info!("applied {kind} {name}");
    Ok(())
}
