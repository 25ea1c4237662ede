//! Utils is shared functions and constants for the controller
#[cfg(test)]
pub mod test;

use std::{collections::BTreeMap, sync::Arc};

use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec, DeploymentStatus},
        core::v1::{ObjectReference, Service, ServiceSpec, ServiceStatus},
    },
    apimachinery::pkg::apis::meta::v1::OwnerReference,
};
use kube::{
    api::{DeleteParams, Patch, PatchParams},
    client::Client,
    core::ObjectMeta,
    runtime::events::{Recorder, Reporter},
    Api, Resource,
};

use crate::{
    keyring::{CephAuth, KeyStore},
    labels::managed_labels_extend,
    CONTROLLER_NAME,
};

/// Operator Context
pub struct Context<A> {
    /// Kube client
    pub k_client: Client,
    /// Cluster key management
    pub ceph_auth: A,
    /// Identity used when publishing events
    pub reporter: Reporter,
}

impl<A> Context<A>
where
    A: CephAuth,
{
    /// Create new context
    pub fn new(k_client: Client, ceph_auth: A) -> Self {
        Context {
            k_client,
            ceph_auth,
            reporter: Reporter {
                controller: CONTROLLER_NAME.to_owned(),
                instance: std::env::var("POD_NAME").ok(),
            },
        }
    }

    /// Key store using the context clients.
    pub fn key_store(&self) -> KeyStore<'_, A> {
        KeyStore::new(&self.k_client, &self.ceph_auth)
    }

    /// Event recorder for an object.
    pub fn recorder(&self, reference: ObjectReference) -> Recorder {
        Recorder::new(self.k_client.clone(), self.reporter.clone(), reference)
    }
}

/// Controller owner reference of `obj`, empty for objects that were never persisted.
pub fn owner_refs<K>(obj: &K) -> Vec<OwnerReference>
where
    K: Resource<DynamicType = ()>,
{
    obj.controller_owner_ref(&()).into_iter().collect()
}

/// Apply a Service with extra labels
pub async fn apply_service(
    cx: Arc<Context<impl CephAuth>>,
    ns: &str,
    orefs: Vec<OwnerReference>,
    name: &str,
    spec: ServiceSpec,
    labels: Option<BTreeMap<String, String>>,
) -> Result<Option<ServiceStatus>, kube::error::Error> {
    let serverside = PatchParams::apply(CONTROLLER_NAME);
    let services: Api<Service> = Api::namespaced(cx.k_client.clone(), ns);

    // Server-side apply service
    let service: Service = Service {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            owner_references: Some(orefs),
            labels: managed_labels_extend(labels),
            ..ObjectMeta::default()
        },
        spec: Some(spec),
        ..Default::default()
    };
    let service = services
        .patch(name, &serverside, &Patch::Apply(service))
        .await?;
    Ok(service.status)
}

/// Delete a service in namespace
pub async fn delete_service(
    cx: Arc<Context<impl CephAuth>>,
    ns: &str,
    name: &str,
) -> Result<(), kube::error::Error> {
    let services: Api<Service> = Api::namespaced(cx.k_client.clone(), ns);

    match services.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(err)) if err.reason == "NotFound" => Ok(()),
        Err(e) => Err(e),
    }
}

/// Apply a deployment in namespace with extra labels
pub async fn apply_deployment(
    cx: Arc<Context<impl CephAuth>>,
    ns: &str,
    orefs: Vec<OwnerReference>,
    name: &str,
    spec: DeploymentSpec,
    labels: Option<BTreeMap<String, String>>,
) -> Result<Option<DeploymentStatus>, kube::error::Error> {
    let serverside = PatchParams::apply(CONTROLLER_NAME);
    let deployments: Api<Deployment> = Api::namespaced(cx.k_client.clone(), ns);

    // Server-side apply deployment
    let deployment: Deployment = Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            owner_references: Some(orefs),
            labels: managed_labels_extend(labels),
            ..ObjectMeta::default()
        },
        spec: Some(spec),
        ..Default::default()
    };
    let deployment = deployments
        .patch(name, &serverside, &Patch::Apply(deployment))
        .await?;
    Ok(deployment.status)
}

/// Delete a deployment in namespace
pub async fn delete_deployment(
    cx: Arc<Context<impl CephAuth>>,
    ns: &str,
    name: &str,
) -> Result<(), kube::error::Error> {
    let deployments: Api<Deployment> = Api::namespaced(cx.k_client.clone(), ns);

    match deployments.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(err)) if err.reason == "NotFound" => Ok(()),
        Err(e) => Err(e),
    }
}
