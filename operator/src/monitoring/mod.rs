//! prometheus-operator resources.
//!
//! Only the subset of the ServiceMonitor API needed to scrape the exporters is modelled.
use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Declares how prometheus scrapes a set of services.
#[derive(CustomResource, Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "monitoring.coreos.com",
    version = "v1",
    kind = "ServiceMonitor",
    plural = "servicemonitors",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMonitorSpec {
    /// Namespaces in which services are selected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<NamespaceSelector>,
    /// Selects the scraped services.
    pub selector: LabelSelector,
    /// Scrape endpoints of the selected services.
    pub endpoints: Vec<Endpoint>,
}

/// Namespaces in which services are selected.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceSelector {
    /// Explicit namespace names.
    pub match_names: Vec<String>,
}

/// A scrape endpoint.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    /// Name of the service port.
    pub port: String,
    /// HTTP path of the metrics.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Scrape interval, i.e. `5s`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    /// Keep labels of scraped series over target labels.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub honor_labels: Option<bool>,
    /// Target relabeling applied before scraping.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relabelings: Option<Vec<RelabelConfig>>,
}

/// A single relabeling rule.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RelabelConfig {
    /// Relabel action, `replace` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Label written by the rule.
    pub target_label: String,
    /// Value written to the target label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replacement: Option<String>,
}

/// Labels that let a prometheus instance discover rook service monitors.
pub fn service_monitor_labels() -> BTreeMap<String, String> {
    BTreeMap::from_iter([("team".to_owned(), "rook".to_owned())])
}
