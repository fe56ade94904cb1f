//! CRD installation and printing

use conduit_common::crd::all_crds;
use conduit_common::kube_utils::FIELD_MANAGER;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};

/// Install or update every conduit CRD using server-side apply
pub async fn install_crds(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in all_crds() {
        let name = crd.name_any();
        tracing::info!(crd = %name, "installing CRD");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", name, e))?;
    }

    tracing::info!("all CRDs installed/updated");
    Ok(())
}

/// Every CRD as a multi-document YAML stream
pub fn crd_yaml() -> anyhow::Result<String> {
    let docs = all_crds()
        .iter()
        .map(serde_yaml::to_string)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("failed to serialize CRD: {}", e))?;
    Ok(docs.join("---\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_contains_every_kind() {
        let yaml = crd_yaml().unwrap();
        assert_eq!(yaml.matches("kind: CustomResourceDefinition").count(), 4);
        for kind in [
            "VectorAgent",
            "VectorAggregator",
            "ClusterVectorAggregator",
            "VectorPipeline",
        ] {
            assert!(yaml.contains(&format!("kind: {kind}")), "missing {kind}");
        }
    }

    #[test]
    fn status_timestamps_are_typed_date_time() {
        let yaml = crd_yaml().unwrap();
        assert!(yaml.contains("lastValidated:"));
        assert!(yaml.contains("format: date-time"));
    }

    #[test]
    fn crds_are_named_after_plural_and_group() {
        let names: Vec<String> = all_crds().iter().map(|c| c.name_any()).collect();
        assert!(names.contains(&"vectorpipelines.observability.conduit.dev".to_string()));
        assert!(names.contains(&"clustervectoraggregators.observability.conduit.dev".to_string()));
    }
}
