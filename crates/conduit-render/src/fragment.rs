//! Renderer view of a VectorPipeline

use std::collections::BTreeMap;

use conduit_common::crd::VectorPipeline;

/// One pipeline's components, detached from the CR that declared them
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Fragment {
    /// Namespace of the declaring pipeline
    pub namespace: String,
    /// Name of the declaring pipeline
    pub name: String,
    /// Sources keyed by local id
    pub sources: BTreeMap<String, serde_json::Value>,
    /// Transforms keyed by local id
    pub transforms: BTreeMap<String, serde_json::Value>,
    /// Sinks keyed by local id
    pub sinks: BTreeMap<String, serde_json::Value>,
}

impl Fragment {
    /// Fully-qualified id for a local component id
    pub fn qualify(&self, id: &str) -> String {
        format!("{}-{}-{}", self.namespace, self.name, id)
    }

    /// Whether `id` is a source or transform of this fragment
    pub(crate) fn is_local_input(&self, id: &str) -> bool {
        self.sources.contains_key(id) || self.transforms.contains_key(id)
    }
}

impl From<&VectorPipeline> for Fragment {
    fn from(pipeline: &VectorPipeline) -> Self {
        Self {
            namespace: pipeline.metadata.namespace.clone().unwrap_or_default(),
            name: pipeline.metadata.name.clone().unwrap_or_default(),
            sources: pipeline.spec.sources.clone(),
            transforms: pipeline.spec.transforms.clone(),
            sinks: pipeline.spec.sinks.clone(),
        }
    }
}
