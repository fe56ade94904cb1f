//! Fragment merge

use std::collections::BTreeMap;

use conduit_common::crd::VectorRuntimeSpec;
use conduit_common::kube_utils::deterministic_hash;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::MergeError;
use crate::fragment::Fragment;

/// Source id used when no fragment contributes anything
const IDLE_SOURCE: &str = "conduit-idle-metrics";
/// Sink id used when no fragment contributes anything
const IDLE_SINK: &str = "conduit-idle-sink";

/// Per-workload settings every rendered config starts from
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BaseConfig {
    /// Vector `data_dir`
    pub data_dir: String,
    /// Port for the Vector API; `None` disables it
    pub api_port: Option<u16>,
}

impl BaseConfig {
    /// Base derived from a workload's runtime spec
    pub fn for_runtime(spec: &VectorRuntimeSpec) -> Self {
        Self {
            data_dir: spec.data_dir().to_string(),
            api_port: spec.api.enabled.then_some(spec.api.port),
        }
    }
}

/// Merged configuration for one workload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderedConfig {
    json: String,
    content_hash: String,
}

impl RenderedConfig {
    /// Serialized configuration
    pub fn bytes(&self) -> &[u8] {
        self.json.as_bytes()
    }

    /// Serialized configuration as text
    pub fn as_str(&self) -> &str {
        &self.json
    }

    /// 16-hex-char content hash of [`Self::bytes`]
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }
}

#[derive(Serialize)]
struct ApiBlock {
    enabled: bool,
    address: String,
}

#[derive(Serialize)]
struct VectorConfig<'a> {
    data_dir: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    api: Option<ApiBlock>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    sources: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    transforms: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    sinks: BTreeMap<String, Value>,
}

#[derive(Default)]
struct Merged {
    sources: BTreeMap<String, Value>,
    transforms: BTreeMap<String, Value>,
    sinks: BTreeMap<String, Value>,
}

impl Merged {
    fn contains(&self, id: &str) -> bool {
        self.sources.contains_key(id)
            || self.transforms.contains_key(id)
            || self.sinks.contains_key(id)
    }

    /// Whether `input` names a source or transform, or a named output of one
    fn resolves(&self, input: &str) -> bool {
        if input.contains('*') {
            return true;
        }
        self.sources
            .keys()
            .chain(self.transforms.keys())
            .any(|id| matches_component(input, id))
    }
}

fn matches_component(input: &str, id: &str) -> bool {
    input == id
        || input
            .strip_prefix(id)
            .is_some_and(|rest| rest.starts_with('.'))
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Source,
    Transform,
    Sink,
}

/// Merge `fragments` on top of `base`.
///
/// Fragment order does not affect the output.
pub fn render(base: &BaseConfig, fragments: &[Fragment]) -> Result<RenderedConfig, MergeError> {
    let mut ordered: Vec<&Fragment> = fragments.iter().collect();
    ordered.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));

    let mut merged = Merged::default();
    for fragment in ordered {
        merge_fragment(&mut merged, fragment)?;
    }

    for (id, body) in merged.transforms.iter().chain(merged.sinks.iter()) {
        for input in inputs_of(body) {
            if !merged.resolves(input) {
                return Err(MergeError::UnknownInput {
                    component: id.clone(),
                    input: input.to_string(),
                });
            }
        }
    }

    if merged.sinks.is_empty() {
        if !merged.sources.is_empty() {
            return Err(MergeError::NoSinks);
        }
        add_idle_components(&mut merged);
    }

    let config = VectorConfig {
        data_dir: &base.data_dir,
        api: base.api_port.map(|port| ApiBlock {
            enabled: true,
            address: format!("0.0.0.0:{port}"),
        }),
        sources: merged.sources,
        transforms: merged.transforms,
        sinks: merged.sinks,
    };
    // Serializing maps of JSON values cannot fail
    let json = serde_json::to_string_pretty(&config).unwrap_or_default();
    let content_hash = deterministic_hash(&json);
    debug!(
        fragments = fragments.len(),
        hash = %content_hash,
        "rendered vector config"
    );
    Ok(RenderedConfig { json, content_hash })
}

/// Check one fragment on its own merit.
///
/// Only structure is checked. Inputs that point outside the fragment and a
/// missing sink are allowed, since another fragment may supply them.
pub fn check_fragment(fragment: &Fragment) -> Result<(), MergeError> {
    let mut merged = Merged::default();
    merge_fragment(&mut merged, fragment)
}

fn merge_fragment(merged: &mut Merged, fragment: &Fragment) -> Result<(), MergeError> {
    let sections = [
        (Section::Source, &fragment.sources),
        (Section::Transform, &fragment.transforms),
        (Section::Sink, &fragment.sinks),
    ];
    for (section, components) in sections {
        for (id, body) in components {
            let qualified = fragment.qualify(id);
            let component = qualify_component(fragment, section, &qualified, body)?;
            if merged.contains(&qualified) {
                return Err(MergeError::DuplicateComponent {
                    component: qualified,
                });
            }
            let target = match section {
                Section::Source => &mut merged.sources,
                Section::Transform => &mut merged.transforms,
                Section::Sink => &mut merged.sinks,
            };
            target.insert(qualified, component);
        }
    }
    Ok(())
}

/// Validate one component and rewrite its local inputs to qualified ids
fn qualify_component(
    fragment: &Fragment,
    section: Section,
    qualified: &str,
    body: &Value,
) -> Result<Value, MergeError> {
    let Some(object) = body.as_object() else {
        return Err(MergeError::NotAnObject {
            component: qualified.to_string(),
        });
    };
    if !object.get("type").is_some_and(Value::is_string) {
        return Err(MergeError::MissingType {
            component: qualified.to_string(),
        });
    }

    let mut object = object.clone();
    if section == Section::Source {
        return Ok(Value::Object(object));
    }

    let inputs = object
        .get("inputs")
        .ok_or_else(|| MergeError::MissingInputs {
            component: qualified.to_string(),
        })?
        .as_array()
        .ok_or_else(|| MergeError::InvalidInputs {
            component: qualified.to_string(),
        })?;

    let mut rewritten = Vec::with_capacity(inputs.len());
    for input in inputs {
        let Some(input) = input.as_str() else {
            return Err(MergeError::InvalidInputs {
                component: qualified.to_string(),
            });
        };
        rewritten.push(Value::String(rewrite_input(fragment, input)));
    }
    object.insert("inputs".to_string(), Value::Array(rewritten));
    Ok(Value::Object(object))
}

/// `id` or `id.output` of a local component becomes the qualified form
fn rewrite_input(fragment: &Fragment, input: &str) -> String {
    if fragment.is_local_input(input) {
        return fragment.qualify(input);
    }
    if let Some((head, output)) = input.split_once('.') {
        if fragment.is_local_input(head) {
            return format!("{}.{}", fragment.qualify(head), output);
        }
    }
    input.to_string()
}

fn inputs_of(body: &Value) -> impl Iterator<Item = &str> {
    body.get("inputs")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
}

/// Vector refuses to start without components, so an unattached workload
/// runs a self-contained no-op pipeline
fn add_idle_components(merged: &mut Merged) {
    merged.sources.insert(
        IDLE_SOURCE.to_string(),
        serde_json::json!({ "type": "internal_metrics" }),
    );
    merged.sinks.insert(
        IDLE_SINK.to_string(),
        serde_json::json!({
            "type": "blackhole",
            "inputs": [IDLE_SOURCE],
            "print_interval_secs": 0
        }),
    );
}
