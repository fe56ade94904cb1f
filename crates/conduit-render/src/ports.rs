//! Ports opened by rendered sources

use serde_json::Value;

use crate::render::RenderedConfig;

/// A port a source listens on
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListeningPort {
    /// Fully-qualified source id
    pub component: String,
    /// Port number
    pub port: u16,
    /// `TCP` or `UDP`
    pub protocol: &'static str,
}

impl ListeningPort {
    /// Service port name: a DNS label unique per source
    pub fn port_name(&self) -> String {
        conduit_common::kube_utils::sanitize_name(&format!("{}-{}", self.port, self.component), 15)
    }
}

/// Extract `(component, port)` pairs from sources whose `address` ends in `:<port>`
pub fn listening_ports(config: &RenderedConfig) -> Vec<ListeningPort> {
    let Ok(value) = serde_json::from_str::<Value>(config.as_str()) else {
        return Vec::new();
    };
    let Some(sources) = value.get("sources").and_then(Value::as_object) else {
        return Vec::new();
    };

    sources
        .iter()
        .filter_map(|(id, source)| {
            let address = source.get("address")?.as_str()?;
            let (_, port) = address.rsplit_once(':')?;
            let port = port.parse::<u16>().ok()?;
            let protocol = match source.get("mode").and_then(Value::as_str) {
                Some("udp") => "UDP",
                _ => "TCP",
            };
            Some(ListeningPort {
                component: id.clone(),
                port,
                protocol,
            })
        })
        .collect()
}
