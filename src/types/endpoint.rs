use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// The role an endpoint plays, relevant only under the disaggregated
/// prefill/decode routing logic; plain deployments leave this `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointRole {
    Prefill,
    Decode,
    Transcription,
}

/// An immutable-by-convention description of one backend engine, as produced
/// by service discovery. Updates are published by replacing the whole record
/// in the discovery map rather than mutating fields in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub url: String,
    pub models: BTreeSet<String>,
    pub role: Option<EndpointRole>,
    pub pod_name: Option<String>,
    pub sleeping: bool,
    pub added_timestamp: f64,
}

impl Endpoint {
    pub fn new(url: impl Into<String>, models: impl IntoIterator<Item = String>) -> Self {
        Self {
            url: url.into(),
            models: models.into_iter().collect(),
            role: None,
            pod_name: None,
            sleeping: false,
            added_timestamp: 0.0,
        }
    }

    pub fn with_role(mut self, role: EndpointRole) -> Self {
        self.role = Some(role);
        self
    }

    pub fn serves(&self, model: &str) -> bool {
        self.models.contains(model)
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url
    }
}
impl Eq for Endpoint {}

impl PartialOrd for Endpoint {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Endpoint {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.url.cmp(&other.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serves_checks_model_membership() {
        let ep = Endpoint::new("http://a:8000", vec!["opt-125m".to_string()]);
        assert!(ep.serves("opt-125m"));
        assert!(!ep.serves("llama-3-8b"));
    }
}
