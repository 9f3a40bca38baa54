//! YAML flow files
//!
//! ```yaml
//! flows:
//!   welcome:
//!     steps:
//!       - kind: say
//!         text: Hi! How can I help?
//! ```

use super::{FlowConfigError, FlowDefinition, FlowsList};
use crate::validators::ValidatorRegistry;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Deserialize)]
struct FlowsFile {
    flows: BTreeMap<String, FlowDefinition>,
}

/// Parse a YAML document into flow definitions, names taken from the map keys.
///
/// Validation is NOT performed here; see [`FlowsList::new`].
pub fn parse_flows(yaml: &str) -> Result<Vec<FlowDefinition>, FlowConfigError> {
    let file: FlowsFile = serde_yaml::from_str(yaml)?;
    Ok(file
        .flows
        .into_iter()
        .map(|(name, mut flow)| {
            flow.name = name;
            flow
        })
        .collect())
}

/// Read, parse and validate a flow file
pub fn load_flows(
    path: impl AsRef<Path>,
    validators: &ValidatorRegistry,
) -> Result<FlowsList, FlowConfigError> {
    let path = path.as_ref();
    let yaml = std::fs::read_to_string(path).map_err(|source| FlowConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let flows = FlowsList::new(parse_flows(&yaml)?, validators)?;
    tracing::info!(path = %path.display(), flows = flows.len(), "Loaded flows");
    Ok(flows)
}
