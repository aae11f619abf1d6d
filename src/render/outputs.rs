//! Output resolution against state.

use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::RenderError;
use crate::graph::Output;
use crate::graph::expr::resolve_value;
use crate::state::{DeploymentState, OutputValue};

/// Resolves every output against `state`.
///
/// # Errors
///
/// Returns `RenderError::UnresolvedOutput` naming the first referenced
/// resource that never reached the created state.
pub fn resolve_outputs(
    outputs: &[Output],
    state: &DeploymentState,
) -> Result<BTreeMap<String, OutputValue>, RenderError> {
    let mut resolved = BTreeMap::new();

    for output in outputs {
        for reference in &output.references {
            let Some(recorded) = state.get(&reference.target) else {
                return Err(RenderError::UnresolvedOutput {
                    output: output.name.clone(),
                    resource: reference.target.to_string(),
                    reason: String::from("never reached the created state"),
                });
            };
            if recorded.attribute(&reference.attribute).is_none() {
                return Err(RenderError::UnresolvedOutput {
                    output: output.name.clone(),
                    resource: reference.target.to_string(),
                    reason: format!("has no attribute '{}'", reference.attribute),
                });
            }
        }

        let mut lookup = |reference: &crate::graph::AttributeRef| {
            state
                .get(&reference.target)
                .and_then(|r| r.attribute(&reference.attribute))
                .ok_or_else(|| String::from("unavailable"))
        };
        let value = resolve_value(&Value::String(output.value.clone()), &mut lookup).map_err(
            |failure| RenderError::UnresolvedOutput {
                output: output.name.clone(),
                resource: failure.reference,
                reason: failure.reason,
            },
        )?;

        debug!("Resolved output {}", output.name);
        resolved.insert(
            output.name.clone(),
            OutputValue {
                value,
                sensitive: output.sensitive,
            },
        );
    }

    Ok(resolved)
}
