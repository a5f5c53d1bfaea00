//! Builds the `fields` parameter describing what to fetch for a node.

use crate::definition::DefinitionRegistry;
use crate::error::{Result, ScanError};
use url::Url;

/// Field list for one request against `definition_name`.
///
/// At full depth the node's type metadata and on-demand fields and edges are
/// requested as well. Each included edge is expanded one level with the
/// target type's defaults, as `edge.limit(n){...}`. Names listed under
/// `omit_for_error` in the definition are dropped.
pub fn build_fields(
    registry: &DefinitionRegistry,
    definition_name: &str,
    full_depth: bool,
    omit_for_error: Option<i64>,
) -> Result<Vec<String>> {
    build_nested(registry, definition_name, full_depth, omit_for_error, &mut Vec::new())
}

/// [`build_fields`] joined into a `fields=` value.
pub fn field_param(
    registry: &DefinitionRegistry,
    definition_name: &str,
    full_depth: bool,
    omit_for_error: Option<i64>,
) -> Result<String> {
    Ok(build_fields(registry, definition_name, full_depth, omit_for_error)?.join(","))
}

// `expanding` holds the types whose defaults are currently being inlined, so a
// default edge pointing back at one of them stops at `{id}`.
fn build_nested(
    registry: &DefinitionRegistry,
    definition_name: &str,
    full_depth: bool,
    omit_for_error: Option<i64>,
    expanding: &mut Vec<String>,
) -> Result<Vec<String>> {
    let definition = registry.get(definition_name)?;
    let omitted = omit_for_error.and_then(|code| definition.omitted_for(code));
    let is_omitted = |name: &str| omitted.is_some_and(|names| names.contains(name));

    let mut fields = vec!["id".to_string()];
    if full_depth {
        fields.push("metadata{type}".to_string());
    }

    let on_demand = full_depth.then_some(&definition.on_demand_fields);
    for field in definition
        .default_fields
        .iter()
        .chain(on_demand.into_iter().flatten())
    {
        if field != "id" && !is_omitted(field) {
            fields.push(field.clone());
        }
    }

    for edge in definition.edges(full_depth) {
        if is_omitted(edge) {
            continue;
        }
        let edge_type = definition.edge_type(edge).ok_or_else(|| {
            ScanError::Definition(format!("{}.{} has no edge type", definition_name, edge))
        })?;
        let target = registry.get(edge_type)?;

        let nested = if expanding.iter().any(|t| t == edge_type) {
            "id".to_string()
        } else {
            expanding.push(edge_type.to_string());
            let nested = build_nested(registry, edge_type, false, None, expanding);
            expanding.pop();
            nested?.join(",")
        };
        fields.push(format!("{}.limit({}){{{}}}", edge, target.edge_page_size, nested));
    }

    Ok(fields)
}

/// Query parameters for a single-node request.
pub fn node_params(fields: String) -> Vec<(String, String)> {
    vec![
        ("metadata".to_string(), "1".to_string()),
        ("fields".to_string(), fields),
    ]
}

/// Query parameters for a multi-node request.
pub fn batch_params(node_ids: &[String], fields: String) -> Vec<(String, String)> {
    vec![
        ("ids".to_string(), node_ids.join(",")),
        ("metadata".to_string(), "1".to_string()),
        ("fields".to_string(), fields),
    ]
}

/// The full single-node request URL, without the access token.
pub fn node_request_url(
    registry: &DefinitionRegistry,
    base_url: &str,
    node_id: &str,
    definition_name: &str,
    escape: bool,
) -> Result<String> {
    let fields = field_param(registry, definition_name, true, None)?;
    let node_url = format!("{}/{}", base_url.trim_end_matches('/'), node_id);
    let params = node_params(fields);

    if !escape {
        let query: Vec<String> = params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        return Ok(format!("{}?{}", node_url, query.join("&")));
    }

    let url = Url::parse_with_params(&node_url, &params)
        .map_err(|e| ScanError::InvalidUrl(format!("{}: {}", node_url, e)))?;
    Ok(url.to_string())
}
