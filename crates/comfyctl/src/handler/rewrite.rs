use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, info};

/// Graph nodes that reference input files, and the input field holding the
/// file name in the API shape.
const FILE_NODE_TYPES: &[(&str, &str)] = &[
    ("LoadImage", "image"),
    ("VHS_LoadVideo", "video"),
    ("LoadImageMask", "image"),
];

/// Rewrite input-file references in a workflow graph.
///
/// Handles both graph shapes: the API form (top-level node-id keys with
/// `class_type` + `inputs`) and the editor form (a `nodes` array with `type`
/// + `widgets_values`). Returns the number of replacements.
pub(crate) fn rewrite_workflow(workflow: &mut Value, mapping: &BTreeMap<String, String>) -> usize {
    if mapping.is_empty() {
        return 0;
    }
    let replaced = if workflow.get("nodes").is_some() {
        debug!("workflow is editor-shaped");
        rewrite_ui(workflow, mapping)
    } else {
        debug!("workflow is API-shaped");
        rewrite_api(workflow, mapping)
    };
    info!("rewrote {replaced} input file reference(s)");
    replaced
}

fn rewrite_api(workflow: &mut Value, mapping: &BTreeMap<String, String>) -> usize {
    let Some(nodes) = workflow.as_object_mut() else {
        return 0;
    };
    let mut replaced = 0;
    for (node_id, node) in nodes {
        let Some(class_type) = node.get("class_type").and_then(Value::as_str) else {
            continue;
        };
        let Some((_, field)) = FILE_NODE_TYPES
            .iter()
            .find(|(name, _)| *name == class_type)
        else {
            continue;
        };
        let class_type = class_type.to_string();
        let Some(inputs) = node.get_mut("inputs").and_then(Value::as_object_mut) else {
            continue;
        };
        let Some(current) = inputs.get(*field).and_then(Value::as_str) else {
            continue;
        };
        if let Some(unique) = mapping.get(current) {
            debug!("node {node_id} ({class_type}): '{current}' -> '{unique}'");
            inputs.insert((*field).to_string(), Value::String(unique.clone()));
            replaced += 1;
        }
    }
    replaced
}

fn rewrite_ui(workflow: &mut Value, mapping: &BTreeMap<String, String>) -> usize {
    let Some(nodes) = workflow.get_mut("nodes").and_then(Value::as_array_mut) else {
        return 0;
    };
    let mut replaced = 0;
    for node in nodes {
        let Some(node_type) = node.get("type").and_then(Value::as_str) else {
            continue;
        };
        if !FILE_NODE_TYPES.iter().any(|(name, _)| *name == node_type) {
            continue;
        }
        let node_id = node.get("id").cloned();
        let node_type = node_type.to_string();
        let Some(widgets) = node.get_mut("widgets_values").and_then(Value::as_array_mut) else {
            continue;
        };
        // The file name conventionally sits in the first widget slot.
        let Some(current) = widgets.first().and_then(Value::as_str) else {
            continue;
        };
        if let Some(unique) = mapping.get(current) {
            debug!("node {node_id:?} ({node_type}): '{current}' -> '{unique}'");
            widgets[0] = Value::String(unique.clone());
            replaced += 1;
        }
    }
    replaced
}
