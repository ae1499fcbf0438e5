use std::{fs, path::Path};

use anyhow::Error;
use schemars::schema_for;

use crate::{
    connection::CloudantConfigNode,
    flow::Flow,
    nodes::{attachments::AttachmentNode, modify::ModifyNode, query::QueryNode},
};

/// Writes the flow schema and one schema per node type into `out_dir`.
/// Returns the file names written.
pub fn write_schema(out_dir: &Path) -> Result<Vec<String>, Error> {
    fs::create_dir_all(out_dir)?;

    let schemas = [
        ("flow.schema.json".to_string(), schema_for!(Flow)),
        ("config-cloudant.schema.json".to_string(), schema_for!(CloudantConfigNode)),
        (node_file(ModifyNode::TYPE), schema_for!(ModifyNode)),
        (node_file(QueryNode::TYPE), schema_for!(QueryNode)),
        (node_file(AttachmentNode::TYPE), schema_for!(AttachmentNode)),
    ];

    let mut written = Vec::with_capacity(schemas.len());
    for (file, schema) in schemas {
        fs::write(out_dir.join(&file), serde_json::to_string_pretty(&schema)?)?;
        written.push(file);
    }
    Ok(written)
}

fn node_file(type_name: &str) -> String {
    format!("node-{}.schema.json", type_name.replace(' ', "-"))
}
