//! Node type definitions shipped with grapharc, and loading of local ones.

use grapharc_scanner::definition::{DefinitionRegistry, DefinitionSource};
use grapharc_scanner::error::{Result, ScanError};
use grapharc_scanner::result::NodeMetadata;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Type name and JSON source of every bundled definition.
pub const BUNDLED: &[(&str, &str)] = &[
    ("album", include_str!("../definitions/album.json")),
    ("comment", include_str!("../definitions/comment.json")),
    ("object", include_str!("../definitions/object.json")),
    ("page", include_str!("../definitions/page.json")),
    ("photo", include_str!("../definitions/photo.json")),
    ("post", include_str!("../definitions/post.json")),
    ("user", include_str!("../definitions/user.json")),
    ("video", include_str!("../definitions/video.json")),
];

pub fn bundled_registry() -> Result<DefinitionRegistry> {
    let mut registry = DefinitionRegistry::new();
    for (name, json) in BUNDLED {
        registry.register_json(*name, json)?;
    }
    Ok(registry)
}

/// Bundled definitions, overridden and extended by every `<type>.json` in
/// `local_dir`.
pub fn load_registry(local_dir: Option<&Path>) -> Result<DefinitionRegistry> {
    let mut registry = bundled_registry()?;
    let Some(dir) = local_dir else {
        return Ok(registry);
    };

    let mut loaded = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        debug!("Loading definition {} from {}", name, path.display());
        let json = fs::read_to_string(&path)?;
        registry.register_json(name, &json)?;
        loaded += 1;
    }
    info!("Loaded {} local definitions from {}", loaded, dir.display());
    Ok(registry)
}

/// A new definition for a node's type listing every field and connection the
/// API reports, all omitted.
pub fn template_for(metadata: &NodeMetadata) -> Result<String> {
    DefinitionSource::template(metadata.all_names()).to_json_pretty()
}

/// The registered definition for a node's type with any fields it lacks added.
pub fn update_for(registry: &DefinitionRegistry, metadata: &NodeMetadata) -> Result<String> {
    let source = registry.source(&metadata.node_type).ok_or_else(|| {
        ScanError::Definition(format!("no definition for type {}", metadata.node_type))
    })?;
    source.with_new_fields(metadata.all_names()).to_json_pretty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundled_definitions_compile() {
        let registry = bundled_registry().unwrap();
        for (name, _) in BUNDLED {
            let definition = registry.get(name).unwrap();
            assert!(definition.node_batch_size > 0, "{}", name);
        }
    }

    #[test]
    fn test_comment_definition_omits_on_error() {
        let registry = bundled_registry().unwrap();
        let comment = registry.get("comment").unwrap();
        assert_eq!(comment.node_batch_size, 50);
        assert_eq!(comment.edge_page_size, 2000);
        assert!(comment.omitted_for(10).unwrap().contains("object"));
        assert!(comment.omitted_for(1).unwrap().contains("attachment"));
        assert!(!comment.follow_edge("object"));
    }

    #[test]
    fn test_update_keeps_existing_fields() {
        let registry = bundled_registry().unwrap();
        let metadata = NodeMetadata {
            node_type: "user".to_string(),
            fields: vec!["name".to_string(), "birthday".to_string()],
            connections: vec!["photos".to_string()],
        };
        let updated = update_for(&registry, &metadata).unwrap();
        let source = DefinitionSource::from_json(&updated).unwrap();
        assert!(source.fields["name"].default);
        assert!(source.fields["birthday"].omit);
        assert_eq!(source.fields["photos"].comment.as_deref(), Some("Added field"));
    }

    #[test]
    fn test_update_unknown_type() {
        let registry = bundled_registry().unwrap();
        let metadata = NodeMetadata {
            node_type: "group".to_string(),
            fields: vec![],
            connections: vec![],
        };
        assert!(update_for(&registry, &metadata).is_err());
    }
}
