// src/files/tree.rs - Flattening the device's folder/file tree into a flat catalog
use serde::{Deserialize, Serialize};

/// One node of the file tree reported by the device. Nodes with `children` are
/// folders; everything else is a file leaf.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FileNode {
    pub id: Option<String>,
    pub name: Option<String>,
    pub size: Option<u64>,
    pub timestamp: Option<f64>,
    pub children: Option<Vec<FileNode>>,
}

impl FileNode {
    pub fn folder(children: Vec<FileNode>) -> Self {
        Self {
            children: Some(children),
            ..Self::default()
        }
    }

    pub fn file(id: &str, name: &str, size: u64, timestamp: f64) -> Self {
        Self {
            id: Some(id.to_string()),
            name: Some(name.to_string()),
            size: Some(size),
            timestamp: Some(timestamp),
            children: None,
        }
    }
}

/// A file stored on the printer, as the host lists it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrinterFileEntry {
    /// Device path without the leading separator.
    pub path: String,
    pub display: String,
    pub size: u64,
    /// Modification time, seconds since the epoch.
    pub date: i64,
}

/// Flattens the children of `root` depth-first, in the order the device
/// reported them.
pub fn project(root: &FileNode) -> Vec<PrinterFileEntry> {
    let mut entries = Vec::new();
    if let Some(children) = &root.children {
        flatten_into(children, &mut entries);
    }
    entries
}

fn flatten_into(nodes: &[FileNode], entries: &mut Vec<PrinterFileEntry>) {
    for node in nodes {
        if let Some(children) = &node.children {
            flatten_into(children, entries);
            continue;
        }
        let Some(id) = node.id.as_deref() else {
            tracing::debug!("Skipping file node without an id: {:?}", node.name);
            continue;
        };
        let path = id.strip_prefix('/').unwrap_or(id);
        let display = match &node.name {
            Some(name) => name.clone(),
            None => path.rsplit('/').next().unwrap_or(path).to_string(),
        };
        entries.push(PrinterFileEntry {
            path: path.to_string(),
            display,
            size: node.size.unwrap_or(0),
            date: node.timestamp.map(|t| t as i64).unwrap_or(0),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_tree_is_flattened_in_order() {
        let tree: FileNode = serde_json::from_str(
            r#"{"children": [
                {"children": [{"id": "/a/b.gcode", "name": "b.gcode", "size": 10, "timestamp": 5}]},
                {"id": "/c.gcode", "name": "c.gcode", "size": 1, "timestamp": 0}
            ]}"#,
        )
        .unwrap();

        let entries = project(&tree);
        assert_eq!(
            entries,
            vec![
                PrinterFileEntry {
                    path: "a/b.gcode".to_string(),
                    display: "b.gcode".to_string(),
                    size: 10,
                    date: 5,
                },
                PrinterFileEntry {
                    path: "c.gcode".to_string(),
                    display: "c.gcode".to_string(),
                    size: 1,
                    date: 0,
                },
            ]
        );
    }

    #[test]
    fn test_missing_fields_default() {
        let tree = FileNode::folder(vec![
            FileNode {
                id: Some("/cache/plate_1.gcode.3mf".to_string()),
                timestamp: Some(1700000000.9),
                ..FileNode::default()
            },
            FileNode {
                name: Some("orphan.gcode".to_string()),
                ..FileNode::default()
            },
        ]);
        let entries = project(&tree);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "cache/plate_1.gcode.3mf");
        assert_eq!(entries[0].display, "plate_1.gcode.3mf");
        assert_eq!(entries[0].size, 0);
        assert_eq!(entries[0].date, 1700000000);
    }

    #[test]
    fn test_empty_folders_and_leaf_root() {
        let tree = FileNode::folder(vec![FileNode::folder(vec![]), FileNode::folder(vec![])]);
        assert!(project(&tree).is_empty());
        assert!(project(&FileNode::file("/x.gcode", "x.gcode", 1, 1.0)).is_empty());
    }
}
