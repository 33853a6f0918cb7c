//! In-memory storage backend over an ordered tree.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use super::{Storage, Tag};
use crate::error::{LabError, LabResult};
use crate::serialization::{Key, Value};

enum TreeNode {
    Leaf(Value),
    Node(BTreeMap<String, TreeNode>),
}

/// Tagged storage held entirely in process memory.
///
/// Children are kept in a `BTreeMap`, so descending subtag listings come
/// straight from reverse iteration.
#[derive(Default)]
pub struct MemoryStorage {
    root: RwLock<BTreeMap<String, TreeNode>>,
}

impl MemoryStorage {
    /// Creates an empty storage tree.
    pub fn new() -> Self {
        Self::default()
    }

    fn descend<'a>(
        mut children: &'a BTreeMap<String, TreeNode>,
        components: &[String],
    ) -> Option<&'a TreeNode> {
        let (last, inner) = components.split_last()?;
        for component in inner {
            match children.get(component) {
                Some(TreeNode::Node(next)) => children = next,
                _ => return None,
            }
        }
        children.get(last)
    }
}

impl Storage for MemoryStorage {
    fn save(&self, data: &Value, tag: &Tag) -> LabResult<()> {
        if tag.is_root() {
            return Err(LabError::NodeAlreadyExists(tag.to_string()));
        }
        let mut guard = self.root.write();
        let mut children = &mut *guard;
        let components = tag.components();
        let Some((last, inner)) = components.split_last() else {
            return Err(LabError::NodeAlreadyExists(tag.to_string()));
        };
        for (depth, component) in inner.iter().enumerate() {
            let entry = children
                .entry(component.clone())
                .or_insert_with(|| TreeNode::Node(BTreeMap::new()));
            match entry {
                TreeNode::Node(next) => children = next,
                TreeNode::Leaf(_) => {
                    let occupied = Tag::new(components[..=depth].to_vec())?;
                    return Err(LabError::NodeAlreadyExists(occupied.to_string()));
                }
            }
        }
        match children.get(last) {
            Some(TreeNode::Node(_)) => Err(LabError::NodeAlreadyExists(tag.to_string())),
            _ => {
                children.insert(last.clone(), TreeNode::Leaf(data.clone()));
                Ok(())
            }
        }
    }

    fn load(&self, tag: &Tag) -> LabResult<Value> {
        let guard = self.root.read();
        match Self::descend(&guard, tag.components()) {
            Some(TreeNode::Leaf(value)) => Ok(value.clone()),
            _ => Err(LabError::NoDataAtKey(tag.to_string())),
        }
    }

    fn list_subtags(&self, tag: &Tag, limit: usize) -> LabResult<Vec<String>> {
        let guard = self.root.read();
        let children = if tag.is_root() {
            Some(&*guard)
        } else {
            match Self::descend(&guard, tag.components()) {
                Some(TreeNode::Node(children)) => Some(children),
                _ => None,
            }
        };
        let Some(children) = children else {
            return Ok(Vec::new());
        };
        let subtags = children.keys().rev().cloned();
        Ok(if limit > 0 {
            subtags.take(limit).collect()
        } else {
            subtags.collect()
        })
    }

    fn tag_in_storage(&self, tag: &Tag) -> LabResult<bool> {
        if tag.is_root() {
            return Ok(true);
        }
        let guard = self.root.read();
        Ok(Self::descend(&guard, tag.components()).is_some())
    }

    fn load_field(&self, tag: &Tag, field: &Key) -> LabResult<Value> {
        let leaf = self.load(tag)?;
        leaf.as_map()
            .and_then(|map| map.get(field))
            .cloned()
            .ok_or_else(|| LabError::NoDataAtKey(format!("{}[{}]", tag, field)))
    }

    fn update_field(&self, value: &Value, tag: &Tag, field: &Key) -> LabResult<()> {
        let mut guard = self.root.write();
        let mut children = &mut *guard;
        let components = tag.components();
        if components.is_empty() {
            return Err(LabError::NodeAlreadyExists(tag.to_string()));
        }
        let (last, inner) = (
            &components[components.len() - 1],
            &components[..components.len() - 1],
        );
        for component in inner {
            match children.get_mut(component) {
                Some(TreeNode::Node(next)) => children = next,
                _ => return Err(LabError::NoDataAtKey(tag.to_string())),
            }
        }
        match children.get_mut(last) {
            Some(TreeNode::Leaf(Value::Map(map))) => {
                map.insert(field.clone(), value.clone());
                Ok(())
            }
            Some(TreeNode::Leaf(_)) => Err(LabError::NoDataAtKey(tag.to_string())),
            Some(TreeNode::Node(_)) => Err(LabError::NodeAlreadyExists(tag.to_string())),
            None => Err(LabError::NoDataAtKey(tag.to_string())),
        }
    }
}
