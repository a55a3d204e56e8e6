//! Mind-map document model
//!
//! Nodes live in a slot arena addressed by [`NodeIndex`], with a side index from
//! the wire-level [`TargetId`] to the slot. Parent and child links are arena
//! indices, so the tree never holds references into itself.
//!
//! # Payload keys
//!
//! - `create`: `text`, `x`, `y`, `parent_id` (all optional), plus any extra fields
//! - `update`: `text`, `x`, `y`, plus extra fields (`null` removes an extra field)
//! - `move`: `parent_id` (`null` detaches to a root), `x`, `y`
//!
//! Operations on other target types are ignored.

use crate::error::{SyncError, SyncResult};
use crate::ids::{DocumentId, TargetId};
use crate::operation::{Operation, OperationDraft, OperationType, Payload, TargetType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Stable arena slot of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeIndex(usize);

/// A single mind-map node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MindMapNode {
    pub id: TargetId,
    pub text: String,
    pub x: f64,
    pub y: f64,
    /// Fields the model does not interpret (colour, collapsed state, ...).
    pub fields: Payload,
    parent: Option<NodeIndex>,
    children: Vec<NodeIndex>,
}

impl MindMapNode {
    fn new(id: TargetId) -> Self {
        Self {
            id,
            text: String::new(),
            x: 0.0,
            y: 0.0,
            fields: Payload::new(),
            parent: None,
            children: Vec::new(),
        }
    }
}

/// Field changes parsed out of an operation payload.
#[derive(Debug, Default)]
struct NodePatch {
    text: Option<String>,
    x: Option<f64>,
    y: Option<f64>,
    /// `Some(None)` detaches the node to a root.
    parent: Option<Option<TargetId>>,
    extra: Payload,
}

impl NodePatch {
    fn from_payload(data: &Payload) -> SyncResult<Self> {
        let mut patch = NodePatch::default();
        for (key, value) in data {
            match key.as_str() {
                "text" => {
                    let text = value.as_str().ok_or_else(|| invalid(key, "a string"))?;
                    patch.text = Some(text.to_string());
                }
                "x" => patch.x = Some(value.as_f64().ok_or_else(|| invalid(key, "a number"))?),
                "y" => patch.y = Some(value.as_f64().ok_or_else(|| invalid(key, "a number"))?),
                "parent_id" => {
                    patch.parent = Some(match value {
                        Value::Null => None,
                        Value::String(id) => Some(TargetId::new(id.as_str())),
                        _ => return Err(invalid(key, "a string or null")),
                    });
                }
                _ => {
                    patch.extra.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(patch)
    }
}

fn invalid(key: &str, expected: &str) -> SyncError {
    SyncError::InvalidPayload(format!("`{key}` must be {expected}"))
}

fn cycle(id: &TargetId, parent_id: &TargetId) -> SyncError {
    SyncError::InvalidPayload(format!(
        "cannot move {id} under its own descendant {parent_id}"
    ))
}

fn parsed_payload(
    target_type: TargetType,
    operation_type: OperationType,
    data: &Payload,
) -> SyncResult<Option<NodePatch>> {
    if target_type != TargetType::Node {
        return Ok(None);
    }
    match operation_type {
        OperationType::Create | OperationType::Update | OperationType::Move => {
            NodePatch::from_payload(data).map(Some)
        }
        OperationType::Delete | OperationType::Noop => Ok(None),
    }
}

/// Mind-map document that resolved operations are applied to.
#[derive(Clone, Debug, Default)]
pub struct MindMap {
    document_id: DocumentId,
    slots: Vec<Option<MindMapNode>>,
    free: Vec<usize>,
    index: HashMap<TargetId, NodeIndex>,
}

impl MindMap {
    /// Create an empty mind map
    pub fn new(document_id: impl Into<DocumentId>) -> Self {
        Self {
            document_id: document_id.into(),
            ..Self::default()
        }
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    /// Check that a local edit would apply cleanly to the current tree.
    ///
    /// Catches badly typed payloads, a parent that does not exist and a move
    /// that would close a cycle, before anything is queued.
    pub fn check(&self, draft: &OperationDraft) -> SyncResult<()> {
        let Some(patch) = parsed_payload(draft.target_type, draft.operation_type, &draft.data)?
        else {
            return Ok(());
        };
        let Some(Some(parent_id)) = patch.parent else {
            return Ok(());
        };

        match draft.operation_type {
            OperationType::Create if !self.contains(&draft.target_id) => {
                self.resolve(&parent_id)?;
            }
            OperationType::Move => {
                if let Some(index) = self.index.get(&draft.target_id).copied() {
                    let parent = self.resolve(&parent_id)?;
                    if parent == index || self.is_ancestor_of(index, parent) {
                        return Err(cycle(&draft.target_id, &parent_id));
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Check only the payload shape of an operation.
    ///
    /// The outcome depends on the operation alone, so every replica reaches
    /// the same verdict.
    pub fn check_payload(&self, op: &Operation) -> SyncResult<()> {
        parsed_payload(op.target_type, op.operation_type, &op.data).map(|_| ())
    }

    /// Nodes on the path from `from` up to, but excluding, `ancestor`.
    ///
    /// Returns `None` unless `ancestor` is `from` itself or one of its
    /// ancestors; moving `ancestor` under `from` would then close a cycle
    /// through the returned nodes.
    pub fn ancestor_path(&self, from: &TargetId, ancestor: &TargetId) -> Option<Vec<TargetId>> {
        let stop = *self.index.get(ancestor)?;
        let mut current = *self.index.get(from)?;
        let mut path = Vec::new();
        loop {
            if current == stop {
                return Some(path);
            }
            let node = self.node(current)?;
            path.push(node.id.clone());
            current = node.parent?;
        }
    }

    /// Turn a node into a root, keeping its subtree.
    ///
    /// Returns false if the node is missing or already a root.
    pub fn detach(&mut self, id: &TargetId) -> bool {
        let Some(index) = self.index.get(id).copied() else {
            return false;
        };
        if self.node(index).and_then(|n| n.parent).is_none() {
            return false;
        }
        self.unlink(index);
        true
    }

    /// Apply a resolved operation.
    ///
    /// Returns whether the document changed. Updating, moving or deleting a
    /// missing node changes nothing; creating an existing node is likewise a
    /// no-op so redelivery is harmless.
    pub fn apply(&mut self, op: &Operation) -> SyncResult<bool> {
        if op.document_id != self.document_id {
            return Err(SyncError::InvalidPayload(format!(
                "operation for document {} applied to {}",
                op.document_id, self.document_id
            )));
        }
        if op.target_type != TargetType::Node {
            return Ok(false);
        }

        match op.operation_type {
            OperationType::Create => self.create(&op.target_id, &op.data),
            OperationType::Update => self.update(&op.target_id, &op.data),
            OperationType::Move => self.move_node(&op.target_id, &op.data),
            OperationType::Delete => Ok(self.delete(&op.target_id) > 0),
            OperationType::Noop => Ok(false),
        }
    }

    fn create(&mut self, id: &TargetId, data: &Payload) -> SyncResult<bool> {
        if self.index.contains_key(id) {
            return Ok(false);
        }
        let patch = NodePatch::from_payload(data)?;
        let parent = match patch.parent.clone().flatten() {
            Some(parent_id) => Some(self.resolve(&parent_id)?),
            None => None,
        };

        let mut node = MindMapNode::new(id.clone());
        node.text = patch.text.unwrap_or_default();
        node.x = patch.x.unwrap_or_default();
        node.y = patch.y.unwrap_or_default();
        node.fields = patch.extra;

        let index = self.alloc(node);
        if let Some(parent) = parent {
            self.link(index, parent);
        }
        self.index.insert(id.clone(), index);
        Ok(true)
    }

    fn update(&mut self, id: &TargetId, data: &Payload) -> SyncResult<bool> {
        let Some(index) = self.index.get(id).copied() else {
            return Ok(false);
        };
        let patch = NodePatch::from_payload(data)?;
        let Some(node) = self.node_mut(index) else {
            return Ok(false);
        };

        if let Some(text) = patch.text {
            node.text = text;
        }
        if let Some(x) = patch.x {
            node.x = x;
        }
        if let Some(y) = patch.y {
            node.y = y;
        }
        for (key, value) in patch.extra {
            if value.is_null() {
                node.fields.remove(&key);
            } else {
                node.fields.insert(key, value);
            }
        }
        Ok(true)
    }

    fn move_node(&mut self, id: &TargetId, data: &Payload) -> SyncResult<bool> {
        let Some(index) = self.index.get(id).copied() else {
            return Ok(false);
        };
        let patch = NodePatch::from_payload(data)?;

        if let Some(parent) = patch.parent {
            let new_parent = match parent {
                Some(parent_id) => {
                    let parent = self.resolve(&parent_id)?;
                    if parent == index || self.is_ancestor_of(index, parent) {
                        return Err(cycle(id, &parent_id));
                    }
                    Some(parent)
                }
                None => None,
            };
            self.unlink(index);
            if let Some(parent) = new_parent {
                self.link(index, parent);
            }
        }

        if let Some(node) = self.node_mut(index) {
            if let Some(x) = patch.x {
                node.x = x;
            }
            if let Some(y) = patch.y {
                node.y = y;
            }
        }
        Ok(true)
    }

    /// Remove a node and its descendants. Returns how many nodes were removed.
    fn delete(&mut self, id: &TargetId) -> usize {
        let Some(index) = self.index.get(id).copied() else {
            return 0;
        };
        self.unlink(index);

        let mut removed = 0;
        let mut stack = vec![index];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.slots.get_mut(current.0).and_then(Option::take) {
                stack.extend(node.children.iter().copied());
                self.index.remove(&node.id);
                self.free.push(current.0);
                removed += 1;
            }
        }
        removed
    }

    fn resolve(&self, id: &TargetId) -> SyncResult<NodeIndex> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| SyncError::NodeNotFound(id.clone()))
    }

    fn alloc(&mut self, node: MindMapNode) -> NodeIndex {
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                NodeIndex(slot)
            }
            None => {
                self.slots.push(Some(node));
                NodeIndex(self.slots.len() - 1)
            }
        }
    }

    fn link(&mut self, child: NodeIndex, parent: NodeIndex) {
        if let Some(node) = self.node_mut(parent) {
            node.children.push(child);
        }
        if let Some(node) = self.node_mut(child) {
            node.parent = Some(parent);
        }
    }

    fn unlink(&mut self, child: NodeIndex) {
        let parent = self.node(child).and_then(|n| n.parent);
        if let Some(parent) = parent {
            if let Some(node) = self.node_mut(parent) {
                node.children.retain(|&c| c != child);
            }
        }
        if let Some(node) = self.node_mut(child) {
            node.parent = None;
        }
    }

    /// Check if `ancestor` lies on the path from `node` to its root.
    fn is_ancestor_of(&self, ancestor: NodeIndex, node: NodeIndex) -> bool {
        let mut current = self.node(node).and_then(|n| n.parent);
        while let Some(index) = current {
            if index == ancestor {
                return true;
            }
            current = self.node(index).and_then(|n| n.parent);
        }
        false
    }

    fn node(&self, index: NodeIndex) -> Option<&MindMapNode> {
        self.slots.get(index.0).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, index: NodeIndex) -> Option<&mut MindMapNode> {
        self.slots.get_mut(index.0).and_then(Option::as_mut)
    }

    /// Get a node by ID
    pub fn get(&self, id: &TargetId) -> Option<&MindMapNode> {
        self.index.get(id).and_then(|&index| self.node(index))
    }

    /// Check if a node exists
    pub fn contains(&self, id: &TargetId) -> bool {
        self.index.contains_key(id)
    }

    /// Get the parent of a node
    pub fn parent(&self, id: &TargetId) -> Option<&TargetId> {
        let node = self.get(id)?;
        node.parent.and_then(|p| self.node(p)).map(|p| &p.id)
    }

    /// Get the children of a node, in insertion order
    pub fn children(&self, id: &TargetId) -> Vec<&TargetId> {
        self.get(id)
            .map(|node| {
                node.children
                    .iter()
                    .filter_map(|&c| self.node(c))
                    .map(|c| &c.id)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Nodes without a parent
    pub fn roots(&self) -> Vec<&TargetId> {
        let mut roots: Vec<_> = self
            .slots
            .iter()
            .flatten()
            .filter(|n| n.parent.is_none())
            .map(|n| &n.id)
            .collect();
        roots.sort();
        roots
    }

    /// Get the depth of a node (roots are at depth 0)
    pub fn depth(&self, id: &TargetId) -> Option<usize> {
        let mut current = self.get(id)?;
        let mut depth = 0;
        while let Some(parent) = current.parent.and_then(|p| self.node(p)) {
            depth += 1;
            current = parent;
        }
        Some(depth)
    }

    /// Get the number of nodes
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::CausalClock;
    use crate::ids::ParticipantId;
    use crate::operation::OperationDraft;
    use serde_json::json;

    fn op(kind: OperationType, target: &str, data: Value) -> Operation {
        let draft = OperationDraft::new(
            kind,
            "map-1",
            target,
            data.as_object().cloned().unwrap_or_default(),
        );
        Operation::from_draft(
            draft,
            ParticipantId::new("user_1"),
            CausalClock::from_entries([("user_1", 1)]),
        )
    }

    fn sample() -> MindMap {
        let mut map = MindMap::new("map-1");
        map.apply(&op(OperationType::Create, "root", json!({"text": "Trip"})))
            .unwrap();
        map.apply(&op(
            OperationType::Create,
            "a",
            json!({"text": "Tokyo", "parent_id": "root", "x": 10, "y": 20}),
        ))
        .unwrap();
        map.apply(&op(OperationType::Create, "b", json!({"parent_id": "a"})))
            .unwrap();
        map
    }

    fn id(s: &str) -> TargetId {
        TargetId::new(s)
    }

    #[test]
    fn test_create_builds_tree() {
        let map = sample();
        assert_eq!(map.len(), 3);
        assert_eq!(map.roots(), vec![&id("root")]);
        assert_eq!(map.children(&id("root")), vec![&id("a")]);
        assert_eq!(map.parent(&id("b")), Some(&id("a")));
        assert_eq!(map.depth(&id("b")), Some(2));

        let a = map.get(&id("a")).unwrap();
        assert_eq!(a.text, "Tokyo");
        assert_eq!((a.x, a.y), (10.0, 20.0));
    }

    #[test]
    fn test_create_is_idempotent() {
        let mut map = sample();
        let again = op(OperationType::Create, "a", json!({"text": "Osaka"}));
        assert!(!map.apply(&again).unwrap());
        assert_eq!(map.get(&id("a")).unwrap().text, "Tokyo");
    }

    #[test]
    fn test_create_under_missing_parent() {
        let mut map = MindMap::new("map-1");
        let orphan = op(OperationType::Create, "a", json!({"parent_id": "ghost"}));
        assert_eq!(
            map.apply(&orphan),
            Err(SyncError::NodeNotFound(id("ghost")))
        );
        assert!(map.is_empty());
    }

    #[test]
    fn test_update_fields() {
        let mut map = sample();
        let update = op(
            OperationType::Update,
            "a",
            json!({"text": "Hello Japan", "color": "red"}),
        );
        assert!(map.apply(&update).unwrap());

        let a = map.get(&id("a")).unwrap();
        assert_eq!(a.text, "Hello Japan");
        assert_eq!(a.fields["color"], json!("red"));

        let clear = op(OperationType::Update, "a", json!({"color": null}));
        map.apply(&clear).unwrap();
        assert!(map.get(&id("a")).unwrap().fields.get("color").is_none());
    }

    #[test]
    fn test_update_rejects_bad_types() {
        let mut map = sample();
        let bad = op(OperationType::Update, "a", json!({"text": 42, "color": "red"}));
        assert!(matches!(map.apply(&bad), Err(SyncError::InvalidPayload(_))));
        assert!(map.get(&id("a")).unwrap().fields.is_empty());
    }

    #[test]
    fn test_missing_node_is_noop() {
        let mut map = sample();
        for kind in [OperationType::Update, OperationType::Move, OperationType::Delete] {
            assert!(!map.apply(&op(kind, "ghost", json!({"text": "x"}))).unwrap());
        }
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn test_delete_removes_subtree() {
        let mut map = sample();
        assert!(map.apply(&op(OperationType::Delete, "a", json!({}))).unwrap());

        assert_eq!(map.len(), 1);
        assert!(!map.contains(&id("b")));
        assert!(map.children(&id("root")).is_empty());

        // Freed slots are reused.
        map.apply(&op(OperationType::Create, "c", json!({}))).unwrap();
        assert_eq!(map.slots.len(), 3);
    }

    #[test]
    fn test_move_reparents_and_positions() {
        let mut map = sample();
        let mv = op(
            OperationType::Move,
            "b",
            json!({"parent_id": "root", "x": 5, "y": 6}),
        );
        assert!(map.apply(&mv).unwrap());

        assert_eq!(map.parent(&id("b")), Some(&id("root")));
        assert_eq!(map.children(&id("root")), vec![&id("a"), &id("b")]);
        assert!(map.children(&id("a")).is_empty());
        assert_eq!(map.get(&id("b")).unwrap().x, 5.0);

        let detach = op(OperationType::Move, "b", json!({"parent_id": null}));
        map.apply(&detach).unwrap();
        assert_eq!(map.roots(), vec![&id("b"), &id("root")]);
    }

    #[test]
    fn test_move_under_descendant_rejected() {
        let mut map = sample();
        let cycle = op(OperationType::Move, "root", json!({"parent_id": "b"}));
        assert!(matches!(map.apply(&cycle), Err(SyncError::InvalidPayload(_))));
        assert_eq!(map.parent(&id("b")), Some(&id("a")));

        let onto_self = op(OperationType::Move, "a", json!({"parent_id": "a"}));
        assert!(map.apply(&onto_self).is_err());
    }

    #[test]
    fn test_check_catches_edits_that_cannot_apply() {
        let map = sample();
        let draft = |kind, target: &str, data: Value| {
            OperationDraft::new(kind, "map-1", target, data.as_object().cloned().unwrap_or_default())
        };

        assert!(map.check(&draft(OperationType::Create, "c", json!({"parent_id": "b"}))).is_ok());
        assert!(map.check(&draft(OperationType::Move, "b", json!({"parent_id": "root"}))).is_ok());
        assert!(map.check(&draft(OperationType::Update, "ghost", json!({"text": "x"}))).is_ok());
        assert!(map.check(&draft(OperationType::Delete, "a", json!({"text": 5}))).is_ok());

        assert_eq!(
            map.check(&draft(OperationType::Create, "c", json!({"parent_id": "ghost"}))),
            Err(SyncError::NodeNotFound(id("ghost")))
        );
        assert!(matches!(
            map.check(&draft(OperationType::Move, "a", json!({"parent_id": "b"}))),
            Err(SyncError::InvalidPayload(_))
        ));
        assert!(matches!(
            map.check(&draft(OperationType::Update, "a", json!({"x": "left"}))),
            Err(SyncError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_check_payload_ignores_tree_state() {
        let map = MindMap::new("map-1");
        assert!(map
            .check_payload(&op(OperationType::Move, "a", json!({"parent_id": "missing"})))
            .is_ok());
        assert!(map
            .check_payload(&op(OperationType::Create, "a", json!({"parent_id": 7})))
            .is_err());
    }

    #[test]
    fn test_ancestor_path_and_detach() {
        let mut map = sample();
        assert_eq!(map.ancestor_path(&id("b"), &id("root")), Some(vec![id("b"), id("a")]));
        assert_eq!(map.ancestor_path(&id("a"), &id("a")), Some(vec![]));
        assert_eq!(map.ancestor_path(&id("root"), &id("b")), None);

        assert!(map.detach(&id("a")));
        assert!(!map.detach(&id("a")));
        assert!(!map.detach(&id("ghost")));
        assert_eq!(map.roots(), vec![&id("a"), &id("root")]);
        assert_eq!(map.children(&id("a")), vec![&id("b")]);
        assert!(map.children(&id("root")).is_empty());
    }

    #[test]
    fn test_noop_and_other_targets_ignored() {
        let mut map = sample();
        let mut noop = op(OperationType::Update, "a", json!({"text": "lost"}));
        noop.make_noop();
        assert!(!map.apply(&noop).unwrap());

        let attachment = op(OperationType::Delete, "a", json!({}));
        let attachment = Operation {
            target_type: TargetType::Attachment,
            ..attachment
        };
        assert!(!map.apply(&attachment).unwrap());
        assert_eq!(map.get(&id("a")).unwrap().text, "Tokyo");
    }

    #[test]
    fn test_foreign_document_rejected() {
        let mut map = MindMap::new("map-2");
        let create = op(OperationType::Create, "a", json!({}));
        assert!(matches!(map.apply(&create), Err(SyncError::InvalidPayload(_))));
    }
}
