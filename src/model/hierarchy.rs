//! Patient/study/series/instance tree.
//!
//! Nodes live in an arena indexed by [`NodeId`] handles; parent and child
//! edges are handles, never owning pointers, so navigation works in both
//! directions without reference cycles. The model exclusively owns every
//! node and, through Instance nodes, every [`Record`].

use std::collections::{HashSet, VecDeque};

use crate::error::{Error, Result};
use crate::model::record::Record;
use crate::staging::StagingLedger;

/// Handle to one node in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Patient,
    Study,
    Series,
    Instance,
}

/// Mutation notification consumed by UI collaborators. The core queues
/// these; it never transforms them further.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeChange {
    Inserted(NodeId),
    Removed(NodeId),
    Merged { source: NodeId, target: NodeId },
    RecordReplaced(NodeId),
}

/// Ancestry of one inserted instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodePath {
    pub patient: NodeId,
    pub study: NodeId,
    pub series: NodeId,
    pub instance: NodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TreeCounts {
    pub patients: usize,
    pub studies: usize,
    pub series: usize,
    pub instances: usize,
}

#[derive(Debug)]
pub struct HierarchyNode {
    level: Level,
    uid: String,
    label: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    record: Option<Record>,
}

impl HierarchyNode {
    pub fn level(&self) -> Level {
        self.level
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn record(&self) -> Option<&Record> {
        self.record.as_ref()
    }

    fn sort_key(&self) -> i64 {
        self.record
            .as_ref()
            .and_then(|r| r.instance_number())
            .unwrap_or(i64::MAX)
    }
}

#[derive(Debug, Default)]
pub struct HierarchyModel {
    nodes: Vec<Option<HierarchyNode>>,
    roots: Vec<NodeId>,
    changes: VecDeque<TreeChange>,
}

impl HierarchyModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, id: NodeId) -> Result<&HierarchyNode> {
        self.get(id)
            .ok_or_else(|| Error::NotFound(format!("node handle {id:?}")))
    }

    pub fn get(&self, id: NodeId) -> Option<&HierarchyNode> {
        self.nodes.get(id.0 as usize).and_then(|slot| slot.as_ref())
    }

    fn get_mut(&mut self, id: NodeId) -> Option<&mut HierarchyNode> {
        self.nodes.get_mut(id.0 as usize).and_then(|slot| slot.as_mut())
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn record(&self, id: NodeId) -> Option<&Record> {
        self.get(id).and_then(|node| node.record.as_ref())
    }

    pub(crate) fn record_mut(&mut self, id: NodeId) -> Option<&mut Record> {
        self.get_mut(id).and_then(|node| node.record.as_mut())
    }

    /// Drain queued change notifications in emission order.
    pub fn drain_changes(&mut self) -> Vec<TreeChange> {
        self.changes.drain(..).collect()
    }

    /// Place one record, creating or reusing ancestors keyed by UID at
    /// each level. Re-inserting an existing SOP Instance UID replaces
    /// the owned record instead of creating a sibling, so repeated loads
    /// of overlapping file sets never duplicate tree branches.
    pub fn insert(&mut self, record: Record) -> NodePath {
        let patient = self.ensure_root(record.patient_id(), record.patient_label());
        let study = self.ensure_child(patient, Level::Study, record.study_uid(), record.study_label());
        let series =
            self.ensure_child(study, Level::Series, record.series_uid(), record.series_label());

        if let Some(instance) = self.find_child(series, record.sop_instance_uid()) {
            log::info!(
                "replacing record for existing instance {}",
                record.sop_instance_uid()
            );
            let node = self.get_mut(instance).expect("child handle is live");
            node.record = Some(record);
            self.changes.push_back(TreeChange::RecordReplaced(instance));
            return NodePath {
                patient,
                study,
                series,
                instance,
            };
        }

        let uid = record.sop_instance_uid().to_string();
        let label = record.instance_label().to_string();
        let instance = self.alloc(HierarchyNode {
            level: Level::Instance,
            uid,
            label,
            parent: Some(series),
            children: Vec::new(),
            record: Some(record),
        });
        self.attach_sorted(series, instance);
        self.changes.push_back(TreeChange::Inserted(instance));

        NodePath {
            patient,
            study,
            series,
            instance,
        }
    }

    /// First node with this UID at the given level, in tree order.
    pub fn find(&self, uid: &str, level: Level) -> Option<NodeId> {
        let mut stack: Vec<NodeId> = self.roots.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            let node = self.get(id)?;
            if node.level == level && node.uid == uid {
                return Some(id);
            }
            stack.extend(node.children.iter().rev());
        }
        None
    }

    /// Remove a subtree. Refused while staged edits are pending under the
    /// node unless `force` is set; the returned handles let the caller
    /// purge any ledger entries that referenced them.
    pub fn remove(
        &mut self,
        id: NodeId,
        ledger: &StagingLedger,
        force: bool,
    ) -> Result<Vec<NodeId>> {
        self.node(id)?;
        if !force {
            let pending = ledger.pending_in_subtree(self, id);
            if pending > 0 {
                return Err(Error::Conflict(format!(
                    "{pending} staged edit(s) pending under node; discard them or force removal"
                )));
            }
        }

        let removed = self.subtree_ids(id);
        self.detach(id);
        for node_id in &removed {
            self.nodes[node_id.0 as usize] = None;
        }
        self.changes.push_back(TreeChange::Removed(id));
        log::info!("removed subtree of {} node(s)", removed.len());
        Ok(removed)
    }

    /// Reparent all children of `source` under `target` and delete
    /// `source`. Fails without touching either subtree if the merge
    /// would put two children with the same UID under `target`.
    pub fn merge(&mut self, source: NodeId, target: NodeId) -> Result<()> {
        if source == target {
            return Err(Error::Conflict("cannot merge a node into itself".into()));
        }
        let source_node = self.node(source)?;
        let target_node = self.node(target)?;
        if source_node.level != target_node.level {
            return Err(Error::Conflict(format!(
                "cannot merge {:?} into {:?}",
                source_node.level, target_node.level
            )));
        }
        if source_node.level == Level::Instance {
            return Err(Error::Conflict("instance nodes cannot be merged".into()));
        }

        let target_uids: HashSet<String> = target_node
            .children
            .iter()
            .filter_map(|c| self.get(*c))
            .map(|c| c.uid.clone())
            .collect();
        for child in &source_node.children {
            let uid = &self.node(*child)?.uid;
            if target_uids.contains(uid) {
                return Err(Error::Conflict(format!(
                    "merge would duplicate child UID {uid}"
                )));
            }
        }

        let children = {
            let node = self.get_mut(source).expect("checked above");
            std::mem::take(&mut node.children)
        };
        for child in &children {
            if let Some(node) = self.get_mut(*child) {
                node.parent = Some(target);
            }
        }
        self.get_mut(target)
            .expect("checked above")
            .children
            .extend(children);

        self.detach(source);
        self.nodes[source.0 as usize] = None;
        self.changes.push_back(TreeChange::Merged { source, target });
        Ok(())
    }

    /// All Instance handles under `id` (including `id` itself when it is
    /// an Instance), in tree order. This is the descendant closure used
    /// by edit propagation and by send enqueue.
    pub fn instances_under(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.get(current) {
                if node.level == Level::Instance {
                    out.push(current);
                } else {
                    stack.extend(node.children.iter().rev());
                }
            }
        }
        out
    }

    /// True when `id` lies on the path from a root down to `descendant`,
    /// or equals it.
    pub fn is_ancestor_or_self(&self, id: NodeId, descendant: NodeId) -> bool {
        let mut cursor = Some(descendant);
        while let Some(current) = cursor {
            if current == id {
                return true;
            }
            cursor = self.get(current).and_then(|n| n.parent);
        }
        false
    }

    /// Labels from the root down to `id`, for the pending-changes surface.
    pub fn path_labels(&self, id: NodeId) -> Vec<String> {
        let mut labels = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            match self.get(current) {
                Some(node) => {
                    labels.push(node.label.clone());
                    cursor = node.parent;
                }
                None => break,
            }
        }
        labels.reverse();
        labels
    }

    pub fn counts(&self) -> TreeCounts {
        let mut counts = TreeCounts::default();
        for node in self.nodes.iter().flatten() {
            match node.level {
                Level::Patient => counts.patients += 1,
                Level::Study => counts.studies += 1,
                Level::Series => counts.series += 1,
                Level::Instance => counts.instances += 1,
            }
        }
        counts
    }

    fn alloc(&mut self, node: HierarchyNode) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Some(node));
        id
    }

    fn ensure_root(&mut self, uid: &str, label: &str) -> NodeId {
        if let Some(existing) = self
            .roots
            .iter()
            .copied()
            .find(|id| self.get(*id).map(|n| n.uid == uid).unwrap_or(false))
        {
            return existing;
        }
        let id = self.alloc(HierarchyNode {
            level: Level::Patient,
            uid: uid.to_string(),
            label: label.to_string(),
            parent: None,
            children: Vec::new(),
            record: None,
        });
        self.roots.push(id);
        self.changes.push_back(TreeChange::Inserted(id));
        id
    }

    fn ensure_child(&mut self, parent: NodeId, level: Level, uid: &str, label: &str) -> NodeId {
        if let Some(existing) = self.find_child(parent, uid) {
            return existing;
        }
        let id = self.alloc(HierarchyNode {
            level,
            uid: uid.to_string(),
            label: label.to_string(),
            parent: Some(parent),
            children: Vec::new(),
            record: None,
        });
        self.get_mut(parent)
            .expect("parent handle is live")
            .children
            .push(id);
        self.changes.push_back(TreeChange::Inserted(id));
        id
    }

    fn find_child(&self, parent: NodeId, uid: &str) -> Option<NodeId> {
        self.get(parent)?
            .children
            .iter()
            .copied()
            .find(|c| self.get(*c).map(|n| n.uid == uid).unwrap_or(false))
    }

    /// Insert an instance into its series keeping InstanceNumber order;
    /// unparseable numbers sort last, matching load-time ordering.
    fn attach_sorted(&mut self, series: NodeId, instance: NodeId) {
        let key = self.get(instance).expect("instance handle is live").sort_key();
        let position = {
            let children = &self.get(series).expect("series handle is live").children;
            children
                .iter()
                .position(|c| self.get(*c).map(|n| n.sort_key() > key).unwrap_or(false))
                .unwrap_or(children.len())
        };
        self.get_mut(series)
            .expect("series handle is live")
            .children
            .insert(position, instance);
    }

    fn subtree_ids(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.get(current) {
                out.push(current);
                stack.extend(node.children.iter().rev());
            }
        }
        out
    }

    fn detach(&mut self, id: NodeId) {
        let parent = self.get(id).and_then(|n| n.parent);
        match parent {
            Some(parent_id) => {
                if let Some(parent_node) = self.get_mut(parent_id) {
                    parent_node.children.retain(|c| *c != id);
                }
            }
            None => self.roots.retain(|r| *r != id),
        }
    }
}
