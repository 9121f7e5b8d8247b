use anyhow::Result;
use indexmap::IndexMap;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;

use crate::client::Client;
use crate::error::OrderError;
use crate::shoji::{ShojiCatalog, ShojiOrder, order_wrapper};
use crate::util::element_id_from_url;

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w\s,&()/\\-]+$").unwrap());

const ROOT_NAME: &str = "__root__";

/// A `|`-separated absolute path into the hierarchy. `"|"` addresses the
/// root; `"| Account | Demographics"` descends through nested groups.
/// Leading and trailing whitespace around each segment is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    raw: String,
}

impl Path {
    pub fn new(path: impl Into<String>) -> Self {
        Path { raw: path.into() }
    }

    pub fn root() -> Self {
        Path { raw: "|".into() }
    }

    pub fn is_root(&self) -> bool {
        self.raw.trim() == "|"
    }

    pub fn is_absolute(&self) -> bool {
        self.raw.trim_start().starts_with('|')
    }

    /// The path addressing `name` inside this path's group.
    pub fn child(&self, name: &str) -> Path {
        if self.is_root() {
            Path::new(format!("| {}", name))
        } else {
            Path::new(format!("{} | {}", self.raw.trim_end(), name))
        }
    }

    pub(crate) fn parts(&self) -> impl Iterator<Item = &str> {
        self.raw.split('|').map(str::trim).filter(|p| !p.is_empty())
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<&str> for Path {
    fn from(raw: &str) -> Self {
        Path::new(raw)
    }
}

/// Where to place elements within a group.
#[derive(Debug, Clone, Copy)]
pub enum Position<'a> {
    /// At this index among the group's children (after the moved elements
    /// are discounted).
    Index(usize),
    /// At the end of the group.
    Last,
    /// Immediately before the named sibling.
    Before(&'a str),
    /// Immediately after the named sibling.
    After(&'a str),
}

/// A leaf of the hierarchy: a variable, referenced by alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableRef {
    pub alias: String,
    pub url: String,
}

/// One node of the hierarchy: a variable leaf or a nested group.
#[derive(Debug, Clone, PartialEq)]
pub enum Element {
    Variable(VariableRef),
    Group(Group),
}

impl Element {
    /// The name this element is referenced by: a variable alias or a group
    /// name.
    pub fn name(&self) -> &str {
        match self {
            Element::Variable(v) => &v.alias,
            Element::Group(g) => &g.name,
        }
    }

    pub fn as_group(&self) -> Option<&Group> {
        match self {
            Element::Group(g) => Some(g),
            Element::Variable(_) => None,
        }
    }
}

/// A named group of elements. Names are unique within a sibling set.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    name: String,
    elements: Vec<Element>,
}

impl Group {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Names of the direct children, in order.
    pub fn keys(&self) -> Vec<&str> {
        self.elements.iter().map(Element::name).collect()
    }

    pub fn get(&self, name: &str) -> Option<&Element> {
        self.index_of(name).map(|i| &self.elements[i])
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.elements.iter().position(|e| e.name() == name)
    }

    fn to_names(&self) -> Value {
        Value::Array(
            self.elements
                .iter()
                .map(|el| match el {
                    Element::Variable(v) => Value::String(v.alias.clone()),
                    Element::Group(g) => {
                        let mut obj = Map::new();
                        obj.insert(g.name.clone(), g.to_names());
                        Value::Object(obj)
                    }
                })
                .collect(),
        )
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = serde_json::to_string_pretty(&self.to_names()).map_err(|_| fmt::Error)?;
        f.write_str(&rendered)
    }
}

/// The in-memory hierarchy editor. All structural edits validate fully
/// before mutating, so a failed operation leaves the tree untouched.
///
/// String references (variable aliases or group names) resolve to the
/// destination group's own children first, then to the first match in a
/// depth-first scan that prefers siblings over descendants.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderGraph {
    root: Group,
}

impl OrderGraph {
    pub(crate) fn from_graph(
        graph: &[Value],
        vars_by_id: &IndexMap<String, VariableRef>,
    ) -> Result<Self, OrderError> {
        Ok(OrderGraph {
            root: Group {
                name: ROOT_NAME.into(),
                elements: parse_elements(graph, vars_by_id)?,
            },
        })
    }

    /// The `shoji:order` graph for the whole tree: variable URLs and
    /// `{name: [...]}` group objects.
    pub(crate) fn to_graph(&self) -> Vec<Value> {
        serialize_elements(&self.root.elements)
    }

    pub fn root(&self) -> &Group {
        &self.root
    }

    /// Looks up the group addressed by an absolute path.
    pub fn group(&self, path: &Path) -> Result<&Group, OrderError> {
        let idx = self.resolve_group_indices(path)?;
        self.group_at(&idx)
            .ok_or_else(|| OrderError::RelativePath(path.to_string()))
    }

    /// Moves one or more elements, from anywhere in the tree, into the
    /// destination group at the given position.
    pub fn insert(
        &mut self,
        dest: &Path,
        refs: &[&str],
        pos: Position<'_>,
    ) -> Result<(), OrderError> {
        let dest_idx = self.resolve_group_indices(dest)?;
        if refs.is_empty() {
            return Ok(());
        }

        let mut seen = HashSet::new();
        for r in refs {
            if !seen.insert(*r) {
                return Err(OrderError::DuplicateName((*r).to_string()));
            }
        }

        // Resolve every reference up front; reject moving a group into its
        // own subtree.
        let mut moved_from_dest = 0usize;
        for r in refs {
            let idx = self
                .locate_from(&dest_idx, r)
                .ok_or_else(|| OrderError::UnknownReference((*r).to_string()))?;
            if self.element_at(&idx).and_then(Element::as_group).is_some()
                && dest_idx.starts_with(&idx)
            {
                return Err(OrderError::MoveIntoSelf((*r).to_string()));
            }
            if idx.len() == dest_idx.len() + 1 && idx[..dest_idx.len()] == dest_idx[..] {
                moved_from_dest += 1;
            }
        }

        // Anchors and indexes are interpreted against the destination with
        // the moved elements discounted.
        if let Some(dest_group) = self.group_at(&dest_idx) {
            let remaining = dest_group.len() - moved_from_dest;
            match pos {
                Position::Index(n) if n > remaining => {
                    return Err(OrderError::PositionOutOfRange {
                        position: n,
                        len: remaining,
                    });
                }
                Position::Before(anchor) | Position::After(anchor) => {
                    if refs.contains(&anchor) || dest_group.index_of(anchor).is_none() {
                        return Err(OrderError::UnknownAnchor(anchor.to_string()));
                    }
                }
                _ => {}
            }
        }

        // Detach in reference order, re-resolving after every removal.
        let mut moved = Vec::with_capacity(refs.len());
        for r in refs {
            let dest_idx = self.resolve_group_indices(dest)?;
            let idx = self
                .locate_from(&dest_idx, r)
                .ok_or_else(|| OrderError::UnknownReference((*r).to_string()))?;
            let el = self
                .remove_at(&idx)
                .ok_or_else(|| OrderError::UnknownReference((*r).to_string()))?;
            moved.push(el);
        }

        // Splice into the destination.
        let dest_group = self.group_mut(dest)?;
        let at = match pos {
            Position::Index(n) => n.min(dest_group.len()),
            Position::Last => dest_group.len(),
            Position::Before(anchor) => dest_group
                .index_of(anchor)
                .ok_or_else(|| OrderError::UnknownAnchor(anchor.to_string()))?,
            Position::After(anchor) => {
                dest_group
                    .index_of(anchor)
                    .ok_or_else(|| OrderError::UnknownAnchor(anchor.to_string()))?
                    + 1
            }
        };
        for (k, el) in moved.into_iter().enumerate() {
            dest_group.elements.insert(at + k, el);
        }
        Ok(())
    }

    /// Moves elements to the end of the destination group.
    pub fn append(&mut self, dest: &Path, refs: &[&str]) -> Result<(), OrderError> {
        self.insert(dest, refs, Position::Last)
    }

    /// Applies a complete reordering of a group's children. The list must
    /// name every child exactly once.
    pub fn reorder(&mut self, path: &Path, names: &[&str]) -> Result<(), OrderError> {
        let group = self.group_mut(path)?;
        if names.len() != group.len() {
            return Err(OrderError::IncompleteReorder);
        }
        let mut seen = HashSet::new();
        for n in names {
            if !seen.insert(*n) || group.index_of(n).is_none() {
                return Err(OrderError::IncompleteReorder);
            }
        }
        if group.keys() == names {
            // Nothing to do.
            return Ok(());
        }

        let mut old: Vec<Element> = group.elements.drain(..).collect();
        for n in names {
            if let Some(i) = old.iter().position(|e| e.name() == *n) {
                group.elements.push(old.remove(i));
            }
        }
        Ok(())
    }

    /// Creates a group at the end of `dest`, optionally populated with
    /// existing elements pulled from anywhere in the tree.
    pub fn create_group(
        &mut self,
        dest: &Path,
        name: &str,
        refs: &[&str],
    ) -> Result<(), OrderError> {
        self.create_group_at(dest, name, refs, Position::Last)
    }

    pub fn create_group_at(
        &mut self,
        dest: &Path,
        name: &str,
        refs: &[&str],
        pos: Position<'_>,
    ) -> Result<(), OrderError> {
        validate_name(name)?;
        let dest_idx = self.resolve_group_indices(dest)?;
        let (dest_len, collision) = match self.group_at(&dest_idx) {
            Some(g) => (g.len(), g.index_of(name).is_some()),
            None => (0, false),
        };
        if collision {
            return Err(OrderError::DuplicateName(name.to_string()));
        }

        // Everything the new group will hold, and its own position, must
        // validate before the group is attached.
        let mut seen = HashSet::new();
        for r in refs {
            if !seen.insert(*r) {
                return Err(OrderError::DuplicateName((*r).to_string()));
            }
            let idx = self
                .locate_from(&dest_idx, r)
                .ok_or_else(|| OrderError::UnknownReference((*r).to_string()))?;
            if self.element_at(&idx).and_then(Element::as_group).is_some()
                && dest_idx.starts_with(&idx)
            {
                return Err(OrderError::MoveIntoSelf((*r).to_string()));
            }
        }
        match pos {
            Position::Index(n) if n > dest_len => {
                return Err(OrderError::PositionOutOfRange {
                    position: n,
                    len: dest_len,
                });
            }
            Position::Before(anchor) | Position::After(anchor) => {
                let anchored = self
                    .group_at(&dest_idx)
                    .map(|g| g.index_of(anchor).is_some())
                    .unwrap_or(false);
                // An anchor that is about to move into the new group (or is
                // the new group itself) cannot position it.
                if anchor == name || refs.contains(&anchor) || !anchored {
                    return Err(OrderError::UnknownAnchor(anchor.to_string()));
                }
            }
            _ => {}
        }

        let dest_group = self.group_mut(dest)?;
        dest_group.elements.push(Element::Group(Group {
            name: name.to_string(),
            elements: Vec::new(),
        }));

        if !refs.is_empty() {
            self.insert(&dest.child(name), refs, Position::Last)?;
        }
        if !matches!(pos, Position::Last) {
            self.insert(dest, &[name], pos)?;
        }
        Ok(())
    }

    /// Renames a group. The root cannot be renamed, and the new name must
    /// not collide with a sibling.
    pub fn rename_group(&mut self, path: &Path, new_name: &str) -> Result<(), OrderError> {
        let idx = self.resolve_group_indices(path)?;
        if idx.is_empty() {
            return Err(OrderError::RootIsImmutable);
        }
        validate_name(new_name)?;

        let parent = &idx[..idx.len() - 1];
        let current = self
            .group_at(&idx)
            .map(|g| g.name.clone())
            .ok_or_else(|| OrderError::RelativePath(path.to_string()))?;
        if current == new_name {
            // Nothing to do.
            return Ok(());
        }
        if let Some(parent_group) = self.group_at(parent) {
            if parent_group.index_of(new_name).is_some() {
                return Err(OrderError::DuplicateName(new_name.to_string()));
            }
        }

        if let Some(group) = self.group_at_mut(&idx) {
            group.name = new_name.to_string();
        }
        Ok(())
    }

    /// Deletes an empty group. The root cannot be deleted.
    pub fn delete_group(&mut self, path: &Path) -> Result<(), OrderError> {
        let idx = self.resolve_group_indices(path)?;
        if idx.is_empty() {
            return Err(OrderError::RootIsImmutable);
        }
        let (empty, name) = match self.group_at(&idx) {
            Some(g) => (g.is_empty(), g.name.clone()),
            None => return Err(OrderError::RelativePath(path.to_string())),
        };
        if !empty {
            return Err(OrderError::GroupNotEmpty(name));
        }
        self.remove_at(&idx).map(drop).ok_or(OrderError::PathNotFound {
            path: path.to_string(),
            element: name,
        })
    }

    /// Moves the group addressed by `path` into another group. Moving a
    /// group into itself or its own subtree is rejected.
    pub fn move_group(
        &mut self,
        path: &Path,
        dest: &Path,
        pos: Position<'_>,
    ) -> Result<(), OrderError> {
        let idx = self.resolve_group_indices(path)?;
        if idx.is_empty() {
            return Err(OrderError::RootIsImmutable);
        }
        let dest_idx = self.resolve_group_indices(dest)?;
        let name = match self.group_at(&idx) {
            Some(g) => g.name.clone(),
            None => return Err(OrderError::RelativePath(path.to_string())),
        };
        if dest_idx.starts_with(&idx) {
            return Err(OrderError::MoveIntoSelf(name));
        }

        let within = idx.len() == dest_idx.len() + 1 && idx[..dest_idx.len()] == dest_idx[..];
        if let Some(dest_group) = self.group_at(&dest_idx) {
            if !within && dest_group.index_of(&name).is_some() {
                return Err(OrderError::DuplicateName(name));
            }
            let remaining = dest_group.len() - usize::from(within);
            match pos {
                Position::Index(n) if n > remaining => {
                    return Err(OrderError::PositionOutOfRange {
                        position: n,
                        len: remaining,
                    });
                }
                Position::Before(anchor) | Position::After(anchor) => {
                    if anchor == name || dest_group.index_of(anchor).is_none() {
                        return Err(OrderError::UnknownAnchor(anchor.to_string()));
                    }
                }
                _ => {}
            }
        }

        let el = self
            .remove_at(&idx)
            .ok_or_else(|| OrderError::UnknownReference(name.clone()))?;
        let dest_group = self.group_mut(dest)?;
        let at = match pos {
            Position::Index(n) => n.min(dest_group.len()),
            Position::Last => dest_group.len(),
            Position::Before(anchor) => dest_group
                .index_of(anchor)
                .ok_or_else(|| OrderError::UnknownAnchor(anchor.to_string()))?,
            Position::After(anchor) => {
                dest_group
                    .index_of(anchor)
                    .ok_or_else(|| OrderError::UnknownAnchor(anchor.to_string()))?
                    + 1
            }
        };
        dest_group.elements.insert(at, el);
        Ok(())
    }

    /// Detaches elements from their groups and reparents them at the end of
    /// the root.
    pub fn remove(&mut self, refs: &[&str]) -> Result<(), OrderError> {
        self.insert(&Path::root(), refs, Position::Last)
    }

    fn resolve_group_indices(&self, path: &Path) -> Result<Vec<usize>, OrderError> {
        if !path.is_absolute() {
            return Err(OrderError::RelativePath(path.to_string()));
        }
        let mut idx = Vec::new();
        let mut group = &self.root;
        for part in path.parts() {
            match group.index_of(part) {
                None => {
                    return Err(OrderError::PathNotFound {
                        path: path.to_string(),
                        element: part.to_string(),
                    });
                }
                Some(i) => match &group.elements[i] {
                    Element::Group(sub) => {
                        idx.push(i);
                        group = sub;
                    }
                    Element::Variable(_) => {
                        return Err(OrderError::NotAGroup {
                            path: path.to_string(),
                            element: part.to_string(),
                        });
                    }
                },
            }
        }
        Ok(idx)
    }

    fn group_at(&self, idx: &[usize]) -> Option<&Group> {
        let mut group = &self.root;
        for &i in idx {
            group = group.elements.get(i)?.as_group()?;
        }
        Some(group)
    }

    fn group_at_mut(&mut self, idx: &[usize]) -> Option<&mut Group> {
        let mut group = &mut self.root;
        for &i in idx {
            group = match group.elements.get_mut(i) {
                Some(Element::Group(sub)) => sub,
                _ => return None,
            };
        }
        Some(group)
    }

    fn group_mut(&mut self, path: &Path) -> Result<&mut Group, OrderError> {
        let idx = self.resolve_group_indices(path)?;
        self.group_at_mut(&idx)
            .ok_or_else(|| OrderError::RelativePath(path.to_string()))
    }

    fn element_at(&self, idx: &[usize]) -> Option<&Element> {
        let (last, parent) = idx.split_last()?;
        self.group_at(parent)?.elements.get(*last)
    }

    fn remove_at(&mut self, idx: &[usize]) -> Option<Element> {
        let (last, parent) = idx.split_last()?;
        let group = self.group_at_mut(parent)?;
        if *last < group.elements.len() {
            Some(group.elements.remove(*last))
        } else {
            None
        }
    }

    /// First match for a reference: the destination's own children win,
    /// then each group's direct children are scanned before descending.
    fn locate_from(&self, dest_idx: &[usize], name: &str) -> Option<Vec<usize>> {
        if let Some(group) = self.group_at(dest_idx) {
            if let Some(i) = group.index_of(name) {
                let mut idx = dest_idx.to_vec();
                idx.push(i);
                return Some(idx);
            }
        }
        locate_idx(&self.root, name)
    }
}

impl fmt::Display for OrderGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.root.fmt(f)
    }
}

fn locate_idx(group: &Group, name: &str) -> Option<Vec<usize>> {
    if let Some(i) = group.index_of(name) {
        return Some(vec![i]);
    }
    for (i, el) in group.elements.iter().enumerate() {
        if let Element::Group(sub) = el {
            if let Some(mut sub_idx) = locate_idx(sub, name) {
                let mut idx = vec![i];
                idx.append(&mut sub_idx);
                return Some(idx);
            }
        }
    }
    None
}

fn validate_name(name: &str) -> Result<(), OrderError> {
    if name.trim().is_empty() || name.contains('|') || !NAME_RE.is_match(name) {
        return Err(OrderError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn parse_elements(
    values: &[Value],
    vars_by_id: &IndexMap<String, VariableRef>,
) -> Result<Vec<Element>, OrderError> {
    let mut elements = Vec::with_capacity(values.len());
    for value in values {
        match value {
            Value::String(url) => {
                // Variables absent from the catalog (e.g. hidden ones) are
                // dropped from the local tree.
                if let Some(var) = element_id_from_url(url).and_then(|id| vars_by_id.get(id)) {
                    elements.push(Element::Variable(var.clone()));
                }
            }
            Value::Object(map) if map.len() == 1 => {
                for (name, children) in map {
                    let children = children
                        .as_array()
                        .ok_or_else(|| OrderError::InvalidGraph(value.to_string()))?;
                    elements.push(Element::Group(Group {
                        name: name.clone(),
                        elements: parse_elements(children, vars_by_id)?,
                    }));
                }
            }
            other => return Err(OrderError::InvalidGraph(other.to_string())),
        }
    }
    Ok(elements)
}

fn serialize_elements(elements: &[Element]) -> Vec<Value> {
    elements
        .iter()
        .map(|el| match el {
            Element::Variable(v) => Value::String(v.url.clone()),
            Element::Group(g) => {
                let mut obj = Map::new();
                obj.insert(g.name.clone(), Value::Array(serialize_elements(&g.elements)));
                Value::Object(obj)
            }
        })
        .collect()
}

/// The hierarchical order of a dataset's variables, kept in sync with the
/// server: every mutation rewrites the whole graph in one PUT. A rejected
/// write reloads the local tree from the server before surfacing the error.
#[derive(Debug, Clone)]
pub struct VariableOrder {
    client: Client,
    url: String,
    catalog_url: String,
    graph: OrderGraph,
}

impl VariableOrder {
    pub(crate) fn fetch(client: &Client, order_url: &str, catalog_url: &str) -> Result<Self> {
        let mut order = VariableOrder {
            client: client.clone(),
            url: order_url.to_string(),
            catalog_url: catalog_url.to_string(),
            graph: OrderGraph { root: Group { name: ROOT_NAME.into(), elements: Vec::new() } },
        };
        order.reload()?;
        Ok(order)
    }

    /// Re-reads the variable catalog and the order graph from the server.
    pub fn reload(&mut self) -> Result<()> {
        let catalog: ShojiCatalog = self.client.get_json(&self.catalog_url)?;
        let mut vars_by_id: IndexMap<String, VariableRef> = IndexMap::new();
        for (url, tuple) in &catalog.index {
            let alias = match tuple.get("alias").and_then(Value::as_str) {
                Some(alias) => alias.to_string(),
                None => continue,
            };
            let id = tuple
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| element_id_from_url(url).map(str::to_string));
            if let Some(id) = id {
                vars_by_id.insert(id, VariableRef { alias, url: url.clone() });
            }
        }

        let doc: ShojiOrder = self.client.get_json(&self.url)?;
        self.graph = OrderGraph::from_graph(&doc.graph, &vars_by_id)?;
        Ok(())
    }

    pub fn graph(&self) -> &OrderGraph {
        &self.graph
    }

    pub fn group(&self, path: &Path) -> Result<&Group, OrderError> {
        self.graph.group(path)
    }

    pub fn insert(&mut self, dest: &Path, refs: &[&str], pos: Position<'_>) -> Result<()> {
        self.graph.insert(dest, refs, pos)?;
        self.update()
    }

    pub fn append(&mut self, dest: &Path, refs: &[&str]) -> Result<()> {
        self.graph.append(dest, refs)?;
        self.update()
    }

    pub fn reorder(&mut self, path: &Path, names: &[&str]) -> Result<()> {
        self.graph.reorder(path, names)?;
        self.update()
    }

    pub fn create_group(&mut self, dest: &Path, name: &str, refs: &[&str]) -> Result<()> {
        self.graph.create_group(dest, name, refs)?;
        self.update()
    }

    pub fn create_group_at(
        &mut self,
        dest: &Path,
        name: &str,
        refs: &[&str],
        pos: Position<'_>,
    ) -> Result<()> {
        self.graph.create_group_at(dest, name, refs, pos)?;
        self.update()
    }

    pub fn rename_group(&mut self, path: &Path, new_name: &str) -> Result<()> {
        self.graph.rename_group(path, new_name)?;
        self.update()
    }

    pub fn delete_group(&mut self, path: &Path) -> Result<()> {
        self.graph.delete_group(path)?;
        self.update()
    }

    pub fn move_group(&mut self, path: &Path, dest: &Path, pos: Position<'_>) -> Result<()> {
        self.graph.move_group(path, dest, pos)?;
        self.update()
    }

    pub fn remove(&mut self, refs: &[&str]) -> Result<()> {
        self.graph.remove(refs)?;
        self.update()
    }

    /// Positions a variable, addressed by alias, inside the hierarchy.
    pub fn place(&mut self, alias: &str, dest: &Path, pos: Position<'_>) -> Result<()> {
        self.insert(dest, &[alias], pos)
    }

    fn update(&mut self) -> Result<()> {
        let body = order_wrapper(self.graph.to_graph());
        if let Err(e) = self.client.put(&self.url, &body) {
            // The write was rejected. Reload so the local tree matches the
            // server again before surfacing the failure.
            self.reload()?;
            return Err(OrderError::UpdateRejected(e.to_string()).into());
        }
        Ok(())
    }
}
