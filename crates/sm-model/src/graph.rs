use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use sm_template::{Segment, Template};

use crate::GraphError;
use crate::model::{NodeKey, PlaceholderValue, SqlModel};

/// Placeholder names leading from a start node down to one of its
/// descendants.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefPath(Vec<String>);

impl RefPath {
    #[must_use]
    pub fn root() -> Self {
        Self(Vec::new())
    }

    #[must_use]
    pub fn child(&self, name: &str) -> Self {
        let mut names = self.0.clone();
        names.push(name.to_owned());
        Self(names)
    }

    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for RefPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("<start>")
        } else {
            f.write_str(&self.0.join("/"))
        }
    }
}

impl<S: Into<String>> FromIterator<S> for RefPath {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl From<Vec<String>> for RefPath {
    fn from(value: Vec<String>) -> Self {
        Self(value)
    }
}

impl From<&[&str]> for RefPath {
    fn from(value: &[&str]) -> Self {
        value.iter().copied().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundNode {
    pub model: Arc<SqlModel>,
    pub reference_path: RefPath,
}

// ── Lookup ──────────────────────────────────────────────────────────────

pub fn get_node<'a>(start: &'a Arc<SqlModel>, path: &RefPath) -> Result<&'a Arc<SqlModel>, GraphError> {
    let mut node = start;
    for name in path.names() {
        node = node.reference(name).ok_or_else(|| GraphError::PathNotFound {
            path: path.clone(),
            missing: name.clone(),
        })?;
    }
    Ok(node)
}

/// First node, depth-first and pre-order with references visited in name
/// order, for which `predicate` holds. Every distinct node is tested once,
/// however many paths lead to it.
pub fn find_node(
    start: &Arc<SqlModel>,
    mut predicate: impl FnMut(&SqlModel) -> bool,
) -> Option<FoundNode> {
    let mut visited = HashSet::new();
    let mut found = Vec::new();
    search(start, &RefPath::root(), &mut predicate, &mut visited, &mut found, true);
    found.into_iter().next()
}

/// Every distinct node matching `predicate`, in the order [`find_node`]
/// would encounter them.
pub fn find_nodes(
    start: &Arc<SqlModel>,
    mut predicate: impl FnMut(&SqlModel) -> bool,
) -> Vec<FoundNode> {
    let mut visited = HashSet::new();
    let mut found = Vec::new();
    search(start, &RefPath::root(), &mut predicate, &mut visited, &mut found, false);
    found
}

fn search(
    node: &Arc<SqlModel>,
    path: &RefPath,
    predicate: &mut impl FnMut(&SqlModel) -> bool,
    visited: &mut HashSet<NodeKey>,
    found: &mut Vec<FoundNode>,
    first_only: bool,
) -> bool {
    if !visited.insert(node.node_key()) {
        return false;
    }
    if predicate(node) {
        found.push(FoundNode {
            model: Arc::clone(node),
            reference_path: path.clone(),
        });
        if first_only {
            return true;
        }
    }
    for (name, child) in node.references() {
        if search(child, &path.child(name), predicate, visited, found, first_only) {
            return true;
        }
    }
    false
}

// ── Copy-on-write edits ─────────────────────────────────────────────────

/// New start node in which the node at `path` is `replacement`. Only the
/// nodes along `path` are rebuilt; every other subtree is shared.
pub fn replace_node_in_graph(
    start: &Arc<SqlModel>,
    path: &RefPath,
    replacement: Arc<SqlModel>,
) -> Result<Arc<SqlModel>, GraphError> {
    rebuild_along(start, path, path.names(), &mut |_| Ok(replacement.clone()))
}

/// Like [`replace_node_in_graph`], but refuses to replace `start` itself.
pub fn replace_non_start_node_in_graph(
    start: &Arc<SqlModel>,
    path: &RefPath,
    replacement: Arc<SqlModel>,
) -> Result<Arc<SqlModel>, GraphError> {
    if path.is_empty() {
        return Err(GraphError::EmptyPath);
    }
    replace_node_in_graph(start, path, replacement)
}

/// New start node in which the node at `path` has `placeholders` overridden.
pub fn set_placeholders(
    start: &Arc<SqlModel>,
    path: &RefPath,
    placeholders: BTreeMap<String, PlaceholderValue>,
) -> Result<Arc<SqlModel>, GraphError> {
    let mut placeholders = Some(placeholders);
    rebuild_along(start, path, path.names(), &mut |target| {
        let values = placeholders.take().unwrap_or_default();
        Ok(target.copy_override_placeholders(values)?)
    })
}

fn rebuild_along(
    node: &Arc<SqlModel>,
    full_path: &RefPath,
    remaining: &[String],
    edit: &mut dyn FnMut(&Arc<SqlModel>) -> Result<Arc<SqlModel>, GraphError>,
) -> Result<Arc<SqlModel>, GraphError> {
    let Some((name, rest)) = remaining.split_first() else {
        return edit(node);
    };
    let child = node.reference(name).ok_or_else(|| GraphError::PathNotFound {
        path: full_path.clone(),
        missing: name.clone(),
    })?;
    let new_child = rebuild_along(child, full_path, rest, edit)?;
    Ok(node.copy_override_reference(name, new_child)?)
}

// ── Node info ───────────────────────────────────────────────────────────

/// One distinct node of a graph with its position and edges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub model: Arc<SqlModel>,
    /// Path of first encounter from the root.
    pub reference_path: RefPath,
    /// Distinct nodes referencing this one.
    pub in_edges: Vec<Arc<SqlModel>>,
    /// Distinct nodes this one references.
    pub out_edges: Vec<Arc<SqlModel>>,
}

/// Info for every distinct node reachable from `root`, dependencies before
/// the nodes that use them; `root` comes last.
#[must_use]
pub fn get_graph_nodes_info(root: &Arc<SqlModel>) -> Vec<NodeInfo> {
    let mut infos: Vec<NodeInfo> = Vec::new();
    let mut index: HashMap<NodeKey, usize> = HashMap::new();
    let mut in_edges: HashMap<NodeKey, Vec<Arc<SqlModel>>> = HashMap::new();
    collect_info(root, &RefPath::root(), &mut infos, &mut index, &mut in_edges);

    for info in &mut infos {
        if let Some(parents) = in_edges.remove(&info.model.node_key()) {
            info.in_edges = parents;
        }
    }
    infos
}

fn collect_info(
    node: &Arc<SqlModel>,
    path: &RefPath,
    infos: &mut Vec<NodeInfo>,
    index: &mut HashMap<NodeKey, usize>,
    in_edges: &mut HashMap<NodeKey, Vec<Arc<SqlModel>>>,
) {
    let key = node.node_key();
    if index.contains_key(&key) {
        return;
    }
    // Placeholder entry so a node reached again below is not re-walked.
    index.insert(key.clone(), usize::MAX);

    let mut out_edges: Vec<Arc<SqlModel>> = Vec::new();
    for (name, child) in node.references() {
        collect_info(child, &path.child(name), infos, index, in_edges);
        if !out_edges.iter().any(|existing| existing == child) {
            out_edges.push(Arc::clone(child));
            in_edges
                .entry(child.node_key())
                .or_default()
                .push(Arc::clone(node));
        }
    }

    index.insert(key, infos.len());
    infos.push(NodeInfo {
        model: Arc::clone(node),
        reference_path: path.clone(),
        in_edges: Vec::new(),
        out_edges,
    });
}

/// Info for the node at `path` as seen from `root`.
pub fn get_node_info_selected_node(
    root: &Arc<SqlModel>,
    path: &RefPath,
) -> Result<NodeInfo, GraphError> {
    let target = get_node(root, path)?.node_key();
    get_graph_nodes_info(root)
        .into_iter()
        .find(|info| info.model.node_key() == target)
        .ok_or_else(|| GraphError::PathNotFound {
            path: path.clone(),
            missing: path.to_string(),
        })
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let model = &self.model;
        writeln!(f, "node: {}", model.name())?;
        writeln!(f, "  generic name: {}", model.generic_name())?;
        writeln!(f, "  hash: {}", model.hash())?;
        writeln!(f, "  reference path: {}", self.reference_path)?;
        writeln!(f, "  materialization: {}", model.materialization())?;
        if model.placeholders().is_empty() {
            writeln!(f, "  placeholders: -")?;
        } else {
            writeln!(f, "  placeholders:")?;
            for (name, value) in model.placeholders() {
                writeln!(f, "    {name} = {}", unescaped(value))?;
            }
        }
        if model.references().is_empty() {
            writeln!(f, "  references: -")?;
        } else {
            writeln!(f, "  references:")?;
            for (name, child) in model.references() {
                writeln!(f, "    {name} -> {}", child.name())?;
            }
        }
        writeln!(f, "  in edges: {}", edge_names(&self.in_edges))?;
        write!(f, "  out edges: {}", edge_names(&self.out_edges))
    }
}

/// Template text as it reads in SQL, fields shown in their source form.
fn unescaped(template: &Template) -> String {
    let mut out = String::new();
    for segment in template.segments() {
        match segment {
            Segment::Text(text) => out.push_str(text),
            Segment::Placeholder(name) => {
                out.push('{');
                out.push_str(name);
                out.push('}');
            }
            Segment::Reference(name) => {
                out.push_str("{{");
                out.push_str(name);
                out.push_str("}}");
            }
        }
    }
    out
}

fn edge_names(edges: &[Arc<SqlModel>]) -> String {
    if edges.is_empty() {
        return "-".to_owned();
    }
    edges
        .iter()
        .map(|model| model.name())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use super::{
        RefPath, find_node, find_nodes, get_graph_nodes_info, get_node,
        get_node_info_selected_node, replace_node_in_graph, replace_non_start_node_in_graph,
    };
    use crate::{GraphError, Materialization, PlaceholderValue, SqlModel, SqlModelBuilder};

    fn leaf(name: &str) -> Arc<SqlModel> {
        SqlModelBuilder::new("Leaf", "select {label} as label")
            .placeholder("label", format!("'{name}'"))
            .build()
            .unwrap()
    }

    fn join(left: Arc<SqlModel>, right: Arc<SqlModel>) -> Arc<SqlModel> {
        SqlModelBuilder::new("Join", "select * from {{left}} cross join {{right}}")
            .reference("left", left)
            .reference("right", right)
            .build()
            .unwrap()
    }

    /// root -> (a -> shared, b -> shared)
    fn diamond() -> (Arc<SqlModel>, Arc<SqlModel>) {
        let shared = leaf("shared");
        let a = join(shared.clone(), leaf("a"));
        let b = join(leaf("b"), shared.clone());
        (join(a, b), shared)
    }

    #[test]
    fn get_node_follows_reference_path() {
        let (root, shared) = diamond();
        let path: RefPath = ["left", "left"].into_iter().collect();
        assert_eq!(get_node(&root, &path).unwrap().hash(), shared.hash());

        let err = get_node(&root, &["left", "nope"][..].into()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "reference path left/nope does not resolve: no reference \"nope\""
        );
    }

    #[test]
    fn find_node_tests_each_distinct_node_once() {
        let (root, shared) = diamond();
        let mut calls = 0;
        let found = find_node(&root, |model| {
            calls += 1;
            model.hash() == shared.hash()
        })
        .unwrap();
        assert_eq!(found.reference_path.to_string(), "left/left");

        let mut all_calls = 0;
        let none = find_node(&root, |_| {
            all_calls += 1;
            false
        });
        assert!(none.is_none());
        // root, a, b, shared, leaf a, leaf b
        assert_eq!(all_calls, 6);
        assert!(calls <= all_calls);
    }

    #[test]
    fn find_nodes_returns_distinct_matches() {
        let (root, _) = diamond();
        let leaves = find_nodes(&root, |model| model.generic_name() == "Leaf");
        assert_eq!(leaves.len(), 3);
        let joins = find_nodes(&root, |model| model.generic_name() == "Join");
        assert_eq!(joins[0].reference_path, RefPath::root());
    }

    #[test]
    fn replace_rebuilds_only_the_path() {
        let (root, _) = diamond();
        let replacement = leaf("replacement");
        let path: RefPath = ["left", "right"].into_iter().collect();
        let new_root = replace_node_in_graph(&root, &path, replacement.clone()).unwrap();

        assert_ne!(new_root.hash(), root.hash());
        assert_eq!(get_node(&new_root, &path).unwrap().hash(), replacement.hash());
        // Siblings off the path are the very same allocations.
        assert!(Arc::ptr_eq(&new_root.references()["right"], &root.references()["right"]));
        assert!(Arc::ptr_eq(
            &new_root.references()["left"].references()["left"],
            &root.references()["left"].references()["left"]
        ));
        // The original graph is unchanged.
        assert_eq!(get_node(&root, &path).unwrap().hash(), leaf("a").hash());
    }

    #[test]
    fn replace_reports_unresolvable_paths() {
        let (root, _) = diamond();
        let err = replace_node_in_graph(&root, &["right", "middle"][..].into(), leaf("x"))
            .unwrap_err();
        assert!(matches!(err, GraphError::PathNotFound { .. }));

        let err = replace_non_start_node_in_graph(&root, &RefPath::root(), leaf("x")).unwrap_err();
        assert_eq!(err, GraphError::EmptyPath);
        assert_eq!(
            replace_node_in_graph(&root, &RefPath::root(), leaf("x")).unwrap().hash(),
            leaf("x").hash()
        );
    }

    #[test]
    fn set_changes_placeholders_at_path() {
        let (root, _) = diamond();
        let path: RefPath = ["right", "left"].into_iter().collect();
        let mut values = BTreeMap::new();
        values.insert("label".to_owned(), PlaceholderValue::from("'changed'"));
        let new_root = root.set(&path, values).unwrap();
        assert_eq!(
            get_node(&new_root, &path).unwrap().hash(),
            leaf("changed").hash()
        );
        assert_eq!(get_node(&root, &path).unwrap().hash(), leaf("b").hash());
    }

    #[test]
    fn node_info_lists_edges_once() {
        let (root, shared) = diamond();
        let infos = get_graph_nodes_info(&root);
        assert_eq!(infos.len(), 6);
        assert_eq!(infos.last().unwrap().model.hash(), root.hash());

        let shared_info = infos
            .iter()
            .find(|info| info.model.hash() == shared.hash())
            .unwrap();
        assert_eq!(shared_info.in_edges.len(), 2);
        assert!(shared_info.out_edges.is_empty());
        assert_eq!(shared_info.reference_path.to_string(), "left/left");

        let root_position = infos.len() - 1;
        for (position, info) in infos.iter().enumerate() {
            for child in &info.out_edges {
                let child_position = infos.iter().position(|i| &i.model == child).unwrap();
                assert!(child_position < position);
            }
            if position != root_position {
                assert!(!info.in_edges.is_empty());
            }
        }

        let text = shared_info.to_string();
        assert!(text.contains("reference path: left/left"));
        assert!(text.contains("materialization: cte"));
        assert!(text.contains("label = 'shared'"));
    }

    #[test]
    fn node_info_for_selected_node() {
        let (root, _) = diamond();
        let view = root.copy_set_materialization(Materialization::View);
        let info = get_node_info_selected_node(&view, &["right"][..].into()).unwrap();
        assert_eq!(info.in_edges.len(), 1);
        assert_eq!(info.in_edges[0].materialization(), Materialization::View);
    }

    #[test]
    fn node_info_shows_braces_in_values_as_written() {
        let braces = leaf("{x}");
        let info = get_node_info_selected_node(&braces, &RefPath::default()).unwrap();
        let text = info.to_string();
        assert!(text.contains("label = '{x}'"), "{text}");
        assert!(!text.contains("{{{{"));
    }
}
