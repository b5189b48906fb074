use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use log::debug;
use phylotree::tree::{NewickFormat, Tree as PhyloTree};
use serde::Deserialize;

use crate::error::PreferenceError;
use crate::tree::prefs::{PreferenceStore, ViewPreferences};
use crate::tree::{decimal_from_f64, DendrogramNode, LoadedTree, TreeBundle, TreeFileFormat};

pub mod fetch;

pub fn load_trees(path: &Path) -> Result<TreeBundle> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read tree file: {}", path.display()))?;
    let bundle = parse_trees(&raw)?;
    debug!(
        "loaded {} tree(s) from {} as {:?}",
        bundle.trees.len(),
        path.display(),
        bundle.format
    );
    Ok(bundle)
}

pub fn parse_trees(raw: &str) -> Result<TreeBundle> {
    let format = detect_format(raw);
    let trees = match format {
        TreeFileFormat::Newick => parse_newick(raw)?,
        TreeFileFormat::Nexus => parse_nexus(raw)?,
        TreeFileFormat::Json => vec![parse_json(raw)?],
    };
    if trees.is_empty() {
        bail!("tree file did not contain any trees");
    }
    Ok(TreeBundle::new(format, trees))
}

fn detect_format(raw: &str) -> TreeFileFormat {
    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || (trimmed.starts_with('[') && trimmed.ends_with(']')) {
            continue;
        }
        if trimmed.starts_with('{') {
            return TreeFileFormat::Json;
        }
        let upper = trimmed.to_ascii_uppercase();
        if upper.starts_with("#NEXUS") || upper.starts_with("BEGIN ") || upper.starts_with("TREE ")
        {
            return TreeFileFormat::Nexus;
        }
        if trimmed.contains('(') {
            return TreeFileFormat::Newick;
        }
    }
    TreeFileFormat::Newick
}

fn parse_json(raw: &str) -> Result<LoadedTree> {
    // Every dendrogram level nests two JSON levels; lopsided trees go deep.
    let mut json = serde_json::Deserializer::from_str(raw);
    json.disable_recursion_limit();
    let dendrogram = DendrogramNode::deserialize(serde_stacker::Deserializer::new(&mut json))
        .context("failed to parse JSON dendrogram")?;
    json.end().context("trailing characters after JSON dendrogram")?;
    Ok(LoadedTree {
        id: 0,
        label: None,
        newick: dendrogram.to_newick(),
        dendrogram,
    })
}

fn parse_newick(raw: &str) -> Result<Vec<LoadedTree>> {
    let mut trees = Vec::new();
    for chunk in raw.split_inclusive(';') {
        let candidate = chunk.trim();
        if candidate.is_empty() || !candidate.ends_with(';') {
            continue;
        }
        let index = trees.len();
        trees.push(build_tree(index, None, normalise_newick(candidate), None)?);
    }
    Ok(trees)
}

/// State of the line-oriented Nexus scan inside a TREES block.
#[derive(Default)]
struct NexusTrees {
    trees: Vec<LoadedTree>,
    translate: HashMap<String, String>,
    translating: bool,
    pending: Vec<String>,
}

impl NexusTrees {
    fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let line = self.pending.join(" ");
        self.pending.clear();
        let table = (!self.translate.is_empty()).then_some(&self.translate);
        let parsed = parse_nexus_tree_line(&line)
            .and_then(|(label, newick)| build_tree(self.trees.len(), label, newick, table));
        match parsed {
            Ok(tree) => self.trees.push(tree),
            Err(err) => debug!("skipping unreadable nexus tree: {err}"),
        }
    }

    fn read_translate(&mut self, line: &str) {
        for pair in line.split(',') {
            let pair = pair.trim().trim_end_matches(';').trim();
            let mut parts = pair.splitn(2, char::is_whitespace);
            if let (Some(key), Some(name)) = (parts.next(), parts.next()) {
                let name = name.trim().trim_matches('\'').trim_matches('"');
                self.translate.insert(key.to_string(), name.to_string());
            }
        }
        if line.trim_end().ends_with(';') {
            self.translating = false;
        }
    }
}

fn strip_comments(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut depth = 0usize;
    for c in line.chars() {
        match c {
            '[' => depth += 1,
            ']' if depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out.trim().to_string()
}

fn parse_nexus(raw: &str) -> Result<Vec<LoadedTree>> {
    let mut scan = NexusTrees::default();
    let mut in_trees_block = false;

    for raw_line in raw.lines() {
        let upper = raw_line.trim().to_ascii_uppercase();
        // Annotations inside tree definitions are left for the newick parser.
        let line = if in_trees_block && (upper.starts_with("TREE ") || upper.starts_with("UTREE ") || !scan.pending.is_empty()) {
            raw_line.trim().to_string()
        } else {
            strip_comments(raw_line)
        };
        if line.is_empty() {
            continue;
        }
        let upper = line.to_ascii_uppercase();

        if upper.starts_with("BEGIN TREES") {
            in_trees_block = true;
            continue;
        }
        if upper.starts_with("END") {
            scan.flush();
            in_trees_block = false;
            continue;
        }
        if !in_trees_block {
            continue;
        }

        if scan.translating {
            scan.read_translate(&line);
            continue;
        }
        if upper.starts_with("TRANSLATE") {
            scan.translating = true;
            let rest = line["translate".len()..].to_string();
            scan.read_translate(&rest);
            continue;
        }
        if upper.starts_with("TREE ") || upper.starts_with("UTREE ") {
            scan.flush();
            scan.pending.push(line.clone());
        } else if !scan.pending.is_empty() {
            scan.pending.push(line.clone());
        }
        if !scan.pending.is_empty() && strip_comments(&line).ends_with(';') {
            scan.flush();
        }
    }
    scan.flush();
    Ok(scan.trees)
}

fn build_tree(
    index: usize,
    label: Option<String>,
    newick: String,
    translate: Option<&HashMap<String, String>>,
) -> Result<LoadedTree> {
    let phylo = PhyloTree::from_newick(&newick)
        .map_err(|err| anyhow!("failed to parse newick tree: {err}"))?;
    let root = phylo
        .get_root()
        .map_err(|err| anyhow!("newick tree has no root: {err}"))?;
    let dendrogram = convert_node(&phylo, root, translate)?;
    let canonical = phylo
        .to_formatted_newick(NewickFormat::NoComments)
        .unwrap_or(newick);
    Ok(LoadedTree {
        id: index,
        label,
        newick: canonical,
        dendrogram,
    })
}

/// Convert a parsed tree into the engine's dendrogram; missing lengths read as 0.
fn convert_node(
    phylo: &PhyloTree,
    id: usize,
    translate: Option<&HashMap<String, String>>,
) -> Result<DendrogramNode> {
    let node = phylo
        .get(&id)
        .map_err(|err| anyhow!("dangling node {id} in parsed tree: {err}"))?;
    let branch_length = node.parent_edge.map(decimal_from_f64).unwrap_or_default();
    if node.children.is_empty() {
        let name = node.name.clone().map(|name| match translate {
            Some(table) => table.get(&name).cloned().unwrap_or(name),
            None => name,
        });
        return Ok(DendrogramNode {
            name,
            branch_length,
            children: Vec::new(),
        });
    }
    let children = node
        .children
        .iter()
        .map(|&child| convert_node(phylo, child, translate))
        .collect::<Result<Vec<_>>>()?;
    Ok(DendrogramNode::internal(branch_length, children))
}

fn parse_nexus_tree_line(line: &str) -> Result<(Option<String>, String)> {
    let lower = line.to_ascii_lowercase();
    let keyword = if lower.starts_with("tree ") {
        5
    } else if lower.starts_with("utree ") {
        6
    } else {
        bail!("not a nexus tree line: {line}");
    };

    let (label_part, tree_part) = line[keyword..]
        .split_once('=')
        .ok_or_else(|| anyhow!("missing tree definition in nexus line: {line}"))?;

    let label = label_part
        .trim()
        .trim_start_matches('*')
        .trim()
        .trim_matches('"')
        .trim_matches('\'');
    let label = (!label.is_empty()).then(|| label.to_string());

    let mut payload = tree_part.trim().trim_end_matches(';').trim();
    // Leading rooting hints such as [&R] / [&U].
    while let Some(rest) = payload.strip_prefix('[') {
        match rest.find(']') {
            Some(end) => payload = rest[end + 1..].trim(),
            None => break,
        }
    }
    Ok((label, normalise_newick(payload)))
}

fn normalise_newick(raw: &str) -> String {
    let mut cleaned = raw.trim().trim_end_matches(';').trim().to_owned();
    cleaned.push(';');
    cleaned
}

/// Preference record stored as a pretty-printed JSON file.
#[derive(Debug, Clone)]
pub struct JsonPreferenceStore {
    path: PathBuf,
}

impl JsonPreferenceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PreferenceStore for JsonPreferenceStore {
    fn load(&self) -> Result<Option<ViewPreferences>, PreferenceError> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn save(&self, prefs: &ViewPreferences) -> Result<(), PreferenceError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(prefs)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[test]
    fn detects_format_correctly() {
        assert_eq!(detect_format("#NEXUS\nBEGIN TREES;"), TreeFileFormat::Nexus);
        assert_eq!(detect_format("(A:0.1,B:0.2);"), TreeFileFormat::Newick);
        assert_eq!(detect_format("   #nexus   \n"), TreeFileFormat::Nexus);
        assert_eq!(detect_format("[comment]\n(A,B);"), TreeFileFormat::Newick);
        assert_eq!(detect_format("{\"children\": []}"), TreeFileFormat::Json);
    }

    #[test]
    fn parses_newick_into_exact_decimals() {
        let trees = parse_newick("((A:0.1,B:0.2):0.3,C:0.4);").unwrap();
        assert_eq!(trees.len(), 1);
        let tree = &trees[0].dendrogram;
        assert_eq!(tree.leaf_names(), vec!["A", "B", "C"]);
        assert_eq!(tree.children[0].children[0].branch_length, Decimal::new(1, 1));
        assert_eq!(tree.max_leaf_distance(), Decimal::new(5, 1));
    }

    #[test]
    fn parses_multiple_newick() {
        let trees = parse_newick("(A:0.1,B:0.2);\n(C:0.3,D:0.4);\n").unwrap();
        assert_eq!(trees.len(), 2);
        assert_eq!(trees[1].id, 1);
    }

    #[test]
    fn parses_simple_nexus() {
        let input = "#NEXUS\nBEGIN TREES;\nTREE tree1 = [&R] (A:0.1,B:0.2);\nEND;";
        let trees = parse_nexus(input).unwrap();
        assert_eq!(trees.len(), 1);
        assert_eq!(trees[0].label.as_deref(), Some("tree1"));
        assert_eq!(trees[0].leaf_count(), 2);
    }

    #[test]
    fn parses_nexus_multiline_tree_and_comments() {
        let input = "#NEXUS
[This is a comment]
BEGIN TREES;
    TREE tree1 =
        (A:0.1,
         B:0.2);
    [Another comment]
    UTREE 'my tree' = (C:0.3,D:0.4);
END;";
        let trees = parse_nexus(input).unwrap();
        assert_eq!(trees.len(), 2);
        assert_eq!(trees[0].label.as_deref(), Some("tree1"));
        assert_eq!(trees[1].label.as_deref(), Some("my tree"));
    }

    #[test]
    fn applies_translate_table_to_leaves() {
        let input = "#NEXUS
BEGIN TREES;
    TRANSLATE
        1 case_a,
        2 'case b'
        ;
    TREE t = (1:0.5,2:0.25);
END;";
        let trees = parse_nexus(input).unwrap();
        assert_eq!(trees[0].dendrogram.leaf_names(), vec!["case_a", "case b"]);
    }

    #[test]
    fn loads_json_dendrograms() {
        let bundle = parse_trees(
            r#"{"branchLength": 0, "children": [{"name": "A", "branchLength": "0.5"}, {"name": "B", "branchLength": 1}]}"#,
        )
        .unwrap();
        assert_eq!(bundle.format, TreeFileFormat::Json);
        assert_eq!(bundle.trees[0].newick, "(A:0.5,B:1):0;");
    }

    #[test]
    fn loads_deep_lopsided_json_dendrograms() {
        let depth = 300;
        let mut json = r#"{"children": [{"name": "last", "branchLength": 1}, {"name": "deepest", "branchLength": 1}]}"#
            .to_string();
        for level in (0..depth).rev() {
            json = format!(
                r#"{{"branchLength": 1, "children": [{{"name": "case{level}", "branchLength": 1}}, {json}]}}"#
            );
        }
        let bundle = parse_trees(&json).unwrap();
        let dendrogram = &bundle.trees[0].dendrogram;
        assert_eq!(dendrogram.leaf_count(), depth + 2);
        assert_eq!(dendrogram.leaf_names()[0], "case0");
        assert_eq!(dendrogram.max_leaf_distance(), rust_decimal::Decimal::from(depth));
    }

    #[test]
    fn rejects_trailing_json() {
        assert!(parse_trees(r#"{"children": []} {"#).is_err());
    }

    #[test]
    fn preference_file_round_trips() {
        let path = std::env::temp_dir().join(format!("casetree-prefs-{}.json", std::process::id()));
        let store = JsonPreferenceStore::new(&path);
        let _ = fs::remove_file(&path);
        assert!(store.load().unwrap().is_none());

        let prefs = ViewPreferences {
            zoom_level: 1.5,
            vertical_scroll_px: 12.0,
            horizontal_scroll_px: 3.0,
            tree_configuration_id: Some("cfg".into()),
        };
        store.save(&prefs).unwrap();
        assert_eq!(store.load().unwrap(), Some(prefs));
        let _ = fs::remove_file(&path);
    }
}
