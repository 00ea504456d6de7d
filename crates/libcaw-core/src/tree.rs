//! Tree of files touched by peers, keyed by path segment

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    File,
    Directory(BTreeMap<String, Node>),
}

impl Node {
    pub fn is_file(&self) -> bool {
        matches!(self, Node::File)
    }
}

/// Directory tree rooted at a project root.
///
/// Paths are relative and `/`-separated. Inserting a path through an
/// existing file turns that file into a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTree {
    root: Node,
}

impl Default for PathTree {
    fn default() -> Self {
        Self::new()
    }
}

impl PathTree {
    pub fn new() -> Self {
        Self {
            root: Node::Directory(BTreeMap::new()),
        }
    }

    /// Insert a file. Returns false if it was already present.
    pub fn insert(&mut self, path: &str) -> bool {
        let segments: Vec<&str> = segments(path).collect();
        let Some((file, dirs)) = segments.split_last() else {
            return false;
        };

        let mut node = &mut self.root;
        for dir in dirs {
            node = as_directory(node)
                .entry((*dir).to_string())
                .or_insert_with(|| Node::Directory(BTreeMap::new()));
        }

        match as_directory(node).entry((*file).to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(Node::File);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    pub fn lookup(&self, path: &str) -> Option<&Node> {
        segments(path).try_fold(&self.root, |node, segment| match node {
            Node::Directory(children) => children.get(segment),
            Node::File => None,
        })
    }

    pub fn contains_file(&self, path: &str) -> bool {
        self.lookup(path).is_some_and(Node::is_file)
    }

    /// All file paths, sorted
    pub fn files(&self) -> Vec<String> {
        let mut out = Vec::new();
        collect_files(&self.root, String::new(), &mut out);
        out
    }

    pub fn is_empty(&self) -> bool {
        matches!(&self.root, Node::Directory(children) if children.is_empty())
    }

    pub fn clear(&mut self) {
        self.root = Node::Directory(BTreeMap::new());
    }
}

fn as_directory(node: &mut Node) -> &mut BTreeMap<String, Node> {
    if node.is_file() {
        *node = Node::Directory(BTreeMap::new());
    }
    match node {
        Node::Directory(children) => children,
        Node::File => unreachable!("file nodes are replaced above"),
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split(['/', '\\']).filter(|s| !s.is_empty() && *s != ".")
}

fn collect_files(node: &Node, prefix: String, out: &mut Vec<String>) {
    match node {
        Node::File => out.push(prefix),
        Node::Directory(children) => {
            for (name, child) in children {
                let path = if prefix.is_empty() {
                    name.clone()
                } else {
                    format!("{}/{}", prefix, name)
                };
                collect_files(child, path, out);
            }
        }
    }
}
