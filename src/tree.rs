//src/tree.rs

use std::collections::BTreeSet;
use std::fmt::Write as FmtWrite;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::str::FromStr;

use crate::error::{OtuError, Result};

/// Characters that force a Newick label to be quoted.
const NEWICK_SPECIAL: &[char] = &['(', ')', '[', ']', ',', ':', ';', '\'', ' ', '\t'];

/// One vertex of the reference tree. Nodes are owned by `PhyloTree` and
/// refer to each other by index only.
#[derive(Debug, Clone)]
pub struct TreeNode {
    pub id: usize,
    pub name: String,
    pub taxon: String,
    /// Branch length to `parent`; zero at the root.
    pub length: f64,
    /// Distance to the node the taxonomy label was inherited from.
    pub anno_dist: f64,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
}

impl TreeNode {
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Supported tree export formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeFormat {
    Newick,
}

impl FromStr for TreeFormat {
    type Err = OtuError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "newick" => Ok(TreeFormat::Newick),
            other => Err(OtuError::format(
                "tree export",
                format!("unsupported tree format '{other}'"),
            )),
        }
    }
}

/// An unrooted reference tree, rooted at one node for traversal.
///
/// Edges are stored undirected so the tree can be re-rooted; `parent`,
/// `children` and `length` on each node always describe the current rooting.
#[derive(Debug, Clone)]
pub struct PhyloTree {
    nodes: Vec<TreeNode>,
    /// Undirected adjacency: neighbor id and edge length.
    edges: Vec<Vec<(usize, f64)>>,
    root: usize,
    num_sites: usize,
}

impl PhyloTree {
    /// An empty tree over `num_sites` alignment columns.
    pub fn new(num_sites: usize) -> Self {
        Self {
            nodes: Vec::new(),
            edges: Vec::new(),
            root: 0,
            num_sites,
        }
    }

    /// Append a node and return its id. `parent` must already exist.
    pub fn add_node(
        &mut self,
        name: &str,
        taxon: &str,
        parent: Option<usize>,
        length: f64,
    ) -> Result<usize> {
        if !length.is_finite() || length < 0.0 {
            return Err(OtuError::Domain(format!("invalid branch length {length}")));
        }
        let id = self.nodes.len();
        let length = match parent {
            Some(p) if p >= id => return Err(OtuError::Lookup(p as i64)),
            Some(p) => {
                self.edges[p].push((id, length));
                self.nodes[p].children.push(id);
                length
            }
            None if id > 0 => {
                return Err(OtuError::Consistency(format!(
                    "tree already has a root, cannot add '{name}' without a parent"
                )))
            }
            None => 0.0,
        };
        self.edges.push(parent.map(|p| vec![(p, length)]).unwrap_or_default());
        self.nodes.push(TreeNode {
            id,
            name: name.to_string(),
            taxon: taxon.to_string(),
            length,
            anno_dist: 0.0,
            parent,
            children: Vec::new(),
        });
        Ok(id)
    }

    pub fn set_anno_dist(&mut self, id: usize, dist: f64) -> Result<()> {
        if !dist.is_finite() || dist < 0.0 {
            return Err(OtuError::Domain(format!("invalid annotation distance {dist}")));
        }
        let node = self.nodes.get_mut(id).ok_or(OtuError::Lookup(id as i64))?;
        node.anno_dist = dist;
        Ok(())
    }

    /// Loads a node table:
    /// ```text
    /// # comments
    /// sites	<L>
    /// <id>	<parent_id|-1>	<branch_length>	<name>	<taxon>	[anno_dist]
    /// ```
    /// Ids must cover `0..N` exactly, in any order. The tree is rooted at node 0.
    /// A missing annotation distance reads as 0.
    pub fn load_node_table<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        Self::read_node_table(BufReader::new(file), &path.display().to_string())
    }

    pub fn read_node_table<R: BufRead>(reader: R, source: &str) -> Result<Self> {
        let mut num_sites: Option<usize> = None;
        let mut rows: Vec<(usize, i64, f64, String, String, f64)> = Vec::new();

        for (lineno, line_result) in reader.lines().enumerate() {
            let line = line_result?;
            let context = || format!("{source}:{}", lineno + 1);
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            let parts: Vec<&str> = line.split('\t').collect();

            if num_sites.is_none() {
                if parts.len() != 2 || parts[0].trim() != "sites" {
                    return Err(OtuError::format(context(), "expected 'sites\\t<L>' line first"));
                }
                let l = parts[1].trim().parse::<usize>().map_err(|_| {
                    OtuError::format(context(), format!("bad site count '{}'", parts[1]))
                })?;
                num_sites = Some(l);
                continue;
            }

            if parts.len() < 5 {
                return Err(OtuError::format(
                    context(),
                    format!("expected 5 tab-separated fields, found {}", parts.len()),
                ));
            }
            let id: usize = parts[0]
                .trim()
                .parse()
                .map_err(|_| OtuError::format(context(), format!("bad node id '{}'", parts[0])))?;
            let parent: i64 = parts[1]
                .trim()
                .parse()
                .ok()
                .filter(|p: &i64| *p >= -1)
                .ok_or_else(|| OtuError::format(context(), format!("bad parent id '{}'", parts[1])))?;
            let length: f64 = parts[2]
                .trim()
                .parse()
                .ok()
                .filter(|x: &f64| x.is_finite() && *x >= 0.0)
                .ok_or_else(|| OtuError::format(context(), format!("bad branch length '{}'", parts[2])))?;
            let anno_dist: f64 = match parts.get(5).map(|f| f.trim()).filter(|f| !f.is_empty()) {
                None => 0.0,
                Some(field) => field
                    .parse()
                    .ok()
                    .filter(|x: &f64| x.is_finite() && *x >= 0.0)
                    .ok_or_else(|| OtuError::format(context(), format!("bad annotation distance '{field}'")))?,
            };
            rows.push((
                id,
                parent,
                length,
                parts[3].trim().to_string(),
                parts[4].trim().to_string(),
                anno_dist,
            ));
        }

        let num_sites = num_sites.ok_or_else(|| OtuError::format(source, "missing 'sites' line"))?;
        let n = rows.len();

        // Arena slots indexed by id; every id in 0..n exactly once
        let mut slots: Vec<Option<(i64, f64, String, String, f64)>> = vec![None; n];
        for (id, parent, length, name, taxon, anno_dist) in rows {
            if id >= n || slots[id].is_some() {
                return Err(OtuError::format(source, format!("node ids must be unique and dense, found {id}")));
            }
            slots[id] = Some((parent, length, name, taxon, anno_dist));
        }

        let mut tree = PhyloTree::new(num_sites);
        let mut links = Vec::with_capacity(n);
        for (id, slot) in slots.into_iter().enumerate() {
            let Some((parent, length, name, taxon, anno_dist)) = slot else {
                return Err(OtuError::format(source, format!("node {id} is missing")));
            };
            tree.nodes.push(TreeNode {
                id,
                name,
                taxon,
                length: 0.0,
                anno_dist,
                parent: None,
                children: Vec::new(),
            });
            tree.edges.push(Vec::new());
            if parent >= 0 && parent as usize != id {
                links.push((id, parent, length));
            }
        }
        if links.len() + 1 != n && n > 0 {
            return Err(OtuError::format(
                source,
                format!("{} nodes need {} parent links, found {}", n, n - 1, links.len()),
            ));
        }
        for (child, parent, length) in links {
            if parent as usize >= n {
                return Err(OtuError::Lookup(parent));
            }
            let parent = parent as usize;
            tree.edges[parent].push((child, length));
            tree.edges[child].push((parent, length));
        }

        if n > 0 {
            tree.set_root(0)?;
            if tree.nodes.iter().filter(|node| node.is_root()).count() != 1
                || tree.count_reachable() != n
            {
                return Err(OtuError::format(source, "node table does not describe a single tree"));
            }
        }
        Ok(tree)
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_alignment_sites(&self) -> usize {
        self.num_sites
    }

    pub fn root(&self) -> usize {
        self.root
    }

    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }

    /// O(1) lookup; negative or out-of-range ids are lookup errors.
    pub fn get_node(&self, id: i64) -> Result<&TreeNode> {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.nodes.get(i))
            .ok_or(OtuError::Lookup(id))
    }

    /// Reorient parent/child links so that `id` becomes the root.
    pub fn set_root(&mut self, id: usize) -> Result<()> {
        if id >= self.nodes.len() {
            return Err(OtuError::Lookup(id as i64));
        }
        for node in &mut self.nodes {
            node.parent = None;
            node.children.clear();
            node.length = 0.0;
        }
        let mut visited = vec![false; self.nodes.len()];
        let mut stack = vec![id];
        visited[id] = true;
        while let Some(cur) = stack.pop() {
            for &(next, length) in &self.edges[cur] {
                if visited[next] {
                    continue;
                }
                visited[next] = true;
                self.nodes[next].parent = Some(cur);
                self.nodes[next].length = length;
                self.nodes[cur].children.push(next);
                stack.push(next);
            }
        }
        self.root = id;
        Ok(())
    }

    fn count_reachable(&self) -> usize {
        let mut count = 0;
        let mut stack = vec![self.root];
        while let Some(cur) = stack.pop() {
            count += 1;
            stack.extend(self.nodes[cur].children.iter().copied());
        }
        count
    }

    /// Every node of `ids` plus everything on its path to the root.
    pub fn ancestor_closure<I>(&self, ids: I) -> Result<BTreeSet<usize>>
    where
        I: IntoIterator<Item = usize>,
    {
        let mut closure = BTreeSet::new();
        for id in ids {
            let mut node = self.get_node(id as i64)?;
            // Climb until we meet a node already collected
            while closure.insert(node.id) {
                match node.parent {
                    Some(p) => node = &self.nodes[p],
                    None => break,
                }
            }
        }
        Ok(closure)
    }

    /// Serialize the subtree spanned by `ids` and their ancestors.
    pub fn export_subtree<I>(&self, ids: I, format: TreeFormat) -> Result<String>
    where
        I: IntoIterator<Item = usize>,
    {
        let closure = self.ancestor_closure(ids)?;
        match format {
            TreeFormat::Newick => Ok(self.to_newick(&closure)),
        }
    }

    /// Newick text restricted to `keep`, which must be closed under ancestors.
    fn to_newick(&self, keep: &BTreeSet<usize>) -> String {
        enum Step {
            Open(usize),
            Close(usize),
            Comma,
        }

        let mut out = String::new();
        if !keep.contains(&self.root) {
            out.push(';');
            return out;
        }

        // Iterative DFS so deep trees cannot overflow the stack
        let mut stack = vec![Step::Open(self.root)];
        while let Some(step) = stack.pop() {
            match step {
                Step::Open(id) => {
                    let kids: Vec<usize> = self.nodes[id]
                        .children
                        .iter()
                        .copied()
                        .filter(|c| keep.contains(c))
                        .collect();
                    if kids.is_empty() {
                        self.write_newick_label(&self.nodes[id], &mut out);
                        continue;
                    }
                    out.push('(');
                    stack.push(Step::Close(id));
                    // reversed so the first child pops first
                    for (k, &child) in kids.iter().enumerate().rev() {
                        stack.push(Step::Open(child));
                        if k > 0 {
                            stack.push(Step::Comma);
                        }
                    }
                }
                Step::Close(id) => {
                    out.push(')');
                    self.write_newick_label(&self.nodes[id], &mut out);
                }
                Step::Comma => out.push(','),
            }
        }
        out.push(';');
        out
    }

    fn write_newick_label(&self, node: &TreeNode, out: &mut String) {
        let label = if node.name.is_empty() {
            node.id.to_string()
        } else {
            node.name.clone()
        };
        if label.contains(NEWICK_SPECIAL) {
            let _ = write!(out, "'{}'", label.replace('\'', "''"));
        } else {
            out.push_str(&label);
        }
        if !node.is_root() {
            let _ = write!(out, ":{}", node.length);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    ///          root(0)
    ///         /       \
    ///     a(1):0.1   f(6):0.7
    ///     /     \
    ///  b(2):0.2  e(5):0.5
    ///   /   \
    /// c(3)  d(4)
    fn sample_tree() -> PhyloTree {
        let mut tree = PhyloTree::new(12);
        tree.add_node("root", "Bacteria", None, 0.0).unwrap();
        tree.add_node("a", "Firmicutes", Some(0), 0.1).unwrap();
        tree.add_node("b", "Bacilli", Some(1), 0.2).unwrap();
        tree.add_node("c", "Bacillus subtilis", Some(2), 0.3).unwrap();
        tree.add_node("d", "Bacillus cereus", Some(2), 0.4).unwrap();
        tree.add_node("e", "Clostridia", Some(1), 0.5).unwrap();
        tree.add_node("f", "Proteobacteria", Some(0), 0.7).unwrap();
        tree
    }

    #[test]
    fn lookup_by_id() {
        let tree = sample_tree();
        assert_eq!(tree.num_nodes(), 7);
        assert_eq!(tree.num_alignment_sites(), 12);
        assert_eq!(tree.get_node(3).unwrap().taxon, "Bacillus subtilis");
        assert!(matches!(tree.get_node(7), Err(OtuError::Lookup(7))));
        assert!(matches!(tree.get_node(-1), Err(OtuError::Lookup(-1))));
    }

    #[test]
    fn closure_of_siblings_reaches_root() {
        let tree = sample_tree();
        let closure = tree.ancestor_closure([3, 4]).unwrap();
        assert_eq!(closure.into_iter().collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);

        let same = tree.ancestor_closure([3, 3]).unwrap();
        assert_eq!(same.into_iter().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert!(tree.ancestor_closure([99]).is_err());
    }

    #[test]
    fn closure_with_grandparent_root() {
        let mut tree = PhyloTree::new(4);
        tree.add_node("gp", "", None, 0.0).unwrap();
        tree.add_node("p", "", Some(0), 1.0).unwrap();
        tree.add_node("l1", "", Some(1), 1.0).unwrap();
        tree.add_node("l2", "", Some(1), 1.0).unwrap();
        let closure = tree.ancestor_closure([2, 3]).unwrap();
        assert_eq!(closure, BTreeSet::from([0, 1, 2, 3]));
        assert_eq!(
            tree.export_subtree([2, 3], TreeFormat::Newick).unwrap(),
            "((l1:1,l2:1)p:1)gp;"
        );
    }

    #[test]
    fn export_prunes_outside_closure() {
        let tree = sample_tree();
        let newick = tree.export_subtree([3, 5], TreeFormat::Newick).unwrap();
        assert_eq!(newick, "(((c:0.3)b:0.2,e:0.5)a:0.1)root;");

        let full = tree.export_subtree(0..7, TreeFormat::Newick).unwrap();
        assert_eq!(full, "(((c:0.3,d:0.4)b:0.2,e:0.5)a:0.1,f:0.7)root;");

        assert_eq!(tree.export_subtree([], TreeFormat::Newick).unwrap(), ";");
        assert_eq!(tree.export_subtree([0], TreeFormat::Newick).unwrap(), "root;");
    }

    #[test]
    fn quotes_special_labels() {
        let mut tree = PhyloTree::new(1);
        tree.add_node("", "", None, 0.0).unwrap();
        tree.add_node("E. coli K-12", "", Some(0), 0.25).unwrap();
        tree.add_node("it's", "", Some(0), 0.5).unwrap();
        let newick = tree.export_subtree([1, 2], TreeFormat::Newick).unwrap();
        assert_eq!(newick, "('E. coli K-12':0.25,'it''s':0.5)0;");
    }

    #[test]
    fn deep_caterpillar_exports_without_recursion() {
        let mut tree = PhyloTree::new(1);
        tree.add_node("n0", "", None, 0.0).unwrap();
        for i in 1..100_000 {
            tree.add_node(&format!("n{i}"), "", Some(i - 1), 0.01).unwrap();
        }
        let newick = tree.export_subtree([99_999], TreeFormat::Newick).unwrap();
        assert!(newick.starts_with("(((("));
        assert!(newick.ends_with(")n0;"));
    }

    #[test]
    fn set_root_reorients_edges() {
        let mut tree = sample_tree();
        tree.set_root(2).unwrap();
        assert_eq!(tree.root(), 2);
        assert!(tree.get_node(2).unwrap().is_root());
        let a = tree.get_node(1).unwrap();
        assert_eq!(a.parent, Some(2));
        assert_eq!(a.length, 0.2);
        let root = tree.get_node(0).unwrap();
        assert_eq!(root.parent, Some(1));
        assert_eq!(root.length, 0.1);

        let closure = tree.ancestor_closure([6]).unwrap();
        assert_eq!(closure, BTreeSet::from([0, 1, 2, 6]));
        assert!(tree.set_root(42).is_err());
    }

    #[test]
    fn reads_node_table() {
        let text = "# reference tree\nsites\t8\n\
                    2\t0\t0.5\tleafB\tBeta\n\
                    0\t-1\t0\troot\tAll\n\
                    1\t0\t0.25\tleafA\tAlpha\t0.125\n";
        let tree = PhyloTree::read_node_table(Cursor::new(text), "test.nodes").unwrap();
        assert_eq!(tree.num_nodes(), 3);
        assert_eq!(tree.num_alignment_sites(), 8);
        assert_eq!(tree.get_node(1).unwrap().name, "leafA");
        assert_eq!(tree.get_node(2).unwrap().length, 0.5);
        assert!(tree.get_node(0).unwrap().is_root());
        assert_eq!(tree.get_node(1).unwrap().anno_dist, 0.125);
        assert_eq!(tree.get_node(2).unwrap().anno_dist, 0.0);
    }

    #[test]
    fn rejects_parent_ids_below_root_marker() {
        let text = "sites\t4\n0\t-1\t0\tr\tx\n1\t-5\t0.1\tl\ty\n";
        match PhyloTree::read_node_table(Cursor::new(text), "t.nodes").unwrap_err() {
            OtuError::Format { context, message } => {
                assert_eq!(context, "t.nodes:3");
                assert!(message.contains("-5"));
            }
            other => panic!("unexpected error {other:?}"),
        }

        let bad_anno = "sites\t4\n0\t-1\t0\tr\tx\t-0.5\n";
        assert!(PhyloTree::read_node_table(Cursor::new(bad_anno), "t").is_err());
    }

    #[test]
    fn anno_dist_is_validated() {
        let mut tree = sample_tree();
        tree.set_anno_dist(3, 0.02).unwrap();
        assert_eq!(tree.get_node(3).unwrap().anno_dist, 0.02);
        assert!(tree.set_anno_dist(3, f64::NAN).is_err());
        assert!(matches!(tree.set_anno_dist(99, 0.1), Err(OtuError::Lookup(99))));
    }

    #[test]
    fn rejects_bad_node_tables() {
        let missing_sites = "0\t-1\t0\troot\tAll\n";
        assert!(PhyloTree::read_node_table(Cursor::new(missing_sites), "t").is_err());

        let gap_in_ids = "sites\t4\n0\t-1\t0\tr\tx\n2\t0\t1\tl\ty\n";
        assert!(PhyloTree::read_node_table(Cursor::new(gap_in_ids), "t").is_err());

        let bad_length = "sites\t4\n0\t-1\t0\tr\tx\n1\t0\tNaN\tl\ty\n";
        assert!(PhyloTree::read_node_table(Cursor::new(bad_length), "t").is_err());

        let two_roots = "sites\t4\n0\t-1\t0\tr\tx\n1\t-1\t0\tl\ty\n";
        assert!(PhyloTree::read_node_table(Cursor::new(two_roots), "t").is_err());

        let cycle = "sites\t4\n0\t-1\t0\tr\tx\n1\t2\t1\ta\ty\n2\t1\t1\tb\tz\n";
        assert!(PhyloTree::read_node_table(Cursor::new(cycle), "t").is_err());
    }

    #[test]
    fn parses_format_names() {
        assert_eq!("Newick".parse::<TreeFormat>().unwrap(), TreeFormat::Newick);
        assert!("nexus".parse::<TreeFormat>().is_err());
    }
}
