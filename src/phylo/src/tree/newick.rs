//! Newick rendering of the arena tree.
//!
//! Binary mode emits a strictly bifurcating tree, expanding the
//! less-informative names of a leaf into a cascade of zero-length
//! siblings. Multifurcating mode emits them as siblings directly and
//! collapses zero-length internal branches into polytomies.

use super::{NodeIndex, Tree};

impl Tree {
    /// Render the tree as a Newick string, terminated by `;`.
    #[must_use]
    pub fn to_newick(&self, binary: bool, with_support: bool) -> String {
        let mut out = String::with_capacity(self.num_nodes() * 16);
        self.write_node(self.root(), binary, with_support, true, &mut out);
        out.push(';');
        out
    }

    fn write_node(&self, idx: NodeIndex, binary: bool, with_support: bool, is_root: bool, out: &mut String) {
        let node = self.node(idx);
        match node.children() {
            None => out.push_str(&leaf_string(
                node.name().expect("leaves are named"),
                &node.less_info_seqs,
                node.blength(),
                binary,
            )),
            Some(children) => {
                out.push('(');
                let mut first = true;
                for child in self.flattened_children(children, binary) {
                    if !first {
                        out.push(',');
                    }
                    first = false;
                    self.write_node(child, binary, with_support, false, out);
                }
                out.push(')');
                if with_support {
                    if let Some(support) = node.support {
                        out.push_str(&format!("{support:.4}"));
                    }
                }
                if !is_root {
                    out.push(':');
                    out.push_str(&blength_string(node.blength()));
                }
            }
        }
    }

    /// In multifurcating mode, children joined by a zero-length internal
    /// branch surface at the same level.
    fn flattened_children(&self, children: [NodeIndex; 2], binary: bool) -> Vec<NodeIndex> {
        let mut flat = Vec::with_capacity(2);
        let mut stack: Vec<NodeIndex> = children.into_iter().rev().collect();
        while let Some(idx) = stack.pop() {
            let node = self.node(idx);
            if !binary && !node.is_leaf() && node.blength() <= 0.0 {
                let [left, right] = node.children().expect("internal node");
                stack.push(right);
                stack.push(left);
            } else {
                flat.push(idx);
            }
        }
        flat
    }
}

fn blength_string(blength: f64) -> String {
    if blength < 0.0 {
        "0".to_string()
    } else {
        format!("{blength}")
    }
}

fn leaf_string(name: &str, less_info_seqs: &[String], blength: f64, binary: bool) -> String {
    let length = blength_string(blength);
    if less_info_seqs.is_empty() {
        return format!("{name}:{length}");
    }
    // Minor sequences attach with zero branch lengths: a binary cascade or
    // one multifurcation.
    let mut out = format!("({name}:0");
    if binary {
        let mut closing = String::new();
        for minor in &less_info_seqs[..less_info_seqs.len() - 1] {
            out.push_str(&format!(",({minor}:0"));
            closing.push_str("):0");
        }
        out.push_str(&format!(",{}:0{closing}", less_info_seqs[less_info_seqs.len() - 1]));
    } else {
        for minor in less_info_seqs {
            out.push_str(&format!(",{minor}:0"));
        }
    }
    out.push_str(&format!("):{length}"));
    out
}
