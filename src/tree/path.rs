//! Root-to-leaf walks.
//!
//! A [`TreePath`] records the block number of every node visited on the way
//! from the owner root down to a leaf, root first. It deliberately stores no
//! views: every algorithm re-derives a [`ListRef`](crate::ondisk::ListRef)
//! or [`ListMut`](crate::ondisk::ListMut) from the store at the moment it
//! touches a node, so a path stays valid across arbitrary tree surgery.

use smallvec::SmallVec;

use crate::config::{EXTENT_BLOCK_HEADER_SIZE, MAX_TREE_DEPTH};
use crate::error::{Error, Result};
use crate::store::BlockStore;

use super::tree::ExtentTree;

/// One visited node. The list offset differs between the owner root (list
/// follows the owner header) and extent blocks (fixed header size).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PathNode {
    pub blkno: u64,
    pub list_off: usize,
}

/// Bounded stack of visited nodes, root at level 0, leaf at the end.
#[derive(Debug, Clone)]
pub(crate) struct TreePath {
    nodes: SmallVec<[PathNode; MAX_TREE_DEPTH + 1]>,
}

impl TreePath {
    pub fn with_root(blkno: u64, list_off: usize) -> Self {
        let mut nodes = SmallVec::new();
        nodes.push(PathNode { blkno, list_off });
        Self { nodes }
    }

    /// Append the next level of the walk. Every non-root node is an extent
    /// block, so the list offset is fixed.
    pub fn push(&mut self, blkno: u64) -> Result<()> {
        if self.nodes.len() > MAX_TREE_DEPTH {
            return Err(Error::invariant(format!(
                "tree path exceeds maximum depth {}",
                MAX_TREE_DEPTH
            )));
        }
        self.nodes.push(PathNode {
            blkno,
            list_off: EXTENT_BLOCK_HEADER_SIZE,
        });
        Ok(())
    }

    pub fn num_levels(&self) -> usize {
        self.nodes.len()
    }

    /// Level index of the leaf; equal to the tree depth the path was walked
    /// against.
    pub fn leaf_level(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn node(&self, level: usize) -> PathNode {
        self.nodes[level]
    }

    pub fn root(&self) -> PathNode {
        self.nodes[0]
    }

    pub fn leaf(&self) -> PathNode {
        self.nodes[self.nodes.len() - 1]
    }
}

/// Level of the lowest node the two paths share. The list at that level
/// holds two adjacent records naming the paths' respective children.
pub(crate) fn find_subtree_root(left: &TreePath, right: &TreePath) -> Result<usize> {
    if left.root().blkno != right.root().blkno {
        return Err(Error::invariant("paths disagree on the tree root"));
    }
    let mut level = 0;
    loop {
        level += 1;
        if level >= left.num_levels() || level >= right.num_levels() {
            return Err(Error::invariant(
                "adjacent tree paths never diverge below the root",
            ));
        }
        if left.node(level).blkno != right.node(level).blkno {
            return Ok(level - 1);
        }
    }
}

impl<S: BlockStore> ExtentTree<'_, S> {
    /// Walk from the root to the leaf whose range holds `cpos`.
    ///
    /// A cpos past the tree's right edge falls through to the rightmost
    /// leaf at every level; the append and rotation entry points rely on
    /// that to reach the tree's right spine with `u32::MAX`.
    pub(crate) fn path_to(&self, cpos: u32) -> Result<TreePath> {
        let mut path = TreePath::with_root(self.root_blkno, self.ops.format().list_offset());
        loop {
            let node = path.leaf();
            let (depth, child) = {
                let list = self.list_at(node)?;
                let depth = list.tree_depth();
                if depth == 0 {
                    break;
                }
                let used = list.next_free() as usize;
                if used == 0 {
                    return Err(Error::corrupt(
                        node.blkno,
                        format!("interior node at depth {} has no records", depth),
                    ));
                }
                let mut idx = used - 1;
                for i in 0..used - 1 {
                    let rec = list.interior_rec(i)?;
                    if cpos >= rec.cpos && cpos < rec.end() {
                        idx = i;
                        break;
                    }
                }
                (depth, list.rec_blkno(idx)?)
            };
            if child == 0 {
                return Err(Error::corrupt(
                    node.blkno,
                    format!("zero child pointer at depth {}", depth),
                ));
            }
            path.push(child)?;
            let child_depth = self.list_at(path.leaf())?.tree_depth();
            if child_depth != depth - 1 {
                return Err(Error::corrupt(
                    child,
                    format!("depth tag {} under a depth {} parent", child_depth, depth),
                ));
            }
        }
        Ok(path)
    }

    /// Path down the tree's right spine.
    pub(crate) fn rightmost_path(&self) -> Result<TreePath> {
        self.path_to(u32::MAX)
    }

    /// Cluster offset of the last cluster covered by the leaf immediately
    /// left of `path`'s leaf, or `None` when the path is already leftmost.
    ///
    /// Walking a path to the returned offset lands in that left leaf.
    pub(crate) fn find_cpos_for_left_leaf(&self, path: &TreePath) -> Result<Option<u32>> {
        let mut child_blkno = path.leaf().blkno;
        for level in (0..path.leaf_level()).rev() {
            let node = path.node(level);
            let list = self.list_at(node)?;
            let j = self.index_of_child(node, child_blkno)?;
            if j > 0 {
                let end = list.rec_end(j - 1)?;
                if end == 0 {
                    return Err(Error::corrupt(node.blkno, "zero-length interior record"));
                }
                return Ok(Some(end - 1));
            }
            child_blkno = node.blkno;
        }
        Ok(None)
    }

    /// Cluster offset where the leaf immediately right of `path`'s leaf
    /// begins, or `None` when the path is already rightmost.
    pub(crate) fn find_cpos_for_right_leaf(&self, path: &TreePath) -> Result<Option<u32>> {
        let mut child_blkno = path.leaf().blkno;
        for level in (0..path.leaf_level()).rev() {
            let node = path.node(level);
            let list = self.list_at(node)?;
            let j = self.index_of_child(node, child_blkno)?;
            if j + 1 < list.next_free() as usize {
                return Ok(Some(list.rec_cpos(j + 1)?));
            }
            child_blkno = node.blkno;
        }
        Ok(None)
    }

    /// Index of the record in `node`'s list that points at `child_blkno`.
    pub(crate) fn index_of_child(&self, node: PathNode, child_blkno: u64) -> Result<usize> {
        let list = self.list_at(node)?;
        for j in 0..list.next_free() as usize {
            if list.rec_blkno(j)? == child_blkno {
                return Ok(j);
            }
        }
        Err(Error::corrupt(
            node.blkno,
            format!("child block {} missing from parent records", child_blkno),
        ))
    }
}
