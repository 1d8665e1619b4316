use super::node::RangeNode;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionError {
    ZeroChunkSize,
    EmptyRange { start: u64, end: u64 },
    BranchNarrowerThanChunk { branch_width: u64, max_chunk_size: u64 },
}

impl fmt::Display for PartitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionError::ZeroChunkSize => write!(f, "max_chunk_size must be greater than 0"),
            PartitionError::EmptyRange { start, end } => {
                write!(f, "range [{start}, {end}) is empty")
            }
            PartitionError::BranchNarrowerThanChunk {
                branch_width,
                max_chunk_size,
            } => write!(
                f,
                "branch width {branch_width} is narrower than max_chunk_size {max_chunk_size}"
            ),
        }
    }
}

impl std::error::Error for PartitionError {}

/// Splits a root interval into a deterministic tree of bounded-width leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangePartitioner {
    max_chunk_size: u64,
    branch_width: u64,
}

impl RangePartitioner {
    pub fn new(max_chunk_size: u64) -> Result<Self, PartitionError> {
        if max_chunk_size == 0 {
            return Err(PartitionError::ZeroChunkSize);
        }
        Ok(Self {
            max_chunk_size,
            branch_width: max_chunk_size,
        })
    }

    /// Makes the first tree level step by `branch_width`; each oversized child
    /// is then split again into `max_chunk_size` leaves.
    pub fn with_branch_width(mut self, branch_width: u64) -> Result<Self, PartitionError> {
        if branch_width < self.max_chunk_size {
            return Err(PartitionError::BranchNarrowerThanChunk {
                branch_width,
                max_chunk_size: self.max_chunk_size,
            });
        }
        self.branch_width = branch_width;
        Ok(self)
    }

    pub fn max_chunk_size(&self) -> u64 {
        self.max_chunk_size
    }

    pub fn branch_width(&self) -> u64 {
        self.branch_width
    }

    /// Returns every descendant of `root` in pre-order. The root itself is not
    /// included; callers persist it alongside the result.
    pub fn partition(&self, root: &RangeNode) -> Result<Vec<RangeNode>, PartitionError> {
        if root.end() <= root.start() {
            return Err(PartitionError::EmptyRange {
                start: root.start(),
                end: root.end(),
            });
        }

        // A first-level step spanning the whole root would repeat the root's
        // coordinates on an internal child.
        let step = if root.width() <= self.branch_width {
            self.max_chunk_size
        } else {
            self.branch_width
        };

        let mut nodes = Vec::new();
        self.split(root, step, &mut nodes);
        Ok(nodes)
    }

    fn split(&self, parent: &RangeNode, step: u64, out: &mut Vec<RangeNode>) {
        let mut cursor = parent.start();
        while cursor < parent.end() {
            let end = cursor.saturating_add(step).min(parent.end());
            let is_leaf = end - cursor <= self.max_chunk_size;
            let child = RangeNode::child(parent, cursor, end, is_leaf);
            if is_leaf {
                out.push(child);
            } else {
                out.push(child.clone());
                self.split(&child, self.max_chunk_size, out);
            }
            cursor = end;
        }
    }
}
