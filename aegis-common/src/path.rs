use crate::policy::{lookup_path_action, Action, PolicyStore, Separators};
use crate::{PathKey, MAX_PATH_DEPTH, NAME_MAX, PATH_MAX_LEN};

/// One level of a dentry-like hierarchy. The root is its own parent.
pub trait PathNode: Copy + PartialEq {
    /// Returns the full length of this node's name, copying it into `dst`
    /// only when it fits. `None` when the name cannot be read.
    fn read_name(&self, dst: &mut [u8]) -> Option<usize>;

    fn parent(&self) -> Option<Self>;
}

/// Per-CPU working storage for path assembly and lookup.
#[repr(C)]
pub struct PathScratch {
    pub path: PathKey,
    pub path_len: usize,
    pub key: PathKey,
    pub separators: Separators,
    names: [[u8; NAME_MAX]; MAX_PATH_DEPTH],
    name_lens: [u8; MAX_PATH_DEPTH],
}

impl PathScratch {
    pub const fn new() -> Self {
        Self {
            path: [0; PATH_MAX_LEN],
            path_len: 0,
            key: [0; PATH_MAX_LEN],
            separators: Separators::new(),
            names: [[0; NAME_MAX]; MAX_PATH_DEPTH],
            name_lens: [0; MAX_PATH_DEPTH],
        }
    }

    /// Clears everything a walk depends on. Name records are overwritten
    /// before they are read, so they are left alone.
    pub fn reset(&mut self) {
        self.path.fill(0);
        self.key.fill(0);
        self.path_len = 0;
        self.separators.clear();
    }

    pub fn path(&self) -> &[u8] {
        &self.path[..self.path_len]
    }

    /// Walks `leaf` towards the root and rebuilds its forward path into
    /// `self.path`. Levels whose name is empty, unreadable or too long are
    /// skipped. Returns the number of levels recorded.
    pub fn assemble<N: PathNode>(&mut self, leaf: N) -> usize {
        self.reset();

        let mut node = leaf;
        let mut depth = 0;
        for _ in 0..MAX_PATH_DEPTH {
            let parent = node.parent();
            if parent == Some(node) {
                break;
            }
            // A node whose parent cannot be read still contributes its name.
            if let Some(len) = node.read_name(&mut self.names[depth]) {
                if len > 0 && len < NAME_MAX {
                    self.name_lens[depth] = len as u8;
                    depth += 1;
                }
            }
            match parent {
                Some(p) => node = p,
                None => break,
            }
        }

        let mut pos = 0usize;
        for level in (0..depth).rev() {
            if pos >= PATH_MAX_LEN - 1 {
                break;
            }
            self.separators.push(pos);
            self.path[pos] = b'/';
            pos += 1;

            let len = self.name_lens[level] as usize;
            for i in 0..NAME_MAX {
                if i >= len || pos >= PATH_MAX_LEN - 1 {
                    break;
                }
                self.path[pos] = self.names[level][i];
                pos += 1;
            }
        }
        self.path_len = pos;
        depth
    }

    /// Looks up the assembled path.
    pub fn lookup<P: PolicyStore>(&mut self, policy: &P) -> Option<Action> {
        lookup_path_action(policy, &self.path, self.path_len, &self.separators, &mut self.key)
    }
}

impl Default for PathScratch {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves `node`'s path into `scratch` and returns its policy action. An
/// absent node leaves an empty path and matches nothing.
pub fn resolve<N: PathNode, P: PolicyStore>(
    node: Option<N>,
    policy: &P,
    scratch: &mut PathScratch,
) -> Option<Action> {
    match node {
        Some(node) => {
            scratch.assemble(node);
            scratch.lookup(policy)
        }
        None => {
            scratch.reset();
            None
        }
    }
}
