use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{PathKey, MAX_PATH_DEPTH, PATH_MAX_LEN};

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, IntoPrimitive, TryFromPrimitive, derive_more::Display)]
pub enum Action {
    /// Allow, but audit.
    #[display("monitor")]
    Monitor = 1,
    /// Deny and audit.
    #[display("block")]
    Block = 2,
}

impl Action {
    /// Decodes a stored map value. Unknown values count as no entry.
    pub fn from_raw(raw: u8) -> Option<Self> {
        Self::try_from_primitive(raw).ok()
    }
}

/// The externally populated policy tables. Lookups are read-only.
pub trait PolicyStore {
    fn path_action(&self, key: &PathKey) -> Option<Action>;
    fn port_action(&self, port: u16) -> Option<Action>;
    /// Processes whose file opens and connects are never checked, such as
    /// the loader draining events.
    fn is_exempt(&self, tgid: u32) -> bool;
}

/// Separator offsets recorded while a path was assembled.
#[derive(Clone, Copy)]
pub struct Separators {
    pub offsets: [u16; MAX_PATH_DEPTH],
    pub count: usize,
}

impl Separators {
    pub const fn new() -> Self {
        Self {
            offsets: [0; MAX_PATH_DEPTH],
            count: 0,
        }
    }

    pub fn clear(&mut self) {
        self.count = 0;
    }

    pub fn push(&mut self, offset: usize) {
        if self.count < MAX_PATH_DEPTH {
            self.offsets[self.count] = offset as u16;
            self.count += 1;
        }
    }

    fn last(&self) -> Option<usize> {
        match self.count {
            0 => None,
            n => Some(self.offsets[n - 1] as usize),
        }
    }
}

impl Default for Separators {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves the action for `path[..len]`: exact path, then enclosing
/// directories nearest first (`/a/b/` before `/a/` before `/`), then basename.
///
/// `key` is scratch space for the derived keys.
pub fn lookup_path_action<P: PolicyStore>(
    policy: &P,
    path: &PathKey,
    len: usize,
    separators: &Separators,
    key: &mut PathKey,
) -> Option<Action> {
    if len == 0 || len >= PATH_MAX_LEN {
        return None;
    }
    if let Some(action) = policy.path_action(path) {
        return Some(action);
    }

    let count = if separators.count > MAX_PATH_DEPTH {
        MAX_PATH_DEPTH
    } else {
        separators.count
    };
    for i in (0..count).rev() {
        let end = separators.offsets[i] as usize + 1;
        if end >= len {
            continue;
        }
        fill_key(key, path, 0, end);
        if let Some(action) = policy.path_action(key) {
            return Some(action);
        }
    }

    let start = separators.last().map_or(0, |sep| sep + 1);
    if start < len {
        fill_key(key, path, start, len);
        return policy.path_action(key);
    }
    None
}

/// Copies `src[start..end]` to the front of `key` and zero-pads the rest.
pub fn fill_key(key: &mut PathKey, src: &PathKey, start: usize, end: usize) {
    let n = end.saturating_sub(start);
    for i in 0..PATH_MAX_LEN {
        let from = start + i;
        key[i] = if i < n && from < PATH_MAX_LEN { src[from] } else { 0 };
    }
}

/// Encodes a policy key, or `None` when it is empty or does not fit with
/// its terminating NUL.
pub fn encode_path_key(raw: &[u8]) -> Option<PathKey> {
    if raw.is_empty() || raw.len() >= PATH_MAX_LEN || raw.contains(&0) {
        return None;
    }
    let mut key = [0u8; PATH_MAX_LEN];
    key[..raw.len()].copy_from_slice(raw);
    Some(key)
}
