//! Allow/deny list evaluation.
//!
//! Precedence: an address on the deny list is always rejected; when the
//! allow list is non-empty only listed addresses pass; with both lists
//! empty everyone passes.

use std::collections::HashSet;
use waypost_types::{Address, InitPermissions};

/// Outcome of a permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Address may proceed.
    Allowed,
    /// Address is rejected.
    Denied,
}

impl Verdict {
    /// True for [`Verdict::Allowed`].
    pub fn is_allowed(self) -> bool {
        matches!(self, Verdict::Allowed)
    }
}

/// A pair of allow and deny lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionFilter {
    allow: HashSet<Address>,
    deny: HashSet<Address>,
}

impl PermissionFilter {
    /// Build a filter from explicit lists.
    pub fn new(
        allow: impl IntoIterator<Item = Address>,
        deny: impl IntoIterator<Item = Address>,
    ) -> Self {
        Self {
            allow: allow.into_iter().collect(),
            deny: deny.into_iter().collect(),
        }
    }

    /// A filter that lets every address through.
    pub fn open() -> Self {
        Self::default()
    }

    /// True when neither list has entries.
    pub fn is_open(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty()
    }

    /// Evaluate `address` against the lists.
    pub fn check(&self, address: &Address) -> Verdict {
        if self.deny.contains(address) {
            return Verdict::Denied;
        }
        if !self.allow.is_empty() && !self.allow.contains(address) {
            return Verdict::Denied;
        }
        Verdict::Allowed
    }
}

impl From<InitPermissions> for PermissionFilter {
    fn from(perms: InitPermissions) -> Self {
        Self::new(perms.allow, perms.deny)
    }
}
