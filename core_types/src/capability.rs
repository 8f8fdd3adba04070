//! Capability spaces
//!
//! Every protection domain owns one [`CapSpace`]: a table from [`LocalName`]
//! to the [`ObjectIdentity`] of a kernel object. User code only ever holds
//! local names. Identities are resolved by the substrate that carries a
//! message, never by the sender.
//!
//! ## Design Principles
//!
//! 1. **Unforgeable**: a local name means nothing outside its own space
//! 2. **Deduplicated**: importing an identity a space already holds yields
//!    the existing local name
//! 3. **Transferable**: capabilities move between spaces only through
//!    [`CapSpace::import`], which the message substrate calls on delivery
//!
//! ## Example
//!
//! ```
//! use core_types::{CapSpace, ObjectIdentity};
//!
//! let object = ObjectIdentity::new();
//! let mut space = CapSpace::new();
//! let cap = space.insert(object);
//! assert_eq!(space.lookup(cap.local_name()).unwrap(), object);
//! ```

use crate::ids::{LocalName, ObjectIdentity};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// A capability as seen by its holder
///
/// The identity is what the kernel compares; the local name is what the
/// holder uses to refer to it. The invalid capability carries no identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CapRef {
    identity: Option<ObjectIdentity>,
    local_name: LocalName,
}

impl CapRef {
    pub(crate) fn new(identity: ObjectIdentity, local_name: LocalName) -> Self {
        Self {
            identity: Some(identity),
            local_name,
        }
    }

    /// The capability that names nothing
    pub const fn invalid() -> Self {
        Self {
            identity: None,
            local_name: LocalName::INVALID,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.identity.is_some()
    }

    pub fn identity(&self) -> Option<ObjectIdentity> {
        self.identity
    }

    pub fn local_name(&self) -> LocalName {
        self.local_name
    }
}

impl Default for CapRef {
    fn default() -> Self {
        Self::invalid()
    }
}

impl fmt::Display for CapRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.identity {
            Some(identity) => write!(f, "Cap({} -> {})", self.local_name, identity),
            None => write!(f, "Cap(invalid)"),
        }
    }
}

/// Capability errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    /// The local name is not bound in this space
    #[error("Unknown capability name {0}")]
    UnknownName(LocalName),

    /// The capability names nothing
    #[error("Invalid capability")]
    Invalid,
}

/// Capability table of one protection domain
#[derive(Debug, Default)]
pub struct CapSpace {
    names: HashMap<LocalName, ObjectIdentity>,
    by_identity: HashMap<ObjectIdentity, LocalName>,
    /// Imports keyed by (sender identity, sender-local name)
    imports: HashMap<(ObjectIdentity, LocalName), LocalName>,
    next_name: u64,
}

impl CapSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `identity` in this space, reusing an existing binding
    pub fn insert(&mut self, identity: ObjectIdentity) -> CapRef {
        if let Some(&name) = self.by_identity.get(&identity) {
            return CapRef::new(identity, name);
        }
        let name = LocalName(self.next_name);
        self.next_name += 1;
        self.names.insert(name, identity);
        self.by_identity.insert(identity, name);
        CapRef::new(identity, name)
    }

    /// Resolves a local name to the identity it designates
    pub fn lookup(&self, name: LocalName) -> Result<ObjectIdentity, CapabilityError> {
        if !name.is_valid() {
            return Err(CapabilityError::Invalid);
        }
        self.names
            .get(&name)
            .copied()
            .ok_or(CapabilityError::UnknownName(name))
    }

    /// Returns the full capability for a local name
    pub fn cap_ref(&self, name: LocalName) -> Result<CapRef, CapabilityError> {
        self.lookup(name).map(|identity| CapRef::new(identity, name))
    }

    /// Returns the local name bound to `identity`, if any
    pub fn name_of(&self, identity: ObjectIdentity) -> Option<LocalName> {
        self.by_identity.get(&identity).copied()
    }

    /// Imports a capability that arrived in a message
    ///
    /// `sender` and `sender_name` identify the capability as the sender knew
    /// it. Repeated imports of the same capability, or of any capability
    /// designating an identity already held, resolve to one local name.
    pub fn import(
        &mut self,
        sender: ObjectIdentity,
        sender_name: LocalName,
        identity: ObjectIdentity,
    ) -> CapRef {
        if let Some(&name) = self.imports.get(&(sender, sender_name)) {
            if self.names.get(&name) == Some(&identity) {
                return CapRef::new(identity, name);
            }
        }
        let cap = self.insert(identity);
        self.imports.insert((sender, sender_name), cap.local_name());
        cap
    }

    /// Unbinds a local name
    pub fn remove(&mut self, name: LocalName) -> Result<ObjectIdentity, CapabilityError> {
        let identity = self
            .names
            .remove(&name)
            .ok_or(CapabilityError::UnknownName(name))?;
        self.by_identity.remove(&identity);
        self.imports.retain(|_, imported| *imported != name);
        Ok(identity)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
