//! Provisioning gate (spec.md §4.7): the one externally-observable
//! interface this crate owns outright rather than delegating to a
//! collaborator. A handle opened on the provisioning device node grants
//! its bearer the right to set a privileged enclave attribute; this
//! module only checks that a handle actually refers to that node and,
//! if so, ORs the privileged bit in.

bitflags::bitflags! {
    /// Enclave attribute bits this gate can unlock. Only `PROVISION_KEY`
    /// is privileged; the rest of the attribute space is out of this
    /// crate's scope (enclave lifecycle, spec.md §1).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EnclAttributes: u64 {
        const PROVISION_KEY = 1 << 4;
    }
}

/// A capability handle: the provisioning device node only ever hands
/// out handles carrying this marker, so `authorize` can check
/// "does this handle actually come from opening that node" without
/// this crate needing to model a filesystem or device-node table
/// itself (spec.md §1: device files are out of scope).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisionHandle {
    opened_for_provisioning: bool,
}

impl ProvisionHandle {
    /// Construct the handle the provisioning device node's `open`
    /// implementation would return. Everything else in this crate only
    /// ever sees `ProvisionHandle` values produced here or rejected by
    /// [`authorize`].
    pub fn new() -> Self {
        Self {
            opened_for_provisioning: true,
        }
    }

    /// A handle that does *not* grant provisioning rights, for callers
    /// holding some other, unrelated file descriptor.
    pub fn unprivileged() -> Self {
        Self {
            opened_for_provisioning: false,
        }
    }
}

impl Default for ProvisionHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate `handle` and, if it grants provisioning rights, OR
/// `PROVISION_KEY` into `attrs`. Returns whether the attribute was
/// granted.
pub fn authorize(handle: &ProvisionHandle, attrs: &mut EnclAttributes) -> bool {
    if !handle.opened_for_provisioning {
        return false;
    }
    *attrs |= EnclAttributes::PROVISION_KEY;
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn privileged_handle_grants_provision_key() {
        let handle = ProvisionHandle::new();
        let mut attrs = EnclAttributes::empty();
        assert!(authorize(&handle, &mut attrs));
        assert!(attrs.contains(EnclAttributes::PROVISION_KEY));
    }

    #[test]
    fn unprivileged_handle_is_rejected() {
        let handle = ProvisionHandle::unprivileged();
        let mut attrs = EnclAttributes::empty();
        assert!(!authorize(&handle, &mut attrs));
        assert!(attrs.is_empty());
    }
}
