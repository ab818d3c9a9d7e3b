//! Scoped acquisition of the network role.

use crate::mock::MockNetwork;
use std::ops::Deref;

/// RAII guard for the network role.
///
/// Acquires the role on construction (blocking until the executor side is
/// quiesced) and releases it on drop, unless
/// [`dismiss`](InNetworkGuard::dismiss) was called — a dismissed guard
/// leaves the role held, and the caller releases it with
/// [`MockNetwork::exit_network`].
///
/// Dereferences to the interface, so driver calls go straight through the
/// guard.
pub struct InNetworkGuard<'a> {
    net: &'a MockNetwork,
    active: bool,
}

impl<'a> InNetworkGuard<'a> {
    pub(crate) fn new(net: &'a MockNetwork) -> Self {
        net.enter_network();
        Self { net, active: true }
    }

    /// Consumes the guard without releasing the network role.
    pub fn dismiss(mut self) {
        self.active = false;
    }
}

impl Deref for InNetworkGuard<'_> {
    type Target = MockNetwork;

    fn deref(&self) -> &MockNetwork {
        self.net
    }
}

impl Drop for InNetworkGuard<'_> {
    fn drop(&mut self) {
        if self.active {
            self.net.exit_network();
        }
    }
}
