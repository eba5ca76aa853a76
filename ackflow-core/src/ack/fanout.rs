use tracing::trace;

use crate::ack::{Obligation, ObligationShare};
use crate::error::Result;
use crate::event::ComponentKey;

/// Splits the obligation of one event across its destinations. One share per destination is
/// issued in a single step, so the parent token never looks complete halfway through a fan-out.
/// The same split is used at the sink boundary and inside `Fanning` transforms.
#[derive(Debug, Clone)]
pub struct FanoutTracker {
    component: ComponentKey,
}

impl FanoutTracker {
    pub fn new(component: impl Into<ComponentKey>) -> Self {
        Self {
            component: component.into(),
        }
    }

    pub fn component(&self) -> &ComponentKey {
        &self.component
    }

    /// Returns one obligation per destination, in the same order. With no destinations the
    /// obligation is discharged on the spot, there is nothing left to wait for.
    ///
    /// Fails with [crate::Error::TokenAlreadyTerminal] only when handed a root token that is
    /// already terminal.
    pub fn fan_out(
        &self,
        obligation: Obligation,
        destinations: &[ComponentKey],
    ) -> Result<Vec<Obligation>> {
        let shares: Vec<ObligationShare> = match obligation {
            Obligation::Untracked => {
                return Ok(destinations.iter().map(|_| Obligation::Untracked).collect());
            }
            Obligation::Root(token) => {
                if destinations.is_empty() {
                    trace!(component = %self.component, token = ?token.id(), "No destinations, resolving token");
                    token.resolve_unshared();
                    return Ok(Vec::new());
                }
                token.add_shares(destinations)?
            }
            Obligation::Share(share) => share.split(destinations),
        };
        Ok(shares.into_iter().map(Obligation::Share).collect())
    }
}
