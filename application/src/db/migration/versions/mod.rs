use super::Migration;

mod initial_version;

/// Every shipped revision. Order does not matter, the chain is rebuilt from down revisions.
pub(super) fn all() -> Vec<Box<dyn Migration>> {
    vec![Box::new(initial_version::InitialVersion)]
}
