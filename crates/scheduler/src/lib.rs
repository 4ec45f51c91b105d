pub mod gang;
pub mod predicate;
pub mod queue;
pub mod reclaim;
pub mod session;
pub mod statement;

#[cfg(test)]
pub(crate) mod tests_common;

/// A scheduling action driven once per cycle by the surrounding
/// scheduler framework.
pub trait Action {
    /// Name of the action, also its key in the action-configuration map.
    fn name(&self) -> &str;

    fn initialize(&mut self) {}

    /// Run the action against one session snapshot.
    fn execute(&mut self, ssn: &mut session::Session);

    fn un_initialize(&mut self) {}
}

pub use predicate::{PredicateCache, PredicateHelper};
pub use queue::PriorityQueue;
pub use reclaim::ReclaimAction;
pub use session::Session;
pub use statement::{save_operations, OperationSnapshot, Statement};
