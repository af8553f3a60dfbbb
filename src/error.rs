use thiserror::Error;

/// Errors reported by the stacks and the hazard pointer [`Registry`](crate::Registry).
///
/// Memory-safety violations (double frees, use-after-free) are not represented here: the
/// reclamation protocols rule them out, and any occurrence is a bug in this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum Error {
    /// The allocator could not provide memory for a new node. The stack was not modified.
    #[error("memory allocation for a stack node failed")]
    AllocationFailure,

    /// Every slot of the hazard pointer registry is owned by some other thread.
    ///
    /// Nothing is retried on the caller's behalf; either fewer threads must use the registry
    /// concurrently, or the registry must be built with a larger capacity.
    #[error("all {capacity} hazard pointer slots are in use")]
    ReclamationCapacityExceeded { capacity: usize },
}

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn messages_name_the_condition() {
        assert_eq!(
            Error::ReclamationCapacityExceeded { capacity: 3 }.to_string(),
            "all 3 hazard pointer slots are in use"
        );
        assert!(Error::AllocationFailure.to_string().contains("allocation"));
    }
}
