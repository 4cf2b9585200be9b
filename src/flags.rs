use crate::error::{AllocError, Result};

bitflags::bitflags! {
    /// Options that steer how a collection may satisfy an allocation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AllocationFlags: u32 {
        /// Create a new heap solely for this request.
        const DEDICATED_COLLECTION = 1 << 0;
        /// Only use heaps that already exist, never grow the collection.
        const EXISTING_COLLECTION = 1 << 1;
        /// Fail instead of growing past the estimated memory budget.
        const WITHIN_BUDGET = 1 << 2;
    }
}

impl AllocationFlags {
    /// Rejects flag combinations that contradict each other.
    pub fn validate(self) -> Result<()> {
        if self.contains(Self::DEDICATED_COLLECTION | Self::EXISTING_COLLECTION) {
            return Err(AllocError::invalid(
                "dedicated and existing collection flags are mutually exclusive",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedicated_and_existing_are_exclusive() {
        let flags = AllocationFlags::DEDICATED_COLLECTION | AllocationFlags::EXISTING_COLLECTION;
        assert!(matches!(
            flags.validate(),
            Err(AllocError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn other_combinations_are_accepted() {
        assert!(AllocationFlags::empty().validate().is_ok());
        assert!(
            (AllocationFlags::DEDICATED_COLLECTION | AllocationFlags::WITHIN_BUDGET)
                .validate()
                .is_ok()
        );
        assert!(
            (AllocationFlags::EXISTING_COLLECTION | AllocationFlags::WITHIN_BUDGET)
                .validate()
                .is_ok()
        );
    }
}
