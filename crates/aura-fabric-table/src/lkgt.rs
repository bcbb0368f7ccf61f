//! Last Known Good Time: a monotone floor on "current time" (spec §4.6).

use crate::error::{FabricTableError, Result};
use crate::storage::{FabricStorage, LKGT_KEY};

/// Tracks the persisted lower bound on wall-clock time used to validate
/// certificate time windows when no real clock is available.
///
/// Held inside the table instance (spec §9 "Global mutable state" note), not
/// as process-wide static state.
#[derive(Debug, Clone, Copy)]
pub struct LastKnownGoodTime {
    current: u32,
    /// Snapshot taken when a pending operation started, restored on Revert.
    committed: u32,
}

impl LastKnownGoodTime {
    /// Initialize from persisted storage (or `None` if never set) and the
    /// firmware build time: `LKGT = max(persisted, firmware_build)`.
    pub async fn load(
        storage: &dyn FabricStorage,
        firmware_build_epoch_s: u32,
    ) -> Result<Self> {
        let persisted = match storage.read(LKGT_KEY).await? {
            Some(bytes) => Self::decode(&bytes)?,
            None => 0,
        };
        let current = persisted.max(firmware_build_epoch_s);
        Ok(Self {
            current,
            committed: current,
        })
    }

    /// Persist the current value.
    pub async fn save(&self, storage: &dyn FabricStorage) -> Result<()> {
        storage.write(LKGT_KEY, self.current.to_be_bytes().to_vec()).await
    }

    /// Current floor value.
    pub fn get(&self) -> u32 {
        self.current
    }

    /// Advance the floor to `max(current, candidate)`. Used internally by
    /// Commit when a newly committed certificate's NotBefore exceeds LKGT.
    pub fn advance(&mut self, candidate: u32) {
        if candidate > self.current {
            self.current = candidate;
        }
    }

    /// `SetLastKnownGoodChipEpochTime`: accept `t` iff it does not move the
    /// floor backwards and is consistent with firmware build time and every
    /// committed certificate's NotBefore (the latter two are enforced by the
    /// caller, since this type has no certificate access; see
    /// [`crate::table::FabricTable::set_last_known_good_time`]).
    pub fn try_set(&mut self, t: u32) -> Result<()> {
        if t < self.current {
            return Err(FabricTableError::invalid_argument(format!(
                "proposed time {t} precedes last known good time {}",
                self.current
            )));
        }
        self.current = t;
        Ok(())
    }

    /// Undo any advance staged during a pending operation (Revert, spec P3).
    pub fn revert(&mut self) {
        self.current = self.committed;
    }

    /// Accept the currently staged value as committed (Commit).
    pub fn commit(&mut self) {
        self.committed = self.current;
    }

    fn decode(bytes: &[u8]) -> Result<u32> {
        let arr: [u8; 4] = bytes
            .try_into()
            .map_err(|_| FabricTableError::storage_failure("corrupt LastKnownGoodTime record"))?;
        Ok(u32::from_be_bytes(arr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MemoryStorage;

    #[tokio::test]
    async fn load_takes_max_of_persisted_and_firmware() {
        let storage = MemoryStorage::new();
        storage.write(LKGT_KEY, 100u32.to_be_bytes().to_vec()).await.unwrap();
        let lkgt = LastKnownGoodTime::load(&storage, 50).await.unwrap();
        assert_eq!(lkgt.get(), 100);

        let storage2 = MemoryStorage::new();
        let lkgt2 = LastKnownGoodTime::load(&storage2, 200).await.unwrap();
        assert_eq!(lkgt2.get(), 200);
    }

    #[test]
    fn try_set_rejects_going_backwards() {
        let mut lkgt = LastKnownGoodTime {
            current: 100,
            committed: 100,
        };
        assert!(lkgt.try_set(99).is_err());
        assert!(lkgt.try_set(100).is_ok());
        assert!(lkgt.try_set(150).is_ok());
        assert_eq!(lkgt.get(), 150);
    }

    #[test]
    fn revert_undoes_pending_advance() {
        let mut lkgt = LastKnownGoodTime {
            current: 100,
            committed: 100,
        };
        lkgt.advance(200);
        assert_eq!(lkgt.get(), 200);
        lkgt.revert();
        assert_eq!(lkgt.get(), 100);
    }
}
