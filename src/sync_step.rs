//! Cache-or-acquire step
//!
//! A step first tries its persisted record. A record that is missing, empty or
//! unparseable is cleared and the step falls back to its slow path, whose
//! result is persisted before it is returned.

use crate::BoardError;
use crate::store::{RecordKey, RecordStorage, RecordStore};
use crate::sync::RestartReason;
use alloc::string::String;
use alloc::vec::Vec;
use log::{info, warn};

/// Result of a slow path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquisition<T> {
    Value(T),
    /// The slow path persisted its result through another channel and the
    /// node has to restart to pick it up
    Restart(RestartReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome<T> {
    /// Loaded from the store
    Cached(T),
    /// Produced by the slow path and persisted
    Acquired(T),
    Restart(RestartReason),
}

#[allow(async_fn_in_trait)]
pub trait SyncStep {
    type Value;

    fn name(&self) -> &'static str;

    fn key(&self) -> RecordKey;

    /// Decode the persisted record
    fn parse(&self, lines: &[String]) -> Result<Self::Value, BoardError>;

    /// Lines persisted for a freshly acquired value
    fn encode(&self, value: &Self::Value) -> Result<Vec<String>, BoardError>;

    /// Slow path
    async fn acquire<S: RecordStorage>(
        &mut self,
        store: &mut RecordStore<S>,
    ) -> Result<Acquisition<Self::Value>, BoardError>;
}

/// Run one step: fast path from the store, slow path otherwise
pub async fn run_step<S, T>(
    store: &mut RecordStore<S>,
    step: &mut T,
) -> Result<StepOutcome<T::Value>, BoardError>
where
    S: RecordStorage,
    T: SyncStep,
{
    let key = step.key();

    if !store.is_empty(key) {
        match store
            .read_lines(key, '\n')
            .and_then(|lines| step.parse(&lines))
        {
            Ok(value) => {
                info!("[SYNC] {} loaded from {}", step.name(), key.path());
                return Ok(StepOutcome::Cached(value));
            }
            Err(e) => {
                warn!("[SYNC] {} record unusable ({}), clearing", step.name(), e);
                if let Err(e) = store.clear(key) {
                    warn!("[SYNC] Failed to clear {}: {}", key.path(), e);
                }
            }
        }
    }

    info!("[SYNC] {} not cached, acquiring", step.name());
    match step.acquire(store).await? {
        Acquisition::Value(value) => {
            let lines = step.encode(&value)?;
            store.write_lines(key, &lines, false)?;
            info!("[SYNC] {} acquired and saved", step.name());
            Ok(StepOutcome::Acquired(value))
        }
        Acquisition::Restart(reason) => {
            info!("[SYNC] {} requires a restart ({:?})", step.name(), reason);
            Ok(StepOutcome::Restart(reason))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::WifiCredentials;
    use crate::store::MemoryStorage;
    use crate::testing::{Access, FlakyStorage};
    use embassy_futures::block_on;

    /// WiFi-shaped step whose slow path returns a fixed value
    struct FixedStep {
        acquired: usize,
        result: Option<Acquisition<WifiCredentials>>,
    }

    impl FixedStep {
        fn returning(result: Acquisition<WifiCredentials>) -> Self {
            Self {
                acquired: 0,
                result: Some(result),
            }
        }
    }

    impl SyncStep for FixedStep {
        type Value = WifiCredentials;

        fn name(&self) -> &'static str {
            "fixed"
        }

        fn key(&self) -> RecordKey {
            RecordKey::WifiSession
        }

        fn parse(&self, lines: &[String]) -> Result<WifiCredentials, BoardError> {
            WifiCredentials::from_lines(lines)
        }

        fn encode(&self, value: &WifiCredentials) -> Result<Vec<String>, BoardError> {
            Ok(value.to_lines())
        }

        async fn acquire<S: RecordStorage>(
            &mut self,
            _store: &mut RecordStore<S>,
        ) -> Result<Acquisition<WifiCredentials>, BoardError> {
            self.acquired += 1;
            self.result.clone().ok_or(BoardError::NotFound)
        }
    }

    fn wifi() -> WifiCredentials {
        WifiCredentials::new("Horta", "pw").unwrap()
    }

    #[test]
    fn cached_record_skips_the_slow_path_and_writes_nothing() {
        let mut store = RecordStore::new(FlakyStorage::new());
        store
            .write_lines(RecordKey::WifiSession, &wifi().to_lines(), false)
            .unwrap();
        store.storage_mut().reset_log();

        let mut step = FixedStep::returning(Acquisition::Value(wifi()));
        for _ in 0..2 {
            let outcome = block_on(run_step(&mut store, &mut step)).unwrap();
            assert_eq!(outcome, StepOutcome::Cached(wifi()));
        }

        assert_eq!(step.acquired, 0);
        assert!(store.storage().log().iter().all(|(access, _, _)| *access == Access::Read));
    }

    #[test]
    fn missing_record_is_acquired_and_persisted() {
        let mut store = RecordStore::new(MemoryStorage::new());
        let mut step = FixedStep::returning(Acquisition::Value(wifi()));

        let outcome = block_on(run_step(&mut store, &mut step)).unwrap();
        assert_eq!(outcome, StepOutcome::Acquired(wifi()));
        assert_eq!(step.acquired, 1);
        assert_eq!(
            store.read_lines(RecordKey::WifiSession, '\n').unwrap(),
            ["Horta", "pw"]
        );
    }

    #[test]
    fn corrupt_record_is_cleared_before_a_single_slow_path_call() {
        let mut store = RecordStore::new(FlakyStorage::new());
        store
            .write_lines(RecordKey::WifiSession, &["only-one-line"], false)
            .unwrap();
        store.storage_mut().reset_log();

        let mut step = FixedStep::returning(Acquisition::Value(wifi()));
        let outcome = block_on(run_step(&mut store, &mut step)).unwrap();

        assert_eq!(outcome, StepOutcome::Acquired(wifi()));
        assert_eq!(step.acquired, 1);
        let writes: Vec<usize> = store
            .storage()
            .log()
            .iter()
            .filter(|(access, _, _)| *access == Access::Write)
            .map(|(_, _, len)| *len)
            .collect();
        // clear, then the acquired record
        assert_eq!(writes, [0, "Horta\npw\n".len()]);
    }

    #[test]
    fn failing_clear_still_falls_back() {
        let mut store = RecordStore::new(FlakyStorage::new());
        store
            .write_lines(RecordKey::WifiSession, &["garbage"], false)
            .unwrap();
        store.storage_mut().fail_next_writes(1);

        let mut step = FixedStep::returning(Acquisition::Value(wifi()));
        let outcome = block_on(run_step(&mut store, &mut step)).unwrap();
        assert_eq!(outcome, StepOutcome::Acquired(wifi()));
        assert_eq!(step.acquired, 1);
    }

    #[test]
    fn restart_is_passed_through_without_writing() {
        let mut store = RecordStore::new(FlakyStorage::new());
        let mut step = FixedStep::returning(Acquisition::Restart(RestartReason::WifiSubmitted));

        let outcome = block_on(run_step(&mut store, &mut step)).unwrap();
        assert_eq!(outcome, StepOutcome::Restart(RestartReason::WifiSubmitted));
        assert!(
            store
                .storage()
                .log()
                .iter()
                .all(|(access, _, _)| *access != Access::Write)
        );
    }

    #[test]
    fn slow_path_error_is_propagated() {
        let mut store = RecordStore::new(MemoryStorage::new());
        let mut step = FixedStep {
            acquired: 0,
            result: None,
        };
        assert_eq!(
            block_on(run_step(&mut store, &mut step)),
            Err(BoardError::NotFound)
        );
    }
}
