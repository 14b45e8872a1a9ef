//! Team poller
//!
//! A background task that owns the memory reader, assembles the team on a
//! fixed cadence and publishes every successful result as a snapshot.
//! Failed cycles are logged and reported; the last good snapshot stays put.

use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};

use crate::model::PartyMember;
use crate::network::ReadMemory;
use crate::team::TeamLayout;

/// Poller configuration
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Pause between the end of one cycle and the start of the next
    pub interval: Duration,
    /// Stop after this many failed cycles in a row (0 = never)
    pub max_consecutive_failures: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            max_consecutive_failures: 0,
        }
    }
}

/// The latest successfully assembled team
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Cycle that produced this team (0 = nothing read yet)
    pub cycle: u64,
    pub team: Vec<PartyMember>,
}

/// Why the poll loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// `stop` was called or the handle was dropped
    Requested,
    /// Too many consecutive cycles failed
    TooManyFailures(u32),
}

/// Events emitted by the poller
#[derive(Debug, Clone)]
pub enum PollEvent {
    /// A new snapshot was published
    Updated { cycle: u64, members: usize },
    /// A cycle failed; the previous snapshot is kept
    CycleFailed {
        cycle: u64,
        consecutive: u32,
        error: String,
    },
    /// The poll loop has exited
    Stopped { reason: StopReason },
}

/// Polls a team through an owned reader
pub struct Poller<R> {
    reader: R,
    layout: TeamLayout,
    config: PollerConfig,
}

impl<R> Poller<R>
where
    R: ReadMemory + 'static,
{
    pub fn new(reader: R, layout: TeamLayout, config: PollerConfig) -> Self {
        Self {
            reader,
            layout,
            config,
        }
    }

    /// Start the poll loop on the runtime
    pub fn spawn(self) -> PollerHandle<R> {
        let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::default());
        let (event_tx, event_rx) = mpsc::channel(256);
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);

        let task = tokio::spawn(self.run(snapshot_tx, event_tx, shutdown_rx));

        PollerHandle {
            snapshots: snapshot_rx,
            event_rx: Some(event_rx),
            shutdown_tx,
            task,
        }
    }

    async fn run(
        mut self,
        snapshot_tx: watch::Sender<Snapshot>,
        event_tx: mpsc::Sender<PollEvent>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) -> R {
        tracing::info!(
            "Polling team at {:#x} every {:?}",
            self.layout.base_offset,
            self.config.interval
        );

        let mut cycle: u64 = 0;
        let mut consecutive_failures: u32 = 0;

        let reason = loop {
            cycle += 1;

            let result = tokio::select! {
                result = self.layout.read_team(&mut self.reader) => result,
                _ = shutdown_rx.recv() => break StopReason::Requested,
            };

            match result {
                Ok(team) => {
                    consecutive_failures = 0;
                    let members = team.len();
                    tracing::debug!("Cycle {}: {} members", cycle, members);
                    snapshot_tx.send_replace(Snapshot { cycle, team });
                    emit(&event_tx, PollEvent::Updated { cycle, members });
                }
                Err(e) => {
                    consecutive_failures += 1;
                    tracing::warn!(
                        "Cycle {} failed ({} in a row): {}",
                        cycle,
                        consecutive_failures,
                        e
                    );
                    emit(
                        &event_tx,
                        PollEvent::CycleFailed {
                            cycle,
                            consecutive: consecutive_failures,
                            error: e.to_string(),
                        },
                    );

                    let limit = self.config.max_consecutive_failures;
                    if limit > 0 && consecutive_failures >= limit {
                        tracing::error!("Giving up after {} failed cycles", consecutive_failures);
                        break StopReason::TooManyFailures(consecutive_failures);
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                _ = shutdown_rx.recv() => break StopReason::Requested,
            }
        };

        tracing::info!("Poller stopped after {} cycles: {:?}", cycle, reason);
        emit(&event_tx, PollEvent::Stopped { reason });
        self.reader
    }
}

fn emit(event_tx: &mpsc::Sender<PollEvent>, event: PollEvent) {
    // Nobody draining the queue must not stall polling
    if let Err(e) = event_tx.try_send(event) {
        tracing::trace!("Dropped poll event: {}", e);
    }
}

/// Handle to a running poller
pub struct PollerHandle<R> {
    snapshots: watch::Receiver<Snapshot>,
    event_rx: Option<mpsc::Receiver<PollEvent>>,
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<R>,
}

impl<R> PollerHandle<R> {
    /// A receiver that observes every published snapshot
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshots.clone()
    }

    /// The most recent snapshot
    pub fn latest(&self) -> Snapshot {
        self.snapshots.borrow().clone()
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<PollEvent>> {
        self.event_rx.take()
    }

    /// Check if the poll loop has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the poll loop to stop and wait for it, getting the reader back
    pub async fn stop(self) -> Result<R, JoinError> {
        let _ = self.shutdown_tx.try_send(());
        self.task.await
    }

    /// Wait for the poll loop to end on its own
    pub async fn join(self) -> Result<R, JoinError> {
        self.task.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use crate::model::RECORD_LEN;
    use crate::network::{ClientError, ClientResult};

    const BASE: u64 = 0x1000;

    /// Serves a fixed team and can be switched into failure
    struct ScriptedMemory {
        species: [u16; 6],
        failing: Arc<AtomicBool>,
        reads: usize,
    }

    impl ScriptedMemory {
        fn new(species: [u16; 6]) -> (Self, Arc<AtomicBool>) {
            let failing = Arc::new(AtomicBool::new(false));
            let memory = Self {
                species,
                failing: failing.clone(),
                reads: 0,
            };
            (memory, failing)
        }
    }

    #[async_trait]
    impl ReadMemory for ScriptedMemory {
        async fn read_memory(&mut self, address: u64, length: usize) -> ClientResult<Vec<u8>> {
            self.reads += 1;
            if self.failing.load(Ordering::SeqCst) {
                return Err(ClientError::NotConnected);
            }
            let slot = ((address - BASE) as usize) / length;
            let mut bytes = vec![0u8; length];
            bytes[0..2].copy_from_slice(&self.species[slot].to_le_bytes());
            Ok(bytes)
        }
    }

    fn config(interval_ms: u64, max_failures: u32) -> PollerConfig {
        PollerConfig {
            interval: Duration::from_millis(interval_ms),
            max_consecutive_failures: max_failures,
        }
    }

    fn layout() -> TeamLayout {
        TeamLayout::new(BASE, RECORD_LEN).unwrap()
    }

    #[tokio::test]
    async fn test_publishes_snapshot() {
        let (memory, _) = ScriptedMemory::new([25, 0, 6, 0, 0, 0]);
        let handle = Poller::new(memory, layout(), config(10, 0)).spawn();

        let mut snapshots = handle.subscribe();
        snapshots.changed().await.unwrap();
        let snapshot = snapshots.borrow().clone();

        assert!(snapshot.cycle >= 1);
        let species: Vec<u16> = snapshot.team.iter().map(|m| m.species_id).collect();
        assert_eq!(species, vec![25, 6]);

        let memory = handle.stop().await.unwrap();
        assert!(memory.reads >= TEAM_READS);
    }

    const TEAM_READS: usize = 6;

    #[tokio::test]
    async fn test_failed_cycle_keeps_previous_snapshot() {
        let (memory, failing) = ScriptedMemory::new([1, 2, 3, 0, 0, 0]);
        let mut handle = Poller::new(memory, layout(), config(10, 0)).spawn();
        let mut events = handle.take_event_receiver().unwrap();

        // Wait for the first good cycle
        loop {
            if let Some(PollEvent::Updated { .. }) = events.recv().await {
                break;
            }
        }
        let good = handle.latest();
        assert_eq!(good.team.len(), 3);

        failing.store(true, Ordering::SeqCst);
        loop {
            if let Some(PollEvent::CycleFailed { .. }) = events.recv().await {
                break;
            }
        }

        // The failure did not touch the published team
        let after = handle.latest();
        assert_eq!(after.team, good.team);
        assert!(!handle.is_finished());

        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_recovers_after_failure() {
        let (memory, failing) = ScriptedMemory::new([7, 0, 0, 0, 0, 0]);
        failing.store(true, Ordering::SeqCst);
        let mut handle = Poller::new(memory, layout(), config(5, 0)).spawn();
        let mut events = handle.take_event_receiver().unwrap();

        match events.recv().await {
            Some(PollEvent::CycleFailed { consecutive, .. }) => assert_eq!(consecutive, 1),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(handle.latest().cycle, 0);

        failing.store(false, Ordering::SeqCst);
        loop {
            if let Some(PollEvent::Updated { members, .. }) = events.recv().await {
                assert_eq!(members, 1);
                break;
            }
        }

        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_gives_up_after_consecutive_failures() {
        let (memory, failing) = ScriptedMemory::new([1, 0, 0, 0, 0, 0]);
        failing.store(true, Ordering::SeqCst);
        let mut handle = Poller::new(memory, layout(), config(1, 3)).spawn();
        let mut events = handle.take_event_receiver().unwrap();

        let mut failures = 0;
        let reason = loop {
            match events.recv().await {
                Some(PollEvent::CycleFailed { .. }) => failures += 1,
                Some(PollEvent::Stopped { reason }) => break reason,
                Some(PollEvent::Updated { .. }) => panic!("no cycle should succeed"),
                None => panic!("event channel closed"),
            }
        };

        assert_eq!(failures, 3);
        assert_eq!(reason, StopReason::TooManyFailures(3));

        let memory = handle.join().await.unwrap();
        // Each failed cycle aborts on its first slot
        assert_eq!(memory.reads, 3);
    }

    #[tokio::test]
    async fn test_subscribers_see_loop_end_without_events() {
        let (memory, failing) = ScriptedMemory::new([1, 0, 0, 0, 0, 0]);
        failing.store(true, Ordering::SeqCst);
        // Event receiver is never taken, so queued events go unread
        let handle = Poller::new(memory, layout(), config(1, 1)).spawn();
        let mut snapshots = handle.subscribe();

        let changed = tokio::time::timeout(Duration::from_secs(5), snapshots.changed())
            .await
            .unwrap();
        assert!(changed.is_err());
        assert_eq!(snapshots.borrow().cycle, 0);

        let memory = handle.join().await.unwrap();
        assert_eq!(memory.reads, 1);
    }

    #[tokio::test]
    async fn test_stop_interrupts_sleep() {
        let (memory, _) = ScriptedMemory::new([1, 0, 0, 0, 0, 0]);
        let mut handle = Poller::new(memory, layout(), config(60_000, 0)).spawn();
        let mut events = handle.take_event_receiver().unwrap();

        assert!(matches!(events.recv().await, Some(PollEvent::Updated { cycle: 1, .. })));

        let stopped = tokio::time::timeout(Duration::from_secs(5), handle.stop()).await;
        assert!(stopped.is_ok());

        assert!(matches!(
            events.recv().await,
            Some(PollEvent::Stopped {
                reason: StopReason::Requested
            })
        ));
    }
}
