use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::{DashMap, DashSet, mapref::entry::Entry};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::modex::ModexData;
use crate::pmix::{PmixError, PmixStatus, Proc, Range, Scope};

/// Lifecycle of one fence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FencePhase {
    /// Created, nobody counted yet
    Pending,
    /// Some participants have arrived
    Collecting,
    /// Every participant arrived; the barrier is being released
    Released,
}

/// What each participant receives when a fence is released
#[derive(Debug, Clone, PartialEq)]
pub struct Release {
    pub status: PmixStatus,
    pub participants: Vec<Proc>,
    pub data: Vec<ModexData>,
}

/// State of an ongoing fence operation
struct FenceState {
    id: u64,
    phase: FencePhase,
    ranges: Vec<Range>,
    collect: bool,
    /// Participants that have arrived, with the channel to release them
    waiters: HashMap<Proc, oneshot::Sender<Release>>,
    /// Data contributed by the participants so far. Held back until release.
    data: Vec<(Scope, ModexData)>,
}

/// A fence whose participants have all arrived. Hand it back to
/// `FenceCoordinator::release` once the host barrier completes.
pub struct ReadyFence {
    pub id: u64,
    pub ranges: Vec<Range>,
    pub collect: bool,
    pub participants: Vec<Proc>,
    /// Data contributed by the participants, in arrival order
    pub data: Vec<(Scope, ModexData)>,
    waiters: HashMap<Proc, oneshot::Sender<Release>>,
}

/// Tracks fences in progress, keyed by their resolved participant set.
#[derive(Default)]
pub struct FenceCoordinator {
    active_fences: DashMap<BTreeSet<Proc>, FenceState>,
    /// Processes whose data has been released by at least one fence
    released: DashSet<Proc>,
    fence_counter: AtomicU64,
}

impl FenceCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the arrival of `proc` at the fence over `participants`, along
    /// with the data it contributes. Rejected arrivals contribute nothing.
    ///
    /// Returns the receiver on which `proc` is released and, if `proc` was the
    /// last participant to arrive, the now complete fence.
    pub fn arrive(
        &self,
        proc: Proc,
        participants: BTreeSet<Proc>,
        ranges: Vec<Range>,
        collect: bool,
        data: Vec<(Scope, ModexData)>,
    ) -> Result<(oneshot::Receiver<Release>, Option<ReadyFence>), PmixError> {
        if !participants.contains(&proc) {
            warn!(%proc, "Process is not a participant of its own fence");
            return Err(PmixError::BadParam);
        }

        let (tx, rx) = oneshot::channel();
        let expected = participants.len();
        let mut state = match self.active_fences.entry(participants) {
            Entry::Occupied(o) => o,
            Entry::Vacant(v) => {
                let id = self.fence_counter.fetch_add(1, Ordering::SeqCst);
                info!(fence_id = id, expected, collect, "Starting fence");
                v.insert_entry(FenceState {
                    id,
                    phase: FencePhase::Pending,
                    ranges,
                    collect,
                    waiters: HashMap::new(),
                    data: Vec::new(),
                })
            }
        };

        let fence = state.get_mut();
        if fence.collect != collect {
            warn!(fence_id = fence.id, %proc, "Fence arrival with mismatched collect flag");
            return Err(PmixError::BadParam);
        }
        if fence.waiters.contains_key(&proc) {
            warn!(fence_id = fence.id, %proc, "Duplicate fence arrival");
            return Err(PmixError::BadParam);
        }

        fence.waiters.insert(proc.clone(), tx);
        fence.data.extend(data);
        fence.phase = FencePhase::Collecting;
        debug!(
            fence_id = fence.id,
            %proc,
            arrived = fence.waiters.len(),
            expected,
            "Fence arrival"
        );

        if fence.waiters.len() < expected {
            return Ok((rx, None));
        }

        let (participants, mut fence) = state.remove_entry();
        fence.phase = FencePhase::Released;
        debug!(fence_id = fence.id, phase = ?fence.phase, "All participants arrived");
        let ready = ReadyFence {
            id: fence.id,
            ranges: fence.ranges,
            collect: fence.collect,
            participants: participants.into_iter().collect(),
            data: fence.data,
            waiters: fence.waiters,
        };
        Ok((rx, Some(ready)))
    }

    /// Release every participant of a complete fence.
    pub fn release(&self, fence: ReadyFence, status: PmixStatus, data: Vec<ModexData>) {
        info!(
            fence_id = fence.id,
            num_participants = fence.participants.len(),
            status = status.as_str(),
            "Fence complete"
        );

        if status.is_success() {
            for proc in &fence.participants {
                self.released.insert(proc.clone());
            }
        }

        let release = Release {
            status,
            participants: fence.participants,
            data,
        };
        for (proc, tx) in fence.waiters {
            if tx.send(release.clone()).is_err() {
                debug!(%proc, "Fence participant went away before release");
            }
        }
    }

    /// Withdraw a process that went away. Every fence it takes part in can no
    /// longer complete, so the participants already waiting are released with
    /// an error and the contributed data is dropped.
    pub fn withdraw(&self, proc: &Proc) {
        self.active_fences.retain(|participants, fence| {
            if !participants.contains(proc) {
                return true;
            }
            fence.waiters.remove(proc);
            warn!(
                fence_id = fence.id,
                %proc,
                waiting = fence.waiters.len(),
                "Participant left, failing fence"
            );
            let release = Release {
                status: PmixStatus::ERR_UNREACH,
                participants: participants.iter().cloned().collect(),
                data: vec![],
            };
            for (waiter, tx) in fence.waiters.drain() {
                if tx.send(release.clone()).is_err() {
                    debug!(proc = %waiter, "Fence participant went away before release");
                }
            }
            false
        });
    }

    /// Whether a completed fence has released the data of `proc`.
    pub fn is_released(&self, proc: &Proc) -> bool {
        self.released.contains(proc)
    }

    /// Get the number of active fence operations
    pub fn active_fence_count(&self) -> usize {
        self.active_fences.len()
    }

    /// Phase of the fence over `participants`, if one is in progress
    pub fn phase(&self, participants: &BTreeSet<Proc>) -> Option<FencePhase> {
        self.active_fences.get(participants).map(|f| f.phase)
    }
}

/// Resolve fence ranges into the set of participating processes.
///
/// No ranges means the whole namespace of `caller`; a range without ranks
/// means its whole namespace. `nprocs` gives the size of a namespace.
pub fn resolve_participants(
    ranges: &[Range],
    caller: &Proc,
    nprocs: impl Fn(&str) -> Option<u32>,
) -> Result<BTreeSet<Proc>, PmixError> {
    let whole;
    let ranges = if ranges.is_empty() {
        whole = [Range::whole(caller.nspace.clone())];
        &whole[..]
    } else {
        ranges
    };

    let mut participants = BTreeSet::new();
    for range in ranges {
        let size = nprocs(&range.nspace).ok_or(PmixError::BadParam)?;
        if range.ranks.is_empty() {
            participants.extend((0..size).map(|r| Proc::new(range.nspace.clone(), r)));
        } else {
            for &rank in &range.ranks {
                if rank >= size {
                    return Err(PmixError::BadParam);
                }
                participants.insert(Proc::new(range.nspace.clone(), rank));
            }
        }
    }
    Ok(participants)
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn procs(ranks: impl IntoIterator<Item = u32>) -> BTreeSet<Proc> {
        ranks.into_iter().map(|r| Proc::new("foo", r)).collect()
    }

    fn blob(rank: u32, contents: &'static str) -> Vec<(Scope, ModexData)> {
        vec![(
            Scope::Global,
            ModexData::new(Proc::new("foo", rank), contents.as_bytes()),
        )]
    }

    #[test]
    fn test_resolve_participants() {
        let nprocs = |ns: &str| (ns == "foo").then_some(3);
        let caller = Proc::new("foo", 1);

        assert_eq!(resolve_participants(&[], &caller, nprocs).unwrap(), procs(0..3));
        assert_eq!(
            resolve_participants(&[Range::new("foo", [2, 0])], &caller, nprocs).unwrap(),
            procs([0, 2])
        );
        assert_eq!(
            resolve_participants(&[Range::new("foo", [3])], &caller, nprocs),
            Err(PmixError::BadParam)
        );
        assert_eq!(
            resolve_participants(&[Range::whole("bar")], &caller, nprocs),
            Err(PmixError::BadParam)
        );
    }

    #[test]
    fn test_fence_releases_all() {
        let coord = FenceCoordinator::new();
        let participants = procs(0..3);
        let mut rxs = Vec::new();
        for rank in 0..2 {
            let (rx, ready) = coord
                .arrive(Proc::new("foo", rank), participants.clone(), vec![], true, vec![])
                .unwrap();
            assert!(ready.is_none());
            rxs.push(rx);
        }
        assert_eq!(coord.phase(&participants), Some(FencePhase::Collecting));
        assert!(!coord.is_released(&Proc::new("foo", 0)));

        let (rx, ready) = coord
            .arrive(Proc::new("foo", 2), participants.clone(), vec![], true, vec![])
            .unwrap();
        rxs.push(rx);
        let ready = ready.unwrap();
        assert_eq!(ready.participants.len(), 3);
        assert_eq!(coord.active_fence_count(), 0);

        let data = vec![ModexData::new(Proc::new("foo", 1), &b"x"[..])];
        coord.release(ready, PmixStatus::SUCCESS, data.clone());
        for mut rx in rxs {
            let release = rx.try_recv().unwrap();
            assert_eq!(release.status, PmixStatus::SUCCESS);
            assert_eq!(release.data, data);
        }
        assert!(coord.is_released(&Proc::new("foo", 2)));
    }

    #[test]
    fn test_single_participant_is_immediate() {
        let coord = FenceCoordinator::new();
        let me = Proc::new("foo", 0);
        let (_rx, ready) = coord
            .arrive(me.clone(), procs([0]), vec![], false, vec![])
            .unwrap();
        assert!(ready.is_some());
    }

    #[test]
    fn test_rejected_arrivals() {
        let coord = FenceCoordinator::new();
        let participants = procs(0..2);
        let (_rx, _) = coord
            .arrive(Proc::new("foo", 0), participants.clone(), vec![], true, blob(0, "a"))
            .unwrap();

        assert_eq!(
            coord
                .arrive(Proc::new("foo", 1), participants.clone(), vec![], false, blob(1, "x"))
                .err(),
            Some(PmixError::BadParam)
        );
        assert_eq!(
            coord
                .arrive(Proc::new("foo", 0), participants.clone(), vec![], true, blob(0, "y"))
                .err(),
            Some(PmixError::BadParam)
        );
        assert_eq!(
            coord
                .arrive(Proc::new("foo", 5), participants.clone(), vec![], true, vec![])
                .err(),
            Some(PmixError::BadParam)
        );
        assert_eq!(coord.phase(&participants), Some(FencePhase::Collecting));

        let (_rx, ready) = coord
            .arrive(Proc::new("foo", 1), participants, vec![], true, blob(1, "b"))
            .unwrap();
        let blobs = ready
            .unwrap()
            .data
            .into_iter()
            .map(|(_, d)| d.blob)
            .collect::<Vec<_>>();
        assert_eq!(blobs, [&b"a"[..], &b"b"[..]]);
    }

    #[test]
    fn test_withdraw_fails_fence() {
        let coord = FenceCoordinator::new();
        let participants = procs(0..3);
        let mut rxs = Vec::new();
        for rank in 0..2 {
            let (rx, _) = coord
                .arrive(Proc::new("foo", rank), participants.clone(), vec![], true, vec![])
                .unwrap();
            rxs.push(rx);
        }
        let (_other, _) = coord
            .arrive(Proc::new("foo", 0), procs([0, 1]), vec![], true, vec![])
            .unwrap();

        // Rank 2 leaves without ever arriving
        coord.withdraw(&Proc::new("foo", 2));
        assert_eq!(coord.active_fence_count(), 1);
        for mut rx in rxs {
            let release = rx.try_recv().unwrap();
            assert_eq!(release.status, PmixStatus::ERR_UNREACH);
            assert!(release.data.is_empty());
        }
        assert!(!coord.is_released(&Proc::new("foo", 0)));

        coord.withdraw(&Proc::new("foo", 0));
        assert_eq!(coord.active_fence_count(), 0);
    }
}
