use crate::control_messages::AckNackMessage;
use crate::station_token::FrameSetLabel;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use tracing::{debug, trace, warn};

/// A contiguous range `[low, high)` of sequence numbers known to be missing: `low` is the first
///  missing sequence, `high` the next known-present one. Invariant: `low < high`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Gap {
    pub low: u64,
    pub high: u64,
}

impl Display for Gap {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{})", self.low, self.high)
    }
}

/// Tuning constants for gap bookkeeping. The values are policy, not protocol: they were tuned
///  empirically for one deployment's traffic patterns (see `LinkConfig`).
#[derive(Debug, Copy, Clone)]
pub struct GapPolicy {
    /// a forward sequence jump larger than this is flagged as a possible series reset
    pub large_jump_threshold: u64,
    /// how far below a peer-reported low the local window is still considered meaningful
    pub reconcile_lookback: u64,
}

/// How a single arriving sequence number changed the gap state.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ArrivalDisposition {
    /// the expected next sequence (or the very first one of the series)
    InSequence,
    /// a forward jump left a new gap behind
    NewGap { reset_suspected: bool },
    /// trimmed an existing gap at one of its edges
    FilledGapEdge,
    /// landed in the middle of an existing gap, splitting it in two
    SplitGap,
    /// below the tracked window: the window was extended backward
    ExtendedLow,
    /// inside the envelope but not in any gap: duplicate of an already-filled sequence
    AlreadyPresent,
    /// so far below the window that it can only be a stale resend; state unchanged
    StaleBelowWindow,
}

/// Result of reconciling the local gap state against a peer-reported envelope.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReconcileOutcome {
    /// the local envelope was uninitialized and the peer's state was adopted wholesale
    AdoptedPeerEnvelope,
    /// local and peer envelopes were irreconcilable: local state was replaced. This indicates
    ///  unexpected renumbering and should be alarmed, not just logged.
    FrameSetChanged,
    Converged { peer_jumped_ahead: bool },
}

/// Per-series bookkeeping of which sequence numbers have not been received, as a sorted set of
///  disjoint gaps inside the `[lowest_seq, highest_seq]` envelope.
///
/// NB: A GapList is only meaningful for one series; when the series changes, the peer's sequence
///      space has reset and the list must be rebuilt from scratch.
pub struct GapList {
    series: u32,
    policy: GapPolicy,
    initialized: bool,
    lowest_seq: u64,
    /// highest sequence ever confirmed, contiguous or not
    highest_seq: u64,
    /// gap low bound -> gap high bound (exclusive)
    gaps: BTreeMap<u64, u64>,
}

impl GapList {
    pub fn new(series: u32, policy: GapPolicy) -> GapList {
        GapList {
            series,
            policy,
            initialized: false,
            lowest_seq: 0,
            highest_seq: 0,
            gaps: BTreeMap::new(),
        }
    }

    pub fn from_snapshot(snapshot: &GapSnapshot, policy: GapPolicy) -> GapList {
        let mut list = GapList::new(snapshot.series, policy);
        if snapshot.lowest_seq > 0 || snapshot.highest_seq > 0 {
            list.initialized = true;
            list.lowest_seq = snapshot.lowest_seq;
            list.highest_seq = snapshot.highest_seq;
            for gap in &snapshot.gaps {
                list.insert_gap(gap.low, gap.high);
            }
        }
        list
    }

    pub fn series(&self) -> u32 {
        self.series
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn lowest_seq(&self) -> u64 {
        self.lowest_seq
    }

    pub fn highest_seq(&self) -> u64 {
        self.highest_seq
    }

    pub fn gap_count(&self) -> usize {
        self.gaps.len()
    }

    pub fn gaps(&self) -> Vec<Gap> {
        self.gaps.iter().map(|(&low, &high)| Gap { low, high }).collect()
    }

    pub fn is_missing(&self, seq: u64) -> bool {
        self.gaps.range(..=seq).next_back()
            .map(|(_, &high)| seq < high)
            .unwrap_or(false)
    }

    /// Discard all state and start a fresh, uninitialized list for a new series.
    pub fn rebuild_for_series(&mut self, series: u32) {
        *self = GapList::new(series, self.policy);
    }

    /// Record the arrival of one sequence number and report how it changed the gap state.
    pub fn record_arrival(&mut self, seq: u64) -> ArrivalDisposition {
        if !self.initialized {
            trace!("series {}: first arrival #{}", self.series, seq);
            self.initialized = true;
            self.lowest_seq = seq;
            self.highest_seq = seq;
            return ArrivalDisposition::InSequence;
        }

        if seq == self.highest_seq + 1 {
            self.highest_seq = seq;
            ArrivalDisposition::InSequence
        }
        else if seq > self.highest_seq {
            let jump = seq - self.highest_seq;
            self.insert_gap(self.highest_seq + 1, seq);
            self.highest_seq = seq;

            let reset_suspected = jump > self.policy.large_jump_threshold;
            if reset_suspected {
                debug!("series {}: sequence jumped forward by {} to #{} - possible series reset or long telemetry delay",
                    self.series, jump, seq);
            }
            ArrivalDisposition::NewGap { reset_suspected }
        }
        else if seq < self.lowest_seq {
            if self.lowest_seq - seq > self.policy.reconcile_lookback {
                ArrivalDisposition::StaleBelowWindow
            }
            else {
                let old_lowest = self.lowest_seq;
                // the arriving sequence itself is present; only the range above it is missing
                self.insert_gap(seq + 1, old_lowest);
                self.lowest_seq = seq.min(self.highest_seq);
                ArrivalDisposition::ExtendedLow
            }
        }
        else {
            let containing = self.gaps.range(..=seq).next_back()
                .map(|(&low, &high)| (low, high))
                .filter(|&(_, high)| seq < high);

            match containing {
                None => ArrivalDisposition::AlreadyPresent,
                Some((low, high)) => {
                    if seq == low {
                        self.gaps.remove(&low);
                        if seq + 1 < high {
                            self.gaps.insert(seq + 1, high);
                        }
                        ArrivalDisposition::FilledGapEdge
                    }
                    else if seq == high - 1 {
                        *self.gaps.get_mut(&low).expect("gap was just looked up") = seq;
                        ArrivalDisposition::FilledGapEdge
                    }
                    else {
                        *self.gaps.get_mut(&low).expect("gap was just looked up") = seq;
                        self.gaps.insert(seq + 1, high);
                        ArrivalDisposition::SplitGap
                    }
                }
            }
        }
    }

    /// Reconcile against the peer's reported view of the same series (from an inbound ACKNACK).
    pub fn reconcile(&mut self, peer_low: u64, peer_high: u64, peer_gaps: &[Gap]) -> ReconcileOutcome {
        if peer_low > peer_high {
            warn!("series {}: peer reported degenerate envelope [{}, {}] - ignoring", self.series, peer_low, peer_high);
            return ReconcileOutcome::Converged { peer_jumped_ahead: false };
        }

        if !self.initialized {
            self.adopt_peer_state(peer_low, peer_high, peer_gaps);
            return ReconcileOutcome::AdoptedPeerEnvelope;
        }

        let lookback = self.policy.reconcile_lookback;

        if self.highest_seq < peer_low
            || self.lowest_seq > peer_high
            || self.highest_seq > peer_high.saturating_add(lookback)
        {
            // the peer's numbering no longer overlaps sanely with ours: treat as a frame set
            //  reset, bounded to a recent window
            let bounded_low = peer_low.max(peer_high.saturating_sub(lookback));
            self.adopt_peer_state(bounded_low, peer_high, peer_gaps);
            return ReconcileOutcome::FrameSetChanged;
        }

        // drop or clamp local gaps that fell out of the peer's retained window
        let clamp_low = peer_low.saturating_sub(lookback);
        let stale: Vec<(u64, u64)> = self.gaps.range(..clamp_low)
            .map(|(&low, &high)| (low, high))
            .collect();
        for (low, high) in stale {
            self.gaps.remove(&low);
            if high > clamp_low {
                debug!("series {}: clamping gap [{}:{}) to the peer's retained window", self.series, low, high);
                self.insert_gap(clamp_low, high);
            }
            else {
                debug!("series {}: discarding stale gap [{}:{}) outside the peer's retained window", self.series, low, high);
            }
        }
        if self.lowest_seq < clamp_low {
            self.lowest_seq = clamp_low;
        }

        let peer_jumped_ahead = peer_high > self.highest_seq.saturating_add(self.policy.large_jump_threshold);
        ReconcileOutcome::Converged { peer_jumped_ahead }
    }

    fn adopt_peer_state(&mut self, low: u64, high: u64, peer_gaps: &[Gap]) {
        self.initialized = true;
        self.lowest_seq = low;
        self.highest_seq = high;
        self.gaps.clear();
        for gap in peer_gaps {
            self.insert_gap(gap.low.max(low), gap.high.min(high));
        }
    }

    /// Insert a gap, merging with adjacent or overlapping neighbours.
    fn insert_gap(&mut self, mut low: u64, mut high: u64) {
        if low >= high {
            return;
        }
        if let Some((&prev_low, &prev_high)) = self.gaps.range(..=low).next_back() {
            if prev_high >= low {
                self.gaps.remove(&prev_low);
                low = prev_low;
                high = high.max(prev_high);
            }
        }
        while let Some((&next_low, &next_high)) = self.gaps.range(low..).next() {
            if next_low > high {
                break;
            }
            self.gaps.remove(&next_low);
            high = high.max(next_high);
        }
        self.gaps.insert(low, high);
    }

    /// Gaps entirely outside the envelope carry no information for the peer and are dropped
    ///  before an acknowledgment is built.
    pub fn prune_out_of_envelope(&mut self) {
        let (lowest, highest) = (self.lowest_seq, self.highest_seq);
        self.gaps.retain(|&low, &mut high| !(high <= lowest || low > highest));
    }

    /// Build the ACKNACK payload for the current state.
    pub fn to_ack_message(&mut self, frame_set: FrameSetLabel) -> AckNackMessage {
        self.prune_out_of_envelope();
        AckNackMessage {
            frame_set,
            lowest_seq: self.lowest_seq,
            highest_seq: self.highest_seq,
            gaps: self.gaps(),
        }
    }

    pub fn snapshot(&self) -> GapSnapshot {
        GapSnapshot {
            series: self.series,
            lowest_seq: self.lowest_seq,
            highest_seq: self.highest_seq,
            gaps: self.gaps(),
        }
    }
}

/// Persistable image of a GapList, written at checkpoints and read back at session startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapSnapshot {
    pub series: u32,
    pub lowest_seq: u64,
    pub highest_seq: u64,
    pub gaps: Vec<Gap>,
}
