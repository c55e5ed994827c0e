//! The persisted state of a stream processor.
//!
//! A processor's state is only ever changed through the transitions defined here. They are pure
//! functions of the current state and the outcome of processing a single event, so the
//! processing loops stay small and the rules around positions and retry attempts can be tested
//! in isolation.

use std::collections::BTreeMap;

use iox_time::Time;
use serde::{Deserialize, Serialize};

use crate::{PartitionId, RetryContext, StreamPosition};

/// The retry time given to a processor or partition that must not be retried automatically.
///
/// Anything carrying this retry time is parked until its position is set again.
pub fn far_future() -> Time {
    Time::from_timestamp_nanos(i64::MAX)
}

fn no_retry_time() -> Time {
    Time::from_timestamp_nanos(0)
}

/// Which processing engine a state belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorKind {
    Unpartitioned,
    Partitioned,
}

impl std::fmt::Display for ProcessorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unpartitioned => f.write_str("unpartitioned"),
            Self::Partitioned => f.write_str("partitioned"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamProcessorState {
    Unpartitioned(UnpartitionedProcessorState),
    Partitioned(PartitionedProcessorState),
}

impl StreamProcessorState {
    /// The state of a processor that has not processed anything yet
    pub fn initial(kind: ProcessorKind) -> Self {
        match kind {
            ProcessorKind::Unpartitioned => {
                Self::Unpartitioned(UnpartitionedProcessorState::new(StreamPosition::START))
            }
            ProcessorKind::Partitioned => {
                Self::Partitioned(PartitionedProcessorState::new(StreamPosition::START))
            }
        }
    }

    pub fn kind(&self) -> ProcessorKind {
        match self {
            Self::Unpartitioned(_) => ProcessorKind::Unpartitioned,
            Self::Partitioned(_) => ProcessorKind::Partitioned,
        }
    }

    pub fn position(&self) -> StreamPosition {
        match self {
            Self::Unpartitioned(state) => state.position,
            Self::Partitioned(state) => state.position,
        }
    }

    /// Whether the processor, or any of its partitions, is failing
    pub fn is_failing(&self) -> bool {
        match self {
            Self::Unpartitioned(state) => state.is_failing,
            Self::Partitioned(state) => !state.partitions.is_empty(),
        }
    }

    /// Move the processor to `position`, healing every failure it has recorded.
    pub fn reset_to(&self, position: StreamPosition) -> Self {
        match self {
            Self::Unpartitioned(_) => {
                Self::Unpartitioned(UnpartitionedProcessorState::new(position))
            }
            Self::Partitioned(_) => Self::Partitioned(PartitionedProcessorState::new(position)),
        }
    }
}

impl From<UnpartitionedProcessorState> for StreamProcessorState {
    fn from(state: UnpartitionedProcessorState) -> Self {
        Self::Unpartitioned(state)
    }
}

impl From<PartitionedProcessorState> for StreamProcessorState {
    fn from(state: PartitionedProcessorState) -> Self {
        Self::Partitioned(state)
    }
}

/// Number of failed retries to record for a failure of the event at `position`, given the
/// failure previously recorded for it, if any.
fn attempts_after_failure(
    previous: Option<(StreamPosition, u32)>,
    position: StreamPosition,
) -> u32 {
    match previous {
        Some((failed_at, attempts)) if failed_at == position => attempts.saturating_add(1),
        _ => 0,
    }
}

/// State of a processor that reads its stream as one sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnpartitionedProcessorState {
    pub position: StreamPosition,
    pub is_failing: bool,
    pub failure_reason: String,
    #[serde(with = "crate::serialize::time_nanos")]
    pub retry_time: Time,
    pub processing_attempts: u32,
}

impl UnpartitionedProcessorState {
    pub fn new(position: StreamPosition) -> Self {
        Self {
            position,
            is_failing: false,
            failure_reason: String::new(),
            retry_time: no_retry_time(),
            processing_attempts: 0,
        }
    }

    /// The event at `event_position` was processed
    pub fn processed(&self, event_position: StreamPosition) -> Self {
        Self::new(event_position.next())
    }

    /// The event at `event_position` failed and may be retried at `retry_time`
    pub fn failed(
        &self,
        event_position: StreamPosition,
        reason: impl Into<String>,
        retry_time: Time,
    ) -> Self {
        let previous = self
            .is_failing
            .then_some((self.position, self.processing_attempts));
        Self {
            position: event_position,
            is_failing: true,
            failure_reason: reason.into(),
            retry_time,
            processing_attempts: attempts_after_failure(previous, event_position),
        }
    }

    /// Whether the processor is failing and must wait before retrying
    pub fn is_waiting_for_retry(&self, now: Time) -> bool {
        self.is_failing && now < self.retry_time
    }

    pub fn is_parked(&self) -> bool {
        self.is_failing && self.retry_time == far_future()
    }

    /// The context to hand to the consumer when the next delivery is a retry
    pub fn retry_context(&self) -> Option<RetryContext> {
        self.is_failing.then(|| RetryContext {
            processing_attempts: self.processing_attempts,
            failure_reason: self.failure_reason.clone(),
        })
    }
}

/// The failure recorded for a single partition of a partitioned processor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailingPartitionState {
    /// Position of the next event of this partition to deliver
    pub position: StreamPosition,
    pub failure_reason: String,
    #[serde(with = "crate::serialize::time_nanos")]
    pub retry_time: Time,
    pub processing_attempts: u32,
    /// Whether the event at `position` has failed itself. It has not while the partition is
    /// delivering the events held back behind an earlier failure.
    pub failed: bool,
}

impl FailingPartitionState {
    pub fn is_due(&self, now: Time) -> bool {
        self.retry_time <= now
    }

    pub fn is_parked(&self) -> bool {
        self.retry_time == far_future()
    }

    /// The context to deliver the event at `position` with, if it is a retry
    pub fn retry_context(&self) -> Option<RetryContext> {
        self.failed.then(|| RetryContext {
            processing_attempts: self.processing_attempts,
            failure_reason: self.failure_reason.clone(),
        })
    }
}

/// State of a processor that partitions its stream.
///
/// `position` is the shared read cursor. Every entry in `partitions` sits strictly behind it:
/// the cursor moves on past the events of failing partitions, and those partitions deliver their
/// remaining events through partition-scoped reads when their retry time comes up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionedProcessorState {
    pub position: StreamPosition,
    pub partitions: BTreeMap<PartitionId, FailingPartitionState>,
}

impl PartitionedProcessorState {
    pub fn new(position: StreamPosition) -> Self {
        Self {
            position,
            partitions: BTreeMap::new(),
        }
    }

    pub fn is_failing(&self, partition: &PartitionId) -> bool {
        self.partitions.contains_key(partition)
    }

    /// The failing partition with the lowest position whose retry time has passed
    pub fn next_due_partition(
        &self,
        now: Time,
    ) -> Option<(&PartitionId, &FailingPartitionState)> {
        self.partitions
            .iter()
            .filter(|(_, failing)| failing.is_due(now))
            .min_by_key(|(_, failing)| failing.position)
    }

    /// The earliest time a failing partition becomes due, ignoring parked partitions
    pub fn next_retry_time(&self) -> Option<Time> {
        self.partitions
            .values()
            .filter(|failing| !failing.is_parked())
            .map(|failing| failing.retry_time)
            .min()
    }

    fn advance_past(&mut self, event_position: StreamPosition) {
        if event_position >= self.position {
            self.position = event_position.next();
        }
    }

    /// The cursor read an event belonging to a failing partition. It is left for the partition
    /// to deliver once it resumes.
    pub fn skipped(&mut self, event_position: StreamPosition) {
        self.advance_past(event_position);
    }

    /// An event read by the cursor was processed
    pub fn processed(&mut self, event_position: StreamPosition) {
        self.advance_past(event_position);
    }

    /// The event at `event_position` in `partition` failed, either when read by the cursor or
    /// when retried.
    pub fn failed(
        &mut self,
        partition: PartitionId,
        event_position: StreamPosition,
        reason: impl Into<String>,
        retry_time: Time,
    ) {
        let previous = self
            .partitions
            .get(&partition)
            .filter(|failing| failing.failed)
            .map(|failing| (failing.position, failing.processing_attempts));
        let failing = FailingPartitionState {
            position: event_position,
            failure_reason: reason.into(),
            retry_time,
            processing_attempts: attempts_after_failure(previous, event_position),
            failed: true,
        };
        self.partitions.insert(partition, failing);
        self.advance_past(event_position);
    }

    /// A failing partition processed its pending event. `next_in_partition` is the position of
    /// the partition's following event, if the stream has one.
    ///
    /// If that event is still behind the cursor the partition keeps delivering from there right
    /// away, otherwise it has caught up and is healthy again.
    pub fn retried(
        &mut self,
        partition: &PartitionId,
        next_in_partition: Option<StreamPosition>,
        now: Time,
    ) {
        match next_in_partition {
            Some(next) if next < self.position => {
                if let Some(failing) = self.partitions.get_mut(partition) {
                    failing.position = next;
                    failing.retry_time = now;
                    failing.processing_attempts = 0;
                    failing.failed = false;
                }
            }
            _ => {
                self.partitions.remove(partition);
            }
        }
    }
}
