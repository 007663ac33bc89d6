use crate::clock::TtClock;
use crate::config::TtConfig;
use crate::error::TtError;
use crate::flow_table::{FlowEntry, FlowTable};
use crate::frame::Frame;
use crate::rcu::{self, RcuCell};
use crate::send_cache::{SendCache, SendInfo};
use crate::timer::{ScheduleTimer, TimerContext};
#[cfg(test)]
use mockall::automock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// The egress callback of a port: emit this frame on this port, now. The
///  timer handler calls it after aligning to the send instant, so the
///  implementation must not block.
#[cfg_attr(test, automock)]
pub trait FrameSender: Send + Sync + 'static {
    fn send_frame(&self, port_no: u32, frame: Frame);
}

#[derive(Default)]
pub struct TtPortStats {
    pub staged: AtomicU64,
    pub emitted: AtomicU64,
    pub misses: AtomicU64,
    pub over_age_drops: AtomicU64,
    pub replaced_drops: AtomicU64,
    pub header_errors: AtomicU64,
    pub arrived: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TtPortStatsSnapshot {
    pub staged: u64,
    pub emitted: u64,
    pub misses: u64,
    pub over_age_drops: u64,
    pub replaced_drops: u64,
    pub header_errors: u64,
    pub arrived: u64,
}

impl TtPortStats {
    pub fn snapshot(&self) -> TtPortStatsSnapshot {
        TtPortStatsSnapshot {
            staged: self.staged.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            over_age_drops: self.over_age_drops.load(Ordering::Relaxed),
            replaced_drops: self.replaced_drops.load(Ordering::Relaxed),
            header_errors: self.header_errors.load(Ordering::Relaxed),
            arrived: self.arrived.load(Ordering::Relaxed),
        }
    }
}

/// A frame waiting in its flow's slot for the next send instant, together
///  with the time it was captured. The timer refuses frames older than one
///  macro period.
pub(crate) struct StagedFrame {
    pub frame: Frame,
    pub captured_at: u64,
}

/// One staging slot per possible flow id. Each slot has a single writer (the
///  ingress path) and a single consumer (the timer, which exchanges the slot
///  to empty), so the per-slot locks are never contended for long.
pub(crate) struct StagingSlots {
    slots: Box<[Mutex<Option<StagedFrame>>]>,
}

impl StagingSlots {
    pub(crate) fn new() -> StagingSlots {
        StagingSlots {
            slots: (0..=u16::MAX as usize).map(|_| Mutex::new(None)).collect(),
        }
    }

    /// Stage a frame, returning the frame it replaced if the slot was full.
    pub fn stage(&self, flow_id: u16, staged: StagedFrame) -> Option<StagedFrame> {
        self.slots[flow_id as usize].lock().unwrap().replace(staged)
    }

    pub fn take(&self, flow_id: u16) -> Option<StagedFrame> {
        self.slots[flow_id as usize].lock().unwrap().take()
    }
}

/// Per-port time-triggered state: the send and arrive tables, the send cache
///  of the running schedule, the staging slots, and the schedule timer.
///
/// Table mutation, schedule start and cancel serialize on the port mutex;
/// the dataplane and the timer only ever read through the RCU cells.
pub struct TtPort {
    port_no: u32,
    config: Arc<TtConfig>,
    clock: Arc<dyn TtClock>,
    sender: Arc<dyn FrameSender>,
    mutation: tokio::sync::Mutex<()>,
    pub(crate) send_table: RcuCell<FlowTable>,
    pub(crate) arrive_table: RcuCell<FlowTable>,
    send_info: Arc<RcuCell<SendInfo>>,
    timer: ScheduleTimer,
    pub(crate) staging: Arc<StagingSlots>,
    pub(crate) stats: Arc<TtPortStats>,
}

impl TtPort {
    pub(crate) fn new(
        port_no: u32,
        config: Arc<TtConfig>,
        clock: Arc<dyn TtClock>,
        sender: Arc<dyn FrameSender>,
    ) -> TtPort {
        TtPort {
            port_no,
            config,
            clock,
            sender,
            mutation: tokio::sync::Mutex::new(()),
            send_table: RcuCell::empty(),
            arrive_table: RcuCell::empty(),
            send_info: Arc::new(RcuCell::empty()),
            timer: ScheduleTimer::new(),
            staging: Arc::new(StagingSlots::new()),
            stats: Arc::new(TtPortStats::default()),
        }
    }

    pub fn port_no(&self) -> u32 {
        self.port_no
    }

    async fn insert_into(&self, cell: &RcuCell<FlowTable>, entry: FlowEntry) {
        let _mutation = self.mutation.lock().await;
        let guard = rcu::pin();

        let next = match cell.read(&guard) {
            Some(table) => table.insert(entry, self.config.min_table_capacity),
            None => FlowTable::new(self.config.min_table_capacity)
                .insert(entry, self.config.min_table_capacity),
        };
        cell.replace(Some(Box::new(next)));
    }

    async fn delete_from(&self, cell: &RcuCell<FlowTable>, flow_id: u16) {
        let _mutation = self.mutation.lock().await;
        let guard = rcu::pin();

        if let Some(table) = cell.read(&guard) {
            cell.replace(Some(Box::new(
                table.delete(flow_id, self.config.min_table_capacity),
            )));
        }
    }

    pub async fn insert_send(&self, entry: FlowEntry) {
        self.insert_into(&self.send_table, entry).await
    }

    pub async fn insert_arrive(&self, entry: FlowEntry) {
        self.insert_into(&self.arrive_table, entry).await
    }

    pub async fn delete_send(&self, flow_id: u16) {
        self.delete_from(&self.send_table, flow_id).await
    }

    pub async fn delete_arrive(&self, flow_id: u16) {
        self.delete_from(&self.arrive_table, flow_id).await
    }

    pub fn lookup_send(&self, flow_id: u16) -> Option<FlowEntry> {
        let guard = rcu::pin();
        self.send_table
            .read(&guard)
            .and_then(|table| table.lookup(flow_id))
            .copied()
    }

    pub fn lookup_arrive(&self, flow_id: u16) -> Option<FlowEntry> {
        let guard = rcu::pin();
        self.arrive_table
            .read(&guard)
            .and_then(|table| table.lookup(flow_id))
            .copied()
    }

    pub fn send_snapshot(&self) -> Vec<FlowEntry> {
        let guard = rcu::pin();
        self.send_table
            .read(&guard)
            .map(FlowTable::snapshot)
            .unwrap_or_default()
    }

    pub fn arrive_snapshot(&self) -> Vec<FlowEntry> {
        let guard = rcu::pin();
        self.arrive_table
            .read(&guard)
            .map(FlowTable::snapshot)
            .unwrap_or_default()
    }

    /// Drop the send table together with the send info built from it.
    pub async fn drop_send_table(&self) {
        let _mutation = self.mutation.lock().await;
        self.send_table.replace(None);
        self.send_info.replace(None);
    }

    pub async fn drop_arrive_table(&self) {
        let _mutation = self.mutation.lock().await;
        self.arrive_table.replace(None);
    }

    /// Build the send cache from the current send table and arm the timer.
    ///  Any running schedule is cancelled first; on failure the port stays
    ///  idle.
    pub async fn start(&self) -> Result<(), TtError> {
        let _mutation = self.mutation.lock().await;
        self.timer.cancel().await;

        let advance_time = self
            .config
            .effective_advance_time(self.port_no)
            .as_nanos() as u64;

        let first_deadline = {
            let guard = rcu::pin();
            let table = self
                .send_table
                .read(&guard)
                .ok_or(TtError::NothingToSchedule)?;
            let cache = SendCache::build(table)?;
            let macro_period = cache.macro_period();

            self.send_info.replace(Some(Box::new(SendInfo {
                cache,
                advance_time,
            })));

            // first fire at the next macro period boundary of the global
            // timebase, pre-armed by the advance slack
            let to_boundary = macro_period - self.clock.global_time() % macro_period;
            (self.clock.wall_now() + to_boundary).saturating_sub(advance_time)
        };

        info!("port {}: starting time-triggered schedule", self.port_no);
        let ctx = TimerContext {
            port_no: self.port_no,
            clock: self.clock.clone(),
            sender: self.sender.clone(),
            send_info: self.send_info.clone(),
            staging: self.staging.clone(),
            stats: self.stats.clone(),
            active: self.timer.active_flag(),
        };
        self.timer.arm(ctx, first_deadline).await;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.timer.is_running()
    }

    pub async fn cancel_schedule(&self) {
        let _mutation = self.mutation.lock().await;
        self.timer.cancel().await;
    }

    /// Tear the port's schedule state down: cancel the timer and retire the
    ///  tables and send info.
    pub async fn finish(&self) {
        let _mutation = self.mutation.lock().await;
        self.timer.cancel().await;
        self.send_info.replace(None);
        self.send_table.replace(None);
        self.arrive_table.replace(None);
        debug!("port {}: schedule state retired", self.port_no);
    }

    /// Put a frame into its flow's staging slot, to be emitted at the flow's
    ///  next instant. A frame already waiting there is superseded.
    pub(crate) fn stage_frame(&self, flow_id: u16, frame: Frame) {
        let staged = StagedFrame {
            frame,
            captured_at: self.clock.wall_now(),
        };
        if self.staging.stage(flow_id, staged).is_some() {
            self.stats.replaced_drops.fetch_add(1, Ordering::Relaxed);
            debug!(
                "port {}: superseded a staged frame of flow {}",
                self.port_no, flow_id
            );
        }
        self.stats.staged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> TtPortStatsSnapshot {
        self.stats.snapshot()
    }
}
