use crate::clock::TtClock;
use crate::port::{FrameSender, StagingSlots, TtPortStats};
use crate::rcu::{self, RcuCell};
use crate::send_cache::SendInfo;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Everything one port's timer task reads on its tick path. All of it is
///  shared with the owning port, so a restart replaces the send info while a
///  tick in flight still sees the old one.
pub(crate) struct TimerContext {
    pub port_no: u32,
    pub clock: Arc<dyn TtClock>,
    pub sender: Arc<dyn FrameSender>,
    pub send_info: Arc<RcuCell<SendInfo>>,
    pub staging: Arc<StagingSlots>,
    pub stats: Arc<TtPortStats>,
    pub active: Arc<AtomicBool>,
}

/// The per-port schedule timer: idle until armed, then ticking through the
///  send cache until cancelled.
pub(crate) struct ScheduleTimer {
    active: Arc<AtomicBool>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ScheduleTimer {
    pub fn new() -> ScheduleTimer {
        ScheduleTimer {
            active: Arc::new(AtomicBool::new(false)),
            task: tokio::sync::Mutex::new(None),
        }
    }

    pub fn active_flag(&self) -> Arc<AtomicBool> {
        self.active.clone()
    }

    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Arm the timer with a freshly built context. Any previous task is
    ///  cancelled first.
    pub async fn arm(&self, ctx: TimerContext, first_deadline: u64) {
        self.cancel().await;
        self.active.store(true, Ordering::Release);
        let handle = tokio::spawn(run_schedule_loop(ctx, first_deadline));
        *self.task.lock().await = Some(handle);
    }

    /// Synchronous, idempotent cancel: clears the active flag and waits until
    ///  the tick handler is no longer executing. A tick is only ever
    ///  interrupted between handler runs, never in the middle of one.
    pub async fn cancel(&self) {
        self.active.store(false, Ordering::Release);
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }
}

async fn run_schedule_loop(ctx: TimerContext, first_deadline: u64) {
    debug!("port {}: schedule timer armed", ctx.port_no);

    let mut deadline = first_deadline;
    loop {
        sleep_until_wall(ctx.clock.as_ref(), deadline).await;
        if !ctx.active.load(Ordering::Acquire) {
            break;
        }
        match tick(&ctx) {
            Some(wait) => deadline = ctx.clock.wall_now() + wait,
            None => {
                debug!("port {}: send schedule is gone, stopping timer", ctx.port_no);
                break;
            }
        }
        if !ctx.active.load(Ordering::Acquire) {
            break;
        }
    }

    debug!("port {}: schedule timer stopped", ctx.port_no);
}

async fn sleep_until_wall(clock: &dyn TtClock, deadline: u64) {
    let now = clock.wall_now();
    if deadline > now {
        tokio::time::sleep(Duration::from_nanos(deadline - now)).await;
    }
}

/// One timer expiry. Returns how long to wait before the next tick, or
///  `None` if there is no send info anymore.
fn tick(ctx: &TimerContext) -> Option<u64> {
    let guard = rcu::pin();
    let info = ctx.send_info.read(&guard)?;
    let cache = &info.cache;

    let fire = cache.next(ctx.clock.global_time());
    let send_time = ctx.clock.wall_now() + fire.offset_to_instant;

    let mut wait = fire.wait;
    if wait == 0 {
        // two flows share this instant; bias the next tick past the collision
        wait = fire.offset_to_instant + info.advance_time;
    }

    // the slot is consumed regardless of whether the frame can still be sent
    let staged = ctx.staging.take(fire.flow_id);

    let mut now = ctx.clock.wall_now();
    if send_time < now {
        ctx.stats.misses.fetch_add(1, Ordering::Relaxed);
        warn!(
            "port {}: missed send instant of flow {} by {}ns",
            ctx.port_no,
            fire.flow_id,
            now - send_time
        );
        return Some(wait);
    }

    // the timer fired `advance_time` early; spin away the remaining slack to
    // align the emission more tightly than the timer can
    while send_time > now && send_time - now > info.advance_time {
        std::hint::spin_loop();
        now = ctx.clock.wall_now();
    }

    if let Some(staged) = staged {
        if now.saturating_sub(staged.captured_at) <= cache.macro_period() {
            trace!("port {}: emitting flow {}", ctx.port_no, fire.flow_id);
            ctx.stats.emitted.fetch_add(1, Ordering::Relaxed);
            ctx.sender.send_frame(ctx.port_no, staged.frame);
        } else {
            ctx.stats.over_age_drops.fetch_add(1, Ordering::Relaxed);
            debug!(
                "port {}: dropping over age frame of flow {}",
                ctx.port_no, fire.flow_id
            );
        }
    }

    Some(wait)
}
