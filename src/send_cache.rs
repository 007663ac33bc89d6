use crate::error::TtError;
use crate::flow_table::FlowTable;
use tracing::{info, warn};

/// The dispatcher's output for one port: every transmission instant of one
/// macro period, sorted ascending, as two parallel arrays. `times[i]` is the
/// fire time of `flow_ids[i]` as an offset into the macro period.
pub struct SendCache {
    macro_period: u64,
    times: Vec<u64>,
    flow_ids: Vec<u16>,
    collisions: usize,
}

/// What the timer handler needs for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextFire {
    /// nanoseconds from the current instant to the one after it
    pub wait: u64,
    /// flow scheduled at the current instant
    pub flow_id: u16,
    /// nanoseconds until the next occurrence of the current instant
    pub offset_to_instant: u64,
}

/// A send cache paired with the pre-arm slack it was installed with. This is
///  the unit of wholesale replacement when a schedule is (re)started.
pub struct SendInfo {
    pub cache: SendCache,
    /// pre-arm slack in nanoseconds
    pub advance_time: u64,
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

fn lcm(a: u64, b: u64) -> u64 {
    a / gcd(a, b) * b
}

impl SendCache {
    /// Expand a send table into the sorted firing timeline of one macro
    ///  period.
    ///
    /// Coinciding instants are reported as collisions and the schedule is
    /// still installed; the colliding flows interfere but everything else
    /// keeps its slot.
    pub fn build(table: &FlowTable) -> Result<SendCache, TtError> {
        let entries: Vec<_> = table
            .iter()
            .filter(|entry| {
                let valid = entry.period > 0 && entry.offset < entry.period;
                if !valid {
                    warn!(
                        "ignoring unschedulable flow {}: period {}ns, offset {}ns",
                        entry.flow_id, entry.period, entry.offset
                    );
                }
                valid
            })
            .collect();
        if entries.is_empty() {
            return Err(TtError::NothingToSchedule);
        }

        let macro_period = entries.iter().fold(1, |acc, entry| lcm(acc, entry.period));

        let size: u64 = entries.iter().map(|entry| macro_period / entry.period).sum();

        let mut instants = Vec::with_capacity(size as usize);
        for entry in &entries {
            let mut offset = entry.offset;
            while offset < macro_period {
                instants.push((offset, entry.flow_id));
                offset += entry.period;
            }
        }
        instants.sort_unstable();

        info!(
            "built send schedule: macro period {}ns, {} instants",
            macro_period,
            instants.len()
        );

        let mut collisions = 0;
        for window in instants.windows(2) {
            let ((earlier, first_flow), (later, second_flow)) = (window[0], window[1]);
            if later <= earlier {
                collisions += 1;
                warn!(
                    "collision at instant {}ns between flows {} and {}",
                    later, first_flow, second_flow
                );
            }
        }

        let (times, flow_ids) = instants.into_iter().unzip();
        Ok(SendCache {
            macro_period,
            times,
            flow_ids,
            collisions,
        })
    }

    pub fn macro_period(&self) -> u64 {
        self.macro_period
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn times(&self) -> &[u64] {
        &self.times
    }

    pub fn flow_ids(&self) -> &[u16] {
        &self.flow_ids
    }

    pub fn collisions(&self) -> usize {
        self.collisions
    }

    /// The instant at or before `mod_time`: the greatest `i` with
    ///  `times[i] <= mod_time`, wrapping to the last instant of the previous
    ///  cycle if `mod_time` precedes every instant.
    fn slot_index(&self, mod_time: u64) -> usize {
        let insertion = self.times.partition_point(|&t| t <= mod_time);
        if insertion == 0 {
            self.times.len() - 1
        } else {
            insertion - 1
        }
    }

    /// Resolve `global_time` against the timeline.
    pub fn next(&self, global_time: u64) -> NextFire {
        let mod_time = global_time % self.macro_period;

        let idx = self.slot_index(mod_time);
        let next_idx = (idx + 1) % self.len();

        let wait = if next_idx == 0 {
            self.times[next_idx] + self.macro_period - self.times[idx]
        } else {
            self.times[next_idx] - self.times[idx]
        };

        // distance to the next occurrence of instant idx, wrapping into the
        // next macro period when it already passed in this one
        let offset_to_instant = if mod_time > self.times[idx] {
            self.macro_period - mod_time + self.times[idx]
        } else {
            self.times[idx] - mod_time
        };

        NextFire {
            wait,
            flow_id: self.flow_ids[idx],
            offset_to_instant,
        }
    }
}
