//! Time-triggered send scheduling for a software switch datapath.
//!
//! A controller installs, per port, a table of flows that must leave the
//! switch at fixed periodic instants. The instants of all flows on a port are
//! expanded over the *macro period* (the least common multiple of the flow
//! periods) into a sorted timeline, and a high resolution timer walks that
//! timeline forever, emitting the staged frame of each flow at its exact
//! instant. Frames reach the staging slots through the dataplane
//! classification entry points; everything that is not time-triggered passes
//! through untouched.
//!
//! ## Design goals
//!
//! * Deterministic transmission: a flow's frames leave at
//!   `offset + k * period` of the globally aligned timebase, not "as soon as
//!   possible". TT is lossy by design: a frame that misses its instant, or
//!   that waits longer than one macro period, is dropped rather than sent
//!   late.
//! * The tick path takes no locks against the control plane. Tables and the
//!   send cache are published through epoch protected cells, so control
//!   plane reconfiguration never stalls a tick and a tick never observes a
//!   half updated table.
//! * Alignment beyond timer resolution: the timer is armed `advance_time`
//!   early and the handler busy waits the rest, re-reading the clock in a
//!   tight loop.
//! * Each port schedules independently. There is no cross port coordination
//!   and no retransmission.
//!
//! ## TT frame format
//!
//! A TT frame is an Ethernet frame with the TT EtherType, carrying a compact
//! header between the MAC header and the original payload:
//!
//! ```ascii
//! 0: flow id (u16 BE)
//! 2: length  (u16 BE) - frame length before the TT header was pushed,
//!     excluding the FCS
//! 4: original payload (the IPv4 packet of the TRDP datagram)
//! ```
//!
//! ## TRDP encapsulation
//!
//! Flows enter and leave the TT domain as TRDP process data: IPv4 UDP
//! datagrams on a fixed destination port, whose payload starts with the
//! flow id:
//!
//! ```ascii
//! 0: flow id (u16 BE)
//! 2: TRDP payload
//! ```
//!
//! On the way onto a scheduled port the TT header is pushed (the EtherType
//! switches to TT); on arrival at the terminating switch it is popped and
//! the original datagram handed to delivery.
//!
//! ## Control plane
//!
//! The wire encoding of the controller exchange lives outside this crate;
//! the core consumes decoded records ([`control::TtControlMsg`]). A table is
//! assembled in a session: the controller announces how many entries follow,
//! streams them, and the commit is refused until exactly that many arrived.
//! Committed entries route to their port's send or arrive table, and
//! [`datapath::Datapath::start_schedule`] builds the timeline and arms the
//! timer.

pub mod clock;
pub mod config;
pub mod control;
pub mod datapath;
pub mod error;
pub mod flow_table;
pub mod frame;
pub mod port;
pub mod rcu;
pub mod send_cache;
mod timer;
pub mod tt_header;

pub use clock::{SystemClock, TtClock};
pub use config::TtConfig;
pub use datapath::{Datapath, EgressVerdict, IngressVerdict};
pub use error::TtError;
pub use flow_table::{FlowEntry, FlowTable};
pub use frame::Frame;
pub use port::{FrameSender, TtPort};

#[cfg(test)]
mod tests {
    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init()
            .ok();
    }
}
