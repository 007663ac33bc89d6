use crate::clock::TtClock;
use crate::config::TtConfig;
use crate::control::{
    FlowDirection, SessionState, TtControlMsg, TtControlReply, TtFlowCtrl, TtFlowCtrlKind,
    TtSession,
};
use crate::error::TtError;
use crate::flow_table::FlowEntry;
use crate::frame::Frame;
use crate::port::{FrameSender, TtPort};
use crate::rcu::{self, RcuCell};
use crate::tt_header::{self, FrameClass, TtHeader};
use rustc_hash::FxHashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// What the classification stage decided about a received frame.
#[derive(Debug, PartialEq, Eq)]
pub enum IngressVerdict {
    /// The frame terminates at this switch: its TT header was stripped and
    ///  the inner TRDP datagram is handed to local delivery.
    Deliver(Frame),
    /// Normal forwarding continues with this frame.
    Forward(Frame),
    /// The frame was malformed and has been dropped.
    Dropped,
}

/// What happened to a frame handed to a port for transmission.
#[derive(Debug, PartialEq, Eq)]
pub enum EgressVerdict {
    /// The frame belongs to a scheduled flow and now waits in its staging
    ///  slot for the flow's next instant.
    Staged,
    /// The frame is not time-triggered on this port; send it immediately.
    SendNow(Frame),
    /// The frame was malformed and has been dropped.
    Dropped,
}

/// The switch-level assembly: the port registry, the classification entry
///  points of the dataplane, and the control plane surface.
pub struct Datapath {
    config: Arc<TtConfig>,
    clock: Arc<dyn TtClock>,
    sender: Arc<dyn FrameSender>,
    ports: RcuCell<FxHashMap<u32, Arc<TtPort>>>,
    /// serializes registry mutation; lookups go through the RCU cell
    ports_write: std::sync::Mutex<()>,
    session: Mutex<Option<TtSession>>,
}

impl Datapath {
    pub fn new(
        config: TtConfig,
        clock: Arc<dyn TtClock>,
        sender: Arc<dyn FrameSender>,
    ) -> anyhow::Result<Datapath> {
        config.validate()?;
        Ok(Datapath {
            config: Arc::new(config),
            clock,
            sender,
            ports: RcuCell::empty(),
            ports_write: std::sync::Mutex::new(()),
            session: Mutex::new(None),
        })
    }

    /// Register a port. Idempotent: re-adding a known port number returns
    ///  the existing port.
    pub fn add_port(&self, port_no: u32) -> Arc<TtPort> {
        let _write = self.ports_write.lock().unwrap();
        let guard = rcu::pin();

        let mut map = self
            .ports
            .read(&guard)
            .cloned()
            .unwrap_or_default();
        if let Some(existing) = map.get(&port_no) {
            return existing.clone();
        }

        info!("adding port {}", port_no);
        let port = Arc::new(TtPort::new(
            port_no,
            self.config.clone(),
            self.clock.clone(),
            self.sender.clone(),
        ));
        map.insert(port_no, port.clone());
        self.ports.replace(Some(Box::new(map)));
        port
    }

    /// Unregister a port, cancelling its schedule and retiring its state.
    pub async fn remove_port(&self, port_no: u32) {
        let removed = {
            let _write = self.ports_write.lock().unwrap();
            let guard = rcu::pin();

            let mut map = self
                .ports
                .read(&guard)
                .cloned()
                .unwrap_or_default();
            let removed = map.remove(&port_no);
            self.ports.replace(Some(Box::new(map)));
            removed
        };

        if let Some(port) = removed {
            info!("removing port {}", port_no);
            port.finish().await;
        }
    }

    pub fn port(&self, port_no: u32) -> Option<Arc<TtPort>> {
        let guard = rcu::pin();
        self.ports
            .read(&guard)
            .and_then(|map| map.get(&port_no))
            .cloned()
    }

    /// Classify a received frame. TT frames whose flow is expected on this
    ///  port (arrive table hit) terminate here and are stripped back to
    ///  their TRDP form; everything else continues through normal
    ///  forwarding. Never blocks, never mutates tables.
    pub fn ingress(&self, port_no: u32, frame: Frame) -> IngressVerdict {
        let Some(port) = self.port(port_no) else {
            return IngressVerdict::Forward(frame);
        };

        match tt_header::classify(&frame, &self.config) {
            FrameClass::TtNative => {
                let Some(header) = TtHeader::parse(&frame) else {
                    port.stats.header_errors.fetch_add(1, Ordering::Relaxed);
                    return IngressVerdict::Dropped;
                };
                if port.lookup_arrive(header.flow_id).is_none() {
                    return IngressVerdict::Forward(frame);
                }

                port.stats.arrived.fetch_add(1, Ordering::Relaxed);
                let mut frame = frame;
                match tt_header::pop_tt(&mut frame) {
                    Ok(()) => IngressVerdict::Deliver(frame),
                    Err(error) => {
                        debug!("port {}: dropping TT frame, {}", port_no, error);
                        port.stats.header_errors.fetch_add(1, Ordering::Relaxed);
                        IngressVerdict::Dropped
                    }
                }
            }
            FrameClass::TrdpOverUdp | FrameClass::Other => IngressVerdict::Forward(frame),
        }
    }

    /// Hand a frame to a port for transmission. Frames of scheduled flows
    ///  are staged for their next instant instead of leaving immediately;
    ///  TRDP datagrams get the TT header pushed on the way into the slot.
    pub fn egress(&self, port_no: u32, frame: Frame) -> EgressVerdict {
        let Some(port) = self.port(port_no) else {
            return EgressVerdict::SendNow(frame);
        };

        match tt_header::classify(&frame, &self.config) {
            FrameClass::TrdpOverUdp => {
                let Some(flow_id) = tt_header::trdp_flow_id(&frame) else {
                    port.stats.header_errors.fetch_add(1, Ordering::Relaxed);
                    return EgressVerdict::Dropped;
                };
                if port.lookup_send(flow_id).is_none() {
                    return EgressVerdict::SendNow(frame);
                }

                let mut frame = frame;
                match tt_header::push_tt(&mut frame, flow_id, &self.config) {
                    Ok(()) => {
                        port.stage_frame(flow_id, frame);
                        EgressVerdict::Staged
                    }
                    Err(error) => {
                        debug!("port {}: dropping TRDP frame, {}", port_no, error);
                        port.stats.header_errors.fetch_add(1, Ordering::Relaxed);
                        EgressVerdict::Dropped
                    }
                }
            }
            FrameClass::TtNative => {
                let Some(header) = TtHeader::parse(&frame) else {
                    port.stats.header_errors.fetch_add(1, Ordering::Relaxed);
                    return EgressVerdict::Dropped;
                };
                if port.lookup_send(header.flow_id).is_none() {
                    return EgressVerdict::SendNow(frame);
                }
                port.stage_frame(header.flow_id, frame);
                EgressVerdict::Staged
            }
            FrameClass::Other => EgressVerdict::SendNow(frame),
        }
    }

    /// Open a table assembly session announcing `expected` entries. Fails if
    ///  a mutable session is already open.
    pub async fn begin_add(&self, expected: u32) -> Result<(), TtError> {
        let mut session = self.session.lock().await;
        if matches!(&*session, Some(open) if open.state() == SessionState::Mutable) {
            return Err(TtError::WrongState);
        }
        *session = Some(TtSession::begin(expected, self.config.max_flows)?);
        debug!("table assembly session opened, expecting {} entries", expected);
        Ok(())
    }

    pub async fn add_entry(&self, record: crate::control::TtFlowMod) -> Result<(), TtError> {
        match self.session.lock().await.as_mut() {
            None => Err(TtError::NoSession),
            Some(session) => session.add_entry(record),
        }
    }

    /// Commit the open session. Each record becomes visible in its port's
    ///  table as it is applied; the commit is not atomic across records.
    pub async fn end_add(&self) -> Result<(), TtError> {
        let records = match self.session.lock().await.as_mut() {
            None => return Err(TtError::NoSession),
            Some(session) => session.end()?,
        };

        for record in records {
            let Some(port) = self.port(record.port_no) else {
                warn!(
                    "skipping flow {}: no port {}",
                    record.flow_id, record.port_no
                );
                continue;
            };

            let entry = record.to_entry();
            match record.direction {
                FlowDirection::Send => port.insert_send(entry).await,
                FlowDirection::Arrive => port.insert_arrive(entry).await,
            }
        }
        Ok(())
    }

    /// Drop all entries of one direction on one port.
    pub async fn clear(&self, port_no: u32, direction: FlowDirection) {
        if let Some(port) = self.port(port_no) {
            match direction {
                FlowDirection::Send => port.drop_send_table().await,
                FlowDirection::Arrive => port.drop_arrive_table().await,
            }
        }
    }

    /// A snapshot copy of the entries of one direction on one port.
    pub fn query(&self, port_no: u32, direction: FlowDirection) -> Vec<FlowEntry> {
        match self.port(port_no) {
            None => Vec::new(),
            Some(port) => match direction {
                FlowDirection::Send => port.send_snapshot(),
                FlowDirection::Arrive => port.arrive_snapshot(),
            },
        }
    }

    /// Build and arm the schedule of a port from its committed send table.
    pub async fn start_schedule(&self, port_no: u32) -> Result<(), TtError> {
        match self.port(port_no) {
            None => Err(TtError::NothingToSchedule),
            Some(port) => port.start().await,
        }
    }

    /// Single entry point for decoded control messages, producing the
    ///  decoded reply record for the (external) encoder.
    pub async fn handle_control(&self, msg: TtControlMsg) -> Result<TtControlReply, TtError> {
        debug!("control message: {:?}", msg.request_kind());
        match msg {
            TtControlMsg::BeginAdd { table_id, expected } => {
                self.begin_add(expected).await?;
                Ok(reply(table_id, TtFlowCtrlKind::AddReply, Vec::new()))
            }
            TtControlMsg::AddEntry(record) => {
                let table_id = record.table_id;
                self.add_entry(record).await?;
                Ok(reply(table_id, TtFlowCtrlKind::AddReply, Vec::new()))
            }
            TtControlMsg::EndAdd { table_id } => {
                self.end_add().await?;
                Ok(reply(table_id, TtFlowCtrlKind::AddReply, Vec::new()))
            }
            TtControlMsg::Clear {
                table_id,
                port_no,
                direction,
            } => {
                self.clear(port_no, direction).await;
                Ok(reply(table_id, TtFlowCtrlKind::DeleteReply, Vec::new()))
            }
            TtControlMsg::Query {
                table_id,
                port_no,
                direction,
            } => Ok(reply(
                table_id,
                TtFlowCtrlKind::QueryReply,
                self.query(port_no, direction),
            )),
        }
    }
}

fn reply(table_id: u8, kind: TtFlowCtrlKind, entries: Vec<FlowEntry>) -> TtControlReply {
    TtControlReply {
        ctrl: TtFlowCtrl { table_id, kind },
        entries,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::control::TtFlowMod;
    use crate::port::MockFrameSender;
    use crate::tt_header::tests::udp_frame;

    fn datapath() -> Datapath {
        let mut sender = MockFrameSender::new();
        sender.expect_send_frame().returning(|_, _| ());
        Datapath::new(
            TtConfig::default_trdp(),
            Arc::new(SystemClock::new()),
            Arc::new(sender),
        )
        .unwrap()
    }

    fn record(port_no: u32, direction: FlowDirection, flow_id: u32) -> TtFlowMod {
        TtFlowMod {
            table_id: 0,
            metadata: 0,
            port_no,
            direction,
            flow_id,
            offset: 100,
            period: 1_000_000,
            buffer_id: 0,
            packet_size: 64,
            execute_time: 0,
        }
    }

    #[tokio::test]
    async fn test_add_port_is_idempotent() {
        let datapath = datapath();
        let first = datapath.add_port(3);
        let second = datapath.add_port(3);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_remove_port_stops_lookup() {
        let datapath = datapath();
        datapath.add_port(3);
        assert!(datapath.port(3).is_some());

        datapath.remove_port(3).await;
        assert!(datapath.port(3).is_none());
    }

    #[tokio::test]
    async fn test_commit_routes_by_port_and_direction() {
        let datapath = datapath();
        datapath.add_port(1);
        datapath.add_port(2);

        datapath.begin_add(3).await.unwrap();
        datapath
            .add_entry(record(1, FlowDirection::Send, 10))
            .await
            .unwrap();
        datapath
            .add_entry(record(1, FlowDirection::Arrive, 11))
            .await
            .unwrap();
        datapath
            .add_entry(record(2, FlowDirection::Send, 12))
            .await
            .unwrap();
        datapath.end_add().await.unwrap();

        assert_eq!(datapath.port(1).unwrap().lookup_send(10).map(|e| e.flow_id), Some(10));
        assert_eq!(datapath.port(1).unwrap().lookup_arrive(11).map(|e| e.flow_id), Some(11));
        assert_eq!(datapath.port(2).unwrap().lookup_send(12).map(|e| e.flow_id), Some(12));
        assert_eq!(datapath.port(2).unwrap().lookup_send(10), None);
    }

    #[tokio::test]
    async fn test_incomplete_commit_keeps_session_mutable() {
        let datapath = datapath();
        datapath.add_port(1);

        datapath.begin_add(3).await.unwrap();
        datapath
            .add_entry(record(1, FlowDirection::Send, 0))
            .await
            .unwrap();
        datapath
            .add_entry(record(1, FlowDirection::Send, 1))
            .await
            .unwrap();

        assert_eq!(
            datapath.end_add().await,
            Err(TtError::Incomplete {
                expected: 3,
                received: 2
            })
        );
        // another session cannot open while this one is still mutable
        assert_eq!(datapath.begin_add(1).await, Err(TtError::WrongState));

        // nothing was committed
        assert_eq!(datapath.query(1, FlowDirection::Send), Vec::new());
    }

    #[tokio::test]
    async fn test_entry_without_session() {
        let datapath = datapath();
        assert_eq!(
            datapath.add_entry(record(1, FlowDirection::Send, 0)).await,
            Err(TtError::NoSession)
        );
        assert_eq!(datapath.end_add().await, Err(TtError::NoSession));
    }

    #[tokio::test]
    async fn test_begin_add_over_limit() {
        let datapath = datapath();
        assert_eq!(datapath.begin_add(256).await, Err(TtError::TooMany));
        // the failed announcement leaves no session behind
        assert_eq!(
            datapath.add_entry(record(1, FlowDirection::Send, 0)).await,
            Err(TtError::NoSession)
        );
    }

    #[tokio::test]
    async fn test_commit_skips_unknown_port() {
        let datapath = datapath();
        datapath.add_port(1);

        datapath.begin_add(2).await.unwrap();
        datapath
            .add_entry(record(1, FlowDirection::Send, 0))
            .await
            .unwrap();
        datapath
            .add_entry(record(99, FlowDirection::Send, 1))
            .await
            .unwrap();
        datapath.end_add().await.unwrap();

        assert_eq!(datapath.query(1, FlowDirection::Send).len(), 1);
    }

    #[tokio::test]
    async fn test_clear_and_query() {
        let datapath = datapath();
        datapath.add_port(1);

        datapath.begin_add(2).await.unwrap();
        datapath
            .add_entry(record(1, FlowDirection::Send, 0))
            .await
            .unwrap();
        datapath
            .add_entry(record(1, FlowDirection::Send, 1))
            .await
            .unwrap();
        datapath.end_add().await.unwrap();

        let entries = datapath.query(1, FlowDirection::Send);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].period, 1_000_000);

        datapath.clear(1, FlowDirection::Send).await;
        assert_eq!(datapath.query(1, FlowDirection::Send), Vec::new());
    }

    #[tokio::test]
    async fn test_handle_control_replies() {
        let datapath = datapath();
        datapath.add_port(1);

        let reply = datapath
            .handle_control(TtControlMsg::BeginAdd { table_id: 7, expected: 1 })
            .await
            .unwrap();
        assert_eq!(reply.ctrl, TtFlowCtrl { table_id: 7, kind: TtFlowCtrlKind::AddReply });

        datapath
            .handle_control(TtControlMsg::AddEntry(record(1, FlowDirection::Send, 4)))
            .await
            .unwrap();
        datapath
            .handle_control(TtControlMsg::EndAdd { table_id: 7 })
            .await
            .unwrap();

        let reply = datapath
            .handle_control(TtControlMsg::Query {
                table_id: 7,
                port_no: 1,
                direction: FlowDirection::Send,
            })
            .await
            .unwrap();
        assert_eq!(reply.ctrl.kind, TtFlowCtrlKind::QueryReply);
        assert_eq!(reply.entries.len(), 1);
        assert_eq!(reply.entries[0].flow_id, 4);

        let reply = datapath
            .handle_control(TtControlMsg::Clear {
                table_id: 7,
                port_no: 1,
                direction: FlowDirection::Send,
            })
            .await
            .unwrap();
        assert_eq!(reply.ctrl.kind, TtFlowCtrlKind::DeleteReply);
        assert_eq!(datapath.query(1, FlowDirection::Send), Vec::new());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_start_schedule_arms_and_remove_port_cancels() {
        let datapath = datapath();
        assert_eq!(
            datapath.start_schedule(1).await,
            Err(TtError::NothingToSchedule)
        );

        let port = datapath.add_port(1);
        datapath.begin_add(1).await.unwrap();
        datapath
            .add_entry(record(1, FlowDirection::Send, 0))
            .await
            .unwrap();
        datapath.end_add().await.unwrap();

        datapath.start_schedule(1).await.unwrap();
        assert!(port.is_running());

        datapath.remove_port(1).await;
        assert!(!port.is_running());
    }

    #[tokio::test]
    async fn test_egress_stages_trdp_frame_of_scheduled_flow() {
        let datapath = datapath();
        let port = datapath.add_port(1);

        datapath.begin_add(1).await.unwrap();
        datapath
            .add_entry(record(1, FlowDirection::Send, 7))
            .await
            .unwrap();
        datapath.end_add().await.unwrap();

        let frame = udp_frame(17224, &[0x00, 0x07], 64);
        assert_eq!(datapath.egress(1, frame), EgressVerdict::Staged);
        assert_eq!(port.stats().staged, 1);

        // the staged frame now carries the TT header
        let staged = port.staging.take(7).unwrap();
        assert_eq!(
            tt_header::classify(&staged.frame, &TtConfig::default_trdp()),
            FrameClass::TtNative
        );
    }

    #[tokio::test]
    async fn test_egress_passes_unscheduled_frames_through() {
        let datapath = datapath();
        datapath.add_port(1);

        // TRDP frame of a flow with no send entry
        let frame = udp_frame(17224, &[0x00, 0x09], 64);
        assert!(matches!(
            datapath.egress(1, frame),
            EgressVerdict::SendNow(_)
        ));

        // frame that is not TT at all
        let frame = Frame::from_ethernet(&[0u8; 64]);
        assert!(matches!(
            datapath.egress(1, frame),
            EgressVerdict::SendNow(_)
        ));
    }

    #[tokio::test]
    async fn test_ingress_delivers_expected_tt_frame() {
        let datapath = datapath();
        datapath.add_port(1);

        datapath.begin_add(1).await.unwrap();
        datapath
            .add_entry(record(1, FlowDirection::Arrive, 7))
            .await
            .unwrap();
        datapath.end_add().await.unwrap();

        // a TRDP frame as it looked before the sending switch pushed the
        // TT header
        let config = TtConfig::default_trdp();
        let original = udp_frame(17224, &[0x00, 0x07], 64);
        let mut tt_frame = original.clone();
        tt_header::push_tt(&mut tt_frame, 7, &config).unwrap();

        match datapath.ingress(1, tt_frame) {
            IngressVerdict::Deliver(delivered) => assert_eq!(delivered, original),
            other => panic!("expected delivery, got {:?}", other),
        }
        assert_eq!(datapath.port(1).unwrap().stats().arrived, 1);
    }

    #[tokio::test]
    async fn test_ingress_forwards_unexpected_frames() {
        let datapath = datapath();
        datapath.add_port(1);

        let config = TtConfig::default_trdp();
        let mut tt_frame = udp_frame(17224, &[0x00, 0x08], 64);
        tt_header::push_tt(&mut tt_frame, 8, &config).unwrap();

        // no arrive entry for flow 8: the frame transits
        assert!(matches!(
            datapath.ingress(1, tt_frame),
            IngressVerdict::Forward(_)
        ));

        // frames on unknown ports transit untouched
        assert!(matches!(
            datapath.ingress(99, udp_frame(17224, &[0, 1], 64)),
            IngressVerdict::Forward(_)
        ));
    }
}
