use crate::error::TtError;
use crate::flow_table::FlowEntry;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Record kinds of the table control exchange. The over the wire encoding is
///  handled outside the core; these are the decoded tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum TtFlowCtrlKind {
    AddRequest = 0,
    AddReply = 1,
    DeleteRequest = 2,
    DeleteReply = 3,
    QueryRequest = 4,
    QueryReply = 5,
}

/// A decoded table control record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtFlowCtrl {
    pub table_id: u8,
    pub kind: TtFlowCtrlKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum FlowDirection {
    Send = 0,
    Arrive = 1,
}

/// A decoded flow modification record. The wire carries a 32 bit flow id;
///  the dataplane uses 16 bits, and the width is validated when a session
///  commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtFlowMod {
    pub table_id: u8,
    pub metadata: u64,
    pub port_no: u32,
    pub direction: FlowDirection,
    pub flow_id: u32,
    /// first fire time within the macro period, nanoseconds
    pub offset: u64,
    /// transmission period, nanoseconds
    pub period: u64,
    pub buffer_id: u32,
    pub packet_size: u32,
    /// advisory, commits are never deferred on it
    pub execute_time: u64,
}

impl TtFlowMod {
    /// The dataplane view of this record. Only valid once the id width has
    ///  been checked by the committing session.
    pub(crate) fn to_entry(self) -> FlowEntry {
        FlowEntry {
            flow_id: self.flow_id as u16,
            period: self.period,
            offset: self.offset,
            packet_size: self.packet_size,
            buffer_id: self.buffer_id,
        }
    }
}

/// The control messages the core consumes, in decoded form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TtControlMsg {
    BeginAdd { table_id: u8, expected: u32 },
    AddEntry(TtFlowMod),
    EndAdd { table_id: u8 },
    Clear { table_id: u8, port_no: u32, direction: FlowDirection },
    Query { table_id: u8, port_no: u32, direction: FlowDirection },
}

impl TtControlMsg {
    pub fn request_kind(&self) -> TtFlowCtrlKind {
        match self {
            TtControlMsg::BeginAdd { .. }
            | TtControlMsg::AddEntry(_)
            | TtControlMsg::EndAdd { .. } => TtFlowCtrlKind::AddRequest,
            TtControlMsg::Clear { .. } => TtFlowCtrlKind::DeleteRequest,
            TtControlMsg::Query { .. } => TtFlowCtrlKind::QueryRequest,
        }
    }
}

/// The decoded reply handed back to the control plane encoder.
#[derive(Debug, Clone, PartialEq)]
pub struct TtControlReply {
    pub ctrl: TtFlowCtrl,
    /// only populated for query replies
    pub entries: Vec<FlowEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Mutable,
    Const,
}

/// A table assembly session. `BeginAdd` announces how many entries will
///  follow, `AddEntry` accumulates them, and `EndAdd` commits only once
///  exactly that many have arrived.
pub struct TtSession {
    expected: u32,
    received: u32,
    state: SessionState,
    entries: Vec<TtFlowMod>,
}

impl TtSession {
    pub fn begin(expected: u32, max_flows: u16) -> Result<TtSession, TtError> {
        if expected > u32::from(max_flows) {
            return Err(TtError::TooMany);
        }
        Ok(TtSession {
            expected,
            received: 0,
            state: SessionState::Mutable,
            entries: Vec::with_capacity(expected as usize),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn received(&self) -> u32 {
        self.received
    }

    pub fn add_entry(&mut self, record: TtFlowMod) -> Result<(), TtError> {
        if self.state != SessionState::Mutable {
            return Err(TtError::WrongState);
        }
        self.entries.push(record);
        self.received += 1;
        Ok(())
    }

    /// Seal the session and hand the accumulated records out for commit.
    ///  On any failure the session stays mutable and keeps its records.
    pub fn end(&mut self) -> Result<Vec<TtFlowMod>, TtError> {
        if self.state != SessionState::Mutable {
            return Err(TtError::WrongState);
        }
        if self.received != self.expected {
            return Err(TtError::Incomplete {
                expected: self.expected,
                received: self.received,
            });
        }
        if self
            .entries
            .iter()
            .any(|record| record.flow_id > u32::from(u16::MAX))
        {
            return Err(TtError::TooMany);
        }
        if self
            .entries
            .iter()
            .any(|record| record.period == 0 || record.offset >= record.period)
        {
            return Err(TtError::InvalidEntry);
        }

        self.state = SessionState::Const;
        Ok(std::mem::take(&mut self.entries))
    }
}
