use crate::config::{TtConfig, TT_HLEN};
use crate::error::TtError;
use crate::frame::{Frame, ETH_HLEN, ETH_P_IPV4};

const IPPROTO_UDP: u8 = 17;
const UDP_HLEN: usize = 8;

/// The header carried by native TT frames, immediately after the MAC header.
///
/// ```ascii
/// 0: flow id (u16 BE)
/// 2: length  (u16 BE) - frame length before the TT header was pushed,
///     excluding the header itself and the FCS
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtHeader {
    pub flow_id: u16,
    pub len: u16,
}

impl TtHeader {
    pub fn parse(frame: &Frame) -> Option<TtHeader> {
        Some(TtHeader {
            flow_id: frame.read_u16_be(ETH_HLEN)?,
            len: frame.read_u16_be(ETH_HLEN + 2)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    /// IPv4 UDP datagram addressed to the TRDP port. The flow id is the first
    ///  two bytes of the UDP payload.
    TrdpOverUdp,
    /// Native TT frame, recognized by its EtherType.
    TtNative,
    Other,
}

/// Offset of the UDP header within an IPv4 frame, or `None` if the frame is
///  not a well-formed IPv4 UDP packet.
fn udp_header_offset(data: &[u8]) -> Option<usize> {
    let version_ihl = *data.get(ETH_HLEN)?;
    if version_ihl >> 4 != 4 {
        return None;
    }
    let ip_header_len = ((version_ihl & 0x0f) as usize) * 4;
    if ip_header_len < 20 {
        return None;
    }
    if *data.get(ETH_HLEN + 9)? != IPPROTO_UDP {
        return None;
    }
    let udp_offset = ETH_HLEN + ip_header_len;
    if data.len() < udp_offset + UDP_HLEN {
        return None;
    }
    Some(udp_offset)
}

/// Classify a frame by its headers. Truncated frames that cannot hold the
///  headers they claim classify as `Other`.
pub fn classify(frame: &Frame, config: &TtConfig) -> FrameClass {
    let data = frame.as_slice();
    if data.len() < ETH_HLEN {
        return FrameClass::Other;
    }

    let ethertype = u16::from_be_bytes([data[12], data[13]]);
    if ethertype == config.tt_ethertype {
        if data.len() < ETH_HLEN + TT_HLEN {
            return FrameClass::Other;
        }
        return FrameClass::TtNative;
    }
    if ethertype != ETH_P_IPV4 {
        return FrameClass::Other;
    }

    match udp_header_offset(data) {
        Some(udp_offset) => {
            let dest_port = u16::from_be_bytes([data[udp_offset + 2], data[udp_offset + 3]]);
            if dest_port == config.trdp_udp_port {
                FrameClass::TrdpOverUdp
            } else {
                FrameClass::Other
            }
        }
        None => FrameClass::Other,
    }
}

/// Read the flow id of a TRDP datagram from the start of its UDP payload.
pub fn trdp_flow_id(frame: &Frame) -> Option<u16> {
    let data = frame.as_slice();
    let payload_offset = udp_header_offset(data)? + UDP_HLEN;
    frame.read_u16_be(payload_offset)
}

/// Push a TT header onto `frame`: the MAC header moves forward into the
///  headroom, the EtherType becomes the TT EtherType, and the TT header is
///  written between the MAC header and the original payload.
pub fn push_tt(frame: &mut Frame, flow_id: u16, config: &TtConfig) -> Result<(), TtError> {
    if frame.len() < ETH_HLEN {
        return Err(TtError::NotWritable);
    }
    let len_field = (frame.len() - TT_HLEN) as u16;

    frame.grow_head(TT_HLEN)?;

    let data = frame.as_mut_slice();
    data.copy_within(TT_HLEN..TT_HLEN + ETH_HLEN, 0);

    frame.write_u16_be(12, config.tt_ethertype);
    frame.write_u16_be(ETH_HLEN, flow_id);
    frame.write_u16_be(ETH_HLEN + 2, len_field);
    Ok(())
}

/// Pop the TT header, restoring the frame to its pre-push layout with an IPv4
///  EtherType.
pub fn pop_tt(frame: &mut Frame) -> Result<(), TtError> {
    if frame.len() < ETH_HLEN + TT_HLEN {
        return Err(TtError::NotWritable);
    }

    let data = frame.as_mut_slice();
    data.copy_within(0..ETH_HLEN, TT_HLEN);

    frame.shrink_head(TT_HLEN)?;
    frame.write_u16_be(12, ETH_P_IPV4);
    Ok(())
}

/// Convert a classified TRDP datagram into a native TT frame. Returns the
///  flow id taken from the UDP payload.
pub fn trdp_to_tt(frame: &mut Frame, config: &TtConfig) -> Result<u16, TtError> {
    let flow_id = trdp_flow_id(frame).ok_or(TtError::NotWritable)?;
    push_tt(frame, flow_id, config)?;
    Ok(flow_id)
}

/// Convert a native TT frame back into its TRDP form.
pub fn tt_to_trdp(frame: &mut Frame) -> Result<(), TtError> {
    pop_tt(frame)
}
