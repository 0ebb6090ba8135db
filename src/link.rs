//! Link layer
//!
//! Frames packets onto the two physical transports. The serial variant
//! (L000 basic framing) delimits packets with DLE/ETX, stuffs embedded DLE
//! bytes, checksums every frame, and acknowledges every data packet. The
//! USB variant rides the packetization the transport already provides and
//! needs neither stuffing, checksums, nor ACKs.

use crate::phys::{SerialIo, UsbIo};
use crate::types::{hex_dump, GarminError, Packet, Result};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::time::Duration;

/// Data Link Escape
pub const DLE: u8 = 0x10;
/// End of Text
pub const ETX: u8 = 0x03;

/// Acknowledge packet id
pub const PID_ACK: u16 = 6;
/// Negative acknowledge packet id
pub const PID_NAK: u16 = 21;

/// USB protocol-layer packet type
const USB_LAYER_TRANSPORT: u8 = 0;
/// Application-layer packet type
const USB_LAYER_APPLICATION: u8 = 20;

/// USB transport-layer start session packet id
const PID_START_SESSION: u16 = 5;
/// USB transport-layer session started packet id
const PID_SESSION_STARTED: u16 = 6;

/// Time to wait for an ACK before retransmitting
const ACK_TIMEOUT: Duration = Duration::from_secs(2);
/// Retransmissions before giving up on a packet
const MAX_RETRIES: usize = 5;
/// Consecutive NAKs for the same packet before the transfer is abandoned
const MAX_NAKS: usize = 3;

/// Counters exposed for diagnostics and tests
#[derive(Debug, Default, Clone, Copy)]
pub struct LinkStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub acks_sent: u64,
    pub naks_sent: u64,
    pub naks_received: u64,
    pub retransmits: u64,
}

/// A framed, acknowledged packet channel over one of the transports.
pub trait Link: Send {
    /// Send a packet, blocking until it is acknowledged (serial) or the
    /// transport write completes (USB).
    fn send_packet(&mut self, packet: &Packet) -> Result<()>;

    /// Receive the next packet, acknowledging it where the link requires.
    fn read_packet(&mut self) -> Result<Packet>;

    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Serial only; USB links report `ProtocolNotSupported`.
    fn set_baud_rate(&mut self, baud: u32) -> Result<()>;

    /// Largest payload one packet can carry.
    fn max_payload(&self) -> usize;

    fn stats(&self) -> LinkStats;

    /// Receive a packet and fail unless it carries the expected id.
    fn expect_packet(&mut self, id: u16) -> Result<Packet> {
        let packet = self.read_packet()?;
        if packet.id != id {
            return Err(GarminError::UnexpectedPacket {
                expected: id,
                got: packet.id,
            });
        }
        Ok(packet)
    }
}

/// Two's complement of the modulo-256 sum over id, size, and payload.
pub fn checksum(id: u8, data: &[u8]) -> u8 {
    let mut sum = id.wrapping_add(data.len() as u8);
    for &b in data {
        sum = sum.wrapping_add(b);
    }
    sum.wrapping_neg()
}

/// Build a serial frame: DLE, id, size, payload, checksum, DLE, ETX with
/// every DLE between the delimiters stuffed.
pub fn frame(id: u8, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 8);
    out.push(DLE);
    let mut push_escaped = |b: u8, out: &mut Vec<u8>| {
        out.push(b);
        if b == DLE {
            out.push(DLE);
        }
    };
    push_escaped(id, &mut out);
    push_escaped(data.len() as u8, &mut out);
    for &b in data {
        push_escaped(b, &mut out);
    }
    push_escaped(checksum(id, data), &mut out);
    out.push(DLE);
    out.push(ETX);
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    Idle,
    SawDle,
    InFrame,
    SawDleInFrame,
}

/// Streaming deframer for the serial byte stream.
///
/// Bytes are fed one at a time; a completed frame is validated (length and
/// checksum) and returned as a packet. A framing error resets the state
/// machine, which resynchronizes on the next DLE.
pub struct Deframer {
    state: FrameState,
    body: Vec<u8>,
}

impl Default for Deframer {
    fn default() -> Self {
        Self::new()
    }
}

impl Deframer {
    pub fn new() -> Self {
        Self {
            state: FrameState::Idle,
            body: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.state = FrameState::Idle;
        self.body.clear();
    }

    /// Feed one byte. Returns a packet when a frame completes, `None` while
    /// a frame is still in flight, or an error on a framing or checksum
    /// violation.
    pub fn push(&mut self, byte: u8) -> Result<Option<Packet>> {
        match self.state {
            FrameState::Idle => {
                if byte == DLE {
                    self.state = FrameState::SawDle;
                }
                // Anything else between frames, including a stray ETX, is noise
                Ok(None)
            }
            FrameState::SawDle => {
                match byte {
                    // DLE ETX with no frame open: stale trailer, skip it
                    ETX => self.state = FrameState::Idle,
                    // A repeated DLE still marks a frame start
                    DLE => {}
                    _ => {
                        self.body.clear();
                        self.body.push(byte);
                        self.state = FrameState::InFrame;
                    }
                }
                Ok(None)
            }
            FrameState::InFrame => {
                if byte == DLE {
                    self.state = FrameState::SawDleInFrame;
                } else {
                    self.body.push(byte);
                }
                Ok(None)
            }
            FrameState::SawDleInFrame => match byte {
                DLE => {
                    self.body.push(DLE);
                    self.state = FrameState::InFrame;
                    Ok(None)
                }
                ETX => {
                    self.state = FrameState::Idle;
                    let packet = Self::unpack(&self.body);
                    self.body.clear();
                    packet.map(Some)
                }
                other => {
                    self.reset();
                    Err(GarminError::LinkFailure(format!(
                        "lone DLE inside frame followed by {other:#04x}"
                    )))
                }
            },
        }
    }

    /// Validate an unescaped frame body: id, size, payload, checksum.
    fn unpack(body: &[u8]) -> Result<Packet> {
        if body.len() < 3 {
            return Err(GarminError::LinkFailure(format!(
                "frame too short: {} bytes",
                body.len()
            )));
        }
        let id = body[0];
        let size = body[1] as usize;
        let payload = &body[2..body.len() - 1];
        let check = body[body.len() - 1];
        if payload.len() != size {
            return Err(GarminError::LinkFailure(format!(
                "wrong payload size: header says {size}, got {}",
                payload.len()
            )));
        }
        if checksum(id, payload) != check {
            return Err(GarminError::LinkFailure("checksum mismatch".into()));
        }
        Ok(Packet::new(id as u16, payload.to_vec()))
    }
}

/// Serial link: L000 framing plus the ACK/NAK exchange.
pub struct SerialLink<S: SerialIo> {
    io: S,
    deframer: Deframer,
    pending: VecDeque<u8>,
    timeout: Duration,
    stats: LinkStats,
}

impl<S: SerialIo> SerialLink<S> {
    pub fn new(io: S) -> Self {
        Self {
            io,
            deframer: Deframer::new(),
            pending: VecDeque::new(),
            timeout: crate::phys::DEFAULT_TIMEOUT,
            stats: LinkStats::default(),
        }
    }

    pub fn io_mut(&mut self) -> &mut S {
        &mut self.io
    }

    fn next_byte(&mut self) -> Result<u8> {
        if let Some(b) = self.pending.pop_front() {
            return Ok(b);
        }
        let mut buf = [0u8; 256];
        let n = self.io.read(&mut buf)?;
        self.pending.extend(&buf[..n]);
        self.pending
            .pop_front()
            .ok_or(GarminError::Timeout)
    }

    /// Read one well-formed frame. Framing or checksum errors are NAKed
    /// and retried; a quiet line surfaces as `Timeout` untouched.
    fn read_frame(&mut self) -> Result<Packet> {
        let mut attempts = 0;
        loop {
            match self.next_byte().and_then(|b| self.deframer.push(b)) {
                Ok(None) => continue,
                Ok(Some(packet)) => {
                    debug!("> {}: {}", packet, hex_dump(&packet.data));
                    self.stats.packets_received += 1;
                    return Ok(packet);
                }
                Err(GarminError::Timeout) => {
                    self.deframer.reset();
                    return Err(GarminError::Timeout);
                }
                Err(e) => {
                    warn!("Bad frame: {e}");
                    self.deframer.reset();
                    attempts += 1;
                    if attempts >= MAX_NAKS {
                        self.send_nak()?;
                        return Err(GarminError::TransferAborted(format!(
                            "{MAX_NAKS} consecutive NAKs for the same packet"
                        )));
                    }
                    self.send_nak()?;
                }
            }
        }
    }

    fn write_frame(&mut self, packet: &Packet) -> Result<()> {
        if packet.id > 0xff {
            return Err(GarminError::ProtocolViolation(format!(
                "serial link does not carry packet id {}",
                packet.id
            )));
        }
        let buf = frame(packet.id as u8, &packet.data);
        debug!("< {}: {}", packet, hex_dump(&packet.data));
        self.io.write_all(&buf)
    }

    fn send_ack(&mut self, id: u16) -> Result<()> {
        self.stats.acks_sent += 1;
        self.write_frame(&Packet::with_u16(PID_ACK, id))
    }

    fn send_nak(&mut self) -> Result<()> {
        // The id of the corrupted packet is unknown, so the payload is empty
        self.stats.naks_sent += 1;
        self.write_frame(&Packet::empty(PID_NAK))
    }

    /// Wait for the ACK or NAK pairing a packet we just sent.
    fn read_ack(&mut self, sent_id: u16) -> Result<()> {
        let packet = self.read_frame()?;
        match packet.id {
            PID_ACK => {
                let acked = packet.data_as_u32() as u16;
                if acked != sent_id {
                    return Err(GarminError::ProtocolViolation(format!(
                        "ACK pairs packet {acked}, expected {sent_id}"
                    )));
                }
                Ok(())
            }
            PID_NAK => {
                self.stats.naks_received += 1;
                Err(GarminError::LinkFailure("packet NAKed".into()))
            }
            other => Err(GarminError::ProtocolViolation(format!(
                "expected ACK or NAK, got packet {other}"
            ))),
        }
    }
}

impl<S: SerialIo> Link for SerialLink<S> {
    fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        self.write_frame(packet)?;
        self.stats.packets_sent += 1;

        self.io.set_timeout(ACK_TIMEOUT)?;
        let mut attempts = 0;
        let result = loop {
            match self.read_ack(packet.id) {
                Ok(()) => break Ok(()),
                Err(e @ GarminError::ProtocolViolation(_)) => break Err(e),
                Err(e) => {
                    attempts += 1;
                    if attempts > MAX_RETRIES {
                        break Err(GarminError::LinkFailure(format!(
                            "unacknowledged after {MAX_RETRIES} retries: {e}"
                        )));
                    }
                    debug!("Retransmitting {packet} ({e})");
                    self.stats.retransmits += 1;
                    self.write_frame(packet)?;
                }
            }
        };
        self.io.set_timeout(self.timeout)?;
        result
    }

    fn read_packet(&mut self) -> Result<Packet> {
        let packet = self.read_frame()?;
        if packet.id != PID_ACK && packet.id != PID_NAK {
            self.send_ack(packet.id)?;
        }
        Ok(packet)
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        self.io.set_timeout(timeout)
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
        self.io.set_baud_rate(baud)
    }

    fn max_payload(&self) -> usize {
        255
    }

    fn stats(&self) -> LinkStats {
        self.stats
    }
}

/// USB link: the transport already delivers whole packets, so this layer
/// only applies the 12-byte Garmin packet header and runs the start
/// session handshake.
pub struct UsbLink<U: UsbIo> {
    io: U,
    stats: LinkStats,
}

impl<U: UsbIo> UsbLink<U> {
    /// Wrap a USB transport and perform the session handshake. Packets
    /// received before Session Started are discarded, as required.
    pub fn start_session(io: U) -> Result<Self> {
        let mut link = Self {
            io,
            stats: LinkStats::default(),
        };
        info!("Starting USB session");
        link.write_usb(USB_LAYER_TRANSPORT, &Packet::empty(PID_START_SESSION))?;
        loop {
            let (layer, packet) = link.read_usb()?;
            if layer == USB_LAYER_TRANSPORT && packet.id == PID_SESSION_STARTED {
                info!("USB session started, unit ID {}", packet.data_as_u32());
                return Ok(link);
            }
            debug!("Discarding pre-session {packet}");
        }
    }

    fn write_usb(&mut self, layer: u8, packet: &Packet) -> Result<()> {
        let mut buf = Vec::with_capacity(12 + packet.data.len());
        buf.push(layer);
        buf.extend_from_slice(&[0, 0, 0]);
        buf.extend_from_slice(&packet.id.to_le_bytes());
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&(packet.data.len() as u32).to_le_bytes());
        buf.extend_from_slice(&packet.data);
        debug!("< {}: {}", packet, hex_dump(&packet.data));
        self.io.write_raw(&buf)
    }

    fn read_usb(&mut self) -> Result<(u8, Packet)> {
        loop {
            let raw = self.io.read_raw()?;
            if raw.is_empty() {
                // Zero-length packets are keep-alives
                continue;
            }
            let (layer, packet) = unpack_usb(&raw)?;
            debug!("> {}: {}", packet, hex_dump(&packet.data));
            return Ok((layer, packet));
        }
    }
}

/// Split a raw USB packet into its layer byte and logical packet.
pub fn unpack_usb(raw: &[u8]) -> Result<(u8, Packet)> {
    if raw.len() < 12 {
        return Err(GarminError::ProtocolViolation(format!(
            "USB packet header truncated: {} bytes",
            raw.len()
        )));
    }
    let layer = raw[0];
    let id = u16::from_le_bytes([raw[4], raw[5]]);
    let size = u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]) as usize;
    let data = &raw[12..];
    if data.len() != size {
        return Err(GarminError::ProtocolViolation(format!(
            "USB packet size field says {size}, payload is {}",
            data.len()
        )));
    }
    Ok((layer, Packet::new(id, data.to_vec())))
}

impl<U: UsbIo> Link for UsbLink<U> {
    fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        self.write_usb(USB_LAYER_APPLICATION, packet)?;
        self.stats.packets_sent += 1;
        Ok(())
    }

    fn read_packet(&mut self) -> Result<Packet> {
        loop {
            let (layer, packet) = self.read_usb()?;
            if layer == USB_LAYER_TRANSPORT {
                debug!("Ignoring transport-layer {packet} mid-session");
                continue;
            }
            self.stats.packets_received += 1;
            return Ok(packet);
        }
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.io.set_timeout(timeout);
        Ok(())
    }

    fn set_baud_rate(&mut self, _baud: u32) -> Result<()> {
        Err(GarminError::ProtocolNotSupported(
            "baud rate change on a USB link",
        ))
    }

    fn max_payload(&self) -> usize {
        crate::phys::USB_MAX_BUFFER_SIZE - 12
    }

    fn stats(&self) -> LinkStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unframe(bytes: &[u8]) -> Result<Packet> {
        let mut deframer = Deframer::new();
        for &b in bytes {
            if let Some(packet) = deframer.push(b)? {
                return Ok(packet);
            }
        }
        panic!("no frame completed");
    }

    #[test]
    fn test_checksum_product_request() {
        // Product data request: id 254, empty payload
        assert_eq!(checksum(254, &[]), 2);
    }

    #[test]
    fn test_frame_product_request() {
        assert_eq!(frame(254, &[]), vec![DLE, 254, 0, 2, DLE, ETX]);
    }

    #[test]
    fn test_frame_roundtrip() {
        let payloads: [&[u8]; 4] = [&[], &[1, 2, 3], &[0x10], &[0x10, 0x10, 0x03]];
        for data in payloads {
            let packet = unframe(&frame(35, data)).unwrap();
            assert_eq!(packet.id, 35);
            assert_eq!(packet.data, data);
        }
    }

    #[test]
    fn test_byte_stuffing() {
        // A DLE in the payload is doubled; nothing else is
        let framed = frame(35, &[0x10, 0x42]);
        assert_eq!(framed, vec![DLE, 35, 2, 0x10, 0x10, 0x42, 0x89, DLE, ETX]);
    }

    #[test]
    fn test_stuffed_size_byte() {
        // A payload of 16 bytes puts a DLE in the size field itself
        let data = [0u8; 16];
        let framed = frame(35, &data);
        assert_eq!(&framed[2..4], &[DLE, DLE]);
        let packet = unframe(&framed).unwrap();
        assert_eq!(packet.data, data);
    }

    #[test]
    fn test_checksum_mismatch_detected() {
        let mut framed = frame(35, &[1, 2, 3]);
        let len = framed.len();
        framed[len - 3] ^= 0xff; // corrupt the checksum
        let mut deframer = Deframer::new();
        let mut result = Ok(None);
        for &b in &framed {
            result = deframer.push(b);
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(GarminError::LinkFailure(_))));
    }

    #[test]
    fn test_deframer_resyncs_after_noise() {
        let mut deframer = Deframer::new();
        // Garbage, a stray ETX, then a valid frame
        let mut stream = vec![0x55, ETX, 0x00];
        stream.extend_from_slice(&frame(254, &[]));
        let mut got = None;
        for &b in &stream {
            if let Some(p) = deframer.push(b).unwrap() {
                got = Some(p);
            }
        }
        assert_eq!(got.unwrap().id, 254);
    }

    #[test]
    fn test_usb_pack_unpack() {
        let packet = Packet::with_u16(10, 7);
        let mut raw = vec![USB_LAYER_APPLICATION, 0, 0, 0];
        raw.extend_from_slice(&10u16.to_le_bytes());
        raw.extend_from_slice(&[0, 0]);
        raw.extend_from_slice(&2u32.to_le_bytes());
        raw.extend_from_slice(&packet.data);
        let (layer, parsed) = unpack_usb(&raw).unwrap();
        assert_eq!(layer, USB_LAYER_APPLICATION);
        assert_eq!(parsed, packet);
    }

    #[test]
    fn test_usb_size_mismatch() {
        let mut raw = vec![USB_LAYER_APPLICATION, 0, 0, 0, 51, 0, 0, 0];
        raw.extend_from_slice(&8u32.to_le_bytes());
        raw.extend_from_slice(&[1, 2, 3]); // size field lies
        assert!(matches!(
            unpack_usb(&raw),
            Err(GarminError::ProtocolViolation(_))
        ));
    }

    // Scripted serial endpoint for exercising the ACK/NAK exchange
    struct ScriptIo {
        input: VecDeque<u8>,
        written: Vec<u8>,
    }

    impl ScriptIo {
        fn new() -> Self {
            Self {
                input: VecDeque::new(),
                written: Vec::new(),
            }
        }

        fn queue(&mut self, bytes: &[u8]) {
            self.input.extend(bytes);
        }
    }

    impl SerialIo for ScriptIo {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            if self.input.is_empty() {
                return Err(GarminError::Timeout);
            }
            let mut n = 0;
            while n < buf.len() {
                match self.input.pop_front() {
                    Some(b) => {
                        buf[n] = b;
                        n += 1;
                    }
                    None => break,
                }
            }
            Ok(n)
        }

        fn write_all(&mut self, buf: &[u8]) -> Result<()> {
            self.written.extend_from_slice(buf);
            Ok(())
        }

        fn set_timeout(&mut self, _timeout: Duration) -> Result<()> {
            Ok(())
        }

        fn set_baud_rate(&mut self, _baud: u32) -> Result<()> {
            Ok(())
        }

        fn flush(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_send_packet_waits_for_ack() {
        let mut io = ScriptIo::new();
        io.queue(&frame(PID_ACK as u8, &10u16.to_le_bytes()));
        let mut link = SerialLink::new(io);
        link.send_packet(&Packet::with_u16(10, 7)).unwrap();
        assert_eq!(link.stats().packets_sent, 1);
        assert_eq!(link.stats().retransmits, 0);
    }

    #[test]
    fn test_send_packet_retransmits_on_nak() {
        let mut io = ScriptIo::new();
        io.queue(&frame(PID_NAK as u8, &10u16.to_le_bytes()));
        io.queue(&frame(PID_ACK as u8, &10u16.to_le_bytes()));
        let mut link = SerialLink::new(io);
        link.send_packet(&Packet::with_u16(10, 7)).unwrap();
        assert_eq!(link.stats().retransmits, 1);
        assert_eq!(link.stats().naks_received, 1);
    }

    #[test]
    fn test_send_packet_gives_up() {
        let io = ScriptIo::new(); // never answers
        let mut link = SerialLink::new(io);
        let err = link.send_packet(&Packet::with_u16(10, 7)).unwrap_err();
        assert!(matches!(err, GarminError::LinkFailure(_)));
        assert_eq!(link.stats().retransmits, MAX_RETRIES as u64);
    }

    #[test]
    fn test_read_packet_acknowledges() {
        let mut io = ScriptIo::new();
        io.queue(&frame(255, &[0x69, 0x00]));
        let mut link = SerialLink::new(io);
        let packet = link.read_packet().unwrap();
        assert_eq!(packet.id, 255);
        // The written bytes must be an ACK frame naming packet 255
        let written = link.io_mut().written.clone();
        let ack = unframe(&written).unwrap();
        assert_eq!(ack.id, PID_ACK);
        assert_eq!(ack.data_as_u32(), 255);
        assert_eq!(link.stats().acks_sent, 1);
    }

    #[test]
    fn test_read_packet_naks_corrupt_frame() {
        let mut good = frame(35, &[1, 2, 3]);
        let len = good.len();
        good[len - 3] ^= 0xff;
        let mut io = ScriptIo::new();
        io.queue(&good);
        io.queue(&frame(35, &[1, 2, 3]));
        let mut link = SerialLink::new(io);
        let packet = link.read_packet().unwrap();
        assert_eq!(packet.data, vec![1, 2, 3]);
        assert_eq!(link.stats().naks_sent, 1);
    }

    #[test]
    fn test_serial_rejects_wide_packet_ids() {
        let mut link = SerialLink::new(ScriptIo::new());
        let err = link.send_packet(&Packet::empty(990)).unwrap_err();
        assert!(matches!(err, GarminError::ProtocolViolation(_)));
    }
}
