//! End-to-end scenarios against a scripted fake device.
//!
//! The fake implements the serial byte contract: it deframes what the host
//! writes, acknowledges it, and queues the scripted reply frames for the
//! host to read. Tests drive a full `Garmin` session over it.

use garmin_link::datatype::{
    Position, Pvt, RadianPosition, Records, Waypoint, WaypointFormat,
};
use garmin_link::link::{frame, Deframer, SerialLink, PID_ACK, PID_NAK};
use garmin_link::phys::SerialIo;
use garmin_link::types::{GarminError, Packet, Result};
use garmin_link::Garmin;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const PID_COMMAND_DATA: u16 = 10;
const PID_XFER_CMPLT: u16 = 12;
const PID_DATE_TIME_DATA: u16 = 14;
const PID_RECORDS: u16 = 27;
const PID_RTE_HDR: u16 = 29;
const PID_RTE_WPT_DATA: u16 = 30;
const PID_WPT_DATA: u16 = 35;
const PID_PVT_DATA: u16 = 51;
const PID_RTE_LINK_DATA: u16 = 98;
const PID_PRODUCT_RQST: u16 = 254;
const PID_PRODUCT_DATA: u16 = 255;
const PID_PROTOCOL_ARRAY: u16 = 253;

const CMND_TRANSFER_RTE: u16 = 4;
const CMND_TRANSFER_WPT: u16 = 7;
const CMND_START_PVT: u16 = 49;
const CMND_STOP_PVT: u16 = 50;

#[derive(Default)]
struct SimState {
    /// Bytes of the frame currently being read by the host
    rx: VecDeque<u8>,
    /// Frames waiting their turn on the wire; one moves into `rx` per poll
    pending: VecDeque<Vec<u8>>,
    product: Vec<u8>,
    protocol_array: Option<Vec<u8>>,
    /// Scripted reply records per category: (packet id, payload)
    waypoints: Vec<(u16, Vec<u8>)>,
    routes: Vec<(u16, Vec<u8>)>,
    /// Corrupt the first waypoint frame once, keep the good copy for the NAK
    corrupt_first_waypoint: bool,
    retransmit: Option<Vec<u8>>,
    /// Everything the host uploaded
    uploads: Vec<Packet>,
    pvt_records: Vec<Vec<u8>>,
    pvt_streaming: bool,
    pvt_sent: usize,
    /// ACK bookkeeping for the pairing invariant
    data_frames_sent: u64,
    host_acks: u64,
}

impl SimState {
    fn queue_frame(&mut self, id: u16, payload: &[u8]) {
        self.pending.push_back(frame(id as u8, payload));
        if id != PID_ACK && id != PID_NAK {
            self.data_frames_sent += 1;
        }
    }

    fn queue_ack(&mut self, id: u16) {
        let payload = id.to_le_bytes();
        self.pending.push_back(frame(PID_ACK as u8, &payload));
    }

    /// Move the next frame onto the wire when the host polls an idle line.
    fn pump(&mut self) {
        if !self.rx.is_empty() {
            return;
        }
        if let Some(frame) = self.pending.pop_front() {
            self.rx.extend(frame);
            return;
        }
        if self.pvt_streaming && self.pvt_sent < self.pvt_records.len() {
            let record = self.pvt_records[self.pvt_sent].clone();
            self.pvt_sent += 1;
            self.rx.extend(frame(PID_PVT_DATA as u8, &record));
        }
    }

    fn handle_packet(&mut self, packet: Packet) {
        match packet.id {
            PID_ACK => {
                self.host_acks += 1;
            }
            PID_NAK => {
                if let Some(good) = self.retransmit.take() {
                    // Retransmissions jump the queue
                    self.pending.push_front(good);
                    self.data_frames_sent += 1;
                }
            }
            PID_PRODUCT_RQST => {
                self.queue_ack(packet.id);
                let product = self.product.clone();
                self.queue_frame(PID_PRODUCT_DATA, &product);
                if let Some(array) = self.protocol_array.clone() {
                    self.queue_frame(PID_PROTOCOL_ARRAY, &array);
                }
            }
            PID_COMMAND_DATA => {
                self.queue_ack(packet.id);
                self.handle_command(packet.data_as_u32() as u16);
            }
            _ => {
                // Host-side upload traffic: Records{N}, data, Transfer Complete
                self.queue_ack(packet.id);
                if packet.id != PID_RECORDS && packet.id != PID_XFER_CMPLT {
                    self.uploads.push(packet);
                }
            }
        }
    }

    fn handle_command(&mut self, command: u16) {
        match command {
            CMND_TRANSFER_WPT => {
                let records = self.waypoints.clone();
                self.queue_frame(PID_RECORDS, &Records(records.len() as u16).encode());
                for (i, (id, payload)) in records.iter().enumerate() {
                    if i == 0 && self.corrupt_first_waypoint {
                        self.corrupt_first_waypoint = false;
                        let good = frame(*id as u8, payload);
                        let mut bad = good.clone();
                        let len = bad.len();
                        bad[len - 3] ^= 0xff; // break the checksum
                        self.retransmit = Some(good);
                        self.pending.push_back(bad);
                        self.data_frames_sent += 1;
                        continue;
                    }
                    self.queue_frame(*id, payload);
                }
                self.queue_frame(PID_XFER_CMPLT, &command.to_le_bytes());
            }
            CMND_TRANSFER_RTE => {
                let records = self.routes.clone();
                self.queue_frame(PID_RECORDS, &Records(records.len() as u16).encode());
                for (id, payload) in records {
                    self.queue_frame(id, &payload);
                }
                self.queue_frame(PID_XFER_CMPLT, &command.to_le_bytes());
            }
            CMND_START_PVT => {
                self.pvt_streaming = true;
            }
            CMND_STOP_PVT => {
                self.pvt_streaming = false;
            }
            5 => {
                // Transfer time
                self.queue_frame(PID_DATE_TIME_DATA, &[6, 1, 0xd3, 0x07, 14, 0, 30, 0]);
            }
            _ => {}
        }
    }
}

/// The fake serial endpoint handed to the link layer.
struct SimDevice {
    state: Arc<Mutex<SimState>>,
    deframer: Deframer,
}

impl SimDevice {
    fn new(state: Arc<Mutex<SimState>>) -> Self {
        Self {
            state,
            deframer: Deframer::new(),
        }
    }
}

impl SerialIo for SimDevice {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        state.pump();
        if state.rx.is_empty() {
            return Err(GarminError::Timeout);
        }
        let mut n = 0;
        while n < buf.len() {
            match state.rx.pop_front() {
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
        for &b in buf {
            if let Some(packet) = self.deframer.push(b)? {
                self.state.lock().unwrap().handle_packet(packet);
            }
        }
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

fn product_payload(id: u16, version: u16, strings: &[&str]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&id.to_le_bytes());
    out.extend_from_slice(&version.to_le_bytes());
    for s in strings {
        out.extend_from_slice(s.as_bytes());
        out.push(0);
    }
    out
}

fn protocol_array(entries: &[(u8, u16)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (tag, number) in entries {
        out.push(*tag);
        out.extend_from_slice(&number.to_le_bytes());
    }
    out
}

/// Protocol array of a unit speaking D100 waypoints, A201 routes, and PVT.
fn modern_array() -> Vec<u8> {
    protocol_array(&[
        (b'P', 0),
        (b'L', 1),
        (b'A', 10),
        (b'A', 100),
        (b'D', 100),
        (b'A', 201),
        (b'D', 201),
        (b'D', 100),
        (b'D', 210),
        (b'A', 600),
        (b'D', 600),
        (b'A', 800),
        (b'D', 800),
    ])
}

fn session(state: Arc<Mutex<SimState>>) -> Garmin {
    let link = SerialLink::new(SimDevice::new(state));
    Garmin::from_link(Box::new(link)).expect("negotiation failed")
}

#[test]
fn info_matches_device_reply() {
    let state = Arc::new(Mutex::new(SimState {
        product: product_payload(105, 230, &["GPS 12XL", "Software Version 2.30"]),
        ..SimState::default()
    }));
    let gps = session(state);

    let product = gps.product();
    assert_eq!(product.product_id, 105);
    assert_eq!(product.software_version, 230);
    assert_eq!(
        product.description,
        vec!["GPS 12XL".to_string(), "Software Version 2.30".to_string()]
    );
    // No protocol array: the capability catalog resolves a GPS 12XL to D103
    assert_eq!(gps.protocols().waypoint, Some(WaypointFormat::D103));
    assert!(gps.protocols().command.is_some());
}

#[test]
fn unknown_device_without_protocol_array() {
    let state = Arc::new(Mutex::new(SimState {
        product: product_payload(9999, 100, &["MYSTERY UNIT"]),
        ..SimState::default()
    }));
    let link = SerialLink::new(SimDevice::new(state));
    let err = Garmin::from_link(Box::new(link))
        .err()
        .expect("negotiation should fail");
    assert!(matches!(err, GarminError::UnknownDevice(9999)));
}

#[test]
fn empty_waypoint_download() {
    let state = Arc::new(Mutex::new(SimState {
        product: product_payload(248, 410, &["GPSMAP 76"]),
        protocol_array: Some(modern_array()),
        ..SimState::default()
    }));
    let mut gps = session(state);

    let waypoints = gps.get_waypoints().unwrap();
    assert!(waypoints.is_empty());
}

#[test]
fn waypoint_download_decodes_records() {
    let wpt = Waypoint::new("AIRPRT", Position::new(100, -100), "RUNWAY 27");
    let state = Arc::new(Mutex::new(SimState {
        product: product_payload(248, 410, &["GPSMAP 76"]),
        protocol_array: Some(modern_array()),
        waypoints: vec![(PID_WPT_DATA, wpt.encode(WaypointFormat::D100))],
        ..SimState::default()
    }));
    let mut gps = session(state);

    let waypoints = gps.get_waypoints().unwrap();
    assert_eq!(waypoints.len(), 1);
    assert_eq!(waypoints[0].ident, "AIRPRT");
    assert_eq!(waypoints[0].posn, Position::new(100, -100));
}

#[test]
fn single_waypoint_upload_wire_bytes() {
    let state = Arc::new(Mutex::new(SimState {
        product: product_payload(248, 410, &["GPSMAP 76"]),
        protocol_array: Some(modern_array()),
        ..SimState::default()
    }));
    let mut gps = session(state.clone());

    let wpt = Waypoint::new(
        "CHURCH",
        Position::new(493_961_671, 25_937_164),
        "LA SAGRADA FAMILIA",
    );
    gps.put_waypoints(std::slice::from_ref(&wpt)).unwrap();

    let sim = state.lock().unwrap();
    assert_eq!(sim.uploads.len(), 1);
    let packet = &sim.uploads[0];
    assert_eq!(packet.id, PID_WPT_DATA);
    // Bit-exact D100 layout
    assert_eq!(packet.data.len(), 58);
    assert_eq!(&packet.data[..6], b"CHURCH");
    assert_eq!(&packet.data[6..10], &493_961_671i32.to_le_bytes());
    assert_eq!(&packet.data[10..14], &25_937_164i32.to_le_bytes());
    assert_eq!(&packet.data[18..36], b"LA SAGRADA FAMILIA");
}

#[test]
fn route_download_groups_routes() {
    let hdr = |n: u8| {
        let mut payload = vec![n];
        payload.extend_from_slice(&[b' '; 20]);
        payload.truncate(21);
        (PID_RTE_HDR, payload)
    };
    let wpt = |ident: &str| {
        (
            PID_RTE_WPT_DATA,
            Waypoint::new(ident, Position::new(1, 1), "").encode(WaypointFormat::D100),
        )
    };
    let link_rec = (PID_RTE_LINK_DATA, {
        let mut payload = vec![0, 0];
        payload.extend_from_slice(&[0; 18]);
        payload.push(0);
        payload
    });

    let routes = vec![
        hdr(1),
        link_rec.clone(),
        wpt("A"),
        wpt("B"),
        hdr(2),
        link_rec,
        wpt("C"),
        wpt("D"),
        wpt("E"),
    ];
    let state = Arc::new(Mutex::new(SimState {
        product: product_payload(248, 410, &["GPSMAP 76"]),
        protocol_array: Some(modern_array()),
        routes,
        ..SimState::default()
    }));
    let mut gps = session(state);

    let routes = gps.get_routes().unwrap();
    assert_eq!(routes.len(), 2);
    assert_eq!(routes[0].header.nmbr, 1);
    assert_eq!(routes[0].waypoints.len(), 2);
    assert_eq!(routes[0].links.len(), 1);
    assert_eq!(routes[1].header.nmbr, 2);
    assert_eq!(routes[1].waypoints.len(), 3);
    assert_eq!(routes[1].waypoints[2].ident, "E");
}

#[test]
fn ack_pairing_over_a_full_transfer() {
    let wpt = Waypoint::new("ONE", Position::new(5, 5), "");
    let state = Arc::new(Mutex::new(SimState {
        product: product_payload(248, 410, &["GPSMAP 76"]),
        protocol_array: Some(modern_array()),
        waypoints: vec![(PID_WPT_DATA, wpt.encode(WaypointFormat::D100))],
        ..SimState::default()
    }));
    let mut gps = session(state.clone());
    gps.get_waypoints().unwrap();

    let sim = state.lock().unwrap();
    // Every data frame the device sent was acknowledged exactly once
    assert_eq!(sim.data_frames_sent, sim.host_acks);
}

#[test]
fn nak_retry_recovers_corrupt_record() {
    let wpt = Waypoint::new("GLITCH", Position::new(7, 7), "");
    let state = Arc::new(Mutex::new(SimState {
        product: product_payload(248, 410, &["GPSMAP 76"]),
        protocol_array: Some(modern_array()),
        waypoints: vec![(PID_WPT_DATA, wpt.encode(WaypointFormat::D100))],
        corrupt_first_waypoint: true,
        ..SimState::default()
    }));
    let mut gps = session(state);

    let waypoints = gps.get_waypoints().unwrap();
    assert_eq!(waypoints.len(), 1);
    assert_eq!(waypoints[0].ident, "GLITCH");
    // The retry is observable on the link counters
    assert_eq!(gps.link_stats().naks_sent, 1);
}

#[test]
fn pvt_stream_delivers_and_stops() {
    let mut record = Pvt::default();
    record.fix = 3;
    record.posn = RadianPosition::from_degrees(41.4, 2.17);
    let state = Arc::new(Mutex::new(SimState {
        product: product_payload(248, 410, &["GPSMAP 76"]),
        protocol_array: Some(modern_array()),
        pvt_records: (0..10)
            .map(|i| {
                let mut r = record.clone();
                r.tow = i as f64;
                r.encode()
            })
            .collect(),
        ..SimState::default()
    }));
    let mut gps = session(state.clone());

    let mut stream = gps.pvt().unwrap();
    for i in 0..3 {
        let pvt = stream.next().unwrap();
        assert_eq!(pvt.tow, i as f64);
        assert_eq!(pvt.fix, 3);
    }
    stream.stop().unwrap();
    drop(stream);

    let sim = state.lock().unwrap();
    assert!(!sim.pvt_streaming);
    // Stopping drained the line: nothing is waiting for the host
    assert!(sim.rx.is_empty());

    // The session is usable again after the stream ends
    drop(sim);
    assert!(gps.get_waypoints().unwrap().is_empty());
}

#[test]
fn get_time_decodes_datetime() {
    let state = Arc::new(Mutex::new(SimState {
        product: product_payload(248, 410, &["GPSMAP 76"]),
        protocol_array: Some(modern_array()),
        ..SimState::default()
    }));
    let mut gps = session(state);

    let time = gps.get_time().unwrap();
    assert_eq!(time.year, 2003);
    assert_eq!(time.month, 6);
    assert_eq!(time.day, 1);
    assert_eq!(time.hour, 14);
    assert_eq!(time.minute, 30);
}

#[test]
fn unsupported_role_fails_cleanly() {
    let state = Arc::new(Mutex::new(SimState {
        product: product_payload(248, 410, &["GPSMAP 76"]),
        protocol_array: Some(modern_array()),
        ..SimState::default()
    }));
    let mut gps = session(state);

    // The array above never announced a lap protocol
    match gps.get_laps() {
        Err(GarminError::ProtocolNotSupported(_)) => {}
        other => panic!("expected ProtocolNotSupported, got {other:?}"),
    }
}
