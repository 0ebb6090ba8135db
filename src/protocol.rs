//! Application protocols
//!
//! Capability negotiation (A000/A001), the device command sets (A010/A011),
//! and the transfer state machines (Axxx). Every transfer shares one link
//! and runs to completion before the next starts; the bulk categories all
//! follow the Records{N} ... Transfer Complete bracketing, acknowledged
//! packet by packet on the serial link.

use crate::catalog;
use crate::datatype::{
    decode_color_table, decode_ext_product_data, decode_image_list, encode_color_table, Almanac,
    AlmanacFormat, Course, CourseLap, CourseLimits, CoursePoint, DateTimeRecord, FitnessUserProfile,
    FlightBookRecord, Image, ImageInfo, ImageProp, Lap, LapFormat, MemChunk, MemFile,
    MemProperties, MemRecord, ProductInfo, Pvt, RadianPosition, Records, Rgb, Route, RouteHeader,
    RouteHeaderFormat, RouteLink, Run, RunFormat, ScreenshotSection, Track, TrackHeader,
    TrackHeaderFormat, TrackPoint, TrackPointFormat, Waypoint, WaypointFormat, Workout,
    WorkoutLimits, WorkoutOccurrence,
};
use crate::link::Link;
use crate::types::{GarminError, Packet, Result};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// L000 basic link packet ids, shared by every device
pub const PID_EXT_PRODUCT_DATA: u16 = 248;
pub const PID_PROTOCOL_ARRAY: u16 = 253;
pub const PID_PRODUCT_RQST: u16 = 254;
pub const PID_PRODUCT_DATA: u16 = 255;

/// How long to wait for the optional protocol array after product data
const PROTOCOL_ARRAY_TIMEOUT: Duration = Duration::from_secs(2);
/// How long to drain after an abort before giving up
const ABORT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
/// Quiescent window between accepting a baud change and reconfiguring
const BAUD_SETTLE: Duration = Duration::from_millis(100);
/// Flash writes go out in chunks of this many payload bytes
const MAP_CHUNK_SIZE: usize = 250;
/// Image pixel data arrives in chunks of at most this many bytes
const IMAGE_CHUNK_SIZE: usize = 496;

/// Packet ids of one link protocol. A zero entry means the link never
/// carries that packet; the roles that would use it are never negotiated
/// on such a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PidTable {
    pub command_data: u16,
    pub xfer_cmplt: u16,
    pub date_time_data: u16,
    pub position_data: u16,
    pub prx_wpt_data: u16,
    pub records: u16,
    pub enable_async_events: u16,
    pub rte_hdr: u16,
    pub rte_wpt_data: u16,
    pub rte_link_data: u16,
    pub almanac_data: u16,
    pub trk_data: u16,
    pub trk_hdr: u16,
    pub wpt_data: u16,
    pub mem_write: u16,
    pub unit_id: u16,
    pub mem_wrdi: u16,
    pub baud_rqst_data: u16,
    pub baud_acpt_data: u16,
    pub pvt_data: u16,
    pub screen_data: u16,
    pub mem_wel: u16,
    pub mem_wren: u16,
    pub mem_read: u16,
    pub mem_chunk: u16,
    pub mem_records: u16,
    pub mem_data: u16,
    pub capacity_data: u16,
    pub flightbook_record: u16,
    pub lap: u16,
    pub baud_data: u16,
    pub image_name_rx: u16,
    pub image_name_tx: u16,
    pub image_list_rx: u16,
    pub image_list_tx: u16,
    pub image_props_rx: u16,
    pub image_props_tx: u16,
    pub image_id_rx: u16,
    pub image_id_tx: u16,
    pub image_data_cmplt: u16,
    pub image_data_rx: u16,
    pub image_data_tx: u16,
    pub color_table_rx: u16,
    pub color_table_tx: u16,
    pub image_type_idx_rx: u16,
    pub image_type_idx_tx: u16,
    pub image_type_name_rx: u16,
    pub image_type_name_tx: u16,
    pub run: u16,
    pub workout: u16,
    pub workout_occurrence: u16,
    pub fitness_user_profile: u16,
    pub workout_limits: u16,
    pub course: u16,
    pub course_lap: u16,
    pub course_point: u16,
    pub course_trk_hdr: u16,
    pub course_trk_data: u16,
    pub course_limits: u16,
}

/// L001, the link protocol used by most devices.
pub static L001: PidTable = PidTable {
    command_data: 10,
    xfer_cmplt: 12,
    date_time_data: 14,
    position_data: 17,
    prx_wpt_data: 19,
    records: 27,
    enable_async_events: 28,
    rte_hdr: 29,
    rte_wpt_data: 30,
    almanac_data: 31,
    trk_data: 34,
    wpt_data: 35,
    mem_write: 36,
    unit_id: 38,
    mem_wrdi: 45,
    baud_rqst_data: 48,
    baud_acpt_data: 49,
    pvt_data: 51,
    screen_data: 69,
    mem_wel: 74,
    mem_wren: 75,
    mem_read: 89,
    mem_chunk: 90,
    mem_records: 91,
    mem_data: 92,
    capacity_data: 95,
    rte_link_data: 98,
    trk_hdr: 99,
    flightbook_record: 134,
    lap: 149,
    baud_data: 252,
    image_name_rx: 875,
    image_name_tx: 876,
    image_list_rx: 877,
    image_list_tx: 878,
    image_props_rx: 879,
    image_props_tx: 880,
    image_id_rx: 881,
    image_id_tx: 882,
    image_data_cmplt: 883,
    image_data_rx: 884,
    image_data_tx: 885,
    color_table_rx: 886,
    color_table_tx: 887,
    image_type_idx_rx: 888,
    image_type_idx_tx: 889,
    image_type_name_rx: 890,
    image_type_name_tx: 891,
    run: 990,
    workout: 991,
    workout_occurrence: 992,
    fitness_user_profile: 993,
    workout_limits: 994,
    course: 1061,
    course_lap: 1062,
    course_point: 1063,
    course_trk_hdr: 1064,
    course_trk_data: 1065,
    course_limits: 1066,
};

/// L002, used by panel-mounted aviation devices.
pub static L002: PidTable = PidTable {
    almanac_data: 4,
    command_data: 11,
    xfer_cmplt: 12,
    date_time_data: 20,
    position_data: 24,
    prx_wpt_data: 27,
    records: 35,
    rte_hdr: 37,
    rte_wpt_data: 39,
    wpt_data: 43,
    enable_async_events: 0,
    rte_link_data: 0,
    trk_data: 0,
    trk_hdr: 0,
    mem_write: 0,
    unit_id: 0,
    mem_wrdi: 0,
    baud_rqst_data: 0,
    baud_acpt_data: 0,
    pvt_data: 0,
    screen_data: 0,
    mem_wel: 0,
    mem_wren: 0,
    mem_read: 0,
    mem_chunk: 0,
    mem_records: 0,
    mem_data: 0,
    capacity_data: 0,
    flightbook_record: 0,
    lap: 0,
    baud_data: 0,
    image_name_rx: 0,
    image_name_tx: 0,
    image_list_rx: 0,
    image_list_tx: 0,
    image_props_rx: 0,
    image_props_tx: 0,
    image_id_rx: 0,
    image_id_tx: 0,
    image_data_cmplt: 0,
    image_data_rx: 0,
    image_data_tx: 0,
    color_table_rx: 0,
    color_table_tx: 0,
    image_type_idx_rx: 0,
    image_type_idx_tx: 0,
    image_type_name_rx: 0,
    image_type_name_tx: 0,
    run: 0,
    workout: 0,
    workout_occurrence: 0,
    fitness_user_profile: 0,
    workout_limits: 0,
    course: 0,
    course_lap: 0,
    course_point: 0,
    course_trk_hdr: 0,
    course_trk_data: 0,
    course_limits: 0,
};

/// Which link protocol the session speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkProtocol {
    #[default]
    L001,
    L002,
}

impl LinkProtocol {
    pub fn pids(&self) -> &'static PidTable {
        match self {
            LinkProtocol::L001 => &L001,
            LinkProtocol::L002 => &L002,
        }
    }
}

/// Transfer-trigger opcodes, mapped to numbers by the negotiated command
/// set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    AbortTransfer,
    TransferAlm,
    TransferPosn,
    TransferPrx,
    TransferRte,
    TransferTime,
    TransferTrk,
    TransferWpt,
    TurnOffPwr,
    TransferUnitId,
    TransferScreen,
    StartPvtData,
    StopPvtData,
    TransferBaud,
    AckPing,
    TransferMem,
    FlightBookTransfer,
    TransferLaps,
    TransferRuns,
    TransferWorkouts,
    TransferWorkoutOccurrences,
    TransferFitnessUserProfile,
    TransferWorkoutLimits,
    TransferCourses,
    TransferCourseLaps,
    TransferCoursePoints,
    TransferCourseTracks,
    TransferCourseLimits,
}

/// The two device command protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandSet {
    #[default]
    A010,
    A011,
}

impl CommandSet {
    /// The opcode a command travels as, or `ProtocolNotSupported` when the
    /// set has no encoding for it.
    pub fn code(&self, command: Command) -> Result<u16> {
        use Command::*;
        let code = match self {
            CommandSet::A010 => match command {
                AbortTransfer => 0,
                TransferAlm => 1,
                TransferPosn => 2,
                TransferPrx => 3,
                TransferRte => 4,
                TransferTime => 5,
                TransferTrk => 6,
                TransferWpt => 7,
                TurnOffPwr => 8,
                TransferUnitId => 14,
                TransferScreen => 32,
                StartPvtData => 49,
                StopPvtData => 50,
                TransferBaud => 57,
                AckPing => 58,
                TransferMem => 63,
                FlightBookTransfer => 92,
                TransferLaps => 117,
                TransferRuns => 450,
                TransferWorkouts => 451,
                TransferWorkoutOccurrences => 452,
                TransferFitnessUserProfile => 453,
                TransferWorkoutLimits => 454,
                TransferCourses => 561,
                TransferCourseLaps => 562,
                TransferCoursePoints => 563,
                TransferCourseTracks => 564,
                TransferCourseLimits => 565,
            },
            CommandSet::A011 => match command {
                AbortTransfer => 0,
                TransferAlm => 4,
                TransferRte => 8,
                TransferPrx => 17,
                TransferTime => 20,
                TransferWpt => 21,
                TurnOffPwr => 26,
                _ => {
                    return Err(GarminError::ProtocolNotSupported(
                        "command not in the A011 set",
                    ))
                }
            },
        };
        Ok(code)
    }
}

/// Tag of one protocol array element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolTag {
    Physical,
    Transmission,
    Link,
    Application,
    DataType,
}

impl ProtocolTag {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'P' => Some(Self::Physical),
            b'T' => Some(Self::Transmission),
            b'L' => Some(Self::Link),
            b'A' => Some(Self::Application),
            b'D' => Some(Self::DataType),
            _ => None,
        }
    }
}

/// One tag-encoded protocol or datatype id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolEntry {
    pub tag: ProtocolTag,
    pub number: u16,
}

/// Decode a protocol array payload: a sequence of one-byte tags each
/// followed by a 16-bit id. Unknown tags are skipped.
pub fn decode_protocol_array(data: &[u8]) -> Result<Vec<ProtocolEntry>> {
    if data.len() % 3 != 0 {
        return Err(GarminError::ShortPayload {
            needed: data.len().next_multiple_of(3),
            available: data.len(),
        });
    }
    let mut entries = Vec::with_capacity(data.len() / 3);
    for chunk in data.chunks_exact(3) {
        let number = u16::from_le_bytes([chunk[1], chunk[2]]);
        match ProtocolTag::from_byte(chunk[0]) {
            Some(tag) => entries.push(ProtocolEntry { tag, number }),
            None => warn!("Unknown protocol tag {:#04x}, skipping", chunk[0]),
        }
    }
    Ok(entries)
}

/// Route capability: which header, waypoint, and link datatypes travel in
/// a route transfer, and whether links travel at all (A201).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteCapability {
    pub header: RouteHeaderFormat,
    pub waypoint: WaypointFormat,
    pub links: bool,
}

/// Track capability: header datatype (absent on A300) and point datatype.
/// A302 devices only send tracks, they never accept them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackCapability {
    pub header: Option<TrackHeaderFormat>,
    pub point: TrackPointFormat,
    pub upload: bool,
}

/// The resolved protocol binding for one session. Every role a caller can
/// invoke resolves here or the call fails with `ProtocolNotSupported`.
#[derive(Debug, Clone, Default)]
pub struct ProtocolSet {
    pub link: LinkProtocol,
    pub command: Option<CommandSet>,
    pub waypoint: Option<WaypointFormat>,
    pub route: Option<RouteCapability>,
    pub track: Option<TrackCapability>,
    pub proximity: Option<WaypointFormat>,
    pub almanac: Option<AlmanacFormat>,
    pub datetime: bool,
    pub flightbook: bool,
    pub position: bool,
    pub pvt: bool,
    pub lap: Option<LapFormat>,
    pub run: Option<RunFormat>,
    pub workout: bool,
    pub workout_occurrence: bool,
    pub fitness_profile: bool,
    pub workout_limits: bool,
    pub course: bool,
    pub course_lap: bool,
    pub course_point: bool,
    pub course_limits: bool,
    pub course_track: Option<TrackCapability>,
}

impl ProtocolSet {
    pub fn pids(&self) -> &'static PidTable {
        self.link.pids()
    }

    pub fn command_set(&self) -> Result<CommandSet> {
        self.command
            .ok_or(GarminError::ProtocolNotSupported("device command protocol"))
    }

    /// Build the protocol set from tag-encoded tuples, either received in
    /// an A001 protocol array or looked up in the catalog.
    ///
    /// Tuples group into stacks: a physical entry, a link, then
    /// application entries each consuming the datatype entries that follow
    /// it up to the next application or physical entry.
    pub fn from_entries(entries: &[ProtocolEntry]) -> Self {
        let mut set = ProtocolSet::default();
        let mut i = 0;
        while i < entries.len() {
            let entry = entries[i];
            i += 1;
            match entry.tag {
                ProtocolTag::Physical => {
                    // The physical layer is already up by the time we parse this
                    debug!("Physical protocol P{:03}", entry.number);
                }
                ProtocolTag::Transmission => {
                    debug!("Transmission protocol T{:03}", entry.number);
                }
                ProtocolTag::Link => match entry.number {
                    1 => set.link = LinkProtocol::L001,
                    2 => set.link = LinkProtocol::L002,
                    0 => {}
                    other => warn!("Unknown link protocol L{other:03}, keeping default"),
                },
                ProtocolTag::Application => {
                    // Collect the datatypes belonging to this application protocol
                    let start = i;
                    while i < entries.len() && entries[i].tag == ProtocolTag::DataType {
                        i += 1;
                    }
                    let datatypes: Vec<u16> =
                        entries[start..i].iter().map(|e| e.number).collect();
                    set.register(entry.number, &datatypes);
                }
                ProtocolTag::DataType => {
                    warn!(
                        "Datatype D{:03} outside any application protocol, ignoring",
                        entry.number
                    );
                }
            }
        }
        set
    }

    fn register(&mut self, protocol: u16, datatypes: &[u16]) {
        let first = datatypes.first().copied();
        match protocol {
            10 => self.command = Some(CommandSet::A010),
            11 => self.command = Some(CommandSet::A011),
            100 => self.waypoint = first.and_then(WaypointFormat::from_number),
            200 | 201 => {
                let header = first.and_then(RouteHeaderFormat::from_number);
                let waypoint = datatypes.get(1).copied().and_then(WaypointFormat::from_number);
                if let (Some(header), Some(waypoint)) = (header, waypoint) {
                    self.route = Some(RouteCapability {
                        header,
                        waypoint,
                        links: protocol == 201,
                    });
                }
            }
            300 => {
                self.track = first.and_then(TrackPointFormat::from_number).map(|point| {
                    TrackCapability {
                        header: None,
                        point,
                        upload: true,
                    }
                })
            }
            301 | 302 => {
                let header = first.and_then(TrackHeaderFormat::from_number);
                let point = datatypes.get(1).copied().and_then(TrackPointFormat::from_number);
                if let (Some(header), Some(point)) = (header, point) {
                    self.track = Some(TrackCapability {
                        header: Some(header),
                        point,
                        upload: protocol != 302,
                    });
                }
            }
            400 => self.proximity = first.and_then(WaypointFormat::from_number),
            500 => self.almanac = first.and_then(AlmanacFormat::from_number),
            600 | 601 => self.datetime = true,
            650 => self.flightbook = true,
            700 => self.position = true,
            800 => self.pvt = true,
            906 => self.lap = first.and_then(LapFormat::from_number),
            1000 => self.run = first.and_then(RunFormat::from_number),
            1002 => self.workout = true,
            1003 => self.workout_occurrence = true,
            1004 => self.fitness_profile = true,
            1005 => self.workout_limits = true,
            1006 => self.course = true,
            1007 => self.course_lap = true,
            1008 => self.course_point = true,
            1009 => self.course_limits = true,
            1012 => {
                let header = first.and_then(TrackHeaderFormat::from_number);
                let point = datatypes.get(1).copied().and_then(TrackPointFormat::from_number);
                if let (Some(header), Some(point)) = (header, point) {
                    self.course_track = Some(TrackCapability {
                        header: Some(header),
                        point,
                        upload: false,
                    });
                }
            }
            other => info!("Ignoring unsupported application protocol A{other:03}"),
        }
    }
}

/// Outcome of session startup: who the device is and what it speaks.
#[derive(Debug, Clone)]
pub struct Negotiation {
    pub product: ProductInfo,
    pub extra: Vec<String>,
    pub protocols: ProtocolSet,
}

/// Run A000 product inquiry and A001 capability discovery, falling back to
/// the static catalog for devices that never send a protocol array.
pub fn negotiate(link: &mut dyn Link) -> Result<Negotiation> {
    info!("Requesting product data");
    link.send_packet(&Packet::empty(PID_PRODUCT_RQST))?;
    let packet = link.expect_packet(PID_PRODUCT_DATA)?;
    let product = ProductInfo::decode(&packet.data)?;
    info!(
        "Product {} version {:.2}: {}",
        product.product_id,
        product.version(),
        product.description.first().map(String::as_str).unwrap_or("")
    );

    // Newer units follow up with extended product data and a protocol
    // array; older units go silent.
    link.set_timeout(PROTOCOL_ARRAY_TIMEOUT)?;
    let mut extra = Vec::new();
    let mut entries = None;
    loop {
        match link.read_packet() {
            Ok(p) if p.id == PID_EXT_PRODUCT_DATA => {
                let strings = decode_ext_product_data(&p.data);
                debug!("Extended product data: {strings:?}");
                extra.extend(strings);
            }
            Ok(p) if p.id == PID_PROTOCOL_ARRAY => {
                entries = Some(decode_protocol_array(&p.data)?);
                break;
            }
            Ok(p) => {
                warn!("Unexpected {p} during negotiation, falling back to the catalog");
                break;
            }
            Err(e) if e.is_timeout() => break,
            Err(e) => return Err(e),
        }
    }
    link.set_timeout(crate::phys::DEFAULT_TIMEOUT)?;

    let entries = match entries {
        Some(entries) => {
            info!("Device reported {} protocol entries", entries.len());
            entries
        }
        None => {
            info!("No protocol array; using the capability catalog");
            catalog::lookup(product.product_id, product.software_version)?
        }
    };
    let protocols = ProtocolSet::from_entries(&entries);

    Ok(Negotiation {
        product,
        extra,
        protocols,
    })
}

/// Cooperative cancellation for a transfer in flight.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Re-arm the token so the session can run another transfer.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Send a command opcode in a command-data packet.
pub fn send_command(link: &mut dyn Link, set: &ProtocolSet, command: Command) -> Result<()> {
    let code = set.command_set()?.code(command)?;
    debug!("Command {command:?} (opcode {code})");
    link.send_packet(&Packet::with_u16(set.pids().command_data, code))
}

/// Abort the transfer in flight and drain the device until it confirms
/// with Transfer Complete or goes quiet.
pub fn abort_transfer(link: &mut dyn Link, set: &ProtocolSet) -> Result<()> {
    info!("Aborting transfer");
    send_command(link, set, Command::AbortTransfer)?;
    let deadline = Instant::now() + ABORT_DRAIN_TIMEOUT;
    link.set_timeout(Duration::from_millis(250))?;
    while Instant::now() < deadline {
        match link.read_packet() {
            Ok(p) if p.id == set.pids().xfer_cmplt => break,
            Ok(p) => debug!("Draining {p}"),
            Err(e) if e.is_timeout() => break,
            Err(_) => break,
        }
    }
    link.set_timeout(crate::phys::DEFAULT_TIMEOUT)?;
    Ok(())
}

/// Generic bulk download: command, Records{N}, N records, Transfer
/// Complete. The closure decodes each record packet and may reject its id.
fn download<T>(
    link: &mut dyn Link,
    set: &ProtocolSet,
    command: Command,
    cancel: &CancelToken,
    mut decode: impl FnMut(&Packet) -> Result<T>,
) -> Result<Vec<T>> {
    send_command(link, set, command)?;
    let packet = link.expect_packet(set.pids().records)?;
    let count = Records::decode(&packet.data)?.0;
    info!("Expecting {count} records");

    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if cancel.is_cancelled() {
            abort_transfer(link, set)?;
            return Err(GarminError::Cancelled);
        }
        let packet = link.read_packet()?;
        out.push(decode(&packet)?);
    }
    link.expect_packet(set.pids().xfer_cmplt)
        .map_err(|e| match e {
            GarminError::UnexpectedPacket { got, .. } => GarminError::ProtocolViolation(format!(
                "missing Transfer Complete, got packet {got}"
            )),
            other => other,
        })?;
    Ok(out)
}

/// Generic bulk upload: Records{N}, N records, Transfer Complete carrying
/// the triggering opcode. The device acknowledges every step.
fn upload(
    link: &mut dyn Link,
    set: &ProtocolSet,
    command: Command,
    cancel: &CancelToken,
    packets: &[Packet],
) -> Result<()> {
    info!("Sending {} records", packets.len());
    let count = Records(u16::try_from(packets.len()).map_err(|_| {
        GarminError::ProtocolViolation("more than 65535 records in one transfer".into())
    })?);
    link.send_packet(&Packet::new(set.pids().records, count.encode()))?;
    for packet in packets {
        if cancel.is_cancelled() {
            abort_transfer(link, set)?;
            return Err(GarminError::Cancelled);
        }
        link.send_packet(packet)?;
    }
    let code = set.command_set()?.code(command)?;
    link.send_packet(&Packet::with_u16(set.pids().xfer_cmplt, code))
}

fn expect_pid<'a>(packet: &'a Packet, pid: u16, what: &str) -> Result<&'a [u8]> {
    if packet.id != pid {
        return Err(GarminError::ProtocolViolation(format!(
            "expected {what} packet {pid}, got {}",
            packet.id
        )));
    }
    Ok(&packet.data)
}

// --------------------------------------------------------------------------
// Waypoints (A100) and proximity waypoints (A400)

pub fn get_waypoints(
    link: &mut dyn Link,
    set: &ProtocolSet,
    cancel: &CancelToken,
) -> Result<Vec<Waypoint>> {
    let format = set
        .waypoint
        .ok_or(GarminError::ProtocolNotSupported("waypoint transfer"))?;
    let pid = set.pids().wpt_data;
    download(link, set, Command::TransferWpt, cancel, |packet| {
        Waypoint::decode(format, expect_pid(packet, pid, "waypoint")?)
    })
}

pub fn put_waypoints(
    link: &mut dyn Link,
    set: &ProtocolSet,
    cancel: &CancelToken,
    waypoints: &[Waypoint],
) -> Result<()> {
    let format = set
        .waypoint
        .ok_or(GarminError::ProtocolNotSupported("waypoint transfer"))?;
    let pid = set.pids().wpt_data;
    let packets: Vec<Packet> = waypoints
        .iter()
        .map(|w| Packet::new(pid, w.encode(format)))
        .collect();
    upload(link, set, Command::TransferWpt, cancel, &packets)
}

pub fn get_proximities(
    link: &mut dyn Link,
    set: &ProtocolSet,
    cancel: &CancelToken,
) -> Result<Vec<Waypoint>> {
    let format = set
        .proximity
        .ok_or(GarminError::ProtocolNotSupported("proximity transfer"))?;
    let pid = set.pids().prx_wpt_data;
    download(link, set, Command::TransferPrx, cancel, |packet| {
        Waypoint::decode(format, expect_pid(packet, pid, "proximity waypoint")?)
    })
}

pub fn put_proximities(
    link: &mut dyn Link,
    set: &ProtocolSet,
    cancel: &CancelToken,
    waypoints: &[Waypoint],
) -> Result<()> {
    let format = set
        .proximity
        .ok_or(GarminError::ProtocolNotSupported("proximity transfer"))?;
    let pid = set.pids().prx_wpt_data;
    let packets: Vec<Packet> = waypoints
        .iter()
        .map(|w| Packet::new(pid, w.encode(format)))
        .collect();
    upload(link, set, Command::TransferPrx, cancel, &packets)
}

// --------------------------------------------------------------------------
// Routes (A200/A201)

pub fn get_routes(
    link: &mut dyn Link,
    set: &ProtocolSet,
    cancel: &CancelToken,
) -> Result<Vec<Route>> {
    let capability = set
        .route
        .ok_or(GarminError::ProtocolNotSupported("route transfer"))?;
    let pids = set.pids();
    let mut routes: Vec<Route> = Vec::new();
    download(link, set, Command::TransferRte, cancel, |packet| {
        if packet.id == pids.rte_hdr {
            routes.push(Route {
                header: RouteHeader::decode(capability.header, &packet.data)?,
                ..Route::default()
            });
        } else if packet.id == pids.rte_wpt_data {
            let route = routes.last_mut().ok_or_else(|| {
                GarminError::ProtocolViolation("route waypoint before any route header".into())
            })?;
            route
                .waypoints
                .push(Waypoint::decode(capability.waypoint, &packet.data)?);
        } else if capability.links && packet.id == pids.rte_link_data {
            let route = routes.last_mut().ok_or_else(|| {
                GarminError::ProtocolViolation("route link before any route header".into())
            })?;
            route.links.push(RouteLink::decode(&packet.data)?);
        } else {
            return Err(GarminError::ProtocolViolation(format!(
                "unexpected packet {} in route transfer",
                packet.id
            )));
        }
        Ok(())
    })?;
    Ok(routes)
}

pub fn put_routes(
    link: &mut dyn Link,
    set: &ProtocolSet,
    cancel: &CancelToken,
    routes: &[Route],
) -> Result<()> {
    let capability = set
        .route
        .ok_or(GarminError::ProtocolNotSupported("route transfer"))?;
    let pids = set.pids();
    let mut packets = Vec::new();
    for route in routes {
        packets.push(Packet::new(
            pids.rte_hdr,
            route.header.encode(capability.header),
        ));
        for (i, waypoint) in route.waypoints.iter().enumerate() {
            packets.push(Packet::new(
                pids.rte_wpt_data,
                waypoint.encode(capability.waypoint),
            ));
            // A201 alternates waypoints and links
            if capability.links && i + 1 < route.waypoints.len() {
                let link_rec = route.links.get(i).cloned().unwrap_or_default();
                packets.push(Packet::new(pids.rte_link_data, link_rec.encode()));
            }
        }
    }
    upload(link, set, Command::TransferRte, cancel, &packets)
}

// --------------------------------------------------------------------------
// Tracks (A300/A301/A302)

fn group_tracks(
    link: &mut dyn Link,
    set: &ProtocolSet,
    command: Command,
    cancel: &CancelToken,
    capability: TrackCapability,
    header_pid: u16,
    point_pid: u16,
) -> Result<Vec<Track>> {
    let mut tracks: Vec<Track> = Vec::new();
    download(link, set, command, cancel, |packet| {
        if let (Some(header_format), true) = (capability.header, packet.id == header_pid) {
            tracks.push(Track {
                header: Some(TrackHeader::decode(header_format, &packet.data)?),
                points: Vec::new(),
            });
        } else if packet.id == point_pid {
            if tracks.is_empty() {
                // A300 has no headers; everything goes in one track log
                tracks.push(Track::default());
            }
            let track = tracks.last_mut().expect("pushed above");
            track
                .points
                .push(TrackPoint::decode(capability.point, &packet.data)?);
        } else {
            return Err(GarminError::ProtocolViolation(format!(
                "unexpected packet {} in track transfer",
                packet.id
            )));
        }
        Ok(())
    })?;
    Ok(tracks)
}

pub fn get_tracks(
    link: &mut dyn Link,
    set: &ProtocolSet,
    cancel: &CancelToken,
) -> Result<Vec<Track>> {
    let capability = set
        .track
        .ok_or(GarminError::ProtocolNotSupported("track transfer"))?;
    let pids = set.pids();
    group_tracks(
        link,
        set,
        Command::TransferTrk,
        cancel,
        capability,
        pids.trk_hdr,
        pids.trk_data,
    )
}

pub fn put_tracks(
    link: &mut dyn Link,
    set: &ProtocolSet,
    cancel: &CancelToken,
    tracks: &[Track],
) -> Result<()> {
    let capability = set
        .track
        .ok_or(GarminError::ProtocolNotSupported("track transfer"))?;
    if !capability.upload {
        return Err(GarminError::ProtocolNotSupported(
            "track upload on a download-only device",
        ));
    }
    let pids = set.pids();
    let mut packets = Vec::new();
    for track in tracks {
        if let (Some(header_format), Some(header)) = (capability.header, &track.header) {
            packets.push(Packet::new(pids.trk_hdr, header.encode(header_format)));
        }
        for point in &track.points {
            packets.push(Packet::new(pids.trk_data, point.encode(capability.point)));
        }
    }
    upload(link, set, Command::TransferTrk, cancel, &packets)
}

// --------------------------------------------------------------------------
// Almanac (A500), date/time (A600), position (A700)

pub fn get_almanac(
    link: &mut dyn Link,
    set: &ProtocolSet,
    cancel: &CancelToken,
) -> Result<Vec<Almanac>> {
    let format = set
        .almanac
        .ok_or(GarminError::ProtocolNotSupported("almanac transfer"))?;
    let pid = set.pids().almanac_data;
    download(link, set, Command::TransferAlm, cancel, |packet| {
        Almanac::decode(format, expect_pid(packet, pid, "almanac")?)
    })
}

pub fn get_time(link: &mut dyn Link, set: &ProtocolSet) -> Result<DateTimeRecord> {
    if !set.datetime {
        return Err(GarminError::ProtocolNotSupported("date and time protocol"));
    }
    send_command(link, set, Command::TransferTime)?;
    let packet = link.expect_packet(set.pids().date_time_data)?;
    DateTimeRecord::decode(&packet.data)
}

pub fn put_time(link: &mut dyn Link, set: &ProtocolSet, time: &DateTimeRecord) -> Result<()> {
    if !set.datetime {
        return Err(GarminError::ProtocolNotSupported("date and time protocol"));
    }
    link.send_packet(&Packet::new(set.pids().date_time_data, time.encode()))
}

pub fn get_position(link: &mut dyn Link, set: &ProtocolSet) -> Result<RadianPosition> {
    if !set.position {
        return Err(GarminError::ProtocolNotSupported(
            "position initialization protocol",
        ));
    }
    send_command(link, set, Command::TransferPosn)?;
    let packet = link.expect_packet(set.pids().position_data)?;
    let mut reader = crate::codec::Reader::new(&packet.data);
    RadianPosition::decode(&mut reader)
}

pub fn put_position(
    link: &mut dyn Link,
    set: &ProtocolSet,
    position: &RadianPosition,
) -> Result<()> {
    if !set.position {
        return Err(GarminError::ProtocolNotSupported(
            "position initialization protocol",
        ));
    }
    let mut writer = crate::codec::Writer::new();
    position.encode(&mut writer);
    link.send_packet(&Packet::new(set.pids().position_data, writer.into_bytes()))
}

// --------------------------------------------------------------------------
// PVT (A800)

pub fn pvt_on(link: &mut dyn Link, set: &ProtocolSet) -> Result<()> {
    if !set.pvt {
        return Err(GarminError::ProtocolNotSupported("PVT protocol"));
    }
    send_command(link, set, Command::StartPvtData)
}

pub fn pvt_off(link: &mut dyn Link, set: &ProtocolSet) -> Result<()> {
    send_command(link, set, Command::StopPvtData)
}

/// Read one PVT record, skipping the undocumented interleaved packets some
/// units emit while streaming.
pub fn read_pvt(link: &mut dyn Link, set: &ProtocolSet) -> Result<Pvt> {
    let pid = set.pids().pvt_data;
    loop {
        let packet = link.read_packet()?;
        if packet.id == pid {
            return Pvt::decode(&packet.data);
        }
        debug!("Skipping {packet} while streaming PVT");
    }
}

// --------------------------------------------------------------------------
// Flightbook (A650) and the fitness family (A906, A1000, A100x)

pub fn get_flightbook(
    link: &mut dyn Link,
    set: &ProtocolSet,
    cancel: &CancelToken,
) -> Result<Vec<FlightBookRecord>> {
    if !set.flightbook {
        return Err(GarminError::ProtocolNotSupported("flightbook transfer"));
    }
    let pid = set.pids().flightbook_record;
    download(link, set, Command::FlightBookTransfer, cancel, |packet| {
        FlightBookRecord::decode(expect_pid(packet, pid, "flightbook record")?)
    })
}

pub fn get_laps(
    link: &mut dyn Link,
    set: &ProtocolSet,
    cancel: &CancelToken,
) -> Result<Vec<Lap>> {
    let format = set
        .lap
        .ok_or(GarminError::ProtocolNotSupported("lap transfer"))?;
    let pid = set.pids().lap;
    download(link, set, Command::TransferLaps, cancel, |packet| {
        Lap::decode(format, expect_pid(packet, pid, "lap")?)
    })
}

/// Everything a run download yields: the runs plus the laps and tracks the
/// protocol chains onto the same conversation.
#[derive(Debug, Clone, Default)]
pub struct RunTransfer {
    pub runs: Vec<Run>,
    pub laps: Vec<Lap>,
    pub tracks: Vec<Track>,
}

pub fn get_runs(
    link: &mut dyn Link,
    set: &ProtocolSet,
    cancel: &CancelToken,
) -> Result<RunTransfer> {
    let format = set
        .run
        .ok_or(GarminError::ProtocolNotSupported("run transfer"))?;
    let pid = set.pids().run;
    let runs = download(link, set, Command::TransferRuns, cancel, |packet| {
        Run::decode(format, expect_pid(packet, pid, "run")?)
    })?;
    // The run protocol chains lap and track downloads behind the runs
    let laps = get_laps(link, set, cancel)?;
    let tracks = get_tracks(link, set, cancel)?;
    Ok(RunTransfer { runs, laps, tracks })
}

pub fn get_workouts(
    link: &mut dyn Link,
    set: &ProtocolSet,
    cancel: &CancelToken,
) -> Result<Vec<Workout>> {
    if !set.workout {
        return Err(GarminError::ProtocolNotSupported("workout transfer"));
    }
    let pid = set.pids().workout;
    download(link, set, Command::TransferWorkouts, cancel, |packet| {
        Workout::decode(expect_pid(packet, pid, "workout")?)
    })
}

pub fn get_workout_occurrences(
    link: &mut dyn Link,
    set: &ProtocolSet,
    cancel: &CancelToken,
) -> Result<Vec<WorkoutOccurrence>> {
    if !set.workout_occurrence {
        return Err(GarminError::ProtocolNotSupported(
            "workout occurrence transfer",
        ));
    }
    let pid = set.pids().workout_occurrence;
    download(
        link,
        set,
        Command::TransferWorkoutOccurrences,
        cancel,
        |packet| WorkoutOccurrence::decode(expect_pid(packet, pid, "workout occurrence")?),
    )
}

pub fn get_fitness_user_profile(
    link: &mut dyn Link,
    set: &ProtocolSet,
) -> Result<FitnessUserProfile> {
    if !set.fitness_profile {
        return Err(GarminError::ProtocolNotSupported(
            "fitness user profile transfer",
        ));
    }
    send_command(link, set, Command::TransferFitnessUserProfile)?;
    let packet = link.expect_packet(set.pids().fitness_user_profile)?;
    FitnessUserProfile::decode(&packet.data)
}

pub fn get_workout_limits(link: &mut dyn Link, set: &ProtocolSet) -> Result<WorkoutLimits> {
    if !set.workout_limits {
        return Err(GarminError::ProtocolNotSupported("workout limits transfer"));
    }
    send_command(link, set, Command::TransferWorkoutLimits)?;
    let packet = link.expect_packet(set.pids().workout_limits)?;
    WorkoutLimits::decode(&packet.data)
}

pub fn get_courses(
    link: &mut dyn Link,
    set: &ProtocolSet,
    cancel: &CancelToken,
) -> Result<Vec<Course>> {
    if !set.course {
        return Err(GarminError::ProtocolNotSupported("course transfer"));
    }
    let pid = set.pids().course;
    download(link, set, Command::TransferCourses, cancel, |packet| {
        Course::decode(expect_pid(packet, pid, "course")?)
    })
}

pub fn get_course_laps(
    link: &mut dyn Link,
    set: &ProtocolSet,
    cancel: &CancelToken,
) -> Result<Vec<CourseLap>> {
    if !set.course_lap {
        return Err(GarminError::ProtocolNotSupported("course lap transfer"));
    }
    let pid = set.pids().course_lap;
    download(link, set, Command::TransferCourseLaps, cancel, |packet| {
        CourseLap::decode(expect_pid(packet, pid, "course lap")?)
    })
}

pub fn get_course_points(
    link: &mut dyn Link,
    set: &ProtocolSet,
    cancel: &CancelToken,
) -> Result<Vec<CoursePoint>> {
    if !set.course_point {
        return Err(GarminError::ProtocolNotSupported("course point transfer"));
    }
    let pid = set.pids().course_point;
    download(link, set, Command::TransferCoursePoints, cancel, |packet| {
        CoursePoint::decode(expect_pid(packet, pid, "course point")?)
    })
}

pub fn get_course_limits(link: &mut dyn Link, set: &ProtocolSet) -> Result<CourseLimits> {
    if !set.course_limits {
        return Err(GarminError::ProtocolNotSupported("course limits transfer"));
    }
    send_command(link, set, Command::TransferCourseLimits)?;
    let packet = link.expect_packet(set.pids().course_limits)?;
    CourseLimits::decode(&packet.data)
}

pub fn get_course_tracks(
    link: &mut dyn Link,
    set: &ProtocolSet,
    cancel: &CancelToken,
) -> Result<Vec<Track>> {
    // Without A1012 the course track datatypes fall back to the track log's
    let capability = match (set.course_track, set.track) {
        (Some(capability), _) => capability,
        (None, Some(track)) if set.course => TrackCapability {
            upload: false,
            ..track
        },
        _ => return Err(GarminError::ProtocolNotSupported("course track transfer")),
    };
    let pids = set.pids();
    group_tracks(
        link,
        set,
        Command::TransferCourseTracks,
        cancel,
        capability,
        pids.course_trk_hdr,
        pids.course_trk_data,
    )
}

// --------------------------------------------------------------------------
// Unit id

pub fn get_unit_id(link: &mut dyn Link, set: &ProtocolSet) -> Result<u32> {
    send_command(link, set, Command::TransferUnitId)?;
    let packet = link.expect_packet(set.pids().unit_id)?;
    Ok(packet.data_as_u32())
}

// --------------------------------------------------------------------------
// Baud rate negotiation (serial only)

/// The standard rates a device may accept.
const BAUDRATES: [u32; 8] = [9600, 14400, 19200, 28800, 38400, 57600, 115200, 250000];

/// Snap a device-reported rate to the standard series. UART tolerance is
/// tight, so anything further than 2.5 % off is unusable.
pub fn desired_baudrate(reported: u32) -> Option<u32> {
    BAUDRATES.iter().copied().find(|&b| {
        let delta = reported.abs_diff(b) as f64;
        delta / b as f64 <= 0.025
    })
}

pub fn get_supported_baudrates(link: &mut dyn Link, set: &ProtocolSet) -> Result<Vec<u32>> {
    send_command(link, set, Command::TransferBaud)?;
    let packet = link.expect_packet(set.pids().baud_data)?;
    let mut rates = Vec::new();
    for chunk in packet.data.chunks_exact(4) {
        let raw = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        if let Some(rate) = desired_baudrate(raw) {
            rates.push(rate);
        }
    }
    info!("Supported baudrates: {rates:?}");
    Ok(rates)
}

/// Change the line rate. The device echoes the closest rate it accepts;
/// after a quiescent window the port is reconfigured and the new rate is
/// confirmed with two ping commands. Any failure reverts to 9600.
pub fn set_baudrate(link: &mut dyn Link, set: &ProtocolSet, baud: u32) -> Result<u32> {
    let pids = set.pids();
    info!("Requesting baudrate change to {baud}");
    link.send_packet(&Packet::new(pids.enable_async_events, vec![0, 0]))?;
    link.send_packet(&Packet::new(
        pids.baud_rqst_data,
        baud.to_le_bytes().to_vec(),
    ))?;
    let packet = link.expect_packet(pids.baud_acpt_data)?;
    let accepted = packet.data_as_u32();
    let desired = desired_baudrate(accepted).ok_or_else(|| {
        GarminError::ProtocolViolation(format!("device accepted unusable baudrate {accepted}"))
    })?;
    info!("Device accepted {accepted}, using {desired}");

    // Let the line drain before switching speed
    std::thread::sleep(BAUD_SETTLE);
    link.set_baud_rate(desired)?;
    let confirm = (|| -> Result<()> {
        send_command(link, set, Command::AckPing)?;
        send_command(link, set, Command::AckPing)?;
        Ok(())
    })();
    match confirm {
        Ok(()) => Ok(desired),
        Err(e) => {
            // The device resets to 9600 itself when the pings don't arrive
            warn!("Baudrate confirmation failed ({e}), reverting to 9600");
            link.set_baud_rate(9600)?;
            Err(e)
        }
    }
}

// --------------------------------------------------------------------------
// Screenshot transfer

/// Fixed palette of the 2 bpp screenshot format, which never sends a color
/// table.
const GRAY_PALETTE: [Rgb; 4] = [
    Rgb { red: 255, green: 255, blue: 255 },
    Rgb { red: 192, green: 192, blue: 192 },
    Rgb { red: 128, green: 128, blue: 128 },
    Rgb { red: 0, green: 0, blue: 0 },
];

/// Rearrange a bottom-up padded pixel array into top-down unpadded rows.
fn rows_top_down(pixel_array: &[u8], bytewidth: usize, row_size: usize, height: usize) -> Vec<u8> {
    let mut pixels = Vec::with_capacity(row_size * height);
    for row in (0..height).rev() {
        let start = row * bytewidth;
        let end = (start + row_size).min(pixel_array.len());
        if start >= pixel_array.len() {
            break;
        }
        pixels.extend_from_slice(&pixel_array[start..end]);
    }
    pixels
}

pub fn get_screenshot(link: &mut dyn Link, set: &ProtocolSet) -> Result<Image> {
    send_command(link, set, Command::TransferScreen)?;
    let pid = set.pids().screen_data;
    let packet = link.expect_packet(pid)?;
    let (bytewidth, bpp, width, height) = match ScreenshotSection::decode(&packet.data)? {
        ScreenshotSection::Header {
            bytewidth,
            bpp,
            width,
            height,
        } => (bytewidth as usize, bpp, width, height),
        other => {
            return Err(GarminError::ProtocolViolation(format!(
                "screenshot began with {other:?}"
            )))
        }
    };
    info!("Screenshot {width}x{height} at {bpp} bpp");

    let mut palette = Vec::new();
    if bpp == 2 {
        palette.extend_from_slice(&GRAY_PALETTE);
    }
    let byte_size = bytewidth * height as usize;
    let mut pixel_array = Vec::with_capacity(byte_size);
    while pixel_array.len() < byte_size {
        let packet = link.expect_packet(pid)?;
        match ScreenshotSection::decode(&packet.data)? {
            ScreenshotSection::Color(color) => palette.push(color),
            ScreenshotSection::PixelRow { chunk, .. } => pixel_array.extend_from_slice(&chunk),
            ScreenshotSection::Header { .. } => {
                return Err(GarminError::ProtocolViolation(
                    "second screenshot header mid-stream".into(),
                ))
            }
        }
    }

    let row_size = width as usize * bpp as usize / 8;
    Ok(Image {
        width: width as u16,
        height: height as u16,
        bpp: bpp as u8,
        palette,
        pixels: rows_top_down(&pixel_array, bytewidth, row_size, height as usize),
    })
}

// --------------------------------------------------------------------------
// Image transfer

#[derive(Debug, Clone)]
pub struct ImageListEntry {
    pub prop: ImageProp,
    pub name: String,
}

pub fn get_image_types(link: &mut dyn Link, set: &ProtocolSet) -> Result<Vec<ImageListEntry>> {
    let pids = set.pids();
    link.send_packet(&Packet::empty(pids.image_type_idx_rx))?;
    let packet = link.expect_packet(pids.image_type_idx_tx)?;
    let indices = packet.data.clone();
    let mut types = Vec::with_capacity(indices.len());
    for idx in indices {
        link.send_packet(&Packet::with_u16(pids.image_type_name_rx, idx as u16))?;
        let packet = link.expect_packet(pids.image_type_name_tx)?;
        let mut reader = crate::codec::Reader::new(&packet.data);
        types.push(ImageListEntry {
            prop: ImageProp {
                idx: idx as u16,
                writable: false,
                image_type: idx,
            },
            name: reader.zstring()?,
        });
    }
    Ok(types)
}

pub fn get_image_list(link: &mut dyn Link, set: &ProtocolSet) -> Result<Vec<ImageListEntry>> {
    let pids = set.pids();
    link.send_packet(&Packet::empty(pids.image_list_rx))?;
    let packet = link.expect_packet(pids.image_list_tx)?;
    let props = decode_image_list(&packet.data)?;
    let mut entries = Vec::with_capacity(props.len());
    for prop in props {
        link.send_packet(&Packet::with_u16(pids.image_name_rx, prop.idx))?;
        let packet = link.expect_packet(pids.image_name_tx)?;
        let mut reader = crate::codec::Reader::new(&packet.data);
        entries.push(ImageListEntry {
            prop,
            name: reader.zstring()?,
        });
    }
    Ok(entries)
}

fn get_image_properties(link: &mut dyn Link, set: &ProtocolSet, idx: u16) -> Result<ImageInfo> {
    let pids = set.pids();
    link.send_packet(&Packet::with_u16(pids.image_props_rx, idx))?;
    let packet = link.expect_packet(pids.image_props_tx)?;
    if packet.data.is_empty() {
        return Err(GarminError::FieldRange {
            field: "image index",
            value: idx as u32,
        });
    }
    ImageInfo::decode(&packet.data)
}

fn get_image_id(link: &mut dyn Link, set: &ProtocolSet, idx: u16) -> Result<u32> {
    let pids = set.pids();
    link.send_packet(&Packet::with_u16(pids.image_id_rx, idx))?;
    let packet = link.expect_packet(pids.image_id_tx)?;
    Ok(packet.data_as_u32())
}

pub fn get_image(
    link: &mut dyn Link,
    set: &ProtocolSet,
    cancel: &CancelToken,
    idx: u16,
) -> Result<Image> {
    let pids = set.pids();
    let info = get_image_properties(link, set, idx)?;
    info!(
        "Image {idx}: {}x{} at {} bpp",
        info.width, info.height, info.bpp
    );
    let colors_used = info.colors_used().ok_or(GarminError::FieldRange {
        field: "bits per pixel",
        value: info.bpp as u32,
    })?;
    let id = get_image_id(link, set, idx)?;

    let mut palette = Vec::new();
    if colors_used > 0 {
        let pids = set.pids();
        link.send_packet(&Packet::new(pids.color_table_rx, id.to_le_bytes().to_vec()))?;
        let packet = link.expect_packet(pids.color_table_tx)?;
        let (table_id, colors) = decode_color_table(&packet.data)?;
        if table_id != id {
            return Err(GarminError::ProtocolViolation(format!(
                "color table for image {table_id}, expected {id}"
            )));
        }
        // The table may hold more colors than the depth can use
        palette = colors.into_iter().take(colors_used).collect();
    }

    let byte_size = info.byte_size();
    let chunk_count = byte_size.div_ceil(IMAGE_CHUNK_SIZE);
    debug!("Expecting {chunk_count} pixel chunks");
    let mut pixel_array = Vec::with_capacity(byte_size);
    for _ in 0..chunk_count {
        if cancel.is_cancelled() {
            return Err(GarminError::Cancelled);
        }
        link.send_packet(&Packet::new(pids.image_data_rx, id.to_le_bytes().to_vec()))?;
        let packet = link.expect_packet(pids.image_data_tx)?;
        let mut reader = crate::codec::Reader::new(&packet.data);
        let chunk_id = reader.u32()?;
        if chunk_id != id {
            return Err(GarminError::ProtocolViolation(format!(
                "pixel chunk for image {chunk_id}, expected {id}"
            )));
        }
        pixel_array.extend(reader.rest());
    }
    link.send_packet(&Packet::new(
        pids.image_data_cmplt,
        id.to_le_bytes().to_vec(),
    ))?;

    Ok(Image {
        width: info.width,
        height: info.height,
        bpp: info.bpp,
        palette,
        pixels: rows_top_down(
            &pixel_array,
            info.bytewidth as usize,
            info.row_size(),
            info.height as usize,
        ),
    })
}

pub fn put_image(
    link: &mut dyn Link,
    set: &ProtocolSet,
    cancel: &CancelToken,
    idx: u16,
    image: &Image,
) -> Result<()> {
    let pids = set.pids();
    let info = get_image_properties(link, set, idx)?;
    if info.bpp != image.bpp {
        return Err(GarminError::ProtocolViolation(format!(
            "image has {} bpp, device slot wants {}",
            image.bpp, info.bpp
        )));
    }
    if info.width != image.width || info.height != image.height {
        return Err(GarminError::ProtocolViolation(format!(
            "image is {}x{}, device slot wants {}x{}",
            image.width, image.height, info.width, info.height
        )));
    }
    let colors_used = info.colors_used().ok_or(GarminError::FieldRange {
        field: "bits per pixel",
        value: info.bpp as u32,
    })?;
    let id = get_image_id(link, set, idx)?;

    if colors_used > 0 {
        link.send_packet(&Packet::new(pids.color_table_rx, id.to_le_bytes().to_vec()))?;
        let packet = link.expect_packet(pids.color_table_tx)?;
        let (_, colors) = decode_color_table(&packet.data)?;
        let device_palette: Vec<Rgb> = colors.into_iter().take(colors_used).collect();
        if device_palette != image.palette {
            return Err(GarminError::ProtocolViolation(
                "image palette does not match the device's".into(),
            ));
        }
        link.send_packet(&Packet::new(
            pids.color_table_tx,
            encode_color_table(id, &device_palette),
        ))?;
        link.expect_packet(pids.color_table_rx)?;
    }

    // Rows travel bottom-up, padded to the device stride
    let row_size = info.row_size();
    let padding = info.bytewidth as usize - row_size;
    for row in (0..image.height as usize).rev() {
        if cancel.is_cancelled() {
            return Err(GarminError::Cancelled);
        }
        let start = row * row_size;
        let mut chunk = Vec::with_capacity(4 + info.bytewidth as usize);
        chunk.extend_from_slice(&id.to_le_bytes());
        chunk.extend_from_slice(&image.pixels[start..start + row_size]);
        chunk.extend(std::iter::repeat(0).take(padding));
        link.send_packet(&Packet::new(pids.image_data_tx, chunk))?;
        let reply = link.expect_packet(pids.image_data_rx)?;
        if reply.data_as_u32() != id {
            return Err(GarminError::ProtocolViolation(format!(
                "device acknowledged image {}, expected {id}",
                reply.data_as_u32()
            )));
        }
    }
    link.send_packet(&Packet::new(
        pids.image_data_cmplt,
        id.to_le_bytes().to_vec(),
    ))
}

// --------------------------------------------------------------------------
// Map transfer

pub fn get_memory_properties(link: &mut dyn Link, set: &ProtocolSet) -> Result<MemProperties> {
    send_command(link, set, Command::TransferMem)?;
    let packet = link.expect_packet(set.pids().capacity_data)?;
    let props = MemProperties::decode(&packet.data)?;
    info!("Memory size: {} bytes", props.mem_size);
    Ok(props)
}

/// Read a flash region (the whole supplementary map when `subfile` is
/// empty). `None` when the device has nothing stored there.
pub fn read_memory(
    link: &mut dyn Link,
    set: &ProtocolSet,
    cancel: &CancelToken,
    mem_region: u16,
    subfile: &str,
) -> Result<Option<Vec<u8>>> {
    let pids = set.pids();
    let request = MemFile {
        mem_region,
        subfile: subfile.to_string(),
    };
    link.send_packet(&Packet::new(pids.mem_read, request.encode()))?;
    let packet = link.read_packet()?;
    if packet.id == pids.mem_data {
        // Zero-valued data means the region holds nothing
        debug!("No data stored in region {mem_region}");
        return Ok(None);
    }
    let data = expect_pid(&packet, pids.mem_records, "memory record count")?;
    let count = u32::from_le_bytes([
        *data.first().unwrap_or(&0),
        *data.get(1).unwrap_or(&0),
        *data.get(2).unwrap_or(&0),
        *data.get(3).unwrap_or(&0),
    ]);
    info!("Expecting {count} memory chunks");
    let mut out = Vec::new();
    for _ in 0..count {
        if cancel.is_cancelled() {
            abort_transfer(link, set)?;
            return Err(GarminError::Cancelled);
        }
        let packet = link.expect_packet(pids.mem_chunk)?;
        let record = MemRecord::decode(&packet.data)?;
        out.extend_from_slice(&record.chunk);
    }
    Ok(Some(out))
}

pub fn get_map(
    link: &mut dyn Link,
    set: &ProtocolSet,
    cancel: &CancelToken,
) -> Result<Option<Vec<u8>>> {
    let props = get_memory_properties(link, set)?;
    read_memory(link, set, cancel, props.mem_region, "")
}

/// Write a map image into the supplementary-map flash region. The WREN/WEL
/// handshake opens the region, chunks are acknowledged individually, and
/// WRDI closes it again.
pub fn put_map(
    link: &mut dyn Link,
    set: &ProtocolSet,
    cancel: &CancelToken,
    data: &[u8],
) -> Result<()> {
    let pids = set.pids();
    let props = get_memory_properties(link, set)?;
    if data.len() as u32 > props.mem_size {
        return Err(GarminError::TransferAborted(format!(
            "map of {} bytes exceeds the {} byte region",
            data.len(),
            props.mem_size
        )));
    }
    let region = props.mem_region.to_le_bytes().to_vec();
    link.send_packet(&Packet::new(pids.enable_async_events, vec![0, 0]))?;
    link.send_packet(&Packet::new(pids.mem_wren, region.clone()))?;
    link.expect_packet(pids.mem_wel)?;
    debug!("Write enabled");

    for (i, chunk) in data.chunks(MAP_CHUNK_SIZE).enumerate() {
        if cancel.is_cancelled() {
            link.send_packet(&Packet::new(pids.mem_wrdi, region.clone()))?;
            return Err(GarminError::Cancelled);
        }
        let record = MemChunk {
            offset: (i * MAP_CHUNK_SIZE) as u32,
            chunk: chunk.to_vec(),
        };
        link.send_packet(&Packet::new(pids.mem_write, record.encode()))?;
    }
    link.send_packet(&Packet::new(pids.mem_wrdi, region))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(tag: ProtocolTag, number: u16) -> ProtocolEntry {
        ProtocolEntry { tag, number }
    }

    #[test]
    fn test_protocol_array_grouping() {
        // [P000, L001, A010, A100, D100, A200, D200, D100]
        use ProtocolTag::*;
        let entries = [
            entry(Physical, 0),
            entry(Link, 1),
            entry(Application, 10),
            entry(Application, 100),
            entry(DataType, 100),
            entry(Application, 200),
            entry(DataType, 200),
            entry(DataType, 100),
        ];
        let set = ProtocolSet::from_entries(&entries);
        assert_eq!(set.link, LinkProtocol::L001);
        assert_eq!(set.command, Some(CommandSet::A010));
        assert_eq!(set.waypoint, Some(WaypointFormat::D100));
        let route = set.route.unwrap();
        assert_eq!(route.header, RouteHeaderFormat::D200);
        assert_eq!(route.waypoint, WaypointFormat::D100);
        assert!(!route.links);
    }

    #[test]
    fn test_decode_protocol_array_bytes() {
        let mut data = Vec::new();
        for (tag, number) in [(b'P', 0u16), (b'L', 1), (b'A', 10), (b'A', 800), (b'D', 800)] {
            data.push(tag);
            data.extend_from_slice(&number.to_le_bytes());
        }
        let entries = decode_protocol_array(&data).unwrap();
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[3], entry(ProtocolTag::Application, 800));
        let set = ProtocolSet::from_entries(&entries);
        assert!(set.pvt);
    }

    #[test]
    fn test_decode_protocol_array_truncated() {
        assert!(decode_protocol_array(&[b'A', 10]).is_err());
    }

    #[test]
    fn test_track_capabilities() {
        use ProtocolTag::*;
        // A301 uploads, A302 does not
        let a301 = ProtocolSet::from_entries(&[
            entry(Application, 301),
            entry(DataType, 310),
            entry(DataType, 301),
        ]);
        assert!(a301.track.unwrap().upload);

        let a302 = ProtocolSet::from_entries(&[
            entry(Application, 302),
            entry(DataType, 311),
            entry(DataType, 304),
        ]);
        let track = a302.track.unwrap();
        assert!(!track.upload);
        assert_eq!(track.point, TrackPointFormat::D304);
    }

    #[test]
    fn test_command_sets() {
        assert_eq!(CommandSet::A010.code(Command::TransferWpt).unwrap(), 7);
        assert_eq!(CommandSet::A011.code(Command::TransferWpt).unwrap(), 21);
        assert_eq!(CommandSet::A010.code(Command::TransferRuns).unwrap(), 450);
        assert!(CommandSet::A011.code(Command::TransferRuns).is_err());
    }

    #[test]
    fn test_desired_baudrate_tolerance() {
        assert_eq!(desired_baudrate(115200), Some(115200));
        // Devices report approximations of the nominal rate
        assert_eq!(desired_baudrate(114000), Some(115200));
        assert_eq!(desired_baudrate(38461), Some(38400));
        assert_eq!(desired_baudrate(50_000), None);
    }

    #[test]
    fn test_rows_top_down() {
        // Two rows of three pixels with one padding byte each, bottom-up
        let pixel_array = [1, 2, 3, 0, 4, 5, 6, 0];
        let rows = rows_top_down(&pixel_array, 4, 3, 2);
        assert_eq!(rows, vec![4, 5, 6, 1, 2, 3]);
    }
}
