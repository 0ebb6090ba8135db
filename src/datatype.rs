//! Dxxx datatypes
//!
//! Binary record types exchanged inside application-layer packets. Each
//! category (waypoint, route header, track point, ...) is one plain struct
//! holding the superset of the fields its Dxxx variants carry; the variant
//! negotiated for the session selects which fields go on the wire and in
//! which layout. Decoding honours the trailing-optional rule: a shorter
//! payload leaves later fields at their documented defaults, encoding
//! always writes the full record.

use crate::codec::{Reader, Writer};
use crate::types::{GarminError, Result};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use std::fmt;

/// Sentinel for unsupported/unknown float parameters
pub const INVALID_FLOAT: f32 = 1.0e25;
/// Sentinel for unsupported/unknown timestamps
pub const INVALID_TIME: u32 = 0xffff_ffff;

/// Convert semicircles to degrees: 2^31 semicircles equal 180 degrees.
pub fn semicircle_to_degrees(semi: i32) -> f64 {
    semi as f64 * (180.0 / 2f64.powi(31))
}

/// Convert degrees to semicircles, rounding to the nearest representable
/// angle.
pub fn degrees_to_semicircle(degrees: f64) -> i32 {
    (degrees * (2f64.powi(31) / 180.0)).round() as i32
}

/// Whether a float field carries the "not supported" sentinel.
pub fn float_is_valid(value: f32) -> bool {
    value < 1.0e24
}

/// Seconds-since-device-epoch timestamps (12:00 am December 31, 1989 UTC).
pub fn device_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(1989, 12, 31, 0, 0, 0).unwrap()
}

/// Convert a device timestamp to UTC; `None` for the invalid sentinel.
pub fn timestamp_to_datetime(time: u32) -> Option<DateTime<Utc>> {
    if time == INVALID_TIME {
        return None;
    }
    Some(device_epoch() + Duration::seconds(time as i64))
}

/// Convert a UTC datetime to a device timestamp.
pub fn datetime_to_timestamp(datetime: DateTime<Utc>) -> u32 {
    (datetime - device_epoch()).num_seconds().max(0) as u32
}

/// Latitude and longitude in semicircles. North and East are positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Position {
    pub lat: i32,
    pub lon: i32,
}

impl Position {
    pub fn new(lat: i32, lon: i32) -> Self {
        Self { lat, lon }
    }

    pub fn from_degrees(lat: f64, lon: f64) -> Self {
        Self {
            lat: degrees_to_semicircle(lat),
            lon: degrees_to_semicircle(lon),
        }
    }

    pub fn as_degrees(&self) -> (f64, f64) {
        (
            semicircle_to_degrees(self.lat),
            semicircle_to_degrees(self.lon),
        )
    }

    /// Both members at 0x7FFFFFFF marks an unknown position.
    pub fn is_valid(&self) -> bool {
        !(self.lat == i32::MAX && self.lon == i32::MAX)
    }

    pub fn invalid() -> Self {
        Self {
            lat: i32::MAX,
            lon: i32::MAX,
        }
    }

    pub(crate) fn decode(r: &mut Reader) -> Result<Self> {
        Ok(Self {
            lat: r.i32()?,
            lon: r.i32()?,
        })
    }

    pub(crate) fn encode(&self, w: &mut Writer) {
        w.i32(self.lat).i32(self.lon);
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (lat, lon) = self.as_degrees();
        write!(f, "{lat:.6}, {lon:.6}")
    }
}

/// Latitude and longitude in radians, used by position init and PVT.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RadianPosition {
    pub lat: f64,
    pub lon: f64,
}

impl RadianPosition {
    pub fn as_degrees(&self) -> (f64, f64) {
        (self.lat.to_degrees(), self.lon.to_degrees())
    }

    pub fn from_degrees(lat: f64, lon: f64) -> Self {
        Self {
            lat: lat.to_radians(),
            lon: lon.to_radians(),
        }
    }

    pub(crate) fn decode(r: &mut Reader) -> Result<Self> {
        Ok(Self {
            lat: r.f64()?,
            lon: r.f64()?,
        })
    }

    pub(crate) fn encode(&self, w: &mut Writer) {
        w.f64(self.lat).f64(self.lon);
    }
}

/// The record-count announcement preceding a bulk transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Records(pub u16);

impl Records {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        Ok(Self(r.u16()?))
    }

    pub fn encode(&self) -> Vec<u8> {
        self.0.to_le_bytes().to_vec()
    }
}

/// Product data reply (A000).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductInfo {
    pub product_id: u16,
    /// Software version multiplied by 100
    pub software_version: u16,
    /// One or more NUL-terminated description strings; the first one names
    /// the product.
    pub description: Vec<String>,
}

impl ProductInfo {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        let product_id = r.u16()?;
        let software_version = r.u16()?;
        let mut description = Vec::new();
        while r.remaining() > 0 {
            description.push(r.zstring()?);
        }
        Ok(Self {
            product_id,
            software_version,
            description,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u16(self.product_id).u16(self.software_version);
        for s in &self.description {
            w.zstring(s);
        }
        w.into_bytes()
    }

    pub fn version(&self) -> f64 {
        self.software_version as f64 / 100.0
    }
}

/// Extended product data: manufacturing strings the host must ignore.
pub fn decode_ext_product_data(data: &[u8]) -> Vec<String> {
    let mut r = Reader::new(data);
    let mut out = Vec::new();
    while r.remaining() > 0 {
        match r.zstring() {
            Ok(s) => out.push(s),
            Err(_) => break,
        }
    }
    out
}

// --------------------------------------------------------------------------
// Waypoints

/// Waypoint datatype variants, selected once at capability negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaypointFormat {
    D100,
    D101,
    D102,
    D103,
    D104,
    D105,
    D106,
    D107,
    D108,
    D109,
    D110,
    /// Proximity variants: the base layout plus a trailing distance
    D400,
    D403,
}

impl WaypointFormat {
    pub fn from_number(number: u16) -> Option<Self> {
        match number {
            100 => Some(Self::D100),
            101 => Some(Self::D101),
            102 => Some(Self::D102),
            103 => Some(Self::D103),
            104 => Some(Self::D104),
            105 => Some(Self::D105),
            106 => Some(Self::D106),
            107 => Some(Self::D107),
            108 => Some(Self::D108),
            109 => Some(Self::D109),
            110 => Some(Self::D110),
            400 => Some(Self::D400),
            403 => Some(Self::D403),
            _ => None,
        }
    }
}

/// A waypoint. Which fields travel on the wire depends on the negotiated
/// [`WaypointFormat`]; the rest keep their defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct Waypoint {
    pub ident: String,
    pub posn: Position,
    pub cmnt: String,
    /// Proximity distance in meters
    pub dst: f32,
    /// Symbol id
    pub smbl: u16,
    /// Display option
    pub dspl: u8,
    pub color: u8,
    pub wpt_class: u8,
    pub subclass: [u8; 18],
    /// Altitude in meters, invalid if 1.0e25
    pub alt: f32,
    /// Depth in meters, invalid if 1.0e25
    pub dpth: f32,
    pub state: String,
    pub cc: String,
    /// Outbound link ETE in seconds, invalid if 0xFFFFFFFF
    pub ete: u32,
    /// Temperature in degrees Celsius, invalid if 1.0e25
    pub temp: f32,
    /// Timestamp, invalid if 0xFFFFFFFF
    pub time: u32,
    /// Category membership bits
    pub wpt_cat: u16,
    pub facility: String,
    pub city: String,
    pub addr: String,
    pub cross_road: String,
    /// Link identifier (D106 only)
    pub lnk_ident: String,
}

impl Default for Waypoint {
    fn default() -> Self {
        Self {
            ident: String::new(),
            posn: Position::default(),
            cmnt: String::new(),
            dst: 0.0,
            smbl: 0,
            dspl: 0,
            color: 255,
            wpt_class: 0,
            subclass: DEFAULT_SUBCLASS,
            alt: INVALID_FLOAT,
            dpth: INVALID_FLOAT,
            state: String::new(),
            cc: String::new(),
            ete: INVALID_TIME,
            temp: INVALID_FLOAT,
            time: INVALID_TIME,
            wpt_cat: 0,
            facility: String::new(),
            city: String::new(),
            addr: String::new(),
            cross_road: String::new(),
            lnk_ident: String::new(),
        }
    }
}

const DEFAULT_SUBCLASS: [u8; 18] = [
    0, 0, 0, 0, 0, 0, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255,
];

/// Attribute byte each format transmits; devices reject other values.
fn waypoint_attr(format: WaypointFormat) -> u8 {
    match format {
        WaypointFormat::D108 => 0x60,
        WaypointFormat::D109 => 0x70,
        WaypointFormat::D110 => 0x80,
        _ => 0,
    }
}

impl Waypoint {
    pub fn new(ident: &str, posn: Position, cmnt: &str) -> Self {
        Self {
            ident: ident.to_string(),
            posn,
            cmnt: cmnt.to_string(),
            ..Self::default()
        }
    }

    /// The packed D109/D110 display-and-color byte: color in bits 0-4,
    /// display attribute in bits 5-6.
    fn dspl_color(&self) -> u8 {
        (self.color & 0x1f) | ((self.dspl & 0x03) << 5)
    }

    fn set_dspl_color(&mut self, value: u8) {
        self.color = value & 0x1f;
        self.dspl = (value >> 5) & 0x03;
    }

    pub fn decode(format: WaypointFormat, data: &[u8]) -> Result<Self> {
        use WaypointFormat::*;
        let mut r = Reader::new(data);
        let mut wpt = Waypoint::default();
        match format {
            D100 | D101 | D102 | D103 | D104 | D107 | D400 | D403 => {
                wpt.ident = r.fixed_str(6)?;
                wpt.posn = Position::decode(&mut r)?;
                r.u32()?; // unused
                wpt.cmnt = r.fixed_str(40)?;
                match format {
                    D101 => {
                        wpt.dst = r.f32()?;
                        wpt.smbl = r.u8()? as u16;
                    }
                    D102 | D104 => {
                        wpt.dst = r.f32()?;
                        wpt.smbl = r.u16()?;
                        if format == D104 {
                            wpt.dspl = r.u8()?;
                        }
                    }
                    D103 | D403 => {
                        wpt.smbl = r.u8()? as u16;
                        wpt.dspl = r.u8()?;
                        if format == D403 {
                            wpt.dst = r.f32()?;
                        }
                    }
                    D107 => {
                        wpt.smbl = r.u8()? as u16;
                        wpt.dspl = r.u8()?;
                        wpt.dst = r.f32()?;
                        wpt.color = r.u8()?;
                    }
                    D400 => {
                        wpt.dst = r.f32()?;
                    }
                    _ => {}
                }
            }
            D105 => {
                wpt.posn = Position::decode(&mut r)?;
                wpt.smbl = r.u16()?;
                wpt.ident = r.zstring()?;
            }
            D106 => {
                wpt.wpt_class = r.u8()?;
                let sub: [u8; 13] = r.bytes()?;
                wpt.subclass[..13].copy_from_slice(&sub);
                wpt.posn = Position::decode(&mut r)?;
                wpt.smbl = r.u16()?;
                wpt.ident = r.zstring()?;
                wpt.lnk_ident = r.zstring()?;
            }
            D108 | D109 | D110 => {
                if format != D108 {
                    r.u8()?; // dtyp, always 1
                }
                wpt.wpt_class = r.u8()?;
                if format == D108 {
                    wpt.color = r.u8()?;
                    wpt.dspl = r.u8()?;
                } else {
                    let dspl_color = r.u8()?;
                    wpt.set_dspl_color(dspl_color);
                }
                r.u8()?; // attr, fixed per format
                wpt.smbl = r.u16()?;
                wpt.subclass = r.bytes()?;
                wpt.posn = Position::decode(&mut r)?;
                // Everything past the position is trailing-optional
                if r.remaining() >= 4 {
                    wpt.alt = r.f32()?;
                }
                if r.remaining() >= 4 {
                    wpt.dpth = r.f32()?;
                }
                if r.remaining() >= 4 {
                    wpt.dst = r.f32()?;
                }
                if r.remaining() >= 2 {
                    wpt.state = r.fixed_str(2)?;
                }
                if r.remaining() >= 2 {
                    wpt.cc = r.fixed_str(2)?;
                }
                if format != D108 && r.remaining() >= 4 {
                    wpt.ete = r.u32()?;
                }
                if format == D110 {
                    if r.remaining() >= 4 {
                        wpt.temp = r.f32()?;
                    }
                    if r.remaining() >= 4 {
                        wpt.time = r.u32()?;
                    }
                    if r.remaining() >= 2 {
                        wpt.wpt_cat = r.u16()?;
                    }
                }
                for field in [
                    &mut wpt.ident,
                    &mut wpt.cmnt,
                    &mut wpt.facility,
                    &mut wpt.city,
                    &mut wpt.addr,
                    &mut wpt.cross_road,
                ] {
                    if r.remaining() == 0 {
                        break;
                    }
                    *field = r.zstring()?;
                }
            }
        }
        Ok(wpt)
    }

    pub fn encode(&self, format: WaypointFormat) -> Vec<u8> {
        use WaypointFormat::*;
        let mut w = Writer::new();
        match format {
            D100 | D101 | D102 | D103 | D104 | D107 | D400 | D403 => {
                w.fixed_str(&self.ident, 6, b' ');
                self.posn.encode(&mut w);
                w.u32(0); // unused
                w.fixed_str(&self.cmnt, 40, b' ');
                match format {
                    D101 => {
                        w.f32(self.dst).u8(self.smbl as u8);
                    }
                    D102 => {
                        w.f32(self.dst).u16(self.smbl);
                    }
                    D104 => {
                        w.f32(self.dst).u16(self.smbl).u8(self.dspl);
                    }
                    D103 => {
                        w.u8(self.smbl as u8).u8(self.dspl);
                    }
                    D403 => {
                        w.u8(self.smbl as u8).u8(self.dspl).f32(self.dst);
                    }
                    D107 => {
                        w.u8(self.smbl as u8)
                            .u8(self.dspl)
                            .f32(self.dst)
                            .u8(self.color);
                    }
                    D400 => {
                        w.f32(self.dst);
                    }
                    _ => {}
                }
            }
            D105 => {
                self.posn.encode(&mut w);
                w.u16(self.smbl).zstring(&self.ident);
            }
            D106 => {
                w.u8(self.wpt_class).bytes(&self.subclass[..13]);
                self.posn.encode(&mut w);
                w.u16(self.smbl)
                    .zstring(&self.ident)
                    .zstring(&self.lnk_ident);
            }
            D108 | D109 | D110 => {
                if format != D108 {
                    w.u8(1); // dtyp
                }
                w.u8(self.wpt_class);
                if format == D108 {
                    w.u8(self.color).u8(self.dspl);
                } else {
                    w.u8(self.dspl_color());
                }
                w.u8(waypoint_attr(format));
                w.u16(self.smbl).bytes(&self.subclass);
                self.posn.encode(&mut w);
                w.f32(self.alt).f32(self.dpth).f32(self.dst);
                w.fixed_str(&self.state, 2, 0).fixed_str(&self.cc, 2, 0);
                if format != D108 {
                    w.u32(self.ete);
                }
                if format == D110 {
                    w.f32(self.temp).u32(self.time).u16(self.wpt_cat);
                }
                w.zstring(&self.ident)
                    .zstring(&self.cmnt)
                    .zstring(&self.facility)
                    .zstring(&self.city)
                    .zstring(&self.addr)
                    .zstring(&self.cross_road);
            }
        }
        w.into_bytes()
    }
}

impl fmt::Display for Waypoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<8} {}", self.ident, self.posn)?;
        if !self.cmnt.is_empty() {
            write!(f, "  {}", self.cmnt)?;
        }
        Ok(())
    }
}

// --------------------------------------------------------------------------
// Routes

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteHeaderFormat {
    D200,
    D201,
    D202,
}

impl RouteHeaderFormat {
    pub fn from_number(number: u16) -> Option<Self> {
        match number {
            200 => Some(Self::D200),
            201 => Some(Self::D201),
            202 => Some(Self::D202),
            _ => None,
        }
    }
}

/// Route header: announces the route a run of waypoints belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RouteHeader {
    pub nmbr: u8,
    pub cmnt: String,
    pub ident: String,
}

impl RouteHeader {
    pub fn decode(format: RouteHeaderFormat, data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        let mut hdr = RouteHeader::default();
        match format {
            RouteHeaderFormat::D200 => {
                hdr.nmbr = r.u8()?;
            }
            RouteHeaderFormat::D201 => {
                hdr.nmbr = r.u8()?;
                hdr.cmnt = r.fixed_str(20)?;
            }
            RouteHeaderFormat::D202 => {
                hdr.ident = r.zstring()?;
            }
        }
        Ok(hdr)
    }

    pub fn encode(&self, format: RouteHeaderFormat) -> Vec<u8> {
        let mut w = Writer::new();
        match format {
            RouteHeaderFormat::D200 => {
                w.u8(self.nmbr);
            }
            RouteHeaderFormat::D201 => {
                w.u8(self.nmbr).fixed_str(&self.cmnt, 20, b' ');
            }
            RouteHeaderFormat::D202 => {
                w.zstring(&self.ident);
            }
        }
        w.into_bytes()
    }
}

/// Route link (D210): the edge between two route waypoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteLink {
    pub lnk_class: u16,
    pub subclass: [u8; 18],
    pub ident: String,
}

impl Default for RouteLink {
    fn default() -> Self {
        Self {
            lnk_class: 0,
            subclass: DEFAULT_SUBCLASS,
            ident: String::new(),
        }
    }
}

impl RouteLink {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        Ok(Self {
            lnk_class: r.u16()?,
            subclass: r.bytes()?,
            ident: r.zstring()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u16(self.lnk_class)
            .bytes(&self.subclass)
            .zstring(&self.ident);
        w.into_bytes()
    }
}

/// A grouped route as returned to and accepted from the caller.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Route {
    pub header: RouteHeader,
    pub waypoints: Vec<Waypoint>,
    /// Links between consecutive waypoints (A201 only; one fewer than
    /// waypoints when present)
    pub links: Vec<RouteLink>,
}

// --------------------------------------------------------------------------
// Tracks

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackPointFormat {
    D300,
    D301,
    D302,
    D303,
    D304,
}

impl TrackPointFormat {
    pub fn from_number(number: u16) -> Option<Self> {
        match number {
            300 => Some(Self::D300),
            301 => Some(Self::D301),
            302 => Some(Self::D302),
            303 => Some(Self::D303),
            304 => Some(Self::D304),
            _ => None,
        }
    }
}

/// One track log point.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackPoint {
    pub posn: Position,
    /// Timestamp, invalid if 0xFFFFFFFF
    pub time: u32,
    pub alt: f32,
    pub dpth: f32,
    pub temp: f32,
    /// Distance traveled in meters (D304)
    pub distance: f32,
    /// Beats per minute, invalid if 0
    pub heart_rate: u8,
    /// Revolutions per minute, invalid if 0xFF
    pub cadence: u8,
    /// Wheel sensor present (D304)
    pub sensor: bool,
    /// First point of a new track segment
    pub new_trk: bool,
}

impl Default for TrackPoint {
    fn default() -> Self {
        Self {
            posn: Position::default(),
            time: INVALID_TIME,
            alt: INVALID_FLOAT,
            dpth: INVALID_FLOAT,
            temp: INVALID_FLOAT,
            distance: INVALID_FLOAT,
            heart_rate: 0,
            cadence: 255,
            sensor: false,
            new_trk: false,
        }
    }
}

impl TrackPoint {
    pub fn decode(format: TrackPointFormat, data: &[u8]) -> Result<Self> {
        use TrackPointFormat::*;
        let mut r = Reader::new(data);
        let mut point = TrackPoint::default();
        point.posn = Position::decode(&mut r)?;
        point.time = r.u32()?;
        match format {
            D300 => {
                point.new_trk = r.bool()?;
            }
            D301 | D302 => {
                point.alt = r.f32()?;
                point.dpth = r.f32()?;
                if format == D302 {
                    point.temp = r.f32()?;
                }
                point.new_trk = r.bool()?;
            }
            D303 => {
                point.alt = r.f32()?;
                point.heart_rate = r.u8()?;
            }
            D304 => {
                point.alt = r.f32()?;
                point.distance = r.f32()?;
                point.heart_rate = r.u8()?;
                point.cadence = r.u8()?;
                point.sensor = r.bool()?;
            }
        }
        Ok(point)
    }

    pub fn encode(&self, format: TrackPointFormat) -> Vec<u8> {
        use TrackPointFormat::*;
        let mut w = Writer::new();
        self.posn.encode(&mut w);
        w.u32(self.time);
        match format {
            D300 => {
                w.bool(self.new_trk);
            }
            D301 => {
                w.f32(self.alt).f32(self.dpth).bool(self.new_trk);
            }
            D302 => {
                w.f32(self.alt)
                    .f32(self.dpth)
                    .f32(self.temp)
                    .bool(self.new_trk);
            }
            D303 => {
                w.f32(self.alt).u8(self.heart_rate);
            }
            D304 => {
                w.f32(self.alt)
                    .f32(self.distance)
                    .u8(self.heart_rate)
                    .u8(self.cadence)
                    .bool(self.sensor);
            }
        }
        w.into_bytes()
    }

    pub fn datetime(&self) -> Option<DateTime<Utc>> {
        timestamp_to_datetime(self.time)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackHeaderFormat {
    D310,
    D311,
    D312,
}

impl TrackHeaderFormat {
    pub fn from_number(number: u16) -> Option<Self> {
        match number {
            310 => Some(Self::D310),
            311 => Some(Self::D311),
            312 => Some(Self::D312),
            _ => None,
        }
    }
}

/// Track header: display attributes and identity of one track log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackHeader {
    pub dspl: bool,
    pub color: u8,
    pub ident: String,
    /// D311 carries only a numeric index
    pub index: u16,
}

impl Default for TrackHeader {
    fn default() -> Self {
        Self {
            dspl: true,
            color: 255,
            ident: String::new(),
            index: 0,
        }
    }
}

impl TrackHeader {
    pub fn decode(format: TrackHeaderFormat, data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        let mut hdr = TrackHeader::default();
        match format {
            TrackHeaderFormat::D310 | TrackHeaderFormat::D312 => {
                hdr.dspl = r.bool()?;
                hdr.color = r.u8()?;
                hdr.ident = r.zstring()?;
            }
            TrackHeaderFormat::D311 => {
                hdr.index = r.u16()?;
            }
        }
        Ok(hdr)
    }

    pub fn encode(&self, format: TrackHeaderFormat) -> Vec<u8> {
        let mut w = Writer::new();
        match format {
            TrackHeaderFormat::D310 | TrackHeaderFormat::D312 => {
                w.bool(self.dspl).u8(self.color).zstring(&self.ident);
            }
            TrackHeaderFormat::D311 => {
                w.u16(self.index);
            }
        }
        w.into_bytes()
    }
}

/// A grouped track: its header (absent on A300 devices) and points.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Track {
    pub header: Option<TrackHeader>,
    pub points: Vec<TrackPoint>,
}

// --------------------------------------------------------------------------
// Almanac

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlmanacFormat {
    D500,
    D501,
    D550,
    D551,
}

impl AlmanacFormat {
    pub fn from_number(number: u16) -> Option<Self> {
        match number {
            500 => Some(Self::D500),
            501 => Some(Self::D501),
            550 => Some(Self::D550),
            551 => Some(Self::D551),
            _ => None,
        }
    }

    fn has_svid(self) -> bool {
        matches!(self, Self::D550 | Self::D551)
    }

    fn has_health(self) -> bool {
        matches!(self, Self::D501 | Self::D551)
    }
}

/// Almanac data for one GPS satellite.
///
/// Formats without a satellite id rely on PRN order: the first packet is
/// PRN-01 and so on up to PRN-32. A negative week number marks missing
/// data.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Almanac {
    /// Satellite id (D550/D551); PRN is svid + 1
    pub svid: u8,
    /// Week number, negative if the satellite has no data
    pub wn: i16,
    /// Almanac data reference time (s)
    pub toa: f32,
    /// Clock correction coefficients
    pub af0: f32,
    pub af1: f32,
    /// Eccentricity
    pub e: f32,
    /// Square root of semi-major axis
    pub sqrta: f32,
    /// Mean anomaly at reference time (r)
    pub m0: f32,
    /// Argument of perigee (r)
    pub w: f32,
    /// Right ascension (r) and its rate (r/s)
    pub omg0: f32,
    pub odot: f32,
    /// Inclination angle (r)
    pub i: f32,
    /// Almanac health (D501/D551)
    pub hlth: u8,
}

impl Almanac {
    pub fn decode(format: AlmanacFormat, data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        let mut alm = Almanac::default();
        if format.has_svid() {
            alm.svid = r.u8()?;
        }
        alm.wn = r.i16()?;
        alm.toa = r.f32()?;
        alm.af0 = r.f32()?;
        alm.af1 = r.f32()?;
        alm.e = r.f32()?;
        alm.sqrta = r.f32()?;
        alm.m0 = r.f32()?;
        alm.w = r.f32()?;
        alm.omg0 = r.f32()?;
        alm.odot = r.f32()?;
        alm.i = r.f32()?;
        if format.has_health() {
            alm.hlth = r.u8()?;
        }
        Ok(alm)
    }

    pub fn encode(&self, format: AlmanacFormat) -> Vec<u8> {
        let mut w = Writer::new();
        if format.has_svid() {
            w.u8(self.svid);
        }
        w.i16(self.wn)
            .f32(self.toa)
            .f32(self.af0)
            .f32(self.af1)
            .f32(self.e)
            .f32(self.sqrta)
            .f32(self.m0)
            .f32(self.w)
            .f32(self.omg0)
            .f32(self.odot)
            .f32(self.i);
        if format.has_health() {
            w.u8(self.hlth);
        }
        w.into_bytes()
    }

    pub fn is_valid(&self) -> bool {
        self.wn >= 0
    }
}

// --------------------------------------------------------------------------
// Date/time, position init, PVT

/// Date and time (D600), as exchanged by A600.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateTimeRecord {
    pub month: u8,
    pub day: u8,
    pub year: u16,
    pub hour: u16,
    pub minute: u8,
    pub second: u8,
}

impl DateTimeRecord {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        Ok(Self {
            month: r.u8()?,
            day: r.u8()?,
            year: r.u16()?,
            hour: r.u16()?,
            minute: r.u8()?,
            second: r.u8()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u8(self.month)
            .u8(self.day)
            .u16(self.year)
            .u16(self.hour)
            .u8(self.minute)
            .u8(self.second);
        w.into_bytes()
    }

    pub fn to_naive(&self) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(self.year as i32, self.month as u32, self.day as u32)?
            .and_hms_opt(self.hour as u32, self.minute as u32, self.second as u32)
    }

    pub fn from_datetime(datetime: &DateTime<Utc>) -> Self {
        use chrono::{Datelike, Timelike};
        Self {
            month: datetime.month() as u8,
            day: datetime.day() as u8,
            year: datetime.year() as u16,
            hour: datetime.hour() as u16,
            minute: datetime.minute() as u8,
            second: datetime.second() as u8,
        }
    }
}

impl fmt::Display for DateTimeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

/// GPS fix quality reported in PVT records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fix {
    Unusable,
    Invalid,
    TwoD,
    ThreeD,
    TwoDDiff,
    ThreeDDiff,
}

impl Fix {
    pub fn from_u16(value: u16) -> Result<Self> {
        match value {
            0 => Ok(Fix::Unusable),
            1 => Ok(Fix::Invalid),
            2 => Ok(Fix::TwoD),
            3 => Ok(Fix::ThreeD),
            4 => Ok(Fix::TwoDDiff),
            5 => Ok(Fix::ThreeDDiff),
            other => Err(GarminError::FieldRange {
                field: "fix",
                value: other as u32,
            }),
        }
    }
}

/// Real-time position, velocity, and time (D800).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Pvt {
    /// Altitude above the WGS 84 ellipsoid (meters)
    pub alt: f32,
    /// Estimated position error, 2 sigma (meters)
    pub epe: f32,
    pub eph: f32,
    pub epv: f32,
    pub fix: u16,
    /// Time of week (seconds)
    pub tow: f64,
    pub posn: RadianPosition,
    /// Velocity east/north/up (meters/second)
    pub east: f32,
    pub north: f32,
    pub up: f32,
    /// Height of the WGS 84 ellipsoid above mean sea level (meters)
    pub msl_hght: f32,
    /// Difference between GPS and UTC (seconds)
    pub leap_scnds: i16,
    /// Week number days
    pub wn_days: u32,
}

impl Pvt {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        Ok(Self {
            alt: r.f32()?,
            epe: r.f32()?,
            eph: r.f32()?,
            epv: r.f32()?,
            fix: r.u16()?,
            tow: r.f64()?,
            posn: RadianPosition::decode(&mut r)?,
            east: r.f32()?,
            north: r.f32()?,
            up: r.f32()?,
            msl_hght: r.f32()?,
            leap_scnds: r.i16()?,
            wn_days: r.u32()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.f32(self.alt).f32(self.epe).f32(self.eph).f32(self.epv);
        w.u16(self.fix).f64(self.tow);
        self.posn.encode(&mut w);
        w.f32(self.east)
            .f32(self.north)
            .f32(self.up)
            .f32(self.msl_hght)
            .i16(self.leap_scnds)
            .u32(self.wn_days);
        w.into_bytes()
    }

    pub fn fix_quality(&self) -> Result<Fix> {
        Fix::from_u16(self.fix)
    }

    /// Altitude above mean sea level.
    pub fn msl_altitude(&self) -> f32 {
        self.alt + self.msl_hght
    }

    pub fn datetime(&self) -> DateTime<Utc> {
        let seconds = (self.tow - self.leap_scnds as f64).floor() as i64;
        device_epoch() + Duration::days(self.wn_days as i64) + Duration::seconds(seconds)
    }
}

impl fmt::Display for Pvt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (lat, lon) = self.posn.as_degrees();
        write!(
            f,
            "{} lat {:.6} lon {:.6} alt {:.1}m fix {}",
            self.datetime().format("%Y-%m-%d %H:%M:%S"),
            lat,
            lon,
            self.msl_altitude(),
            self.fix
        )
    }
}

// --------------------------------------------------------------------------
// Flightbook

/// One logged flight (D650).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FlightBookRecord {
    pub takeoff_time: u32,
    pub landing_time: u32,
    pub takeoff_posn: Position,
    pub landing_posn: Position,
    /// Seconds flown in night time conditions
    pub night_time: u32,
    pub num_landings: u32,
    /// Max velocity during flight (meters/sec)
    pub max_speed: f32,
    /// Max altitude above the WGS 84 ellipsoid (meters)
    pub max_alt: f32,
    /// Distance of flight (meters)
    pub distance: f32,
    pub cross_country_flag: bool,
    pub departure_name: String,
    pub departure_ident: String,
    pub arrival_name: String,
    pub arrival_ident: String,
    /// Tail number of the airplane
    pub ac_id: String,
}

impl FlightBookRecord {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        let mut rec = FlightBookRecord {
            takeoff_time: r.u32()?,
            landing_time: r.u32()?,
            takeoff_posn: Position::decode(&mut r)?,
            landing_posn: Position::decode(&mut r)?,
            night_time: r.u32()?,
            num_landings: r.u32()?,
            max_speed: r.f32()?,
            max_alt: r.f32()?,
            distance: r.f32()?,
            cross_country_flag: r.bool()?,
            ..Default::default()
        };
        for field in [
            &mut rec.departure_name,
            &mut rec.departure_ident,
            &mut rec.arrival_name,
            &mut rec.arrival_ident,
            &mut rec.ac_id,
        ] {
            if r.remaining() == 0 {
                break;
            }
            *field = r.zstring()?;
        }
        Ok(rec)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u32(self.takeoff_time).u32(self.landing_time);
        self.takeoff_posn.encode(&mut w);
        self.landing_posn.encode(&mut w);
        w.u32(self.night_time)
            .u32(self.num_landings)
            .f32(self.max_speed)
            .f32(self.max_alt)
            .f32(self.distance)
            .bool(self.cross_country_flag)
            .zstring(&self.departure_name)
            .zstring(&self.departure_ident)
            .zstring(&self.arrival_name)
            .zstring(&self.arrival_ident)
            .zstring(&self.ac_id);
        w.into_bytes()
    }
}

// --------------------------------------------------------------------------
// Fitness: laps, runs, workouts, courses

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LapFormat {
    D906,
    D1001,
    D1011,
}

impl LapFormat {
    pub fn from_number(number: u16) -> Option<Self> {
        match number {
            906 => Some(Self::D906),
            1001 => Some(Self::D1001),
            1011 => Some(Self::D1011),
            _ => None,
        }
    }
}

/// One fitness lap.
#[derive(Debug, Clone, PartialEq)]
pub struct Lap {
    pub index: u32,
    pub start_time: u32,
    /// Duration in hundredths of a second
    pub total_time: u32,
    pub total_dist: f32,
    pub max_speed: f32,
    pub begin: Position,
    pub end: Position,
    pub calories: u16,
    /// D906 associates a lap with a track by index
    pub track_index: u8,
    /// Beats per minute, invalid if 0
    pub avg_heart_rate: u8,
    pub max_heart_rate: u8,
    /// 0 = active, 1 = rest
    pub intensity: u8,
    /// Revolutions per minute, invalid if 0xFF
    pub avg_cadence: u8,
    pub trigger_method: u8,
}

impl Default for Lap {
    fn default() -> Self {
        Self {
            index: 0,
            start_time: INVALID_TIME,
            total_time: 0,
            total_dist: 0.0,
            max_speed: 0.0,
            begin: Position::invalid(),
            end: Position::invalid(),
            calories: 0,
            track_index: 0,
            avg_heart_rate: 0,
            max_heart_rate: 0,
            intensity: 0,
            avg_cadence: 255,
            trigger_method: 0,
        }
    }
}

impl Lap {
    pub fn decode(format: LapFormat, data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        let mut lap = Lap::default();
        match format {
            LapFormat::D906 => {
                lap.start_time = r.u32()?;
                lap.total_time = r.u32()?;
                lap.total_dist = r.f32()?;
                lap.begin = Position::decode(&mut r)?;
                lap.end = Position::decode(&mut r)?;
                lap.calories = r.u16()?;
                lap.track_index = r.u8()?;
                r.u8()?; // unused
            }
            LapFormat::D1001 | LapFormat::D1011 => {
                if format == LapFormat::D1001 {
                    lap.index = r.u32()?;
                } else {
                    lap.index = r.u16()? as u32;
                    r.u16()?; // unused
                }
                lap.start_time = r.u32()?;
                lap.total_time = r.u32()?;
                lap.total_dist = r.f32()?;
                lap.max_speed = r.f32()?;
                lap.begin = Position::decode(&mut r)?;
                lap.end = Position::decode(&mut r)?;
                lap.calories = r.u16()?;
                lap.avg_heart_rate = r.u8()?;
                lap.max_heart_rate = r.u8()?;
                lap.intensity = r.u8()?;
                if format == LapFormat::D1011 {
                    lap.avg_cadence = r.u8()?;
                    lap.trigger_method = r.u8()?;
                }
            }
        }
        Ok(lap)
    }

    pub fn encode(&self, format: LapFormat) -> Vec<u8> {
        let mut w = Writer::new();
        match format {
            LapFormat::D906 => {
                w.u32(self.start_time)
                    .u32(self.total_time)
                    .f32(self.total_dist);
                self.begin.encode(&mut w);
                self.end.encode(&mut w);
                w.u16(self.calories).u8(self.track_index).u8(0);
            }
            LapFormat::D1001 | LapFormat::D1011 => {
                if format == LapFormat::D1001 {
                    w.u32(self.index);
                } else {
                    w.u16(self.index as u16).u16(0);
                }
                w.u32(self.start_time)
                    .u32(self.total_time)
                    .f32(self.total_dist)
                    .f32(self.max_speed);
                self.begin.encode(&mut w);
                self.end.encode(&mut w);
                w.u16(self.calories)
                    .u8(self.avg_heart_rate)
                    .u8(self.max_heart_rate)
                    .u8(self.intensity);
                if format == LapFormat::D1011 {
                    w.u8(self.avg_cadence).u8(self.trigger_method);
                }
            }
        }
        w.into_bytes()
    }
}

/// One workout step; twenty of these sit in every workout record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WorkoutStep {
    pub custom_name: String,
    pub target_custom_zone_low: f32,
    pub target_custom_zone_high: f32,
    pub duration_value: u16,
    pub intensity: u8,
    pub duration_type: u8,
    pub target_type: u8,
    pub target_value: u8,
}

impl WorkoutStep {
    fn decode(r: &mut Reader) -> Result<Self> {
        let step = Self {
            custom_name: r.fixed_str(16)?,
            target_custom_zone_low: r.f32()?,
            target_custom_zone_high: r.f32()?,
            duration_value: r.u16()?,
            intensity: r.u8()?,
            duration_type: r.u8()?,
            target_type: r.u8()?,
            target_value: r.u8()?,
        };
        r.u16()?; // unused
        Ok(step)
    }

    fn encode(&self, w: &mut Writer) {
        w.fixed_str(&self.custom_name, 16, 0)
            .f32(self.target_custom_zone_low)
            .f32(self.target_custom_zone_high)
            .u16(self.duration_value)
            .u8(self.intensity)
            .u8(self.duration_type)
            .u8(self.target_type)
            .u8(self.target_value)
            .u16(0);
    }
}

/// A workout (D1002/D1008 share this layout).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Workout {
    pub steps: Vec<WorkoutStep>,
    pub name: String,
    /// 0 = running, 1 = biking, 2 = other
    pub sport_type: u8,
}

impl Workout {
    pub(crate) fn decode_from(r: &mut Reader) -> Result<Self> {
        let num_valid = r.u32()? as usize;
        let mut steps = Vec::with_capacity(20);
        for _ in 0..20 {
            steps.push(WorkoutStep::decode(r)?);
        }
        steps.truncate(num_valid.min(20));
        Ok(Self {
            steps,
            name: r.fixed_str(16)?,
            sport_type: r.u8()?,
        })
    }

    pub(crate) fn encode_into(&self, w: &mut Writer) {
        w.u32(self.steps.len().min(20) as u32);
        let blank = WorkoutStep::default();
        for i in 0..20 {
            self.steps.get(i).unwrap_or(&blank).encode(w);
        }
        w.fixed_str(&self.name, 16, 0).u8(self.sport_type);
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Self::decode_from(&mut Reader::new(data))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.encode_into(&mut w);
        w.into_bytes()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunFormat {
    D1000,
    D1009,
    D1010,
}

impl RunFormat {
    pub fn from_number(number: u16) -> Option<Self> {
        match number {
            1000 => Some(Self::D1000),
            1009 => Some(Self::D1009),
            1010 => Some(Self::D1010),
            _ => None,
        }
    }
}

/// One fitness run, tying a track to a range of laps.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Run {
    pub track_index: u32,
    pub first_lap_index: u32,
    pub last_lap_index: u32,
    pub sport_type: u8,
    pub program_type: u8,
    pub multisport: u8,
    /// Virtual partner / quick workout result
    pub partner_time: u32,
    pub partner_distance: f32,
    pub workout: Workout,
}

impl Run {
    pub fn decode(format: RunFormat, data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        let mut run = Run::default();
        match format {
            RunFormat::D1000 | RunFormat::D1010 => {
                run.track_index = r.u32()?;
                run.first_lap_index = r.u32()?;
                run.last_lap_index = r.u32()?;
            }
            RunFormat::D1009 => {
                run.track_index = r.u16()? as u32;
                run.first_lap_index = r.u16()? as u32;
                run.last_lap_index = r.u16()? as u32;
            }
        }
        run.sport_type = r.u8()?;
        run.program_type = r.u8()?;
        match format {
            RunFormat::D1000 => {
                r.u16()?; // unused
            }
            RunFormat::D1009 => {
                run.multisport = r.u8()?;
                r.u8()?;
                r.u16()?;
            }
            RunFormat::D1010 => {
                run.multisport = r.u8()?;
                r.u8()?;
            }
        }
        run.partner_time = r.u32()?;
        run.partner_distance = r.f32()?;
        run.workout = Workout::decode_from(&mut r)?;
        Ok(run)
    }

    pub fn encode(&self, format: RunFormat) -> Vec<u8> {
        let mut w = Writer::new();
        match format {
            RunFormat::D1000 | RunFormat::D1010 => {
                w.u32(self.track_index)
                    .u32(self.first_lap_index)
                    .u32(self.last_lap_index);
            }
            RunFormat::D1009 => {
                w.u16(self.track_index as u16)
                    .u16(self.first_lap_index as u16)
                    .u16(self.last_lap_index as u16);
            }
        }
        w.u8(self.sport_type).u8(self.program_type);
        match format {
            RunFormat::D1000 => {
                w.u16(0);
            }
            RunFormat::D1009 => {
                w.u8(self.multisport).u8(0).u16(0);
            }
            RunFormat::D1010 => {
                w.u8(self.multisport).u8(0);
            }
        }
        w.u32(self.partner_time).f32(self.partner_distance);
        self.workout.encode_into(&mut w);
        w.into_bytes()
    }

    /// No associated track when the index is 0xFFFF.
    pub fn has_track(&self) -> bool {
        self.track_index != 0xffff && self.track_index != 0xffff_ffff
    }
}

/// A scheduled occurrence of a workout (D1003).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WorkoutOccurrence {
    pub workout_name: String,
    pub day: u32,
}

impl WorkoutOccurrence {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        Ok(Self {
            workout_name: r.fixed_str(16)?,
            day: r.u32()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.fixed_str(&self.workout_name, 16, 0).u32(self.day);
        w.into_bytes()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HeartRateZone {
    pub low: u8,
    pub high: u8,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SpeedZone {
    pub low: f32,
    pub high: f32,
    pub name: String,
}

/// Per-sport training settings inside the fitness user profile.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Activity {
    pub heart_rate_zones: Vec<HeartRateZone>,
    pub speed_zones: Vec<SpeedZone>,
    pub gear_weight: f32,
    pub max_heart_rate: u8,
}

impl Activity {
    fn decode(r: &mut Reader) -> Result<Self> {
        let mut heart_rate_zones = Vec::with_capacity(5);
        for _ in 0..5 {
            let low = r.u8()?;
            let high = r.u8()?;
            r.u16()?; // unused
            heart_rate_zones.push(HeartRateZone { low, high });
        }
        let mut speed_zones = Vec::with_capacity(10);
        for _ in 0..10 {
            speed_zones.push(SpeedZone {
                low: r.f32()?,
                high: r.f32()?,
                name: r.fixed_str(16)?,
            });
        }
        let gear_weight = r.f32()?;
        let max_heart_rate = r.u8()?;
        r.u8()?;
        r.u16()?;
        Ok(Self {
            heart_rate_zones,
            speed_zones,
            gear_weight,
            max_heart_rate,
        })
    }

    fn encode(&self, w: &mut Writer) {
        let blank_hr = HeartRateZone::default();
        for i in 0..5 {
            let zone = self.heart_rate_zones.get(i).unwrap_or(&blank_hr);
            w.u8(zone.low).u8(zone.high).u16(0);
        }
        let blank_speed = SpeedZone::default();
        for i in 0..10 {
            let zone = self.speed_zones.get(i).unwrap_or(&blank_speed);
            w.f32(zone.low).f32(zone.high).fixed_str(&zone.name, 16, 0);
        }
        w.f32(self.gear_weight).u8(self.max_heart_rate).u8(0).u16(0);
    }
}

/// Fitness user profile (D1004).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FitnessUserProfile {
    pub activities: Vec<Activity>,
    /// Weight in kilograms
    pub weight: f32,
    pub birth_year: u16,
    pub birth_month: u8,
    pub birth_day: u8,
    /// 0 = female, 1 = male
    pub gender: u8,
}

impl FitnessUserProfile {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        let mut activities = Vec::with_capacity(3);
        for _ in 0..3 {
            activities.push(Activity::decode(&mut r)?);
        }
        Ok(Self {
            activities,
            weight: r.f32()?,
            birth_year: r.u16()?,
            birth_month: r.u8()?,
            birth_day: r.u8()?,
            gender: r.u8()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        let blank = Activity::default();
        for i in 0..3 {
            self.activities.get(i).unwrap_or(&blank).encode(&mut w);
        }
        w.f32(self.weight)
            .u16(self.birth_year)
            .u8(self.birth_month)
            .u8(self.birth_day)
            .u8(self.gender);
        w.into_bytes()
    }
}

/// Workout storage limits (D1005).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkoutLimits {
    pub max_workouts: u32,
    pub max_unscheduled_workouts: u32,
    pub max_occurrences: u32,
}

impl WorkoutLimits {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        Ok(Self {
            max_workouts: r.u32()?,
            max_unscheduled_workouts: r.u32()?,
            max_occurrences: r.u32()?,
        })
    }
}

/// A course (D1006).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Course {
    pub index: u16,
    pub course_name: String,
    pub track_index: u16,
}

impl Course {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        let index = r.u16()?;
        r.u16()?; // unused
        Ok(Self {
            index,
            course_name: r.fixed_str(16)?,
            track_index: r.u16()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u16(self.index)
            .u16(0)
            .fixed_str(&self.course_name, 16, 0)
            .u16(self.track_index);
        w.into_bytes()
    }
}

/// A course lap (D1007).
#[derive(Debug, Clone, PartialEq)]
pub struct CourseLap {
    pub course_index: u16,
    pub lap_index: u16,
    /// In hundredths of a second
    pub total_time: u32,
    pub total_dist: f32,
    pub begin: Position,
    pub end: Position,
    pub avg_heart_rate: u8,
    pub max_heart_rate: u8,
    pub intensity: u8,
    pub avg_cadence: u8,
}

impl Default for CourseLap {
    fn default() -> Self {
        Self {
            course_index: 0,
            lap_index: 0,
            total_time: 0,
            total_dist: 0.0,
            begin: Position::invalid(),
            end: Position::invalid(),
            avg_heart_rate: 0,
            max_heart_rate: 0,
            intensity: 0,
            avg_cadence: 255,
        }
    }
}

impl CourseLap {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        Ok(Self {
            course_index: r.u16()?,
            lap_index: r.u16()?,
            total_time: r.u32()?,
            total_dist: r.f32()?,
            begin: Position::decode(&mut r)?,
            end: Position::decode(&mut r)?,
            avg_heart_rate: r.u8()?,
            max_heart_rate: r.u8()?,
            intensity: r.u8()?,
            avg_cadence: r.u8()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u16(self.course_index)
            .u16(self.lap_index)
            .u32(self.total_time)
            .f32(self.total_dist);
        self.begin.encode(&mut w);
        self.end.encode(&mut w);
        w.u8(self.avg_heart_rate)
            .u8(self.max_heart_rate)
            .u8(self.intensity)
            .u8(self.avg_cadence);
        w.into_bytes()
    }
}

/// A point of interest along a course (D1012).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CoursePoint {
    pub name: String,
    pub course_index: u16,
    pub track_point_time: u32,
    pub point_type: u8,
}

impl CoursePoint {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        let name = r.fixed_str(11)?;
        r.u8()?; // unused
        let course_index = r.u16()?;
        r.u16()?; // unused
        Ok(Self {
            name,
            course_index,
            track_point_time: r.u32()?,
            point_type: r.u8()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.fixed_str(&self.name, 11, 0)
            .u8(0)
            .u16(self.course_index)
            .u16(0)
            .u32(self.track_point_time)
            .u8(self.point_type);
        w.into_bytes()
    }
}

/// Course storage limits (D1013).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CourseLimits {
    pub max_courses: u32,
    pub max_course_laps: u32,
    pub max_course_points: u32,
    pub max_course_track_points: u32,
}

impl CourseLimits {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        Ok(Self {
            max_courses: r.u32()?,
            max_course_laps: r.u32()?,
            max_course_points: r.u32()?,
            max_course_track_points: r.u32()?,
        })
    }
}

// --------------------------------------------------------------------------
// Memory / map transfer

/// Flash memory capacity reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemProperties {
    /// Flash region holding the supplementary map
    pub mem_region: u16,
    pub max_tiles: u16,
    pub mem_size: u32,
}

impl MemProperties {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        let props = Self {
            mem_region: r.u16()?,
            max_tiles: r.u16()?,
            mem_size: r.u32()?,
        };
        Ok(props)
    }
}

/// Request naming a flash region and optional subfile to read.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MemFile {
    pub mem_region: u16,
    pub subfile: String,
}

impl MemFile {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u32(0).u16(self.mem_region).zstring(&self.subfile);
        w.into_bytes()
    }
}

/// One indexed chunk of a flash read.
#[derive(Debug, Clone, PartialEq)]
pub struct MemRecord {
    pub index: u8,
    pub chunk: Vec<u8>,
}

impl MemRecord {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        Ok(Self {
            index: r.u8()?,
            chunk: r.rest(),
        })
    }
}

/// One offset-addressed chunk of a flash write.
#[derive(Debug, Clone, PartialEq)]
pub struct MemChunk {
    pub offset: u32,
    pub chunk: Vec<u8>,
}

impl MemChunk {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u32(self.offset).bytes(&self.chunk);
        w.into_bytes()
    }
}

// --------------------------------------------------------------------------
// Images and screenshots

/// An RGB color entry; the alpha byte on the wire is unused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rgb {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

/// One entry of the image list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageProp {
    pub idx: u16,
    pub writable: bool,
    /// 0 = screenshot, 2 = icon
    pub image_type: u8,
}

/// Decode the repeated image-list entries.
pub fn decode_image_list(data: &[u8]) -> Result<Vec<ImageProp>> {
    let mut r = Reader::new(data);
    let mut images = Vec::new();
    while r.remaining() >= 4 {
        images.push(ImageProp {
            idx: r.u16()?,
            writable: r.bool()?,
            image_type: r.u8()?,
        });
    }
    Ok(images)
}

/// Image properties header.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ImageInfo {
    /// Bits per pixel
    pub bpp: u8,
    pub height: u16,
    pub width: u16,
    /// Row stride in bytes (rows pad to 4-byte boundaries)
    pub bytewidth: u16,
    /// Transparent color, if any
    pub transparent: Option<Rgb>,
}

impl ImageInfo {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        r.u8()?; // unknown
        let bpp = r.u8()?;
        r.u16()?; // unknown
        let height = r.u16()?;
        let width = r.u16()?;
        let bytewidth = r.u16()?;
        r.u16()?; // unknown
        let red = r.u8()?;
        let green = r.u8()?;
        let blue = r.u8()?;
        r.u8()?; // unused alpha
        let transparent = if red != 0 || green != 0 || blue != 0 {
            Some(Rgb { red, green, blue })
        } else {
            None
        };
        Ok(Self {
            bpp,
            height,
            width,
            bytewidth,
            transparent,
        })
    }

    /// Pixel-array size in bytes, padding included.
    pub fn byte_size(&self) -> usize {
        self.bytewidth as usize * self.height as usize
    }

    /// Row size in bytes without the padding.
    pub fn row_size(&self) -> usize {
        self.width as usize * self.bpp as usize / 8
    }

    /// Palette entries for the color depth; `None` for unsupported depths.
    pub fn colors_used(&self) -> Option<usize> {
        match self.bpp {
            b if b <= 8 => Some(1 << b),
            24 => Some(0),
            _ => None,
        }
    }
}

/// Decode a color table packet: image id then 4-byte RGBA entries.
pub fn decode_color_table(data: &[u8]) -> Result<(u32, Vec<Rgb>)> {
    let mut r = Reader::new(data);
    let id = r.u32()?;
    let mut colors = Vec::new();
    while r.remaining() >= 4 {
        let red = r.u8()?;
        let green = r.u8()?;
        let blue = r.u8()?;
        r.u8()?;
        colors.push(Rgb { red, green, blue });
    }
    Ok((id, colors))
}

/// Encode a color table packet.
pub fn encode_color_table(id: u32, colors: &[Rgb]) -> Vec<u8> {
    let mut w = Writer::new();
    w.u32(id);
    for c in colors {
        w.u8(c.red).u8(c.green).u8(c.blue).u8(0);
    }
    w.into_bytes()
}

/// A decoded image: palette plus top-down unpadded pixel rows.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Image {
    pub width: u16,
    pub height: u16,
    pub bpp: u8,
    pub palette: Vec<Rgb>,
    /// Packed pixel rows, top-down, without stride padding
    pub pixels: Vec<u8>,
}

/// Screenshot packet sections.
#[derive(Debug, Clone, PartialEq)]
pub enum ScreenshotSection {
    Header {
        bytewidth: u32,
        bpp: u32,
        width: u32,
        height: u32,
    },
    Color(Rgb),
    PixelRow {
        offset: u32,
        chunk: Vec<u8>,
    },
}

impl ScreenshotSection {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        let section = r.u32()?;
        let offset = r.u32()?;
        match section {
            0 => {
                let bytewidth = r.u32()?;
                let bpp = r.u32()?;
                let width = r.u32()?;
                let height = r.u32()?;
                Ok(Self::Header {
                    bytewidth,
                    bpp,
                    width,
                    height,
                })
            }
            1 => Ok(Self::PixelRow {
                offset,
                chunk: r.rest(),
            }),
            2 => {
                // Colors arrive blue, green, red
                let blue = r.u8()?;
                let green = r.u8()?;
                let red = r.u8()?;
                Ok(Self::Color(Rgb { red, green, blue }))
            }
            other => Err(GarminError::FieldRange {
                field: "screenshot section",
                value: other,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_semicircle_law() {
        // Round-tripping a semicircle through degrees recovers it exactly
        for &x in &[
            0i32,
            1,
            -1,
            493_961_671,
            25_937_164,
            i32::MAX,
            i32::MIN,
            i32::MIN + 1,
        ] {
            let deg = semicircle_to_degrees(x);
            assert_eq!(degrees_to_semicircle(deg), x, "failed for {x}");
        }
        assert!((semicircle_to_degrees(i32::MAX) - 180.0).abs() < 1e-6);
    }

    #[test]
    fn test_device_epoch() {
        assert_eq!(
            timestamp_to_datetime(0).unwrap(),
            Utc.with_ymd_and_hms(1989, 12, 31, 0, 0, 0).unwrap()
        );
        assert_eq!(timestamp_to_datetime(INVALID_TIME), None);
        let dt = Utc.with_ymd_and_hms(2003, 6, 1, 12, 0, 0).unwrap();
        assert_eq!(timestamp_to_datetime(datetime_to_timestamp(dt)), Some(dt));
    }

    #[test]
    fn test_product_info_decode() {
        let mut data = vec![0x69, 0x00, 0xe6, 0x00];
        data.extend_from_slice(b"GPS 12XL\x00Software Version 2.30\x00");
        let info = ProductInfo::decode(&data).unwrap();
        assert_eq!(info.product_id, 105);
        assert_eq!(info.software_version, 230);
        assert_eq!(info.version(), 2.3);
        assert_eq!(
            info.description,
            vec!["GPS 12XL".to_string(), "Software Version 2.30".to_string()]
        );
    }

    #[test]
    fn test_d100_wire_layout() {
        let wpt = Waypoint::new(
            "CHURCH",
            Position::new(493_961_671, 25_937_164),
            "LA SAGRADA FAMILIA",
        );
        let bytes = wpt.encode(WaypointFormat::D100);
        assert_eq!(bytes.len(), 58);
        assert_eq!(&bytes[..6], b"CHURCH");
        assert_eq!(&bytes[6..10], &493_961_671i32.to_le_bytes());
        assert_eq!(&bytes[10..14], &25_937_164i32.to_le_bytes());
        assert_eq!(&bytes[14..18], &[0, 0, 0, 0]);
        assert_eq!(&bytes[18..36], b"LA SAGRADA FAMILIA");
        assert!(bytes[36..].iter().all(|&b| b == b' '));

        let back = Waypoint::decode(WaypointFormat::D100, &bytes).unwrap();
        assert_eq!(back.ident, "CHURCH");
        assert_eq!(back.posn, wpt.posn);
        assert_eq!(back.cmnt, "LA SAGRADA FAMILIA");
    }

    #[test]
    fn test_waypoint_roundtrip_all_formats() {
        use WaypointFormat::*;
        let mut wpt = Waypoint::new("HOME", Position::from_degrees(52.1, 4.9), "FRONT DOOR");
        wpt.smbl = 18;
        wpt.dspl = 1;
        wpt.dst = 25.0;
        wpt.alt = 3.5;
        wpt.state = "ZH".into();
        wpt.cc = "NL".into();
        wpt.city = "Gouda".into();
        for format in [D100, D101, D102, D103, D104, D105, D106, D107, D108, D109, D110, D400, D403]
        {
            let bytes = wpt.encode(format);
            let back = Waypoint::decode(format, &bytes).unwrap();
            assert_eq!(back.posn, wpt.posn, "posn mismatch for {format:?}");
            assert_eq!(back.encode(format), bytes, "re-encode mismatch for {format:?}");
        }
    }

    #[test]
    fn test_d109_dspl_color_packing() {
        let mut wpt = Waypoint::new("X", Position::default(), "");
        wpt.color = 12;
        wpt.dspl = 2;
        let bytes = wpt.encode(WaypointFormat::D109);
        // dtyp, wpt_class, then the packed byte
        assert_eq!(bytes[2], 12 | (2 << 5));
        let back = Waypoint::decode(WaypointFormat::D109, &bytes).unwrap();
        assert_eq!(back.color, 12);
        assert_eq!(back.dspl, 2);
    }

    #[test]
    fn test_d108_trailing_optional_defaults() {
        let wpt = Waypoint::new("SHORT", Position::new(1, 2), "");
        let full = wpt.encode(WaypointFormat::D108);
        // Cut the payload right after the position field
        let short = &full[..4 + 2 + 18 + 8];
        let back = Waypoint::decode(WaypointFormat::D108, short).unwrap();
        assert_eq!(back.posn, Position::new(1, 2));
        assert_eq!(back.alt, INVALID_FLOAT);
        assert_eq!(back.dpth, INVALID_FLOAT);
        assert!(back.ident.is_empty());
    }

    #[test]
    fn test_route_header_formats() {
        let hdr = RouteHeader {
            nmbr: 3,
            cmnt: "TO WORK".into(),
            ident: "COMMUTE".into(),
        };
        let d201 = hdr.encode(RouteHeaderFormat::D201);
        assert_eq!(d201.len(), 21);
        let back = RouteHeader::decode(RouteHeaderFormat::D201, &d201).unwrap();
        assert_eq!(back.nmbr, 3);
        assert_eq!(back.cmnt, "TO WORK");

        let d202 = hdr.encode(RouteHeaderFormat::D202);
        let back = RouteHeader::decode(RouteHeaderFormat::D202, &d202).unwrap();
        assert_eq!(back.ident, "COMMUTE");
    }

    #[test]
    fn test_track_point_d300_layout() {
        let mut point = TrackPoint::default();
        point.posn = Position::new(10, -10);
        point.time = 1000;
        point.new_trk = true;
        let bytes = point.encode(TrackPointFormat::D300);
        assert_eq!(bytes.len(), 13);
        let back = TrackPoint::decode(TrackPointFormat::D300, &bytes).unwrap();
        assert!(back.new_trk);
        assert_eq!(back.time, 1000);
    }

    #[test]
    fn test_track_point_d304_roundtrip() {
        let mut point = TrackPoint::default();
        point.posn = Position::from_degrees(51.0, 5.0);
        point.time = 500_000_000;
        point.alt = 12.0;
        point.distance = 1500.0;
        point.heart_rate = 140;
        point.cadence = 90;
        point.sensor = true;
        let bytes = point.encode(TrackPointFormat::D304);
        let back = TrackPoint::decode(TrackPointFormat::D304, &bytes).unwrap();
        assert_eq!(back, {
            let mut expect = point.clone();
            // D304 does not carry depth/temp/new_trk
            expect.dpth = INVALID_FLOAT;
            expect.temp = INVALID_FLOAT;
            expect.new_trk = false;
            expect
        });
    }

    #[test]
    fn test_almanac_formats() {
        let mut alm = Almanac::default();
        alm.svid = 7;
        alm.wn = 1042;
        alm.e = 0.01;
        alm.hlth = 63;
        let d500 = alm.encode(AlmanacFormat::D500);
        assert_eq!(d500.len(), 2 + 10 * 4);
        let d551 = alm.encode(AlmanacFormat::D551);
        assert_eq!(d551.len(), 1 + 2 + 10 * 4 + 1);
        let back = Almanac::decode(AlmanacFormat::D551, &d551).unwrap();
        assert_eq!(back.svid, 7);
        assert_eq!(back.hlth, 63);
        assert!(back.is_valid());
    }

    #[test]
    fn test_pvt_roundtrip_and_time() {
        let mut pvt = Pvt::default();
        pvt.alt = -5.0;
        pvt.msl_hght = 47.0;
        pvt.fix = 3;
        pvt.posn = RadianPosition::from_degrees(52.0, 5.0);
        pvt.tow = 18.0 + 3600.0;
        pvt.leap_scnds = 18;
        pvt.wn_days = 5000;
        let bytes = pvt.encode();
        assert_eq!(bytes.len(), 64);
        let back = Pvt::decode(&bytes).unwrap();
        assert_eq!(back, pvt);
        assert_eq!(back.fix_quality().unwrap(), Fix::ThreeD);
        assert_eq!(back.msl_altitude(), 42.0);
        let expected = device_epoch() + Duration::days(5000) + Duration::seconds(3600);
        assert_eq!(back.datetime(), expected);
    }

    #[test]
    fn test_fix_out_of_range() {
        let mut pvt = Pvt::default();
        pvt.fix = 9;
        assert!(matches!(
            pvt.fix_quality(),
            Err(GarminError::FieldRange { field: "fix", .. })
        ));
    }

    #[test]
    fn test_lap_formats() {
        let mut lap = Lap::default();
        lap.index = 12;
        lap.start_time = 700_000_000;
        lap.total_time = 360_000;
        lap.total_dist = 5000.0;
        lap.calories = 250;
        let d906 = lap.encode(LapFormat::D906);
        assert_eq!(d906.len(), 32);
        let d1011 = lap.encode(LapFormat::D1011);
        let back = Lap::decode(LapFormat::D1011, &d1011).unwrap();
        assert_eq!(back.index, 12);
        assert_eq!(back.calories, 250);
    }

    #[test]
    fn test_workout_step_padding() {
        let mut workout = Workout::default();
        workout.name = "INTERVALS".into();
        workout.sport_type = 0;
        workout.steps.push(WorkoutStep {
            custom_name: "WARMUP".into(),
            duration_value: 600,
            duration_type: 0,
            ..Default::default()
        });
        let bytes = workout.encode();
        // 4 + 20 steps of 30 bytes + 16 + 1
        assert_eq!(bytes.len(), 4 + 20 * 30 + 17);
        let back = Workout::decode(&bytes).unwrap();
        assert_eq!(back.steps.len(), 1);
        assert_eq!(back.steps[0].custom_name, "WARMUP");
        assert_eq!(back.name, "INTERVALS");
    }

    #[test]
    fn test_run_d1009_roundtrip() {
        let mut run = Run::default();
        run.track_index = 4;
        run.first_lap_index = 10;
        run.last_lap_index = 14;
        run.sport_type = 1;
        let bytes = run.encode(RunFormat::D1009);
        let back = Run::decode(RunFormat::D1009, &bytes).unwrap();
        assert_eq!(back.track_index, 4);
        assert_eq!(back.last_lap_index, 14);
        assert!(back.has_track());
    }

    #[test]
    fn test_image_list_decode() {
        let data = [3, 0, 1, 2, 7, 0, 0, 0];
        let images = decode_image_list(&data).unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].idx, 3);
        assert!(images[0].writable);
        assert_eq!(images[1].image_type, 0);
    }

    #[test]
    fn test_screenshot_sections() {
        let mut header = vec![];
        header.extend_from_slice(&0u32.to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes());
        for v in [40u32, 8, 160, 240] {
            header.extend_from_slice(&v.to_le_bytes());
        }
        match ScreenshotSection::decode(&header).unwrap() {
            ScreenshotSection::Header {
                bytewidth,
                bpp,
                width,
                height,
            } => {
                assert_eq!((bytewidth, bpp, width, height), (40, 8, 160, 240));
            }
            other => panic!("unexpected section: {other:?}"),
        }

        let mut color = vec![];
        color.extend_from_slice(&2u32.to_le_bytes());
        color.extend_from_slice(&0u32.to_le_bytes());
        color.extend_from_slice(&[10, 20, 30]);
        match ScreenshotSection::decode(&color).unwrap() {
            ScreenshotSection::Color(rgb) => {
                assert_eq!(rgb, Rgb { red: 30, green: 20, blue: 10 });
            }
            other => panic!("unexpected section: {other:?}"),
        }
    }
}
