//! Garmin device interface protocol
//!
//! This library implements the host side of the Garmin device interface:
//! the three-layer physical/link/application protocol stack spoken by
//! consumer GPS units over a serial port or USB. A session negotiates the
//! device's capabilities at startup and then exposes the bulk transfer
//! operations (waypoints, routes, tracks, fitness data, almanac, images,
//! maps, real-time PVT).
//!
//! # Modules
//!
//! - `phys`: byte-level serial and USB transports
//! - `link`: framing, checksums, and ACK/NAK on top of a transport
//! - `protocol`: capability negotiation, commands, and transfer engines
//! - `datatype`: the Dxxx record codecs
//! - `catalog`: capabilities of devices that predate A001
//! - `device`: the session orchestrator
//!
//! ```no_run
//! use garmin_link::Garmin;
//!
//! let mut gps = Garmin::open("/dev/ttyUSB0")?;
//! println!("connected to {}", gps.product().description.join(", "));
//! for waypoint in gps.get_waypoints()? {
//!     println!("{waypoint}");
//! }
//! # Ok::<(), garmin_link::GarminError>(())
//! ```

pub mod catalog;
pub mod codec;
pub mod datatype;
pub mod device;
pub mod link;
pub mod phys;
pub mod protocol;
pub mod types;

pub use datatype::{
    degrees_to_semicircle, semicircle_to_degrees, Almanac, Course, CourseLap, CourseLimits,
    CoursePoint, DateTimeRecord, FitnessUserProfile, FlightBookRecord, Image, Lap, Position,
    ProductInfo, Pvt, RadianPosition, Route, RouteHeader, RouteLink, Track, TrackHeader,
    TrackPoint, Waypoint, Workout, WorkoutLimits, WorkoutOccurrence,
};
pub use device::{Garmin, PvtStream, USB_PORT_SPEC};
pub use link::{Link, LinkStats, SerialLink, UsbLink};
pub use phys::{SerialDevice, SerialIo, UsbDevice, UsbIo};
pub use protocol::{CancelToken, ImageListEntry, ProtocolSet, RunTransfer};
pub use types::{GarminError, Packet, Result};
