//! Session orchestrator
//!
//! A [`Garmin`] owns the transport and link exclusively, negotiates the
//! protocol set at construction, and exposes the bulk operations. The
//! conversation is strictly one transfer at a time; PVT streaming hands
//! out a borrowed pull-handle so nothing else can talk to the device while
//! the stream is live.

use crate::datatype::{
    Almanac, Course, CourseLap, CourseLimits, CoursePoint, DateTimeRecord, FitnessUserProfile,
    FlightBookRecord, Image, Lap, ProductInfo, Pvt, RadianPosition, Route, Track, Waypoint,
    Workout, WorkoutLimits, WorkoutOccurrence,
};
use crate::link::{Link, LinkStats, SerialLink, UsbLink};
use crate::phys::{SerialDevice, UsbDevice, DEFAULT_TIMEOUT};
use crate::protocol::{
    self, CancelToken, Command, ImageListEntry, Negotiation, ProtocolSet, RunTransfer,
};
use crate::types::Result;
use log::info;
use std::time::{Duration, Instant};

/// Port spec selecting USB autodiscovery instead of a serial device path.
pub const USB_PORT_SPEC: &str = "usb:";

/// A session with one attached device.
pub struct Garmin {
    link: Box<dyn Link>,
    product: ProductInfo,
    extra: Vec<String>,
    protocols: ProtocolSet,
    cancel: CancelToken,
}

impl Garmin {
    /// Open a session on a serial device path (`/dev/ttyUSB0`, `COM3`) or
    /// the literal `"usb:"` for USB autodiscovery.
    pub fn open(port_spec: &str) -> Result<Self> {
        let link: Box<dyn Link> = if port_spec == USB_PORT_SPEC {
            Box::new(UsbLink::start_session(UsbDevice::open()?)?)
        } else {
            Box::new(SerialLink::new(SerialDevice::open(port_spec)?))
        };
        Self::from_link(link)
    }

    /// Run capability negotiation over an already-established link.
    pub fn from_link(mut link: Box<dyn Link>) -> Result<Self> {
        let Negotiation {
            product,
            extra,
            protocols,
        } = protocol::negotiate(link.as_mut())?;
        Ok(Self {
            link,
            product,
            extra,
            protocols,
            cancel: CancelToken::new(),
        })
    }

    pub fn product(&self) -> &ProductInfo {
        &self.product
    }

    /// The manufacturing strings some devices append to their product data.
    pub fn extra_product_data(&self) -> &[String] {
        &self.extra
    }

    pub fn protocols(&self) -> &ProtocolSet {
        &self.protocols
    }

    /// Link-layer counters: retransmits, NAKs, and friends.
    pub fn link_stats(&self) -> LinkStats {
        self.link.stats()
    }

    /// Handle for cancelling the transfer in flight from another thread.
    /// Cancellation sends an abort, drains the device, and surfaces
    /// `Cancelled` from the running call.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn begin(&mut self) -> (&mut dyn Link, &ProtocolSet, &CancelToken) {
        self.cancel.reset();
        (self.link.as_mut(), &self.protocols, &self.cancel)
    }

    pub fn get_waypoints(&mut self) -> Result<Vec<Waypoint>> {
        let (link, set, cancel) = self.begin();
        protocol::get_waypoints(link, set, cancel)
    }

    pub fn put_waypoints(&mut self, waypoints: &[Waypoint]) -> Result<()> {
        let (link, set, cancel) = self.begin();
        protocol::put_waypoints(link, set, cancel, waypoints)
    }

    pub fn get_proximities(&mut self) -> Result<Vec<Waypoint>> {
        let (link, set, cancel) = self.begin();
        protocol::get_proximities(link, set, cancel)
    }

    pub fn put_proximities(&mut self, waypoints: &[Waypoint]) -> Result<()> {
        let (link, set, cancel) = self.begin();
        protocol::put_proximities(link, set, cancel, waypoints)
    }

    pub fn get_routes(&mut self) -> Result<Vec<Route>> {
        let (link, set, cancel) = self.begin();
        protocol::get_routes(link, set, cancel)
    }

    pub fn put_routes(&mut self, routes: &[Route]) -> Result<()> {
        let (link, set, cancel) = self.begin();
        protocol::put_routes(link, set, cancel, routes)
    }

    pub fn get_tracks(&mut self) -> Result<Vec<Track>> {
        let (link, set, cancel) = self.begin();
        protocol::get_tracks(link, set, cancel)
    }

    pub fn put_tracks(&mut self, tracks: &[Track]) -> Result<()> {
        let (link, set, cancel) = self.begin();
        protocol::put_tracks(link, set, cancel, tracks)
    }

    pub fn get_almanac(&mut self) -> Result<Vec<Almanac>> {
        let (link, set, cancel) = self.begin();
        protocol::get_almanac(link, set, cancel)
    }

    pub fn get_time(&mut self) -> Result<DateTimeRecord> {
        let (link, set, _) = self.begin();
        protocol::get_time(link, set)
    }

    pub fn put_time(&mut self, time: &DateTimeRecord) -> Result<()> {
        let (link, set, _) = self.begin();
        protocol::put_time(link, set, time)
    }

    pub fn get_position(&mut self) -> Result<RadianPosition> {
        let (link, set, _) = self.begin();
        protocol::get_position(link, set)
    }

    pub fn put_position(&mut self, position: &RadianPosition) -> Result<()> {
        let (link, set, _) = self.begin();
        protocol::put_position(link, set, position)
    }

    pub fn get_flightbook(&mut self) -> Result<Vec<FlightBookRecord>> {
        let (link, set, cancel) = self.begin();
        protocol::get_flightbook(link, set, cancel)
    }

    pub fn get_laps(&mut self) -> Result<Vec<Lap>> {
        let (link, set, cancel) = self.begin();
        protocol::get_laps(link, set, cancel)
    }

    /// Download runs along with the laps and tracks chained behind them.
    pub fn get_runs(&mut self) -> Result<RunTransfer> {
        let (link, set, cancel) = self.begin();
        protocol::get_runs(link, set, cancel)
    }

    pub fn get_workouts(&mut self) -> Result<Vec<Workout>> {
        let (link, set, cancel) = self.begin();
        protocol::get_workouts(link, set, cancel)
    }

    pub fn get_workout_occurrences(&mut self) -> Result<Vec<WorkoutOccurrence>> {
        let (link, set, cancel) = self.begin();
        protocol::get_workout_occurrences(link, set, cancel)
    }

    pub fn get_fitness_user_profile(&mut self) -> Result<FitnessUserProfile> {
        let (link, set, _) = self.begin();
        protocol::get_fitness_user_profile(link, set)
    }

    pub fn get_workout_limits(&mut self) -> Result<WorkoutLimits> {
        let (link, set, _) = self.begin();
        protocol::get_workout_limits(link, set)
    }

    pub fn get_courses(&mut self) -> Result<Vec<Course>> {
        let (link, set, cancel) = self.begin();
        protocol::get_courses(link, set, cancel)
    }

    pub fn get_course_laps(&mut self) -> Result<Vec<CourseLap>> {
        let (link, set, cancel) = self.begin();
        protocol::get_course_laps(link, set, cancel)
    }

    pub fn get_course_points(&mut self) -> Result<Vec<CoursePoint>> {
        let (link, set, cancel) = self.begin();
        protocol::get_course_points(link, set, cancel)
    }

    pub fn get_course_limits(&mut self) -> Result<CourseLimits> {
        let (link, set, _) = self.begin();
        protocol::get_course_limits(link, set)
    }

    pub fn get_course_tracks(&mut self) -> Result<Vec<Track>> {
        let (link, set, cancel) = self.begin();
        protocol::get_course_tracks(link, set, cancel)
    }

    /// Start PVT streaming and hand back the pull-handle. The session is
    /// exclusively borrowed until the stream is stopped or dropped.
    pub fn pvt(&mut self) -> Result<PvtStream<'_>> {
        let (link, set, _) = self.begin();
        protocol::pvt_on(link, set)?;
        info!("PVT streaming started");
        Ok(PvtStream {
            session: self,
            stopped: false,
        })
    }

    pub fn get_image_types(&mut self) -> Result<Vec<ImageListEntry>> {
        let (link, set, _) = self.begin();
        protocol::get_image_types(link, set)
    }

    pub fn get_image_list(&mut self) -> Result<Vec<ImageListEntry>> {
        let (link, set, _) = self.begin();
        protocol::get_image_list(link, set)
    }

    pub fn get_image(&mut self, idx: u16) -> Result<Image> {
        let (link, set, cancel) = self.begin();
        protocol::get_image(link, set, cancel, idx)
    }

    pub fn put_image(&mut self, idx: u16, image: &Image) -> Result<()> {
        let (link, set, cancel) = self.begin();
        protocol::put_image(link, set, cancel, idx, image)
    }

    pub fn get_screenshot(&mut self) -> Result<Image> {
        let (link, set, _) = self.begin();
        protocol::get_screenshot(link, set)
    }

    /// Download the map blob (Garmin IMG format); `None` when the device
    /// holds no map.
    pub fn get_map(&mut self) -> Result<Option<Vec<u8>>> {
        let (link, set, cancel) = self.begin();
        protocol::get_map(link, set, cancel)
    }

    /// Upload a map blob into the supplementary-map region.
    pub fn put_map(&mut self, data: &[u8]) -> Result<()> {
        let (link, set, cancel) = self.begin();
        protocol::put_map(link, set, cancel, data)
    }

    pub fn get_unit_id(&mut self) -> Result<u32> {
        let (link, set, _) = self.begin();
        protocol::get_unit_id(link, set)
    }

    pub fn get_supported_baudrates(&mut self) -> Result<Vec<u32>> {
        let (link, set, _) = self.begin();
        protocol::get_supported_baudrates(link, set)
    }

    /// Negotiate a faster line rate; returns the rate actually in effect.
    pub fn set_baudrate(&mut self, baud: u32) -> Result<u32> {
        let (link, set, _) = self.begin();
        protocol::set_baudrate(link, set, baud)
    }

    pub fn abort_transfer(&mut self) -> Result<()> {
        let (link, set, _) = self.begin();
        protocol::abort_transfer(link, set)
    }

    pub fn turn_power_off(&mut self) -> Result<()> {
        let (link, set, _) = self.begin();
        protocol::send_command(link, set, Command::TurnOffPwr)
    }

    /// End the session and release the port. Dropping the session has the
    /// same effect; this form surfaces close-time errors.
    pub fn close(self) -> Result<()> {
        Ok(())
    }
}

/// Lazy, cancellable PVT sequence. Each `next` blocks for the following
/// ~1 Hz record; `stop` turns streaming off and drains whatever the device
/// already put on the wire.
pub struct PvtStream<'a> {
    session: &'a mut Garmin,
    stopped: bool,
}

impl PvtStream<'_> {
    /// Block until the next PVT record arrives.
    pub fn next(&mut self) -> Result<Pvt> {
        protocol::read_pvt(self.session.link.as_mut(), &self.session.protocols)
    }

    /// Stop streaming. Packets already in flight are drained so the next
    /// transfer starts on a quiet line.
    pub fn stop(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        let link = self.session.link.as_mut();
        protocol::pvt_off(link, &self.session.protocols)?;
        link.set_timeout(Duration::from_millis(250))?;
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            match link.read_packet() {
                Ok(_) => continue,
                Err(_) => break,
            }
        }
        link.set_timeout(DEFAULT_TIMEOUT)?;
        info!("PVT streaming stopped");
        Ok(())
    }
}

impl Drop for PvtStream<'_> {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
