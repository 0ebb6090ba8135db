//! Command-line front-end
//!
//! Thin wrapper over the library session: every subcommand opens the port,
//! runs one operation, and prints what it downloaded. File formats are out
//! of scope here; records print as text and maps/images move as raw bytes.

use clap::{Parser, Subcommand};
use garmin_link::datatype::timestamp_to_datetime;
use garmin_link::{
    Garmin, GarminError, Position, Route, RouteHeader, Track, TrackHeader, TrackPoint, Waypoint,
};
use log::error;
use std::fs;
use std::io;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "garmin-link")]
#[command(about = "Talk to Garmin GPS devices over serial or USB")]
struct Args {
    /// Serial device path, or "usb:" for USB autodiscovery
    #[arg(short, long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Log protocol milestones
    #[arg(short, long)]
    verbose: bool,

    /// Log every packet on the wire
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Show product data and negotiated protocols
    Info,
    /// Show the device's unit ID
    UnitId,
    /// Download waypoints
    GetWaypoints,
    /// Upload waypoints ("IDENT LAT LON [COMMENT]" per line)
    PutWaypoints {
        /// Read waypoint lines from here
        file: String,
    },
    /// Download routes
    GetRoutes,
    /// Upload routes ("route NMBR [NAME]" headers, waypoint lines below)
    PutRoutes {
        /// Read route lines from here
        file: String,
    },
    /// Download tracks
    GetTracks,
    /// Upload tracks ("track [NAME]" headers, "LAT LON" lines below)
    PutTracks {
        /// Read track lines from here
        file: String,
    },
    /// Download fitness laps
    GetLaps,
    /// Download fitness runs (with their laps and tracks)
    GetRuns,
    /// Download the almanac
    GetAlmanac,
    /// Show the device's date and time
    GetTime,
    /// Stream real-time position/velocity/time records
    Pvt {
        /// Stop after this many records
        #[arg(short = 'n', long, default_value = "10")]
        count: u32,
    },
    /// Capture a screenshot
    GetScreenshot {
        /// Write raw pixel rows here
        file: String,
    },
    /// Download an image by index
    GetImage {
        idx: u16,
        /// Write raw pixel rows here
        file: String,
    },
    /// Upload an image by index (raw pixel rows sized for the slot)
    PutImage {
        idx: u16,
        /// Read raw pixel rows from here
        file: String,
    },
    /// List downloadable images
    GetImageList,
    /// Download the map blob (Garmin IMG format)
    GetMap {
        /// Write the IMG blob here
        file: String,
    },
    /// Upload a map blob (Garmin IMG format)
    PutMap {
        /// Read the IMG blob from here
        file: String,
    },
}

fn bad_line(lineno: usize, what: &str) -> GarminError {
    GarminError::Io(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("line {lineno}: expected {what}"),
    ))
}

/// "IDENT LAT LON [COMMENT]" with coordinates in degrees.
fn parse_waypoint_line(line: &str) -> Option<Waypoint> {
    let mut parts = line.split_whitespace();
    let ident = parts.next()?;
    let lat: f64 = parts.next()?.parse().ok()?;
    let lon: f64 = parts.next()?.parse().ok()?;
    let cmnt = parts.collect::<Vec<_>>().join(" ");
    Some(Waypoint::new(ident, Position::from_degrees(lat, lon), &cmnt))
}

/// "LAT LON" in degrees.
fn parse_point_line(line: &str) -> Option<TrackPoint> {
    let mut parts = line.split_whitespace();
    let lat: f64 = parts.next()?.parse().ok()?;
    let lon: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(TrackPoint {
        posn: Position::from_degrees(lat, lon),
        ..TrackPoint::default()
    })
}

/// Lines of the upload files, trimmed, with blanks and # comments dropped.
fn record_lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
}

fn run(args: Args) -> Result<(), GarminError> {
    let mut gps = Garmin::open(&args.port)?;

    match args.command {
        CliCommand::Info => {
            let product = gps.product();
            println!("Product ID:       {}", product.product_id);
            println!("Software version: {:.2}", product.version());
            for line in &product.description {
                println!("Description:      {line}");
            }
            for line in gps.extra_product_data() {
                println!("Extra:            {line}");
            }
            println!("Protocols:        {:?}", gps.protocols());
        }
        CliCommand::UnitId => {
            println!("{}", gps.get_unit_id()?);
        }
        CliCommand::GetWaypoints => {
            for waypoint in gps.get_waypoints()? {
                println!("{waypoint}");
            }
        }
        CliCommand::PutWaypoints { file } => {
            let text = fs::read_to_string(file)?;
            let mut waypoints = Vec::new();
            for (lineno, line) in record_lines(&text) {
                let wpt = parse_waypoint_line(line)
                    .ok_or_else(|| bad_line(lineno, "IDENT LAT LON [COMMENT]"))?;
                waypoints.push(wpt);
            }
            gps.put_waypoints(&waypoints)?;
            println!("{} waypoints uploaded", waypoints.len());
        }
        CliCommand::PutRoutes { file } => {
            let text = fs::read_to_string(file)?;
            let mut routes: Vec<Route> = Vec::new();
            for (lineno, line) in record_lines(&text) {
                if line == "route" || line.starts_with("route ") {
                    let mut parts = line["route".len()..].split_whitespace();
                    let nmbr: u8 = parts
                        .next()
                        .and_then(|n| n.parse().ok())
                        .ok_or_else(|| bad_line(lineno, "route NMBR [NAME]"))?;
                    let name = parts.collect::<Vec<_>>().join(" ");
                    routes.push(Route {
                        header: RouteHeader {
                            nmbr,
                            cmnt: name.clone(),
                            ident: name,
                        },
                        ..Route::default()
                    });
                } else {
                    let wpt = parse_waypoint_line(line)
                        .ok_or_else(|| bad_line(lineno, "IDENT LAT LON [COMMENT]"))?;
                    let route = routes
                        .last_mut()
                        .ok_or_else(|| bad_line(lineno, "a route header before waypoints"))?;
                    route.waypoints.push(wpt);
                }
            }
            gps.put_routes(&routes)?;
            println!("{} routes uploaded", routes.len());
        }
        CliCommand::GetRoutes => {
            for route in gps.get_routes()? {
                println!(
                    "route {} {} ({} waypoints)",
                    route.header.nmbr,
                    if route.header.ident.is_empty() {
                        &route.header.cmnt
                    } else {
                        &route.header.ident
                    },
                    route.waypoints.len()
                );
                for waypoint in &route.waypoints {
                    println!("  {waypoint}");
                }
            }
        }
        CliCommand::GetTracks => {
            for track in gps.get_tracks()? {
                match &track.header {
                    Some(header) => println!("track {}", header.ident),
                    None => println!("track log"),
                }
                for point in &track.points {
                    let time = point
                        .datetime()
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_default();
                    println!("  {} {}", point.posn, time);
                }
            }
        }
        CliCommand::PutTracks { file } => {
            let text = fs::read_to_string(file)?;
            let mut tracks: Vec<Track> = Vec::new();
            for (lineno, line) in record_lines(&text) {
                if line == "track" || line.starts_with("track ") {
                    let ident = line["track".len()..].trim().to_string();
                    tracks.push(Track {
                        header: Some(TrackHeader {
                            ident,
                            ..TrackHeader::default()
                        }),
                        points: Vec::new(),
                    });
                } else {
                    let point =
                        parse_point_line(line).ok_or_else(|| bad_line(lineno, "LAT LON"))?;
                    if tracks.is_empty() {
                        // Devices without track headers take one plain log
                        tracks.push(Track::default());
                    }
                    tracks.last_mut().expect("pushed above").points.push(point);
                }
            }
            gps.put_tracks(&tracks)?;
            println!("{} tracks uploaded", tracks.len());
        }
        CliCommand::GetLaps => {
            for lap in gps.get_laps()? {
                let start = timestamp_to_datetime(lap.start_time)
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_default();
                println!(
                    "lap {} {} {:.0}m {:.1}s",
                    lap.index,
                    start,
                    lap.total_dist,
                    lap.total_time as f64 / 100.0
                );
            }
        }
        CliCommand::GetRuns => {
            let transfer = gps.get_runs()?;
            println!(
                "{} runs, {} laps, {} tracks",
                transfer.runs.len(),
                transfer.laps.len(),
                transfer.tracks.len()
            );
        }
        CliCommand::GetAlmanac => {
            for (i, almanac) in gps.get_almanac()?.iter().enumerate() {
                if almanac.is_valid() {
                    println!("PRN-{:02} week {}", i + 1, almanac.wn);
                }
            }
        }
        CliCommand::GetTime => {
            println!("{}", gps.get_time()?);
        }
        CliCommand::Pvt { count } => {
            let mut stream = gps.pvt()?;
            for _ in 0..count {
                println!("{}", stream.next()?);
            }
            stream.stop()?;
        }
        CliCommand::GetScreenshot { file } => {
            let image = gps.get_screenshot()?;
            println!("{}x{} at {} bpp", image.width, image.height, image.bpp);
            fs::write(file, &image.pixels)?;
        }
        CliCommand::GetImage { idx, file } => {
            let image = gps.get_image(idx)?;
            println!("{}x{} at {} bpp", image.width, image.height, image.bpp);
            fs::write(file, &image.pixels)?;
        }
        CliCommand::PutImage { idx, file } => {
            // The slot dictates geometry and palette; download it first and
            // swap in the new pixel rows
            let mut image = gps.get_image(idx)?;
            let pixels = fs::read(file)?;
            if pixels.len() != image.pixels.len() {
                return Err(GarminError::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "image file is {} bytes, slot {idx} wants {}",
                        pixels.len(),
                        image.pixels.len()
                    ),
                )));
            }
            image.pixels = pixels;
            gps.put_image(idx, &image)?;
            println!("image {idx} uploaded");
        }
        CliCommand::GetImageList => {
            for entry in gps.get_image_list()? {
                println!(
                    "{:3} {} {}",
                    entry.prop.idx,
                    if entry.prop.writable { "rw" } else { "ro" },
                    entry.name
                );
            }
        }
        CliCommand::GetMap { file } => match gps.get_map()? {
            Some(map) => {
                println!("{} bytes", map.len());
                fs::write(file, &map)?;
            }
            None => println!("no map on the device"),
        },
        CliCommand::PutMap { file } => {
            let data = fs::read(file)?;
            gps.put_map(&data)?;
            println!("{} bytes uploaded", data.len());
        }
    }

    gps.close()
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else {
        "warn"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
