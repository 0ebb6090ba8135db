//! Device capability catalog
//!
//! Devices that predate the protocol capability protocol (A001) never
//! announce what they speak; the host looks them up here by product id and
//! software version instead. Rows are stored as the same tagged protocol
//! tuples an A001 protocol array carries, so both paths funnel through one
//! `ProtocolSet` builder.
//!
//! A000, A600/D600, and A700/D700 are implemented by every device in the
//! table and are appended to each row at lookup time rather than repeated
//! below.

use crate::protocol::{ProtocolEntry, ProtocolTag};
use crate::types::{GarminError, Result};
use log::warn;

/// Product ids below this are old enough to assume the minimal default
/// stack when the catalog has no row for them.
const DEFAULT_STACK_CUTOFF: u16 = 50;

const fn l(number: u16) -> ProtocolEntry {
    ProtocolEntry {
        tag: ProtocolTag::Link,
        number,
    }
}

const fn a(number: u16) -> ProtocolEntry {
    ProtocolEntry {
        tag: ProtocolTag::Application,
        number,
    }
}

const fn d(number: u16) -> ProtocolEntry {
    ProtocolEntry {
        tag: ProtocolTag::DataType,
        number,
    }
}

struct CatalogRow {
    product_id: u16,
    /// Row applies when the device reports at least this version
    /// (hundredths)
    min_version: u16,
    protocols: &'static [ProtocolEntry],
}

const fn row(
    product_id: u16,
    min_version: u16,
    protocols: &'static [ProtocolEntry],
) -> CatalogRow {
    CatalogRow {
        product_id,
        min_version,
        protocols,
    }
}

// Shared stacks; most early units differ only in the waypoint datatype.
static WPT_D100_RTE_D200: &[ProtocolEntry] = &[
    l(1),
    a(10),
    a(100),
    d(100),
    a(200),
    d(200),
    d(100),
    a(300),
    d(300),
    a(400),
    d(400),
    a(500),
    d(500),
];

static WPT_D100_RTE_D200_NO_TRK: &[ProtocolEntry] = &[
    l(1),
    a(10),
    a(100),
    d(100),
    a(200),
    d(200),
    d(100),
    a(400),
    d(400),
    a(500),
    d(500),
];

static WPT_D100_BASIC: &[ProtocolEntry] = &[
    l(1),
    a(10),
    a(100),
    d(100),
    a(200),
    d(201),
    d(100),
    a(300),
    d(300),
    a(500),
    d(500),
];

static WPT_D101: &[ProtocolEntry] = &[
    l(1),
    a(10),
    a(100),
    d(101),
    a(200),
    d(201),
    d(101),
    a(300),
    d(300),
    a(400),
    d(101),
    a(500),
    d(500),
];

static WPT_D102: &[ProtocolEntry] = &[
    l(1),
    a(10),
    a(100),
    d(102),
    a(200),
    d(201),
    d(102),
    a(300),
    d(300),
    a(400),
    d(102),
    a(500),
    d(501),
];

// Same stack as WPT_D102 except the almanac stays D500; only product 29
// uses it.
static WPT_D102_D500: &[ProtocolEntry] = &[
    l(1),
    a(10),
    a(100),
    d(102),
    a(200),
    d(201),
    d(102),
    a(300),
    d(300),
    a(400),
    d(102),
    a(500),
    d(500),
];

static WPT_D103: &[ProtocolEntry] = &[
    l(1),
    a(10),
    a(100),
    d(103),
    a(200),
    d(201),
    d(103),
    a(300),
    d(300),
    a(400),
    d(403),
    a(500),
    d(501),
];

static WPT_D103_NO_PRX: &[ProtocolEntry] = &[
    l(1),
    a(10),
    a(100),
    d(103),
    a(200),
    d(201),
    d(103),
    a(300),
    d(300),
    a(500),
    d(501),
];

static WPT_D104: &[ProtocolEntry] = &[
    l(1),
    a(10),
    a(100),
    d(104),
    a(200),
    d(201),
    d(104),
    a(300),
    d(300),
    a(500),
    d(501),
];

static WPT_D100_D400: &[ProtocolEntry] = &[
    l(1),
    a(10),
    a(100),
    d(100),
    a(200),
    d(201),
    d(100),
    a(300),
    d(300),
    a(400),
    d(400),
    a(500),
    d(501),
];

static GPS_7: &[ProtocolEntry] = &[
    l(1),
    a(10),
    a(100),
    d(100),
    a(200),
    d(200),
    d(100),
    a(500),
    d(500),
];

/// Devices without A001, in table order. First satisfied row wins.
static CATALOG: &[CatalogRow] = &[
    row(7, 0, GPS_7),
    row(13, 0, WPT_D100_RTE_D200),
    row(14, 0, WPT_D100_RTE_D200_NO_TRK),
    row(18, 0, WPT_D100_RTE_D200),
    row(23, 0, WPT_D100_RTE_D200),
    row(24, 0, WPT_D100_RTE_D200),
    row(25, 0, WPT_D100_RTE_D200),
    row(29, 400, WPT_D102_D500),
    row(29, 0, WPT_D101),
    row(31, 0, WPT_D100_BASIC),
    row(35, 0, WPT_D100_RTE_D200),
    row(41, 0, WPT_D100_BASIC),
    row(42, 0, WPT_D100_RTE_D200),
    row(44, 0, WPT_D101),
    row(47, 0, WPT_D100_BASIC),
    row(49, 0, WPT_D102),
    row(55, 0, WPT_D100_BASIC),
    row(56, 0, WPT_D100_BASIC),
    row(59, 0, WPT_D100_BASIC),
    row(61, 0, WPT_D100_BASIC),
    row(62, 0, WPT_D100_BASIC),
    row(72, 0, WPT_D104),
    row(73, 0, WPT_D103_NO_PRX),
    row(74, 0, WPT_D100_BASIC),
    row(76, 0, WPT_D102),
    row(77, 361, WPT_D103),
    // 3.50-3.60 only drops proximity waypoints; the almanac stays D501
    row(77, 350, WPT_D103_NO_PRX),
    row(77, 301, WPT_D103),
    row(77, 0, WPT_D100_D400),
    row(87, 0, WPT_D103),
    row(88, 0, WPT_D102),
    row(95, 0, WPT_D103),
    row(96, 0, WPT_D103),
    row(97, 0, WPT_D103_NO_PRX),
    row(100, 0, WPT_D103),
    row(105, 0, WPT_D103),
    row(106, 0, WPT_D103),
];

/// Protocols implemented by everything in the table.
static IMPLIED: &[ProtocolEntry] = &[a(600), d(600), a(700), d(700)];

/// Minimal stack assumed for very old units missing from the table.
static DEFAULT_STACK: &[ProtocolEntry] = &[l(1), a(10), a(100), d(100)];

/// Look up the protocol tuples for a device that does not implement A001.
pub fn lookup(product_id: u16, software_version: u16) -> Result<Vec<ProtocolEntry>> {
    let mut chosen: Option<&CatalogRow> = None;
    for candidate in CATALOG
        .iter()
        .filter(|r| r.product_id == product_id && software_version >= r.min_version)
    {
        match chosen {
            None => chosen = Some(candidate),
            Some(first) => {
                if first.min_version == candidate.min_version {
                    warn!(
                        "Ambiguous catalog rows for product {product_id} at version \
                         {software_version}; keeping the first match"
                    );
                }
                break;
            }
        }
    }

    match chosen {
        Some(row) => {
            let mut protocols = row.protocols.to_vec();
            protocols.extend_from_slice(IMPLIED);
            Ok(protocols)
        }
        None if product_id < DEFAULT_STACK_CUTOFF => {
            warn!(
                "Product {product_id} not in the catalog; assuming the minimal default stack"
            );
            Ok(DEFAULT_STACK.to_vec())
        }
        None => Err(GarminError::UnknownDevice(product_id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbers(entries: &[ProtocolEntry], tag: ProtocolTag) -> Vec<u16> {
        entries
            .iter()
            .filter(|e| e.tag == tag)
            .map(|e| e.number)
            .collect()
    }

    #[test]
    fn test_lookup_gps_12xl() {
        // GPS 12XL, software 2.30
        let protocols = lookup(105, 230).unwrap();
        assert_eq!(numbers(&protocols, ProtocolTag::Link), vec![1]);
        let apps = numbers(&protocols, ProtocolTag::Application);
        assert!(apps.contains(&10));
        assert!(apps.contains(&100));
        assert!(apps.contains(&600));
        assert!(apps.contains(&700));
        // Waypoint datatype is D103
        let pos = protocols
            .iter()
            .position(|e| e.tag == ProtocolTag::Application && e.number == 100)
            .unwrap();
        assert_eq!(protocols[pos + 1].number, 103);
    }

    #[test]
    fn test_lookup_version_ranges() {
        // GPS 12 (id 77) dropped proximity waypoints only in 3.50..3.61
        let has_prx = |version| {
            lookup(77, version)
                .unwrap()
                .iter()
                .any(|e| e.tag == ProtocolTag::Application && e.number == 400)
        };
        assert!(has_prx(361));
        assert!(!has_prx(350));
        assert!(has_prx(301));
        assert!(has_prx(100));
    }

    #[test]
    fn test_lookup_almanac_datatypes() {
        let almanac = |product_id, version| {
            let protocols = lookup(product_id, version).unwrap();
            let pos = protocols
                .iter()
                .position(|e| e.tag == ProtocolTag::Application && e.number == 500)
                .unwrap();
            protocols[pos + 1].number
        };
        // GPS 29 keeps the D500 almanac in every tier
        assert_eq!(almanac(29, 400), 500);
        assert_eq!(almanac(29, 100), 500);
        // GPS 12 reports D501 in every tier, including 3.50-3.60
        assert_eq!(almanac(77, 361), 501);
        assert_eq!(almanac(77, 350), 501);
        assert_eq!(almanac(77, 301), 501);
        assert_eq!(almanac(49, 100), 501);
    }

    #[test]
    fn test_lookup_default_stack() {
        let protocols = lookup(3, 100).unwrap();
        assert_eq!(numbers(&protocols, ProtocolTag::Application), vec![10, 100]);
    }

    #[test]
    fn test_lookup_unknown_device() {
        assert!(matches!(
            lookup(9999, 100),
            Err(GarminError::UnknownDevice(9999))
        ));
    }
}
