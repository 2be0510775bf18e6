//! End-to-end STAR scenarios over a transport that replays fixed bytes.

use mlstar::error::{Error, FirmwareErrorKind};
use mlstar::liquid::LiquidClass;
use mlstar::resources::{Container, Coordinate, GripDirection, Plate, Tip, TipSpot};
use mlstar::star::autoload::{ScanDirection, Symbology};
use mlstar::star::iswap::{DropParams, PickupParams};
use mlstar::star::{AspirateOp, Star};
use mlstar::transport::Transport;
use std::collections::VecDeque;
use std::time::Duration;

/// Replays scripted replies; `id####` in a script is stamped with the
/// id of the request it answers, so retries line up automatically.
#[derive(Debug)]
struct ReplayTransport {
    requests: Vec<String>,
    replies: VecDeque<String>,
}

impl ReplayTransport {
    fn new(replies: &[&str]) -> ReplayTransport {
        ReplayTransport {
            requests: Vec::new(),
            replies: replies.iter().map(|r| r.to_string()).collect(),
        }
    }

    fn with_setup(extra: &[&str]) -> ReplayTransport {
        let mut replies = vec![
            "C0RMid####kb11kp08",
            "C0QMid####xl06xw1F40",
            "C0INid####",
            "H0EVid####ev20230101",
        ];
        replies.extend_from_slice(extra);
        ReplayTransport::new(&replies)
    }

    fn requests(&self) -> &[String] {
        &self.requests
    }
}

impl Transport for ReplayTransport {
    fn send(&mut self, request: &[u8], _timeout: Duration) -> Result<Vec<u8>, Error> {
        let request = String::from_utf8_lossy(request).trim_end().to_string();
        let id = request
            .find("id")
            .map(|at| request[at + 2..at + 6].to_string())
            .unwrap_or_default();
        self.requests.push(request);
        match self.replies.pop_front() {
            Some(reply) => Ok(reply.replace("####", &id).into_bytes()),
            None => Err(Error::NoResponse),
        }
    }
}

fn fast(mut star: Star<ReplayTransport>) -> Star<ReplayTransport> {
    star.retry_delay = Duration::from_millis(1);
    star.poll_interval = Duration::from_millis(1);
    star
}

fn eight_spots() -> Vec<TipSpot> {
    (0..8)
        .map(|i| {
            TipSpot::new(
                format!("A{}", i + 1),
                Coordinate::new(117.9, 600.0 - 9.0 * i as f64, 164.45),
                Some(Tip::standard_volume_filter()),
            )
        })
        .collect()
}

fn eight_wells(volume: f64) -> Vec<Container> {
    (0..8)
        .map(|i| {
            let well = Container::new(
                format!("W{}", i + 1),
                Coordinate::new(245.5, 595.5 - 9.0 * i as f64, 100.0),
                (9.0, 9.0, 10.0),
                400.0,
            );
            well.set_volume(volume);
            well
        })
        .collect()
}

#[test]
fn pick_up_happy_path() {
    let mut star = fast(Star::new(ReplayTransport::with_setup(&["C0TPid####"])).unwrap());

    let spot = TipSpot::new(
        "A1",
        Coordinate::new(117.9, 145.8, 164.45),
        Some(Tip::standard_volume_filter()),
    );
    star.pick_up_tips(&[&spot], &[0]).unwrap();

    assert!(star.channel(0).has_tip());
    assert_eq!(star.channel(0).origin(), Some("A1"));
    assert!(!spot.has_tip());

    let telegram = star.transport().requests().last().unwrap();
    assert_eq!(
        telegram,
        "C0TPid0005tm1000000000000000xp01179yp1458tt02tp01644tz01605th02450td0"
    );
}

#[test]
fn pick_up_engagement_follows_highest_spot() {
    let mut star = fast(Star::new(ReplayTransport::with_setup(&["C0TPid####"])).unwrap());

    // a warped rack: A2 sits 2 mm higher than A1
    let low = TipSpot::new(
        "A1",
        Coordinate::new(117.9, 600.0, 164.45),
        Some(Tip::standard_volume_filter()),
    );
    let high = TipSpot::new(
        "A2",
        Coordinate::new(117.9, 591.0, 166.45),
        Some(Tip::standard_volume_filter()),
    );
    star.pick_up_tips(&[&low, &high], &[0, 1]).unwrap();

    // the shared engagement heights hang off the highest collar top
    let telegram = star.transport().requests().last().unwrap();
    assert!(
        telegram.contains("tp01664tz01625"),
        "telegram was {}",
        telegram
    );
}

#[test]
fn aspirate_with_channelized_failure_commits_partial() {
    let mut star = fast(
        Star::new(ReplayTransport::with_setup(&[
            "C0TPid####",
            "C0ASid####er00/00 P101/71 P300/00",
        ]))
        .unwrap(),
    );

    let spots = eight_spots();
    let spot_refs: Vec<&TipSpot> = spots.iter().collect();
    let channels: Vec<usize> = (0..8).collect();
    star.pick_up_tips(&spot_refs, &channels).unwrap();

    let wells = eight_wells(200.0);
    let class = LiquidClass::new("water");
    let ops: Vec<AspirateOp> = wells
        .iter()
        .map(|well| AspirateOp::new(well, 100.0, &class))
        .collect();

    let err = star.aspirate(&ops, &channels).unwrap_err();
    match err {
        Error::Channelized(ch) => {
            assert_eq!(ch.failed_channels(), vec![0]);
            assert_eq!(ch.errors[&0].kind, FirmwareErrorKind::TooLittleLiquid);
        }
        other => panic!("expected channelized error, got {:?}", other),
    }

    // channel 0 and its well rolled back, the rest committed
    assert_eq!(star.channel(0).tip_volume(), 0.0);
    assert_eq!(wells[0].volume(), 200.0);
    for i in 1..8 {
        assert_eq!(star.channel(i).tip_volume(), 100.0);
        assert_eq!(wells[i].volume(), 100.0);
    }
}

#[test]
fn iswap_move_with_180_degree_rotation() {
    let mut star = fast(
        Star::new(ReplayTransport::with_setup(&["C0PPid####", "C0PRid####"])).unwrap(),
    );

    // rails 21 is 100 + 21 * 22.5 deck mm in x; slot geometry condensed
    let mut plate = Plate::new(
        "assay-7",
        Coordinate::new(572.5, 200.0, 100.0),
        (127.76, 85.48, 14.5),
    );
    assert_eq!(plate.rotation(), 0);

    star.iswap_move_plate(
        &mut plate,
        PickupParams {
            grip_direction: GripDirection::Front,
            ..PickupParams::default()
        },
        DropParams {
            destination: Coordinate::new(572.5, 400.0, 100.0),
            destination_rotation: 0,
            destination_top: 100.0,
            offset: Coordinate::default(),
            grip_direction: GripDirection::Back,
        },
        &[],
    )
    .unwrap();

    assert_eq!(plate.rotation(), 180);
    assert!(star.held_plate().is_none());
    let drop = star.transport().requests().last().unwrap();
    assert!(drop.contains("gr3"), "drop telegram was {}", drop);
}

#[test]
fn autoload_barcode_scan_maps_unreadable_windows() {
    let mut star = fast(
        Star::new(ReplayTransport::with_setup(&[
            "I0CLid####bcbb/ABC123/DEF456/00/XYZ789/00",
        ]))
        .unwrap(),
    );

    let codes = star
        .read_carrier_barcodes(7, 5, 38.0, ScanDirection::Horizontal, Symbology::CODE128)
        .unwrap();

    assert_eq!(codes.len(), 5);
    assert_eq!(codes[0].as_ref().map(|b| b.0.as_str()), Some("ABC123"));
    assert_eq!(codes[1].as_ref().map(|b| b.0.as_str()), Some("DEF456"));
    assert!(codes[2].is_none());
    assert_eq!(codes[3].as_ref().map(|b| b.0.as_str()), Some("XYZ789"));
    assert!(codes[4].is_none());
}

#[test]
fn retry_exhaustion_reinitializes_then_raises() {
    let mut star = fast(
        Star::new(ReplayTransport::with_setup(&[
            "C0TPid####",
            "C0ASid####er00/03", // attempt 1
            "C0ASid####er00/03", // attempt 2; ladder follows
            "C0INid####",        // re-initialize
            "C0QBid####qb0",     // busy clear
            "C0REid####ee03",    // error register still set
            "C0RFid####",        // reset it
            "C0ASid####er00/03", // final attempt
        ]))
        .unwrap(),
    );

    let spot = TipSpot::new(
        "A1",
        Coordinate::new(117.9, 600.0, 164.45),
        Some(Tip::standard_volume_filter()),
    );
    star.pick_up_tips(&[&spot], &[0]).unwrap();

    let well = Container::new(
        "W1",
        Coordinate::new(245.5, 595.5, 100.0),
        (9.0, 9.0, 10.0),
        400.0,
    );
    well.set_volume(200.0);
    let class = LiquidClass::new("water");
    let ops = [AspirateOp::new(&well, 50.0, &class)];

    let err = star.aspirate(&ops, &[0]).unwrap_err();
    match err {
        Error::Firmware(fw) => assert_eq!(fw.kind, FirmwareErrorKind::TelegramStructure),
        other => panic!("expected firmware error, got {:?}", other),
    }

    let requests = star.transport().requests();
    let aspirates = requests.iter().filter(|r| r.starts_with("C0AS")).count();
    assert_eq!(aspirates, 3);
    assert!(requests.iter().any(|r| r.starts_with("C0RF")));
    let init_after_failures = requests
        .iter()
        .skip_while(|r| !r.starts_with("C0AS"))
        .any(|r| r.starts_with("C0IN"));
    assert!(init_after_failures);

    // the failed transfer never reached the trackers
    assert_eq!(star.channel(0).tip_volume(), 0.0);
    assert_eq!(well.volume(), 200.0);
}

#[test]
fn no_response_is_never_success() {
    let err = Star::new(ReplayTransport::new(&[])).unwrap_err();
    assert!(matches!(err, Error::NoResponse));
}
