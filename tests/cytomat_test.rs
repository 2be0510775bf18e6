//! End-to-end Cytomat scenarios over a transport that replays fixed
//! bytes, including the persisted inventory file.

use mlstar::cytomat::inventory::{CytomatPlate, Inventory, StorageLocation};
use mlstar::cytomat::{Cytomat, Model, OverviewRegister};
use mlstar::error::{CytomatError, Error};
use mlstar::transport::Transport;
use std::collections::VecDeque;
use std::time::Duration;

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
}

impl Transport for ReplayTransport {
    fn send(&mut self, request: &[u8], _timeout: Duration) -> Result<Vec<u8>, Error> {
        self.requests
            .push(String::from_utf8_lossy(request).to_string());
        self.replies
            .pop_front()
            .map(|r| r.into_bytes())
            .ok_or(Error::NoResponse)
    }
}

fn device(
    model: Model,
    replies: &[&str],
) -> (tempfile::TempDir, Cytomat<ReplayTransport>) {
    let dir = tempfile::tempdir().unwrap();
    let mut device = Cytomat::new(ReplayTransport::new(replies), model, dir.path()).unwrap();
    device.retry_delay = Duration::from_millis(1);
    device.poll_interval = Duration::from_millis(1);
    (dir, device)
}

#[test]
fn transfer_to_storage_persists_inventory() {
    let (dir, mut device) = device(
        Model::C6002,
        &[
            "bs 40", // idle before issuing
            "ok 60", // ts accepted, overview 0x60
            "bs C0", // busy poll 1
            "bs C0", // busy poll 2
            "bs C0", // busy poll 3
            "bs 40", // busy bit cleared
        ],
    );

    let register = device
        .insert_plate(
            CytomatPlate::new("ab-0042", false, 14.5),
            StorageLocation { rack: 2, slot: 18 },
        )
        .unwrap();
    assert!(register.contains(OverviewRegister::READY));

    // rack 1 of the C6002 holds 24 slots, so rack 2 slot 18 is 042
    assert_eq!(device.transport().requests[1], "mv:ts 042\r\n");

    // the plate survived a reload of the YAML file
    let path = dir.path().join("cytomat_C6002.yaml");
    assert!(path.exists());
    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("ab-0042"), "file was:\n{}", text);

    let reloaded = Inventory::load_or_create(&path, &Model::C6002.default_racks()).unwrap();
    assert_eq!(
        reloaded.find_plate("ab-0042"),
        Some(StorageLocation { rack: 2, slot: 18 })
    );
}

#[test]
fn retry_exhaustion_raises_telegram_structure_error() {
    let (_dir, mut device) = device(
        Model::C6000,
        &[
            "bs 40", // idle before issuing
            "er 03", // attempt 1
            "er 03", // attempt 2; ladder follows
            "ok 00", // ll:in
            "bs 40", // busy poll: idle
            "bs 40", // overview check: error register clear
            "er 03", // final attempt
            "be 03", // error register read after exhaustion
        ],
    );

    let err = device
        .storage_to_transfer(StorageLocation { rack: 1, slot: 2 })
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Cytomat(CytomatError::TelegramStructure)
    ));

    let requests = &device.transport().requests;
    assert!(requests.iter().any(|r| r.starts_with("ll:in")));
}

#[test]
fn occupied_slot_rejects_second_plate_before_wire() {
    let (_dir, mut device) = device(
        Model::C6000,
        &["bs 40", "ok 60", "bs 40"], // only the first insert talks
    );
    let location = StorageLocation { rack: 1, slot: 3 };
    device
        .insert_plate(CytomatPlate::new("first", false, 14.5), location)
        .unwrap();
    let sent = device.transport().requests.len();
    let err = device
        .insert_plate(CytomatPlate::new("second", false, 14.5), location)
        .unwrap_err();
    assert!(matches!(err, Error::Inventory(_)));
    assert_eq!(device.transport().requests.len(), sent);
}

#[test]
fn pitch_check_rejects_at_inventory_layer() {
    let (_dir, mut device) = device(Model::C6000, &[]);
    // 23 mm pitch cannot take a 21 mm plate wearing a 3 mm lid
    let err = device
        .insert_plate(
            CytomatPlate::new("lidded", true, 21.0),
            StorageLocation { rack: 1, slot: 1 },
        )
        .unwrap_err();
    assert!(matches!(err, Error::Inventory(_)));
    assert!(device.transport().requests.is_empty());
}

#[test]
fn incubation_queries_parse_nominal_and_actual() {
    let (_dir, mut device) = device(Model::C6000, &["ic +05.0 +04.8"]);
    let reading = device
        .get_incubation(mlstar::cytomat::IncubationQuery::Co2)
        .unwrap();
    assert_eq!(reading.nominal, 5.0);
    assert_eq!(reading.actual, 4.8);
}
