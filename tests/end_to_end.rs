use std::time::Duration;

use chrono::{Duration as Interval, NaiveDate, NaiveDateTime};
use oxitop::{
    codec, null_modem, Bottle, BottleHead, BottleMode, Error, NullModemPort, ProtocolClient,
    ProtocolServer, ServerHandle, Transport,
};
use serial_test::serial;

const READINGS: [i64; 5] = [976, 964, 963, 963, 962];

fn timestamp(y: i32, m: u32, d: u32, hh: u32, mm: u32, ss: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, m, d)
        .unwrap()
        .and_hms_opt(hh, mm, ss)
        .unwrap()
}

fn pressure_bottle(interval_minutes: i64) -> Bottle {
    let mut bottle = Bottle::new(
        "120323-01".parse().unwrap(),
        1,
        timestamp(2012, 3, 23, 17, 32, 23),
        timestamp(2012, 4, 20, 17, 32, 23),
        Interval::minutes(interval_minutes),
        360,
        BottleMode::Pressure,
        510.0,
        432.0,
        0,
    )
    .unwrap();
    let head = BottleHead::new(bottle.serial.clone(), "60145", Some(150))
        .unwrap()
        .with_readings(READINGS.to_vec());
    bottle.add_head(head).unwrap();
    bottle
}

fn bod_bottle() -> Bottle {
    let mut bottle = Bottle::new(
        "121119-03".parse().unwrap(),
        3,
        timestamp(2012, 11, 19, 13, 53, 4),
        timestamp(2012, 11, 24, 13, 53, 4),
        Interval::minutes(12),
        360,
        BottleMode::Bod,
        510.0,
        164.0,
        1,
    )
    .unwrap();
    for serial in ["60108", "60109"] {
        let head = BottleHead::new(bottle.serial.clone(), serial, None)
            .unwrap()
            .with_readings(vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]);
        bottle.add_head(head).unwrap();
    }
    bottle
}

struct Bench {
    client: ProtocolClient<NullModemPort>,
    server: ServerHandle<NullModemPort>,
    dce: NullModemPort,
}

impl Bench {
    fn start(bottles: Vec<Bottle>) -> Self {
        let (dte, dce) = null_modem(9600, Some(Duration::from_secs(5)));
        let server = ProtocolServer::spawn(dce.clone(), bottles).unwrap();
        let client = ProtocolClient::new(dte).unwrap();
        Bench { client, server, dce }
    }

    fn stop(mut self) {
        self.server.terminate();
        self.dce.close().unwrap();
        self.server.join().unwrap();
    }
}

fn without_readings(bottle: &Bottle) -> Bottle {
    let mut bottle = bottle.clone();
    for head in &mut bottle.heads {
        head.refresh();
    }
    bottle
}

#[test]
#[serial]
fn lists_bottles_and_reads_a_head() {
    let seeded = pressure_bottle(56);
    let mut bench = Bench::start(vec![seeded.clone()]);
    assert_eq!(bench.client.id(), "OC110");

    let bottles = bench.client.bottles().unwrap();
    assert_eq!(bottles, vec![without_readings(&seeded)]);

    let mut bottle = bottles[0].clone();
    assert_eq!(bottle.serial.to_string(), "120323-01");
    assert_eq!(bottle.mode_string(), "Pressure 28d");
    let head = &mut bottle.heads[0];
    assert_eq!(head.serial, "60145");
    assert_eq!(head.pressure_limit, Some(150));
    assert_eq!(head.readings(&mut bench.client).unwrap(), &READINGS);
    assert_eq!(head.cached_readings(), Some(&READINGS[..]));

    bench.stop();
}

#[test]
#[serial]
fn missing_bottle_is_an_unexpected_reply() {
    let mut bench = Bench::start(vec![pressure_bottle(56)]);
    match bench.client.bottle("no-such-serial") {
        Err(Error::UnexpectedReply(reply)) => assert!(reply.contains("INVALID BOTTLE"), "{reply}"),
        other => panic!("expected UnexpectedReply, got {:?}", other.map(|b| b.serial)),
    }
    // The session survives the miss.
    assert_eq!(bench.client.bottle("12032301").unwrap().id, 1);
    bench.stop();
}

#[test]
#[serial]
fn missing_head_is_an_unexpected_reply() {
    let mut bench = Bench::start(vec![pressure_bottle(56)]);
    let serial = "120323-01".parse().unwrap();
    match bench.client.fetch_readings(&serial, "99999") {
        Err(Error::UnexpectedReply(reply)) => assert!(reply.contains("INVALID HEAD"), "{reply}"),
        other => panic!("expected UnexpectedReply, got {:?}", other),
    }
    assert_eq!(bench.client.fetch_readings(&serial, "60145").unwrap(), READINGS);
    bench.stop();
}

#[test]
#[serial]
fn close_then_reconnect() {
    let mut bench = Bench::start(vec![pressure_bottle(56)]);
    let before = bench.client.bottles().unwrap();
    bench.client.close().unwrap();
    assert!(!bench.client.prompt_seen());
    assert!(!bench.client.transport().is_open());

    bench.client.refresh();
    let after = bench.client.bottles().unwrap();
    assert!(bench.client.prompt_seen());
    assert_eq!(after, before);
    bench.stop();
}

#[test]
#[serial]
fn interval_quirk_survives_the_link() {
    let seeded = pressure_bottle(112);
    let wire = codec::encode_bottle(&seeded);
    assert!(wire.split('\r').next().unwrap().ends_with(",308"));
    let mut bench = Bench::start(vec![seeded]);
    let bottle = bench.client.bottle("120323-01").unwrap();
    assert_eq!(bottle.interval, Interval::minutes(112));
    bench.stop();
}

#[test]
#[serial]
fn bod_bottle_and_refresh() {
    let seeded = bod_bottle();
    let mut bench = Bench::start(vec![pressure_bottle(56), seeded.clone()]);

    let mut bottle = bench.client.bottles().unwrap().remove(1);
    assert_eq!(bottle, without_readings(&seeded));
    assert_eq!(bottle.heads.len(), 2);
    assert!(bottle.heads.iter().all(|head| head.pressure_limit.is_none()));
    let readings = bottle.heads[1].readings(&mut bench.client).unwrap().to_vec();
    assert_eq!(readings.len(), 11);

    bottle.refresh(&mut bench.client).unwrap();
    assert_eq!(bottle, without_readings(&seeded));
    assert!(bottle.heads.iter().all(|head| head.bottle_serial() == &bottle.serial));
    bench.stop();
}
