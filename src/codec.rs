//! The OC110's comma-separated wire format for bottles, heads and readings.
//!
//! Lines inside a response are terminated by a bare CR. A bottle is a 20
//! field header line followed by one line per head; a readings block is a
//! metadata line followed by the values, ten to a line. Several header fields
//! have no known meaning; they are written with the values the device uses
//! and skipped (but still counted) when decoding.

use chrono::{Duration, NaiveDateTime};

use crate::bottles::{Bottle, BottleHead, BottleMode, BottleSerial};
use crate::error::RecordError;

/// Format of every timestamp on the wire.
pub const TIMESTAMP_FORMAT: &str = "%y%m%d%H%M%S";

const HEADER_FIELDS: usize = 20;
const READINGS_HEADER_FIELDS: usize = 7;
const READINGS_PER_LINE: usize = 10;

/// The device reports 112 minute intervals as 308. Nobody knows why.
const QUIRK_INTERVAL_MINUTES: i64 = 112;
const QUIRK_INTERVAL_WIRE: i64 = 308;

type Result<T> = std::result::Result<T, RecordError>;

/// Sum of the byte values of `body`.
pub fn checksum(body: &[u8]) -> u64 {
    body.iter().map(|&b| u64::from(b)).sum()
}

pub fn verify_checksum(expected: u64, body: &[u8]) -> bool {
    checksum(body) == expected
}

/// The trailing line that carries the checksum of `body`.
pub fn checksum_line(body: &[u8]) -> String {
    format!(",{}\r", checksum(body))
}

fn lines(data: &str) -> Vec<&str> {
    let mut lines: Vec<&str> = data.split('\r').collect();
    while lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }
    lines
}

fn parse<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T> {
    value.parse().map_err(|_| RecordError::parse(field, value))
}

pub(crate) fn parse_timestamp(field: &'static str, value: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
        .map_err(|_| RecordError::parse(field, value))
}

fn interval_to_wire(interval: Duration) -> i64 {
    match interval.num_minutes() {
        QUIRK_INTERVAL_MINUTES => QUIRK_INTERVAL_WIRE,
        minutes => minutes,
    }
}

fn interval_from_wire(value: i64) -> Duration {
    match value {
        QUIRK_INTERVAL_WIRE => Duration::minutes(QUIRK_INTERVAL_MINUTES),
        minutes => Duration::minutes(minutes),
    }
}

// XXX probably the auto-temperature adaptation phase: off for runs under a
// day, capped for runs of five days or more
fn auto_temperature_phase(days: i64) -> i64 {
    match days {
        0 => 0,
        d if d >= 5 => 10,
        d => 2 * d,
    }
}

/// Encode a bottle header and its head lines.
pub fn encode_bottle(bottle: &Bottle) -> String {
    let days = (bottle.finish - bottle.start).num_days();
    let header = [
        "0".to_string(),
        "0".to_string(),
        bottle.mode.code().to_string(),
        bottle.id.to_string(),
        bottle.serial.to_string(),
        bottle.start.format(TIMESTAMP_FORMAT).to_string(),
        bottle.finish.format(TIMESTAMP_FORMAT).to_string(),
        // XXX 1 for running samples, 2 for finished; 0 may mean not started
        (if bottle.completed() { "2" } else { "1" }).to_string(),
        "5".to_string(),
        "240".to_string(),
        "40".to_string(),
        bottle.expected_measurements.to_string(),
        (days * 24 * 60).to_string(),
        format!("{:.0}", bottle.bottle_volume),
        format!("{:.1}", bottle.sample_volume),
        bottle.dilution.to_string(),
        auto_temperature_phase(days).to_string(),
        "2".to_string(),
        bottle.heads.len().to_string(),
        interval_to_wire(bottle.interval).to_string(),
    ];
    let mut data = header.join(",");
    data.push('\r');
    for head in &bottle.heads {
        match head.pressure_limit {
            Some(limit) if bottle.mode == BottleMode::Pressure => {
                data.push_str(&format!(",{},{},\r", head.serial, limit));
            }
            _ => data.push_str(&format!(",{},\r", head.serial)),
        }
    }
    data
}

fn decode_head(bottle: &Bottle, line: &str) -> Result<BottleHead> {
    let fields: Vec<&str> = line.split(',').collect();
    let inner = match fields.as_slice() {
        ["", inner @ .., ""] => inner,
        _ => return Err(RecordError::HeadLine(line.to_string())),
    };
    match (bottle.mode, inner) {
        (BottleMode::Pressure, [serial, limit]) => Ok(BottleHead::new(
            bottle.serial.clone(),
            serial,
            Some(parse("pressure limit", limit)?),
        )?),
        (BottleMode::Bod, [serial]) => Ok(BottleHead::new(bottle.serial.clone(), serial, None)?),
        (BottleMode::Pressure, _) => Err(RecordError::FieldCount {
            expected: 4,
            found: fields.len(),
        }),
        (BottleMode::Bod, _) => Err(RecordError::FieldCount {
            expected: 3,
            found: fields.len(),
        }),
    }
}

/// Decode a single bottle record: a header line plus its head lines.
pub fn decode_bottle(data: &str) -> Result<Bottle> {
    let lines = lines(data);
    let (header, heads) = lines.split_first().ok_or(RecordError::Empty)?;
    let fields: Vec<&str> = header.split(',').collect();
    if fields.len() != HEADER_FIELDS {
        return Err(RecordError::FieldCount {
            expected: HEADER_FIELDS,
            found: fields.len(),
        });
    }
    let mode = BottleMode::from_code(fields[2])?;
    let head_count: usize = parse("head count", fields[18])?;
    let mut bottle = Bottle::new(
        parse::<BottleSerial>("serial", fields[4])?,
        parse("id", fields[3])?,
        parse_timestamp("start", fields[5])?,
        parse_timestamp("finish", fields[6])?,
        interval_from_wire(parse("interval", fields[19])?),
        parse("measurements", fields[11])?,
        mode,
        parse("bottle volume", fields[13])?,
        parse("sample volume", fields[14])?,
        parse("dilution", fields[15])?,
    )?;
    if head_count != heads.len() {
        return Err(RecordError::HeadCount {
            declared: head_count,
            found: heads.len(),
        });
    }
    for line in heads {
        let head = decode_head(&bottle, line)?;
        bottle.add_head(head)?;
    }
    Ok(bottle)
}

/// Decode a concatenation of bottle records, as returned for `GAPB`. Head
/// lines start with a comma; any other line starts a new bottle.
pub fn decode_bottles(data: &str) -> Result<Vec<Bottle>> {
    let mut bottles = Vec::new();
    let mut record = String::new();
    for line in lines(data) {
        if !line.starts_with(',') && !record.is_empty() {
            bottles.push(decode_bottle(&record)?);
            record.clear();
        }
        record.push_str(line);
        record.push('\r');
    }
    if !record.is_empty() {
        bottles.push(decode_bottle(&record)?);
    }
    Ok(bottles)
}

/// Encode the readings block for `head` of `bottle`.
pub fn encode_readings(bottle: &Bottle, head: &BottleHead, readings: &[i64]) -> String {
    let head_serial = head.serial.parse::<u64>().unwrap_or_default();
    let mut data = [
        format!("{:09}", head_serial),
        bottle.serial.to_string(),
        "1".to_string(),
        "1".to_string(),
        // XXX can also be zero; meaning unknown
        "247".to_string(),
        bottle.start.format(TIMESTAMP_FORMAT).to_string(),
        readings.len().to_string(),
    ]
    .join(",");
    data.push('\r');
    for chunk in readings.chunks(READINGS_PER_LINE) {
        for reading in chunk {
            data.push_str(&format!(",{}", reading));
        }
        data.push('\r');
    }
    data
}

/// Decode a readings block, checking it belongs to the requested head.
pub fn decode_readings(
    data: &str,
    bottle_serial: &BottleSerial,
    head_serial: &str,
) -> Result<Vec<i64>> {
    let lines = lines(data);
    let (header, values) = lines.split_first().ok_or(RecordError::Empty)?;
    let fields: Vec<&str> = header.split(',').collect();
    if fields.len() != READINGS_HEADER_FIELDS {
        return Err(RecordError::FieldCount {
            expected: READINGS_HEADER_FIELDS,
            found: fields.len(),
        });
    }
    let sent_head: u64 = parse("head serial", fields[0])?;
    let wanted_head: u64 = parse("head serial", head_serial)?;
    if sent_head != wanted_head {
        return Err(RecordError::SerialMismatch {
            expected: head_serial.to_string(),
            found: sent_head.to_string(),
        });
    }
    let sent_bottle: BottleSerial = parse("bottle serial", fields[1])?;
    if &sent_bottle != bottle_serial {
        return Err(RecordError::SerialMismatch {
            expected: bottle_serial.to_string(),
            found: sent_bottle.to_string(),
        });
    }
    parse_timestamp("start", fields[5])?;
    let declared: usize = parse("readings count", fields[6])?;
    let readings = values
        .iter()
        .flat_map(|line| line.split(','))
        .filter(|value| !value.is_empty())
        .map(|value| parse("reading", value))
        .collect::<Result<Vec<i64>>>()?;
    if readings.len() != declared {
        return Err(RecordError::ReadingCount {
            declared,
            found: readings.len(),
        });
    }
    Ok(readings)
}
