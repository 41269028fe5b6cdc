//! Bottles and bottle heads as stored on an OxiTop OC110 data logger.
//!
//! These can be constructed directly (the emulator does this for its canned
//! dataset) but more usually come from decoding a device response through a
//! [`ProtocolClient`](crate::client::ProtocolClient).

use std::fmt;
use std::str::FromStr;

use std::ops::RangeInclusive;

use chrono::{Datelike, Duration, Local, NaiveDate, NaiveDateTime, Timelike};

use crate::client::ProtocolClient;
use crate::error::{RecordError, Result};
use crate::transport::Transport;

/// Years a two digit wire timestamp can express.
const WIRE_YEARS: RangeInclusive<i32> = 1969..=2068;

/// Whether `value` is unchanged by writing it with `decimals` places and
/// reading it back.
fn survives_rounding(value: f64, decimals: usize) -> bool {
    format!("{:.*}", decimals, value).parse::<f64>() == Ok(value)
}

/// A bottle serial number: the date the bottle was created plus a two digit
/// sequence number, written `YYMMDD-NN`.
///
/// Parsing also accepts the concatenated `YYMMDDNN` form used in command
/// arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BottleSerial {
    date: NaiveDate,
    number: u8,
}

impl BottleSerial {
    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn number(&self) -> u8 {
        self.number
    }

    /// The hyphen-less form sent as a command argument.
    pub fn concatenated(&self) -> String {
        format!("{}{:02}", self.date.format("%y%m%d"), self.number)
    }
}

impl FromStr for BottleSerial {
    type Err = RecordError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = || RecordError::InvalidSerial(s.to_string());
        let (date, number) = match s.split_once('-') {
            Some(parts) => parts,
            None if s.len() == 8 && s.is_char_boundary(6) => s.split_at(6),
            None => return Err(invalid()),
        };
        if date.len() != 6 || number.len() != 2 || !number.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let date = NaiveDate::parse_from_str(date, "%y%m%d").map_err(|_| invalid())?;
        let number: u8 = number.parse().map_err(|_| invalid())?;
        if !(1..=99).contains(&number) {
            return Err(invalid());
        }
        Ok(BottleSerial { date, number })
    }
}

impl fmt::Display for BottleSerial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02}", self.date.format("%y%m%d"), self.number)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BottleMode {
    Pressure,
    Bod,
}

impl BottleMode {
    /// The numeric code used in the bottle header.
    pub fn code(self) -> u8 {
        match self {
            // XXX BOD special, routine and standard may use different codes
            BottleMode::Bod => 0,
            BottleMode::Pressure => 3,
        }
    }

    pub fn from_code(code: &str) -> std::result::Result<Self, RecordError> {
        match code {
            "0" => Ok(BottleMode::Bod),
            "3" => Ok(BottleMode::Pressure),
            _ => Err(RecordError::UnknownMode(code.to_string())),
        }
    }
}

impl fmt::Display for BottleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BottleMode::Pressure => f.write_str("Pressure"),
            BottleMode::Bod => f.write_str("BOD"),
        }
    }
}

/// One measurement run.
#[derive(Debug, Clone, PartialEq)]
pub struct Bottle {
    pub serial: BottleSerial,
    /// User-assigned ID number (1-999), not unique.
    pub id: u16,
    pub start: NaiveDateTime,
    pub finish: NaiveDateTime,
    /// Time between consecutive readings.
    pub interval: Duration,
    pub expected_measurements: u32,
    pub mode: BottleMode,
    /// Nominal bottle volume in ml.
    pub bottle_volume: f64,
    /// Sample volume in ml.
    pub sample_volume: f64,
    /// The sample dilution, meaning "1+dilution".
    pub dilution: u32,
    pub heads: Vec<BottleHead>,
}

impl Bottle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        serial: BottleSerial,
        id: u32,
        start: NaiveDateTime,
        finish: NaiveDateTime,
        interval: Duration,
        expected_measurements: u32,
        mode: BottleMode,
        bottle_volume: f64,
        sample_volume: f64,
        dilution: u32,
    ) -> std::result::Result<Self, RecordError> {
        if !(1..=999).contains(&id) {
            return Err(RecordError::InvalidId(id));
        }
        // 308 is what the device sends for 112 minutes, so a genuine 308
        // minute interval would come back as 112.
        if interval.num_minutes() == 308 {
            return Err(RecordError::InvalidInterval(308));
        }
        if interval != Duration::minutes(interval.num_minutes()) {
            return Err(RecordError::IntervalPrecision(interval));
        }
        for timestamp in [start, finish] {
            if timestamp.nanosecond() != 0 || !WIRE_YEARS.contains(&timestamp.year()) {
                return Err(RecordError::InvalidTimestamp(timestamp));
            }
        }
        // The device stores the bottle volume in whole ml and the sample
        // volume to a tenth of a ml.
        if !(bottle_volume > 0.0 && sample_volume > 0.0)
            || !survives_rounding(bottle_volume, 0)
            || !survives_rounding(sample_volume, 1)
        {
            return Err(RecordError::InvalidVolume);
        }
        Ok(Bottle {
            serial,
            id: id as u16,
            start,
            finish,
            interval,
            expected_measurements,
            mode,
            bottle_volume,
            sample_volume,
            dilution,
            heads: Vec::new(),
        })
    }

    /// Attach a head, pointing its back-reference at this bottle. Pressure
    /// heads must carry a pressure limit and BOD heads must not.
    pub fn add_head(&mut self, mut head: BottleHead) -> std::result::Result<(), RecordError> {
        match (self.mode, head.pressure_limit) {
            (BottleMode::Pressure, Some(_)) | (BottleMode::Bod, None) => {}
            (mode, _) => {
                return Err(RecordError::HeadMode {
                    head: head.serial,
                    mode,
                })
            }
        }
        head.bottle_serial = self.serial.clone();
        self.heads.push(head);
        Ok(())
    }

    pub fn head(&self, serial: &str) -> Option<&BottleHead> {
        self.heads.iter().find(|head| head.serial == serial)
    }

    pub fn completed(&self) -> bool {
        self.finish < Local::now().naive_local()
    }

    /// The largest number of readings held by any head, if every head's
    /// readings have been loaded.
    pub fn actual_measurements(&self) -> Option<usize> {
        self.heads
            .iter()
            .map(|head| head.cached_readings().map(<[i64]>::len))
            .try_fold(0, |max, len| len.map(|len| max.max(len)))
    }

    /// Mode and run length as the device's display shows them, e.g.
    /// `Pressure 28d` or `BOD 5h`.
    pub fn mode_string(&self) -> String {
        let duration = self.finish - self.start;
        if duration.num_days() > 0 {
            format!("{} {}d", self.mode, duration.num_days())
        } else {
            format!("{} {}h", self.mode, duration.num_hours())
        }
    }

    /// Re-read this bottle's header from the device. The heads are replaced,
    /// so any loaded readings are dropped.
    pub fn refresh<T: Transport>(&mut self, client: &mut ProtocolClient<T>) -> Result<()> {
        let mut fresh = client.fetch_bottle(&self.serial)?;
        let heads = std::mem::take(&mut fresh.heads);
        *self = fresh;
        for head in heads {
            self.add_head(head)?;
        }
        Ok(())
    }
}

/// Cached readings of a head.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Readings {
    #[default]
    NotLoaded,
    Loaded(Vec<i64>),
}

/// One sensor channel on a bottle.
#[derive(Debug, Clone, PartialEq)]
pub struct BottleHead {
    /// Serial number of the owning bottle.
    bottle_serial: BottleSerial,
    pub serial: String,
    /// Pressure at which automatic collection stops; pressure mode only.
    pub pressure_limit: Option<u32>,
    readings: Readings,
}

impl BottleHead {
    pub fn new(
        bottle_serial: BottleSerial,
        serial: &str,
        pressure_limit: Option<u32>,
    ) -> std::result::Result<Self, RecordError> {
        if serial.is_empty() || !serial.bytes().all(|b| b.is_ascii_digit()) || serial.len() > 9 {
            return Err(RecordError::InvalidHeadSerial(serial.to_string()));
        }
        Ok(BottleHead {
            bottle_serial,
            serial: serial.to_string(),
            pressure_limit,
            readings: Readings::NotLoaded,
        })
    }

    pub fn with_readings(mut self, readings: Vec<i64>) -> Self {
        self.readings = Readings::Loaded(readings);
        self
    }

    pub fn bottle_serial(&self) -> &BottleSerial {
        &self.bottle_serial
    }

    pub fn cached_readings(&self) -> Option<&[i64]> {
        match &self.readings {
            Readings::Loaded(readings) => Some(readings),
            Readings::NotLoaded => None,
        }
    }

    /// The head's readings, fetched from the device on first access.
    pub fn readings<T: Transport>(&mut self, client: &mut ProtocolClient<T>) -> Result<&[i64]> {
        if let Readings::NotLoaded = self.readings {
            let readings = client.fetch_readings(&self.bottle_serial, &self.serial)?;
            self.readings = Readings::Loaded(readings);
        }
        Ok(self.cached_readings().unwrap_or_default())
    }

    /// Forget the cached readings so the next access re-reads them.
    pub fn refresh(&mut self) {
        self.readings = Readings::NotLoaded;
    }
}
