//! An emulated OC110 data logger.
//!
//! `Oc110` holds the device's bottles and turns one command line into a
//! reply; it has no I/O, which keeps it easy to test. `ProtocolServer` runs
//! it on a background thread against a `Transport`, framing the replies the
//! way the real unit does: optional checksum line, then the `>` prompt.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Duration as Interval;
use log::{debug, info, warn};

use crate::bottles::{Bottle, BottleHead, BottleMode, BottleSerial};
use crate::codec;
use crate::error::RecordError;
use crate::transport::Transport;

/// What the unit prints when it powers up, whether or not anyone listens.
pub const BANNER: &[u8] = b"\r\nBIOS OC Version 1.0\r\n";

/// How long the unit takes to restart after `CLOC`.
pub const REBOOT_DELAY: Duration = Duration::from_millis(500);

const PROMPT: &str = ">\r";
const CTS_POLL_INTERVAL: Duration = Duration::from_millis(10);
const IDLE_DELAY: Duration = Duration::from_millis(100);
const MAX_REOPEN_DELAY: Duration = Duration::from_secs(5);

/// How long to wait before reopening after `failures` consecutive failed
/// attempts: doubling from `IDLE_DELAY`, capped at `MAX_REOPEN_DELAY`.
fn reopen_delay(failures: u32) -> Duration {
    let doublings = failures.saturating_sub(1).min(6);
    IDLE_DELAY.saturating_mul(1 << doublings).min(MAX_REOPEN_DELAY)
}

/// Errors in an incoming command. These become wire replies.
#[derive(Debug, PartialEq)]
pub enum CommandError {
    /// Wrong number of arguments for the command.
    InvalidArgs,
    InvalidBottle,
    InvalidHead,
    Unknown,
}

impl CommandError {
    fn reply(&self) -> &'static str {
        match self {
            CommandError::InvalidArgs => "INVALID ARGS\r",
            CommandError::InvalidBottle => "INVALID BOTTLE\r",
            CommandError::InvalidHead => "INVALID HEAD\r",
            CommandError::Unknown => "INVALID COMMAND\r",
        }
    }
}

#[derive(Debug, PartialEq)]
enum Command {
    Maid,
    Cloc,
    Gapb,
    Gprb(String),
    Gsns(String),
    Gmsk(String, String),
}

/// The reply to a single command, excluding the trailing prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Text(String),
    /// Data that is followed by its checksum line.
    Data(String),
    /// Reply with a bare CR, then drop the connection and reboot.
    Close,
}

/// The device's command interpreter and its stored bottles.
#[derive(Debug, Clone)]
pub struct Oc110 {
    bottles: Vec<Bottle>,
    sent_prompt: bool,
}

impl Oc110 {
    pub fn new(bottles: Vec<Bottle>) -> Self {
        Oc110 {
            bottles,
            sent_prompt: false,
        }
    }

    pub fn bottles(&self) -> &[Bottle] {
        &self.bottles
    }

    /// Forget that a LOGON was sent, as after a reboot.
    pub fn reset(&mut self) {
        self.sent_prompt = false;
    }

    fn parse_command(&self, line: &str) -> Result<Command, CommandError> {
        let mut parts = line.split(',');
        let name = parts.next().unwrap_or_default();
        let args: Vec<&str> = parts.collect();
        match (name, args.as_slice()) {
            ("MAID", _) => Ok(Command::Maid),
            ("CLOC", _) => Ok(Command::Cloc),
            ("GAPB", _) => Ok(Command::Gapb),
            ("GPRB", [serial]) => Ok(Command::Gprb(serial.to_string())),
            ("GSNS", [serial]) => Ok(Command::Gsns(serial.to_string())),
            ("GMSK", [serial, head]) => Ok(Command::Gmsk(serial.to_string(), head.to_string())),
            ("GPRB" | "GSNS" | "GMSK", _) => Err(CommandError::InvalidArgs),
            _ => Err(CommandError::Unknown),
        }
    }

    /// Look up a bottle by either serial form.
    fn bottle_by_serial(&self, serial: &str) -> Result<&Bottle, CommandError> {
        let serial: BottleSerial = serial.parse().map_err(|_| CommandError::InvalidBottle)?;
        self.bottles
            .iter()
            .find(|bottle| bottle.serial == serial)
            .ok_or(CommandError::InvalidBottle)
    }

    fn execute(&mut self, command: Command) -> Result<Response, CommandError> {
        match command {
            Command::Maid => Ok(Response::Text("OC110\r".to_string())),
            Command::Cloc => {
                self.reset();
                Ok(Response::Close)
            }
            Command::Gapb => Ok(Response::Data(
                self.bottles.iter().map(codec::encode_bottle).collect(),
            )),
            Command::Gprb(serial) => {
                let bottle = self.bottle_by_serial(&serial)?;
                Ok(Response::Data(codec::encode_bottle(bottle)))
            }
            // Only validates the bottle; what the real unit sends is unknown
            Command::Gsns(serial) => {
                self.bottle_by_serial(&serial)?;
                Ok(Response::Text(String::new()))
            }
            Command::Gmsk(serial, head) => {
                let bottle = self.bottle_by_serial(&serial)?;
                let head = bottle.head(&head).ok_or(CommandError::InvalidHead)?;
                let readings = head.cached_readings().unwrap_or_default();
                Ok(Response::Data(codec::encode_readings(bottle, head, readings)))
            }
        }
    }

    /// Interpret one command line (without its CR).
    pub fn process_command(&mut self, line: &str) -> Response {
        match self.parse_command(line).and_then(|command| self.execute(command)) {
            Ok(response) => response,
            // The unit greets the first unrecognised line after a reboot
            Err(CommandError::Unknown) if !self.sent_prompt => {
                self.sent_prompt = true;
                Response::Text("LOGON\r".to_string())
            }
            Err(err) => Response::Text(err.reply().to_string()),
        }
    }
}

/// Serves an `Oc110` over a transport on a background thread.
pub struct ProtocolServer<T: Transport> {
    transport: T,
    device: Oc110,
    terminated: Arc<AtomicBool>,
    timeout: Duration,
    open_failures: u32,
}

/// Controls a running `ProtocolServer`.
///
/// Termination is cooperative: `terminate` sets a flag the server checks
/// between reads. A read blocked on the transport only notices once it
/// returns, so callers should also close the transport (a cloned null-modem
/// port, say) to unblock it, and then `join`.
pub struct ServerHandle<T> {
    terminated: Arc<AtomicBool>,
    thread: JoinHandle<T>,
}

impl<T> ServerHandle<T> {
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the server to stop and get its transport back.
    pub fn join(self) -> thread::Result<T> {
        self.thread.join()
    }
}

impl<T: Transport + 'static> ProtocolServer<T> {
    /// Start serving `bottles` on `transport`.
    pub fn spawn(transport: T, bottles: Vec<Bottle>) -> std::io::Result<ServerHandle<T>> {
        let terminated = Arc::new(AtomicBool::new(false));
        let server = ProtocolServer {
            timeout: transport.timeout().unwrap_or(Duration::from_secs(1)),
            transport,
            device: Oc110::new(bottles),
            terminated: Arc::clone(&terminated),
            open_failures: 0,
        };
        let thread = thread::Builder::new()
            .name("oc110-emulator".to_string())
            .spawn(move || server.run())?;
        Ok(ServerHandle { terminated, thread })
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    fn run(mut self) -> T {
        info!("Emulator started with {} bottle(s)", self.device.bottles().len());
        self.boot();
        let mut buffer: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 256];
        while !self.is_terminated() {
            if !self.transport.is_open() {
                buffer.clear();
                self.boot();
                continue;
            }
            match self.transport.read(&mut chunk) {
                Ok(0) => {}
                Ok(count) => {
                    buffer.extend(chunk[..count].iter().filter(|&&byte| byte != b'\n'));
                    while let Some(end) = buffer.iter().position(|&byte| byte == b'\r') {
                        let line: Vec<u8> = buffer.drain(..=end).collect();
                        let line = String::from_utf8_lossy(&line[..end]).into_owned();
                        self.dispatch(&line);
                        if !self.transport.is_open() {
                            // Anything after CLOC was lost with the connection
                            buffer.clear();
                            break;
                        }
                    }
                }
                Err(err) => {
                    if self.is_terminated() {
                        break;
                    }
                    debug!("DCE: read failed: {}", err);
                    thread::sleep(IDLE_DELAY);
                }
            }
        }
        if let Err(err) = self.transport.set_rts(false).and_then(|_| self.transport.close()) {
            debug!("DCE: error closing transport: {}", err);
        }
        info!("Emulator stopped");
        self.transport
    }

    /// (Re)open the transport and print the banner.
    fn boot(&mut self) {
        if self.is_terminated() {
            return;
        }
        if !self.transport.is_open() {
            if let Err(err) = self.transport.open() {
                self.open_failures += 1;
                if self.open_failures == 1 {
                    warn!("DCE: unable to open transport: {}", err);
                } else {
                    debug!("DCE: open attempt {} failed: {}", self.open_failures, err);
                }
                self.pause(reopen_delay(self.open_failures));
                return;
            }
            if self.open_failures > 0 {
                info!("DCE: transport opened after {} failed attempt(s)", self.open_failures);
                self.open_failures = 0;
            }
        }
        self.device.reset();
        if let Err(err) = self.transport.write(BANNER) {
            debug!("DCE: banner not sent: {}", err);
        }
        if let Err(err) = self.transport.set_rts(true) {
            warn!("DCE: unable to raise RTS: {}", err);
        }
    }

    /// Sleep for `duration`, waking early if terminated.
    fn pause(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.is_terminated() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(IDLE_DELAY.min(deadline - now));
        }
    }

    fn dispatch(&mut self, line: &str) {
        debug!("DCE RX: {}", line);
        match self.device.process_command(line) {
            Response::Text(text) => self.send(&text),
            Response::Data(data) => {
                self.send(&data);
                self.send(&codec::checksum_line(data.as_bytes()));
            }
            // The real unit reboots on its own; the main loop reopens the
            // transport once REBOOT_DELAY has passed, without waiting for the
            // peer to write.
            Response::Close => {
                self.send("\r");
                self.send(PROMPT);
                info!("DCE: connection closed by peer, rebooting");
                if let Err(err) = self.transport.set_rts(false).and_then(|_| self.transport.close()) {
                    warn!("DCE: error closing transport: {}", err);
                }
                thread::sleep(REBOOT_DELAY);
                return;
            }
        }
        self.send(PROMPT);
    }

    fn wait_for_cts(&mut self) -> bool {
        let deadline = Instant::now() + self.timeout;
        loop {
            match self.transport.get_cts() {
                Ok(true) => return true,
                Ok(false) if Instant::now() < deadline => thread::sleep(CTS_POLL_INTERVAL),
                Ok(false) => return false,
                Err(err) => {
                    debug!("DCE: unable to read CTS: {}", err);
                    return false;
                }
            }
        }
    }

    /// Write `data` once the peer signals it is ready; dropped otherwise.
    fn send(&mut self, data: &str) {
        if data.is_empty() {
            return;
        }
        if let Err(err) = self.transport.set_rts(true) {
            warn!("DCE: unable to raise RTS: {}", err);
            return;
        }
        if !self.wait_for_cts() {
            warn!("DCE: no CTS from peer, dropping {} byte(s)", data.len());
            return;
        }
        for line in data.trim_matches('\r').split('\r') {
            debug!("DCE TX: {}", line);
        }
        if let Err(err) = self.transport.write(data.as_bytes()) {
            warn!("DCE: write failed: {}", err);
        }
    }
}

fn timestamp(value: &str) -> Result<chrono::NaiveDateTime, RecordError> {
    codec::parse_timestamp("timestamp", value)
}

/// A small dataset resembling what a real unit holds: two finished pressure
/// runs with readings and one run without any yet.
pub fn sample_bottles() -> Result<Vec<Bottle>, RecordError> {
    let mut first = Bottle::new(
        "110222-06".parse()?,
        999,
        timestamp("110222165455")?,
        timestamp("110308165455")?,
        Interval::minutes(56),
        360,
        BottleMode::Pressure,
        510.0,
        432.0,
        0,
    )?;
    first.add_head(BottleHead::new(first.serial.clone(), "60108", Some(150))?.with_readings(vec![
        970, 965, 965, 965, 965, 965, 964, 965, 965, 965, 965, 964, 965, 965, 965, 965, 965, 965,
        964, 965, 965, 965, 965, 965, 964, 965, 965, 964, 964, 964,
    ]))?;

    let mut second = Bottle::new(
        "121119-03".parse()?,
        3,
        timestamp("121119135304")?,
        timestamp("121122135304")?,
        Interval::minutes(12),
        360,
        BottleMode::Pressure,
        510.0,
        432.0,
        0,
    )?;
    second.add_head(
        BottleHead::new(second.serial.clone(), "60108", Some(150))?.with_readings(Vec::new()),
    )?;

    let mut third = Bottle::new(
        "120323-01".parse()?,
        1,
        timestamp("120323173223")?,
        timestamp("120420173223")?,
        Interval::minutes(112),
        360,
        BottleMode::Pressure,
        510.0,
        432.0,
        0,
    )?;
    third.add_head(BottleHead::new(third.serial.clone(), "60145", Some(150))?.with_readings(vec![
        976, 964, 963, 963, 963, 963, 963, 963, 963, 963, 963, 963, 963, 963, 964, 963, 963, 963,
        963, 963, 963, 963, 963, 963, 962, 963, 963,
    ]))?;

    Ok(vec![first, second, third])
}
