//! The terminal side of the OC110 protocol.
//!
//! `ProtocolClient` owns a `Transport` and turns bottle/head queries into
//! command exchanges. Every exchange is strictly half-duplex: a command line
//! goes out, then bytes are collected until the device's `>` prompt comes
//! back. Responses to the data commands end with a checksum line which is
//! verified, and a corrupted response is re-requested up to `retries` times.
//!
//! The client is blocking and not safe to share between threads without
//! external locking.

use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::bottles::{Bottle, BottleSerial};
use crate::codec;
use crate::error::{Error, Result};
use crate::transport::Transport;

pub const DEFAULT_RETRIES: usize = 3;

/// What the unit answers to `MAID`.
pub const MANUFACTURER_ID: &str = "OC110";

/// The device's idle prompt.
pub const PROMPT: &[u8] = b">\r";

const CTS_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No prompt seen yet on the current connection.
    Disconnected,
    Handshaking,
    Ready,
    Sending,
    Receiving,
    Closed,
}

#[derive(Debug, Default)]
enum BottleCache {
    #[default]
    Empty,
    Cached(Vec<Bottle>),
}

pub struct ProtocolClient<T: Transport> {
    transport: T,
    retries: usize,
    timeout: Duration,
    state: SessionState,
    bottles: BottleCache,
    /// Bytes received after the last prompt.
    pending: Vec<u8>,
    id: String,
}

impl<T: Transport> ProtocolClient<T> {
    /// Connect with the default retry count.
    pub fn new(transport: T) -> Result<Self> {
        Self::with_retries(transport, DEFAULT_RETRIES)
    }

    /// Connect to the unit on `transport` and check that it identifies as an
    /// OC110.
    pub fn with_retries(transport: T, retries: usize) -> Result<Self> {
        let timeout = match transport.timeout() {
            Some(timeout) if !timeout.is_zero() => timeout,
            _ => {
                return Err(Error::Config(
                    "transport timeout must be a positive duration".to_string(),
                ))
            }
        };
        if retries == 0 {
            return Err(Error::Config("retries must be at least 1".to_string()));
        }
        let mut client = ProtocolClient {
            transport,
            retries,
            timeout,
            state: SessionState::Disconnected,
            bottles: BottleCache::Empty,
            pending: Vec::new(),
            id: String::new(),
        };
        debug!("DTE: testing for known response from MAID command");
        let id = client.maid()?;
        if id != MANUFACTURER_ID {
            return Err(Error::UnexpectedReply(format!(
                "unexpected manufacturer ID: {:?}",
                id
            )));
        }
        info!("Connected to {}", id);
        client.id = id;
        Ok(client)
    }

    /// The manufacturer ID reported by the unit.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn retries(&self) -> usize {
        self.retries
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the unit's prompt has been seen on the current connection.
    pub fn prompt_seen(&self) -> bool {
        matches!(
            self.state,
            SessionState::Ready | SessionState::Sending | SessionState::Receiving
        )
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Every bottle stored on the unit. The list is fetched once and cached
    /// until `refresh` is called.
    pub fn bottles(&mut self) -> Result<Vec<Bottle>> {
        if let BottleCache::Cached(bottles) = &self.bottles {
            return Ok(bottles.clone());
        }
        let data = self.gapb()?;
        let bottles = codec::decode_bottles(&data)?;
        info!("Retrieved {} bottle(s)", bottles.len());
        self.bottles = BottleCache::Cached(bottles.clone());
        Ok(bottles)
    }

    /// The bottle with the given serial number. The cache is consulted first;
    /// otherwise the bottle is fetched on its own, without populating the
    /// cache.
    pub fn bottle(&mut self, serial: &str) -> Result<Bottle> {
        if let BottleCache::Cached(bottles) = &self.bottles {
            let found = bottles.iter().find(|bottle| {
                bottle.serial.to_string() == serial || bottle.serial.concatenated() == serial
            });
            if let Some(bottle) = found {
                return Ok(bottle.clone());
            }
        }
        let data = self.gprb(&serial.replace('-', ""))?;
        Ok(codec::decode_bottle(&data)?)
    }

    /// Fetch a bottle from the unit, bypassing the cache.
    pub fn fetch_bottle(&mut self, serial: &BottleSerial) -> Result<Bottle> {
        let data = self.gprb(&serial.concatenated())?;
        Ok(codec::decode_bottle(&data)?)
    }

    /// Fetch the readings of one head.
    pub fn fetch_readings(&mut self, bottle: &BottleSerial, head: &str) -> Result<Vec<i64>> {
        let wire_serial = bottle.concatenated();
        self.gsns(&wire_serial)?;
        let data = self.gmsk(&wire_serial, head)?;
        Ok(codec::decode_readings(&data, bottle, head)?)
    }

    /// Force the bottle list to be re-read on next access.
    pub fn refresh(&mut self) {
        self.bottles = BottleCache::Empty;
    }

    /// Tell the unit to close the connection, then drop RTS and close the
    /// transport. Does nothing if the transport is already closed.
    pub fn close(&mut self) -> Result<()> {
        if !self.transport.is_open() {
            self.state = SessionState::Closed;
            return Ok(());
        }
        let result = self.cloc();
        self.transport.set_rts(false)?;
        self.transport.close()?;
        self.pending.clear();
        self.state = SessionState::Closed;
        info!("Connection closed");
        result
    }

    fn wait_for_cts(&mut self) -> Result<()> {
        if self.transport.get_cts()? {
            return Ok(());
        }
        let deadline = Instant::now() + self.timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::HandshakeFailed(self.timeout));
            }
            thread::sleep(CTS_POLL_INTERVAL.min(deadline - now));
            if self.transport.get_cts()? {
                return Ok(());
            }
        }
    }

    fn handshake(&mut self) -> Result<()> {
        self.state = SessionState::Handshaking;
        self.transport.set_rts(true)?;
        if let Err(err) = self.wait_for_cts() {
            self.state = SessionState::Disconnected;
            return Err(err);
        }
        // Prod the unit until it shows a prompt; whatever it printed while
        // booting comes back with the first reply.
        let mut response = None;
        for _ in 0..self.retries {
            debug!("DTE: no prompt seen, prodding unit");
            self.write_line("")?;
            match self.read_response(false) {
                Ok(data) => {
                    response = Some(data);
                    break;
                }
                Err(Error::ReceiveTimeout) => continue,
                Err(err) => {
                    self.state = SessionState::Disconnected;
                    return Err(err);
                }
            }
        }
        let Some(response) = response else {
            self.state = SessionState::Disconnected;
            return Err(Error::ReceiveTimeout);
        };
        if !(response.ends_with("LOGON\r") || response.ends_with("INVALID COMMAND\r")) {
            self.state = SessionState::Disconnected;
            return Err(Error::UnexpectedReply(format!(
                "expected LOGON or INVALID COMMAND, got {:?}",
                response
            )));
        }
        self.state = SessionState::Ready;
        Ok(())
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        debug!("DTE TX: {}", line);
        let data = format!("{}\r", line);
        let written = self.transport.write(data.as_bytes())?;
        if written != data.len() {
            return Err(Error::PartialSend {
                written,
                expected: data.len(),
            });
        }
        Ok(())
    }

    /// Send `command` with its arguments, handshaking first if needed.
    fn send(&mut self, command: &str, args: &[&str]) -> Result<()> {
        if !self.transport.is_open() {
            self.transport.open()?;
            self.pending.clear();
            self.state = SessionState::Disconnected;
        }
        if !self.prompt_seen() {
            self.handshake()?;
        }
        self.state = SessionState::Sending;
        let line = std::iter::once(command)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(",");
        let result = self.write_line(&line);
        self.state = SessionState::Ready;
        result
    }

    fn receive(&mut self, expect_checksum: bool) -> Result<String> {
        self.state = SessionState::Receiving;
        let result = self.read_response(expect_checksum);
        self.state = SessionState::Ready;
        result
    }

    /// Read up to and including the next prompt and return what came before
    /// it, minus the checksum line if one is expected.
    fn read_response(&mut self, expect_checksum: bool) -> Result<String> {
        let mut response = std::mem::take(&mut self.pending);
        let mut line_start = 0;
        let mut buf = [0u8; 256];
        let end = loop {
            if let Some(pos) = response.windows(PROMPT.len()).position(|w| w == PROMPT) {
                break pos;
            }
            let count = self.transport.read(&mut buf)?;
            if count == 0 {
                return Err(Error::ReceiveTimeout);
            }
            for &byte in &buf[..count] {
                // LFs only show up in the boot banner and would break the
                // line splitting below
                if byte == b'\n' {
                    continue;
                }
                response.push(byte);
                if byte == b'\r' {
                    let line = &response[line_start..response.len() - 1];
                    debug!("DTE RX: {}", String::from_utf8_lossy(line));
                    line_start = response.len();
                }
            }
        };
        self.pending = response.split_off(end + PROMPT.len());
        response.truncate(end);
        let text = String::from_utf8(response)
            .map_err(|_| Error::UnexpectedReply("response is not ASCII".to_string()))?;
        let mut lines: Vec<&str> = text.split('\r').collect();
        // Whatever sits between the last CR and the prompt
        lines.pop();
        if expect_checksum {
            let line = lines.pop().ok_or_else(|| {
                Error::UnexpectedReply("response is missing its checksum".to_string())
            })?;
            let received = line
                .strip_prefix(',')
                .and_then(|value| value.parse::<u64>().ok())
                .ok_or_else(|| {
                    Error::UnexpectedReply(format!("expected checksum line, got {:?}", line))
                })?;
            let body: String = lines.iter().map(|line| format!("{}\r", line)).collect();
            let calculated = codec::checksum(body.as_bytes());
            if received != calculated {
                return Err(Error::ChecksumMismatch {
                    received,
                    calculated,
                });
            }
            Ok(body)
        } else {
            Ok(lines.iter().map(|line| format!("{}\r", line)).collect())
        }
    }

    /// Send a checksum-bearing command, re-sending it while the response
    /// fails its checksum.
    fn exchange_checked(&mut self, command: &str, args: &[&str]) -> Result<String> {
        let mut attempt = 1;
        loop {
            self.send(command, args)?;
            match self.receive(true) {
                Err(Error::ChecksumMismatch {
                    received,
                    calculated,
                }) if attempt < self.retries => {
                    warn!(
                        "{} checksum mismatch (received {}, calculated {}), attempt {} of {}",
                        command, received, calculated, attempt, self.retries
                    );
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    fn maid(&mut self) -> Result<String> {
        self.send("MAID", &[])?;
        let response = self.receive(false)?;
        Ok(response.trim_end_matches('\r').to_string())
    }

    fn cloc(&mut self) -> Result<()> {
        self.send("CLOC", &[])?;
        self.receive(false)?;
        Ok(())
    }

    fn gapb(&mut self) -> Result<String> {
        self.exchange_checked("GAPB", &[])
    }

    fn gprb(&mut self, serial: &str) -> Result<String> {
        self.exchange_checked("GPRB", &[serial])
    }

    // Purpose unknown; the vendor software always sends it before GMSK.
    fn gsns(&mut self, serial: &str) -> Result<()> {
        self.send("GSNS", &[serial])?;
        self.receive(false)?;
        Ok(())
    }

    fn gmsk(&mut self, serial: &str, head: &str) -> Result<String> {
        self.exchange_checked("GMSK", &[serial, head])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bottles::tests::sample_bottle;
    use crate::error::RecordError;
    use crate::null_modem::null_modem;
    use serial_test::serial;
    use std::collections::VecDeque;
    use std::io;

    /// Replays canned OC110 replies to each command line it is sent.
    struct ScriptedTransport {
        open: bool,
        inbound: VecDeque<u8>,
        partial: String,
        commands: Vec<String>,
        maid_reply: &'static str,
        prod_reply: &'static str,
        body: String,
        corrupt: usize,
        /// Commands that get no reply at all.
        silent: Vec<&'static str>,
        max_write: usize,
    }

    impl ScriptedTransport {
        fn new() -> Self {
            ScriptedTransport {
                open: true,
                inbound: b"\r\nBIOS OC Version 1.0\r\n".iter().copied().collect(),
                partial: String::new(),
                commands: Vec::new(),
                maid_reply: "OC110\r",
                prod_reply: "LOGON\r",
                body: codec::encode_bottle(&sample_bottle(112)),
                corrupt: 0,
                silent: Vec::new(),
                max_write: usize::MAX,
            }
        }

        fn count(&self, command: &str) -> usize {
            self.commands
                .iter()
                .filter(|line| line.split(',').next() == Some(command))
                .count()
        }

        fn reply(&mut self, line: &str) {
            let command = line.split(',').next().unwrap_or_default();
            if self.silent.iter().any(|silent| *silent == command) {
                return;
            }
            let reply = match command {
                "" => self.prod_reply.to_string(),
                "MAID" => self.maid_reply.to_string(),
                "CLOC" => "\r".to_string(),
                "GAPB" | "GPRB" => {
                    let mut sum = codec::checksum(self.body.as_bytes());
                    if self.corrupt > 0 {
                        self.corrupt -= 1;
                        sum += 1;
                    }
                    format!("{},{}\r", self.body, sum)
                }
                "GSNS" => String::new(),
                "GMSK" => "INVALID HEAD\r".to_string(),
                _ => "INVALID COMMAND\r".to_string(),
            };
            self.inbound.extend(reply.bytes());
            self.inbound.extend(PROMPT.iter().copied());
        }
    }

    impl Transport for ScriptedTransport {
        fn open(&mut self) -> io::Result<()> {
            self.open = true;
            Ok(())
        }

        fn close(&mut self) -> io::Result<()> {
            self.open = false;
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open
        }

        fn set_rts(&mut self, _level: bool) -> io::Result<()> {
            Ok(())
        }

        fn get_cts(&mut self) -> io::Result<bool> {
            Ok(true)
        }

        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let count = buf.len().min(self.inbound.len());
            for (slot, byte) in buf.iter_mut().zip(self.inbound.drain(..count)) {
                *slot = byte;
            }
            Ok(count)
        }

        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            let data = &data[..data.len().min(self.max_write)];
            self.partial.push_str(&String::from_utf8_lossy(data));
            while let Some(end) = self.partial.find('\r') {
                let line: String = self.partial.drain(..=end).collect();
                let line = line.trim_end_matches('\r').to_string();
                self.reply(&line);
                self.commands.push(line);
            }
            Ok(data.len())
        }

        fn timeout(&self) -> Option<Duration> {
            Some(Duration::from_secs(1))
        }
    }

    #[test]
    fn connects_and_identifies_the_unit() {
        let client = ProtocolClient::new(ScriptedTransport::new()).unwrap();
        assert_eq!(client.id(), "OC110");
        assert!(client.prompt_seen());
        assert_eq!(client.state(), SessionState::Ready);
        assert_eq!(client.transport().commands, vec!["", "MAID"]);
    }

    #[test]
    fn rejects_a_transport_without_timeout() {
        let (dte, _dce) = null_modem(9600, None);
        assert!(matches!(ProtocolClient::new(dte), Err(Error::Config(_))));
        let (dte, _dce) = null_modem(9600, Some(Duration::ZERO));
        assert!(matches!(ProtocolClient::new(dte), Err(Error::Config(_))));
        assert!(matches!(
            ProtocolClient::with_retries(ScriptedTransport::new(), 0),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn rejects_the_wrong_manufacturer() {
        let mut transport = ScriptedTransport::new();
        transport.maid_reply = "OC100\r";
        let result = ProtocolClient::new(transport);
        assert!(matches!(result, Err(Error::UnexpectedReply(msg)) if msg.contains("OC100")));
    }

    #[test]
    fn rejects_an_unexpected_prompt_reply() {
        let mut transport = ScriptedTransport::new();
        transport.prod_reply = "HELLO\r";
        assert!(matches!(ProtocolClient::new(transport), Err(Error::UnexpectedReply(_))));
    }

    #[test]
    fn invalid_command_is_an_acceptable_prompt_reply() {
        let mut transport = ScriptedTransport::new();
        transport.prod_reply = "INVALID COMMAND\r";
        assert!(ProtocolClient::new(transport).is_ok());
    }

    #[test]
    fn short_write_is_a_partial_send() {
        let mut transport = ScriptedTransport::new();
        transport.max_write = 3;
        assert!(matches!(
            ProtocolClient::new(transport),
            Err(Error::PartialSend { written: 3, expected: 5 })
        ));
    }

    #[test]
    fn silence_is_a_receive_timeout() {
        let mut client = ProtocolClient::new(ScriptedTransport::new()).unwrap();
        assert!(client.transport.inbound.is_empty());
        assert!(matches!(client.receive(false), Err(Error::ReceiveTimeout)));
    }

    #[test]
    fn fetches_and_caches_bottles() {
        let mut client = ProtocolClient::new(ScriptedTransport::new()).unwrap();
        let bottles = client.bottles().unwrap();
        assert_eq!(bottles, vec![sample_bottle(112)]);
        assert_eq!(client.bottles().unwrap(), bottles);
        assert_eq!(client.transport().count("GAPB"), 1);
        assert_eq!(client.bottle("120323-01").unwrap(), bottles[0]);
        assert_eq!(client.bottle("12032301").unwrap(), bottles[0]);
        assert_eq!(client.transport().count("GPRB"), 0);
        client.refresh();
        client.bottles().unwrap();
        assert_eq!(client.transport().count("GAPB"), 2);
    }

    #[test]
    fn recovers_from_a_corrupted_response() {
        let mut transport = ScriptedTransport::new();
        transport.corrupt = 2;
        let mut client = ProtocolClient::new(transport).unwrap();
        assert_eq!(client.bottles().unwrap().len(), 1);
        assert_eq!(client.transport().count("GAPB"), 3);
    }

    #[test]
    fn gives_up_after_exactly_retries_attempts() {
        for retries in [1, 3, 5] {
            let mut transport = ScriptedTransport::new();
            transport.corrupt = usize::MAX;
            let mut client = ProtocolClient::with_retries(transport, retries).unwrap();
            assert!(matches!(client.bottles(), Err(Error::ChecksumMismatch { .. })));
            assert_eq!(client.transport().count("GAPB"), retries);
        }
    }

    #[test]
    fn silent_unit_fails_to_connect_with_a_timeout() {
        let mut transport = ScriptedTransport::new();
        transport.silent = vec![""];
        assert!(matches!(ProtocolClient::new(transport), Err(Error::ReceiveTimeout)));
    }

    #[test]
    fn silence_is_not_retried() {
        let mut transport = ScriptedTransport::new();
        transport.silent = vec!["GAPB", "GPRB"];
        let mut client = ProtocolClient::new(transport).unwrap();
        assert!(matches!(client.bottles(), Err(Error::ReceiveTimeout)));
        assert_eq!(client.transport().count("GAPB"), 1);
        assert!(matches!(client.bottle("12032301"), Err(Error::ReceiveTimeout)));
        assert_eq!(client.transport().count("GPRB"), 1);
    }

    #[test]
    fn malformed_record_is_not_retried() {
        let mut transport = ScriptedTransport::new();
        transport.body = "0,0,3,1,120323-01\r".to_string();
        let mut client = ProtocolClient::new(transport).unwrap();
        assert!(matches!(
            client.bottles(),
            Err(Error::MalformedRecord(RecordError::FieldCount { expected: 20, found: 5 }))
        ));
        assert_eq!(client.transport().count("GAPB"), 1);
        assert!(matches!(client.bottle("12032301"), Err(Error::MalformedRecord(_))));
        assert_eq!(client.transport().count("GPRB"), 1);
    }

    #[test]
    fn missing_head_is_an_unexpected_reply() {
        let mut client = ProtocolClient::new(ScriptedTransport::new()).unwrap();
        let serial: BottleSerial = "120323-01".parse().unwrap();
        let result = client.fetch_readings(&serial, "60143");
        assert!(matches!(result, Err(Error::UnexpectedReply(msg)) if msg.contains("INVALID HEAD")));
        assert_eq!(client.transport().count("GSNS"), 1);
        assert_eq!(client.transport().count("GMSK"), 1);
    }

    #[test]
    fn close_resets_the_session_and_is_idempotent() {
        let mut client = ProtocolClient::new(ScriptedTransport::new()).unwrap();
        client.close().unwrap();
        assert!(!client.prompt_seen());
        assert_eq!(client.state(), SessionState::Closed);
        assert_eq!(client.transport().count("CLOC"), 1);
        client.close().unwrap();
        assert_eq!(client.transport().count("CLOC"), 1);

        // The next command reopens the transport and prods the unit again.
        client.bottles().unwrap();
        assert!(client.prompt_seen());
        assert_eq!(client.transport().count(""), 2);
    }

    #[test]
    fn bytes_after_the_prompt_are_kept() {
        let mut client = ProtocolClient::new(ScriptedTransport::new()).unwrap();
        client.transport.inbound.extend(b"first\r>\rsecond\r>\r".iter().copied());
        assert_eq!(client.receive(false).unwrap(), "first\r");
        assert_eq!(client.receive(false).unwrap(), "second\r");
    }

    #[test]
    fn checksum_line_must_be_comma_prefixed() {
        let mut client = ProtocolClient::new(ScriptedTransport::new()).unwrap();
        client.transport.inbound.extend(b"INVALID BOTTLE\r>\r".iter().copied());
        assert!(matches!(
            client.receive(true),
            Err(Error::UnexpectedReply(msg)) if msg.contains("INVALID BOTTLE")
        ));
    }

    #[test]
    #[serial]
    fn handshake_times_out_without_cts() {
        let timeout = Duration::from_millis(500);
        let (dte, _dce) = null_modem(9600, Some(timeout));
        let start = Instant::now();
        let result = ProtocolClient::new(dte);
        let elapsed = start.elapsed();
        assert!(matches!(result, Err(Error::HandshakeFailed(t)) if t == timeout));
        assert!(elapsed >= timeout, "{elapsed:?}");
        assert!(elapsed < timeout + Duration::from_millis(250), "{elapsed:?}");
    }
}
