//! An in-process null-modem cable.
//!
//! `null_modem` returns two cross-wired `Transport` endpoints. Bytes written
//! on one end arrive at the other after the time the link would take to clock
//! them out (ten bit times per byte for 8-N-1), and RTS on one end is CTS on
//! the other. There's no protocol knowledge in here, only signal and timing
//! behaviour, which is what lets the handshake and timeout logic be tested
//! without hardware.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::transport::Transport;

/// One direction of the cable: the sender's RTS line plus the bytes in
/// flight towards the receiver.
#[derive(Debug)]
struct Line {
    state: Mutex<LineState>,
    changed: Condvar,
}

#[derive(Debug)]
struct LineState {
    /// Bytes and the instant each finishes arriving.
    queue: VecDeque<(Instant, u8)>,
    /// When the last scheduled byte leaves the wire.
    busy_until: Instant,
    receiver_open: bool,
    sender_rts: bool,
}

impl Line {
    fn new() -> Arc<Self> {
        Arc::new(Line {
            state: Mutex::new(LineState {
                queue: VecDeque::new(),
                busy_until: Instant::now(),
                receiver_open: true,
                sender_rts: false,
            }),
            changed: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, LineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One end of a null-modem cable. Clones share the same end, so a test can
/// keep a clone to close a port that has been handed to another thread.
#[derive(Debug, Clone)]
pub struct NullModemPort {
    name: &'static str,
    byte_time: Duration,
    timeout: Option<Duration>,
    inbound: Arc<Line>,
    outbound: Arc<Line>,
}

/// Construct both ends of a null-modem cable. The first is conventionally
/// the terminal ("DTE") and the second the device ("DCE"). Both start open.
pub fn null_modem(baudrate: u32, timeout: Option<Duration>) -> (NullModemPort, NullModemPort) {
    let byte_time = Duration::from_secs_f64(10.0 / f64::from(baudrate.max(1)));
    let to_dce = Line::new();
    let to_dte = Line::new();
    let dte = NullModemPort {
        name: "DTE",
        byte_time,
        timeout,
        inbound: Arc::clone(&to_dte),
        outbound: Arc::clone(&to_dce),
    };
    let dce = NullModemPort {
        name: "DCE",
        byte_time,
        timeout,
        inbound: to_dce,
        outbound: to_dte,
    };
    (dte, dce)
}

impl NullModemPort {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Time the link takes to carry a single byte.
    pub fn byte_time(&self) -> Duration {
        self.byte_time
    }

    /// Number of bytes queued towards this end, arrived or not.
    pub fn in_flight(&self) -> usize {
        self.inbound.lock().queue.len()
    }
}

fn not_open() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "null modem port is closed")
}

impl Transport for NullModemPort {
    fn open(&mut self) -> io::Result<()> {
        let mut state = self.inbound.lock();
        state.queue.clear();
        state.receiver_open = true;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        {
            let mut state = self.inbound.lock();
            state.queue.clear();
            state.receiver_open = false;
        }
        // Wake any reader blocked on this end so it sees the closure.
        self.inbound.changed.notify_all();
        self.outbound.lock().sender_rts = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inbound.lock().receiver_open
    }

    fn set_rts(&mut self, level: bool) -> io::Result<()> {
        self.outbound.lock().sender_rts = level;
        Ok(())
    }

    fn get_cts(&mut self) -> io::Result<bool> {
        Ok(self.inbound.lock().sender_rts)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.inbound.lock();
        loop {
            if !state.receiver_open {
                return Err(not_open());
            }
            let now = Instant::now();
            let mut count = 0;
            while count < buf.len() {
                match state.queue.front() {
                    Some(&(arrival, byte)) if arrival <= now => {
                        buf[count] = byte;
                        count += 1;
                        state.queue.pop_front();
                    }
                    _ => break,
                }
            }
            if count > 0 || buf.is_empty() {
                return Ok(count);
            }
            // Sleep until the next byte lands, the deadline passes, or a
            // writer/closer wakes us.
            let next_arrival = state.queue.front().map(|&(arrival, _)| arrival);
            let wake = match (next_arrival, deadline) {
                (Some(arrival), Some(deadline)) => Some(arrival.min(deadline)),
                (arrival, deadline) => arrival.or(deadline),
            };
            match wake {
                Some(wake) => {
                    if deadline.is_some_and(|deadline| now >= deadline) {
                        return Ok(0);
                    }
                    let wait = wake.saturating_duration_since(now);
                    state = self
                        .inbound
                        .changed
                        .wait_timeout(state, wait)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
                None => {
                    state = self
                        .inbound
                        .changed
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if !self.is_open() {
            return Err(not_open());
        }
        {
            let mut state = self.outbound.lock();
            if state.receiver_open {
                let mut arrival = state.busy_until.max(Instant::now());
                for &byte in data {
                    arrival += self.byte_time;
                    state.queue.push_back((arrival, byte));
                }
                state.busy_until = arrival;
            }
        }
        self.outbound.changed.notify_all();
        Ok(data.len())
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}
