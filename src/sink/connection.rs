//! The persistent stream to graphite and the state machine that keeps it up.

use crate::config::Config;
use crate::time::Backoff;
use std::io;
use std::cmp;
use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

/// Opens a fresh stream to the backend.
///
/// `TcpConnector` is the production implementation. The seam exists so the
/// state machine can be driven against a stream that fails on demand.
pub trait Connector {
    /// The stream type produced.
    type Stream: Write;

    /// Make a single connection attempt. Must not retry internally and must
    /// give up within `timeout`, however many addresses are tried.
    fn connect(&mut self, timeout: Duration) -> io::Result<Self::Stream>;

    /// Bound each later write on `stream` by `timeout`.
    fn set_write_timeout(&self, stream: &mut Self::Stream, timeout: Duration) -> io::Result<()>;
}

/// Connects to graphite's plaintext port over TCP.
#[derive(Clone, Debug)]
pub struct TcpConnector {
    host: String,
    port: u16,
}

impl TcpConnector {
    /// Create a `TcpConnector` for the configured host and port.
    pub fn new(config: &Config) -> TcpConnector {
        TcpConnector {
            host: config.host.clone(),
            port: config.port,
        }
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    fn connect(&mut self, timeout: Duration) -> io::Result<TcpStream> {
        let deadline = Instant::now() + timeout;
        let addrs = match (self.host.as_str(), self.port).to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                info!(
                    "Unable to perform DNS lookup on host {} with error {}",
                    self.host, e
                );
                return Err(e);
            }
        };
        let mut last_err = None;
        for addr in addrs {
            let now = Instant::now();
            if now >= deadline {
                last_err = Some(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no connection to {} within {:?}", self.host, timeout),
                ));
                break;
            }
            match TcpStream::connect_timeout(&addr, deadline - now) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(e) => {
                    info!(
                        "Unable to connect to graphite at {} using addr {} with error {}",
                        self.host, addr, e
                    );
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} resolved to no addresses", self.host),
            )
        }))
    }

    fn set_write_timeout(&self, stream: &mut TcpStream, timeout: Duration) -> io::Result<()> {
        stream.set_write_timeout(Some(timeout))
    }
}

/// Lifecycle of the graphite connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No stream and no attempt under way. The initial state.
    Disconnected,
    /// A connection attempt is under way.
    Connecting,
    /// A live stream is available for writes.
    Connected,
    /// A live stream was lost and a fresh attempt is scheduled.
    Reconnecting,
}

/// Inputs to the connection state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// The reconnect delay has elapsed.
    RetryDue,
    /// A connection attempt succeeded.
    ConnectSuccess,
    /// A connection attempt failed.
    ConnectFailure,
    /// A write on the live stream failed or timed out.
    WriteFailure,
    /// The live stream saw no successful write for the socket timeout.
    IdleTimeout,
}

impl ConnectionState {
    /// The state after `transition`. Defined for every pair; inputs that make
    /// no sense in a state leave it unchanged.
    pub fn next(self, transition: Transition) -> ConnectionState {
        use self::ConnectionState::*;
        use self::Transition::*;
        match (self, transition) {
            (Disconnected, RetryDue) => Connecting,
            (Disconnected, ConnectSuccess) => Connected,
            (Disconnected, ConnectFailure) => Disconnected,
            (Disconnected, WriteFailure) => Disconnected,
            (Disconnected, IdleTimeout) => Disconnected,

            (Connecting, RetryDue) => Connecting,
            (Connecting, ConnectSuccess) => Connected,
            (Connecting, ConnectFailure) => Disconnected,
            (Connecting, WriteFailure) => Disconnected,
            (Connecting, IdleTimeout) => Disconnected,

            (Connected, RetryDue) => Connected,
            (Connected, ConnectSuccess) => Connected,
            (Connected, ConnectFailure) => Reconnecting,
            (Connected, WriteFailure) => Reconnecting,
            (Connected, IdleTimeout) => Reconnecting,

            (Reconnecting, RetryDue) => Connecting,
            (Reconnecting, ConnectSuccess) => Connected,
            (Reconnecting, ConnectFailure) => Disconnected,
            (Reconnecting, WriteFailure) => Reconnecting,
            (Reconnecting, IdleTimeout) => Reconnecting,
        }
    }
}

/// Result of `ConnectionManager::acquire`.
pub enum Acquire<'a, S: 'a> {
    /// A live stream. Report the write's outcome with `wrote` or
    /// `write_failed`.
    Ready(&'a mut S),
    /// No stream now; try again on a later tick.
    NotReady,
}

/// Owns the stream to graphite and re-establishes it on failure.
///
/// Exactly one thread, the flusher's, may own a `ConnectionManager`. Nothing
/// here ever sleeps: a reconnect that is not yet due simply reports
/// `NotReady` and the caller moves on.
pub struct ConnectionManager<C: Connector> {
    connector: C,
    state: ConnectionState,
    stream: Option<C::Stream>,
    reconnect_delay: Duration,
    backoff: Backoff,
    idle_timeout: Duration,
    deadline: Option<Instant>,
    retry_at: Option<Instant>,
    last_activity: Instant,
    consecutive_failures: u32,
    connects: usize,
}

impl<C: Connector> ConnectionManager<C> {
    /// Create a `ConnectionManager` in `Disconnected` with its first attempt
    /// due immediately.
    pub fn new(connector: C, config: &Config) -> ConnectionManager<C> {
        ConnectionManager {
            connector: connector,
            state: ConnectionState::Disconnected,
            stream: None,
            reconnect_delay: config.reconnect_delay,
            backoff: config.reconnect_backoff,
            idle_timeout: config.socket_timeout,
            deadline: None,
            retry_at: None,
            last_activity: Instant::now(),
            consecutive_failures: 0,
            connects: 0,
        }
    }

    /// The current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Number of successful connects over this manager's lifetime.
    pub fn connects(&self) -> usize {
        self.connects
    }

    /// Connection attempts or writes that have failed in a row.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    fn transition(&mut self, t: Transition) {
        let next = self.state.next(t);
        if next != self.state {
            debug!("graphite connection {:?} -> {:?} on {:?}", self.state, next, t);
        }
        self.state = next;
    }

    fn schedule_retry(&mut self) {
        let delay = self.backoff
            .delay(self.reconnect_delay, self.consecutive_failures);
        self.retry_at = Some(Instant::now() + delay);
    }

    /// How long the next connect or write may take: the socket timeout, cut
    /// short by any deadline. `None` once the deadline has passed.
    fn time_left(&self) -> Option<Duration> {
        match self.deadline {
            None => Some(self.idle_timeout),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    None
                } else {
                    Some(cmp::min(self.idle_timeout, deadline - now))
                }
            }
        }
    }

    fn retry_due(&self) -> bool {
        match self.retry_at {
            None => true,
            Some(at) => Instant::now() >= at,
        }
    }

    /// Close a live stream that has been quiet for longer than the socket
    /// timeout. Called on every flusher tick so idle streams are reaped even
    /// when there is nothing to send.
    pub fn check_idle(&mut self) {
        if self.state == ConnectionState::Connected
            && self.last_activity.elapsed() >= self.idle_timeout
        {
            info!(
                "graphite connection idle for {:?}, closing",
                self.idle_timeout
            );
            self.stream = None;
            self.transition(Transition::IdleTimeout);
            // an idle close is not a failure, reconnect as soon as needed
            self.retry_at = None;
        }
    }

    /// Borrow the live stream, connecting first if a retry is due. The
    /// connect attempt and the writes that follow are each bounded by the
    /// socket timeout, or by the deadline if one is set and nearer.
    pub fn acquire(&mut self) -> Acquire<'_, C::Stream> {
        self.check_idle();
        let timeout = match self.time_left() {
            Some(timeout) => timeout,
            None => return Acquire::NotReady,
        };
        if self.state != ConnectionState::Connected || self.stream.is_none() {
            if !self.retry_due() {
                return Acquire::NotReady;
            }
            self.transition(Transition::RetryDue);
            match self.connector.connect(timeout) {
                Ok(stream) => {
                    self.stream = Some(stream);
                    self.transition(Transition::ConnectSuccess);
                    if self.consecutive_failures > 0 {
                        info!(
                            "graphite connection re-established after {} failures",
                            self.consecutive_failures
                        );
                    }
                    self.consecutive_failures = 0;
                    self.retry_at = None;
                    self.last_activity = Instant::now();
                    self.connects += 1;
                }
                Err(e) => {
                    self.transition(Transition::ConnectFailure);
                    self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                    self.schedule_retry();
                    debug!(
                        "graphite connect attempt {} failed: {}",
                        self.consecutive_failures, e
                    );
                    return Acquire::NotReady;
                }
            }
        }
        // connecting may have used up part of the time
        let timeout = match self.time_left() {
            Some(timeout) => timeout,
            None => return Acquire::NotReady,
        };
        let res = match self.stream {
            Some(ref mut stream) => self.connector.set_write_timeout(stream, timeout),
            None => Ok(()),
        };
        if let Err(e) = res {
            self.write_failed(&e);
            return Acquire::NotReady;
        }
        match self.stream {
            Some(ref mut stream) => Acquire::Ready(stream),
            None => Acquire::NotReady,
        }
    }

    /// Record a successful write on the live stream.
    pub fn wrote(&mut self) {
        self.last_activity = Instant::now();
        self.consecutive_failures = 0;
    }

    /// Record a failed write. Drops the stream and schedules a reconnect.
    pub fn write_failed(&mut self, err: &io::Error) {
        warn!("graphite write failed, reconnecting: {}", err);
        self.stream = None;
        self.transition(Transition::WriteFailure);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.schedule_retry();
    }

    /// Make the next `acquire` attempt a connect regardless of the reconnect
    /// delay. Used for the final flush on shutdown.
    pub fn expedite(&mut self) {
        self.retry_at = None;
    }

    /// Bound every later connect and write so none runs past `deadline`.
    /// Once it passes `acquire` only reports `NotReady`.
    pub fn set_deadline(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    /// Drop any live stream and return to `Disconnected`.
    pub fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.flush();
        }
        self.state = ConnectionState::Disconnected;
        self.retry_at = None;
    }
}
