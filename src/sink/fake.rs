//! An in-memory backend for driving the connection and flusher against
//! failures on demand.

use crate::sink::connection::Connector;
use std::io;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Default)]
struct State {
    down: bool,
    fail_writes: bool,
    latency: Duration,
    connect_attempts: usize,
    lines: Vec<String>,
    batches: Vec<usize>,
}

/// Shared view of what the fake backend has received.
#[derive(Clone, Default)]
pub struct Backend {
    state: Arc<Mutex<State>>,
}

impl Backend {
    pub fn new() -> Backend {
        Backend::default()
    }

    /// Refuse (`false`) or accept (`true`) new connections.
    pub fn set_up(&self, up: bool) {
        self.state.lock().unwrap().down = !up;
    }

    /// Fail every write on every stream while set.
    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().unwrap().fail_writes = fail;
    }

    /// Make every connect and every flush take `latency`. One given less
    /// time than that waits out its timeout and fails.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().unwrap().latency = latency;
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.lock().unwrap().connect_attempts
    }

    /// Every line received, in order.
    pub fn lines(&self) -> Vec<String> {
        self.state.lock().unwrap().lines.clone()
    }

    /// Lines per flushed write, in order.
    pub fn batches(&self) -> Vec<usize> {
        self.state.lock().unwrap().batches.clone()
    }
}

pub struct FakeConnector {
    backend: Backend,
}

impl FakeConnector {
    pub fn new(backend: &Backend) -> FakeConnector {
        FakeConnector {
            backend: backend.clone(),
        }
    }
}

impl Connector for FakeConnector {
    type Stream = FakeStream;

    fn connect(&mut self, timeout: Duration) -> io::Result<FakeStream> {
        let down = {
            let mut state = self.backend.state.lock().unwrap();
            state.connect_attempts += 1;
            state.down
        };
        if down {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "backend down"));
        }
        wait(&self.backend, timeout)?;
        Ok(FakeStream {
            backend: self.backend.clone(),
            pending: Vec::new(),
            write_timeout: timeout,
        })
    }

    fn set_write_timeout(&self, stream: &mut FakeStream, timeout: Duration) -> io::Result<()> {
        stream.write_timeout = timeout;
        Ok(())
    }
}

/// Buffers writes and hands them to the backend on `flush`.
pub struct FakeStream {
    backend: Backend,
    pending: Vec<u8>,
    write_timeout: Duration,
}

impl Write for FakeStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.backend.state.lock().unwrap().fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "write failed"));
        }
        self.pending.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        if let Err(e) = wait(&self.backend, self.write_timeout) {
            self.pending.clear();
            return Err(e);
        }
        let mut state = self.backend.state.lock().unwrap();
        if state.fail_writes {
            self.pending.clear();
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "flush failed"));
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        let lines: Vec<String> = text.lines().map(|l| l.to_string()).collect();
        state.batches.push(lines.len());
        state.lines.extend(lines);
        self.pending.clear();
        Ok(())
    }
}
