//! Sources of host events.
//!
//! watchmen hands events to its plugins in-process. Out of process the same
//! events arrive one JSON object per line, see `JsonLines`.

use crate::plugin::{EventHandler, HostEvent};
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A source of host events, run to completion on its own thread.
pub trait Source {
    /// Deliver events until the source is exhausted or asked to stop.
    fn run(&mut self) -> ();
}

/// Reads newline-delimited JSON host events and dispatches each to an
/// `EventHandler`.
///
/// Blank lines are ignored. A line that is not a host event is logged and
/// counted, then skipped. The source stops at end of input or, between lines,
/// once its shutdown flag is set.
pub struct JsonLines<R, H> {
    reader: R,
    handler: H,
    shutdown: Arc<AtomicBool>,
    events: usize,
    bad_lines: usize,
}

impl<R, H> JsonLines<R, H>
where
    R: BufRead,
    H: EventHandler,
{
    /// Create a `JsonLines` reading from `reader`.
    pub fn new(reader: R, handler: H, shutdown: Arc<AtomicBool>) -> JsonLines<R, H> {
        JsonLines {
            reader: reader,
            handler: handler,
            shutdown: shutdown,
            events: 0,
            bad_lines: 0,
        }
    }

    /// Events dispatched so far.
    pub fn events(&self) -> usize {
        self.events
    }

    /// Lines skipped as malformed so far.
    pub fn bad_lines(&self) -> usize {
        self.bad_lines
    }
}

impl<R, H> Source for JsonLines<R, H>
where
    R: BufRead,
    H: EventHandler,
{
    fn run(&mut self) {
        let mut line = String::new();
        while !self.shutdown.load(Ordering::Relaxed) {
            line.clear();
            match self.reader.read_line(&mut line) {
                Ok(0) => {
                    debug!("host event input closed");
                    break;
                }
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<HostEvent>(trimmed) {
                        Ok(event) => {
                            self.handler.on_event(&event);
                            self.events += 1;
                        }
                        Err(e) => {
                            self.bad_lines += 1;
                            warn!("skipping malformed host event: {}", e);
                        }
                    }
                }
                Err(e) => {
                    error!("could not read host events: {}", e);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect {
        seen: Mutex<Vec<HostEvent>>,
    }

    impl<'a> EventHandler for &'a Collect {
        fn on_event(&self, event: &HostEvent) {
            self.seen.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn dispatches_each_line() {
        let input = r#"{"event":"service-ok","service":{"name":"a"},"elapsedTime":10}

not json
{"event":"service-error","service":{"name":"b"},"error":"boom"}
{"event":"no-such-event","service":{"name":"c"}}
"#;
        let collect = Collect::default();
        let mut src = JsonLines::new(
            Cursor::new(input.as_bytes()),
            &collect,
            Arc::new(AtomicBool::new(false)),
        );
        src.run();

        assert_eq!(src.events(), 2);
        assert_eq!(src.bad_lines(), 2);
        let seen = collect.seen.lock().unwrap();
        assert_eq!(seen[0].service().name, "a");
        assert_eq!(seen[1].service().name, "b");
    }

    #[test]
    fn stops_when_asked() {
        let input = "{\"event\":\"service-ok\",\"service\":{\"name\":\"a\"},\"elapsedTime\":1}\n";
        let collect = Collect::default();
        let mut src = JsonLines::new(
            Cursor::new(input.as_bytes()),
            &collect,
            Arc::new(AtomicBool::new(true)),
        );
        src.run();
        assert_eq!(src.events(), 0);
        assert!(collect.seen.lock().unwrap().is_empty());
    }
}
