//! Best-effort delivery of annotations to graphite-web's events API.
//!
//! Unlike samples, annotations are never retried. A few worker threads POST
//! them from a small bounded backlog; when the backlog is full an annotation
//! is logged and dropped. A failed POST is logged and forgotten. Nothing here
//! can block or fail the caller.

use crate::config::ApiConfig;
use crate::metric::Annotation;
use hyper::client::Client;
use hyper::header::{Authorization, Basic, ContentType};
use std::error;
use std::fmt;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Longest a single POST may wait on graphite-web to read or answer.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Threads POSTing annotations.
const WORKERS: usize = 2;
/// Annotations that may wait for a worker before new ones are dropped.
const BACKLOG: usize = 16;

/// Why an annotation did not land.
#[derive(Debug)]
pub enum AnnotationError {
    /// The annotation could not be serialized.
    Encode(serde_json::Error),
    /// The request could not be made or its response read.
    Http(hyper::Error),
    /// graphite-web answered with a non-success status.
    Status(u16),
    /// Every worker was busy and the backlog full.
    Dropped,
    /// No worker is left to deliver it.
    Stopped,
}

impl fmt::Display for AnnotationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            AnnotationError::Encode(ref e) => write!(f, "could not encode annotation: {}", e),
            AnnotationError::Http(ref e) => write!(f, "request failed: {}", e),
            AnnotationError::Status(code) => write!(f, "graphite-web answered {}", code),
            AnnotationError::Dropped => write!(f, "annotation backlog full ({})", BACKLOG),
            AnnotationError::Stopped => write!(f, "annotation worker stopped"),
        }
    }
}

impl error::Error for AnnotationError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            AnnotationError::Encode(ref e) => Some(e),
            AnnotationError::Http(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for AnnotationError {
    fn from(e: serde_json::Error) -> AnnotationError {
        AnnotationError::Encode(e)
    }
}

impl From<hyper::Error> for AnnotationError {
    fn from(e: hyper::Error) -> AnnotationError {
        AnnotationError::Http(e)
    }
}

/// The outcome of an annotation that may still be in flight. Dropping the
/// handle detaches it.
pub enum AnnotationHandle {
    /// Delivery was handed to a worker, which reports back on this channel.
    Pending(mpsc::Receiver<Result<(), AnnotationError>>),
    /// Delivery already finished, or never started.
    Done(Result<(), AnnotationError>),
}

impl AnnotationHandle {
    /// Block until delivery finishes.
    pub fn wait(self) -> Result<(), AnnotationError> {
        match self {
            AnnotationHandle::Pending(rcv) => match rcv.recv() {
                Ok(res) => res,
                Err(_) => Err(AnnotationError::Stopped),
            },
            AnnotationHandle::Done(res) => res,
        }
    }
}

/// Something annotations can be handed to.
pub trait Annotate: Send + Sync {
    /// Send `annotation` without blocking the caller.
    fn annotate(&self, annotation: Annotation) -> AnnotationHandle;
}

struct Job {
    annotation: Annotation,
    done: mpsc::Sender<Result<(), AnnotationError>>,
}

struct Poster {
    client: Client,
    endpoint: String,
    user: String,
    pass: String,
}

impl Poster {
    fn post(&self, annotation: &Annotation) -> Result<(), AnnotationError> {
        let payload = serde_json::to_string(annotation)?;
        let mut req = self.client
            .post(self.endpoint.as_str())
            .body(payload.as_str())
            .header(ContentType::json());
        if !self.user.is_empty() {
            req = req.header(Authorization(Basic {
                username: self.user.clone(),
                password: Some(self.pass.clone()),
            }));
        }
        let res = req.send()?;
        if res.status.is_success() {
            Ok(())
        } else {
            Err(AnnotationError::Status(res.status.to_u16()))
        }
    }
}

fn work(poster: &Poster, jobs: &Mutex<mpsc::Receiver<Job>>) {
    loop {
        let job = match jobs.lock() {
            Ok(rcv) => rcv.recv(),
            Err(_) => return,
        };
        // every EventAnnotator is gone
        let job = match job {
            Ok(job) => job,
            Err(_) => return,
        };
        let res = poster.post(&job.annotation);
        match res {
            Ok(()) => debug!("annotated graphite: {}", job.annotation.what),
            Err(ref e) => error!(
                "could not annotate graphite with '{}': {}",
                job.annotation.what, e
            ),
        }
        let _ = job.done.send(res);
    }
}

/// POSTs annotations to `<url>/events/` with basic auth.
pub struct EventAnnotator {
    poster: Arc<Poster>,
    jobs: Mutex<mpsc::SyncSender<Job>>,
}

impl fmt::Debug for EventAnnotator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EventAnnotator")
            .field("endpoint", &self.poster.endpoint)
            .field("user", &self.poster.user)
            .finish()
    }
}

impl EventAnnotator {
    /// Create an `EventAnnotator` for `api` and start its workers, or
    /// `None` if no URL is configured. Reads and writes give up after
    /// `timeout`.
    pub fn new(api: &ApiConfig, timeout: Duration) -> Option<EventAnnotator> {
        let url = match api.url {
            Some(ref url) => url,
            None => return None,
        };
        let mut client = Client::new();
        client.set_read_timeout(Some(timeout));
        client.set_write_timeout(Some(timeout));
        let poster = Arc::new(Poster {
            client: client,
            endpoint: format!("{}/events/", url.trim_end_matches('/')),
            user: api.user.clone(),
            pass: api.pass.clone(),
        });

        let (snd, rcv) = mpsc::sync_channel(BACKLOG);
        let rcv = Arc::new(Mutex::new(rcv));
        for i in 0..WORKERS {
            let poster = Arc::clone(&poster);
            let rcv = Arc::clone(&rcv);
            let res = thread::Builder::new()
                .name(format!("graphite-annotate-{}", i))
                .spawn(move || work(&poster, &rcv));
            if let Err(e) = res {
                error!("could not start annotation worker: {}", e);
            }
        }
        Some(EventAnnotator {
            poster: poster,
            jobs: Mutex::new(snd),
        })
    }

    /// The URL annotations are POSTed to.
    pub fn endpoint(&self) -> &str {
        &self.poster.endpoint
    }

    /// POST `annotation` on the calling thread.
    pub fn post(&self, annotation: &Annotation) -> Result<(), AnnotationError> {
        self.poster.post(annotation)
    }
}

impl Annotate for EventAnnotator {
    fn annotate(&self, annotation: Annotation) -> AnnotationHandle {
        let (done, rcv) = mpsc::channel();
        let job = Job {
            annotation: annotation,
            done: done,
        };
        let res = match self.jobs.lock() {
            Ok(jobs) => jobs.try_send(job),
            Err(_) => return AnnotationHandle::Done(Err(AnnotationError::Stopped)),
        };
        match res {
            Ok(()) => AnnotationHandle::Pending(rcv),
            Err(mpsc::TrySendError::Full(job)) => {
                warn!(
                    "dropping graphite annotation '{}': {}",
                    job.annotation.what,
                    AnnotationError::Dropped
                );
                AnnotationHandle::Done(Err(AnnotationError::Dropped))
            }
            Err(mpsc::TrySendError::Disconnected(job)) => {
                error!(
                    "could not annotate graphite with '{}': {}",
                    job.annotation.what,
                    AnnotationError::Stopped
                );
                AnnotationHandle::Done(Err(AnnotationError::Stopped))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::TcpListener;
    use std::time::Instant;

    fn api(url: Option<&str>) -> ApiConfig {
        ApiConfig {
            url: url.map(|u| u.to_string()),
            user: "user".to_string(),
            pass: "pass".to_string(),
        }
    }

    #[test]
    fn no_url_no_annotator() {
        assert!(EventAnnotator::new(&api(None), Duration::from_secs(1)).is_none());
    }

    #[test]
    fn endpoint_appends_events() {
        let a = EventAnnotator::new(&api(Some("http://graphite.example.com")), Duration::from_secs(1))
            .unwrap();
        assert_eq!(a.endpoint(), "http://graphite.example.com/events/");

        let a = EventAnnotator::new(&api(Some("http://graphite.example.com/")), Duration::from_secs(1))
            .unwrap();
        assert_eq!(a.endpoint(), "http://graphite.example.com/events/");
    }

    #[test]
    fn stalled_api_drops_instead_of_piling_up() {
        // accepts connections but never answers them
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let annotator = EventAnnotator::new(&api(Some(url.as_str())), Duration::from_secs(5)).unwrap();
        let annotation = Annotation::new("svc", "svc is down", &[], 1, "timeout");

        let start = Instant::now();
        let mut accepted = 0;
        let mut dropped = 0;
        for _ in 0..500 {
            match annotator.annotate(annotation.clone()) {
                AnnotationHandle::Pending(_) => accepted += 1,
                AnnotationHandle::Done(Err(AnnotationError::Dropped)) => dropped += 1,
                AnnotationHandle::Done(other) => panic!("unexpected result: {:?}", other),
            }
        }
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(accepted <= WORKERS + BACKLOG, "accepted {}", accepted);
        assert_eq!(accepted + dropped, 500);
    }

    #[test]
    fn dropped_handle_reports_stopped() {
        let (snd, rcv) = mpsc::channel();
        drop(snd);
        match AnnotationHandle::Pending(rcv).wait() {
            Err(AnnotationError::Stopped) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn done_handle_yields_result() {
        assert!(AnnotationHandle::Done(Ok(())).wait().is_ok());
        match AnnotationHandle::Done(Err(AnnotationError::Status(500))).wait() {
            Err(AnnotationError::Status(500)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
