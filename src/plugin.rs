//! Maps watchmen host events onto graphite samples and annotations.
//!
//! With `p` the configured prefix followed by the sanitized service name:
//!
//! | event             | samples                                 | annotated if     |
//! |-------------------|-----------------------------------------|------------------|
//! | `service-error`   | `p.time` (no value), `p.status` = 0     | `failedCheck`    |
//! | `service-ok`      | `p.time` = elapsed ms, `p.status` = 1   | never            |
//! | `new-outage`      | `p.outage` = 1                          | `newOutage`      |
//! | `service-back`    | `p.outage_duration` = seconds down      | `serviceBack`    |
//! | `latency-warning` | `p.latency_warning` = elapsed ms        | `latencyWarning` |
//!
//! Samples are always enqueued; the toggles gate annotations only.

use crate::annotate::Annotate;
use crate::config::{Config, EventKind};
use crate::metric::{Annotation, Sample};
use crate::protocols::graphite::sanitize;
use crate::queue::DeliveryQueue;
use crate::time;
use std::sync::Arc;

/// A monitored service as watchmen describes it.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Service {
    /// Human name, also the basis of the metric path.
    pub name: String,
    /// What is checked.
    pub url: String,
    /// The check plugin in use.
    pub ping_service_name: String,
    /// Milliseconds between checks.
    pub failure_interval: u64,
    /// Consecutive failures before an outage is declared.
    pub failures_to_be_outage: u64,
    /// Response time in milliseconds above which a latency warning fires.
    pub warning_threshold: u64,
}

/// An outage record.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Outage {
    /// When the outage began, milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// The error that opened the outage.
    pub error: String,
}

/// Events a watchmen host emits, one variant per kind.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum HostEvent {
    /// A check failed.
    ServiceError {
        /// The service checked.
        service: Service,
        /// What went wrong.
        #[serde(default)]
        error: String,
    },
    /// A check passed.
    ServiceOk {
        /// The service checked.
        service: Service,
        /// Response time in milliseconds.
        #[serde(rename = "elapsedTime")]
        elapsed_time: f64,
    },
    /// A service has failed enough checks to be in outage.
    NewOutage {
        /// The service in outage.
        service: Service,
        /// The outage opened.
        outage: Outage,
    },
    /// A service in outage passed a check.
    ServiceBack {
        /// The service recovered.
        service: Service,
        /// The outage that just closed.
        #[serde(rename = "lastOutage")]
        last_outage: Outage,
    },
    /// A check passed, slowly.
    LatencyWarning {
        /// The service checked.
        service: Service,
        /// Response time in milliseconds.
        #[serde(rename = "elapsedTime")]
        elapsed_time: f64,
    },
}

impl HostEvent {
    /// The service the event is about.
    pub fn service(&self) -> &Service {
        match *self {
            HostEvent::ServiceError { ref service, .. }
            | HostEvent::ServiceOk { ref service, .. }
            | HostEvent::NewOutage { ref service, .. }
            | HostEvent::ServiceBack { ref service, .. }
            | HostEvent::LatencyWarning { ref service, .. } => service,
        }
    }
}

/// Receives host events. Implementations must not block or fail.
pub trait EventHandler {
    /// Handle one event.
    fn on_event(&self, event: &HostEvent);
}

/// Whole seconds from `start_ms` to `now_ms`, never negative.
pub fn outage_duration_secs(start_ms: i64, now_ms: i64) -> i64 {
    let elapsed = now_ms.saturating_sub(start_ms);
    if elapsed < 0 {
        0
    } else {
        elapsed / 1_000
    }
}

/// The graphite plugin: turns every host event into samples on the
/// `DeliveryQueue` and, where toggled on, an annotation.
pub struct GraphitePlugin<A: Annotate> {
    queue: DeliveryQueue,
    annotator: Option<A>,
    config: Arc<Config>,
}

impl<A: Annotate> GraphitePlugin<A> {
    /// Create a `GraphitePlugin`. Without an annotator no annotation is ever
    /// sent, whatever the toggles say.
    pub fn new(queue: DeliveryQueue, annotator: Option<A>, config: Arc<Config>) -> GraphitePlugin<A> {
        GraphitePlugin {
            queue: queue,
            annotator: annotator,
            config: config,
        }
    }

    fn path(&self, name: &str, metric: &str) -> String {
        format!("{}.{}.{}", self.config.metric_prefix, name, metric)
    }

    fn push(&self, name: &str, metric: &str, value: Option<f64>) {
        self.queue.enqueue(Sample::new(self.path(name, metric), value));
    }

    fn annotate(&self, kind: EventKind, name: &str, what: String, data: String) {
        if !self.config.events.enabled(kind) {
            return;
        }
        if let Some(ref annotator) = self.annotator {
            let tags = [kind.tag().to_string()];
            let annotation = Annotation::new(name, what, &tags, time::now(), data);
            // fire and forget, failures are logged by the annotator
            let _ = annotator.annotate(annotation);
        }
    }
}

impl<A: Annotate> EventHandler for GraphitePlugin<A> {
    fn on_event(&self, event: &HostEvent) {
        let service = event.service();
        let name = sanitize(&service.name);
        trace!("host event for {}: {:?}", name, event);
        match *event {
            HostEvent::ServiceError { ref error, .. } => {
                self.push(&name, "time", None);
                self.push(&name, "status", Some(0.0));
                self.annotate(
                    EventKind::FailedCheck,
                    &name,
                    format!("{} failed check", service.name),
                    error.clone(),
                );
            }
            HostEvent::ServiceOk { elapsed_time, .. } => {
                self.push(&name, "time", Some(elapsed_time));
                self.push(&name, "status", Some(1.0));
            }
            HostEvent::NewOutage { ref outage, .. } => {
                self.push(&name, "outage", Some(1.0));
                self.annotate(
                    EventKind::NewOutage,
                    &name,
                    format!("{} is down", service.name),
                    outage.error.clone(),
                );
            }
            HostEvent::ServiceBack { ref last_outage, .. } => {
                let secs = outage_duration_secs(last_outage.timestamp, time::now_ms());
                self.push(&name, "outage_duration", Some(secs as f64));
                self.annotate(
                    EventKind::ServiceBack,
                    &name,
                    format!("{} is back", service.name),
                    format!("down for {} seconds", secs),
                );
            }
            HostEvent::LatencyWarning { elapsed_time, .. } => {
                self.push(&name, "latency_warning", Some(elapsed_time));
                self.annotate(
                    EventKind::LatencyWarning,
                    &name,
                    format!("{} latency warning", service.name),
                    format!(
                        "{} ms exceeds the {} ms threshold",
                        elapsed_time, service.warning_threshold
                    ),
                );
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::annotate::{AnnotationError, AnnotationHandle};
    use crate::queue::OverflowPolicy;
    use std::sync::mpsc;
    use std::sync::Mutex;
    use std::thread;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<Annotation>>,
    }

    impl Annotate for Arc<Recorder> {
        fn annotate(&self, annotation: Annotation) -> AnnotationHandle {
            self.sent.lock().unwrap().push(annotation);
            AnnotationHandle::Done(Ok(()))
        }
    }

    struct Failing;

    impl Annotate for Failing {
        fn annotate(&self, _: Annotation) -> AnnotationHandle {
            AnnotationHandle::Done(Err(AnnotationError::Status(500)))
        }
    }

    struct Panicking;

    impl Annotate for Panicking {
        fn annotate(&self, annotation: Annotation) -> AnnotationHandle {
            let (snd, rcv) = mpsc::channel();
            thread::spawn(move || {
                let _snd = snd;
                panic!("lost annotation '{}'", annotation.what);
            });
            AnnotationHandle::Pending(rcv)
        }
    }

    fn service(name: &str) -> Service {
        Service {
            name: name.to_string(),
            warning_threshold: 500,
            ..Service::default()
        }
    }

    fn config(all_on: bool) -> Config {
        let mut config = Config::default();
        config.host = "localhost".to_string();
        config.events.failed_check = all_on;
        config.events.new_outage = all_on;
        config.events.service_back = all_on;
        config.events.latency_warning = all_on;
        config
    }

    fn setup(all_on: bool) -> (DeliveryQueue, Arc<Recorder>, GraphitePlugin<Arc<Recorder>>) {
        let queue = DeliveryQueue::new(100, OverflowPolicy::DropOldest);
        let recorder = Arc::new(Recorder::default());
        let plugin = GraphitePlugin::new(queue.clone(), Some(recorder.clone()), Arc::new(config(all_on)));
        (queue, recorder, plugin)
    }

    /// Drive every kind of event through a plugin whose annotator always
    /// fails and check the samples come out complete and in order.
    fn samples_survive<A: Annotate>(annotator: A) {
        let queue = DeliveryQueue::new(100, OverflowPolicy::DropOldest);
        let plugin = GraphitePlugin::new(queue.clone(), Some(annotator), Arc::new(config(true)));

        let mut expected = Vec::new();
        for round in 0..3 {
            let elapsed = f64::from(round) * 100.0 + 600.0;
            plugin.on_event(&HostEvent::ServiceError {
                service: service("svc"),
                error: "refused".to_string(),
            });
            plugin.on_event(&HostEvent::NewOutage {
                service: service("svc"),
                outage: Outage::default(),
            });
            plugin.on_event(&HostEvent::ServiceBack {
                service: service("svc"),
                last_outage: Outage {
                    timestamp: time::now_ms(),
                    error: String::new(),
                },
            });
            plugin.on_event(&HostEvent::LatencyWarning {
                service: service("svc"),
                elapsed_time: elapsed,
            });
            plugin.on_event(&HostEvent::ServiceOk {
                service: service("svc"),
                elapsed_time: elapsed,
            });
            expected.extend(vec![
                ("monitor.uptime.svc.time".to_string(), None),
                ("monitor.uptime.svc.status".to_string(), Some(0.0)),
                ("monitor.uptime.svc.outage".to_string(), Some(1.0)),
                ("monitor.uptime.svc.outage_duration".to_string(), Some(0.0)),
                ("monitor.uptime.svc.latency_warning".to_string(), Some(elapsed)),
                ("monitor.uptime.svc.time".to_string(), Some(elapsed)),
                ("monitor.uptime.svc.status".to_string(), Some(1.0)),
            ]);
        }
        assert_eq!(drained(&queue), expected);
        assert_eq!(queue.stats().dropped, 0);
    }

    fn drained(queue: &DeliveryQueue) -> Vec<(String, Option<f64>)> {
        queue
            .dequeue_batch(100)
            .into_iter()
            .map(|s| (s.path().to_string(), s.value()))
            .collect()
    }

    #[test]
    fn service_error_samples() {
        let (queue, recorder, plugin) = setup(true);
        plugin.on_event(&HostEvent::ServiceError {
            service: service("https://api.example.com/health"),
            error: "connection refused".to_string(),
        });
        assert_eq!(
            drained(&queue),
            vec![
                ("monitor.uptime.api_example_com_health.time".to_string(), None),
                ("monitor.uptime.api_example_com_health.status".to_string(), Some(0.0)),
            ]
        );
        let sent = recorder.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].what, "https://api.example.com/health failed check");
        assert_eq!(sent[0].data, "connection refused");
        assert_eq!(
            sent[0].tags,
            vec![
                "watchmen",
                "api_example_com_health",
                "failed_check",
                "api_example_com_health_failed_check",
            ]
        );
    }

    #[test]
    fn service_ok_is_never_annotated() {
        let (queue, recorder, plugin) = setup(true);
        plugin.on_event(&HostEvent::ServiceOk {
            service: service("svc"),
            elapsed_time: 123.0,
        });
        assert_eq!(
            drained(&queue),
            vec![
                ("monitor.uptime.svc.time".to_string(), Some(123.0)),
                ("monitor.uptime.svc.status".to_string(), Some(1.0)),
            ]
        );
        assert!(recorder.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn new_outage_toggled_off_still_enqueues() {
        let (queue, recorder, plugin) = setup(false);
        plugin.on_event(&HostEvent::NewOutage {
            service: service("svc"),
            outage: Outage {
                timestamp: 0,
                error: "timeout".to_string(),
            },
        });
        assert_eq!(
            drained(&queue),
            vec![("monitor.uptime.svc.outage".to_string(), Some(1.0))]
        );
        assert!(recorder.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn toggles_gate_every_annotated_kind() {
        let events = vec![
            HostEvent::ServiceError {
                service: service("svc"),
                error: String::new(),
            },
            HostEvent::NewOutage {
                service: service("svc"),
                outage: Outage::default(),
            },
            HostEvent::ServiceBack {
                service: service("svc"),
                last_outage: Outage::default(),
            },
            HostEvent::LatencyWarning {
                service: service("svc"),
                elapsed_time: 900.0,
            },
        ];
        for on in &[true, false] {
            let (queue, recorder, plugin) = setup(*on);
            for event in &events {
                plugin.on_event(event);
            }
            assert_eq!(queue.len(), 5);
            let expected = if *on { 4 } else { 0 };
            assert_eq!(recorder.sent.lock().unwrap().len(), expected);
        }
    }

    #[test]
    fn no_annotator_never_annotates() {
        let mut config = Config::default();
        config.events.failed_check = true;
        let queue = DeliveryQueue::new(100, OverflowPolicy::DropOldest);
        let plugin: GraphitePlugin<Arc<Recorder>> = GraphitePlugin::new(queue.clone(), None, Arc::new(config));
        plugin.on_event(&HostEvent::ServiceError {
            service: service("svc"),
            error: String::new(),
        });
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn failing_annotator_leaves_samples_alone() {
        samples_survive(Failing);
    }

    #[test]
    fn panicking_annotator_leaves_samples_alone() {
        samples_survive(Panicking);
    }

    #[test]
    fn service_back_reports_seconds() {
        let (queue, recorder, plugin) = setup(true);
        let start = time::now_ms() - 90_000;
        plugin.on_event(&HostEvent::ServiceBack {
            service: service("svc"),
            last_outage: Outage {
                timestamp: start,
                error: String::new(),
            },
        });
        let samples = drained(&queue);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].0, "monitor.uptime.svc.outage_duration");
        let secs = samples[0].1.unwrap();
        assert!(secs >= 90.0 && secs <= 91.0);
        assert_eq!(recorder.sent.lock().unwrap()[0].tags[2], "service_back");
    }

    #[test]
    fn latency_warning_samples() {
        let (queue, _recorder, plugin) = setup(false);
        plugin.on_event(&HostEvent::LatencyWarning {
            service: service("svc"),
            elapsed_time: 812.5,
        });
        assert_eq!(
            drained(&queue),
            vec![("monitor.uptime.svc.latency_warning".to_string(), Some(812.5))]
        );
    }

    #[test]
    fn outage_duration_clamps() {
        assert_eq!(outage_duration_secs(1_000, 61_999), 60);
        assert_eq!(outage_duration_secs(5_000, 1_000), 0);
        assert_eq!(outage_duration_secs(i64::min_value(), i64::max_value()), i64::max_value() / 1_000);
    }

    #[test]
    fn decode_host_events() {
        let ok: HostEvent = serde_json::from_str(
            r#"{"event":"service-ok","service":{"name":"svc","url":"http://svc","pingServiceName":"http","failureInterval":20000,"failuresToBeOutage":2,"warningThreshold":1500},"elapsedTime":42}"#,
        ).unwrap();
        match ok {
            HostEvent::ServiceOk {
                ref service,
                elapsed_time,
            } => {
                assert_eq!(service.name, "svc");
                assert_eq!(service.ping_service_name, "http");
                assert_eq!(service.failures_to_be_outage, 2);
                assert_eq!(service.warning_threshold, 1500);
                assert_eq!(elapsed_time, 42.0);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let back: HostEvent = serde_json::from_str(
            r#"{"event":"service-back","service":{"name":"svc"},"lastOutage":{"timestamp":1500000000000,"error":"x"}}"#,
        ).unwrap();
        assert_eq!(
            back,
            HostEvent::ServiceBack {
                service: service_named("svc"),
                last_outage: Outage {
                    timestamp: 1_500_000_000_000,
                    error: "x".to_string(),
                },
            }
        );

        assert!(serde_json::from_str::<HostEvent>(r#"{"event":"service-gone","service":{}}"#).is_err());
    }

    fn service_named(name: &str) -> Service {
        Service {
            name: name.to_string(),
            ..Service::default()
        }
    }
}
