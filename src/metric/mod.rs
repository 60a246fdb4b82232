//! The two kinds of data this crate ships to graphite.
//!
//! A `Sample` is one point of a time-series, bound for the plaintext metric
//! stream. An `Annotation` is a discrete, tagged note bound for graphite-web's
//! events API.

mod annotation;

pub use self::annotation::{expand_tags, Annotation};

use crate::time;

/// One (path, value, timestamp) point destined for graphite.
///
/// A `Sample` is immutable once built. A `value` of `None` means "no
/// measurement": the sample is carried through the queue like any other but
/// the encoder never puts it on the wire.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    path: String,
    value: Option<f64>,
    timestamp: i64,
}

impl Sample {
    /// Create a `Sample` stamped with the current time.
    pub fn new<S>(path: S, value: Option<f64>) -> Sample
    where
        S: Into<String>,
    {
        Sample::at(path, value, time::now())
    }

    /// Create a `Sample` with an explicit timestamp, in seconds since the Unix
    /// epoch.
    pub fn at<S>(path: S, value: Option<f64>, timestamp: i64) -> Sample
    where
        S: Into<String>,
    {
        Sample {
            path: path.into(),
            value: value,
            timestamp: timestamp,
        }
    }

    /// The dotted metric path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The measured value, if there is one.
    pub fn value(&self) -> Option<f64> {
        self.value
    }

    /// Seconds since the Unix epoch.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }
}
