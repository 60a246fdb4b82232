#![allow(unknown_lints)]

#[macro_use]
extern crate log;

use chrono::Utc;
use std::cmp;
use std::io;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use watchmen_graphite::annotate::{self, EventAnnotator};
use watchmen_graphite::config;
use watchmen_graphite::plugin::GraphitePlugin;
use watchmen_graphite::queue::DeliveryQueue;
use watchmen_graphite::sink::{ConnectionManager, Flusher, TcpConnector};
use watchmen_graphite::source::{JsonLines, Source};

const VERSION: Option<&'static str> = option_env!("CARGO_PKG_VERSION");

fn main() {
    // must happen before any thread is spawned so every thread inherits the
    // signal mask
    let signal = chan_signal::notify(&[chan_signal::Signal::INT, chan_signal::Signal::TERM]);

    let args = config::parse_args();

    let level = match args.verbose {
        0 => log::LevelFilter::Error,
        1 => log::LevelFilter::Warn,
        2 => log::LevelFilter::Info,
        3 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}][{}] {}",
                record.module_path().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                Utc::now().to_rfc3339(),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(io::stdout())
        .apply()
        .expect("could not set up logging");

    let config = match config::load(&args) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };

    info!(
        "watchmen-graphite - {} shipping to {}:{}",
        VERSION.unwrap_or("unknown"),
        config.host,
        config.port
    );

    let queue = DeliveryQueue::new(config.queue_size_limit, config.overflow_policy);
    info!(
        "queueing up to {} samples, {} when full",
        queue.capacity(),
        queue.policy()
    );
    let connection = ConnectionManager::new(TcpConnector::new(&config), &config);
    let flusher = match Flusher::new(queue.clone(), connection, &config).spawn() {
        Ok(handle) => handle,
        Err(e) => {
            error!("could not start the flusher: {}", e);
            process::exit(1);
        }
    };

    let annotator = EventAnnotator::new(
        &config.api,
        cmp::min(config.socket_timeout, annotate::DEFAULT_TIMEOUT),
    );
    if let Some(ref annotator) = annotator {
        info!("annotating events at {}", annotator.endpoint());
    }
    let plugin = GraphitePlugin::new(queue.clone(), annotator, Arc::clone(&config));

    let (stop_snd, stop_rcv) = mpsc::channel();
    let source_shutdown = Arc::new(AtomicBool::new(false));

    let source_stop = stop_snd.clone();
    let flag = Arc::clone(&source_shutdown);
    let source = thread::Builder::new()
        .name("host-events".to_string())
        .spawn(move || {
            let stdin = io::stdin();
            JsonLines::new(stdin.lock(), plugin, flag).run();
            let _ = source_stop.send("end of input");
        });
    if let Err(e) = source {
        error!("could not start the host event source: {}", e);
        process::exit(1);
    }

    thread::spawn(move || {
        if signal.recv().is_some() {
            let _ = stop_snd.send("signal");
        }
    });

    let reason = stop_rcv.recv().unwrap_or("all senders gone");
    info!("shutting down on {}", reason);
    source_shutdown.store(true, Ordering::Relaxed);

    let stats = flusher.shutdown();
    let queue_stats = queue.stats();
    info!(
        "delivered {} samples in {} batches, skipped {}, {} write failures, {} dropped",
        stats.delivered, stats.batches, stats.skipped, stats.write_failures, queue_stats.dropped
    );
}
