// src/main.rs
//
// Wiring for the counting engine: configuration, state restore, the
// detection feed, background pushers, and the staleness sweep. The feed is
// JSON lines, one frame per line:
//
//   {"camera_id":"camera1","detections":[{"id":7,"bbox":[100,100,140,260]}]}
//
// read from a file argument or stdin. Upstream capture/inference and the
// message-bus transport live outside this process; this binary is the
// counting boundary.

mod config;
mod events;
mod geometry;
mod line_tracker;
mod persistence;
mod store;
mod types;
mod zone_tracker;

use anyhow::{Context, Result};
use chrono::Utc;
use events::{forward_events, EventSink, LogEventSink};
use persistence::PersistenceHandle;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use store::CounterStore;
use tracing::{info, warn};
use types::{Config, Detection, FrameMessage};

fn main() -> Result<()> {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.yaml".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("[warn] {config_path}: {err:#}; using defaults");
            Config::default()
        }
    };

    let filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| format!("visitor_counter={}", config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("👁  Visitor counting engine starting");

    let state_path = PathBuf::from(&config.persistence.state_path);
    let store = Arc::new(CounterStore::new(config.clone()));
    if let Some(state) = persistence::load_state(&state_path) {
        store.load_state(state);
        if let Some(camera) = store.active_camera() {
            info!(camera = %camera, "active camera restored");
        }
    } else {
        info!("no persisted state at {}; starting fresh", state_path.display());
    }

    let sink: Arc<dyn EventSink> = Arc::new(LogEventSink);
    let persist = PersistenceHandle::spawn(state_path.clone());
    let stop = Arc::new(AtomicBool::new(false));

    let pushers = spawn_background_tasks(&config, Arc::clone(&store), Arc::clone(&stop));

    let feed_arg = std::env::args().nth(2);
    let result = run_feed(feed_arg.as_deref(), &config, &store, sink.as_ref(), &persist);

    stop.store(true, Ordering::SeqCst);
    for handle in pushers {
        let _ = handle.join();
    }

    // Final synchronous snapshot so a clean shutdown never loses counts.
    if let Err(err) = persistence::save_state(&state_path, &store.export_state()) {
        warn!("final state save failed: {err:#}");
    }

    result
}

/// Periodic count pusher and cleanup sweep, the low-frequency collaborators
/// that share the store with the camera workers.
fn spawn_background_tasks(
    config: &Config,
    store: Arc<CounterStore>,
    stop: Arc<AtomicBool>,
) -> Vec<std::thread::JoinHandle<()>> {
    let mut handles = Vec::new();

    let push_interval = Duration::from_secs_f64(config.feed.counts_push_interval_secs.max(0.5));
    let push_store = Arc::clone(&store);
    let push_stop = Arc::clone(&stop);
    handles.push(
        std::thread::Builder::new()
            .name("counts-pusher".to_string())
            .spawn(move || {
                info!("counts pusher started");
                while !push_stop.load(Ordering::SeqCst) {
                    std::thread::sleep(push_interval);
                    for camera_id in push_store.camera_ids() {
                        let Some(summary) = push_store.get_camera_summary(&camera_id) else {
                            continue;
                        };
                        for (zone, counts) in &summary.zones {
                            info!(
                                camera = %camera_id, zone = %zone,
                                in_count = counts.in_count, out_count = counts.out_count,
                                occupancy = counts.occupancy, "zone counts"
                            );
                        }
                        for (line, counts) in &summary.lines {
                            info!(
                                camera = %camera_id, line = %line,
                                in_count = counts.in_count, out_count = counts.out_count,
                                "line counts"
                            );
                        }
                    }
                }
            })
            .expect("spawning counts pusher"),
    );

    let sweep_stop = stop;
    handles.push(
        std::thread::Builder::new()
            .name("cleanup-sweep".to_string())
            .spawn(move || {
                while !sweep_stop.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_secs(1));
                    // Rate limiting lives in the store; polling is cheap.
                    store.maybe_sweep(Utc::now());
                }
            })
            .expect("spawning cleanup sweep"),
    );

    handles
}

fn run_feed(
    feed_arg: Option<&str>,
    config: &Config,
    store: &CounterStore,
    sink: &dyn EventSink,
    persist: &PersistenceHandle,
) -> Result<()> {
    let reader: Box<dyn BufRead> = match feed_arg {
        None | Some("-") => {
            info!("reading detection frames from stdin");
            Box::new(BufReader::new(io::stdin()))
        }
        Some(path) => {
            info!("reading detection frames from {path}");
            Box::new(BufReader::new(
                File::open(Path::new(path)).with_context(|| format!("opening feed {path}"))?,
            ))
        }
    };

    let mut frames = 0u64;
    for line in reader.lines() {
        let line = line.context("reading feed line")?;
        if line.trim().is_empty() {
            continue;
        }

        let message: FrameMessage = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(err) => {
                warn!("skipping malformed frame: {err}");
                continue;
            }
        };

        // Malformed individual detections are dropped, not the whole frame.
        let mut detections: Vec<Detection> = Vec::with_capacity(message.detections.len());
        for value in message.detections {
            match serde_json::from_value(value) {
                Ok(detection) => detections.push(detection),
                Err(err) => {
                    warn!(camera = %message.camera_id, "skipping malformed detection: {err}");
                }
            }
        }

        let events = store.update_counts(
            &message.camera_id,
            &detections,
            config.feed.position_method,
            Utc::now(),
        );
        // Side effects stay outside the store lock.
        if !events.is_empty() {
            forward_events(sink, &events);
            persist.schedule(store.export_state());
        }

        frames += 1;
        if frames % 1000 == 0 {
            info!(frames, "feed progress");
        }
    }

    info!(frames, "feed finished");
    Ok(())
}
