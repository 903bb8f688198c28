//! Three-stage pipeline on the software event device
//!
//! ```text
//! producer ──► Q0 (atomic, per-flow) ──► workers ──► Q1 (ordered) ──► workers ──► Q2 (single link) ──► sink
//! ```
//!
//! Run with `RUST_LOG=debug cargo run --example pipeline` for scheduler logs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use evdev_sw::{
    DevConfig, Event, EventDev, EventDevResult, PortConf, QueueConf, RuntimeParams,
    SchedulerService,
};
use tracing_subscriber::EnvFilter;

const WORKERS: u8 = 3;
const EVENTS: u64 = 100_000;
const FLOWS: u32 = 64;

fn main() -> EventDevResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut dev = EventDev::with_params("pipeline", "sched_quanta=256,credit_quanta=64")?;
    dev.configure(DevConfig {
        nb_event_queues: 3,
        nb_event_ports: WORKERS + 2,
        ..Default::default()
    })?;
    dev.queue_setup(0, QueueConf::atomic())?;
    dev.queue_setup(1, QueueConf::ordered(1024))?;
    dev.queue_setup(2, QueueConf::single_link())?;

    let worker_conf = PortConf {
        dequeue_depth: 32,
        ..Default::default()
    };
    for p in 0..WORKERS {
        dev.port_setup(p, worker_conf.clone())?;
        dev.port_link(p, &[0, 1], &[])?;
    }
    let producer_id = WORKERS;
    let sink_id = WORKERS + 1;
    dev.port_setup(producer_id, PortConf::default())?;
    dev.port_setup(sink_id, PortConf { dequeue_depth: 128, ..Default::default() })?;
    dev.port_link(sink_id, &[2], &[])?;
    dev.start()?;

    let mut producer = dev.port(producer_id)?;
    let mut sink = dev.port(sink_id)?;
    let workers: Vec<_> = (0..WORKERS).map(|p| dev.port(p)).collect::<Result<_, _>>()?;
    let service = SchedulerService::spawn(dev)?;
    let done = Arc::new(AtomicBool::new(false));
    let started = Instant::now();

    let worker_threads: Vec<_> = workers
        .into_iter()
        .map(|mut port| {
            let done = done.clone();
            thread::spawn(move || {
                let mut buf = [Event::default(); 32];
                let mut handled = 0u64;
                while !done.load(Ordering::Relaxed) {
                    let n = port.dequeue_burst_timeout(&mut buf, Duration::from_micros(100));
                    let next: Vec<Event> = buf[..n]
                        .iter()
                        .map(|ev| ev.forward(ev.queue_id + 1))
                        .collect();
                    let mut sent = 0;
                    while sent < next.len() {
                        sent += port.enqueue_forward_burst(&next[sent..]);
                    }
                    handled += n as u64;
                }
                handled
            })
        })
        .collect();

    let producer_thread = thread::spawn(move || {
        let mut seq = 0u64;
        while seq < EVENTS {
            let burst: Vec<Event> = (seq..(seq + 32).min(EVENTS))
                .map(|i| Event::new(0, (i % FLOWS as u64) as u32, i))
                .collect();
            let n = producer.enqueue_new_burst(&burst);
            if n == 0 {
                thread::yield_now();
            }
            seq += n as u64;
        }
    });

    let mut buf = [Event::default(); 128];
    let mut received = 0u64;
    let mut last = None;
    let mut out_of_order = 0u64;
    while received < EVENTS {
        let n = sink.dequeue_burst_timeout(&mut buf, Duration::from_millis(1));
        for ev in &buf[..n] {
            if last.is_some_and(|l| ev.payload < l) {
                out_of_order += 1;
            }
            last = Some(ev.payload);
        }
        received += n as u64;
    }
    let elapsed = started.elapsed();

    done.store(true, Ordering::Relaxed);
    let _ = producer_thread.join();
    let handled: Vec<u64> = worker_threads
        .into_iter()
        .map(|t| t.join().unwrap_or(0))
        .collect();

    let stats = service.stats()?;
    tracing::info!(
        events = received,
        ?elapsed,
        mevents_per_sec = received as f64 / elapsed.as_secs_f64() / 1e6,
        out_of_order,
        ?handled,
        "pipeline drained"
    );
    for q in &stats.queues {
        tracing::info!(queue = q.id, sched_type = %q.sched_type, tx = q.tx_pkts, "queue");
    }

    drop(sink);
    let mut dev = service.stop()?;
    println!("{}", dev.dump());
    dev.stop();
    Ok(())
}
