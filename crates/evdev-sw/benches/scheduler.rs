//! Scheduler throughput benchmarks
//!
//! One producer port feeds a queue, worker ports drain and release. Each
//! iteration pushes a batch through a full schedule cycle on one thread.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use evdev_sw::{DevConfig, Event, EventDev, PortConf, PortHandle, QueueConf, RuntimeParams};

const WORKERS: u8 = 4;
const BATCH: usize = 64;

fn setup(queue: QueueConf) -> (EventDev, PortHandle, Vec<PortHandle>) {
    let mut dev = EventDev::new("bench", RuntimeParams::default()).unwrap();
    dev.configure(DevConfig {
        nb_event_queues: 1,
        nb_event_ports: WORKERS + 1,
        ..Default::default()
    })
    .unwrap();
    dev.queue_setup(0, queue).unwrap();
    let worker = PortConf {
        dequeue_depth: 128,
        ..Default::default()
    };
    for p in 0..WORKERS {
        dev.port_setup(p, worker.clone()).unwrap();
        dev.port_link(p, &[0], &[]).unwrap();
    }
    dev.port_setup(WORKERS, PortConf::default()).unwrap();
    dev.start().unwrap();

    let workers = (0..WORKERS).map(|p| dev.port(p).unwrap()).collect();
    let producer = dev.port(WORKERS).unwrap();
    (dev, producer, workers)
}

fn bench_schedule(c: &mut Criterion) {
    let mut group = c.benchmark_group("schedule");
    group.throughput(Throughput::Elements(BATCH as u64));

    let queues = [
        ("atomic", QueueConf::atomic()),
        ("ordered", QueueConf::ordered(1024)),
        ("parallel", QueueConf::parallel()),
    ];
    for (name, queue) in queues {
        let (mut dev, mut producer, mut workers) = setup(queue);
        let events: Vec<Event> = (0..BATCH as u64)
            .map(|i| Event::new(0, (i % 16) as u32, i))
            .collect();
        let mut out = vec![Event::default(); 128];

        group.bench_function(BenchmarkId::from_parameter(name), |b| {
            b.iter(|| {
                let mut sent = 0;
                let mut received = 0;
                while received < BATCH {
                    if sent < BATCH {
                        sent += producer.enqueue_new_burst(&events[sent..]);
                    }
                    black_box(dev.schedule().unwrap());
                    for w in workers.iter_mut() {
                        // Implicit release on the next dequeue completes the previous burst
                        received += w.dequeue_burst(&mut out);
                    }
                }
            })
        });
    }
    group.finish();
}

fn bench_idle_pass(c: &mut Criterion) {
    let (mut dev, _producer, _workers) = setup(QueueConf::atomic());
    c.bench_function("schedule_idle", |b| b.iter(|| black_box(dev.schedule().unwrap())));
}

criterion_group!(benches, bench_schedule, bench_idle_pass);
criterion_main!(benches);
