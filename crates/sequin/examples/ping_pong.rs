//! Two scheduler threads playing ping-pong.
//!
//! Every volley posts the next hop to the peer thread, so each hop
//! crosses threads through the ingress queue and wakes the peer's pump.
//! Prints round-trip throughput at the end.
//!
//! Run with:
//!   cargo run -p sequin --example ping_pong --release
//!
//! Set RUST_LOG=sequin=trace to watch the individual wakeups.

use crossbeam::channel::{self, Sender};
use sequin::{LoopThread, TaskRunner};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

const VOLLEYS: u32 = 10_000;

fn volley(to: TaskRunner, from: TaskRunner, remaining: u32, done: Sender<()>, hops: Arc<AtomicUsize>) {
    let poster = to.clone();
    poster.post(move || {
        hops.fetch_add(1, Ordering::Relaxed);
        if remaining == 0 {
            let _ = done.send(());
        } else {
            volley(from, to, remaining - 1, done, hops);
        }
    });
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let ping = LoopThread::spawn("ping").expect("failed to spawn ping thread");
    let pong = LoopThread::spawn("pong").expect("failed to spawn pong thread");

    println!("rallying {VOLLEYS} volleys between {:?} and {:?}...", ping.name(), pong.name());

    let (tx, rx) = channel::bounded(1);
    let hops = Arc::new(AtomicUsize::new(0));
    let started = Instant::now();
    volley(
        ping.task_runner(),
        pong.task_runner(),
        VOLLEYS,
        tx,
        Arc::clone(&hops),
    );
    rx.recv().expect("rally never finished");
    let elapsed = started.elapsed();

    let total = hops.load(Ordering::Relaxed);
    println!(
        "{} hops in {:.2?} ({:.0} hops/sec)",
        total,
        elapsed,
        total as f64 / elapsed.as_secs_f64()
    );

    // A delayed farewell shows the timer path before the threads drain
    // and join on drop.
    let (tx, rx) = channel::bounded(1);
    ping.task_runner().post_delayed(
        move || {
            println!("...and one delayed farewell from the ping thread");
            let _ = tx.send(());
        },
        Duration::from_millis(50),
    );
    let _ = rx.recv();
}
