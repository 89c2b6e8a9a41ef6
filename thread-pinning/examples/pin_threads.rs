//! Spawns a few parked threads, pins them with an explicit vector and with
//! each strategy, and prints the affinity the OS reports back.
//!
//! Run with `RUST_LOG=debug` to see the topology summary and every pin call.

use {
    agave_thread_pinning::{
        thread_affinity, Environ, PinReport, PinStrategy, PinningConfig, PinningError,
        ThreadHandle, ThreadPinning,
    },
    std::thread,
};

const THREAD_COUNT: usize = 5;

fn print_report(handles: &[ThreadHandle], report: &PinReport) {
    for (i, handle) in handles.iter().enumerate() {
        match thread_affinity(*handle) {
            Ok(cpus) => println!(
                "  thread {i}: requested CPU {:?}, affinity {cpus:?}",
                report.assignment.get(i)
            ),
            Err(err) => println!("  thread {i}: failed to read affinity: {err}"),
        }
    }
    for failure in report.failures() {
        println!(
            "  thread {} could not be pinned to CPU {}: {}",
            failure.thread_index, failure.cpu, failure.error
        );
    }
}

fn main() -> Result<(), PinningError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let workers: Vec<_> = (0..THREAD_COUNT)
        .map(|id| {
            thread::spawn(move || {
                println!("Thread started with ID: {id}");
                thread::park();
            })
        })
        .collect();
    let handles: Vec<ThreadHandle> = workers.iter().map(ThreadHandle::from).collect();

    let pinning = ThreadPinning::new();
    let topology = pinning.topology();
    println!(
        "{} logical CPUs, {} physical cores, {} LLC groups",
        topology.active_processors(),
        topology.physical_core_count(),
        topology.cache_group_count()
    );

    let custom: Vec<usize> = [0, 5, 2, 10, 4]
        .into_iter()
        .map(|cpu| cpu % topology.active_processors())
        .collect();
    println!("Pinning threads using custom vector {custom:?}");
    let report = pinning.pin_threads_custom(&handles, &custom)?;
    print_report(&handles, &report);

    for strategy in PinStrategy::ALL {
        println!("Pinning threads using {strategy} strategy");
        let report = pinning.pin_threads(&handles, strategy)?;
        print_report(&handles, &report);
    }

    let config = PinningConfig::from_env(Environ::global())?;
    println!("Pinning threads using environment config {config:?}");
    let report = pinning.pin_threads_with_config(&handles, &config)?;
    print_report(&handles, &report);

    for worker in workers {
        worker.thread().unpark();
        let _ = worker.join();
    }
    Ok(())
}
