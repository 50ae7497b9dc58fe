//! Exercises the genuinely multi-process scenarios (coordination happens entirely through named
//! semaphores, shared memory, and file locks, none of which can be faithfully stood in for by
//! threads within one process). Each test re-invokes its own test binary as a child process,
//! filtered down to itself via `--exact`, with an environment variable telling that child
//! invocation to act as the worker instead of re-spawning again.

use std::env;
use std::process::Command;
use std::time::Duration;

use diskqueue::Queue;
use tempfile::TempDir;

const PRODUCE_ROLE: &str = "DISKQUEUE_IT_PRODUCE";
const QUEUE_NAME_ENV: &str = "DISKQUEUE_IT_QUEUE_NAME";
const PAYLOAD_ENV: &str = "DISKQUEUE_IT_PAYLOAD";

fn spawn_self(test_name: &str, env_vars: &[(&str, &str)]) -> std::process::ExitStatus {
    let exe = env::current_exe().expect("test binary path");
    let mut cmd = Command::new(exe);
    cmd.arg(test_name).arg("--exact").arg("--nocapture");
    for (key, value) in env_vars {
        cmd.env(key, value);
    }
    cmd.status().expect("failed to spawn child test process")
}

// Scenario: a record `put` in one process is `get`-able from a second, independently-opened
// process, with no in-process state shared between them beyond the queue's on-disk name.
#[test]
fn put_in_one_process_is_visible_to_get_in_another() {
    if env::var(PRODUCE_ROLE).is_ok() {
        let name = env::var(QUEUE_NAME_ENV).expect("queue name must be set for the producer role");
        let payload = env::var(PAYLOAD_ENV).expect("payload must be set for the producer role");
        let mut queue = Queue::open(&name).expect("producer failed to open queue");
        queue.put(payload.as_bytes()).expect("producer failed to put");
        return;
    }

    let dir = TempDir::new().unwrap();
    let name = dir.path().join("cross-process").to_string_lossy().into_owned();

    let status = spawn_self(
        "put_in_one_process_is_visible_to_get_in_another",
        &[(PRODUCE_ROLE, "1"), (QUEUE_NAME_ENV, &name), (PAYLOAD_ENV, "X")],
    );
    assert!(status.success(), "producer subprocess failed: {status:?}");

    let mut queue = Queue::open(&name).unwrap();
    let payload = queue
        .get(Some(Duration::from_secs(5)))
        .unwrap()
        .expect("record produced by the other process should be visible here");
    assert_eq!(payload, b"X");
}

// Scenario: a producer process puts a record and exits without ever calling `get`; the record is
// durable (the write itself fsyncs) and a fresh process started afterward can still retrieve it.
// Nothing about recovery here depends on the producing process having shut down cleanly — the
// pending-item semaphore and bucket file both outlive the process that created them.
#[test]
fn record_put_by_a_process_that_never_reads_it_is_recovered_by_a_later_process() {
    if env::var(PRODUCE_ROLE).is_ok() {
        let name = env::var(QUEUE_NAME_ENV).expect("queue name must be set for the producer role");
        let payload = env::var(PAYLOAD_ENV).expect("payload must be set for the producer role");
        let mut queue = Queue::open(&name).expect("producer failed to open queue");
        queue.put(payload.as_bytes()).expect("producer failed to put");
        // Exit immediately without calling get, simulating a producer that crashes (or simply
        // finishes its own work) before any consumer in its own process ever runs.
        std::process::exit(0);
    }

    let dir = TempDir::new().unwrap();
    let name = dir.path().join("crash-recovery").to_string_lossy().into_owned();

    let status = spawn_self(
        "record_put_by_a_process_that_never_reads_it_is_recovered_by_a_later_process",
        &[(PRODUCE_ROLE, "1"), (QUEUE_NAME_ENV, &name), (PAYLOAD_ENV, "M")],
    );
    assert!(status.success(), "producer subprocess failed: {status:?}");

    let mut queue = Queue::open(&name).unwrap();
    let payload = queue
        .get(Some(Duration::from_secs(5)))
        .unwrap()
        .expect("a fresh process must still be able to recover a record its producer never read");
    assert_eq!(payload, b"M");
}

// Scenario: several producer processes and several consumer processes run concurrently against
// the same queue name; every record put is eventually seen by exactly one consumer, none lost,
// none duplicated.
#[test]
fn many_producer_processes_and_many_consumer_processes_exchange_every_record_exactly_once() {
    const PRODUCERS: usize = 3;
    const RECORDS_PER_PRODUCER: usize = 5;
    const CONSUMERS: usize = 3;

    if let Ok(index) = env::var("DISKQUEUE_IT_PRODUCER_INDEX") {
        let name = env::var(QUEUE_NAME_ENV).unwrap();
        let mut queue = Queue::open(&name).unwrap();
        for i in 0..RECORDS_PER_PRODUCER {
            queue.put(format!("p{index}-r{i}").as_bytes()).unwrap();
        }
        return;
    }
    if env::var("DISKQUEUE_IT_CONSUMER").is_ok() {
        let name = env::var(QUEUE_NAME_ENV).unwrap();
        let out_path = env::var("DISKQUEUE_IT_OUT").unwrap();
        let mut queue = Queue::open(&name).unwrap();
        let mut lines = Vec::new();
        while let Some(payload) = queue.get(Some(Duration::from_millis(500))).unwrap() {
            lines.push(String::from_utf8(payload).unwrap());
        }
        std::fs::write(out_path, lines.join("\n")).unwrap();
        return;
    }

    let dir = TempDir::new().unwrap();
    let name = dir.path().join("fan-out").to_string_lossy().into_owned();

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|i| {
            let exe = env::current_exe().unwrap();
            Command::new(exe)
                .arg("many_producer_processes_and_many_consumer_processes_exchange_every_record_exactly_once")
                .arg("--exact")
                .arg("--nocapture")
                .env("DISKQUEUE_IT_PRODUCER_INDEX", i.to_string())
                .env(QUEUE_NAME_ENV, &name)
                .spawn()
                .unwrap()
        })
        .collect();
    for mut child in producers {
        assert!(child.wait().unwrap().success());
    }

    let out_files: Vec<_> = (0..CONSUMERS).map(|i| dir.path().join(format!("out-{i}.txt"))).collect();
    let consumers: Vec<_> = out_files
        .iter()
        .map(|out_path| {
            let exe = env::current_exe().unwrap();
            Command::new(exe)
                .arg("many_producer_processes_and_many_consumer_processes_exchange_every_record_exactly_once")
                .arg("--exact")
                .arg("--nocapture")
                .env("DISKQUEUE_IT_CONSUMER", "1")
                .env(QUEUE_NAME_ENV, &name)
                .env("DISKQUEUE_IT_OUT", out_path)
                .spawn()
                .unwrap()
        })
        .collect();
    for mut child in consumers {
        assert!(child.wait().unwrap().success());
    }

    let mut received = Vec::new();
    for out_path in &out_files {
        let contents = std::fs::read_to_string(out_path).unwrap();
        received.extend(contents.lines().filter(|l| !l.is_empty()).map(|l| l.to_string()));
    }
    received.sort();

    let mut expected: Vec<String> = (0..PRODUCERS)
        .flat_map(|p| (0..RECORDS_PER_PRODUCER).map(move |r| format!("p{p}-r{r}")))
        .collect();
    expected.sort();

    assert_eq!(received, expected, "every record from every producer must be seen exactly once across all consumers");
}
