//! End-to-end scenarios driving the real supervisor and actor binaries.

pub mod common;

use std::time::Duration;

use common::{actors_bin, NexusHandle};

const READY_WAIT: Duration = Duration::from_secs(15);
const EXIT_WAIT: Duration = Duration::from_secs(20);

#[test]
fn minimal_two_stage_pipeline_sums_to_5050() {
    let config = format!(
        r#"
settings:
  store_backend: inproc
  store_size: 10000000

actors:
  Acquirer:
    package: {bin}
    classname: Generator
    options:
      count: 100
  Analysis:
    package: {bin}
    classname: Accumulator

connections:
  Acquirer.q_out: [Analysis.q_in]
"#,
        bin = actors_bin()
    );

    let mut nexus = NexusHandle::start("minimal", &config);
    assert_eq!(nexus.command("setup"), "Awaiting input:");
    nexus.expect_output("All actors ready", READY_WAIT);

    assert_eq!(nexus.command("run"), "Awaiting input:");
    std::thread::sleep(Duration::from_secs(2));

    nexus.command("stop");
    nexus.expect_output_all(
        &["Analysis: sum: 5050", "All stops were successful"],
        READY_WAIT,
    );

    nexus.command("quit");
    nexus.expect_output("QUIT", READY_WAIT);
    assert_eq!(nexus.wait_exit(EXIT_WAIT), 0);
}

#[test]
fn fan_out_delivers_everything_to_both_sinks() {
    let config = format!(
        r#"
actors:
  Source:
    package: {bin}
    classname: Generator
    options:
      count: 10
  Left:
    package: {bin}
    classname: Accumulator
  Right:
    package: {bin}
    classname: Accumulator

connections:
  Source.q_out: [Left.q_in, Right.q_in]
"#,
        bin = actors_bin()
    );

    let mut nexus = NexusHandle::start("fanout", &config);
    nexus.command("setup");
    nexus.expect_output("All actors ready", READY_WAIT);
    nexus.command("run");
    std::thread::sleep(Duration::from_secs(1));

    nexus.command("stop");
    nexus.expect_output_all(&["Left: sum: 55", "Right: sum: 55"], READY_WAIT);

    nexus.command("quit");
    assert_eq!(nexus.wait_exit(EXIT_WAIT), 0);
}

#[test]
fn dead_actors_block_run_until_revived() {
    let config = format!(
        r#"
actors:
  Flaky:
    package: {bin}
    classname: Flaky
    options:
      fail_after: 3
"#,
        bin = actors_bin()
    );

    let mut nexus = NexusHandle::start("revive", &config);
    nexus.command("setup");
    nexus.expect_output("All actors ready", READY_WAIT);
    nexus.command("run");
    nexus.expect_output("Flaky exited with code 9", READY_WAIT);

    // a dead actor gates the pipeline
    nexus.command("run");
    nexus.expect_output("Not all actors ready yet", READY_WAIT);

    // revive rebuilds the process and re-runs it
    nexus.command("revive");
    nexus.expect_output_all(&["Revived Flaky", "All actors ready"], READY_WAIT);
    nexus.expect_output("Flaky exited with code 9", READY_WAIT);

    nexus.command("quit");
    assert_eq!(nexus.wait_exit(EXIT_WAIT), 0);
}

#[test]
fn hot_shutdown_under_load_stays_bounded() {
    let config = format!(
        r#"
actors:
  Fast:
    package: {bin}
    classname: Generator
    options:
      count: 1000000
      delay_ms: 1
  Slow:
    package: {bin}
    classname: Accumulator
    options:
      delay_ms: 10

connections:
  Fast.q_out: [Slow.q_in]

links:
  Fast.q_out:
    capacity: 8
"#,
        bin = actors_bin()
    );

    let mut nexus = NexusHandle::start("hot-shutdown", &config);
    nexus.command("setup");
    nexus.expect_output("All actors ready", READY_WAIT);
    nexus.command("run");
    std::thread::sleep(Duration::from_millis(500));

    // quit while the producer is wedged against the full link
    nexus.command("quit");
    nexus.expect_output("QUIT", READY_WAIT);
    let workdir = nexus.workdir.clone();
    assert_eq!(nexus.wait_exit(EXIT_WAIT), 0);

    // no persistence was configured, so nothing may be left behind
    assert!(!workdir.join("appendonlydir").exists());
}

#[test]
fn external_store_persists_across_runs() {
    let config = format!(
        r#"
settings:
  store_backend: external
  redis_saving_enabled: true
  redis_fsync_frequency: every_write
  redis_aof_dirname: custom_aof_dirname

actors:
  Acquirer:
    package: {bin}
    classname: Generator
    options:
      count: 5
  Analysis:
    package: {bin}
    classname: Accumulator

connections:
  Acquirer.q_out: [Analysis.q_in]
"#,
        bin = actors_bin()
    );

    let mut nexus = NexusHandle::start("persistence", &config);
    nexus.command("setup");
    nexus.expect_output("All actors ready", READY_WAIT);
    nexus.command("run");
    std::thread::sleep(Duration::from_secs(1));
    nexus.command("quit");
    let workdir = nexus.workdir.clone();
    assert_eq!(nexus.wait_exit(EXIT_WAIT), 0);

    let log = workdir.join("custom_aof_dirname").join("appendonly.log");
    assert!(log.exists());
    let written = std::fs::metadata(&log).unwrap().len();
    assert!(written > 0, "append-only log is empty");

    // a second run over the same directory replays the log and keeps
    // serving; the payloads survive the restart
    let mut second = NexusHandle::start_in(workdir.clone(), &config);
    second.command("setup");
    second.expect_output("All actors ready", READY_WAIT);
    second.command("quit");
    assert_eq!(second.wait_exit(EXIT_WAIT), 0);
    assert!(std::fs::metadata(&log).unwrap().len() >= written);
}

#[test]
fn the_watcher_records_what_flows() {
    let config = format!(
        r#"
settings:
  use_watcher: [Acquirer]

actors:
  Acquirer:
    package: {bin}
    classname: Generator
    options:
      count: 5
  Analysis:
    package: {bin}
    classname: Accumulator

connections:
  Acquirer.q_out: [Analysis.q_in]
"#,
        bin = actors_bin()
    );

    let mut nexus = NexusHandle::start("watcher", &config);
    nexus.command("setup");
    nexus.expect_output("All actors ready", READY_WAIT);
    nexus.command("run");
    std::thread::sleep(Duration::from_secs(1));
    nexus.command("stop");
    nexus.expect_output("All stops were successful", READY_WAIT);
    nexus.command("quit");
    let workdir = nexus.workdir.clone();
    assert_eq!(nexus.wait_exit(EXIT_WAIT), 0);

    let snapshots = workdir.join("watch").join("Acquirer.jsonl");
    assert!(snapshots.exists());
    assert!(std::fs::metadata(&snapshots).unwrap().len() > 0);
}

#[test]
fn auto_allocated_ports_are_reported_and_usable() {
    let config = format!(
        r#"
actors:
  Acquirer:
    package: {bin}
    classname: Generator
"#,
        bin = actors_bin()
    );

    let mut nexus = NexusHandle::start("ports", &config);
    assert_ne!(nexus.control_port, 0);
    assert_ne!(nexus.output_port, 0);
    assert_ne!(nexus.control_port, nexus.output_port);

    // the reported control port answers commands
    assert_eq!(nexus.command("ready"), "Awaiting input:");
    nexus.expect_output("Waiting for: Acquirer", READY_WAIT);

    assert_eq!(nexus.command("bogus"), "Awaiting input:");
    nexus.expect_output("Unknown command", READY_WAIT);

    nexus.command("quit");
    assert_eq!(nexus.wait_exit(EXIT_WAIT), 0);
}
