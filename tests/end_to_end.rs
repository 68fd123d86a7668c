use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tempfile::tempdir;
use wintime::inject::agent_file_name;
use wintime::launcher::{LaunchMode, LaunchOptions, LaunchOutcome, Launcher};
use wintime::snapshot::{InvocationRecord, FIELD_COUNT, UNAVAILABLE};

const TEN_MIB: u64 = 10 * 1024 * 1024;

fn example_target() -> String {
    env!("CARGO_BIN_EXE_example-target").to_string()
}

fn wintime_exe() -> &'static str {
    env!("CARGO_BIN_EXE_wintime")
}

fn target_args() -> Vec<String> {
    vec![example_target(), "10".to_string(), "100".to_string()]
}

fn run_launcher(mut options: LaunchOptions, tag: &str) -> (InvocationRecord, String) {
    options.channel_tag = Some(format!("e2e-{}-{}", std::process::id(), tag));
    let mut sink = Vec::new();
    let outcome = Launcher::new(options, &mut sink).run().unwrap();
    let record = match outcome {
        LaunchOutcome::Completed(record) => record,
        other => panic!("expected a completed run, got {other:?}"),
    };
    (record, String::from_utf8_lossy(&sink).into_owned())
}

/// The agent module built alongside the binaries.
fn built_agent() -> Option<PathBuf> {
    let dir = Path::new(wintime_exe()).parent()?;
    [dir.join(agent_file_name()), dir.join("deps").join(agent_file_name())]
        .into_iter()
        .find(|p| p.is_file())
}

#[test]
fn test_plain_run_measures_time_and_memory() {
    let (record, sink) = run_launcher(LaunchOptions::new(target_args(), LaunchMode::Plain), "plain");

    assert_eq!(record.exit_code, 0);
    assert!(record.times.wall >= Duration::from_millis(100));
    assert!(record.times.exited >= record.times.created);
    let memory = record.memory.expect("OS counters in plain mode");
    assert!(memory.peak_working_set >= TEN_MIB);
    assert!(sink.contains("Wall time"));
}

#[test]
fn test_failed_injection_reports_marker() {
    let dir = tempdir().unwrap();
    let agent = dir.path().join(agent_file_name());
    std::fs::write(&agent, b"this is not a loadable module").unwrap();

    let (record, sink) = run_launcher(
        LaunchOptions::new(target_args(), LaunchMode::Inject { agent }),
        "bogus-agent",
    );

    assert_eq!(record.exit_code, 0);
    assert!(record.times.wall >= Duration::from_millis(100));
    assert_eq!(record.memory, None);
    assert!(sink.contains("Memory data unavailable"));

    let row = record.row('\t');
    let cells: Vec<&str> = row.split('\t').collect();
    assert_eq!(cells.len(), FIELD_COUNT);
    assert!(cells[6..12].iter().all(|c| *c == UNAVAILABLE));
}

#[cfg(any(target_os = "linux", windows))]
#[test]
fn test_injected_agent_reports_peak_memory() {
    let agent = built_agent().unwrap_or_else(|| {
        panic!(
            "{} not found next to {}; build the whole workspace",
            agent_file_name(),
            wintime_exe()
        )
    });
    let (record, _) = run_launcher(
        LaunchOptions::new(target_args(), LaunchMode::Inject { agent }),
        "real-agent",
    );

    assert_eq!(record.exit_code, 0);
    let memory = record.memory.expect("agent record");
    assert!(memory.peak_working_set >= TEN_MIB);
    assert!(memory.page_faults > 0);
}

#[test]
fn test_cli_writes_and_appends_log_rows() {
    let dir = tempdir().unwrap();
    let log = dir.path().join("runs.tsv");

    let status = Command::new(wintime_exe())
        .args(["--no-inject", "-o"])
        .arg(&log)
        .args([example_target().as_str(), "1", "10"])
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(0));

    let status = Command::new(wintime_exe())
        .args(["--no-inject", "-a", "-o"])
        .arg(&log)
        .args([example_target().as_str(), "2"])
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(0));

    let text = std::fs::read_to_string(&log).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], InvocationRecord::header('\t'));
    for line in &lines[1..] {
        assert_eq!(line.split('\t').count(), FIELD_COUNT);
    }
    assert!(lines[2].starts_with(&format!("{} 2\t", example_target())));
}

#[test]
fn test_cli_missing_command_exits_with_failure() {
    let output = Command::new(wintime_exe())
        .args(["--no-inject", "wintime-no-such-program-anywhere"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("could not find executable"));
}

#[test]
fn test_cli_missing_agent_exits_with_failure() {
    let dir = tempdir().unwrap();
    let status = Command::new(wintime_exe())
        .arg("--agent")
        .arg(dir.path().join("absent-agent"))
        .args([example_target().as_str(), "1"])
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(1));
}

#[test]
fn test_cli_help_and_version_exit_zero() {
    for flag in ["--help", "-V"] {
        let status = Command::new(wintime_exe()).arg(flag).status().unwrap();
        assert_eq!(status.code(), Some(0), "{flag}");
    }
}

#[cfg(unix)]
#[test]
fn test_cli_mirrors_target_exit_code() {
    let status = Command::new(wintime_exe())
        .args(["--no-inject", "sh", "-c", "exit 5"])
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(5));
}
