/// Launcher: one measured run from command line to report.
///
/// Drives the run through [`LaunchState`]: architecture gate, optional
/// re-dispatch to the companion watcher, target start (with or without the
/// agent), unconditional wait, channel read, report and log row.
use crate::arch::{self, Compatibility};
use crate::channel::ChannelServer;
use crate::cmdline;
use crate::inject::{self, InjectError, Injector, TargetCommand};
use crate::logfile::{LogWriter, OpenMode};
use crate::snapshot::InvocationRecord;
use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

/// Exit code for runs that fail before the target exists.
pub const FAILURE_EXIT_CODE: i32 = 1;

/// Launcher states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchState {
    Idle,
    ArchChecked,
    Redispatched,
    Ready,
    Injected,
    Resumed,
    Exited,
    Reported,
}

/// How the target is started and where memory counters come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchMode {
    /// Load the agent module; memory only via the channel.
    Inject { agent: PathBuf },
    /// Plain start; memory read from the OS after exit.
    Plain,
}

#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// COMMAND followed by its ARGS, as given.
    pub command: Vec<String>,
    pub mode: LaunchMode,
    pub output: Option<PathBuf>,
    pub append: bool,
    pub verbose: bool,
    pub separator: char,
    pub lock_retry: Duration,
    pub remote_load_timeout: Duration,
    /// Watcher for the other architecture.
    pub companion: PathBuf,
    /// Arguments handed to the companion unchanged (our argv without argv[0]).
    pub forward_args: Vec<OsString>,
    /// Channel name tag; the watcher's pid when `None`.
    pub channel_tag: Option<String>,
}

impl LaunchOptions {
    pub fn new(command: Vec<String>, mode: LaunchMode) -> Self {
        let self_dir = self_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            command,
            mode,
            output: None,
            append: false,
            verbose: false,
            separator: '\t',
            lock_retry: crate::logfile::DEFAULT_RETRY_INTERVAL,
            remote_load_timeout: inject::REMOTE_LOAD_TIMEOUT,
            companion: self_dir.join(companion_file_name(None)),
            forward_args: Vec::new(),
            channel_tag: None,
        }
    }
}

/// How a run ended.
#[derive(Debug)]
pub enum LaunchOutcome {
    /// The companion watcher ran instead of us.
    Redispatched { exit_code: i32 },
    Completed(InvocationRecord),
}

impl LaunchOutcome {
    /// The code the watcher process should exit with.
    pub fn exit_code(&self) -> i32 {
        match self {
            LaunchOutcome::Redispatched { exit_code } => *exit_code,
            LaunchOutcome::Completed(record) => record.exit_code,
        }
    }
}

/// Failures before the target could run. All map to [`FAILURE_EXIT_CODE`].
#[derive(Debug)]
pub enum LaunchError {
    NoCommand,
    TargetNotFound { command: String },
    TargetUnknown { path: PathBuf, explanation: String },
    CompanionMissing { path: PathBuf },
    CompanionFailed { path: PathBuf, source: std::io::Error },
    Inject(InjectError),
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchError::NoCommand => write!(f, "no command given"),
            LaunchError::TargetNotFound { command } => write!(
                f,
                "could not find executable '{}' (PATH was also checked)",
                command
            ),
            LaunchError::TargetUnknown { explanation, .. } => write!(
                f,
                "{} Cannot determine target architecture. Is it an executable?",
                explanation
            ),
            LaunchError::CompanionMissing { path } => write!(
                f,
                "cannot find '{}'; make sure it is present or invoke it manually",
                path.display()
            ),
            LaunchError::CompanionFailed { path, source } => {
                write!(f, "failed to run '{}': {}", path.display(), source)
            }
            LaunchError::Inject(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LaunchError::CompanionFailed { source, .. } => Some(source),
            LaunchError::Inject(e) => Some(e),
            _ => None,
        }
    }
}

impl From<InjectError> for LaunchError {
    fn from(e: InjectError) -> Self {
        LaunchError::Inject(e)
    }
}

/// Directory holding the running watcher executable.
pub fn self_dir() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    exe.parent().map(Path::to_path_buf)
}

/// File name of the companion watcher: configured, baked in at build time, or
/// derived from our own pointer width.
pub fn companion_file_name(configured: Option<&str>) -> String {
    if let Some(name) = configured {
        return name.to_string();
    }
    if let Some(name) = option_env!("WINTIME_COMPANION_EXE") {
        return name.to_string();
    }
    let other = if cfg!(target_pointer_width = "64") {
        "wintime32"
    } else {
        "wintime64"
    };
    format!("{}{}", other, std::env::consts::EXE_SUFFIX)
}

pub struct Launcher<'a> {
    options: LaunchOptions,
    state: LaunchState,
    /// Console report and user-facing notes.
    sink: &'a mut dyn Write,
}

impl<'a> Launcher<'a> {
    pub fn new(options: LaunchOptions, sink: &'a mut dyn Write) -> Self {
        Self {
            options,
            state: LaunchState::Idle,
            sink,
        }
    }

    fn advance(&mut self, next: LaunchState) {
        tracing::debug!(from = ?self.state, to = ?next, "launcher state");
        self.state = next;
    }

    /// Console output is best effort; a closed stderr must not fail the run.
    fn note(&mut self, text: &str) {
        let _ = writeln!(self.sink, "{}", text);
    }

    pub fn run(mut self) -> Result<LaunchOutcome, LaunchError> {
        let command = self.options.command.first().ok_or(LaunchError::NoCommand)?.clone();
        let program = cmdline::resolve_on_path(&command).ok_or_else(|| {
            LaunchError::TargetNotFound {
                command: command.clone(),
            }
        })?;
        if self.options.verbose && program != Path::new(&command) {
            let found = format!("Found '{}' in PATH as '{}'.", command, program.display());
            self.note(&found);
        }

        let verdict = arch::check(&program);
        self.advance(LaunchState::ArchChecked);
        let explanation = arch::explain(verdict, &program);
        // TargetUnknown carries the explanation in its error message
        let show = match verdict {
            Compatibility::Same => self.options.verbose,
            Compatibility::Mixed => true,
            Compatibility::TargetUnknown => false,
        };
        if show {
            self.note(&explanation);
        }
        match verdict {
            Compatibility::TargetUnknown => {
                return Err(LaunchError::TargetUnknown {
                    path: program,
                    explanation,
                })
            }
            Compatibility::Mixed => {
                let exit_code = self.redispatch()?;
                self.advance(LaunchState::Redispatched);
                return Ok(LaunchOutcome::Redispatched { exit_code });
            }
            Compatibility::Same => self.advance(LaunchState::Ready),
        }

        let record = self.measure(program)?;
        self.advance(LaunchState::Reported);
        Ok(LaunchOutcome::Completed(record))
    }

    fn redispatch(&mut self) -> Result<i32, LaunchError> {
        let companion = self.options.companion.clone();
        let note = format!("Trying to find '{}' automatically...", companion.display());
        self.note(&note);
        if !companion.is_file() {
            return Err(LaunchError::CompanionMissing { path: companion });
        }
        tracing::debug!(companion = %companion.display(), args = ?self.options.forward_args, "re-dispatching");
        let status = Command::new(&companion)
            .args(&self.options.forward_args)
            .status()
            .map_err(|source| LaunchError::CompanionFailed {
                path: companion.clone(),
                source,
            })?;
        Ok(status.code().unwrap_or(FAILURE_EXIT_CODE))
    }

    fn measure(&mut self, program: PathBuf) -> Result<InvocationRecord, LaunchError> {
        let command_line = cmdline::join(&self.options.command);
        if self.options.verbose {
            let note = format!("CMD {{ARGS}}:\n  {}", command_line);
            self.note(&note);
        }
        let mut target = TargetCommand {
            program,
            args: self.options.command[1..].to_vec(),
            command_line: command_line.clone(),
            env: Vec::new(),
        };

        let (process, mut server) = match &self.options.mode {
            LaunchMode::Plain => (inject::spawn_plain(&target)?, None),
            LaunchMode::Inject { agent } => {
                let injector = Injector::new(agent.clone())?
                    .with_remote_load_timeout(self.options.remote_load_timeout);
                if self.options.verbose {
                    let note = format!("Injecting agent '{}'", injector.agent().display());
                    self.note(&note);
                }
                let created = match &self.options.channel_tag {
                    Some(tag) => ChannelServer::create(tag),
                    None => ChannelServer::for_current_process(),
                };
                let server = match created {
                    Ok(server) => {
                        target.env.push(server.env_entry());
                        Some(server)
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "continuing without memory data");
                        None
                    }
                };
                let process = injector.inject(&target)?;
                self.advance(LaunchState::Injected);
                (process, server)
            }
        };
        self.advance(LaunchState::Resumed);
        let pid = process.id();

        let exit = process.wait();
        self.advance(LaunchState::Exited);
        tracing::debug!(pid, exit_code = exit.exit_code, "target exited");

        let memory = match (&self.options.mode, server.as_mut()) {
            (LaunchMode::Plain, _) => exit.os_memory,
            (LaunchMode::Inject { .. }, Some(server)) => match server.receive() {
                Ok(memory) => memory,
                Err(e) => {
                    tracing::warn!(error = %e, "could not read memory record");
                    None
                }
            },
            (LaunchMode::Inject { .. }, None) => None,
        };
        drop(server);

        let record = InvocationRecord {
            command_line,
            times: exit.times,
            memory,
            exit_code: exit.exit_code,
        };

        if self.options.output.is_none() || self.options.verbose {
            if let Err(e) = record.print_report(&mut *self.sink) {
                tracing::warn!(error = %e, "could not print report");
            }
        }
        if let Some(path) = self.options.output.clone() {
            self.write_log(&path, &record);
        }
        Ok(record)
    }

    /// A failed log write is reported; it never changes the exit code.
    fn write_log(&mut self, path: &Path, record: &InvocationRecord) {
        let mode = if self.options.append {
            OpenMode::Append
        } else {
            OpenMode::Overwrite
        };
        let writer = LogWriter::new(path, mode)
            .with_separator(self.options.separator)
            .with_retry_interval(self.options.lock_retry);
        if let Err(e) = writer.append(record) {
            tracing::error!(path = %path.display(), error = %e, "log row not written");
            let note = format!("Could not write log file: {}", e);
            self.note(&note);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{FIELD_COUNT, UNAVAILABLE};
    use tempfile::tempdir;

    fn run(options: LaunchOptions) -> (Result<LaunchOutcome, LaunchError>, String) {
        let mut sink = Vec::new();
        let result = Launcher::new(options, &mut sink).run();
        (result, String::from_utf8_lossy(&sink).into_owned())
    }

    fn unique_tag(name: &str) -> Option<String> {
        Some(format!("launcher-{}-{}", std::process::id(), name))
    }

    #[test]
    fn test_companion_name_default_is_other_width() {
        let name = companion_file_name(None);
        if cfg!(target_pointer_width = "64") && option_env!("WINTIME_COMPANION_EXE").is_none() {
            assert!(name.starts_with("wintime32"));
        }
        assert_eq!(companion_file_name(Some("custom")), "custom");
    }

    #[test]
    fn test_empty_command_rejected() {
        let (result, _) = run(LaunchOptions::new(Vec::new(), LaunchMode::Plain));
        assert!(matches!(result, Err(LaunchError::NoCommand)));
    }

    #[test]
    fn test_unknown_command_not_found() {
        let options = LaunchOptions::new(
            vec!["wintime-no-such-command-anywhere".to_string()],
            LaunchMode::Plain,
        );
        let (result, _) = run(options);
        assert!(matches!(result, Err(LaunchError::TargetNotFound { .. })));
    }

    #[test]
    fn test_text_file_is_target_unknown() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("notes.txt");
        std::fs::write(&script, "just text\n").unwrap();
        let options = LaunchOptions::new(
            vec![script.to_string_lossy().into_owned()],
            LaunchMode::Plain,
        );
        let (result, sink) = run(options);
        let err = result.unwrap_err();
        assert!(matches!(err, LaunchError::TargetUnknown { .. }));
        // stated once, by the error the caller prints
        assert!(err.to_string().contains("neither native 32 bit nor 64 bit"));
        assert!(!sink.contains("neither native 32 bit nor 64 bit"));
    }

    /// A native-format header for the other pointer width.
    #[cfg(unix)]
    fn other_width_elf(path: &Path) {
        let mut head = vec![0u8; 64];
        head[..4].copy_from_slice(b"\x7fELF");
        head[4] = if cfg!(target_pointer_width = "64") { 1 } else { 2 };
        head[5] = 1;
        head[16..18].copy_from_slice(&2u16.to_le_bytes());
        std::fs::write(path, head).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_mixed_without_companion_is_fatal() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("other-width");
        other_width_elf(&target);
        let mut options = LaunchOptions::new(
            vec![target.to_string_lossy().into_owned()],
            LaunchMode::Plain,
        );
        options.companion = dir.path().join("no-companion");
        let (result, _) = run(options);
        assert!(matches!(result, Err(LaunchError::CompanionMissing { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_mixed_redispatches_with_companion_exit_code() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let target = dir.path().join("other-width");
        other_width_elf(&target);
        let marker = dir.path().join("args.txt");
        let companion = dir.path().join("companion.sh");
        std::fs::write(
            &companion,
            format!("#!/bin/sh\necho \"$@\" > '{}'\nexit 7\n", marker.display()),
        )
        .unwrap();
        std::fs::set_permissions(&companion, std::fs::Permissions::from_mode(0o755)).unwrap();

        let log = dir.path().join("log.tsv");
        let mut options = LaunchOptions::new(
            vec![target.to_string_lossy().into_owned(), "--flag".to_string()],
            LaunchMode::Plain,
        );
        options.companion = companion;
        options.output = Some(log.clone());
        options.forward_args = vec!["-o".into(), "x.tsv".into(), "--flag".into()];

        let (result, _) = run(options);
        let outcome = result.unwrap();
        assert!(matches!(outcome, LaunchOutcome::Redispatched { exit_code: 7 }));
        assert_eq!(outcome.exit_code(), 7);
        assert_eq!(std::fs::read_to_string(&marker).unwrap().trim(), "-o x.tsv --flag");
        assert!(!log.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_plain_run_reports_and_logs() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("log.tsv");
        let mut options = LaunchOptions::new(
            vec!["sh".to_string(), "-c".to_string(), "exit 3".to_string()],
            LaunchMode::Plain,
        );
        options.output = Some(log.clone());

        let (result, sink) = run(options);
        let outcome = result.unwrap();
        assert_eq!(outcome.exit_code(), 3);
        // -o without -v keeps the console quiet
        assert!(!sink.contains("Wall time"));

        let text = std::fs::read_to_string(&log).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let cells: Vec<&str> = lines[1].split('\t').collect();
        assert_eq!(cells.len(), FIELD_COUNT);
        assert_eq!(cells[0], "sh -c \"exit 3\"");
        assert_eq!(cells[12], "3");
        assert_ne!(cells[7], UNAVAILABLE);
    }

    #[cfg(unix)]
    #[test]
    fn test_inject_with_unloadable_agent_degrades_to_marker() {
        let dir = tempdir().unwrap();
        let agent = dir.path().join("libwintime_agent.so");
        std::fs::write(&agent, b"not a shared object").unwrap();
        let mut options = LaunchOptions::new(
            vec!["sh".to_string(), "-c".to_string(), "exit 0".to_string()],
            LaunchMode::Inject { agent },
        );
        options.channel_tag = unique_tag("unloadable");

        let (result, sink) = run(options);
        match result.unwrap() {
            LaunchOutcome::Completed(record) => {
                assert_eq!(record.exit_code, 0);
                assert_eq!(record.memory, None);
                assert!(record.times.exited >= record.times.created);
            }
            other => panic!("expected a completed run, got {other:?}"),
        }
        assert!(sink.contains("Memory data unavailable"));
    }

    #[cfg(unix)]
    #[test]
    fn test_channel_unavailable_still_reports_times() {
        let dir = tempdir().unwrap();
        let agent = dir.path().join("libwintime_agent.so");
        std::fs::write(&agent, b"not a shared object").unwrap();
        let tag = unique_tag("taken");
        let _holder = ChannelServer::create(tag.as_deref().unwrap()).unwrap();

        let mut options = LaunchOptions::new(
            vec!["sh".to_string(), "-c".to_string(), "exit 2".to_string()],
            LaunchMode::Inject { agent },
        );
        options.channel_tag = tag;

        let (result, sink) = run(options);
        match result.unwrap() {
            LaunchOutcome::Completed(record) => {
                assert_eq!(record.exit_code, 2);
                assert_eq!(record.memory, None);
                assert!(record.times.exited >= record.times.created);
                let row = record.row('\t');
                let cells: Vec<&str> = row.split('\t').collect();
                assert_eq!(cells[7], UNAVAILABLE);
            }
            other => panic!("expected a completed run, got {other:?}"),
        }
        assert!(sink.contains("Memory data unavailable"));
    }

    #[test]
    fn test_inject_with_missing_agent_is_fatal() {
        let dir = tempdir().unwrap();
        let exe = std::env::current_exe().unwrap();
        let mut options = LaunchOptions::new(
            vec![exe.to_string_lossy().into_owned()],
            LaunchMode::Inject {
                agent: dir.path().join("missing-agent"),
            },
        );
        options.channel_tag = unique_tag("missing-agent");
        let (result, _) = run(options);
        assert!(matches!(
            result,
            Err(LaunchError::Inject(InjectError::AgentMissing { .. }))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_log_failure_keeps_target_exit_code() {
        let dir = tempdir().unwrap();
        let mut options = LaunchOptions::new(
            vec!["sh".to_string(), "-c".to_string(), "exit 4".to_string()],
            LaunchMode::Plain,
        );
        options.output = Some(dir.path().join("no-dir").join("log.tsv"));
        let (result, sink) = run(options);
        assert_eq!(result.unwrap().exit_code(), 4);
        assert!(sink.contains("Could not write log file"));
    }
}
