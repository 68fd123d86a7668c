/// Command-line helpers: quoting a target's argv into one string and finding
/// the target on the executable search path.
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

/// Join `args` into one Windows-style command line.
///
/// Embedded double quotes are backslash-escaped. Arguments containing a space
/// are wrapped in double quotes; if such an argument ends in an odd run of
/// backslashes one more is added so the closing quote stays a quote.
pub fn join<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .map(|arg| quote(arg.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

fn quote(arg: &str) -> String {
    let escaped = arg.replace('"', "\\\"");
    if !escaped.contains(' ') {
        return escaped;
    }
    let trailing = escaped.chars().rev().take_while(|&c| c == '\\').count();
    let mut quoted = String::with_capacity(escaped.len() + 3);
    quoted.push('"');
    quoted.push_str(&escaped);
    if trailing % 2 == 1 {
        quoted.push('\\');
    }
    quoted.push('"');
    quoted
}

/// Resolve `command` to an executable path.
///
/// An existing file is taken as is. Otherwise each directory of `search_path`
/// (a `PATH`-style list) is tried in order; on Windows `.exe` is tried as well.
pub fn resolve(command: &str, search_path: Option<&OsStr>) -> Option<PathBuf> {
    let direct = Path::new(command);
    if direct.is_file() {
        return Some(direct.to_path_buf());
    }
    // Something that already names a directory is not searched for.
    if direct.components().count() > 1 {
        return None;
    }
    let search_path = search_path?;
    std::env::split_paths(search_path)
        .filter(|dir| !dir.as_os_str().is_empty())
        .flat_map(|dir| candidates(&dir, command))
        .find(|candidate| candidate.is_file())
}

fn candidates(dir: &Path, command: &str) -> Vec<PathBuf> {
    let plain = dir.join(command);
    if cfg!(windows) && plain.extension().is_none() {
        vec![plain.clone(), plain.with_extension("exe")]
    } else {
        vec![plain]
    }
}

/// [`resolve`] against this process's `PATH`.
pub fn resolve_on_path(command: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH");
    resolve(command, path.as_deref())
}
