//! Program resolution and command construction.
//!
//! Names without a `/` are looked up on `PATH`: the `PATH` from the environment
//! override when one is given, else ours, else [`DEFAULT_SEARCH_PATH`]. Files
//! without a recognizable executable header (ELF, Mach-O, `#!`) are run through
//! [`SHELL`], which is how shebang-less scripts get executed.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::File;
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::error::ProcessError;

pub(crate) const SHELL: &str = "/bin/sh";
pub(crate) const DEFAULT_SEARCH_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

const EXECUTABLE_MAGICS: &[&[u8]] = &[
    b"\x7fELF",
    b"#!",
    &[0xfe, 0xed, 0xfa, 0xce],
    &[0xfe, 0xed, 0xfa, 0xcf],
    &[0xce, 0xfa, 0xed, 0xfe],
    &[0xcf, 0xfa, 0xed, 0xfe],
    &[0xca, 0xfe, 0xba, 0xbe],
];

/// What actually gets exec'd for a program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Launch {
    pub path: PathBuf,
    /// Set when the file has no executable header.
    pub interpreter: Option<&'static str>,
}

pub(crate) fn resolve(
    program: &str,
    environment: Option<&HashMap<String, String>>,
) -> Result<Launch, ProcessError> {
    let path = if program.contains('/') {
        let path = PathBuf::from(program);
        if !path.is_file() {
            return Err(ProcessError::ProgramNotFound(program.to_string()));
        }
        path
    } else {
        let search = match environment {
            Some(env) => env.get("PATH").map(OsString::from),
            None => std::env::var_os("PATH"),
        }
        .unwrap_or_else(|| OsString::from(DEFAULT_SEARCH_PATH));

        search_path(program, &search)
            .ok_or_else(|| ProcessError::ProgramNotFound(program.to_string()))?
    };

    let interpreter = if has_executable_header(&path) {
        None
    } else {
        Some(SHELL)
    };
    Ok(Launch { path, interpreter })
}

fn search_path(program: &str, search: &OsString) -> Option<PathBuf> {
    std::env::split_paths(search)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Unreadable files count as executable; exec reports the real error.
fn has_executable_header(path: &Path) -> bool {
    let mut header = [0u8; 4];
    let len = match File::open(path).and_then(|mut f| read_prefix(&mut f, &mut header)) {
        Ok(len) => len,
        Err(_) => return true,
    };
    let header = &header[..len];
    EXECUTABLE_MAGICS
        .iter()
        .any(|magic| header.starts_with(magic))
}

fn read_prefix(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Build the command for `launch`. Stdio is left to the caller.
pub(crate) fn build_command(
    launch: &Launch,
    arguments: &[String],
    working_directory: Option<&Path>,
    environment: Option<&HashMap<String, String>>,
) -> Command {
    let mut cmd = match launch.interpreter {
        Some(shell) => {
            let mut cmd = Command::new(shell);
            cmd.arg(&launch.path);
            cmd
        }
        None => Command::new(&launch.path),
    };
    cmd.args(arguments);

    if let Some(env) = environment {
        cmd.env_clear().envs(env);
    }
    if let Some(dir) = working_directory {
        cmd.current_dir(dir);
    }
    cmd
}
