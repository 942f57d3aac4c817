//! spawnio-run: supervise one program, forwarding its output, our input and
//! its exit code.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{self, ExitStatus};

use anyhow::Context;
use spawnio::{Process, ProcessConfig, Stream, init_tracing};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

#[derive(Debug, PartialEq)]
struct Options {
    program: String,
    arguments: Vec<String>,
    cwd: Option<PathBuf>,
    env: Vec<(String, String)>,
    clear_env: bool,
}

impl Options {
    /// `None` means inherit ours untouched.
    fn environment(&self) -> Option<HashMap<String, String>> {
        if !self.clear_env && self.env.is_empty() {
            return None;
        }
        let mut environment: HashMap<String, String> = if self.clear_env {
            HashMap::new()
        } else {
            std::env::vars().collect()
        };
        environment.extend(self.env.iter().cloned());
        Some(environment)
    }
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let options = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("error: {msg}");
            eprintln!();
            eprintln!("Usage: spawnio-run [options] [--] <program> [args...]");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --cwd <dir>        Working directory for the program");
            eprintln!("  --env <KEY=VALUE>  Set an environment variable (repeatable)");
            eprintln!("  --clear-env        Start from an empty environment");
            process::exit(2);
        }
    };

    init_tracing();

    match run(options).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            process::exit(1);
        }
    }
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut cwd = None;
    let mut env = Vec::new();
    let mut clear_env = false;

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--cwd" => {
                i += 1;
                cwd = Some(PathBuf::from(args.get(i).ok_or("--cwd requires a value")?));
            }
            "--env" => {
                i += 1;
                let pair = args.get(i).ok_or("--env requires a value")?;
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| format!("expected KEY=VALUE, got '{pair}'"))?;
                env.push((key.to_string(), value.to_string()));
            }
            "--clear-env" => clear_env = true,
            "--help" | "-h" => return Err("".to_string()),
            "--" => {
                i += 1;
                break;
            }
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            _ => break,
        }
        i += 1;
    }

    let program = args
        .get(i)
        .ok_or("missing required argument: <program>")?
        .clone();
    Ok(Options {
        program,
        arguments: args[i + 1..].to_vec(),
        cwd,
        env,
        clear_env,
    })
}

async fn run(options: Options) -> anyhow::Result<i32> {
    let environment = options.environment();
    let (eos_tx, mut eos_rx) = mpsc::unbounded_channel();
    let stdout_eos = eos_tx.clone();

    let mut config = ProcessConfig::new(options.program.clone())
        .with_arguments(options.arguments)
        .on_stdout(move |bytes| forward_output(bytes, &mut io::stdout(), &stdout_eos))
        .on_stderr(move |bytes| forward_output(bytes, &mut io::stderr(), &eos_tx));
    if let Some(dir) = options.cwd {
        config = config.with_working_directory(dir);
    }
    if let Some(environment) = environment {
        config = config.with_environment(environment);
    }

    let process = Process::spawn(config)
        .with_context(|| format!("failed to start {}", options.program))?;

    let stdin = process.stdin().context("child stdin is not attached")?;
    let runtime = Handle::current();
    std::thread::spawn(move || forward_input(&stdin, &runtime));

    let interrupt = process.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = interrupt.terminate();
        }
    });

    let status = process.wait().await?;
    // Exit doesn't imply the output was fully delivered.
    for _ in 0..2 {
        if eos_rx.recv().await.is_none() {
            break;
        }
    }
    Ok(status.map(exit_code).unwrap_or(1))
}

fn forward_output(bytes: &[u8], out: &mut impl Write, eos: &mpsc::UnboundedSender<()>) {
    if bytes.is_empty() {
        let _ = eos.send(());
        return;
    }
    if let Err(e) = out.write_all(bytes).and_then(|()| out.flush()) {
        tracing::warn!(error = %e, "Failed to forward output");
    }
}

/// Blocking copy of our stdin into the child's. Closes the child's stdin at EOF.
fn forward_input(stdin: &Stream, runtime: &Handle) {
    let mut input = io::stdin().lock();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        match input.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if stdin.write_bytes(&buf[..n]).is_err() {
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read input");
                break;
            }
        }
    }
    runtime.block_on(stdin.flush());
    stdin.cancel();
}

/// Shell convention: 128 + signal for signaled children.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("spawnio-run")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn program_and_arguments() {
        let options = parse_args(&args(&["echo", "-n", "hi"])).unwrap();
        assert_eq!(options.program, "echo");
        assert_eq!(options.arguments, ["-n", "hi"]);
        assert!(options.environment().is_none());
    }

    #[test]
    fn flags_before_the_program() {
        let options = parse_args(&args(&[
            "--cwd", "/tmp", "--env", "A=1", "--clear-env", "--", "--weird", "x",
        ]))
        .unwrap();
        assert_eq!(options.cwd, Some(PathBuf::from("/tmp")));
        assert_eq!(options.program, "--weird");
        assert_eq!(options.arguments, ["x"]);
        assert_eq!(
            options.environment(),
            Some(HashMap::from([("A".to_string(), "1".to_string())]))
        );
    }

    #[test]
    fn bad_arguments() {
        assert!(parse_args(&args(&[])).is_err());
        assert!(parse_args(&args(&["--cwd"])).is_err());
        assert!(parse_args(&args(&["--env", "novalue", "true"])).is_err());
        insta::assert_snapshot!(
            parse_args(&args(&["--bogus", "true"])).unwrap_err(),
            @"unknown flag: --bogus"
        );
    }

    #[test]
    fn signaled_exit_code() {
        assert_eq!(exit_code(ExitStatus::from_raw(0)), 0);
        assert_eq!(exit_code(ExitStatus::from_raw(3 << 8)), 3);
        assert_eq!(exit_code(ExitStatus::from_raw(2)), 130);
    }
}
