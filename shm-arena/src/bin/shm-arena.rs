use std::ffi::OsString;
use std::fmt::Write as _;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use serde_json::json;
use shm_arena::{parse_size, ArenaError, ArenaOptions, EnvError, IpcAllocator, Payload};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let ArenaCommand {
        name,
        registry,
        action,
    } = ArenaCommand::parse();

    let result = ArenaOptions::from_env()
        .map_err(CliError::from)
        .and_then(|mut options| {
            if let Some(name) = name {
                options.name = name;
            }

            if let Some(registry) = registry {
                options.registry = registry;
            }

            run(options, action)
        });

    match result {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("shm-arena: {}", report(&err));
            process::exit(1);
        }
    }
}

/// Host and inspect arenas in shared memory.
#[derive(Parser)]
#[command(version)]
struct ArenaCommand {
    /// The name of the arena, instead of `$SHM_ARENA_NAME`.
    #[arg(long, global = true)]
    name: Option<String>,

    /// The directory of segment records, instead of `$SHM_ARENA_DIR`.
    #[arg(long, global = true)]
    registry: Option<PathBuf>,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand)]
enum Action {
    /// Create the arena and run a command that can open it.
    ///
    /// The command finds the arena through the `SHM_ARENA_*` environment variables. The arena is
    /// withdrawn once the command exits, and its exit status becomes ours.
    Host {
        /// Size of the segment, such as `65536` or `128M`.
        #[arg(long, value_parser = parse_size)]
        size: Option<usize>,

        /// Bytes reserved for the allocation table.
        #[arg(long, value_parser = parse_size)]
        header_size: Option<usize>,

        #[arg(help = "The command to execute with the arena in its environment")]
        command: OsString,

        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<OsString>,
    },
    /// Print the usage of the arena.
    Stats {
        #[arg(long)]
        json: bool,
    },
    /// Print the allocation table.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Print the contents of one allocation.
    Read {
        #[arg(long)]
        offset: usize,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Env(#[from] EnvError),
    #[error(transparent)]
    Arena(#[from] ArenaError),
    #[error("failed to run {command:?}")]
    Spawn {
        command: OsString,
        #[source]
        source: io::Error,
    },
    #[error("failed to install signal handlers")]
    Signals(#[source] io::Error),
    #[error("failed to print")]
    Print(#[from] serde_json::Error),
}

fn run(mut options: ArenaOptions, action: Action) -> Result<i32, CliError> {
    match action {
        Action::Host {
            size,
            header_size,
            command,
            args,
        } => {
            if let Some(size) = size {
                options.size = size;
            }

            if let Some(header_size) = header_size {
                options.header_size = header_size;
            }

            host(options, command, args)
        }
        Action::Stats { json } => {
            let arena = attach(options)?;
            let stats = arena.stats()?;

            if json {
                println!("{}", serde_json::to_string(&stats)?);
            } else {
                println!("name:        {}", arena.name());
                println!("total size:  {}", stats.total_size);
                println!("allocated:   {}", stats.allocated);
                println!("free:        {}", stats.free);
                println!("allocations: {}", stats.allocation_count);
                println!("usage:       {:.2}%", stats.usage_percent);
            }

            Ok(0)
        }
        Action::List { json } => {
            let arena = attach(options)?;

            if json {
                let table: Vec<_> = arena
                    .allocations()
                    .map(|a| json!({ "offset": a.offset, "size": a.size, "type": a.kind.tag() }))
                    .collect();
                println!("{}", serde_json::to_string(&table)?);
            } else {
                println!("{:>12} {:>12}  type", "offset", "size");
                for allocation in arena.allocations() {
                    println!(
                        "{:>12} {:>12}  {}",
                        allocation.offset,
                        allocation.size,
                        allocation.kind.tag()
                    );
                }
            }

            Ok(0)
        }
        Action::Read { offset } => {
            let arena = attach(options)?;

            match arena.read(offset)? {
                Payload::Json(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                Payload::Raw(bytes) => print!("{}", hexdump(&bytes)),
                Payload::Undecodable { bytes, error } => {
                    tracing::warn!(offset, "payload does not decode: {error}");
                    print!("{}", hexdump(&bytes));
                }
            }

            Ok(0)
        }
    }
}

fn attach(options: ArenaOptions) -> Result<IpcAllocator, ArenaError> {
    let mut arena = IpcAllocator::new(options);
    arena.open()?;
    Ok(arena)
}

fn host(options: ArenaOptions, command: OsString, args: Vec<OsString>) -> Result<i32, CliError> {
    let mut arena = IpcAllocator::new(options.clone());
    let size = arena.init()?;

    let mut proc = process::Command::new(&command);
    proc.args(&args).envs(options.to_vars());

    // We always wait for our child to exit first.
    unsafe { posixly_ignore_signals() }.map_err(CliError::Signals)?;

    tracing::info!(name = %options.name, size, ?command, "hosting arena");
    let status = proc.status();
    arena.destroy();

    let status = status.map_err(|source| CliError::Spawn { command, source })?;
    tracing::debug!(%status, "command exited");

    Ok(match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    })
}

/// The error followed by each of its causes.
fn report(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();

    while let Some(cause) = source {
        let _ = write!(out, ": {cause}");
        source = cause.source();
    }

    out
}

/// Survive SIGINT and SIGTERM, for instance from the terminal, which the child receives as well.
///
/// A handler, unlike `SIG_IGN`, is reset to the default when the child executes its command.
unsafe fn posixly_ignore_signals() -> Result<(), io::Error> {
    extern "C" fn ignore(_: libc::c_int) {}

    let mut action: libc::sigaction = core::mem::zeroed();
    action.sa_sigaction = ignore as extern "C" fn(libc::c_int) as libc::sighandler_t;
    action.sa_flags = libc::SA_RESTART;

    for signal in [libc::SIGINT, libc::SIGTERM] {
        if -1 == libc::sigaction(signal, &action, core::ptr::null_mut()) {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(())
}

fn hexdump(bytes: &[u8]) -> String {
    let mut out = String::new();

    for (idx, line) in bytes.chunks(16).enumerate() {
        let _ = write!(out, "{:08x} ", idx * 16);
        for byte in line {
            let _ = write!(out, " {byte:02x}");
        }

        let pad = 3 * (16 - line.len());
        let text: String = line
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect();
        let _ = writeln!(out, "{:pad$}  |{text}|", "");
    }

    out
}

#[test]
fn hexdump_lines() {
    let dump = hexdump(b"kept\0\0\0\0");
    assert_eq!(
        dump,
        "00000000  6b 65 70 74 00 00 00 00                          |kept....|\n"
    );

    assert_eq!(hexdump(&[0; 17]).lines().count(), 2);
    assert_eq!(hexdump(&[]), "");
}

#[test]
fn report_each_cause_once() {
    let err = CliError::Spawn {
        command: "missing".into(),
        source: io::Error::new(io::ErrorKind::NotFound, "no such file"),
    };

    assert_eq!(report(&err), r#"failed to run "missing": no such file"#);
}
