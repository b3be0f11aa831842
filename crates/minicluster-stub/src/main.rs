//! Stand-in for a cluster service process.
//!
//! Listens on the given port and answers line commands:
//! - `ruok` -> `imok`
//! - `kind` -> the service kind it was started as
//! - `exts` -> the files in the extension directory, one per line

use clap::Parser;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "minicluster-stub")]
#[command(about = "Stub service process for minicluster tests")]
struct Args {
    /// Service kind to report.
    #[arg(long, default_value = "service")]
    kind: String,

    /// Port to listen on.
    #[arg(long, required_unless_present = "oneshot")]
    port: Option<u16>,

    /// Address to bind.
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Extension directory reported by `exts`.
    #[arg(long)]
    ext_dir: Option<PathBuf>,

    /// Delay before the listener is opened.
    #[arg(long, default_value_t = 0)]
    ready_delay_ms: u64,

    /// Exit with status 1 this long after start.
    #[arg(long)]
    exit_after_ms: Option<u64>,

    /// Keep running when sent SIGTERM.
    #[arg(long)]
    ignore_sigterm: bool,

    /// Print a line and exit instead of serving.
    #[arg(long)]
    oneshot: bool,

    /// Exit status in oneshot mode.
    #[arg(long, default_value_t = 0)]
    exit_code: i32,
}

fn main() -> std::io::Result<()> {
    let args = Args::parse();

    #[cfg(unix)]
    if args.ignore_sigterm {
        let flag = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        signal_hook::flag::register(signal_hook::consts::SIGTERM, flag)?;
    }

    if args.oneshot {
        println!("{} finished", args.kind);
        std::process::exit(args.exit_code);
    }

    if let Some(ms) = args.exit_after_ms {
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(ms));
            eprintln!("exiting after {ms}ms");
            std::process::exit(1);
        });
    }

    thread::sleep(Duration::from_millis(args.ready_delay_ms));

    let port = args.port.unwrap_or_default();
    let listener = TcpListener::bind((args.bind.as_str(), port))?;
    println!("{} listening on {}", args.kind, listener.local_addr()?);

    for stream in listener.incoming() {
        let Ok(stream) = stream else { continue };
        let kind = args.kind.clone();
        let ext_dir = args.ext_dir.clone();
        thread::spawn(move || {
            if let Err(e) = serve(stream, &kind, ext_dir.as_deref()) {
                eprintln!("connection error: {e}");
            }
        });
    }
    Ok(())
}

fn serve(stream: TcpStream, kind: &str, ext_dir: Option<&Path>) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    let mut line = String::new();
    reader.read_line(&mut line)?;

    let reply = match line.trim() {
        "ruok" => "imok".to_string(),
        "kind" => kind.to_string(),
        "exts" => list(ext_dir)?,
        other => format!("unknown command: {other}"),
    };
    writer.write_all(reply.as_bytes())?;
    writer.flush()
}

fn list(dir: Option<&Path>) -> std::io::Result<String> {
    let Some(dir) = dir else {
        return Ok(String::new());
    };
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if !name.starts_with('.') {
            names.push(name);
        }
    }
    names.sort();
    Ok(names.join("\n"))
}
