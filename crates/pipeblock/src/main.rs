use std::io::{Read, Write};
use std::process;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use pipeblock::{FilterConfig, PipeFilter, PipeSink, SinkConfig};

const STDIN_CHUNK: usize = 64 * 1024;
/// Chunks the reader thread may queue ahead of the scheduling loop.
const STDIN_QUEUE: usize = 4;
const IDLE_SLEEP: Duration = Duration::from_millis(1);
const OUTPUT_ITEMS: usize = 4096;

struct Options {
    command: String,
    sink: bool,
    in_item_size: usize,
    out_item_size: usize,
    relative_rate: f64,
    unbuffered: bool,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let options = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: pipeblock [--sink] [--in-size N] [--out-size N] [--rate R] [--unbuffered] <command>");
            eprintln!();
            eprintln!("Arguments:");
            eprintln!("  <command>        Shell command run via `sh -c`");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --sink           Only feed the command; its stdout is ours [default: filter]");
            eprintln!("  --in-size <N>    Input item size in bytes [default: 1]");
            eprintln!("  --out-size <N>   Output item size in bytes [default: 1]");
            eprintln!("  --rate <R>       Output items per input item [default: 1.0]");
            eprintln!("  --unbuffered     Write every item to the command immediately");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(options) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("PIPEBLOCK_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("trace") => "trace",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("pipeblock={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut command: Option<String> = None;
    let mut sink = false;
    let mut in_item_size = 1;
    let mut out_item_size = 1;
    let mut relative_rate = 1.0;
    let mut unbuffered = false;

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--sink" => sink = true,
            "--unbuffered" => unbuffered = true,
            "--in-size" => {
                i += 1;
                in_item_size = parse_value(args.get(i), "--in-size")?;
            }
            "--out-size" => {
                i += 1;
                out_item_size = parse_value(args.get(i), "--out-size")?;
            }
            "--rate" => {
                i += 1;
                relative_rate = parse_value(args.get(i), "--rate")?;
            }
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => {
                if command.is_some() {
                    return Err(format!("unexpected argument: {arg}"));
                }
                command = Some(arg.to_string());
            }
        }
        i += 1;
    }

    let command = command.ok_or("missing required argument: <command>")?;
    Ok(Options {
        command,
        sink,
        in_item_size,
        out_item_size,
        relative_rate,
        unbuffered,
    })
}

fn parse_value<T: std::str::FromStr>(value: Option<&String>, flag: &str) -> Result<T, String> {
    let value = value.ok_or(format!("{flag} requires a value"))?;
    value
        .parse()
        .map_err(|_| format!("invalid value for {flag}: {value}"))
}

/// Forward our stdin in chunks. The channel disconnects at EOF, and the reader
/// blocks while the queue is full.
fn spawn_stdin_reader() -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::sync_channel(STDIN_QUEUE);
    thread::spawn(move || {
        let mut stdin = std::io::stdin().lock();
        let mut buf = vec![0u8; STDIN_CHUNK];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to read stdin");
                    break;
                }
            }
        }
    });
    rx
}

/// Move queued chunks into `pending` until it holds at least `limit` bytes.
/// Returns false once stdin is exhausted.
fn collect_stdin(rx: &Receiver<Vec<u8>>, pending: &mut Vec<u8>, limit: usize) -> bool {
    while pending.len() < limit {
        match rx.try_recv() {
            Ok(chunk) => pending.extend_from_slice(&chunk),
            Err(TryRecvError::Empty) => return true,
            Err(TryRecvError::Disconnected) => return false,
        }
    }
    true
}

fn run(options: Options) -> anyhow::Result<()> {
    info!(command = %options.command, sink = options.sink, "pipeblock {}", env!("CARGO_PKG_VERSION"));

    let rx = spawn_stdin_reader();
    if options.sink {
        run_sink(options, rx)
    } else {
        run_filter(options, rx)
    }
}

fn run_filter(options: Options, rx: Receiver<Vec<u8>>) -> anyhow::Result<()> {
    let config = FilterConfig::new(options.command)
        .with_in_item_size(options.in_item_size)
        .with_out_item_size(options.out_item_size)
        .with_relative_rate(options.relative_rate)
        .with_unbuffered(options.unbuffered);
    let mut filter = PipeFilter::new(config).context("failed to start filter")?;

    let in_size = filter.in_item_size();
    let out_size = filter.out_item_size();
    let mut output = vec![0u8; OUTPUT_ITEMS * out_size];
    let mut pending = Vec::new();
    let mut stdin_open = true;
    let mut input_finished = false;
    let mut stdout = std::io::stdout().lock();

    let wanted = filter.forecast(OUTPUT_ITEMS).max(1) * in_size;

    while !filter.is_done() {
        if stdin_open {
            stdin_open = collect_stdin(&rx, &mut pending, wanted);
        }

        let offered = wanted.min(pending.len());
        let work = filter
            .general_work(OUTPUT_ITEMS, &pending[..offered], &mut output)
            .context("filter cycle failed")?;

        if work.produced > 0 {
            stdout
                .write_all(&output[..work.produced * out_size])
                .context("failed to write stdout")?;
            stdout.flush().context("failed to flush stdout")?;
        }
        pending.drain(..work.consumed * in_size);

        if !stdin_open && !input_finished && pending.len() < in_size {
            if !pending.is_empty() {
                tracing::warn!(bytes = pending.len(), "Dropping trailing partial input item");
                pending.clear();
            }
            filter.finish_input().context("failed to close command stdin")?;
            input_finished = true;
        }

        if work.produced == 0 && work.consumed == 0 {
            thread::sleep(IDLE_SLEEP);
        }
    }

    filter.shutdown();
    Ok(())
}

fn run_sink(options: Options, rx: Receiver<Vec<u8>>) -> anyhow::Result<()> {
    let config = SinkConfig::new(options.command)
        .with_in_item_size(options.in_item_size)
        .with_unbuffered(options.unbuffered);
    let mut sink = PipeSink::new(config).context("failed to start sink")?;

    let in_size = sink.in_item_size();
    let wanted = STDIN_CHUNK.max(in_size);
    let mut pending = Vec::new();
    let mut stdin_open = true;

    while stdin_open || pending.len() >= in_size {
        if stdin_open {
            stdin_open = collect_stdin(&rx, &mut pending, wanted);
        }

        let consumed = sink.work(&pending).context("sink cycle failed")?;
        pending.drain(..consumed * in_size);

        if consumed == 0 {
            thread::sleep(IDLE_SLEEP);
        }
    }

    if !pending.is_empty() {
        tracing::warn!(bytes = pending.len(), "Dropping trailing partial input item");
    }
    sink.shutdown();
    Ok(())
}
