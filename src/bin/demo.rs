use libframewindow::{CacheError, FrameIndex, MemoryFrameStore, RecordingId, WindowedFrameCache, WindowedFrameCacheBuilder};
use libframewindow::testlib::recording_meta;

use std::fmt;
use std::io::Write;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

struct Options {
    frames: FrameIndex,
    fps: f64,
    buffer_secs: f64,
    latency_ms: u64,
    gap: Option<(FrameIndex, FrameIndex)>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ScriptAction {
    SkipForward(f64),
    SkipBackward(f64),
    SeekToFraction(f64),
}

impl ScriptAction {
    fn run(self, cache: &WindowedFrameCache) -> Result<(), CacheError> {
        match self {
            ScriptAction::SkipForward(secs) => cache.skip_forward(secs),
            ScriptAction::SkipBackward(secs) => cache.skip_backward(secs),
            ScriptAction::SeekToFraction(fraction) => cache.seek_to_fraction(fraction),
        }
    }
}

impl fmt::Display for ScriptAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptAction::SkipForward(secs) => write!(f, "skip forward {}s", secs),
            ScriptAction::SkipBackward(secs) => write!(f, "skip backward {}s", secs),
            ScriptAction::SeekToFraction(fraction) => write!(f, "seek to {:.0}%", fraction * 100.0),
        }
    }
}

/// Scripted scrubbing, keyed by the tick it fires on.
fn script(fps: f64) -> [(u64, ScriptAction); 3] {
    let ticks_per_sec = fps.round().max(1.0) as u64;
    [
        (3 * ticks_per_sec, ScriptAction::SkipForward(5.0)),
        (5 * ticks_per_sec, ScriptAction::SkipBackward(2.0)),
        (8 * ticks_per_sec, ScriptAction::SeekToFraction(0.75)),
    ]
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let opts = parse_args();

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    if let Err(e) = ctrlc::set_handler(move || flag.store(false, Ordering::SeqCst)) {
        eprintln!("Failed to install Ctrl-C handler: {}", e);
        process::exit(1);
    }

    let store = Arc::new(MemoryFrameStore::new().with_latency(Duration::from_millis(opts.latency_ms)));
    let gaps: Vec<_> = opts.gap.iter().map(|&(start, end)| start..end).collect();
    store.insert_dense(recording_meta(1, 0, opts.frames.saturating_sub(1)), &gaps);

    let cache = match WindowedFrameCacheBuilder::new()
        .buffer_duration_seconds(opts.buffer_secs)
        .frame_rate(opts.fps)
        .build(RecordingId(1), store.clone())
    {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Could not create frame cache: {}", e);
            process::exit(1);
        }
    };

    println!("Frames: {} at {:.1} fps", opts.frames, opts.fps);
    println!(
        "Window: {} frames each side, {} frames per query, {} ms store latency",
        cache.target_window_size(),
        cache.frames_per_query(),
        opts.latency_ms
    );
    println!();

    let script = script(opts.fps);

    let tick = Duration::from_secs_f64(1.0 / opts.fps);
    let start = Instant::now();
    let mut shown = 0u64;
    let mut stalled = 0u64;
    let mut last_percent = u64::MAX;
    let mut tick_no = 0u64;
    // Exhausted refills seen when the last frame was shown. More of them with an empty
    // forward queue means the recording has no frames left, even if it ends in a gap.
    let mut exhausted_at_last_frame = 0u64;

    while running.load(Ordering::SeqCst) {
        let tick_start = Instant::now();
        tick_no += 1;

        if let Some((_, action)) = script.iter().find(|(at, _)| *at == tick_no) {
            match action.run(&cache) {
                Ok(()) => println!("\n[demo] {} -> cursor {}", action, cache.cursor_index()),
                Err(e) => eprintln!("\n[demo] {} failed: {}", action, e),
            }
            exhausted_at_last_frame = cache.stats().refills_exhausted;
        }

        match cache.advance() {
            Some(_) => {
                shown += 1;
                exhausted_at_last_frame = cache.stats().refills_exhausted;
            }
            None if cache.progress() >= 1.0 => break,
            None if cache.forward_buffer_size() == 0
                && cache.stats().refills_exhausted > exhausted_at_last_frame =>
            {
                println!("\n[demo] no frames left after cursor {}", cache.cursor_index());
                break;
            }
            None => stalled += 1,
        }

        let percent = (cache.progress() * 100.0) as u64;
        if percent != last_percent {
            print!(
                "\rProgress: {:3}% (cursor {}, ahead {}, behind {})",
                percent,
                cache.cursor_index(),
                cache.forward_buffer_size(),
                cache.history_buffer_size()
            );
            let _ = std::io::stdout().flush();
            last_percent = percent;
        }

        if let Some(rest) = tick.checked_sub(tick_start.elapsed()) {
            std::thread::sleep(rest);
        }
    }

    let stats = cache.stats();
    println!("\n");
    println!("Played {} frames in {:.2} s, {} ticks spent buffering", shown, start.elapsed().as_secs_f64(), stalled);
    println!(
        "Refills: {} completed, {} skipped, {} failed; {} requests ({} coalesced)",
        stats.refills_completed,
        stats.refills_skipped,
        stats.refills_failed,
        stats.refill_requests,
        stats.refill_requests_coalesced
    );
    println!(
        "Store: {} queries, {} frames fetched, {} empty probes",
        store.query_count(),
        stats.frames_fetched,
        stats.empty_probes
    );
}

fn parse_args() -> Options {
    let mut opts = Options {
        frames: 600,
        fps: 30.0,
        buffer_secs: 2.0,
        latency_ms: 20,
        gap: None,
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        let value = match args.next() {
            Some(val) => val,
            None => {
                eprintln!("Expected a value after {}", arg);
                print_usage_and_exit();
            }
        };
        let parsed = match arg.as_str() {
            "--frames" => value.parse().map(|v| opts.frames = v).is_ok(),
            "--fps" => value.parse().map(|v| opts.fps = v).is_ok(),
            "--buffer" => value.parse().map(|v| opts.buffer_secs = v).is_ok(),
            "--latency-ms" => value.parse().map(|v| opts.latency_ms = v).is_ok(),
            "--gap" => match value.split_once("..") {
                Some((a, b)) => match (a.parse(), b.parse()) {
                    (Ok(a), Ok(b)) => {
                        opts.gap = Some((a, b));
                        true
                    }
                    _ => false,
                },
                None => false,
            },
            _ => {
                eprintln!("Unknown argument: {}", arg);
                print_usage_and_exit();
            }
        };
        if !parsed {
            eprintln!("Invalid value for {}: {}", arg, value);
            print_usage_and_exit();
        }
    }
    if opts.frames == 0 || !(opts.fps > 0.0) {
        eprintln!("--frames and --fps must be positive");
        print_usage_and_exit();
    }
    opts
}

fn print_usage_and_exit() -> ! {
    eprintln!("Usage: demo [--frames N] [--fps F] [--buffer SECS] [--latency-ms MS] [--gap START..END]");
    process::exit(1);
}
