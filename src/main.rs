use clap::{Parser, Subcommand};
use signage_player::clock::SystemClock;
use signage_player::config::PlayerConfig;
use signage_player::error::{Error, Result};
use signage_player::local_content::DirLocalContent;
use signage_player::program::Program;
use signage_player::render::LogRenderer;
use signage_player::runtime::{spawn_player_runtime, RuntimeContext, RuntimeEvent};
use signage_player::schedule::ScheduleDocument;
use signage_player::smart;
use signage_player::status::{JsonFileSink, StatusSink, TracingSink};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "signage", about = "Digital signage playback engine", version)]
struct Cli {
    /// Config file (overrides SIGNAGE_CONFIG)
    #[arg(short, long, global = true, env = "SIGNAGE_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play a schedule with the logging renderer
    Run {
        /// Schedule document (JSON)
        schedule: PathBuf,
        /// Program to play (overrides the `program` parameter)
        #[arg(short, long)]
        program: Option<String>,
        /// Stop after this many seconds
        #[arg(long)]
        seconds: Option<u64>,
        /// Re-read the schedule this often and reload on a new version
        #[arg(long, default_value_t = 5)]
        watch: u64,
    },
    /// Parse a schedule and list what it would play
    Check {
        schedule: PathBuf,
        #[arg(short, long)]
        program: Option<String>,
    },
    /// Show which smart windows are active at a time of day
    Windows {
        schedule: PathBuf,
        #[arg(short, long)]
        program: Option<String>,
        /// Time of day, HH:MM:SS
        #[arg(long)]
        at: String,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("signage_player=info,signage=info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = dispatch(cli) {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn dispatch(cli: Cli) -> Result<()> {
    let mut config = PlayerConfig::load_or_default(cli.config.as_deref())?;
    match cli.command {
        Commands::Run {
            schedule,
            program,
            seconds,
            watch,
        } => {
            if let Some(name) = program {
                config.parameters.set("program", name);
            }
            run(&schedule, config, seconds, Duration::from_secs(watch.max(1)))
        }
        Commands::Check { schedule, program } => {
            if let Some(name) = program {
                config.parameters.set("program", name);
            }
            check(&schedule, &config)
        }
        Commands::Windows {
            schedule,
            program,
            at,
        } => {
            if let Some(name) = program {
                config.parameters.set("program", name);
            }
            windows(&schedule, &config, &at)
        }
    }
}

fn content_root(config: &PlayerConfig, schedule: &Path) -> PathBuf {
    config.content_root.clone().unwrap_or_else(|| {
        schedule
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    })
}

fn run(schedule: &Path, config: PlayerConfig, seconds: Option<u64>, watch: Duration) -> Result<()> {
    let doc = ScheduleDocument::load(schedule)?;
    let root = content_root(&config, schedule);
    info!(
        "signage v{} playing {} (version {})",
        env!("CARGO_PKG_VERSION"),
        schedule.display(),
        doc.version
    );

    let ctx = RuntimeContext {
        clock: Box::new(SystemClock),
        config: config.clone(),
        local: Box::new(DirLocalContent::new(root.clone())),
    };
    let (tx, rx) = std::sync::mpsc::channel::<RuntimeEvent>();
    let mut current_version = doc.version.clone();
    let handle = spawn_player_runtime(
        ctx,
        move |now| {
            let local = DirLocalContent::new(root);
            let sink: Box<dyn StatusSink> = match &config.status_file {
                Some(path) => Box::new(JsonFileSink::new(path)),
                None => Box::new(TracingSink),
            };
            Program::from_document(&doc, &config, &local, Box::new(LogRenderer), sink, now)
        },
        move |evt| {
            let _ = tx.send(evt);
        },
    )?;

    let started = Instant::now();
    loop {
        match rx.recv_timeout(watch) {
            Ok(RuntimeEvent::StartFailed(e)) => return Err(Error::Schedule(e)),
            Ok(RuntimeEvent::Stopped) => return Ok(()),
            Ok(RuntimeEvent::ReloadFailed(e)) => warn!("reload failed: {}", e),
            Ok(evt) => info!(?evt, "runtime"),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => return Ok(()),
        }
        if seconds.is_some_and(|s| started.elapsed() >= Duration::from_secs(s)) {
            handle.shutdown();
            // Drain until the thread reports it has stopped.
            while let Ok(evt) = rx.recv_timeout(Duration::from_secs(2)) {
                if evt == RuntimeEvent::Stopped {
                    break;
                }
            }
            return Ok(());
        }
        match ScheduleDocument::load(schedule) {
            Ok(next) if next.version != current_version => {
                current_version = next.version.clone();
                handle.reload(next);
            }
            Ok(_) => {}
            Err(e) => warn!("cannot re-read {}: {}", schedule.display(), e),
        }
    }
}

fn check(schedule: &Path, config: &PlayerConfig) -> Result<()> {
    let doc = ScheduleDocument::load(schedule)?;
    let program = doc.program(config.parameters.program())?;
    let local = DirLocalContent::new(content_root(config, schedule));
    let now = chrono::Local::now().naive_local();
    let built = program.build(now, &config.engine, &local);

    println!("Program: {} (schedule version {})", built.name, doc.version);
    for pl in &built.playlists {
        let kind = if pl.is_smart() { "smart" } else { "playlist" };
        println!("  {} {}: {} item(s)", kind, pl.name, pl.len());
        for item in &pl.items {
            let extra = item
                .placeholder()
                .map(|ph| format!(" slot {} ({} local)", ph.slot, ph.local.len()))
                .unwrap_or_default();
            println!(
                "    [{}] {} {}s{}{}",
                item.content_type(),
                item.source(),
                item.duration.as_secs(),
                if item.full_screen { " fullscreen" } else { "" },
                extra
            );
        }
        if let Some(s) = &pl.smart {
            for w in &s.windows {
                println!(
                    "    window {} +{}s play_count={}{}",
                    smart::format_time_of_day(w.start),
                    w.duration,
                    w.play_count,
                    if w.full_screen { " fullscreen" } else { "" }
                );
            }
        }
    }
    if built.problems.is_empty() {
        println!("No problems.");
    } else {
        println!("Problems:");
        for p in &built.problems {
            println!("  {}", p);
        }
    }
    Ok(())
}

fn windows(schedule: &Path, config: &PlayerConfig, at: &str) -> Result<()> {
    let tod = smart::parse_time_of_day(at)?;
    let doc = ScheduleDocument::load(schedule)?;
    let program = doc.program(config.parameters.program())?;
    let local = DirLocalContent::new(content_root(config, schedule));
    let built = program.build(chrono::Local::now().naive_local(), &config.engine, &local);

    let mut any = false;
    for pl in &built.playlists {
        let Some(s) = &pl.smart else { continue };
        any = true;
        match s.active_window(tod) {
            Some(i) => println!("{}: active (window {} from {})", s.target, i + 1, smart::format_time_of_day(s.windows[i].start)),
            None => println!("{}: inactive", s.target),
        }
    }
    if !any {
        println!("No smart playlists in program {}.", built.name);
    }
    Ok(())
}
