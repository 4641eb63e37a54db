use clap::Parser;
use miracast::{AdbConfig, AdbRegistry, DaemonBootstrap, DaemonConfig, PushSource, RtspListener};
use std::io;
use std::path::PathBuf;
use std::thread;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "miracast-source",
    about = "Wi-Fi Display source: RTSP capability negotiation plus ADB daemon bootstrap"
)]
struct Args {
    /// RTSP bind address (host:port)
    #[arg(long, short, default_value = "0.0.0.0:7236")]
    bind: String,

    /// Device to connect to over ADB
    #[arg(long, short)]
    target: Option<String>,

    /// ADB daemon TCP port
    #[arg(long, default_value_t = miracast::adb::DEFAULT_ADB_PORT)]
    adb_port: u16,

    /// Daemon APK to install on the target when missing
    #[arg(long)]
    daemon_apk: Option<PathBuf>,

    /// Debug logging unless RUST_LOG says otherwise
    #[arg(long, short)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let mut listener = RtspListener::new(&args.bind);
    let rtsp_events = listener.subscribe();
    if let Err(e) = listener.start() {
        eprintln!("Failed to start RTSP listener: {}", e);
        return;
    }
    thread::spawn(move || {
        for event in rtsp_events.iter() {
            println!("[rtsp {}] {:?}", event.peer, event.kind);
        }
    });

    let registry = AdbRegistry::new(AdbConfig::default(), None);
    let adb_events = registry.subscribe();
    thread::spawn(move || {
        for event in adb_events.iter() {
            println!("[adb {}] {:?}", event.ip, event.kind);
        }
    });

    let mut bootstrap = None;
    if let Some(target) = &args.target {
        if let Some(apk) = &args.daemon_apk {
            let daemon = DaemonBootstrap::new(target, DaemonConfig::default());
            bootstrap = Some(daemon.spawn(registry.clone(), PushSource::File(apk.clone())));
        }
        if let Err(e) = registry.connect(target, args.adb_port) {
            eprintln!("Failed to connect to {}: {}", target, e);
        }
    }

    println!("Wi-Fi Display source on {}, press Enter to stop", args.bind);
    let mut input = String::new();
    if let Err(e) = io::stdin().read_line(&mut input) {
        eprintln!("stdin: {}", e);
    }

    if let Some(mut handle) = bootstrap {
        handle.stop();
    }
    registry.release();
    listener.stop();
}
