use std::{
    fs::{File, OpenOptions},
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use clap::Parser;
use fastchat_client::{
    ChatSession, ClientHandlers, Reconciliation, Settings,
    settings::{SETTINGS_FILE_NAME, load_from_path, save_to_path, settings_dir},
    terminal::{Command, HELP, attachment_from_file, format_envelope, parse_command},
};
use fastchat_relay::RelayConfig;
use tokio::{runtime::Runtime, sync::mpsc};
use tracing::{info, warn};
use tracing_subscriber::fmt::MakeWriter;

#[derive(Parser, Debug)]
#[command(name = "fastchat", about = "Terminal chat client with an optional embedded relay")]
struct ClientArgs {
    /// Relay to connect to, e.g. ws://192.168.1.20:8765
    #[arg(long)]
    server_url: Option<String>,
    /// Display name sent with every message.
    #[arg(long)]
    name: Option<String>,
    /// Run the relay inside this process and connect to it.
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    host_mode: Option<bool>,
    /// Directory holding settings.json.
    #[arg(long)]
    config_dir: Option<PathBuf>,
    /// Append logs to this file instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

struct FileMakeWriter {
    file: Arc<Mutex<File>>,
}

struct FileWriterGuard {
    file: Arc<Mutex<File>>,
}

impl Write for FileWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.flush()
    }
}

impl<'a> MakeWriter<'a> for FileMakeWriter {
    type Writer = FileWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        FileWriterGuard {
            file: Arc::clone(&self.file),
        }
    }
}

fn init_logging(log_file: Option<&Path>) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));

    let Some(log_path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(io::stderr)
            .init();
        return;
    };

    let file = match OpenOptions::new().create(true).append(true).open(log_path) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("failed to open log file {}: {err}", log_path.display());
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(io::stderr)
                .init();
            return;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(false)
        .with_writer(FileMakeWriter {
            file: Arc::new(Mutex::new(file)),
        })
        .init();
}

fn load_settings(args: &ClientArgs, settings_path: &Path) -> Result<Settings, String> {
    let mut settings = match load_from_path(settings_path) {
        Ok(Some(settings)) => settings,
        Ok(None) => Settings::default(),
        Err(err) => {
            warn!("ignoring saved settings: {err}");
            Settings::default()
        }
    };

    let mut overridden = false;
    if let Some(server_url) = &args.server_url {
        settings.server_url = server_url.clone();
        overridden = true;
    }
    if let Some(name) = &args.name {
        settings.user_name = name.clone();
        overridden = true;
    }
    if let Some(host_mode) = args.host_mode {
        settings.host_mode = host_mode;
        overridden = true;
    }

    let settings = settings.normalized();
    settings.validate().map_err(|err| err.to_string())?;

    if overridden && let Err(err) = save_to_path(settings_path, &settings) {
        warn!("failed to save settings: {err}");
    }
    Ok(settings)
}

fn describe(outcome: &Reconciliation) -> Option<String> {
    match outcome {
        Reconciliation::Unchanged => None,
        Reconciliation::Started { redirected: true } => {
            Some("host mode on, now connected through the local relay".to_owned())
        }
        Reconciliation::Started { redirected: false } => Some("host mode on".to_owned()),
        Reconciliation::Stopped => Some("host mode off".to_owned()),
        Reconciliation::StartFailed(reason) => {
            Some(format!("host mode disabled, relay failed to start: {reason}"))
        }
    }
}

fn report(result: Result<Reconciliation, fastchat_client::SettingsError>) {
    match result {
        Ok(outcome) => {
            if let Some(text) = describe(&outcome) {
                println!("* {text}");
            }
        }
        Err(err) => println!("* {err}"),
    }
}

async fn run(settings: Settings, settings_path: PathBuf, mut lines: mpsc::UnboundedReceiver<String>) {
    let handlers = ClientHandlers::new()
        .on_message(|envelope| println!("{}", format_envelope(envelope)))
        .on_history_replaced(|entries| {
            println!("-- {} earlier message(s) --", entries.len());
            for envelope in entries {
                println!("{}", format_envelope(envelope));
            }
        })
        .on_state_change(|state| println!("* {state}"));

    let mut session = ChatSession::start(settings, settings_path, RelayConfig::default(), handlers);
    report(session.initialize().await);

    let mut secret: Option<String> = None;
    loop {
        let line = tokio::select! {
            line = lines.recv() => line,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };

        let command = match parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(usage) => {
                println!("* {usage}");
                continue;
            }
        };

        match command {
            Command::Say(text) => {
                if let Err(err) = session.send(text, Vec::new()) {
                    println!("* {err}");
                }
            }
            Command::Image(path) => {
                let sent = attachment_from_file(&path)
                    .and_then(|attachment| session.send(String::new(), vec![attachment]));
                if let Err(err) = sent {
                    println!("* {err}");
                }
            }
            Command::Host(enabled) => {
                report(session.set_host_mode(enabled, secret.as_deref()).await);
            }
            Command::Server(url) => {
                let mut next = session.settings().clone();
                next.server_url = url;
                report(session.apply_settings(next, secret.as_deref()).await);
            }
            Command::Name(name) => {
                let mut next = session.settings().clone();
                next.user_name = name;
                report(session.apply_settings(next, secret.as_deref()).await);
            }
            Command::History => {
                for envelope in session.client().transcript() {
                    println!("{}", format_envelope(&envelope));
                }
            }
            Command::Unlock(candidate) => {
                secret = Some(candidate);
                println!("* secret stored for this session");
            }
            Command::Help => println!("{HELP}"),
            Command::Quit => break,
        }
    }

    info!("shutting down");
    session.shutdown().await;
}

fn main() {
    let args = ClientArgs::parse();
    init_logging(args.log_file.as_deref());

    let settings_path = settings_dir(args.config_dir.as_deref()).join(SETTINGS_FILE_NAME);
    let settings = match load_settings(&args, &settings_path) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(2);
        }
    };

    let runtime = match Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("tokio runtime init failed: {err}");
            std::process::exit(1);
        }
    };

    // stdin is read on its own thread; lines cross into the runtime over
    // the channel.
    let (line_tx, line_rx) = mpsc::unbounded_channel::<String>();
    let reader = std::thread::Builder::new()
        .name("fastchat-stdin".to_owned())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                if line_tx.send(line).is_err() {
                    break;
                }
            }
        });
    if let Err(err) = reader {
        eprintln!("failed to start input thread: {err}");
        std::process::exit(1);
    }

    println!("connecting to {} as {} (/help for commands)", settings.server_url, settings.user_name);
    runtime.block_on(run(settings, settings_path, line_rx));
    runtime.shutdown_background();
}
