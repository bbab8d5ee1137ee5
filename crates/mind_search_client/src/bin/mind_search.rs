//! mind-search: terminal chat client for the Mind Search service.
//! Reads config, keeps a WebSocket session open, sends each question (positional
//! argument, or one per stdin line), streams each answer as it arrives and
//! prints its sources.

use mind_search_client::config;
use mind_search_client::{
    ChatClient, ChatSnapshot, ClientSettings, ConnectionState, Exchange, Preferences,
    ThemePreference, PLACEHOLDER,
};
use std::io::{self, Write};
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

const CONNECT_WAIT: Duration = Duration::from_secs(10);

/// Returns the config path and whether the user named it explicitly.
fn resolve_config_path(args: &[String]) -> (PathBuf, bool) {
    // 1. --config <path> flag
    if let Some(pos) = args.iter().position(|a| a == "--config") {
        if let Some(path) = args.get(pos + 1) {
            return (PathBuf::from(path), true);
        }
    }
    // 2. MIND_SEARCH_CONFIG env var
    if let Ok(val) = std::env::var(config::CONFIG_PATH_ENV) {
        return (PathBuf::from(val), true);
    }
    // 3. Default path (~/.mind-search/config.yaml)
    let path = config::default_config_path().unwrap_or_else(|| {
        eprintln!("Error: unable to determine config path (set --config or MIND_SEARCH_CONFIG)");
        process::exit(1);
    });
    (path, false)
}

/// Everything that is not `--config <path>`, joined into one question.
fn positional_question(args: &[String]) -> Option<String> {
    let mut words = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            iter.next();
            continue;
        }
        words.push(arg.as_str());
    }
    let question = words.join(" ");
    (!question.trim().is_empty()).then_some(question)
}

fn load_theme(path: Option<PathBuf>) -> Option<ThemePreference> {
    let path = path?;
    match Preferences::open(&path) {
        Ok(store) => Some(ThemePreference::load(store)),
        Err(e) => {
            eprintln!("Warning: ignoring preferences at {}: {}", path.display(), e);
            None
        }
    }
}

/// Write the part of `partial` not yet on screen. `printed` tracks what is.
fn print_partial(partial: &str, printed: &mut String) {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let _ = match partial.strip_prefix(printed.as_str()) {
        Some(suffix) => write!(out, "{}", suffix),
        None => write!(out, "\n{}", partial),
    };
    let _ = out.flush();
    printed.clear();
    printed.push_str(partial);
}

/// Complete a streamed answer: the unseen tail of the final text, then sources.
fn finish_answer(answer: &Exchange, printed: &str) {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    if answer.is_error {
        if !printed.is_empty() {
            let _ = writeln!(out);
        }
        let _ = out.flush();
        eprintln!("{}", answer.content);
        return;
    }
    let _ = match answer.content.strip_prefix(printed) {
        Some(rest) => writeln!(out, "{}", rest),
        None => writeln!(out, "\n{}", answer.content),
    };
    if !answer.sources.is_empty() {
        let _ = writeln!(out, "\nSources:");
        for source in &answer.sources {
            let _ = match &source.title {
                Some(title) => writeln!(out, "  {} ({})", title, source.url),
                None => writeln!(out, "  {}", source.url),
            };
        }
    }
    let _ = out.flush();
}

/// Submit one question and stream its answer to stdout. Returns the answer exchange.
async fn ask(client: &ChatClient, question: &str) -> Option<Exchange> {
    let mut updates = client.subscribe();
    let before = updates.borrow_and_update().exchanges.len();
    client.submit(question).ok()?;

    let mut printed = String::new();
    let mut announced = false;
    loop {
        updates.changed().await.ok()?;
        let snapshot = updates.borrow_and_update().clone();
        if !snapshot.pending && snapshot.exchanges.len() > before + 1 {
            let answer = snapshot.exchanges.last().cloned()?;
            finish_answer(&answer, &printed);
            return Some(answer);
        }
        if snapshot.partial == PLACEHOLDER {
            // Status only; the placeholder is never part of the answer text.
            if !announced {
                eprintln!("{}", PLACEHOLDER);
                announced = true;
            }
        } else if !snapshot.partial.is_empty() {
            print_partial(&snapshot.partial, &mut printed);
        }
    }
}

async fn wait_for_connection(client: &ChatClient) {
    let settled = client.wait_for(|s: &ChatSnapshot| s.connection != ConnectionState::Connecting);
    if tokio::time::timeout(CONNECT_WAIT, settled).await.is_err() {
        eprintln!("Warning: still connecting, sending anyway");
    }
}

async fn one_shot(client: &ChatClient, question: &str) -> i32 {
    match ask(client, question).await {
        Some(answer) => i32::from(answer.is_error),
        None => {
            eprintln!("Error: chat session ended unexpectedly");
            1
        }
    }
}

async fn repl(client: &ChatClient, mut theme: Option<ThemePreference>) -> i32 {
    let mut status = client.subscribe();
    let watcher = tokio::spawn(async move {
        let mut last = status.borrow().connection;
        while status.changed().await.is_ok() {
            let connection = status.borrow().connection;
            if connection != last {
                match connection {
                    ConnectionState::Open => eprintln!("[connected]"),
                    ConnectionState::Closed => eprintln!("[disconnected]"),
                    ConnectionState::Connecting => {}
                }
                last = connection;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                eprintln!("Error: failed to read stdin: {}", e);
                break;
            }
        };
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" => break,
            "/theme" => match theme.as_mut().map(ThemePreference::toggle) {
                Some(Ok(dark)) => eprintln!("Theme: {}", if dark { "dark" } else { "light" }),
                Some(Err(e)) => eprintln!("Error: failed to save theme: {}", e),
                None => eprintln!("Error: no preferences store available"),
            },
            question => {
                if ask(client, question).await.is_none() {
                    eprintln!("Error: chat session ended unexpectedly");
                    watcher.abort();
                    return 1;
                }
            }
        }
    }
    watcher.abort();
    0
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (config_path, explicit) = resolve_config_path(&args);

    let loaded = if explicit {
        config::load(&config_path)
    } else {
        config::load_or_default(&config_path)
    };
    let cfg = match loaded {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: failed to load config from {}: {}", config_path.display(), e);
            process::exit(1);
        }
    };

    let settings = ClientSettings::from_config(&cfg);
    let preferences_path = cfg
        .ui
        .preferences_path
        .as_ref()
        .map(PathBuf::from)
        .or_else(config::default_preferences_path);
    let question = positional_question(&args);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|e| {
            eprintln!("Error: failed to create runtime: {}", e);
            process::exit(1);
        });

    let code = rt.block_on(async {
        let client = ChatClient::connect(&settings);
        wait_for_connection(&client).await;

        let code = match question {
            Some(question) => one_shot(&client, &question).await,
            None => repl(&client, load_theme(preferences_path)).await,
        };
        let _ = client.shutdown().await;
        code
    });
    process::exit(code);
}
