use anyhow::Context;
use clap::Parser;
use cogniflow_client::{
    document, Config, Flow, HttpBackend, StreamOutcome, UploadJob, UploadOutcome,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

#[derive(Parser, Debug)]
#[command(name = "cogniflow", about = "Chat with the CogniFlow tutor about a PDF")]
struct Args {
    /// PDF to upload before the conversation starts
    #[arg(long)]
    pdf: Option<PathBuf>,

    /// Server address (overrides COGNIFLOW_API_URL)
    #[arg(long)]
    base_url: Option<String>,

    /// Give up on an upload after this many seconds
    #[arg(long)]
    upload_timeout: Option<u64>,

    /// Give up on a reply after this many seconds
    #[arg(long)]
    reply_timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::from_env();
    if let Some(url) = args.base_url {
        config.base_url = url.trim_end_matches('/').to_string();
    }
    config.max_poll_duration = args.upload_timeout.map(Duration::from_secs);
    config.stream_timeout = args.reply_timeout.map(Duration::from_secs);

    tracing::info!(base_url = %config.base_url, "starting cogniflow client");
    let backend = Arc::new(HttpBackend::from_config(&config));
    let flow = Flow::init(backend, config);

    if let Some(greeting) = flow.conversation().lock().trailing() {
        println!("tutor> {}", greeting.content);
    }
    if let Some(path) = &args.pdf {
        upload(&flow, path).await;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("you> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await.context("reading stdin")? else {
            break;
        };
        if handle_line(&flow, line.trim()).await == Control::Quit {
            break;
        }
    }

    flow.teardown();
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum Control {
    Continue,
    Quit,
}

/// Run one line of input. Errors are reported and the session goes on.
async fn handle_line(flow: &Flow<HttpBackend>, line: &str) -> Control {
    match line.split_once(' ').map_or((line, ""), |(cmd, rest)| (cmd, rest.trim())) {
        ("/quit", _) => return Control::Quit,
        ("/reset", _) => {
            flow.reset();
            println!("(file detached, conversation cleared)");
        }
        ("/upload", path) if !path.is_empty() => upload(flow, Path::new(path)).await,
        ("/save", path) if !path.is_empty() => {
            if let Err(e) = save_document(flow, Path::new(path)).await {
                eprintln!("save failed: {:#}", e);
            }
        }
        _ => chat(flow, line).await,
    }
    Control::Continue
}

async fn upload(flow: &Flow<HttpBackend>, path: &Path) {
    let doc = match document::load(path) {
        Ok(doc) => doc,
        Err(e) => {
            eprintln!("{}", e);
            return;
        }
    };
    let progress = match flow.start_upload(&doc).await {
        Ok(Some(progress)) => progress,
        Ok(None) => {
            println!("upload cancelled");
            return;
        }
        Err(failure) => {
            eprintln!("{}", failure.user_message());
            return;
        }
    };

    let (outcome, _) = tokio::join!(flow.wait_for_upload(), show_progress(progress));
    match outcome {
        Some(UploadOutcome::Completed(id)) => println!("\rready: context active ({}...)", id.short()),
        Some(UploadOutcome::Failed(failure)) => println!("\rupload failed: {}", failure.user_message()),
        Some(UploadOutcome::Cancelled) | None => println!("\rupload cancelled"),
    }
}

async fn show_progress(mut progress: watch::Receiver<UploadJob>) {
    while progress.changed().await.is_ok() {
        let job = progress.borrow_and_update().clone();
        print!("\r[{:>3}%] {:<12} {}", job.progress, job.phase.to_string(), job.message);
        let _ = std::io::stdout().flush();
    }
    println!();
}

async fn chat(flow: &Flow<HttpBackend>, text: &str) {
    let mut printed = String::new();
    print!("tutor> ");
    let outcome = flow
        .send_message(text, |reply| {
            let mut out = std::io::stdout();
            match reply.strip_prefix(printed.as_str()) {
                Some(delta) => {
                    let _ = write!(out, "{}", delta);
                }
                None => {
                    let _ = write!(out, "\n{}", reply);
                }
            }
            let _ = out.flush();
            printed = reply.to_string();
        })
        .await;

    match outcome {
        None => println!("(empty message ignored)"),
        Some(StreamOutcome::Cancelled) => println!("\n(reply cancelled)"),
        Some(_) => println!(),
    }
}

async fn save_document(flow: &Flow<HttpBackend>, path: &Path) -> anyhow::Result<()> {
    use cogniflow_client::Backend;

    let Some(file_id) = flow.active_file() else {
        println!("no document attached");
        return Ok(());
    };
    let bytes = flow
        .backend()
        .fetch_document(&file_id)
        .await
        .with_context(|| format!("fetching document {}", file_id))?;
    tokio::fs::write(path, &bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    println!("saved {} bytes to {}", bytes.len(), path.display());
    Ok(())
}
