use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use url::Url;
use vto_cli::client::{
    HttpTransport, NotifyOutcome, OfflineTransport, UploadClient, GENERATED_FILE_NAME,
};
use vto_cli::debug::render_debug_panel;
use vto_contracts::notify::{EmbeddingContext, OriginPolicy, OutboxWriter};
use vto_engine::{select_backend, BackendConfig};
use vto_server::AppState;

const DEFAULT_SERVER: &str = "http://localhost:3000";

#[derive(Debug, Parser)]
#[command(name = "vto-rs", version, about = "Virtual try-on server and upload client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the try-on HTTP server.
    Serve(ServeArgs),
    /// Upload photos to a running server and save the generated image.
    Submit(SubmitArgs),
    /// Post a synthetic result notification to the outbox.
    TestNotify(TestNotifyArgs),
    /// Check that a server answers on its test image route.
    Probe(ProbeArgs),
}

#[derive(Debug, Parser)]
struct ServeArgs {
    #[arg(long, default_value = "0.0.0.0:3000")]
    bind: SocketAddr,
    #[arg(long, default_value_t = 20)]
    max_upload_mb: usize,
}

#[derive(Debug, Args)]
struct ContextArgs {
    /// The client runs inside a host page or application.
    #[arg(long)]
    embedded: bool,
    #[arg(long)]
    parent_origin: Option<String>,
    #[arg(long)]
    product_id: Option<String>,
    #[arg(long)]
    variant_id: Option<String>,
    #[arg(long)]
    debug: bool,
    /// Development only: notify `*` when not embedded and no origin is known.
    #[arg(long)]
    allow_any_origin: bool,
    /// JSONL file standing in for the host's message channel.
    #[arg(long)]
    outbox: Option<PathBuf>,
}

impl ContextArgs {
    fn context(&self) -> EmbeddingContext {
        EmbeddingContext {
            embedded: self.embedded,
            parent_origin: self.parent_origin.clone(),
            product_id: self.product_id.clone(),
            variant_id: self.variant_id.clone(),
            debug: self.debug,
        }
    }

    fn origin_policy(&self) -> OriginPolicy {
        if self.allow_any_origin {
            OriginPolicy::AllowWildcard
        } else {
            OriginPolicy::Strict
        }
    }

    fn outbox_path(&self, out_dir: &Path) -> PathBuf {
        self.outbox
            .clone()
            .unwrap_or_else(|| out_dir.join("messages.jsonl"))
    }
}

#[derive(Debug, Parser)]
struct SubmitArgs {
    #[arg(long, default_value = DEFAULT_SERVER)]
    server: String,
    #[arg(long)]
    user_photo: Option<PathBuf>,
    #[arg(long)]
    clothing_photo: Option<PathBuf>,
    #[arg(long, default_value = GENERATED_FILE_NAME)]
    out: PathBuf,
    #[arg(long)]
    timeout_secs: Option<u64>,
    #[command(flatten)]
    context: ContextArgs,
}

#[derive(Debug, Parser)]
struct TestNotifyArgs {
    #[command(flatten)]
    context: ContextArgs,
}

#[derive(Debug, Parser)]
struct ProbeArgs {
    #[arg(long, default_value = DEFAULT_SERVER)]
    server: String,
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("vto-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => {
            run_serve(args)?;
            Ok(0)
        }
        Command::Submit(args) => run_submit(args),
        Command::TestNotify(args) => run_test_notify(args),
        Command::Probe(args) => run_probe(args),
    }
}

fn run_serve(args: ServeArgs) -> Result<()> {
    let max_upload_bytes = upload_limit_bytes(args.max_upload_mb)?;
    vto_server::init_tracing();
    let config = BackendConfig::from_env();
    let missing = config.missing_credentials();
    if !missing.is_empty() {
        eprintln!(
            "vto-rs warning: {} not set; try-on requests will fail until configured",
            missing.join(", ")
        );
    }
    eprintln!("vto-rs serve: {}", config.describe());

    // The blocking backend client must be built outside the async runtime.
    let backend = select_backend(&config)?;
    let state = AppState::new(backend).with_max_upload_bytes(max_upload_bytes);
    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    runtime.block_on(vto_server::serve(args.bind, state))
}

fn upload_limit_bytes(max_upload_mb: usize) -> Result<usize> {
    max_upload_mb
        .checked_mul(1024 * 1024)
        .with_context(|| format!("--max-upload-mb {max_upload_mb} is too large"))
}

fn run_submit(args: SubmitArgs) -> Result<i32> {
    let transport = HttpTransport::new(&args.server, args.timeout_secs.map(Duration::from_secs))?;
    let mut client = UploadClient::new(transport, args.context.context())
        .with_origin_policy(args.context.origin_policy());

    if let Some(path) = &args.user_photo {
        client.select_user_photo(path)?;
    }
    if let Some(path) = &args.clothing_photo {
        client.select_clothing_photo(path)?;
    }

    if client.generate().is_none() {
        if let Some(panel) = render_debug_panel(&client) {
            eprintln!("{panel}");
        }
        eprintln!(
            "vto-rs: {}",
            client.error().unwrap_or("Image generation failed")
        );
        return Ok(2);
    }

    let saved = client.save_result(&args.out)?;
    println!("saved {}", saved.display());

    let absolute = saved
        .canonicalize()
        .with_context(|| format!("failed to resolve {}", saved.display()))?;
    let result_url = Url::from_file_path(&absolute)
        .map_err(|_| anyhow!("cannot express {} as a file URL", absolute.display()))?;
    let out_dir = absolute
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let outbox = OutboxWriter::new(args.context.outbox_path(&out_dir));
    report_notification(client.notify_result(&outbox, result_url.as_str())?, &outbox);

    if let Some(panel) = render_debug_panel(&client) {
        eprintln!("{panel}");
    }
    Ok(0)
}

fn run_test_notify(args: TestNotifyArgs) -> Result<i32> {
    let mut context = args.context.context();
    context.debug = true;
    let mut client = UploadClient::new(OfflineTransport, context)
        .with_origin_policy(args.context.origin_policy());

    let cwd = std::env::current_dir().context("failed to read current directory")?;
    let outbox = OutboxWriter::new(args.context.outbox_path(&cwd));
    let outcome = client.send_test_notification(&outbox)?;
    let sent = matches!(outcome, NotifyOutcome::Sent { .. });
    report_notification(outcome, &outbox);
    if let Some(panel) = render_debug_panel(&client) {
        println!("{panel}");
    }
    Ok(if sent { 0 } else { 2 })
}

fn run_probe(args: ProbeArgs) -> Result<i32> {
    let transport = HttpTransport::new(&args.server, Some(Duration::from_secs(args.timeout_secs)))?;
    let client = UploadClient::new(transport, EmbeddingContext::default());
    let image = client.probe()?;
    println!(
        "ok: {} returned {} ({} bytes)",
        args.server,
        image.mime_type,
        image.bytes.len()
    );
    Ok(0)
}

fn report_notification(outcome: NotifyOutcome, outbox: &OutboxWriter) {
    match outcome {
        NotifyOutcome::Sent {
            payload,
            target_origin,
        } => println!(
            "notified {} ({}) via {}",
            target_origin.as_str(),
            payload.source,
            outbox.path().display()
        ),
        NotifyOutcome::Withheld { reason } => eprintln!("vto-rs: {reason}"),
    }
}
