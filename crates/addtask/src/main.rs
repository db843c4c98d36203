//! Submit a file (or an item change) to a running encode queue server and
//! wait until the server acknowledges it.
//!
//! With `--nasdir` the file is first copied to a shared directory while its
//! SHA-256 is computed, so the server can verify the copy it encodes.

use clap::{Parser, ValueEnum};
use encode_queue::hash::copy_with_hash;
use encode_queue::job::{AddMode, JobId};
use encode_queue::rpc::{
    AddQueueRequest, AddTarget, ChangeItemData, ChangeKind, ClientMessage, OutputInfo,
    ServerConnection, ServerMessage,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

/// Add a file to the encode queue
#[derive(Parser, Debug)]
#[command(name = "encode-queue-addtask")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address
    #[arg(long, default_value = "127.0.0.1")]
    ip: String,

    /// Server port
    #[arg(short, long, default_value_t = 32768)]
    port: u16,

    /// Source file to add
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Profile name (or `auto:<selector>`)
    #[arg(short = 's', long = "setting", default_value = "default")]
    profile: String,

    /// Output directory
    #[arg(short, long)]
    outdir: Option<PathBuf>,

    /// Priority 1-5
    #[arg(long, default_value_t = 3)]
    priority: u8,

    /// Hook script run by the server for every derived job
    #[arg(short = 'b', long = "bat")]
    hook: Option<String>,

    /// Copy the file into this shared directory first and send its hash
    #[arg(short = 'd', long)]
    nasdir: Option<PathBuf>,

    /// Directory under which the server sees the source
    #[arg(long)]
    remote_dir: Option<PathBuf>,

    /// Keep the local file after a shared-directory copy
    #[arg(long)]
    no_move: bool,

    /// Item to change instead of adding a file
    #[arg(long)]
    item_id: Option<JobId>,

    /// Change applied to `--item-id`
    #[arg(long, value_enum)]
    action: Option<Action>,

    /// Seconds to wait for the server's acknowledgement
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Action {
    Retry,
    UpdateProfile,
    Duplicate,
    Cancel,
    Profile,
    Priority,
    RemoveItem,
    ForceStart,
}

/// Sub-directory the local file moves to once its copy was accepted.
const TRANSFERRED_DIR: &str = "transferred";

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn change_kind(action: Action, args: &Args) -> ChangeKind {
    match action {
        Action::Retry => ChangeKind::Retry,
        Action::UpdateProfile => ChangeKind::UpdateProfile,
        Action::Duplicate => ChangeKind::Duplicate,
        Action::Cancel => ChangeKind::Cancel,
        Action::Profile => ChangeKind::Profile {
            profile: args.profile.clone(),
        },
        Action::Priority => ChangeKind::Priority {
            priority: args.priority,
        },
        Action::RemoveItem => ChangeKind::RemoveItem,
        Action::ForceStart => ChangeKind::ForceStart,
    }
}

/// Path of `file` as the server will see it.
fn server_path(file: &Path, remote_dir: Option<&Path>) -> PathBuf {
    match (remote_dir, file.file_name()) {
        (Some(dir), Some(name)) => dir.join(name),
        _ => file.to_path_buf(),
    }
}

fn add_request(
    args: &Args,
    src: PathBuf,
    hash: Option<String>,
    request_id: String,
) -> Result<ClientMessage, String> {
    let dst_dir = args
        .outdir
        .clone()
        .ok_or_else(|| "--outdir is required when adding a file".to_string())?;
    Ok(ClientMessage::AddQueue(AddQueueRequest {
        request_id: Some(request_id),
        dir_path: src.parent().map(Path::to_path_buf),
        targets: vec![AddTarget { path: src, hash }],
        outputs: vec![OutputInfo {
            dst_dir,
            profile: args.profile.clone(),
            priority: args.priority,
        }],
        mode: AddMode::AutoBatch,
        add_hook: args.hook.clone(),
        remote: args.nasdir.is_some(),
    }))
}

/// Copy `file` into `nasdir`, returning the copy's path and hash.
async fn transfer(file: &Path, nasdir: &Path) -> Result<(PathBuf, String), String> {
    let name = file
        .file_name()
        .ok_or_else(|| format!("not a file: {}", file.display()))?;
    if !file.is_file() {
        return Err(format!("input file not found: {}", file.display()));
    }
    let dst = nasdir.join(name);
    info!(from = %file.display(), to = %dst.display(), "copying to shared directory");
    let hash = copy_with_hash(file, &dst)
        .await
        .map_err(|e| format!("copy failed: {}", e))?;
    Ok((dst, hash))
}

/// Move the local original aside after its shared copy was accepted.
fn move_transferred(file: &Path) -> std::io::Result<()> {
    let (Some(dir), Some(name)) = (file.parent(), file.file_name()) else {
        return Ok(());
    };
    let dst_dir = dir.join(TRANSFERRED_DIR);
    std::fs::create_dir_all(&dst_dir)?;
    let dst = dst_dir.join(name);
    if dst.exists() {
        std::fs::remove_file(&dst)?;
    }
    std::fs::rename(file, dst)
}

/// Print server output until the acknowledgement for `request_id` arrives.
async fn wait_for_ack(
    events: &mut mpsc::Receiver<ServerMessage>,
    request_id: &str,
) -> Result<(), String> {
    while let Some(message) = events.recv().await {
        match message {
            ServerMessage::OnAddResult(r) if r.request_id.as_deref() == Some(request_id) => {
                return Ok(());
            }
            ServerMessage::OnOperationResult(r) if r.is_failed => println!("error: {}", r.message),
            ServerMessage::OnOperationResult(r) => println!("{}", r.message),
            ServerMessage::OnConsoleUpdate(c) if c.index < 0 => {
                print!("{}", String::from_utf8_lossy(&c.data))
            }
            other => debug!(method = ?other.method(), "ignored"),
        }
    }
    Err("connection task stopped".to_string())
}

async fn run(args: &Args) -> Result<(), String> {
    let request_id = uuid::Uuid::new_v4().to_string();

    let mut transferred = None;
    let message = match (&args.file, args.item_id) {
        (Some(file), _) => {
            let (src, hash) = match &args.nasdir {
                Some(nasdir) => {
                    let (copy, hash) = transfer(file, nasdir).await?;
                    transferred = Some(file.clone());
                    (copy, Some(hash))
                }
                None => (file.clone(), None),
            };
            let src = server_path(&src, args.remote_dir.as_deref());
            println!("adding {}", src.display());
            add_request(args, src, hash, request_id.clone())?
        }
        (None, Some(item_id)) => {
            let action = args
                .action
                .ok_or_else(|| "--action is required with --item-id".to_string())?;
            ClientMessage::ChangeItem(ChangeItemData {
                request_id: Some(request_id.clone()),
                item_id,
                change: change_kind(action, args),
            })
        }
        (None, None) => return Err("either --file or --item-id is required".to_string()),
    };

    let (events_tx, mut events) = mpsc::channel(256);
    let addr = format!("{}:{}", args.ip, args.port);
    let conn = ServerConnection::with_base_delay(addr, events_tx, Duration::from_secs(2));
    conn.send(message).await.map_err(|e| e.to_string())?;

    let acked = tokio::time::timeout(
        Duration::from_secs(args.timeout),
        wait_for_ack(&mut events, &request_id),
    )
    .await;
    conn.close();
    match acked {
        Ok(result) => result?,
        Err(_) => return Err("the server did not acknowledge the request".to_string()),
    }

    if let Some(file) = transferred.filter(|_| !args.no_move) {
        if let Err(e) = move_transferred(&file) {
            error!(file = %file.display(), error = %e, "failed to move transferred file");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    match run(&args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "request failed");
            ExitCode::FAILURE
        }
    }
}
