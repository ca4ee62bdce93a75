use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use plan3d_contracts::assets::AssetRef;
use plan3d_contracts::commands::{parse_intent, Intent, CHAT_HELP_COMMANDS};
use plan3d_contracts::errors::PipelineError;
use plan3d_contracts::events::EventWriter;
use plan3d_contracts::history::HistoryEntry;
use plan3d_contracts::pipeline::{ArtifactKind, ImageItem, ItemId};
use plan3d_engine::{
    select_entry, ActionOutcome, AssetFetcher, Coordinator, EngineConfig, FrameFileRenderer,
    SceneRenderer, DEFAULT_HISTORY_PAGE_SIZE,
};
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "plan3d", version, about = "Floorplan to 3D pipeline coordinator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Chat(ChatArgs),
    Run(RunArgs),
    History(HistoryArgs),
    Fetch(FetchArgs),
}

#[derive(Debug, Args)]
struct EngineArgs {
    /// JSON config file; environment variables override it.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Preprocessing layout preset: `depth` or `segmented`.
    #[arg(long)]
    layout: Option<String>,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[arg(long, default_value = "plan3d-out")]
    out: PathBuf,
    /// Frame exported by the 3D viewer, used by /capture.
    #[arg(long)]
    frame: Option<PathBuf>,
    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Debug, Parser)]
struct RunArgs {
    #[arg(long)]
    image: String,
    #[arg(long)]
    prompt: Option<String>,
    #[arg(long)]
    style_prompt: Option<String>,
    #[arg(long)]
    frame: Option<PathBuf>,
    #[arg(long, default_value = "plan3d-out")]
    out: PathBuf,
    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Debug, Parser)]
struct HistoryArgs {
    #[arg(long, default_value_t = DEFAULT_HISTORY_PAGE_SIZE)]
    limit: usize,
    #[arg(long)]
    task_id: Option<String>,
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct FetchArgs {
    #[arg(long)]
    url: String,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
}

struct Session {
    coordinator: Coordinator,
    config: EngineConfig,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("plan3d error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Chat(args) => {
            run_chat(args)?;
            Ok(0)
        }
        Command::Run(args) => run_pipeline(args),
        Command::History(args) => run_history(args),
        Command::Fetch(args) => run_fetch(args),
    }
}

fn open_session(args: &EngineArgs, out: &Path, command: &str) -> Result<Session> {
    let mut config = EngineConfig::load(args.config.as_deref())?;
    if let Some(layout) = args.layout.as_deref() {
        config.set_layout_preset(layout)?;
    }
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| out.join("events.jsonl"));
    let coordinator = Coordinator::from_config(&config)
        .with_events(EventWriter::new(events_path, Uuid::new_v4().to_string()));
    let steps: Vec<&str> = coordinator
        .layout()
        .steps
        .iter()
        .map(|policy| policy.step.as_str())
        .collect();
    coordinator.emit_event(
        "session_started",
        json!({ "command": command, "layout": steps, "out_dir": out.display().to_string() }),
    )?;
    Ok(Session {
        coordinator,
        config,
    })
}

fn finish_session(session: &Session) -> Result<()> {
    let items: Vec<Value> = session
        .coordinator
        .items()
        .iter()
        .map(|item| json!({ "item_id": item.id.as_str(), "stage": item.stage.as_str() }))
        .collect();
    session
        .coordinator
        .emit_event("session_finished", json!({ "items": items }))
}

fn run_chat(args: ChatArgs) -> Result<()> {
    let session = open_session(&args.engine, &args.out, "chat")?;
    let fetcher = AssetFetcher::new(session.config.proxy_base.clone());
    let stdin = io::stdin();
    let mut line = String::new();
    let mut listing: Vec<HistoryEntry> = Vec::new();

    println!("plan3d chat started. Type /help for commands.");

    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let input = line.trim_end_matches(['\n', '\r']);
        let intent = parse_intent(input);
        if intent.action == "noop" {
            continue;
        }
        let coordinator = &session.coordinator;

        match intent.action.as_str() {
            "help" => {
                println!("Commands: {}", CHAT_HELP_COMMANDS.join(" "));
            }
            "quit" => break,
            "upload" => {
                let Some(raw) = intent.arg_str("path") else {
                    println!("/upload requires a path or URL");
                    continue;
                };
                let source = AssetRef::classify(raw);
                if let Some(path) = source.local_path().filter(|path| !path.exists()) {
                    println!("Upload failed: file not found ({})", path.display());
                    continue;
                }
                match coordinator.upload(source) {
                    Ok(id) => println!("Uploaded {raw} as item {id}"),
                    Err(err) => println!("Upload failed: {err}"),
                }
            }
            "enhance" | "generate" | "stylize" | "retry" | "capture" => {
                let Some(id) = active_item(coordinator) else {
                    continue;
                };
                let before = log_len(coordinator, &id);
                let result = match intent.action.as_str() {
                    "enhance" => coordinator.enhance(&id, intent.prompt.clone()),
                    "generate" => coordinator.generate(&id, intent.prompt.clone()),
                    "stylize" => coordinator.stylize(&id, intent.prompt.clone()),
                    "retry" => coordinator.retry(&id),
                    _ => {
                        let frame = intent
                            .arg_str("path")
                            .map(PathBuf::from)
                            .or_else(|| args.frame.clone());
                        let mut renderer = frame.map(FrameFileRenderer::new);
                        coordinator.capture_view(
                            &id,
                            renderer
                                .as_mut()
                                .map(|renderer| renderer as &mut dyn SceneRenderer),
                        )
                    }
                };
                print_new_log(coordinator, &id, before);
                report(&intent.action, result);
            }
            "set_options" => set_options(coordinator, &intent),
            "remove" => {
                let Some(id) = active_item(coordinator) else {
                    continue;
                };
                match coordinator.remove(&id) {
                    Ok(true) => println!("Removed item {id}"),
                    Ok(false) => println!("Item {id} was already gone"),
                    Err(err) => println!("Remove failed: {err}"),
                }
            }
            "status" => match coordinator.active_id().and_then(|id| coordinator.snapshot(&id)) {
                Some(item) => print_status(&item),
                None => println!("No items. Use /upload or /open first."),
            },
            "history" => {
                let limit = intent
                    .command_args
                    .get("limit")
                    .and_then(Value::as_u64)
                    .and_then(|value| usize::try_from(value).ok())
                    .unwrap_or(DEFAULT_HISTORY_PAGE_SIZE);
                match coordinator.list_history(limit) {
                    Ok(entries) => {
                        if entries.is_empty() {
                            println!("No past jobs.");
                        }
                        for (index, entry) in entries.iter().enumerate() {
                            println!("{:>2}. {}", index + 1, entry.summary_line());
                        }
                        listing = entries;
                    }
                    Err(err) => println!("History failed: {err}"),
                }
            }
            "open" => {
                let Some(target) = intent.arg_str("target") else {
                    println!("Usage: /open <index|task_id>");
                    continue;
                };
                let entry = match select_entry(&listing, target) {
                    Some(entry) => Ok(entry.clone()),
                    None => coordinator.history_entry(target),
                };
                match entry.and_then(|entry| coordinator.load_history(entry)) {
                    Ok(id) => println!("Opened job {target} as item {id}"),
                    Err(err) => println!("Open failed: {err}"),
                }
            }
            "fetch" => {
                let Some(id) = active_item(coordinator) else {
                    continue;
                };
                let dir = intent
                    .arg_str("path")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| args.out.clone());
                match download_mesh(coordinator, &fetcher, &id, &dir) {
                    Ok(path) => println!("Saved mesh to {}", path.display()),
                    Err(err) => println!("Fetch failed: {err:#}"),
                }
            }
            "unknown" => {
                let command = intent.arg_str("command").unwrap_or_default();
                println!("Unknown command: /{command}. Type /help for commands.");
            }
            other => println!("Unhandled action: {other}"),
        }
    }

    finish_session(&session)
}

fn run_pipeline(args: RunArgs) -> Result<i32> {
    let session = open_session(&args.engine, &args.out, "run")?;
    let result = run_pipeline_steps(&session, &args);
    finish_session(&session)?;
    result
}

fn run_pipeline_steps(session: &Session, args: &RunArgs) -> Result<i32> {
    let coordinator = &session.coordinator;
    let source = AssetRef::classify(&args.image);
    if let Some(path) = source.local_path().filter(|path| !path.exists()) {
        bail!("image not found: {}", path.display());
    }
    let id = coordinator.upload(source)?;

    let outcome = coordinator.generate(&id, args.prompt.clone());
    print_new_log(coordinator, &id, 0);
    require_completed("generate", outcome)?;

    let fetcher = AssetFetcher::new(session.config.proxy_base.clone());
    let mesh_path = download_mesh(coordinator, &fetcher, &id, &args.out)?;
    println!("Saved mesh to {}", mesh_path.display());

    let Some(style_prompt) = args.style_prompt.clone() else {
        return Ok(0);
    };
    let before = log_len(coordinator, &id);
    let mut renderer = args.frame.clone().map(FrameFileRenderer::new);
    let captured = coordinator.capture_view(
        &id,
        renderer
            .as_mut()
            .map(|renderer| renderer as &mut dyn SceneRenderer),
    );
    if let Err(err) = captured {
        println!("Skipping stylize: {err}");
        return Ok(0);
    }
    let outcome = coordinator.stylize(&id, Some(style_prompt));
    print_new_log(coordinator, &id, before);
    require_completed("stylize", outcome)?;
    if let Some(render) = coordinator
        .snapshot(&id)
        .and_then(|item| item.artifact(ArtifactKind::StylizedImage).cloned())
    {
        println!("Render: {}", render.label());
    }
    Ok(0)
}

fn run_history(args: HistoryArgs) -> Result<i32> {
    let config = EngineConfig::load(args.config.as_deref())?;
    let coordinator = Coordinator::from_config(&config);
    if let Some(task_id) = args.task_id.as_deref() {
        let entry = coordinator.history_entry(task_id)?;
        println!("{}", entry.summary_line());
        if let Some(mesh) = entry.mesh.as_ref() {
            println!("mesh: {}", mesh.label());
        }
        if let Some(thumbnail) = entry.thumbnail.as_deref() {
            println!("thumbnail: {thumbnail}");
        }
        return Ok(0);
    }
    let entries = coordinator.list_history(args.limit)?;
    if entries.is_empty() {
        println!("No past jobs.");
    }
    for (index, entry) in entries.iter().enumerate() {
        println!("{:>2}. {}", index + 1, entry.summary_line());
    }
    Ok(0)
}

fn run_fetch(args: FetchArgs) -> Result<i32> {
    let config = EngineConfig::load(args.config.as_deref())?;
    let fetcher = AssetFetcher::new(config.proxy_base.clone());
    let path = fetcher.download(&AssetRef::classify(&args.url), &args.out)?;
    println!("Saved {}", path.display());
    Ok(0)
}

fn active_item(coordinator: &Coordinator) -> Option<ItemId> {
    let id = coordinator.active_id();
    if id.is_none() {
        println!("No active item. Use /upload or /open first.");
    }
    id
}

fn set_options(coordinator: &Coordinator, intent: &Intent) {
    if let Some(Value::Array(invalid)) = intent.command_args.get("invalid") {
        let tokens: Vec<&str> = invalid.iter().filter_map(Value::as_str).collect();
        println!("Ignoring malformed settings: {}", tokens.join(" "));
    }
    if intent.settings_update.is_empty() {
        println!("Usage: /options key=value ...");
        return;
    }
    let Some(id) = active_item(coordinator) else {
        return;
    };
    match coordinator.update_options(&id, &intent.settings_update) {
        Ok(()) => {
            let keys: Vec<&str> = intent.settings_update.keys().map(String::as_str).collect();
            println!("Updated {}", keys.join(", "));
        }
        Err(err) => println!("Options rejected: {err}"),
    }
}

fn download_mesh(
    coordinator: &Coordinator,
    fetcher: &AssetFetcher,
    id: &ItemId,
    dir: &Path,
) -> Result<PathBuf> {
    let Some(mesh) = coordinator
        .snapshot(id)
        .and_then(|item| item.artifact(ArtifactKind::Mesh).cloned())
    else {
        bail!("item {id} has no mesh yet");
    };
    fetcher.download(&mesh, dir)
}

fn require_completed(label: &str, result: Result<ActionOutcome, PipelineError>) -> Result<()> {
    match result? {
        ActionOutcome::Completed(_) => Ok(()),
        ActionOutcome::Ignored(reason) => bail!("{label} result discarded: {}", reason.as_str()),
    }
}

fn report(label: &str, result: Result<ActionOutcome, PipelineError>) {
    match result {
        Ok(ActionOutcome::Completed(stage)) => println!("{label} finished ({stage})"),
        Ok(ActionOutcome::Ignored(reason)) => {
            println!("{label} result discarded: {}", reason.as_str())
        }
        Err(err) => println!("{label} failed [{}]: {err}", err.reason()),
    }
}

fn log_len(coordinator: &Coordinator, id: &ItemId) -> usize {
    coordinator
        .snapshot(id)
        .map(|item| item.log.len())
        .unwrap_or(0)
}

fn print_new_log(coordinator: &Coordinator, id: &ItemId, from: usize) {
    if let Some(item) = coordinator.snapshot(id) {
        for entry in item.log.iter().skip(from) {
            println!("  {entry}");
        }
    }
}

fn print_status(item: &ImageItem) {
    let source = item
        .source
        .as_ref()
        .map_or_else(|| "no source image".to_string(), AssetRef::label);
    println!("item {} ({source})", item.id);
    println!("  stage: {}", item.stage);
    if let Some(job_id) = item.job_id.as_ref() {
        let progress = item.progress.unwrap_or(0);
        println!("  job: {job_id} ({progress}%)");
    }
    for (kind, asset) in item.artifacts.iter() {
        println!("  {kind}: {}", asset.label());
    }
    if let Some(action) = item.failed_action {
        println!("  failed: {action} (use /retry)");
    }
    if let Some(last) = item.last_log() {
        println!("  last: {last}");
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use plan3d_contracts::errors::{ActionRejected, IgnoreReason};
    use plan3d_contracts::pipeline::PipelineStage;

    use super::{require_completed, ActionOutcome, Cli, Command};

    #[test]
    fn run_args_share_engine_flags() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "plan3d",
            "run",
            "--image",
            "plan.png",
            "--style-prompt",
            "dusk",
            "--layout",
            "segmented",
        ])?;
        let Command::Run(args) = cli.command else {
            panic!("expected run subcommand");
        };
        assert_eq!(args.image, "plan.png");
        assert_eq!(args.style_prompt.as_deref(), Some("dusk"));
        assert_eq!(args.engine.layout.as_deref(), Some("segmented"));
        assert_eq!(args.out.to_str(), Some("plan3d-out"));
        assert!(args.engine.events.is_none());
        Ok(())
    }

    #[test]
    fn history_defaults_to_one_page() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from(["plan3d", "history"])?;
        let Command::History(args) = cli.command else {
            panic!("expected history subcommand");
        };
        assert_eq!(args.limit, 12);
        assert!(args.task_id.is_none());
        Ok(())
    }

    #[test]
    fn discarded_or_failed_actions_are_errors() {
        assert!(require_completed("generate", Ok(ActionOutcome::Completed(PipelineStage::Captured))).is_ok());

        let discarded = require_completed(
            "generate",
            Ok(ActionOutcome::Ignored(IgnoreReason::ItemRemoved)),
        );
        assert_eq!(
            discarded.err().map(|err| err.to_string()),
            Some("generate result discarded: item removed".to_string())
        );

        let rejected = require_completed(
            "stylize",
            Err(ActionRejected::NothingToRetry("a".into()).into()),
        );
        assert!(rejected.is_err());
    }
}
