//! Relay 命令行入口
//!
//! 子命令：
//! - `chat [--session ID]`：交互式对话（Ctrl-C 取消当前轮）
//! - `ask TEXT`：单轮提问
//! - `check`：健康检查，要求模型回复 SYSTEM ONLINE
//! - `sessions`：列出已保存的会话
//! - `alias BRANCH`：打印开发分支对应的服务别名
//!
//! 全局参数 `--config PATH` 追加一份配置文件。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use relay::config::{load_config, AppConfig};
use relay::conversation::Session;
use relay::engine::ProgressEvent;
use relay::service::{build_service_alias, make_dev_app_id, HttpConnector};
use relay::tools::default_registry;
use relay::{observability, ChatService, TurnReport};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

const HEALTH_CHECK_PROMPT: &str = "Hello! Please reply with 'SYSTEM ONLINE'.";

struct Cli {
    config: Option<PathBuf>,
    command: String,
    args: Vec<String>,
}

fn parse_args() -> anyhow::Result<Cli> {
    let mut config = None;
    let mut rest = Vec::new();
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            let path = iter.next().context("--config requires a path")?;
            config = Some(PathBuf::from(path));
        } else {
            rest.push(arg);
        }
    }
    let command = if rest.is_empty() {
        "chat".to_string()
    } else {
        rest.remove(0)
    };
    Ok(Cli {
        config,
        command,
        args: rest,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let cli = parse_args()?;
    let cfg = load_config(cli.config.clone()).context("Failed to load config")?;

    match cli.command.as_str() {
        "alias" => {
            let branch = cli.args.first().context("usage: relay alias BRANCH")?;
            let app_id = make_dev_app_id(branch, &cfg.service.dev_prefix);
            println!("{}", build_service_alias(&cfg.service.workspace, &app_id));
        }
        "sessions" => {
            let service = build_service(&cfg)?;
            for s in service.store().list().await.context("Failed to list sessions")? {
                println!(
                    "{}  {}  {} messages  {}",
                    s.id,
                    s.updated_at.format("%Y-%m-%d %H:%M"),
                    s.message_count,
                    s.title.as_deref().unwrap_or("(untitled)")
                );
            }
        }
        "check" => {
            let service = build_service(&cfg)?;
            let mut session = service.new_session();
            let report = service.send(&mut session, HEALTH_CHECK_PROMPT, None).await;
            print_report(&report);
            if report.error.is_some() {
                bail!("health check failed");
            }
        }
        "ask" => {
            let text = cli.args.join(" ");
            if text.trim().is_empty() {
                bail!("usage: relay ask TEXT");
            }
            let service = Arc::new(build_service(&cfg)?);
            let mut session = service.new_session();
            watch_ctrl_c(service.clone());
            let report = service.send(&mut session, text, Some(event_printer())).await;
            print_report(&report);
            await_title(report).await;
        }
        "chat" => {
            let service = Arc::new(build_service(&cfg)?);
            let session = match option_value(&cli.args, "--session") {
                Some(id) => service
                    .store()
                    .load(&id)
                    .await
                    .with_context(|| format!("Failed to load session {id}"))?,
                None => service.new_session(),
            };
            watch_ctrl_c(service.clone());
            run_chat(service, session).await?;
        }
        other => bail!("unknown command '{other}' (expected chat, ask, check, sessions or alias)"),
    }
    Ok(())
}

fn build_service(cfg: &AppConfig) -> anyhow::Result<ChatService> {
    let registry = default_registry(&cfg.tools)
        .map_err(anyhow::Error::msg)
        .context("Failed to build tool registry")?;
    let connector = HttpConnector::new(&cfg.service)
        .map_err(anyhow::Error::msg)
        .context("Failed to build HTTP connector")?;
    Ok(ChatService::from_config(cfg, Arc::new(registry), Arc::new(connector)))
}

fn option_value(args: &[String], name: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == name)?;
    args.get(pos + 1).cloned()
}

/// Ctrl-C 只取消当前轮，不退出进程
fn watch_ctrl_c(service: Arc<ChatService>) {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("cancel requested");
            service.cancel().await;
        }
    });
}

fn event_printer() -> mpsc::UnboundedSender<ProgressEvent> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(ev) = rx.recv().await {
            match ev {
                ProgressEvent::ToolStarted { tool, .. } => eprintln!("  · {tool} …"),
                ProgressEvent::Retrying { attempt, max_retries, .. } => {
                    eprintln!("  · retrying ({attempt}/{max_retries})")
                }
                ProgressEvent::SandboxRetry { attempt, .. } => {
                    eprintln!("  · restarting sandbox (attempt {attempt})")
                }
                ProgressEvent::ForcedFinalize { reason } => eprintln!("  · finalizing: {reason}"),
                _ => {}
            }
        }
    });
    tx
}

fn print_report(report: &TurnReport) {
    match (&report.reply, &report.error) {
        (Some(reply), _) => println!("{reply}"),
        (None, Some(err)) => eprintln!("error: {err}"),
        (None, None) => {}
    }
    eprintln!("[{}]", report.trace.summary);
    if let Some(err) = &report.save_error {
        eprintln!("warning: conversation not saved: {err}");
    }
}

async fn await_title(report: TurnReport) -> Option<String> {
    let task = report.title_task?;
    match task.await {
        Ok(Ok(title)) => {
            eprintln!("title: {title}");
            Some(title)
        }
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "saving title failed");
            None
        }
        Err(e) => {
            tracing::warn!(error = %e, "title task aborted");
            None
        }
    }
}

async fn run_chat(service: Arc<ChatService>, mut session: Session) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    eprintln!("relay chat ({} messages). Type /quit to exit.", session.messages.len());
    loop {
        eprint!("> ");
        let Some(line) = lines.next_line().await.context("Failed to read stdin")? else {
            break;
        };
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if text == "/quit" {
            break;
        }
        let report = service.send(&mut session, text, Some(event_printer())).await;
        print_report(&report);
        if let Some(title) = await_title(report).await {
            session.title = Some(title);
        }
    }
    if let Some(id) = session.durable_id() {
        eprintln!("session saved as {id}");
    }
    Ok(())
}
