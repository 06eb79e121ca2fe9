use std::{io::Write, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc::{self, UnboundedReceiver},
};

use dbt_assist_core_sdk::{
    client::{HttpRelayClient, SessionCredentials, StaticSession},
    config::{self, ClientConfig, RelayConfig},
    db::SqliteStore,
    models::{Role, QUICK_QUESTIONS},
    server,
    session::{ChatSession, SendOutcome, SessionDeps, SessionEvent, SessionOptions},
    telemetry,
};

/**
 * \brief CLI 程序入口：运行中继服务，或作为会话客户端与中继对话。
 */
#[derive(Parser, Debug)]
#[command(name = "dbt-assist", version, about = "DBT awareness assistant: relay and chat client")]
struct Cli {
    /** \brief 中继地址，默认读取 DBT_ASSIST_RELAY_URL */
    #[arg(long, global = true)]
    relay_url: Option<String>,
    /** \brief 会话令牌，默认读取 DBT_ASSIST_SESSION_TOKEN */
    #[arg(long, global = true)]
    token: Option<String>,
    /** \brief 本次会话使用的自定义 API Key，不会落盘 */
    #[arg(long, global = true)]
    api_key: Option<String>,
    /** \brief 本地会话数据库路径 */
    #[arg(long, global = true)]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 启动中继 HTTP 服务。
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:8787")]
        addr: String,
    },

    /**
     * \brief 发送一条消息；不带参数时进入交互模式。
     */
    Chat {
        #[arg(long, conflicts_with = "quick")]
        prompt: Option<String>,
        /** \brief 发送第 N 个快捷问题（从 1 开始） */
        #[arg(long)]
        quick: Option<usize>,
    },

    /** \brief 打印已保存的会话。 */
    History,

    /** \brief 清空已保存的会话。 */
    Clear,

    /**
     * \brief 重试：优先重发上次失败的输入（跨进程保存），否则重发会话中最近一条用户消息。
     */
    Retry,

    /** \brief 列出快捷问题。 */
    Quick,
}

impl Cli {
    fn client_config(&self) -> Result<ClientConfig> {
        let mut cfg = ClientConfig::from_env().context("load client config failed")?;
        if let Some(url) = &self.relay_url {
            cfg.relay_url = url.clone();
        }
        if let Some(token) = &self.token {
            cfg.session_token = Some(token.clone());
        }
        if let Some(key) = &self.api_key {
            cfg.custom_api_key = Some(key.clone());
        }
        if let Some(db) = &self.db {
            cfg.db_path = db.clone();
        }
        Ok(cfg)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    telemetry::init_logging("info");
    telemetry::set_enabled(config::telemetry_from_env());

    match &cli.command {
        Commands::Serve { addr } => {
            let relay = RelayConfig::from_env().context("load relay config failed")?;
            server::run(addr, relay).await?;
        }
        Commands::Chat { prompt, quick } => {
            let cfg = cli.client_config()?;
            let (session, mut events) = open_session(&cfg)?;
            let text = match (prompt, quick) {
                (Some(p), _) => Some(p.trim().to_string()),
                (None, Some(n)) => Some(quick_question(*n)?.to_string()),
                (None, None) => None,
            };
            match text {
                Some(text) if text.is_empty() => bail!("prompt is empty"),
                Some(text) => {
                    let outcome = run_turn(&session, &mut events, Turn::Send(&text)).await?;
                    exit_on_failure(outcome)?;
                }
                None => interactive(&session, &mut events).await?,
            }
        }
        Commands::History => {
            let cfg = cli.client_config()?;
            let (session, _events) = open_session(&cfg)?;
            print_history(&session);
        }
        Commands::Clear => {
            let cfg = cli.client_config()?;
            let (session, _events) = open_session(&cfg)?;
            session.clear_chat().context("clear conversation failed")?;
            println!("Conversation cleared.");
        }
        Commands::Retry => {
            let cfg = cli.client_config()?;
            let (session, mut events) = open_session(&cfg)?;
            match run_turn(&session, &mut events, Turn::Retry).await? {
                Some(outcome) => exit_on_failure(Some(outcome))?,
                None => println!("Nothing to retry."),
            }
        }
        Commands::Quick => {
            for (i, q) in QUICK_QUESTIONS.iter().enumerate() {
                println!("{:>2}. [{}] {} - {}", i + 1, q.category, q.label, q.question);
            }
        }
    }

    Ok(())
}

fn open_session(cfg: &ClientConfig) -> Result<(ChatSession, UnboundedReceiver<SessionEvent>)> {
    let store = SqliteStore::open(&cfg.db_path).context("open conversation store failed")?;
    let transport = HttpRelayClient::new(cfg.relay_url.clone(), cfg.stream_timeout)
        .context("build relay client failed")?;
    let (tx, rx) = mpsc::unbounded_channel();
    let session = ChatSession::restore(
        SessionDeps {
            store: Arc::new(store),
            transport: Arc::new(transport),
            auth: Arc::new(StaticSession::new(cfg.session_token.clone())),
            credentials: Arc::new(SessionCredentials::new(cfg.custom_api_key.clone())),
        },
        SessionOptions {
            max_rebuffer_attempts: cfg.max_rebuffer_attempts,
        },
        Some(tx),
    );
    Ok((session, rx))
}

fn quick_question(n: usize) -> Result<&'static str> {
    n.checked_sub(1)
        .and_then(|i| QUICK_QUESTIONS.get(i))
        .map(|q| q.question)
        .with_context(|| format!("no quick question #{} (1-{})", n, QUICK_QUESTIONS.len()))
}

enum Turn<'a> {
    Send(&'a str),
    Retry,
}

/**
 * \brief 执行一次发送或重试，边接收边打印增量；Ctrl-C 取消当前回复。
 * \return 无可重试消息时返回 `None`
 */
async fn run_turn(
    session: &ChatSession,
    events: &mut UnboundedReceiver<SessionEvent>,
    turn: Turn<'_>,
) -> Result<Option<SendOutcome>> {
    let send = async move {
        match turn {
            Turn::Send(text) => session.send_message(text).await.map(Some),
            Turn::Retry => session.retry_last_message().await,
        }
    };
    tokio::pin!(send);

    let mut cancelled = false;
    let result = loop {
        tokio::select! {
            result = &mut send => break result,
            Some(event) = events.recv() => render(event),
            _ = tokio::signal::ctrl_c(), if !cancelled => {
                cancelled = session.cancel_request();
            }
        }
    };
    while let Ok(event) = events.try_recv() {
        render(event);
    }

    let outcome = result?;
    match &outcome {
        Some(SendOutcome::Completed) => println!(),
        Some(SendOutcome::Cancelled) => eprintln!("\n[cancelled]"),
        Some(SendOutcome::Failed(e)) => eprintln!("error: {}", e),
        None => {}
    }
    Ok(outcome)
}

fn render(event: SessionEvent) {
    match event {
        SessionEvent::Delta { delta, .. } => {
            print!("{}", delta);
            std::io::stdout().flush().ok();
        }
        SessionEvent::Phase(phase) => tracing::debug!(?phase, "session phase"),
        SessionEvent::Error(_) => {}
    }
}

fn exit_on_failure(outcome: Option<SendOutcome>) -> Result<()> {
    if let Some(SendOutcome::Failed(e)) = outcome {
        bail!(e);
    }
    Ok(())
}

fn print_history(session: &ChatSession) {
    let messages = session.messages();
    if messages.is_empty() {
        println!("(no messages)");
    }
    for m in messages {
        let who = match m.role {
            Role::User => "you",
            Role::Assistant => "assistant",
        };
        println!("{}> {}\n", who, m.content);
    }
}

/**
 * \brief 交互模式：普通输入作为消息发送，以 `/` 开头的为命令。
 */
async fn interactive(
    session: &ChatSession,
    events: &mut UnboundedReceiver<SessionEvent>,
) -> Result<()> {
    println!("DBT assistant. Commands: /retry /clear /history /key [KEY] /quick /quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        std::io::stdout().flush().ok();

        let line = tokio::select! {
            line = lines.next_line() => line.context("read stdin failed")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        let (cmd, arg) = match input.split_once(char::is_whitespace) {
            Some((cmd, arg)) => (cmd, arg.trim()),
            None => (input, ""),
        };
        match cmd {
            "/quit" | "/exit" => break,
            "/retry" => {
                if run_turn(session, events, Turn::Retry).await?.is_none() {
                    println!("Nothing to retry.");
                }
            }
            "/clear" => match session.clear_chat() {
                Ok(()) => println!("Conversation cleared."),
                Err(e) => eprintln!("error: {}", e),
            },
            "/history" => print_history(session),
            "/key" => {
                session.credentials().set(arg);
                match session.credentials().get() {
                    Some(_) => println!("Custom API key set for this session."),
                    None => println!("Custom API key cleared."),
                }
            }
            "/quick" => {
                for (i, q) in QUICK_QUESTIONS.iter().enumerate() {
                    println!("{:>2}. {}", i + 1, q.question);
                }
            }
            _ if cmd.starts_with('/') => eprintln!("unknown command: {}", cmd),
            _ => {
                run_turn(session, events, Turn::Send(input)).await?;
            }
        }
    }
    Ok(())
}
