use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::runtime::Runtime;

use crate::auth;
use crate::cli::{Args, Command};
use crate::comments::{CommentTreeService, RenderOptions, DEFAULT_PLACEHOLDER};
use crate::config::{self, Config};
use crate::data::RedditClientService;
use crate::dispatch::{ActionDispatcher, ItemKind};
use crate::reddit::{self, ClientConfig, Credentials, RefreshTokenProvider};
use crate::server::ControlServer;
use crate::storage::{self, TokenStore};

pub fn run(args: Args) -> Result<()> {
    let cfg = config::load(config::LoadOptions {
        config_file: args.config.clone(),
        env_prefix: None,
    })
    .context("load config")?;
    cfg.validate()?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("start runtime")?;

    let store = TokenStore::open(storage::Options {
        path: Some(cfg.auth.token_path.clone()),
    });
    let coordinator = auth::Coordinator::new(store, auth::Config::from_app(&cfg))?;

    if let Command::Authorize { force } = &args.command {
        if *force {
            runtime.block_on(coordinator.authorize())?;
        } else {
            runtime.block_on(coordinator.acquire_token())?;
        }
        println!(
            "refresh token stored at {}",
            coordinator.store().path().display()
        );
        return Ok(());
    }

    let refresh_token = runtime.block_on(coordinator.acquire_token())?;
    // Held here so the blocking HTTP clients are released outside the runtime.
    let dispatcher = Arc::new(build_dispatcher(&cfg, refresh_token)?);

    match args.command {
        Command::Serve => serve(&runtime, &cfg, dispatcher.clone()),
        Command::Thread { post_id, subreddit } => {
            runtime.block_on(print_thread(&cfg, dispatcher.clone(), &subreddit, &post_id))
        }
        Command::Comments { username, limit } => {
            runtime.block_on(print_user_comments(&dispatcher, &username, limit))
        }
        Command::UpvoteFollowed { limit } => {
            runtime.block_on(upvote_followed(&dispatcher, limit))
        }
        Command::Authorize { .. } => Ok(()),
    }
}

/// Builds the one remote client for this process and the worker pool around it.
fn build_dispatcher(cfg: &Config, refresh_token: String) -> Result<ActionDispatcher> {
    let http = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(20))
        .build()
        .context("build http client")?;
    let provider = RefreshTokenProvider::new(
        Credentials {
            client_id: cfg.reddit.client_id.clone(),
            client_secret: cfg.reddit.client_secret.clone(),
            refresh_token,
            user_agent: cfg.reddit.user_agent.clone(),
            token_url: cfg.reddit.token_url.clone(),
        },
        http.clone(),
    )?;
    let client = reddit::Client::new(
        Arc::new(provider),
        ClientConfig {
            user_agent: cfg.reddit.user_agent.clone(),
            base_url: Some(cfg.reddit.api_base_url.clone()),
            http_client: Some(http),
        },
    )
    .context("build reddit client")?;
    let service = Arc::new(RedditClientService::new(Arc::new(client)));
    ActionDispatcher::new(service, cfg.dispatcher.workers)
}

fn serve(runtime: &Runtime, cfg: &Config, dispatcher: Arc<ActionDispatcher>) -> Result<()> {
    let server = ControlServer::bind(&cfg.server.listen_addr, dispatcher)?;
    let shutdown = server.shutdown_handle();
    println!("server started at {}", cfg.server.public_base_url);

    runtime.block_on(async move {
        let serving = tokio::spawn(server.run());
        tokio::signal::ctrl_c()
            .await
            .context("wait for ctrl-c")?;
        tracing::info!("shutting down");
        shutdown.shutdown();
        serving.await.context("control server task")?
    })
}

async fn print_thread(
    cfg: &Config,
    dispatcher: Arc<ActionDispatcher>,
    subreddit: &str,
    post_id: &str,
) -> Result<()> {
    let hyperlinks = std::io::stdout().is_terminal();
    let service = CommentTreeService::new(
        dispatcher,
        RenderOptions {
            control_base: cfg.server.public_base_url.clone(),
            placeholder: DEFAULT_PLACEHOLDER.into(),
            hyperlinks,
        },
    );
    let thread = service
        .fetch_thread(subreddit, post_id)
        .await
        .context("fetch comment tree")?;

    println!("r/{}", thread.post.subreddit);
    println!("{} [{}]", thread.post.title, thread.post.score);
    if !thread.post.selftext.trim().is_empty() {
        println!("\n{}\n", thread.post.selftext.trim());
    }
    println!("comments:");

    let rendered = service.render(&thread.comments, 0);
    for line in &rendered.lines {
        println!("{}", line);
    }
    if !hyperlinks && !rendered.triggers.is_empty() {
        println!();
        for trigger in &rendered.triggers {
            println!("{} -> {}", trigger.comment_id, trigger.target_url);
        }
    }
    Ok(())
}

async fn print_user_comments(dispatcher: &ActionDispatcher, username: &str, limit: u32) -> Result<()> {
    let comments = dispatcher
        .fetch_user_comments(username, limit)
        .await
        .with_context(|| format!("fetch comments for {}", username))?;
    if comments.is_empty() {
        println!("no comments found for {}", username);
    }
    for comment in comments {
        let created = comment
            .created
            .map(|ts| ts.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "unknown".into());
        let first_line = comment.body.lines().next().unwrap_or_default();
        println!("[{}] r/{}: {}", created, comment.subreddit, first_line);
    }
    Ok(())
}

async fn upvote_followed(dispatcher: &ActionDispatcher, limit: u32) -> Result<()> {
    let users = dispatcher
        .fetch_followed_users()
        .await
        .context("fetch followed users")?;
    if users.is_empty() {
        println!("you are not following any users.");
        return Ok(());
    }

    println!("users you follow:");
    for user in users {
        println!("- {}", user);
        match dispatcher.upvote_user_content(&user, limit).await {
            Ok(outcomes) => {
                for outcome in outcomes {
                    let kind = match outcome.kind {
                        ItemKind::Comment => "comment",
                        ItemKind::Submission => "post",
                    };
                    let result = if outcome.result.is_ok() {
                        "success"
                    } else {
                        "failed"
                    };
                    println!(
                        "upvoted {} by {} in r/{}: {}",
                        kind, user, outcome.subreddit, result
                    );
                }
            }
            Err(err) => tracing::warn!(user = %user, error = %err, "could not upvote user content"),
        }
        println!();
    }
    Ok(())
}
