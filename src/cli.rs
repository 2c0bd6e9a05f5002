pub use clap::Parser;

use std::path::PathBuf;

use clap::Subcommand;

#[derive(Parser, Debug)]
#[command(name = "reply-relay", version)]
#[command(about = "reply-relay - Authorize against Reddit once, then reply and delete from a local control surface.")]
pub struct Args {
    /// Path to the config file (defaults to <config dir>/reply-relay/config.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Authorize if needed, then serve /post_reply and /delete until Ctrl-C
    Serve,
    /// Run the browser authorization handshake and store the refresh token
    Authorize {
        /// Ignore any stored token and authorize again
        #[arg(long)]
        force: bool,
    },
    /// Print a post's comment tree with reply links
    Thread {
        post_id: String,
        /// Subreddit the post lives in (optional)
        #[arg(long, default_value = "")]
        subreddit: String,
    },
    /// List a user's newest comments
    Comments {
        username: String,
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },
    /// Upvote the newest comments and posts of every followed user
    UpvoteFollowed {
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },
}
