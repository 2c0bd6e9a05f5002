//! Comment tree retrieval and console rendering.
//!
//! The provider nests replies in three shapes: a listing envelope, a bare
//! array of things, or an empty string / null when there are none. Every shape
//! is folded into `CommentNode::children` while the payload is ingested, so
//! rendering only ever walks one tree shape.

use std::sync::Arc;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Deserialize;
use serde_json::Value;

use crate::dispatch::{ActionDispatcher, ActionResult};
use crate::reddit::Post;

pub const DEFAULT_PLACEHOLDER: &str = "<<<assistant reply here>>>";

const INDENT: &str = "    ";

/// Everything except unreserved characters gets escaped, so `&`, `=` and
/// spaces in reply text survive the trip through a query string.
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentNode {
    pub id: String,
    pub author: String,
    pub body: String,
    pub score: i64,
    pub subreddit: String,
    pub children: Vec<CommentNode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyTrigger {
    pub comment_id: String,
    pub encoded_text: String,
    pub target_url: String,
}

#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub control_base: String,
    pub placeholder: String,
    /// Wrap `[SEND]` in an OSC-8 terminal hyperlink to the trigger URL.
    pub hyperlinks: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            control_base: "http://localhost:8080".into(),
            placeholder: DEFAULT_PLACEHOLDER.into(),
            hyperlinks: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rendered {
    pub lines: Vec<String>,
    pub triggers: Vec<ReplyTrigger>,
}

#[derive(Debug, Clone)]
pub struct Thread {
    pub post: Post,
    pub comments: Vec<CommentNode>,
}

/// Only `id` is required; removed or partially loaded comments arrive with
/// nulls in the other fields and must keep their place in the tree.
#[derive(Deserialize)]
struct RawComment {
    id: String,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    score: Option<i64>,
    #[serde(default)]
    subreddit: Option<String>,
    #[serde(default)]
    replies: Value,
}

/// Builds the tree from a comment listing (or any of the nested reply shapes).
/// "more comments" stubs and non-comment things are dropped.
pub fn normalize_listing(listing: &Value) -> Vec<CommentNode> {
    reply_children(listing)
        .iter()
        .filter_map(node_from_thing)
        .collect()
}

fn reply_children(replies: &Value) -> &[Value] {
    match replies {
        Value::Object(map) => map
            .get("data")
            .and_then(|data| data.get("children"))
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default(),
        Value::Array(items) => items.as_slice(),
        _ => &[],
    }
}

fn node_from_thing(thing: &Value) -> Option<CommentNode> {
    let data = match thing.get("kind").and_then(Value::as_str) {
        Some("t1") => thing.get("data")?,
        Some(_) => return None,
        None if thing.get("author").is_some() => thing,
        None => return None,
    };
    let raw = match RawComment::deserialize(data) {
        Ok(raw) => raw,
        Err(err) => {
            tracing::debug!(error = %err, "skipping malformed comment");
            return None;
        }
    };
    Some(CommentNode {
        children: normalize_listing(&raw.replies),
        id: raw.id,
        author: raw.author.unwrap_or_else(|| "[deleted]".into()),
        body: raw.body.unwrap_or_default(),
        score: raw.score.unwrap_or_default(),
        subreddit: raw.subreddit.unwrap_or_default(),
    })
}

pub fn reply_trigger(comment_id: &str, placeholder: &str, control_base: &str) -> ReplyTrigger {
    let encoded_text = utf8_percent_encode(placeholder, QUERY_VALUE).to_string();
    let target_url = format!(
        "{}/post_reply?comment_id={}&reply_text={}",
        control_base.trim_end_matches('/'),
        utf8_percent_encode(comment_id, QUERY_VALUE),
        encoded_text
    );
    ReplyTrigger {
        comment_id: comment_id.to_string(),
        encoded_text,
        target_url,
    }
}

/// Depth-first rendering: each node prints its header, its reply line, then
/// its children one level deeper.
pub fn render(nodes: &[CommentNode], indent: usize, options: &RenderOptions) -> Rendered {
    let mut out = Rendered::default();
    render_into(&mut out, nodes, indent, options);
    out
}

fn render_into(out: &mut Rendered, nodes: &[CommentNode], indent: usize, options: &RenderOptions) {
    let prefix = INDENT.repeat(indent);
    for node in nodes {
        let body: Vec<&str> = node
            .body
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();
        let signature = format!("({}) [{}]", node.author, node.score);
        match body.split_first() {
            None => out
                .lines
                .push(format!("{}({}) {}", prefix, node.id, signature)),
            Some((first, rest)) => {
                let mut header = format!("{}({}) {}", prefix, node.id, first);
                for line in rest {
                    out.lines.push(header);
                    header = format!("{}{}", prefix, line);
                }
                out.lines.push(format!("{} {}", header, signature));
            }
        }

        let trigger = reply_trigger(&node.id, &options.placeholder, &options.control_base);
        let send = if options.hyperlinks {
            format!("\x1b]8;;{}\x1b\\[SEND]\x1b]8;;\x1b\\", trigger.target_url)
        } else {
            "[SEND]".to_string()
        };
        out.lines
            .push(format!("{}Reply: {} {}", prefix, options.placeholder, send));
        out.triggers.push(trigger);

        render_into(out, &node.children, indent + 1, options);
    }
}

pub struct CommentTreeService {
    dispatcher: Arc<ActionDispatcher>,
    options: RenderOptions,
}

impl CommentTreeService {
    pub fn new(dispatcher: Arc<ActionDispatcher>, options: RenderOptions) -> Self {
        Self {
            dispatcher,
            options,
        }
    }

    pub async fn fetch_thread(&self, subreddit: &str, post_id: &str) -> ActionResult<Thread> {
        let payload = self
            .dispatcher
            .fetch_post_comments(subreddit, post_id)
            .await?;
        let comments = normalize_listing(&payload.comments);
        tracing::debug!(post = %post_id, top_level = comments.len(), "comment tree loaded");
        Ok(Thread {
            post: payload.post,
            comments,
        })
    }

    pub async fn fetch_post_comments(
        &self,
        subreddit: &str,
        post_id: &str,
    ) -> ActionResult<Vec<CommentNode>> {
        Ok(self.fetch_thread(subreddit, post_id).await?.comments)
    }

    pub fn render(&self, nodes: &[CommentNode], indent: usize) -> Rendered {
        render(nodes, indent, &self.options)
    }
}
