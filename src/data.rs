use std::sync::Arc;

use crate::reddit::{self, ListingOptions, RemoteError};

/// The blocking remote operations the dispatcher runs on its workers.
pub trait RedditService: Send + Sync {
    fn user_comments(&self, username: &str, limit: u32)
        -> Result<Vec<reddit::Comment>, RemoteError>;
    fn user_submissions(&self, username: &str, limit: u32)
        -> Result<Vec<reddit::Post>, RemoteError>;
    fn post_comments(&self, subreddit: &str, post_id: &str)
        -> Result<reddit::PostComments, RemoteError>;
    fn comment(&self, id: &str) -> Result<reddit::Comment, RemoteError>;
    fn vote(&self, fullname: &str, dir: i32) -> Result<(), RemoteError>;
    fn reply(&self, parent: &str, text: &str) -> Result<reddit::Comment, RemoteError>;
    fn delete(&self, fullname: &str) -> Result<(), RemoteError>;
    fn me(&self) -> Result<reddit::Identity, RemoteError>;
    fn subscriptions(&self) -> Result<Vec<reddit::Subreddit>, RemoteError>;
}

pub struct RedditClientService {
    client: Arc<reddit::Client>,
}

impl RedditClientService {
    pub fn new(client: Arc<reddit::Client>) -> Self {
        Self { client }
    }
}

impl RedditService for RedditClientService {
    fn user_comments(
        &self,
        username: &str,
        limit: u32,
    ) -> Result<Vec<reddit::Comment>, RemoteError> {
        let listing = self
            .client
            .user_comments(username, ListingOptions::newest(limit))?;
        Ok(listing
            .children
            .into_iter()
            .map(|thing| thing.data)
            .collect())
    }

    fn user_submissions(
        &self,
        username: &str,
        limit: u32,
    ) -> Result<Vec<reddit::Post>, RemoteError> {
        let listing = self
            .client
            .user_submissions(username, ListingOptions::newest(limit))?;
        Ok(listing
            .children
            .into_iter()
            .map(|thing| thing.data)
            .collect())
    }

    fn post_comments(
        &self,
        subreddit: &str,
        post_id: &str,
    ) -> Result<reddit::PostComments, RemoteError> {
        self.client.comments(subreddit, post_id)
    }

    fn comment(&self, id: &str) -> Result<reddit::Comment, RemoteError> {
        self.client.comment(id)
    }

    fn vote(&self, fullname: &str, dir: i32) -> Result<(), RemoteError> {
        self.client.vote(fullname, dir)
    }

    fn reply(&self, parent: &str, text: &str) -> Result<reddit::Comment, RemoteError> {
        self.client.reply(parent, text)
    }

    fn delete(&self, fullname: &str) -> Result<(), RemoteError> {
        self.client.delete(fullname)
    }

    fn me(&self) -> Result<reddit::Identity, RemoteError> {
        self.client.me()
    }

    fn subscriptions(&self) -> Result<Vec<reddit::Subreddit>, RemoteError> {
        self.client.subscriptions()
    }
}
