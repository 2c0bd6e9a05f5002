use std::sync::Arc;

use parking_lot::Mutex;
use reply_relay::comments::reply_trigger;
use reply_relay::data::RedditService;
use reply_relay::dispatch::ActionDispatcher;
use reply_relay::reddit::{Comment, Identity, Post, PostComments, RemoteError, Subreddit};
use reply_relay::server::ControlServer;
use serde_json::{json, Value};

struct Recorder {
    replies: Mutex<Vec<(String, String)>>,
    deleted: Mutex<Vec<String>>,
}

fn comment(id: &str, author: &str) -> Comment {
    Comment {
        id: id.into(),
        name: format!("t1_{}", id),
        body: String::new(),
        author: author.into(),
        score: 1,
        subreddit: "test".into(),
        created_utc: 0.0,
    }
}

impl RedditService for Recorder {
    fn user_comments(&self, _: &str, _: u32) -> Result<Vec<Comment>, RemoteError> {
        Ok(Vec::new())
    }

    fn user_submissions(&self, _: &str, _: u32) -> Result<Vec<Post>, RemoteError> {
        Ok(Vec::new())
    }

    fn post_comments(&self, _: &str, _: &str) -> Result<PostComments, RemoteError> {
        Err(RemoteError::NotFound)
    }

    fn comment(&self, id: &str) -> Result<Comment, RemoteError> {
        match id {
            "abc123" => Ok(comment(id, "operator")),
            "other1" => Ok(comment(id, "stranger")),
            _ => Err(RemoteError::NotFound),
        }
    }

    fn vote(&self, _: &str, _: i32) -> Result<(), RemoteError> {
        Ok(())
    }

    fn reply(&self, parent: &str, text: &str) -> Result<Comment, RemoteError> {
        self.replies.lock().push((parent.into(), text.into()));
        Ok(comment("newreply", "operator"))
    }

    fn delete(&self, fullname: &str) -> Result<(), RemoteError> {
        self.deleted.lock().push(fullname.into());
        Ok(())
    }

    fn me(&self) -> Result<Identity, RemoteError> {
        Ok(Identity {
            id: "1".into(),
            name: "operator".into(),
        })
    }

    fn subscriptions(&self) -> Result<Vec<Subreddit>, RemoteError> {
        Ok(Vec::new())
    }
}

#[test]
fn control_surface_over_http() {
    let recorder = Arc::new(Recorder {
        replies: Mutex::new(Vec::new()),
        deleted: Mutex::new(Vec::new()),
    });
    let dispatcher = Arc::new(ActionDispatcher::new(recorder.clone(), 5).expect("dispatcher"));
    let server = ControlServer::bind("127.0.0.1:0", dispatcher).expect("bind");
    let addr = server.local_addr().expect("ip listener");
    let shutdown = server.shutdown_handle();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("runtime");
    let serving = runtime.spawn(server.run());

    let base = format!("http://{}", addr);
    let http = reqwest::blocking::Client::new();

    let text = "Hello world & a=b";
    let trigger = reply_trigger("xyz", text, &base);
    let resp = http.get(&trigger.target_url).send().expect("post_reply");
    assert_eq!(resp.status().as_u16(), 200);
    assert!(resp.text().expect("body").contains("newreply"));
    assert_eq!(
        recorder.replies.lock().as_slice(),
        [("t1_xyz".to_string(), text.to_string())]
    );

    let missing = http
        .get(format!("{}/post_reply?comment_id=xyz", base))
        .send()
        .expect("post_reply without text");
    assert_eq!(missing.status().as_u16(), 400);

    let own = http
        .post(format!("{}/delete", base))
        .json(&json!({"item_id": "abc123"}))
        .send()
        .expect("delete own");
    assert_eq!(own.status().as_u16(), 200);
    assert_eq!(own.json::<Value>().expect("json"), json!({"success": true}));

    let foreign = http
        .post(format!("{}/delete", base))
        .json(&json!({"item_id": "other1"}))
        .send()
        .expect("delete foreign");
    assert_eq!(foreign.status().as_u16(), 500);
    assert_eq!(
        foreign.json::<Value>().expect("json"),
        json!({"success": false, "error": "failed to delete item"})
    );

    let no_id = http
        .post(format!("{}/delete", base))
        .json(&json!({}))
        .send()
        .expect("delete without id");
    assert_eq!(no_id.status().as_u16(), 400);
    assert_eq!(no_id.json::<Value>().expect("json"), json!({"error": "missing item_id"}));

    assert_eq!(recorder.deleted.lock().as_slice(), ["t1_abc123"]);

    shutdown.shutdown();
    runtime
        .block_on(serving)
        .expect("server task")
        .expect("server result");
}
