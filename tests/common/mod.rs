#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use quotagate::{FetchError, QuotaFuture, QuotaSource};
use tokio::sync::oneshot;

pub const SECOND: u64 = 1_000_000_000;

type Reply = oneshot::Sender<Result<Option<f64>, FetchError>>;

#[derive(Default)]
struct Script {
    started: Vec<String>,
    pending: VecDeque<(String, Reply)>,
    refuse_next: usize,
}

/// Quota source whose fetches stay pending until the test resolves them.
#[derive(Clone, Default)]
pub struct ScriptedSource {
    script: Arc<Mutex<Script>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetches successfully started so far.
    pub fn started(&self) -> usize {
        self.script.lock().unwrap().started.len()
    }

    pub fn started_keys(&self) -> Vec<String> {
        self.script.lock().unwrap().started.clone()
    }

    pub fn pending(&self) -> usize {
        self.script.lock().unwrap().pending.len()
    }

    /// Make the next `fetch` call fail synchronously.
    pub fn refuse_next(&self) {
        self.script.lock().unwrap().refuse_next += 1;
    }

    /// Resolve the oldest outstanding fetch. Returns the key it was for.
    pub fn resolve_next(&self, result: Result<Option<f64>, FetchError>) -> String {
        let (key, reply) =
            self.script.lock().unwrap().pending.pop_front().expect("no outstanding fetch");
        let _ = reply.send(result);
        key
    }

    /// Drop the oldest outstanding fetch without answering it.
    pub fn abandon_next(&self) {
        let _ = self.script.lock().unwrap().pending.pop_front().expect("no outstanding fetch");
    }
}

impl QuotaSource for ScriptedSource {
    fn fetch(&self, key: &str) -> Result<QuotaFuture, FetchError> {
        let mut script = self.script.lock().unwrap();
        if script.refuse_next > 0 {
            script.refuse_next -= 1;
            return Err(format!("quota backend refused fetch for {key}").into());
        }
        let (tx, rx) = oneshot::channel();
        script.started.push(key.to_owned());
        script.pending.push_back((key.to_owned(), tx));
        Ok(async move { rx.await.unwrap_or_else(|_| Err("fetch abandoned".into())) }.boxed())
    }
}

/// Recorder that keeps every reported failure as `(key, message)`.
#[derive(Clone, Default)]
pub struct RecordedErrors {
    seen: Arc<Mutex<Vec<(String, String)>>>,
}

impl RecordedErrors {
    pub fn recorder(&self) -> impl Fn(&str, &FetchError) + Send + Sync + 'static {
        let seen = self.seen.clone();
        move |key: &str, error: &FetchError| {
            seen.lock().unwrap().push((key.to_owned(), error.to_string()));
        }
    }

    pub fn all(&self) -> Vec<(String, String)> {
        self.seen.lock().unwrap().clone()
    }
}

/// Yield to the runtime until `condition` holds, failing the test after about a second.
pub async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}
