//! Scripted network used by unit tests.

use color_eyre::{eyre::eyre, Result};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::http::{Request, Response};
use crate::network::Network;

#[derive(Clone)]
enum Scripted {
  Respond(Response),
  Fail,
}

#[derive(Default)]
struct MockState {
  once: HashMap<String, VecDeque<Scripted>>,
  always: HashMap<String, Response>,
  requests: Vec<Request>,
}

/// In-process [`Network`] that records requests and replays scripted
/// responses. Unknown URLs fail as if the host were unreachable.
#[derive(Clone, Default)]
pub struct MockNetwork {
  state: Arc<Mutex<MockState>>,
  offline: Arc<AtomicBool>,
  latency: Arc<Mutex<Option<Duration>>>,
}

impl MockNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  /// Always answer `url` with `response`.
  pub fn respond(&self, url: &str, response: Response) {
    let mut state = self.state.lock().unwrap();
    state.always.insert(url.to_string(), response);
  }

  /// Answer the next request for `url` with `response`.
  pub fn respond_once(&self, url: &str, response: Response) {
    let mut state = self.state.lock().unwrap();
    state
      .once
      .entry(url.to_string())
      .or_default()
      .push_back(Scripted::Respond(response));
  }

  /// Fail the next request for `url` with a transport error.
  pub fn fail_once(&self, url: &str) {
    let mut state = self.state.lock().unwrap();
    state
      .once
      .entry(url.to_string())
      .or_default()
      .push_back(Scripted::Fail);
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn set_latency(&self, latency: Duration) {
    *self.latency.lock().unwrap() = Some(latency);
  }

  pub fn requests(&self) -> Vec<Request> {
    self.state.lock().unwrap().requests.clone()
  }

  pub fn request_count(&self, url: &str) -> usize {
    self
      .state
      .lock()
      .unwrap()
      .requests
      .iter()
      .filter(|r| r.url == url)
      .count()
  }

  fn answer(&self, request: &Request) -> Result<Response> {
    let mut state = self.state.lock().unwrap();
    state.requests.push(request.clone());

    if self.offline.load(Ordering::SeqCst) {
      return Err(eyre!("network unreachable: {}", request.url));
    }

    if let Some(queue) = state.once.get_mut(&request.url) {
      if let Some(next) = queue.pop_front() {
        return match next {
          Scripted::Respond(response) => Ok(response),
          Scripted::Fail => Err(eyre!("connection reset: {}", request.url)),
        };
      }
    }

    state
      .always
      .get(&request.url)
      .cloned()
      .ok_or_else(|| eyre!("connection refused: {}", request.url))
  }
}

impl Network for MockNetwork {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send {
    let result = self.answer(request);
    let latency = *self.latency.lock().unwrap();
    async move {
      if let Some(latency) = latency {
        tokio::time::sleep(latency).await;
      }
      result
    }
  }
}
