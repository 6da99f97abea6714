use std::collections::{HashMap, VecDeque};
use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use reqwest::blocking::Client;

use crate::cancel::CancelToken;
use crate::config::MediaConfig;
use crate::error::MediaError;
use crate::feed::ItemId;

const READ_CHUNK: usize = 64 * 1024;
const SNIFF_LEN: usize = 512;
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

/// Acquired media bytes. Owned by exactly one playback slot; dropping it
/// releases the memory.
#[derive(Debug, PartialEq, Eq)]
pub struct MediaResource {
    pub url: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl MediaResource {
    pub fn new(url: impl Into<String>, content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            url: url.into(),
            content_type: content_type.into(),
            bytes,
        }
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub id: ItemId,
    pub url: String,
    pub ticket: u64,
    pub cancel: CancelToken,
}

#[derive(Debug)]
pub struct LoadCompletion {
    pub id: ItemId,
    pub ticket: u64,
    pub result: std::result::Result<MediaResource, MediaError>,
}

/// Starts asynchronous media acquisition. Results come back out of band as
/// [`LoadCompletion`]s.
pub trait MediaLoader: Send + Sync {
    fn begin(&self, request: LoadRequest);
}

/// Blocking, cancellable byte acquisition run on a media worker.
pub trait MediaFetcher: Send + Sync {
    fn fetch(
        &self,
        url: &str,
        cancel: &CancelToken,
    ) -> std::result::Result<MediaResource, MediaError>;
}

struct Job {
    request: LoadRequest,
}

struct Inner {
    fetcher: Arc<dyn MediaFetcher>,
    completions: Sender<LoadCompletion>,
}

/// Cheap handle given to the playback controller; enqueues jobs for the
/// manager's workers.
#[derive(Clone)]
pub struct Handle {
    jobs: Sender<Job>,
}

impl MediaLoader for Handle {
    fn begin(&self, request: LoadRequest) {
        tracing::debug!(item = %request.id, ticket = request.ticket, "queue media load");
        let _ = self.jobs.send(Job { request });
    }
}

pub struct Manager {
    handle: Handle,
    stop: Sender<()>,
    exited: Receiver<()>,
    handles: Vec<thread::JoinHandle<()>>,
}

/// Tells the manager a worker has left its loop, even if it panicked.
struct ExitSignal(Sender<()>);

impl Drop for ExitSignal {
    fn drop(&mut self) {
        let _ = self.0.send(());
    }
}

impl Manager {
    pub fn new(
        fetcher: Arc<dyn MediaFetcher>,
        cfg: &MediaConfig,
        completions: Sender<LoadCompletion>,
    ) -> Self {
        let workers = if cfg.workers == 0 { 2 } else { cfg.workers };
        let (job_tx, job_rx) = unbounded();
        let (stop_tx, stop_rx) = unbounded();
        let (exit_tx, exit_rx) = unbounded();

        let inner = Arc::new(Inner {
            fetcher,
            completions,
        });

        let mut handles = Vec::new();
        for _ in 0..workers {
            let rx_jobs = job_rx.clone();
            let rx_stop = stop_rx.clone();
            let worker_inner = inner.clone();
            let exit = ExitSignal(exit_tx.clone());
            handles.push(thread::spawn(move || {
                let _exit = exit;
                worker_inner.worker(rx_jobs, rx_stop)
            }));
        }

        Self {
            handle: Handle { jobs: job_tx },
            stop: stop_tx,
            exited: exit_rx,
            handles,
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Stops the workers and joins those that exit within the grace
    /// period. A worker stuck in a blocking request is detached; its result
    /// goes nowhere once the completion receiver is gone.
    fn shutdown(&mut self) {
        for _ in &self.handles {
            let _ = self.stop.send(());
        }
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        let mut exited = 0;
        while exited < self.handles.len() && self.exited.recv_deadline(deadline).is_ok() {
            exited += 1;
        }
        let all_exited = exited == self.handles.len();
        let mut detached = 0;
        for handle in self.handles.drain(..) {
            if all_exited || handle.is_finished() {
                let _ = handle.join();
            } else {
                detached += 1;
            }
        }
        if detached > 0 {
            tracing::warn!(detached, "media workers busy at shutdown; detaching them");
        }
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn worker(&self, jobs: Receiver<Job>, stop: Receiver<()>) {
        loop {
            crossbeam_channel::select! {
                recv(stop) -> _ => break,
                recv(jobs) -> msg => {
                    match msg {
                        Ok(job) => self.process(job),
                        Err(_) => break,
                    }
                }
            }
        }
    }

    fn process(&self, job: Job) {
        let request = job.request;
        if request.cancel.is_cancelled() {
            return;
        }
        let result = self.fetcher.fetch(&request.url, &request.cancel);
        if request.cancel.is_cancelled() {
            // Drop whatever was acquired right here instead of handing it on.
            tracing::debug!(item = %request.id, ticket = request.ticket, "media load cancelled");
            return;
        }
        let _ = self.completions.send(LoadCompletion {
            id: request.id,
            ticket: request.ticket,
            result,
        });
    }
}

pub struct HttpFetcher {
    client: Client,
    max_size_bytes: u64,
}

impl HttpFetcher {
    pub fn new(cfg: &MediaConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(cfg.timeout)
            .user_agent(format!("reelfeed/{}", crate::VERSION))
            .build()
            .context("media: build http client")?;
        Ok(Self {
            client,
            max_size_bytes: cfg.max_size_bytes,
        })
    }
}

impl MediaFetcher for HttpFetcher {
    fn fetch(
        &self,
        url: &str,
        cancel: &CancelToken,
    ) -> std::result::Result<MediaResource, MediaError> {
        if cancel.is_cancelled() {
            return Err(MediaError::Cancelled);
        }
        let mut response = self
            .client
            .get(url)
            .send()
            .map_err(|err| MediaError::Network(err.to_string()))?;

        if !response.status().is_success() {
            return Err(MediaError::Network(format!(
                "request failed: {}",
                response.status()
            )));
        }
        if let Some(length) = response.content_length() {
            if length > self.max_size_bytes {
                return Err(MediaError::TooLarge {
                    limit: self.max_size_bytes,
                });
            }
        }

        let header = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|val| val.to_str().ok())
            .map(|s| s.to_string());

        let mut bytes = Vec::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            if cancel.is_cancelled() {
                return Err(MediaError::Cancelled);
            }
            let read = response
                .read(&mut chunk)
                .map_err(|err| MediaError::Network(err.to_string()))?;
            if read == 0 {
                break;
            }
            if (bytes.len() + read) as u64 > self.max_size_bytes {
                return Err(MediaError::TooLarge {
                    limit: self.max_size_bytes,
                });
            }
            bytes.extend_from_slice(&chunk[..read]);
        }

        let content_type = classify(header.as_deref(), &bytes)?;
        Ok(MediaResource::new(url, content_type, bytes))
    }
}

/// Serves a fixed payload after a (cancellable) delay. Individual urls can be
/// scripted to fail.
pub struct StaticFetcher {
    latency: Duration,
    content_type: String,
    payload: Vec<u8>,
    failures: Mutex<HashMap<String, VecDeque<MediaError>>>,
    fetches: AtomicUsize,
}

impl StaticFetcher {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            content_type: "video/mp4".into(),
            payload: vec![0u8; 1024],
            failures: Mutex::new(HashMap::new()),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn fail_next(&self, url: &str, err: MediaError) {
        self.failures
            .lock()
            .entry(url.to_string())
            .or_default()
            .push_back(err);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl MediaFetcher for StaticFetcher {
    fn fetch(
        &self,
        url: &str,
        cancel: &CancelToken,
    ) -> std::result::Result<MediaResource, MediaError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() && !cancel.sleep(self.latency) {
            return Err(MediaError::Cancelled);
        }
        if cancel.is_cancelled() {
            return Err(MediaError::Cancelled);
        }
        if let Some(err) = self
            .failures
            .lock()
            .get_mut(url)
            .and_then(|queue| queue.pop_front())
        {
            return Err(err);
        }
        Ok(MediaResource::new(
            url,
            self.content_type.clone(),
            self.payload.clone(),
        ))
    }
}

fn classify(header: Option<&str>, bytes: &[u8]) -> std::result::Result<String, MediaError> {
    if let Some(header) = header {
        let essence = header
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if is_playable(&essence) {
            return Ok(essence);
        }
    }
    if bytes.is_empty() {
        return Err(MediaError::Decode("empty media body".into()));
    }
    let sniffed = tree_magic_mini::from_u8(&bytes[..bytes.len().min(SNIFF_LEN)]);
    if is_playable(sniffed) {
        Ok(sniffed.to_string())
    } else {
        Err(MediaError::Decode(format!("unsupported media type {sniffed}")))
    }
}

fn is_playable(mime: &str) -> bool {
    mime.starts_with("video/")
        || mime == "image/gif"
        || mime == "application/vnd.apple.mpegurl"
        || mime == "application/x-mpegurl"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelHandle;

    fn request(id: &str, handle: &CancelHandle, ticket: u64) -> LoadRequest {
        LoadRequest {
            id: ItemId::from(id),
            url: format!("https://cdn.test/{id}.mp4"),
            ticket,
            cancel: handle.token(),
        }
    }

    #[test]
    fn workers_deliver_completions() {
        let (tx, rx) = unbounded();
        let fetcher = Arc::new(StaticFetcher::new(Duration::ZERO));
        let manager = Manager::new(fetcher.clone(), &MediaConfig::default(), tx);
        let cancel = CancelHandle::new();
        manager.handle().begin(request("a", &cancel, 7));

        let completion = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(completion.id, ItemId::from("a"));
        assert_eq!(completion.ticket, 7);
        let resource = completion.result.unwrap();
        assert_eq!(resource.content_type, "video/mp4");
        assert_eq!(fetcher.fetch_count(), 1);
    }

    #[test]
    fn cancelled_loads_produce_nothing() {
        let (tx, rx) = unbounded();
        let fetcher = Arc::new(StaticFetcher::new(Duration::from_secs(10)));
        let manager = Manager::new(fetcher, &MediaConfig::default(), tx);
        let mut cancel = CancelHandle::new();
        manager.handle().begin(request("a", &cancel, 1));
        thread::sleep(Duration::from_millis(20));
        cancel.cancel();
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        drop(manager);
    }

    struct StuckFetcher;

    impl MediaFetcher for StuckFetcher {
        fn fetch(
            &self,
            url: &str,
            _cancel: &CancelToken,
        ) -> std::result::Result<MediaResource, MediaError> {
            thread::sleep(Duration::from_secs(2));
            Ok(MediaResource::new(url, "video/mp4", Vec::new()))
        }
    }

    #[test]
    fn shutdown_does_not_wait_for_blocked_requests() {
        let (tx, _rx) = unbounded();
        let cfg = MediaConfig {
            workers: 1,
            ..MediaConfig::default()
        };
        let manager = Manager::new(Arc::new(StuckFetcher), &cfg, tx);
        let cancel = CancelHandle::new();
        manager.handle().begin(request("a", &cancel, 1));
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        drop(manager);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn idle_workers_are_joined() {
        let (tx, _rx) = unbounded();
        let manager = Manager::new(
            Arc::new(StaticFetcher::new(Duration::ZERO)),
            &MediaConfig::default(),
            tx,
        );
        let started = Instant::now();
        drop(manager);
        assert!(started.elapsed() < SHUTDOWN_GRACE);
    }

    #[test]
    fn scripted_failures_are_reported() {
        let fetcher = StaticFetcher::new(Duration::ZERO);
        fetcher.fail_next(
            "https://cdn.test/a.mp4",
            MediaError::Decode("truncated".into()),
        );
        let cancel = CancelHandle::new();
        let token = cancel.token();
        assert_eq!(
            fetcher.fetch("https://cdn.test/a.mp4", &token),
            Err(MediaError::Decode("truncated".into()))
        );
        assert!(fetcher.fetch("https://cdn.test/a.mp4", &token).is_ok());
    }

    #[test]
    fn classify_prefers_video_header() {
        assert_eq!(
            classify(Some("video/mp4; codecs=avc1"), b"anything").unwrap(),
            "video/mp4"
        );
    }

    #[test]
    fn classify_rejects_images() {
        let png = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR\0\0\0\x01\0\0\0\x01\x08\x06\0\0\0";
        let err = classify(Some("application/octet-stream"), png).unwrap_err();
        assert!(matches!(err, MediaError::Decode(_)));
        assert!(matches!(
            classify(None, &[]),
            Err(MediaError::Decode(_))
        ));
    }
}
