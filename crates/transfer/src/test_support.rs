//! In-memory servers and listeners for engine and registry tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_util::{StreamExt, stream};
use tokio::sync::{Notify, mpsc};

use ferry_protocol::constants::{HEADER_ACTION_NAME, HEADER_BEFORE, HEADER_FILE_SIZE, HEADER_RESOURCE_ID};
use ferry_protocol::wire::Header;
use ferry_protocol::{Action, TransferEvent};

use crate::http::{ByteStream, HttpClient, HttpError, HttpFuture, PostResponse, RangeBody};
use crate::listener::{ChannelListener, ProgressListener};

/// Looks up a request header by name, ignoring ASCII case.
fn header_value<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Deterministic test payload.
pub(crate) fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

// ---------------------------------------------------------------------------
// Recorder
// ---------------------------------------------------------------------------

/// Receiving end of a [`ChannelListener`] with test helpers.
pub(crate) struct Recorder {
    rx: mpsc::UnboundedReceiver<TransferEvent>,
}

impl Recorder {
    pub(crate) fn new() -> (Arc<dyn ProgressListener>, Recorder) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ChannelListener::new("test", tx)), Recorder { rx })
    }

    /// Collects progress values until the transfer completes or fails.
    pub(crate) async fn finish(&mut self) -> (Vec<u64>, TransferEvent) {
        let mut progress = Vec::new();
        loop {
            match self.rx.recv().await.expect("listener dropped") {
                TransferEvent::Progress { complete, .. } => progress.push(complete),
                terminal => return (progress, terminal),
            }
        }
    }

    /// Next event if one is already queued.
    pub(crate) fn try_next(&mut self) -> Option<TransferEvent> {
        self.rx.try_recv().ok()
    }

    /// Waits until progress reaches `at_least` bytes.
    pub(crate) async fn wait_for_progress(&mut self, at_least: u64) {
        loop {
            match self.rx.recv().await.expect("listener dropped") {
                TransferEvent::Progress { complete, .. } if complete >= at_least => return,
                TransferEvent::Progress { .. } => {}
                terminal => panic!("transfer ended early: {terminal:?}"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MockDownloadServer
// ---------------------------------------------------------------------------

/// Serves files for `HEAD` and ranged `GET`, with failure injection.
pub(crate) struct MockDownloadServer {
    state: Mutex<DownloadState>,
}

struct DownloadState {
    files: HashMap<String, Bytes>,
    piece_size: usize,
    honour_range: bool,
    omit_length: bool,
    fail_probe: bool,
    fail_gets: usize,
    stall_at: Option<u64>,
    cut_at: Option<u64>,
    probes: usize,
    ranges: Vec<u64>,
}

impl MockDownloadServer {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(DownloadState {
                files: HashMap::new(),
                piece_size: 300,
                honour_range: true,
                omit_length: false,
                fail_probe: false,
                fail_gets: 0,
                stall_at: None,
                cut_at: None,
                probes: 0,
                ranges: Vec::new(),
            }),
        }
    }

    pub(crate) fn serve(&self, url: &str, data: Vec<u8>) {
        self.state.lock().unwrap().files.insert(url.to_string(), Bytes::from(data));
    }

    /// Answer ranged requests with the whole file and status 200.
    pub(crate) fn ignore_ranges(&self) {
        self.state.lock().unwrap().honour_range = false;
    }

    pub(crate) fn omit_length(&self) {
        self.state.lock().unwrap().omit_length = true;
    }

    pub(crate) fn fail_probe(&self) {
        self.state.lock().unwrap().fail_probe = true;
    }

    /// Fail the next `n` GET requests with a transport error.
    pub(crate) fn fail_next_gets(&self, n: usize) {
        self.state.lock().unwrap().fail_gets = n;
    }

    /// The next body stops sending at byte `offset` and never ends.
    pub(crate) fn stall_at(&self, offset: u64) {
        self.state.lock().unwrap().stall_at = Some(offset);
    }

    /// The next body ends early at byte `offset`.
    pub(crate) fn cut_at(&self, offset: u64) {
        self.state.lock().unwrap().cut_at = Some(offset);
    }

    pub(crate) fn probes(&self) -> usize {
        self.state.lock().unwrap().probes
    }

    pub(crate) fn gets(&self) -> usize {
        self.state.lock().unwrap().ranges.len()
    }

    /// Range offsets of every GET, in order.
    pub(crate) fn ranges(&self) -> Vec<u64> {
        self.state.lock().unwrap().ranges.clone()
    }
}

impl HttpClient for MockDownloadServer {
    fn probe_length<'a>(&'a self, url: &'a str) -> HttpFuture<'a, Option<u64>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.probes += 1;
            if state.fail_probe {
                return Err(HttpError::Transport("connection refused".into()));
            }
            let len = state
                .files
                .get(url)
                .map(|data| data.len() as u64)
                .ok_or(HttpError::Status(404))?;
            Ok(if state.omit_length { None } else { Some(len) })
        })
    }

    fn get_range<'a>(&'a self, url: &'a str, offset: u64) -> HttpFuture<'a, RangeBody> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.ranges.push(offset);
            if state.fail_gets > 0 {
                state.fail_gets -= 1;
                return Err(HttpError::Transport("connection reset".into()));
            }
            let data = state.files.get(url).cloned().ok_or(HttpError::Status(404))?;
            let len = data.len() as u64;

            let partial = state.honour_range;
            let start = if partial { offset.min(len) } else { 0 };
            let mut end = len;
            let mut stall = false;
            if let Some(at) = state.stall_at.take() {
                if at > start && at < end {
                    end = at;
                    stall = true;
                }
            }
            if let Some(at) = state.cut_at.take() {
                if at > start && at < end {
                    end = at;
                }
            }

            let piece_size = state.piece_size;
            let pieces: Vec<Result<Bytes, HttpError>> = (start as usize..end as usize)
                .step_by(piece_size)
                .map(|i| Ok(data.slice(i..(i + piece_size).min(end as usize))))
                .collect();

            let body = stream::iter(pieces);
            let body: ByteStream = if stall {
                Box::pin(body.chain(stream::pending()))
            } else {
                Box::pin(body)
            };
            Ok(RangeBody {
                partial,
                stream: body,
            })
        })
    }

    fn post<'a>(&'a self, _url: &'a str, _headers: Vec<Header>, _body: Bytes) -> HttpFuture<'a, PostResponse> {
        Box::pin(async move { Err(HttpError::Status(405)) })
    }
}

// ---------------------------------------------------------------------------
// MockUploadServer
// ---------------------------------------------------------------------------

/// Speaks the handshake/chunk upload protocol against in-memory resources.
pub(crate) struct MockUploadServer {
    state: Mutex<UploadState>,
    gate: Notify,
}

#[derive(Default)]
struct UploadState {
    resources: HashMap<String, (Vec<u8>, u64)>,
    next_id: usize,
    handshake_ids: Vec<String>,
    upload_offsets: Vec<u64>,
    handshake_reply: Option<PostResponse>,
    upload_reply: Option<PostResponse>,
    fail_uploads: bool,
    hold_after: Option<usize>,
}

impl MockUploadServer {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(UploadState::default()),
            gate: Notify::new(),
        }
    }

    /// Pretends a resource already holds `data` of a `total`-byte file.
    pub(crate) fn preload(&self, id: &str, data: &[u8], total: u64) {
        self.state
            .lock()
            .unwrap()
            .resources
            .insert(id.to_string(), (data.to_vec(), total));
    }

    pub(crate) fn reply_to_next_handshake(&self, resp: PostResponse) {
        self.state.lock().unwrap().handshake_reply = Some(resp);
    }

    pub(crate) fn reply_to_next_upload(&self, resp: PostResponse) {
        self.state.lock().unwrap().upload_reply = Some(resp);
    }

    pub(crate) fn fail_uploads(&self) {
        self.state.lock().unwrap().fail_uploads = true;
    }

    /// Blocks chunk uploads once `n` have been answered, until [`release`](Self::release).
    pub(crate) fn hold_after_uploads(&self, n: usize) {
        self.state.lock().unwrap().hold_after = Some(n);
    }

    pub(crate) fn release(&self) {
        self.state.lock().unwrap().hold_after = None;
        self.gate.notify_one();
    }

    pub(crate) fn received(&self, id: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .resources
            .get(id)
            .map(|(data, _)| data.clone())
    }

    /// `RESOURCEID` header of every handshake, in order.
    pub(crate) fn handshake_ids(&self) -> Vec<String> {
        self.state.lock().unwrap().handshake_ids.clone()
    }

    /// `BEFORE` header of every chunk upload, in order.
    pub(crate) fn upload_offsets(&self) -> Vec<u64> {
        self.state.lock().unwrap().upload_offsets.clone()
    }

    pub(crate) fn handshakes(&self) -> usize {
        self.state.lock().unwrap().handshake_ids.len()
    }

    pub(crate) fn uploads(&self) -> usize {
        self.state.lock().unwrap().upload_offsets.len()
    }

    fn handshake(&self, headers: &[Header]) -> PostResponse {
        let mut state = self.state.lock().unwrap();
        let id = header_value(headers, HEADER_RESOURCE_ID).unwrap_or_default().to_string();
        state.handshake_ids.push(id.clone());
        if let Some(resp) = state.handshake_reply.take() {
            return resp;
        }

        let total = header_value(headers, HEADER_FILE_SIZE)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or_default();
        let held = if id.is_empty() {
            None
        } else {
            state.resources.get(&id).map(|(data, _)| data.len() as u64)
        };
        let (id, offset) = match held {
            Some(offset) => (id, offset),
            None => {
                state.next_id += 1;
                let id = format!("res-{}", state.next_id);
                state.resources.insert(id.clone(), (Vec::new(), total));
                (id, 0)
            }
        };
        PostResponse::ok(format!("RESOURCEID:{id};BEFORE:{offset}"))
    }

    fn upload(&self, headers: &[Header], body: Bytes) -> Result<PostResponse, HttpError> {
        let mut state = self.state.lock().unwrap();
        let before = header_value(headers, HEADER_BEFORE)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or_default();
        state.upload_offsets.push(before);
        if let Some(resp) = state.upload_reply.take() {
            return Ok(resp);
        }
        if state.fail_uploads {
            return Err(HttpError::Transport("connection reset".into()));
        }

        let id = header_value(headers, HEADER_RESOURCE_ID).unwrap_or_default();
        let Some((data, total)) = state.resources.get_mut(id) else {
            return Ok(PostResponse {
                status: 404,
                body: String::new(),
            });
        };
        if before != data.len() as u64 {
            return Ok(PostResponse {
                status: 409,
                body: String::new(),
            });
        }
        data.extend_from_slice(&body);
        let code = if data.len() as u64 >= *total { 0 } else { 1 };
        Ok(PostResponse::ok(format!("RETURN_CODE:{code}")))
    }
}

impl HttpClient for MockUploadServer {
    fn probe_length<'a>(&'a self, _url: &'a str) -> HttpFuture<'a, Option<u64>> {
        Box::pin(async move { Err(HttpError::Status(405)) })
    }

    fn get_range<'a>(&'a self, _url: &'a str, _offset: u64) -> HttpFuture<'a, RangeBody> {
        Box::pin(async move { Err(HttpError::Status(405)) })
    }

    fn post<'a>(&'a self, _url: &'a str, headers: Vec<Header>, body: Bytes) -> HttpFuture<'a, PostResponse> {
        Box::pin(async move {
            let action = header_value(&headers, HEADER_ACTION_NAME);
            match action {
                Some(a) if a == Action::Hand.as_str() => Ok(self.handshake(&headers)),
                Some(a) if a == Action::Upload.as_str() => {
                    let hold = {
                        let state = self.state.lock().unwrap();
                        state
                            .hold_after
                            .is_some_and(|n| state.upload_offsets.len() >= n)
                    };
                    if hold {
                        self.gate.notified().await;
                    }
                    self.upload(&headers, body)
                }
                _ => Ok(PostResponse {
                    status: 400,
                    body: String::new(),
                }),
            }
        })
    }
}
