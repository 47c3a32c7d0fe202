use serde_json::json;
use axum::http::StatusCode;
use std::{net::SocketAddr, sync::Arc};

// Loopcast engine
//
// This service re-streams a looping playlist of local video files to a live
// RTMP ingest endpoint:
//   - A fetch step populates the local library from shareable Drive links
//     (external `gdown` tool).
//   - A single background worker walks the library in sorted order, playing
//     the bumper before every clip, and shells out to ffmpeg per file.
//   - A small JSON API (start/stop/fetch/status/log/config) drives it; the
//     dashboard UI sits in front behind a reverse proxy.

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use rusqlite::{params, Connection};
use sysinfo::System;
use tracing::{info, warn};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Clone)]
struct AppState {
    version: String,
    sys: Arc<tokio::sync::Mutex<System>>,
    stream: Arc<tokio::sync::Mutex<StreamRuntime>>,

    // Shared operator event feed. Written by the worker (blocking thread) and
    // by API handlers, read by the log endpoint, so it lives outside the
    // stream runtime lock.
    events: EventLog,
}

// --- Fixed layout & external tools ----------------------------------------
//
// The library is one flat directory: every rotation clip plus a fixed-name
// bumper file. The directory is created on first run.
//
// External binaries are resolved from PATH by default and can be overridden
// per deployment (e.g. a vendored ffmpeg build).

const BUMPER_NAME: &str = "bumper.mp4";

/// How long the worker idles between library re-checks when the rotation set
/// is empty. Bounded busy-wait, not an error state: content usually shows up
/// after the operator runs a fetch.
const EMPTY_LIBRARY_POLL: Duration = Duration::from_secs(5);

fn library_dir() -> PathBuf {
    std::env::var("LOOPCAST_LIBRARY")
        .unwrap_or_else(|_| "videos".to_string())
        .into()
}

fn ffmpeg_bin() -> String {
    std::env::var("LOOPCAST_FFMPEG").unwrap_or_else(|_| "ffmpeg".to_string())
}

fn gdown_bin() -> String {
    std::env::var("LOOPCAST_GDOWN").unwrap_or_else(|_| "gdown".to_string())
}

/// RTMP ingest base. The full destination is `<base>/<stream key>`.
fn ingest_base() -> String {
    std::env::var("LOOPCAST_INGEST")
        .unwrap_or_else(|_| "rtmp://a.rtmp.youtube.com/live2".to_string())
}

fn build_ingest_url(base: &str, stream_key: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), stream_key)
}

/// Recover a std mutex guard even if a worker panicked while holding it.
/// The protected values (event queue, stats, child slot) stay usable either way.
fn lock_unpoisoned<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

// --- Persistence (SQLite) -------------------------------------------------
//
// The stream settings (key, orientation, last-used Drive links) survive
// restarts so the operator does not have to re-enter them. One row, rewritten
// on every save.
//
// DB location:
// - Can be overridden with LOOPCAST_DB_PATH
// - Defaults to loopcast.db in the working directory
//
// Note: rusqlite is synchronous. We call it via spawn_blocking to avoid
// blocking tokio.
fn db_path() -> String {
    std::env::var("LOOPCAST_DB_PATH").unwrap_or_else(|_| "loopcast.db".to_string())
}

fn db_init(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;

        CREATE TABLE IF NOT EXISTS stream_config (
            id          INTEGER PRIMARY KEY CHECK (id = 1),
            stream_key  TEXT NOT NULL,
            portrait    INTEGER NOT NULL,
            folder_url  TEXT NOT NULL,
            bumper_url  TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct StreamConfig {
    /// Ingest secret appended to the RTMP base URL. Never logged.
    stream_key: String,
    /// Portrait mode crops/scales to 720x1280 (vertical live formats).
    portrait: bool,
    /// Last Drive folder link used for a rotation fetch.
    folder_url: String,
    /// Last Drive file link used for a bumper fetch.
    bumper_url: String,
}

fn db_load_stream_config(conn: &Connection) -> anyhow::Result<StreamConfig> {
    db_init(conn)?;

    let row_opt = conn.query_row(
        "SELECT stream_key, portrait, folder_url, bumper_url FROM stream_config WHERE id = 1",
        [],
        |row| {
            Ok(StreamConfig {
                stream_key: row.get::<_, String>(0)?,
                portrait: row.get::<_, i64>(1)? != 0,
                folder_url: row.get::<_, String>(2)?,
                bumper_url: row.get::<_, String>(3)?,
            })
        },
    );

    match row_opt {
        Ok(cfg) => Ok(cfg),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(StreamConfig::default()),
        Err(e) => Err(e.into()),
    }
}

fn db_save_stream_config(conn: &mut Connection, cfg: &StreamConfig) -> anyhow::Result<()> {
    db_init(conn)?;
    conn.execute(
        "INSERT INTO stream_config (id, stream_key, portrait, folder_url, bumper_url)
         VALUES (1, ?1, ?2, ?3, ?4)
         ON CONFLICT(id) DO UPDATE SET
           stream_key=excluded.stream_key,
           portrait=excluded.portrait,
           folder_url=excluded.folder_url,
           bumper_url=excluded.bumper_url",
        params![
            cfg.stream_key,
            if cfg.portrait { 1 } else { 0 },
            cfg.folder_url,
            cfg.bumper_url,
        ],
    )?;
    Ok(())
}

async fn load_stream_config_from_db_or_default() -> StreamConfig {
    let path = db_path();
    let res = tokio::task::spawn_blocking(move || -> anyhow::Result<StreamConfig> {
        let conn = Connection::open(path)?;
        db_load_stream_config(&conn)
    })
    .await;

    match res {
        Ok(Ok(cfg)) => cfg,
        Ok(Err(e)) => {
            tracing::warn!("failed to load stream config, using defaults: {e}");
            StreamConfig::default()
        }
        Err(e) => {
            tracing::warn!("failed to join stream config load task, using defaults: {e}");
            StreamConfig::default()
        }
    }
}

/// Best-effort persist; a failed save never blocks a control action.
async fn persist_stream_config(cfg: StreamConfig) {
    let path = db_path();
    let _ = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let mut conn = Connection::open(path)?;
        db_save_stream_config(&mut conn, &cfg)?;
        Ok(())
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))
    .and_then(|x| x)
    .map_err(|e| tracing::warn!("failed to persist stream config: {e}"));
}

// --- Event log -------------------------------------------------------------
//
// Human-readable operator feed: "pushing X", "library is empty", "stop
// requested", and so on. FIFO, in-memory only, internally capped so a
// long-running session cannot grow it without bound. The log endpoint serves
// the most recent LOG_SURFACE_LINES entries.

const EVENT_LOG_CAP: usize = 400;
const LOG_SURFACE_LINES: usize = 20;

#[derive(Clone, Debug, Serialize)]
struct EventEntry {
    at: String,
    line: String,
}

#[derive(Clone)]
struct EventLog {
    entries: Arc<Mutex<VecDeque<EventEntry>>>,
}

fn event_timestamp() -> String {
    let fmt = time::macros::format_description!("[hour]:[minute]:[second]");
    time::OffsetDateTime::now_utc()
        .format(fmt)
        .unwrap_or_else(|_| "--:--:--".to_string())
}

impl EventLog {
    fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(EVENT_LOG_CAP))),
        }
    }

    fn push(&self, line: String) {
        let mut q = lock_unpoisoned(&self.entries);
        if q.len() >= EVENT_LOG_CAP {
            q.pop_front();
        }
        q.push_back(EventEntry {
            at: event_timestamp(),
            line,
        });
    }

    fn info(&self, line: impl Into<String>) {
        let line = line.into();
        tracing::info!("{line}");
        self.push(line);
    }

    fn warn(&self, line: impl Into<String>) {
        let line = line.into();
        tracing::warn!("{line}");
        self.push(line);
    }

    /// Most recent `n` entries, oldest first.
    fn tail(&self, n: usize) -> Vec<EventEntry> {
        let q = lock_unpoisoned(&self.entries);
        let skip = q.len().saturating_sub(n);
        q.iter().skip(skip).cloned().collect()
    }
}

// --- Media library ---------------------------------------------------------

/// Rotation candidates: playable files minus the bumper, sorted ascending by
/// filename so iteration order is deterministic between scans.
///
/// The scan is repeated on every playlist pass; files added by a fetch while
/// a cycle is in flight are picked up on the next cycle, never mid-cycle.
fn scan_rotation(dir: &Path, bumper_name: &str) -> anyhow::Result<Vec<PathBuf>> {
    if !dir.exists() {
        anyhow::bail!("library dir does not exist: {}", dir.display());
    }

    // Do not silently ignore filesystem errors: a permission problem or a
    // stale mount must show up in the log, not look like an empty library.
    let rd = std::fs::read_dir(dir)
        .map_err(|e| anyhow::anyhow!("failed to read_dir({}): {e}", dir.display()))?;

    let mut out = Vec::new();
    for ent in rd {
        let ent = ent.map_err(|e| anyhow::anyhow!("failed to read_dir entry: {e}"))?;
        let p = ent.path();
        if !p.is_file() {
            continue;
        }
        let Some(ext) = p.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        if !ext.eq_ignore_ascii_case("mp4") {
            continue;
        }
        if p.file_name().and_then(|n| n.to_str()) == Some(bumper_name) {
            continue;
        }
        out.push(p);
    }

    out.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(out)
}

#[derive(Clone, Serialize)]
struct LibrarySnapshot {
    dir: String,
    clips: u32,
    bumper_present: bool,
}

fn library_snapshot(dir: &Path, events: &EventLog) -> LibrarySnapshot {
    let clips = match scan_rotation(dir, BUMPER_NAME) {
        Ok(v) => v.len() as u32,
        Err(e) => {
            events.warn(format!("library scan failed: {e}"));
            0
        }
    };
    LibrarySnapshot {
        dir: dir.display().to_string(),
        clips,
        bumper_present: dir.join(BUMPER_NAME).is_file(),
    }
}

// --- Encode-and-push capability --------------------------------------------
//
// One ffmpeg invocation per file: read at native rate, transcode to the fixed
// live profile, push FLV to the ingest URL, exit when the input is exhausted.
// The worker blocks until the process is gone; that process boundary is the
// only suspension point in the playlist loop.

trait PushCapability: Send + Sync {
    fn push(&self, input: &Path) -> anyhow::Result<()>;
}

fn push_args(input: &Path, portrait: bool, destination: &str) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-re".into(),
        "-i".into(),
        input.display().to_string(),
        "-c:v".into(),
        "libx264".into(),
        "-preset".into(),
        "veryfast".into(),
        "-b:v".into(),
        "2500k".into(),
        "-maxrate".into(),
        "2500k".into(),
        "-bufsize".into(),
        "5000k".into(),
        "-c:a".into(),
        "aac".into(),
        "-b:a".into(),
        "128k".into(),
    ];
    if portrait {
        args.push("-vf".into());
        args.push("scale=720:1280".into());
    }
    args.push("-f".into());
    args.push("flv".into());
    args.push(destination.to_string());
    args
}

fn sanitize_push_line(line: &str, stream_key: &str) -> String {
    // Best-effort redaction. We never want the ingest secret in UI/logs;
    // ffmpeg can echo the full destination URL in error lines.
    let mut s = line.to_string();
    if !stream_key.is_empty() {
        s = s.replace(stream_key, "****");
    }
    s
}

fn last_stderr_summary(tail: &VecDeque<String>) -> Option<String> {
    // Prefer the last non-empty, non-noisy line.
    for line in tail.iter().rev() {
        let t = line.trim();
        if t.is_empty() {
            continue;
        }
        let lc = t.to_ascii_lowercase();
        if lc.contains("broken pipe") {
            continue;
        }
        if lc.contains("conversion failed") {
            continue;
        }
        return Some(t.to_string());
    }
    tail.back()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

struct FfmpegPush {
    ffmpeg: String,
    destination: String,
    portrait: bool,
    stream_key: String,

    // Slot shared with the session so a stop action can terminate the
    // in-flight process directly. Only ever holds the child we spawned here;
    // unrelated ffmpeg processes on the host are never touched.
    active: Arc<Mutex<Option<std::process::Child>>>,
}

impl PushCapability for FfmpegPush {
    fn push(&self, input: &Path) -> anyhow::Result<()> {
        use std::io::BufRead;

        let mut cmd = std::process::Command::new(&self.ffmpeg);
        cmd.args(push_args(input, self.portrait, &self.destination));
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::null());
        cmd.stderr(std::process::Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to spawn {}: {e}", self.ffmpeg))?;
        let stderr = child.stderr.take();

        // Publish the handle before blocking on stderr so stop can reach it.
        *lock_unpoisoned(&self.active) = Some(child);

        // Drain stderr until the process closes it (i.e. exits). Keeping only
        // a short tail bounds memory across very chatty runs.
        const MAX_TAIL: usize = 40;
        let mut tail: VecDeque<String> = VecDeque::with_capacity(MAX_TAIL);
        if let Some(stderr) = stderr {
            for line in std::io::BufReader::new(stderr).lines() {
                let Ok(line) = line else { break };
                let line = sanitize_push_line(&line, &self.stream_key);
                if line.trim().is_empty() {
                    continue;
                }
                if tail.len() >= MAX_TAIL {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        }

        // Take the handle back and reap. A stop action may have killed the
        // process in place, but the handle itself stays in the slot for us.
        let child = lock_unpoisoned(&self.active).take();
        let Some(mut child) = child else {
            anyhow::bail!("push child handle missing");
        };
        let status = child.wait()?;

        if !status.success() {
            if let Some(last) = last_stderr_summary(&tail) {
                anyhow::bail!("{last}");
            }
            anyhow::bail!("transcoder exited: {status}");
        }
        Ok(())
    }
}

// --- Playback sequencer -----------------------------------------------------
//
// The playlist loop. Runs on one blocking worker per session:
//
//   scan -> (empty? warn + wait) -> for each clip: bumper, clip -> restart
//
// Cancellation is cooperative and per-item: the stop flag is checked before
// every invocation, never mid-push. A hard stop additionally kills the
// tracked child (see FfmpegPush::active), which ends the in-flight push and
// lets the loop observe the flag at the next boundary.

struct SequencerConfig {
    library_dir: PathBuf,
    bumper_name: String,
    empty_poll: Duration,
}

#[derive(Default)]
struct SequencerStats {
    /// File currently being pushed, for the status endpoint.
    current: Option<String>,
    /// Total push invocations this session (bumper plays included).
    pushes: u64,
    /// Completed full passes over the rotation set.
    cycles: u64,
}

fn run_sequencer<P: PushCapability>(
    cfg: &SequencerConfig,
    stop: &AtomicBool,
    stats: &Mutex<SequencerStats>,
    pusher: &P,
    events: &EventLog,
) {
    while !stop.load(Ordering::SeqCst) {
        let clips = match scan_rotation(&cfg.library_dir, &cfg.bumper_name) {
            Ok(v) => v,
            Err(e) => {
                events.warn(format!("library scan failed: {e}"));
                std::thread::sleep(cfg.empty_poll);
                continue;
            }
        };

        if clips.is_empty() {
            events.warn("library is empty; waiting for content");
            std::thread::sleep(cfg.empty_poll);
            continue;
        }

        for clip in &clips {
            if stop.load(Ordering::SeqCst) {
                break;
            }

            // Bumper existence is re-checked per entry: it can be fetched (or
            // deleted) while a cycle is in flight, and its absence is not an
            // error. The clip simply plays alone.
            let bumper = cfg.library_dir.join(&cfg.bumper_name);
            if bumper.is_file() {
                lock_unpoisoned(stats).current = Some(cfg.bumper_name.clone());
                events.info("pushing bumper");
                if let Err(e) = pusher.push(&bumper) {
                    if !stop.load(Ordering::SeqCst) {
                        events.warn(format!("bumper push failed: {e}"));
                    }
                }
                lock_unpoisoned(stats).pushes += 1;
            }

            // A stop that lands while the bumper is in flight (the stop
            // action kills the tracked child, ending that push early) must
            // not dispatch the clip that would have followed it.
            if stop.load(Ordering::SeqCst) {
                break;
            }

            let name = clip
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| clip.display().to_string());
            lock_unpoisoned(stats).current = Some(name.clone());
            events.info(format!("pushing {name}"));
            if let Err(e) = pusher.push(clip) {
                // A failing push is not retried; the loop advances to the
                // next item. Suppress the noise when the failure is our own
                // stop-kill.
                if !stop.load(Ordering::SeqCst) {
                    events.warn(format!("push failed for {name}: {e}"));
                }
            }
            lock_unpoisoned(stats).pushes += 1;
        }

        if stop.load(Ordering::SeqCst) {
            break;
        }

        events.info("playlist exhausted; restarting");
        lock_unpoisoned(stats).cycles += 1;
    }

    lock_unpoisoned(stats).current = None;
    events.info("sequencer stopped");
}

/// Everything a live session owns. Handed out at spawn time; no ambient
/// globals. Dropping the handle after the worker finishes releases it all.
struct SessionHandle {
    id: Uuid,
    stop: Arc<AtomicBool>,
    stats: Arc<Mutex<SequencerStats>>,
    active: Arc<Mutex<Option<std::process::Child>>>,
    worker: tokio::task::JoinHandle<()>,
    started_at: std::time::Instant,
}

fn live_sequencer_config(library: PathBuf) -> SequencerConfig {
    SequencerConfig {
        library_dir: library,
        bumper_name: BUMPER_NAME.to_string(),
        empty_poll: EMPTY_LIBRARY_POLL,
    }
}

fn spawn_session(cfg: &StreamConfig, seq_cfg: SequencerConfig, events: EventLog) -> SessionHandle {
    let id = Uuid::new_v4();
    let stop = Arc::new(AtomicBool::new(false));
    let stats = Arc::new(Mutex::new(SequencerStats::default()));
    let active: Arc<Mutex<Option<std::process::Child>>> = Arc::new(Mutex::new(None));

    let pusher = FfmpegPush {
        ffmpeg: ffmpeg_bin(),
        destination: build_ingest_url(&ingest_base(), &cfg.stream_key),
        portrait: cfg.portrait,
        stream_key: cfg.stream_key.clone(),
        active: active.clone(),
    };

    // The loop blocks inside child.wait() for minutes at a time, so it lives
    // on the blocking pool rather than a tokio worker thread.
    let worker = {
        let stop = stop.clone();
        let stats = stats.clone();
        tokio::task::spawn_blocking(move || {
            run_sequencer(&seq_cfg, &stop, &stats, &pusher, &events);
        })
    };

    SessionHandle {
        id,
        stop,
        stats,
        active,
        worker,
        started_at: std::time::Instant::now(),
    }
}

struct StreamRuntime {
    config: StreamConfig,

    // At most one live session. Enforced here (start while running is
    // rejected), not by convention.
    session: Option<SessionHandle>,
}

/// Drop a session whose worker has already returned. The sequencer logs its
/// own "stopped" event, so nothing else to report here.
fn reap_finished_session(rt: &mut StreamRuntime) {
    if rt
        .session
        .as_ref()
        .map(|s| s.worker.is_finished())
        .unwrap_or(false)
    {
        rt.session = None;
    }
}

#[derive(Clone, Serialize)]
struct StreamStatus {
    state: String, // stopped | running | stopping
    session_id: Option<Uuid>,
    uptime_sec: u64,
    pushes: u64,
    cycles: u64,
    current: Option<String>,
}

fn stream_status(rt: &StreamRuntime) -> StreamStatus {
    match &rt.session {
        None => StreamStatus {
            state: "stopped".into(),
            session_id: None,
            uptime_sec: 0,
            pushes: 0,
            cycles: 0,
            current: None,
        },
        Some(s) => {
            let stopping = s.stop.load(Ordering::SeqCst);
            let stats = lock_unpoisoned(&s.stats);
            StreamStatus {
                state: if stopping { "stopping" } else { "running" }.into(),
                session_id: Some(s.id),
                uptime_sec: s.started_at.elapsed().as_secs(),
                pushes: stats.pushes,
                cycles: stats.cycles,
                current: stats.current.clone(),
            }
        }
    }
}

// --- Fetch capability -------------------------------------------------------
//
// Delegated entirely to the external gdown tool: one invocation for the
// rotation folder, one for the bumper file. Each runs to completion; a
// non-zero exit surfaces to the operator with the tool's last stderr line.
// No retry.

async fn run_fetch_tool(args: Vec<String>) -> anyhow::Result<()> {
    let bin = gdown_bin();
    let out = tokio::process::Command::new(&bin)
        .args(&args)
        .output()
        .await
        .map_err(|e| anyhow::anyhow!("failed to run {bin}: {e}"))?;

    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        let last = stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("no output")
            .trim()
            .to_string();
        anyhow::bail!("{bin} exited with {}: {last}", out.status);
    }
    Ok(())
}

async fn fetch_rotation_folder(folder_url: &str, library: &Path) -> anyhow::Result<()> {
    run_fetch_tool(vec![
        "--folder".to_string(),
        folder_url.to_string(),
        "-O".to_string(),
        library.display().to_string(),
    ])
    .await
}

async fn fetch_bumper(bumper_url: &str, library: &Path) -> anyhow::Result<()> {
    // --fuzzy accepts the shareable .../file/d/<id>/view form directly.
    run_fetch_tool(vec![
        "--fuzzy".to_string(),
        bumper_url.to_string(),
        "-O".to_string(),
        library.join(BUMPER_NAME).display().to_string(),
    ])
    .await
}

// --- HTTP API ---------------------------------------------------------------

type ApiError = (StatusCode, Json<serde_json::Value>);

fn api_error(code: StatusCode, msg: impl Into<String>) -> ApiError {
    (code, Json(json!({ "error": msg.into() })))
}

/// Root endpoint: UI is served by nginx; the engine focuses on the API.
async fn root() -> &'static str {
    "Loopcast engine is running. UI is served by nginx. Try /api/v1/status"
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    stream: StreamStatus,
    library: LibrarySnapshot,
    system: SystemInfo,
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let system = (system_info(State(state.clone())).await).0;

    let mut rt = state.stream.lock().await;
    reap_finished_session(&mut rt);
    let stream = stream_status(&rt);
    drop(rt);

    Json(StatusResponse {
        version: state.version.clone(),
        stream,
        library: library_snapshot(&library_dir(), &state.events),
        system,
    })
}

#[derive(Serialize)]
struct LogResponse {
    lines: Vec<EventEntry>,
    /// Newline-joined rendering for dumb text surfaces.
    text: String,
}

async fn api_log(State(state): State<AppState>) -> Json<LogResponse> {
    let lines = state.events.tail(LOG_SURFACE_LINES);
    let text = lines
        .iter()
        .map(|e| format!("{} {}", e.at, e.line))
        .collect::<Vec<_>>()
        .join("\n");
    Json(LogResponse { lines, text })
}

async fn api_config_get(State(state): State<AppState>) -> Json<StreamConfig> {
    let rt = state.stream.lock().await;
    Json(rt.config.clone())
}

async fn api_config_set(
    State(state): State<AppState>,
    Json(mut cfg): Json<StreamConfig>,
) -> Result<Json<serde_json::Value>, ApiError> {
    cfg.stream_key = cfg.stream_key.trim().to_string();
    cfg.folder_url = cfg.folder_url.trim().to_string();
    cfg.bumper_url = cfg.bumper_url.trim().to_string();

    persist_stream_config(cfg.clone()).await;

    // A live session keeps the settings it was started with; changes apply
    // on the next start.
    let mut rt = state.stream.lock().await;
    rt.config = cfg;

    Ok(Json(json!({"ok": true})))
}

#[derive(Deserialize)]
struct FetchRequest {
    #[serde(default)]
    folder_url: String,
    #[serde(default)]
    bumper_url: String,
}

async fn api_fetch(
    State(state): State<AppState>,
    Json(req): Json<FetchRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let folder_url = req.folder_url.trim().to_string();
    let bumper_url = req.bumper_url.trim().to_string();
    if folder_url.is_empty() || bumper_url.is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "folder and bumper URLs are both required",
        ));
    }

    let library = library_dir();

    state.events.info("fetching rotation folder");
    fetch_rotation_folder(&folder_url, &library)
        .await
        .map_err(|e| {
            state.events.warn(format!("rotation fetch failed: {e}"));
            api_error(StatusCode::BAD_GATEWAY, e.to_string())
        })?;

    state.events.info("fetching bumper");
    fetch_bumper(&bumper_url, &library).await.map_err(|e| {
        state.events.warn(format!("bumper fetch failed: {e}"));
        api_error(StatusCode::BAD_GATEWAY, e.to_string())
    })?;

    // Remember the links so the dashboard can pre-fill them next session.
    {
        let mut rt = state.stream.lock().await;
        rt.config.folder_url = folder_url;
        rt.config.bumper_url = bumper_url;
        persist_stream_config(rt.config.clone()).await;
    }

    let snapshot = library_snapshot(&library, &state.events);
    state.events.info(format!(
        "fetch complete: {} clips, bumper {}",
        snapshot.clips,
        if snapshot.bumper_present { "present" } else { "missing" }
    ));

    Ok(Json(json!({
        "ok": true,
        "clips": snapshot.clips,
        "bumper_present": snapshot.bumper_present,
    })))
}

async fn api_stream_start(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut rt = state.stream.lock().await;
    reap_finished_session(&mut rt);

    // Exactly one worker at a time. A second start while a session is live
    // (even one that is still winding down after a stop) is rejected rather
    // than racing two loops over the same library and ingest URL.
    if rt.session.is_some() {
        return Err(api_error(StatusCode::CONFLICT, "stream already running"));
    }

    if rt.config.stream_key.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "stream key is empty"));
    }

    let session = spawn_session(
        &rt.config,
        live_sequencer_config(library_dir()),
        state.events.clone(),
    );
    let id = session.id;
    rt.session = Some(session);
    drop(rt);

    state.events.info(format!("session {id} started"));
    Ok(Json(json!({"ok": true, "session_id": id})))
}

async fn api_stream_stop(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut rt = state.stream.lock().await;
    reap_finished_session(&mut rt);

    let Some(session) = rt.session.as_ref() else {
        // Stop with nothing running is a no-op, not an error.
        return Json(json!({"ok": true, "was_running": false}));
    };

    session.stop.store(true, Ordering::SeqCst);

    // Terminate only our own tracked child. The in-flight push ends here;
    // the worker observes the flag at the next loop boundary and exits.
    if let Some(child) = lock_unpoisoned(&session.active).as_mut() {
        let _ = child.kill();
    }

    state.events.warn("stop requested; terminating current push");
    Json(json!({"ok": true, "was_running": true}))
}

#[derive(Serialize)]
struct SystemInfo {
    name: String,
    version: String,
    arch: String,
    cpu_model: String,
    cpu_cores: usize,
    load_1m: f32,
    load_5m: f32,
    load_15m: f32,
    hostname: Option<String>,
}

async fn system_info(State(st): State<AppState>) -> Json<SystemInfo> {
    let arch = std::env::consts::ARCH.to_string();
    let hostname = sysinfo::System::host_name();

    let mut sys = st.sys.lock().await;
    sys.refresh_all();

    let cpu_model = sys
        .cpus()
        .first()
        .map(|c| c.brand().to_string())
        .unwrap_or_else(|| "Unknown CPU".to_string());
    let cpu_cores = sys.cpus().len();

    let la = sysinfo::System::load_average();

    Json(SystemInfo {
        name: "Loopcast Engine".to_string(),
        version: st.version.clone(),
        arch,
        cpu_model,
        cpu_cores,
        load_1m: la.one as f32,
        load_5m: la.five as f32,
        load_15m: la.fifteen as f32,
        hostname,
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let term = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("sigterm handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = term => {},
    }

    warn!("Shutdown signal received.");
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(|| async { "OK" }))
        .route("/api/v1/status", get(status))
        .route("/api/v1/log", get(api_log))
        .route("/api/v1/config", get(api_config_get))
        .route("/api/v1/config", post(api_config_set))
        .route("/api/v1/fetch", post(api_fetch))
        .route("/api/v1/stream/start", post(api_stream_start))
        .route("/api/v1/stream/stop", post(api_stream_stop))
        .route("/api/v1/system/info", get(system_info))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .init();

    let version = env!("CARGO_PKG_VERSION").to_string();

    // One flat library directory, created on first run.
    let library = library_dir();
    std::fs::create_dir_all(&library)
        .map_err(|e| anyhow::anyhow!("failed to create library dir {}: {e}", library.display()))?;

    let config = load_stream_config_from_db_or_default().await;

    let state = AppState {
        version: version.clone(),
        sys: Arc::new(tokio::sync::Mutex::new(System::new_all())),
        stream: Arc::new(tokio::sync::Mutex::new(StreamRuntime {
            config,
            session: None,
        })),
        events: EventLog::new(),
    };

    let app = build_router(state.clone());

    // Bind loopback only; put Nginx/Caddy in front for LAN/Internet.
    let addr: SocketAddr = std::env::var("LOOPCAST_BIND")
        .unwrap_or_else(|_| "127.0.0.1:3000".to_string())
        .parse()?;

    info!("Loopcast engine starting on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Wind down any live session so no ffmpeg child outlives the engine.
    let mut rt = state.stream.lock().await;
    if let Some(session) = rt.session.take() {
        session.stop.store(true, Ordering::SeqCst);
        if let Some(child) = lock_unpoisoned(&session.active).as_mut() {
            let _ = child.kill();
        }
        drop(rt);
        let _ = session.worker.await;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_library(names: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in names {
            std::fs::write(dir.path().join(name), b"stub").expect("write clip");
        }
        dir
    }

    /// Records every push and flips the stop flag once a fixed number of
    /// invocations has been reached, so the endless loop terminates at a
    /// deterministic boundary.
    struct RecordingPush {
        calls: Mutex<Vec<PathBuf>>,
        stop_after: usize,
        stop: Arc<AtomicBool>,
    }

    impl RecordingPush {
        fn new(stop_after: usize, stop: Arc<AtomicBool>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                stop_after,
                stop,
            }
        }

        fn calls(&self) -> Vec<PathBuf> {
            lock_unpoisoned(&self.calls).clone()
        }
    }

    impl PushCapability for RecordingPush {
        fn push(&self, input: &Path) -> anyhow::Result<()> {
            let mut calls = lock_unpoisoned(&self.calls);
            calls.push(input.to_path_buf());
            if calls.len() >= self.stop_after {
                self.stop.store(true, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    fn test_seq_config(dir: &Path) -> SequencerConfig {
        SequencerConfig {
            library_dir: dir.to_path_buf(),
            bumper_name: BUMPER_NAME.to_string(),
            empty_poll: Duration::from_millis(5),
        }
    }

    fn file_names(paths: &[PathBuf]) -> Vec<String> {
        paths
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn rotation_scan_sorts_and_excludes_bumper() {
        let dir = make_library(&["b.mp4", "a.mp4", BUMPER_NAME, "c.mp4"]);
        let clips = scan_rotation(dir.path(), BUMPER_NAME).unwrap();
        assert_eq!(file_names(&clips), vec!["a.mp4", "b.mp4", "c.mp4"]);
    }

    #[test]
    fn rotation_scan_ignores_non_playable_files() {
        let dir = make_library(&["a.mp4", "notes.txt", "cover.jpg", "B.MP4"]);
        let clips = scan_rotation(dir.path(), BUMPER_NAME).unwrap();
        // Extension match is case-insensitive; everything else is skipped.
        assert_eq!(file_names(&clips), vec!["B.MP4", "a.mp4"]);
    }

    #[test]
    fn rotation_scan_reports_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("nope");
        assert!(scan_rotation(&gone, BUMPER_NAME).is_err());
    }

    #[test]
    fn full_cycle_plays_bumper_before_each_clip_in_sorted_order() {
        let dir = make_library(&["b.mp4", "a.mp4", "c.mp4", BUMPER_NAME]);
        let stop = Arc::new(AtomicBool::new(false));
        // 3 clips with a bumper = 6 invocations per full cycle.
        let pusher = RecordingPush::new(6, stop.clone());
        let stats = Mutex::new(SequencerStats::default());
        let events = EventLog::new();

        run_sequencer(&test_seq_config(dir.path()), &stop, &stats, &pusher, &events);

        assert_eq!(
            file_names(&pusher.calls()),
            vec![BUMPER_NAME, "a.mp4", BUMPER_NAME, "b.mp4", BUMPER_NAME, "c.mp4"]
        );
        // Stop landed inside the first pass, so no restart was logged.
        assert_eq!(lock_unpoisoned(&stats).cycles, 0);
        assert_eq!(lock_unpoisoned(&stats).pushes, 6);
    }

    #[test]
    fn missing_bumper_plays_clips_only() {
        let dir = make_library(&["a.mp4", "b.mp4"]);
        let stop = Arc::new(AtomicBool::new(false));
        let pusher = RecordingPush::new(2, stop.clone());
        let stats = Mutex::new(SequencerStats::default());
        let events = EventLog::new();

        run_sequencer(&test_seq_config(dir.path()), &stop, &stats, &pusher, &events);

        assert_eq!(file_names(&pusher.calls()), vec!["a.mp4", "b.mp4"]);
        let logged = events.tail(LOG_SURFACE_LINES);
        assert!(!logged.iter().any(|e| e.line.contains("failed")));
    }

    #[test]
    fn empty_library_warns_and_never_pushes() {
        let dir = make_library(&[]);
        let stop = Arc::new(AtomicBool::new(false));
        // stop_after never fires; a side thread ends the loop instead.
        let pusher = RecordingPush::new(usize::MAX, stop.clone());
        let stats = Mutex::new(SequencerStats::default());
        let events = EventLog::new();

        let stopper = {
            let stop = stop.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                stop.store(true, Ordering::SeqCst);
            })
        };
        run_sequencer(&test_seq_config(dir.path()), &stop, &stats, &pusher, &events);
        stopper.join().unwrap();

        assert!(pusher.calls().is_empty());
        let logged = events.tail(LOG_SURFACE_LINES);
        assert!(logged.iter().any(|e| e.line.contains("library is empty")));
    }

    #[test]
    fn restart_message_between_cycles() {
        let dir = make_library(&["only.mp4"]);
        let stop = Arc::new(AtomicBool::new(false));
        // One clip, no bumper: two invocations spans two cycles.
        let pusher = RecordingPush::new(2, stop.clone());
        let stats = Mutex::new(SequencerStats::default());
        let events = EventLog::new();

        run_sequencer(&test_seq_config(dir.path()), &stop, &stats, &pusher, &events);

        assert_eq!(file_names(&pusher.calls()), vec!["only.mp4", "only.mp4"]);
        assert_eq!(lock_unpoisoned(&stats).cycles, 1);
        let logged = events.tail(LOG_SURFACE_LINES);
        assert!(logged
            .iter()
            .any(|e| e.line.contains("playlist exhausted; restarting")));
    }

    #[test]
    fn stop_between_invocations_halts_before_next_item() {
        let dir = make_library(&["a.mp4", "b.mp4", "c.mp4"]);
        let stop = Arc::new(AtomicBool::new(false));
        let pusher = RecordingPush::new(1, stop.clone());
        let stats = Mutex::new(SequencerStats::default());
        let events = EventLog::new();

        run_sequencer(&test_seq_config(dir.path()), &stop, &stats, &pusher, &events);

        // The dispatched push completed; nothing further was attempted.
        assert_eq!(file_names(&pusher.calls()), vec!["a.mp4"]);
        assert!(lock_unpoisoned(&stats).current.is_none());
    }

    /// Sets the stop flag while a named file is being pushed, mimicking a
    /// stop request that kills the in-flight process mid-push.
    struct StopDuringPush {
        calls: Mutex<Vec<PathBuf>>,
        trigger: String,
        stop: Arc<AtomicBool>,
    }

    impl PushCapability for StopDuringPush {
        fn push(&self, input: &Path) -> anyhow::Result<()> {
            lock_unpoisoned(&self.calls).push(input.to_path_buf());
            if input.file_name().and_then(|n| n.to_str()) == Some(self.trigger.as_str()) {
                self.stop.store(true, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    #[test]
    fn stop_during_bumper_halts_before_the_clip() {
        let dir = make_library(&[BUMPER_NAME, "a.mp4", "b.mp4"]);
        let stop = Arc::new(AtomicBool::new(false));
        let pusher = StopDuringPush {
            calls: Mutex::new(Vec::new()),
            trigger: BUMPER_NAME.to_string(),
            stop: stop.clone(),
        };
        let stats = Mutex::new(SequencerStats::default());
        let events = EventLog::new();

        run_sequencer(&test_seq_config(dir.path()), &stop, &stats, &pusher, &events);

        // The bumper invocation was already dispatched; the clip that would
        // have followed it must not be.
        let calls = lock_unpoisoned(&pusher.calls).clone();
        assert_eq!(file_names(&calls), vec![BUMPER_NAME]);
        assert!(lock_unpoisoned(&stats).current.is_none());
    }

    #[test]
    fn restart_picks_up_library_changes() {
        let dir = make_library(&["a.mp4"]);
        let stop = Arc::new(AtomicBool::new(false));
        let pusher = RecordingPush::new(1, stop.clone());
        let stats = Mutex::new(SequencerStats::default());
        let events = EventLog::new();
        run_sequencer(&test_seq_config(dir.path()), &stop, &stats, &pusher, &events);
        assert_eq!(file_names(&pusher.calls()), vec!["a.mp4"]);

        // Library mutated while stopped; a fresh session re-scans.
        std::fs::write(dir.path().join("0_new.mp4"), b"stub").unwrap();
        let stop2 = Arc::new(AtomicBool::new(false));
        let pusher2 = RecordingPush::new(2, stop2.clone());
        let stats2 = Mutex::new(SequencerStats::default());
        run_sequencer(&test_seq_config(dir.path()), &stop2, &stats2, &pusher2, &events);
        assert_eq!(file_names(&pusher2.calls()), vec!["0_new.mp4", "a.mp4"]);
    }

    #[test]
    fn event_log_surface_caps_at_twenty_most_recent() {
        let events = EventLog::new();
        for i in 0..30 {
            events.push(format!("line {i}"));
        }
        let tail = events.tail(LOG_SURFACE_LINES);
        assert_eq!(tail.len(), 20);
        assert_eq!(tail.first().unwrap().line, "line 10");
        assert_eq!(tail.last().unwrap().line, "line 29");
    }

    #[test]
    fn event_log_drops_oldest_past_cap() {
        let events = EventLog::new();
        for i in 0..(EVENT_LOG_CAP + 5) {
            events.push(format!("line {i}"));
        }
        let all = events.tail(usize::MAX);
        assert_eq!(all.len(), EVENT_LOG_CAP);
        assert_eq!(all.first().unwrap().line, "line 5");
    }

    #[test]
    fn push_args_portrait_adds_scale_filter() {
        let args = push_args(Path::new("/lib/a.mp4"), true, "rtmp://host/live2/key");
        let pos_vf = args.iter().position(|a| a == "-vf").expect("-vf present");
        assert_eq!(args[pos_vf + 1], "scale=720:1280");
        assert_eq!(args.last().unwrap(), "rtmp://host/live2/key");
    }

    #[test]
    fn push_args_native_orientation_has_no_filter() {
        let args = push_args(Path::new("/lib/a.mp4"), false, "rtmp://host/live2/key");
        assert!(!args.iter().any(|a| a == "-vf"));
        // FLV container and real-time read rate are always set.
        assert!(args.iter().any(|a| a == "-re"));
        let pos_f = args.iter().rposition(|a| a == "-f").unwrap();
        assert_eq!(args[pos_f + 1], "flv");
    }

    #[test]
    fn ingest_url_joins_base_and_key() {
        assert_eq!(
            build_ingest_url("rtmp://a.rtmp.youtube.com/live2", "s3cret"),
            "rtmp://a.rtmp.youtube.com/live2/s3cret"
        );
        assert_eq!(
            build_ingest_url("rtmp://a.rtmp.youtube.com/live2/", "s3cret"),
            "rtmp://a.rtmp.youtube.com/live2/s3cret"
        );
    }

    #[test]
    fn push_line_redacts_stream_key() {
        let line = "cannot open rtmp://a.rtmp.youtube.com/live2/s3cret";
        assert_eq!(
            sanitize_push_line(line, "s3cret"),
            "cannot open rtmp://a.rtmp.youtube.com/live2/****"
        );
        // Empty key must not turn into a replace-everything.
        assert_eq!(sanitize_push_line(line, ""), line);
    }

    #[test]
    fn stderr_summary_skips_noise_lines() {
        let mut tail = VecDeque::new();
        tail.push_back("Connection refused".to_string());
        tail.push_back("Error writing trailer: Broken pipe".to_string());
        tail.push_back("Conversion failed!".to_string());
        assert_eq!(last_stderr_summary(&tail).unwrap(), "Connection refused");
        assert_eq!(last_stderr_summary(&VecDeque::new()), None);
    }

    #[test]
    fn stream_config_roundtrips_through_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");

        let cfg = StreamConfig {
            stream_key: "abcd-1234".into(),
            portrait: true,
            folder_url: "https://drive.google.com/drive/folders/xyz".into(),
            bumper_url: "https://drive.google.com/file/d/abc/view".into(),
        };

        let mut conn = Connection::open(&path).unwrap();
        db_save_stream_config(&mut conn, &cfg).unwrap();
        assert_eq!(db_load_stream_config(&conn).unwrap(), cfg);

        // Saving again overwrites the single row.
        let mut cfg2 = cfg.clone();
        cfg2.portrait = false;
        db_save_stream_config(&mut conn, &cfg2).unwrap();
        assert_eq!(db_load_stream_config(&conn).unwrap(), cfg2);
    }

    #[test]
    fn stream_config_defaults_when_table_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open(dir.path().join("fresh.db")).unwrap();
        assert_eq!(db_load_stream_config(&conn).unwrap(), StreamConfig::default());
    }

    fn test_state(config: StreamConfig, session: Option<SessionHandle>) -> AppState {
        AppState {
            version: "test".to_string(),
            sys: Arc::new(tokio::sync::Mutex::new(System::new_all())),
            stream: Arc::new(tokio::sync::Mutex::new(StreamRuntime { config, session })),
            events: EventLog::new(),
        }
    }

    #[tokio::test]
    async fn second_start_is_rejected_while_session_is_live() {
        let dir = make_library(&[]);
        let events = EventLog::new();
        let cfg = StreamConfig {
            stream_key: "k".into(),
            ..Default::default()
        };
        let session = spawn_session(&cfg, test_seq_config(dir.path()), events);
        let state = test_state(cfg, Some(session));

        let res = api_stream_start(State(state.clone())).await;
        let (code, _) = res.expect_err("second start must be rejected");
        assert_eq!(code, StatusCode::CONFLICT);

        // Only the original worker exists; wind it down.
        let mut rt = state.stream.lock().await;
        assert_eq!(stream_status(&rt).state, "running");
        let session = rt.session.take().expect("original session still owned");
        drop(rt);
        session.stop.store(true, Ordering::SeqCst);
        session.worker.await.unwrap();
    }

    #[tokio::test]
    async fn start_requires_a_stream_key() {
        let state = test_state(StreamConfig::default(), None);

        let res = api_stream_start(State(state.clone())).await;
        let (code, _) = res.expect_err("blank key must be rejected");
        assert_eq!(code, StatusCode::BAD_REQUEST);

        // The operation was not attempted: no worker was spawned.
        assert!(state.stream.lock().await.session.is_none());
    }

    #[tokio::test]
    async fn finished_session_is_reaped_and_state_returns_to_stopped() {
        let dir = make_library(&[]);
        let events = EventLog::new();
        let cfg = StreamConfig {
            stream_key: "k".into(),
            ..Default::default()
        };

        let session = spawn_session(&cfg, test_seq_config(dir.path()), events.clone());
        session.stop.store(true, Ordering::SeqCst);
        // Wait for the worker without consuming the handle the runtime owns.
        while !session.worker.is_finished() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut rt = StreamRuntime {
            config: cfg,
            session: Some(session),
        };
        reap_finished_session(&mut rt);
        assert!(rt.session.is_none());
        assert_eq!(stream_status(&rt).state, "stopped");
    }
}
