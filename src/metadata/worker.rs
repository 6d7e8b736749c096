//! Crash-isolated subprocess for the `symphonia` streaming probe (§4.C).
//!
//! `symphonia`'s format probes are known to abort on malformed codec
//! data. Rather than let one corrupt file bring the indexing daemon
//! down, every call into it runs in a child process — the crate's own
//! binary, re-invoked with a hidden `--extractor-worker` subcommand —
//! and talks to it over stdin/stdout with newline-delimited JSON.

use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout};

use crate::error::{Error, Result};
use crate::model::{DetectedFile, MediaFile, MediaFileBuilder};

#[derive(Debug, Serialize, Deserialize)]
struct WorkerRequest {
    detected: DetectedFile,
}

#[derive(Debug, Serialize, Deserialize)]
enum WorkerReply {
    Ok(MediaFile),
    Err(String),
}

struct RunningWorker {
    child: Child,
    stdin: BufWriter<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
}

/// Owns the (possibly absent) child worker process. Recreates it once on
/// `NoReply` and retries the same request, per §4.C's recovery contract.
pub struct WorkerHandle {
    idle_timeout: Duration,
    worker: Option<RunningWorker>,
}

impl WorkerHandle {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            worker: None,
        }
    }

    pub async fn extract(&mut self, detected: &DetectedFile) -> Result<MediaFile> {
        match self.call(detected).await {
            Ok(file) => Ok(file),
            Err(Error::NoReply) => match self.call(detected).await {
                Ok(file) => Ok(file),
                Err(_) => Err(Error::ExtractFailed(format!(
                    "worker died twice extracting {}",
                    detected.filename
                ))),
            },
            Err(e) => Err(e),
        }
    }

    async fn call(&mut self, detected: &DetectedFile) -> Result<MediaFile> {
        self.ensure_spawned().await?;

        let request = WorkerRequest {
            detected: detected.clone(),
        };
        let line =
            serde_json::to_string(&request).map_err(|e| Error::ExtractFailed(e.to_string()))?;

        {
            let worker = self.worker.as_mut().expect("spawned above");
            let sent = worker.stdin.write_all(line.as_bytes()).await.is_ok()
                && worker.stdin.write_all(b"\n").await.is_ok()
                && worker.stdin.flush().await.is_ok();
            if !sent {
                self.worker = None;
                return Err(Error::NoReply);
            }
        }

        let reply_line = {
            let worker = self.worker.as_mut().expect("spawned above");
            match tokio::time::timeout(self.idle_timeout, worker.stdout.next_line()).await {
                Ok(Ok(Some(line))) => line,
                _ => {
                    self.worker = None;
                    return Err(Error::NoReply);
                }
            }
        };

        let reply: WorkerReply =
            serde_json::from_str(&reply_line).map_err(|e| Error::ExtractFailed(e.to_string()))?;
        match reply {
            WorkerReply::Ok(file) => Ok(file),
            WorkerReply::Err(msg) => Err(Error::ExtractFailed(msg)),
        }
    }

    async fn ensure_spawned(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let exe = std::env::current_exe()?;
        let mut child = tokio::process::Command::new(exe)
            .arg("--extractor-worker")
            .arg(self.idle_timeout.as_secs().to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child.stdin.take().expect("piped");
        let stdout = child.stdout.take().expect("piped");
        tracing::debug!("spawned extractor worker");
        self.worker = Some(RunningWorker {
            child,
            stdin: BufWriter::new(stdin),
            stdout: BufReader::new(stdout).lines(),
        });
        Ok(())
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            let _ = worker.child.start_kill();
        }
    }
}

/// Entry point for the hidden `--extractor-worker` subcommand: read
/// newline-delimited requests from stdin, run the `symphonia` probe,
/// write a reply per request to stdout. Self-terminates after
/// `idle_timeout` with no request, or after `crash_after` successful
/// extractions when `MEDIASCANNER_EXTRACTOR_CRASH_AFTER` is set (the
/// test hook that exercises the client's respawn path deterministically).
pub async fn run(idle_timeout: Duration) -> Result<()> {
    let crash_after: Option<u32> = std::env::var("MEDIASCANNER_EXTRACTOR_CRASH_AFTER")
        .ok()
        .and_then(|v| v.parse().ok());

    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    let mut out = BufWriter::new(tokio::io::stdout());

    let mut completed: u32 = 0;
    loop {
        let line = match tokio::time::timeout(idle_timeout, lines.next_line()).await {
            Ok(Ok(Some(l))) => l,
            _ => break,
        };

        let reply = match serde_json::from_str::<WorkerRequest>(&line) {
            Ok(request) => match probe(&request.detected) {
                Ok(file) => WorkerReply::Ok(file),
                Err(e) => WorkerReply::Err(e.to_string()),
            },
            Err(e) => WorkerReply::Err(format!("malformed request: {e}")),
        };

        let serialized = serde_json::to_string(&reply)
            .unwrap_or_else(|_| "{\"Err\":\"failed to serialize reply\"}".to_string());
        out.write_all(serialized.as_bytes()).await?;
        out.write_all(b"\n").await?;
        out.flush().await?;

        completed += 1;
        if crash_after.is_some_and(|limit| completed >= limit) {
            std::process::exit(70);
        }
    }
    Ok(())
}

/// Run the `symphonia` streaming probe against one detected file.
/// `symphonia`'s default feature set exposes only audio track
/// parameters, so width/height are left at zero for video; duration is
/// the maximum across all tracks.
fn probe(detected: &DetectedFile) -> Result<MediaFile> {
    use symphonia::core::formats::FormatOptions;
    use symphonia::core::io::MediaSourceStream;
    use symphonia::core::meta::MetadataOptions;
    use symphonia::core::probe::Hint;

    let path = std::path::Path::new(&detected.filename);
    let file = std::fs::File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(Error::Decode)?;

    let mut duration = 0i32;
    for track in probed.format.tracks() {
        let params = &track.codec_params;
        if let (Some(n_frames), Some(rate)) = (params.n_frames, params.sample_rate) {
            if rate > 0 {
                let secs = (n_frames as f64 / rate as f64) as i32;
                duration = duration.max(secs);
            }
        }
    }

    Ok(MediaFileBuilder::new(detected.filename.clone(), detected.media_type)
        .etag(detected.etag.clone())
        .content_type(detected.content_type.clone())
        .modification_time(detected.mtime)
        .duration(duration)
        .freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MediaType;

    #[test]
    fn request_reply_round_trip_through_json() {
        let detected = DetectedFile {
            filename: "/movies/clip.mp4".into(),
            etag: "abc".into(),
            content_type: "video/mp4".into(),
            mtime: 123,
            media_type: MediaType::Video,
        };
        let request = WorkerRequest { detected: detected.clone() };
        let line = serde_json::to_string(&request).unwrap();
        let parsed: WorkerRequest = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.detected, detected);

        let reply = WorkerReply::Ok(
            MediaFileBuilder::new("/movies/clip.mp4", MediaType::Video)
                .duration(42)
                .freeze(),
        );
        let line = serde_json::to_string(&reply).unwrap();
        let parsed: WorkerReply = serde_json::from_str(&line).unwrap();
        match parsed {
            WorkerReply::Ok(file) => assert_eq!(file.duration, 42),
            WorkerReply::Err(_) => panic!("expected Ok reply"),
        }
    }

    #[test]
    fn error_reply_round_trips() {
        let reply = WorkerReply::Err("decode error: truncated stream".to_string());
        let line = serde_json::to_string(&reply).unwrap();
        let parsed: WorkerReply = serde_json::from_str(&line).unwrap();
        match parsed {
            WorkerReply::Err(msg) => assert!(msg.contains("truncated")),
            WorkerReply::Ok(_) => panic!("expected Err reply"),
        }
    }
}
