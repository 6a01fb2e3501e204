use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::{Merger, ProcessingError};

pub const MERGE_TIMEOUT: Duration = Duration::from_secs(600);

/// Remuxes a video and an audio stream into one mp4 with an external ffmpeg.
pub struct Remuxer {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    work_dir: Option<PathBuf>,
}

impl Remuxer {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: MERGE_TIMEOUT,
            work_dir: None,
        }
    }

    /// Extra arguments placed before the inputs, e.g. `-loglevel error`.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Parent for the per-merge scratch directories. System temp dir if unset.
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    fn scratch_dir(&self) -> std::io::Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("redfoxbot-merge-");
        match &self.work_dir {
            Some(dir) => builder.tempdir_in(dir),
            None => builder.tempdir(),
        }
    }
}

#[async_trait]
impl Merger for Remuxer {
    async fn merge(&self, video_url: &str, audio_url: Option<&str>) -> Result<Vec<u8>, ProcessingError> {
        // Dropped on every return below, which removes the directory.
        let dir = self.scratch_dir()?;
        let output = dir.path().join(format!("{}.mp4", Uuid::new_v4()));
        debug!("Going to remux {}, {:?}, output: {}", video_url, audio_url, output.display());

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).arg("-i").arg(video_url);
        if let Some(audio_url) = audio_url {
            cmd.arg("-i").arg(audio_url);
        }
        cmd.arg("-shortest")
            .arg("-y")
            .arg(&output)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            ProcessingError::Remux(format!("failed to start {}: {e}", self.program.display()))
        })?;

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                error!("Timeout waiting for {}, killing", self.program.display());
                kill_group(&mut child).await;
                return Err(ProcessingError::Timeout(self.timeout));
            }
        };

        if !status.success() {
            return Err(ProcessingError::Remux(format!("{} exited with {status}", self.program.display())));
        }

        let bytes = tokio::fs::read(&output).await?;
        dir.close()?;
        Ok(bytes)
    }
}

/// SIGKILL the whole process group so ffmpeg helpers die too, then reap the child.
async fn kill_group(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: killpg has no memory effects; the group was created by us at spawn.
            let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
            if rc == 0 {
                let _ = child.wait().await;
                return;
            }
        }
    }
    if let Err(e) = child.kill().await {
        warn!("Failed to kill remux process: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `sh -c <script>` stand-in for ffmpeg; the last argument is the output file.
    fn shell(script: &str) -> Remuxer {
        Remuxer::new("/bin/sh").with_args(vec!["-c".into(), script.into(), "sh".into()])
    }

    fn is_empty(dir: &std::path::Path) -> bool {
        std::fs::read_dir(dir).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn returns_output_and_cleans_up() {
        let parent = tempfile::tempdir().unwrap();
        let remuxer = shell(r#"for last; do :; done; echo "$@" > "$last""#).with_work_dir(parent.path());

        let bytes = remuxer.merge("https://v/DASH_720.mp4", Some("https://v/DASH_audio.mp4")).await.unwrap();
        let args = String::from_utf8(bytes).unwrap();

        assert!(args.starts_with("-i https://v/DASH_720.mp4 -i https://v/DASH_audio.mp4 -shortest -y "));
        assert!(args.trim_end().ends_with(".mp4"));
        assert!(is_empty(parent.path()));
    }

    #[tokio::test]
    async fn video_only_has_single_input() {
        let parent = tempfile::tempdir().unwrap();
        let remuxer = shell(r#"for last; do :; done; echo "$@" > "$last""#).with_work_dir(parent.path());

        let bytes = remuxer.merge("https://v/DASH_480.mp4", None).await.unwrap();
        let args = String::from_utf8(bytes).unwrap();
        assert!(args.starts_with("-i https://v/DASH_480.mp4 -shortest -y "));
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_error_and_cleans_up() {
        let parent = tempfile::tempdir().unwrap();
        let remuxer = shell("exit 3").with_work_dir(parent.path());

        let result = remuxer.merge("https://v/DASH_720.mp4", None).await;
        assert!(matches!(result, Err(ProcessingError::Remux(_))));
        assert!(is_empty(parent.path()));
    }

    #[tokio::test]
    async fn missing_output_is_an_error() {
        let parent = tempfile::tempdir().unwrap();
        let remuxer = shell("exit 0").with_work_dir(parent.path());

        let result = remuxer.merge("https://v/DASH_720.mp4", None).await;
        assert!(matches!(result, Err(ProcessingError::Io(_))));
        assert!(is_empty(parent.path()));
    }

    #[tokio::test]
    async fn timeout_kills_and_cleans_up() {
        let parent = tempfile::tempdir().unwrap();
        let remuxer = shell("sleep 30")
            .with_work_dir(parent.path())
            .with_timeout(Duration::from_millis(200));

        let started = std::time::Instant::now();
        let result = remuxer.merge("https://v/DASH_720.mp4", None).await;

        assert!(matches!(result, Err(ProcessingError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(is_empty(parent.path()));
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let parent = tempfile::tempdir().unwrap();
        let remuxer = Remuxer::new("/nonexistent/ffmpeg").with_work_dir(parent.path());

        let result = remuxer.merge("https://v/DASH_720.mp4", None).await;
        assert!(matches!(result, Err(ProcessingError::Remux(_))));
        assert!(is_empty(parent.path()));
    }
}
