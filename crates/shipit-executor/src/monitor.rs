//! Execution monitor: runs the build command inside the launched
//! environment, streams its output, uploads the result and decides the
//! outcome.

use async_recursion::async_recursion;
use bytes::Bytes;
use shipit_config::BuildConfig;
use shipit_core::artifact::{ArtifactKey, ArtifactSink, content_type_for};
use shipit_core::bus::LogBus;
use shipit_core::launcher::LaunchRequest;
use shipit_core::{BuildId, BuildOutcome};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::LinesStream;
use tracing::{info, warn};

use crate::classify::{ArtifactResult, FailureClassifier};

/// What to run and where.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub command: String,
    pub source_dir: PathBuf,
    /// Relative to `source_dir`.
    pub output_dir: String,
    /// Parent of per-build copies of `source_dir`.
    pub work_dir: PathBuf,
    pub log_file: PathBuf,
    pub timeout: Option<Duration>,
    pub upload_timeout: Duration,
}

impl From<&BuildConfig> for MonitorSettings {
    fn from(config: &BuildConfig) -> Self {
        Self {
            command: config.command.clone(),
            source_dir: config.source_dir.clone(),
            output_dir: config.output_dir.clone(),
            work_dir: config.work_dir.clone(),
            log_file: config.log_file.clone(),
            timeout: config.timeout,
            upload_timeout: config.upload_timeout,
        }
    }
}

impl MonitorSettings {
    /// Settings private to one build: its own working copy under
    /// `work_dir` and its own log file.
    pub fn for_build(&self, id: &BuildId) -> Self {
        let file_name = self
            .log_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "build.log".to_string());
        Self {
            source_dir: self.work_dir.join(id.as_str()),
            log_file: self.log_file.with_file_name(format!("{}-{}", id, file_name)),
            ..self.clone()
        }
    }

    pub fn output_path(&self) -> PathBuf {
        self.source_dir.join(&self.output_dir)
    }
}

/// Build output, fanned out to the log bus and the on-disk log file, and
/// kept in memory for failure classification.
struct Transcript {
    build_id: BuildId,
    bus: Arc<dyn LogBus>,
    file: Option<File>,
    text: String,
}

impl Transcript {
    async fn line(&mut self, line: &str) {
        if let Err(e) = self.bus.publish_line(&self.build_id, line).await {
            warn!(job_id = %self.build_id, error = %e, "Failed to publish log line");
        }
        if let Some(file) = self.file.as_mut() {
            let written = async {
                file.write_all(line.as_bytes()).await?;
                file.write_all(b"\n").await
            }
            .await;
            if let Err(e) = written {
                warn!(job_id = %self.build_id, error = %e, "Failed to write build log, disabling");
                self.file = None;
            }
        }
        self.text.push_str(line);
        self.text.push('\n');
    }

    async fn flush(&mut self) {
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.flush().await {
                warn!(job_id = %self.build_id, error = %e, "Failed to flush build log");
            }
        }
    }
}

enum Output {
    Stdout(String),
    Stderr(String),
}

pub struct ExecutionMonitor {
    settings: MonitorSettings,
    bus: Arc<dyn LogBus>,
    sink: Arc<dyn ArtifactSink>,
    classifier: FailureClassifier,
}

impl ExecutionMonitor {
    pub fn new(
        settings: MonitorSettings,
        bus: Arc<dyn LogBus>,
        sink: Arc<dyn ArtifactSink>,
        classifier: FailureClassifier,
    ) -> Self {
        Self {
            settings,
            bus,
            sink,
            classifier,
        }
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    /// Run one build with the configured settings.
    pub async fn run(&self, request: &LaunchRequest) -> BuildOutcome {
        self.run_with(request, &self.settings).await
    }

    /// Run one build in a private copy of the source tree with a log file of
    /// its own, so builds can run side by side.
    pub async fn run_isolated(&self, request: &LaunchRequest) -> BuildOutcome {
        let id = &request.id;
        let settings = self.settings.for_build(id);
        let workspace = &settings.source_dir;

        if let Err(e) = prepare_workspace(&self.settings.source_dir, workspace).await {
            warn!(job_id = %id, path = %workspace.display(), error = %e, "Failed to prepare workspace");
            let message = format!("Failed to prepare workspace {}: {}", workspace.display(), e);
            if let Err(e) = self.bus.publish_line(id, &message).await {
                warn!(job_id = %id, error = %e, "Failed to publish log line");
            }
            return self.classifier.failure("", message);
        }

        let outcome = self.run_with(request, &settings).await;
        if let Err(e) = tokio::fs::remove_dir_all(workspace).await {
            warn!(job_id = %id, path = %workspace.display(), error = %e, "Failed to remove workspace");
        }
        outcome
    }

    async fn run_with(&self, request: &LaunchRequest, settings: &MonitorSettings) -> BuildOutcome {
        let started = Instant::now();
        let id = &request.id;

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&settings.log_file)
            .await
        {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(job_id = %id, path = %settings.log_file.display(), error = %e, "Cannot open build log");
                None
            }
        };
        let mut transcript = Transcript {
            build_id: id.clone(),
            bus: self.bus.clone(),
            file,
            text: String::new(),
        };

        info!(job_id = %id, command = %settings.command, "Build started");
        transcript.line("Build Started...").await;

        let exit_code = match self.execute(request, settings, &mut transcript).await {
            Ok(code) => code,
            Err(outcome) => {
                transcript.flush().await;
                self.upload_log(id, settings, &mut transcript).await;
                return outcome;
            }
        };

        let artifacts = match exit_code {
            Some(0) => {
                transcript.line("Build Complete").await;
                match self.upload_output(id, settings, &mut transcript).await {
                    Ok(size) => ArtifactResult::Uploaded { size },
                    Err(message) => {
                        transcript.line(&message).await;
                        ArtifactResult::Failed(message)
                    }
                }
            }
            Some(code) => {
                transcript
                    .line(&format!("Build process exited with code {}", code))
                    .await;
                ArtifactResult::NotAttempted
            }
            None => {
                transcript.line("Build process terminated by signal").await;
                ArtifactResult::NotAttempted
            }
        };

        // Decided before the log upload, which never changes the outcome.
        let outcome =
            self.classifier
                .classify(exit_code, &transcript.text, &artifacts, started.elapsed());
        transcript.flush().await;
        self.upload_log(id, settings, &mut transcript).await;

        info!(job_id = %id, outcome = ?outcome, "Build finished");
        transcript.line("Done").await;
        transcript.flush().await;
        outcome
    }

    /// Spawn the build command and stream its output until it exits.
    async fn execute(
        &self,
        request: &LaunchRequest,
        settings: &MonitorSettings,
        transcript: &mut Transcript,
    ) -> Result<Option<i32>, BuildOutcome> {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&settings.command)
            .current_dir(&settings.source_dir)
            .envs(request.environment())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so a timeout can stop everything the build spawned.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let message = format!(
                    "Failed to start build in {}: {}",
                    settings.source_dir.display(),
                    e
                );
                transcript.line(&message).await;
                return Err(self.classifier.failure(&transcript.text, message));
            }
        };

        let stdout = child.stdout.take().map(|out| {
            LinesStream::new(BufReader::new(out).lines()).map(|line| line.map(Output::Stdout))
        });
        let stderr = child.stderr.take().map(|err| {
            LinesStream::new(BufReader::new(err).lines()).map(|line| line.map(Output::Stderr))
        });

        let run = async {
            if let (Some(stdout), Some(stderr)) = (stdout, stderr) {
                let mut output = stdout.merge(stderr);
                while let Some(line) = output.next().await {
                    match line {
                        Ok(Output::Stdout(line)) => transcript.line(&line).await,
                        Ok(Output::Stderr(line)) => {
                            transcript.line(&format!("error: {}", line)).await
                        }
                        Err(e) => warn!(error = %e, "Failed to read build output"),
                    }
                }
            }
            child.wait().await
        };

        let status = match settings.timeout {
            Some(limit) => {
                let finished = tokio::time::timeout(limit, run).await;
                match finished {
                    Ok(status) => status,
                    Err(_) => {
                        kill_build(&mut child, &request.id).await;
                        let message = format!("Build timed out after {} seconds", limit.as_secs());
                        transcript.line(&message).await;
                        return Err(BuildOutcome::RetryableFailure { reason: message });
                    }
                }
            }
            None => run.await,
        };

        match status {
            Ok(status) => Ok(status.code()),
            Err(e) => {
                let message = format!("Failed to wait for build process: {}", e);
                transcript.line(&message).await;
                Err(self.classifier.failure(&transcript.text, message))
            }
        }
    }

    /// Upload the output directory. Returns the total size in bytes.
    async fn upload_output(
        &self,
        id: &BuildId,
        settings: &MonitorSettings,
        transcript: &mut Transcript,
    ) -> Result<i64, String> {
        if let Ok(names) = list_names(&settings.source_dir).await {
            transcript
                .line(&format!("Files in output directory: {}", names.join(", ")))
                .await;
        }

        let output = settings.output_path();
        if !tokio::fs::metadata(&output)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return Err(format!("Directory not found: {}", output.display()));
        }

        let entries = list_names(&output)
            .await
            .map_err(|e| format!("Failed to read {}: {}", output.display(), e))?;
        transcript
            .line(&format!("Found {} files in dist folder.", entries.len()))
            .await;
        transcript.line("Starting to upload build files...").await;

        let mut total = 0i64;
        self.upload_dir(id, &output, &output, settings.upload_timeout, transcript, &mut total)
            .await?;
        Ok(total)
    }

    #[async_recursion]
    async fn upload_dir(
        &self,
        id: &BuildId,
        root: &Path,
        dir: &Path,
        upload_timeout: Duration,
        transcript: &mut Transcript,
        total: &mut i64,
    ) -> Result<(), String> {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| format!("Failed to read {}: {}", dir.display(), e))?;
        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| format!("Failed to read {}: {}", dir.display(), e))?
        {
            paths.push(entry.path());
        }
        paths.sort();

        for path in paths {
            let metadata = tokio::fs::metadata(&path)
                .await
                .map_err(|e| format!("Failed to stat {}: {}", path.display(), e))?;
            if metadata.is_dir() {
                self.upload_dir(id, root, &path, upload_timeout, transcript, total)
                    .await?;
                continue;
            }

            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let relative = path.strip_prefix(root).unwrap_or(&path);
            transcript.line(&format!("Uploading {}...", name)).await;

            match self
                .upload_file(id, &path, relative, upload_timeout)
                .await
            {
                Ok(size) => {
                    *total += size;
                    transcript.line(&format!("Uploaded {}", name)).await;
                }
                Err(message) => {
                    let message = format!("Failed to upload {}: {}", name, message);
                    return Err(message);
                }
            }
        }
        Ok(())
    }

    async fn upload_file(
        &self,
        id: &BuildId,
        path: &Path,
        relative: &Path,
        upload_timeout: Duration,
    ) -> Result<i64, String> {
        let key = ArtifactKey::from_relative(id.clone(), relative).map_err(|e| e.to_string())?;
        let data = tokio::fs::read(path).await.map_err(|e| e.to_string())?;
        let size = data.len() as i64;

        tokio::time::timeout(
            upload_timeout,
            self.sink.put(&key, content_type_for(path), Bytes::from(data)),
        )
        .await
        .map_err(|_| format!("timeout after {} seconds", upload_timeout.as_secs()))?
        .map_err(|e| e.to_string())?;
        Ok(size)
    }

    /// Upload the build log. Failure here never changes the outcome.
    async fn upload_log(&self, id: &BuildId, settings: &MonitorSettings, transcript: &mut Transcript) {
        transcript.line("Uploading build log file...").await;
        transcript.flush().await;

        let data = match tokio::fs::read(&settings.log_file).await {
            Ok(data) => Bytes::from(data),
            // Fall back to the in-memory transcript when the file is unusable.
            Err(_) => Bytes::from(transcript.text.clone()),
        };
        let key = ArtifactKey::new(id.clone(), "build.log");
        let result =
            tokio::time::timeout(settings.upload_timeout, self.sink.put(&key, "text/plain", data))
                .await;

        match result {
            Ok(Ok(_)) => transcript.line("Build log uploaded").await,
            Ok(Err(e)) => {
                warn!(job_id = %id, error = %e, "Failed to upload build log");
                transcript
                    .line(&format!("Failed to upload build log: {}", e))
                    .await;
            }
            Err(_) => {
                warn!(job_id = %id, "Build log upload timed out");
                transcript
                    .line("Failed to upload build log: timed out")
                    .await;
            }
        }
    }
}

/// Kill the build and every process in its group.
async fn kill_build(child: &mut Child, id: &BuildId) {
    if let Some(pid) = child.id() {
        let group = format!("-{}", pid);
        match Command::new("kill")
            .args(["-KILL", "--", &group])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(status) if status.success() => {}
            Ok(status) => warn!(job_id = %id, %status, "kill exited unsuccessfully"),
            Err(e) => warn!(job_id = %id, error = %e, "Failed to run kill"),
        }
    }
    if let Err(e) = child.kill().await {
        warn!(job_id = %id, error = %e, "Failed to kill timed out build");
    }
}

/// Replace `workspace` with a fresh copy of `source`.
async fn prepare_workspace(source: &Path, workspace: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(workspace).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    tokio::fs::create_dir_all(workspace).await?;
    let workspace = tokio::fs::canonicalize(workspace).await?;
    copy_tree(source, &workspace, &workspace).await
}

#[async_recursion]
async fn copy_tree(from: &Path, to: &Path, workspace: &Path) -> std::io::Result<()> {
    let mut entries = tokio::fs::read_dir(from).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let target = to.join(entry.file_name());
        let file_type = entry.file_type().await?;

        if file_type.is_dir() {
            // `work_dir` may live inside the source tree.
            if workspace.starts_with(tokio::fs::canonicalize(&path).await?) {
                continue;
            }
            tokio::fs::create_dir_all(&target).await?;
            copy_tree(&path, &target, workspace).await?;
        } else if file_type.is_symlink() {
            #[cfg(unix)]
            tokio::fs::symlink(tokio::fs::read_link(&path).await?, &target).await?;
        } else {
            tokio::fs::copy(&path, &target).await?;
        }
    }
    Ok(())
}

async fn list_names(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::FsArtifactSink;
    use async_trait::async_trait;
    use shipit_core::artifact::ArtifactRef;
    use shipit_core::bus::{LogEvent, LogSubscription, subscription_channel};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Bus that records every line it is given.
    #[derive(Default)]
    struct RecordingBus {
        lines: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LogBus for RecordingBus {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn publish(&self, event: &LogEvent) -> shipit_core::Result<()> {
            self.lines.lock().unwrap().push(event.line.clone());
            Ok(())
        }

        async fn subscribe(&self, build_id: &BuildId) -> shipit_core::Result<LogSubscription> {
            let (_tx, rx) = subscription_channel(1);
            Ok(LogSubscription::new(build_id.clone(), rx, || {}))
        }
    }

    /// Sink that fails every upload.
    struct BrokenSink;

    #[async_trait]
    impl ArtifactSink for BrokenSink {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn put(
            &self,
            _key: &ArtifactKey,
            _content_type: &str,
            _data: Bytes,
        ) -> shipit_core::Result<ArtifactRef> {
            Err(shipit_core::Error::Artifact("ECONNRESET talking to store".into()))
        }
    }

    struct Fixture {
        dir: PathBuf,
        bus: Arc<RecordingBus>,
        artifacts: PathBuf,
    }

    impl Fixture {
        async fn new() -> Self {
            let dir = std::env::temp_dir().join(format!("shipit-monitor-{}", uuid::Uuid::new_v4()));
            tokio::fs::create_dir_all(dir.join("output")).await.unwrap();
            Self {
                artifacts: dir.join("store"),
                dir,
                bus: Arc::new(RecordingBus::default()),
            }
        }

        fn monitor(&self, command: &str, sink: Option<Arc<dyn ArtifactSink>>) -> ExecutionMonitor {
            let settings = MonitorSettings {
                command: command.to_string(),
                source_dir: self.dir.join("output"),
                output_dir: "dist".to_string(),
                work_dir: self.dir.join("work"),
                log_file: self.dir.join("build.log"),
                timeout: None,
                upload_timeout: Duration::from_secs(10),
            };
            let sink = sink.unwrap_or_else(|| Arc::new(FsArtifactSink::new(&self.artifacts)));
            ExecutionMonitor::new(settings, self.bus.clone(), sink, FailureClassifier::default())
        }

        fn lines(&self) -> Vec<String> {
            self.bus.lines.lock().unwrap().clone()
        }

        async fn cleanup(self) {
            let _ = tokio::fs::remove_dir_all(&self.dir).await;
        }
    }

    fn request() -> LaunchRequest {
        let mut env_vars = BTreeMap::new();
        env_vars.insert("GREETING".to_string(), "hello".to_string());
        LaunchRequest {
            id: BuildId::parse("site-1").unwrap(),
            repo_url: "https://example.com/site.git".to_string(),
            env_vars,
        }
    }

    #[tokio::test]
    async fn test_successful_build_uploads_output() {
        let fx = Fixture::new().await;
        let monitor = fx.monitor(
            "mkdir -p dist/assets && printf '<h1>hi</h1>' > dist/index.html \
             && printf 'x=1' > dist/assets/app.js && echo \"$GREETING from $BUILD_ID\"",
            None,
        );

        let outcome = monitor.run(&request()).await;
        match outcome {
            BuildOutcome::Success { size, .. } => assert_eq!(size, 14),
            other => panic!("expected success, got {other:?}"),
        }

        let store = fx.artifacts.join("outputs/site-1");
        assert_eq!(
            tokio::fs::read_to_string(store.join("index.html")).await.unwrap(),
            "<h1>hi</h1>"
        );
        assert!(store.join("assets/app.js").exists());
        let log = tokio::fs::read_to_string(store.join("build.log")).await.unwrap();
        assert!(log.contains("hello from site-1"));

        let lines = fx.lines();
        assert_eq!(lines[0], "Build Started...");
        assert!(lines.contains(&"hello from site-1".to_string()));
        assert!(lines.contains(&"Build Complete".to_string()));
        assert!(lines.contains(&"Uploaded index.html".to_string()));
        assert_eq!(lines.last().map(String::as_str), Some("Done"));
        fx.cleanup().await;
    }

    #[tokio::test]
    async fn test_nonzero_exit_with_marker_is_retryable() {
        let fx = Fixture::new().await;
        let monitor = fx.monitor("echo 'npm ERR! code ECONNRESET' >&2; exit 1", None);

        let outcome = monitor.run(&request()).await;
        assert_eq!(
            outcome,
            BuildOutcome::RetryableFailure {
                reason: "Build failed with exit code 1".into()
            }
        );
        let lines = fx.lines();
        assert!(lines.contains(&"error: npm ERR! code ECONNRESET".to_string()));
        assert!(lines.contains(&"Build process exited with code 1".to_string()));
        fx.cleanup().await;
    }

    #[tokio::test]
    async fn test_nonzero_exit_without_marker_is_permanent() {
        let fx = Fixture::new().await;
        let monitor = fx.monitor("echo 'SyntaxError: nope'; exit 3", None);

        assert_eq!(
            monitor.run(&request()).await,
            BuildOutcome::PermanentFailure {
                reason: "Build failed with exit code 3".into()
            }
        );
        fx.cleanup().await;
    }

    #[tokio::test]
    async fn test_missing_output_dir_is_never_success() {
        let fx = Fixture::new().await;
        let monitor = fx.monitor("echo built", None);

        let outcome = monitor.run(&request()).await;
        let expected = format!(
            "Directory not found: {}",
            fx.dir.join("output").join("dist").display()
        );
        assert_eq!(outcome, BuildOutcome::PermanentFailure { reason: expected });
        fx.cleanup().await;
    }

    /// Sink that stores build output but fails the log upload.
    struct LogRejectingSink(FsArtifactSink);

    #[async_trait]
    impl ArtifactSink for LogRejectingSink {
        fn name(&self) -> &'static str {
            "log-rejecting"
        }

        async fn put(
            &self,
            key: &ArtifactKey,
            content_type: &str,
            data: Bytes,
        ) -> shipit_core::Result<ArtifactRef> {
            if content_type == "text/plain" {
                return Err(shipit_core::Error::Artifact("ECONNRESET talking to store".into()));
            }
            self.0.put(key, content_type, data).await
        }
    }

    #[tokio::test]
    async fn test_log_upload_failure_keeps_outcome() {
        let fx = Fixture::new().await;
        let sink = Arc::new(LogRejectingSink(FsArtifactSink::new(&fx.artifacts)));
        let monitor = fx.monitor("echo 'SyntaxError: nope'; exit 3", Some(sink));

        assert_eq!(
            monitor.run(&request()).await,
            BuildOutcome::PermanentFailure {
                reason: "Build failed with exit code 3".into()
            }
        );
        assert!(
            fx.lines()
                .iter()
                .any(|l| l.starts_with("Failed to upload build log"))
        );
        fx.cleanup().await;
    }

    #[tokio::test]
    async fn test_upload_failure_is_classified() {
        let fx = Fixture::new().await;
        let monitor = fx.monitor(
            "mkdir -p dist && echo ok > dist/index.html",
            Some(Arc::new(BrokenSink)),
        );

        match monitor.run(&request()).await {
            BuildOutcome::RetryableFailure { reason } => {
                assert!(reason.starts_with("Failed to upload index.html"))
            }
            other => panic!("expected retryable failure, got {other:?}"),
        }
        assert!(
            fx.lines()
                .iter()
                .any(|l| l.starts_with("Failed to upload build log"))
        );
        fx.cleanup().await;
    }

    #[tokio::test]
    async fn test_timeout_is_retryable() {
        let fx = Fixture::new().await;
        let mut monitor = fx.monitor("(sleep 1; touch late.txt) & sleep 30", None);
        monitor.settings.timeout = Some(Duration::from_millis(200));

        match monitor.run(&request()).await {
            BuildOutcome::RetryableFailure { reason } => {
                assert!(reason.starts_with("Build timed out"))
            }
            other => panic!("expected retryable failure, got {other:?}"),
        }

        // Background work started by the build dies with it.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!fx.dir.join("output/late.txt").exists());
        fx.cleanup().await;
    }

    #[tokio::test]
    async fn test_run_isolated_uses_private_log() {
        let fx = Fixture::new().await;
        let monitor = fx.monitor("mkdir -p dist && echo ok > dist/index.html", None);

        monitor.run_isolated(&request()).await;
        assert!(fx.dir.join("site-1-build.log").exists());
        assert!(!fx.dir.join("build.log").exists());
        assert!(!fx.dir.join("output/dist").exists());
        assert!(!fx.dir.join("work/site-1").exists());
        fx.cleanup().await;
    }

    #[tokio::test]
    async fn test_concurrent_isolated_builds_keep_their_own_output() {
        let fx = Fixture::new().await;
        tokio::fs::write(fx.dir.join("output/package.json"), "{}").await.unwrap();
        let monitor = Arc::new(fx.monitor(
            "test -f package.json && mkdir -p dist && echo $BUILD_ID > dist/id.txt && sleep 0.5",
            None,
        ));

        let spawn_build = |raw: &str| {
            let monitor = monitor.clone();
            let request = LaunchRequest {
                id: BuildId::parse(raw).unwrap(),
                ..request()
            };
            tokio::spawn(async move { monitor.run_isolated(&request).await })
        };
        let a = spawn_build("job-a");
        tokio::time::sleep(Duration::from_millis(100)).await;
        let b = spawn_build("job-b");

        for (raw, handle) in [("job-a", a), ("job-b", b)] {
            let outcome = handle.await.unwrap();
            assert!(matches!(outcome, BuildOutcome::Success { .. }), "{raw}: {outcome:?}");
            let uploaded = tokio::fs::read_to_string(fx.artifacts.join(format!("outputs/{raw}/id.txt")))
                .await
                .unwrap();
            assert_eq!(uploaded.trim(), raw);
        }
        fx.cleanup().await;
    }
}
