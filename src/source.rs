//! Classifier frame sources
//!
//! Live frames come from a classifier runner child process. The runner keeps
//! producing while the checkout is busy weighing, so a live source only keeps
//! the newest frame and older unread frames are skipped. Recorded frames come
//! from any async reader or an in-memory list and are delivered in order
//! through a bounded queue.

use crate::error::SourceError;
use crate::schema::{ClassificationFrame, FrameAdapter, ModelInfo, RunnerMessage};
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

enum FrameReceiver {
    Queued(mpsc::Receiver<ClassificationFrame>),
    Latest(watch::Receiver<Option<ClassificationFrame>>),
}

enum FrameSender {
    Queued(mpsc::Sender<ClassificationFrame>),
    Latest(watch::Sender<Option<ClassificationFrame>>),
}

impl FrameSender {
    fn queued(capacity: usize) -> (Self, FrameReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::Queued(tx), FrameReceiver::Queued(rx))
    }

    fn latest() -> (Self, FrameReceiver) {
        let (tx, rx) = watch::channel(None);
        (Self::Latest(tx), FrameReceiver::Latest(rx))
    }

    /// Hand a frame over. False once the receiving side is gone.
    async fn deliver(&self, frame: ClassificationFrame) -> bool {
        match self {
            Self::Queued(tx) => tx.send(frame).await.is_ok(),
            Self::Latest(tx) => tx.send(Some(frame)).is_ok(),
        }
    }

    async fn closed(&self) {
        match self {
            Self::Queued(tx) => tx.closed().await,
            Self::Latest(tx) => tx.closed().await,
        }
    }
}

/// Stream of classifier frames
pub struct ClassifierSource {
    model: Option<ModelInfo>,
    frames: FrameReceiver,
    child: Option<Child>,
    reader: JoinHandle<Result<u64, SourceError>>,
}

impl ClassifierSource {
    /// Start the runner as `<runner...> <model> <camera>` and wait for its
    /// model description.
    ///
    /// The runner command line is split on whitespace; the first word is the
    /// program.
    pub async fn spawn_runner(runner: &str, model: &Path, camera: u32) -> Result<Self, SourceError> {
        let mut words = runner.split_whitespace();
        let program = words
            .next()
            .ok_or_else(|| SourceError::ModelLoad("empty runner command".to_string()))?;

        let mut child = Command::new(program)
            .args(words)
            .arg(model)
            .arg(camera.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SourceError::Spawn {
                command: runner.to_string(),
                source,
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SourceError::ModelLoad("runner stdout unavailable".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();
        let model_info = read_model_info(&mut lines).await?;
        tracing::info!(
            "Loaded runner for \"{} / {}\"",
            model_info.project.owner,
            model_info.project.name
        );

        let (tx, rx) = FrameSender::latest();
        let reader = tokio::spawn(pump_frames(lines, tx));

        Ok(Self {
            model: Some(model_info),
            frames: rx,
            child: Some(child),
            reader,
        })
    }

    /// Follow live NDJSON runner output, keeping only the newest frame
    pub fn from_live_reader<R>(reader: R) -> Self
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let (tx, rx) = FrameSender::latest();
        Self::with_reader(reader, tx, rx)
    }

    /// Read recorded NDJSON runner output in order
    pub fn from_reader<R>(reader: R, capacity: usize) -> Self
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let (tx, rx) = FrameSender::queued(capacity);
        Self::with_reader(reader, tx, rx)
    }

    fn with_reader<R>(reader: R, tx: FrameSender, rx: FrameReceiver) -> Self
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let reader = tokio::spawn(pump_frames(reader.lines(), tx));
        Self {
            model: None,
            frames: rx,
            child: None,
            reader,
        }
    }

    /// Replay frames already in memory
    pub fn from_frames(frames: Vec<ClassificationFrame>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let reader = tokio::spawn(async move {
            let mut sent = 0;
            for frame in frames {
                if tx.send(frame).await.is_err() {
                    break;
                }
                sent += 1;
            }
            Ok(sent)
        });
        Self {
            model: None,
            frames: FrameReceiver::Queued(rx),
            child: None,
            reader,
        }
    }

    /// Model description announced by a live runner
    pub fn model(&self) -> Option<&ModelInfo> {
        self.model.as_ref()
    }

    /// Next frame, or `None` once the source is exhausted.
    ///
    /// A live source returns the newest frame not yet seen.
    pub async fn next_frame(&mut self) -> Option<ClassificationFrame> {
        match &mut self.frames {
            FrameReceiver::Queued(rx) => rx.recv().await,
            FrameReceiver::Latest(rx) => {
                rx.changed().await.ok()?;
                let frame = rx.borrow_and_update().clone();
                frame
            }
        }
    }

    /// Stop the runner and wait for the reader. Returns the number of frames
    /// the reader forwarded.
    pub async fn stop(self) -> Result<u64, SourceError> {
        let Self {
            frames,
            child,
            reader,
            ..
        } = self;
        drop(frames);

        if let Some(mut child) = child {
            if let Err(e) = child.kill().await {
                tracing::warn!("failed to stop classifier runner: {e}");
            }
        }
        match reader.await {
            Ok(result) => result,
            Err(e) => Err(SourceError::Parse(format!("frame reader failed: {e}"))),
        }
    }
}

/// First non-blank runner line must describe the model
async fn read_model_info<R>(lines: &mut Lines<R>) -> Result<ModelInfo, SourceError>
where
    R: AsyncBufRead + Unpin,
{
    while let Some(line) = lines.next_line().await? {
        match FrameAdapter::parse_line(&line) {
            Ok(None) => continue,
            Ok(Some(RunnerMessage::Model(info))) => return Ok(info),
            Ok(Some(RunnerMessage::Frame(_))) => {
                return Err(SourceError::ModelLoad(
                    "runner sent a frame before describing the model".to_string(),
                ))
            }
            Err(e) => return Err(SourceError::ModelLoad(e.to_string())),
        }
    }
    Err(SourceError::ModelLoad(
        "runner exited before describing the model".to_string(),
    ))
}

/// Forward frames until the input ends or the receiver goes away.
/// Malformed and invalid lines are logged and skipped.
async fn pump_frames<R>(mut lines: Lines<R>, tx: FrameSender) -> Result<u64, SourceError>
where
    R: AsyncBufRead + Unpin,
{
    let mut forwarded = 0;

    loop {
        let next = tokio::select! {
            line = lines.next_line() => line?,
            _ = tx.closed() => break,
        };
        let Some(line) = next else {
            break;
        };

        let frame = match FrameAdapter::parse_line(&line) {
            Ok(Some(RunnerMessage::Frame(frame))) => frame,
            Ok(Some(RunnerMessage::Model(info))) => {
                tracing::debug!(project = %info.project.name, "ignoring model description");
                continue;
            }
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!("skipping malformed frame: {e}");
                continue;
            }
        };

        if let Err(e) = frame.validate() {
            tracing::warn!("skipping invalid frame: {e}");
            continue;
        }
        if !tx.deliver(frame).await {
            break;
        }
        forwarded += 1;
    }

    tracing::debug!(forwarded, "frame source finished");
    Ok(forwarded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_from_reader_skips_bad_lines() {
        let input = concat!(
            "{\"project\": {\"owner\": \"o\", \"name\": \"n\"}, \"model_parameters\": {\"labels\": [\"Apple\"]}}\n",
            "{\"result\": {\"classification\": {\"Apple\": 0.99}}}\n",
            "garbage\n",
            "\n",
            "{\"result\": {\"classification\": {\"Apple\": 7.0}}}\n",
            "{\"result\": {\"classification\": {\"Apple\": 0.2}}}\n",
        );

        let mut source = ClassifierSource::from_reader(BufReader::new(input.as_bytes()), 4);
        let first = source.next_frame().await.unwrap();
        let second = source.next_frame().await.unwrap();
        assert_eq!(first.score("Apple"), Some(0.99));
        assert_eq!(second.score("Apple"), Some(0.2));
        assert!(source.next_frame().await.is_none());
        assert_eq!(source.stop().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_from_frames_in_order() {
        let frames = (0..5)
            .map(|i| ClassificationFrame::from_scores([("Coke", i as f64 / 10.0)]))
            .collect();
        let mut source = ClassifierSource::from_frames(frames, 2);

        let mut scores = Vec::new();
        while let Some(frame) = source.next_frame().await {
            scores.push(frame.score("Coke").unwrap());
        }
        assert_eq!(scores, vec![0.0, 0.1, 0.2, 0.3, 0.4]);
    }

    #[tokio::test]
    async fn test_stop_does_not_wait_for_idle_input() {
        let (writer, reader) = tokio::io::duplex(64);
        let source = ClassifierSource::from_reader(BufReader::new(reader), 4);
        assert_eq!(source.stop().await.unwrap(), 0);
        drop(writer);
    }

    #[tokio::test]
    async fn test_live_reader_skips_to_newest_frame() {
        let (mut writer, reader) = tokio::io::duplex(64 * 1024);
        let mut source = ClassifierSource::from_live_reader(BufReader::new(reader));

        let mut input = String::new();
        for seq in 0..50 {
            input.push_str(&format!(
                "{{\"result\": {{\"classification\": {{\"Lays\": 0.95}}}}, \"timing\": {{\"dsp\": {seq}, \"classification\": 0}}}}\n"
            ));
        }
        writer.write_all(input.as_bytes()).await.unwrap();
        drop(writer);
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let newest = source.next_frame().await.unwrap();
        assert_eq!(newest.timing.unwrap().dsp, 49);
        assert!(source.next_frame().await.is_none());
        assert_eq!(source.stop().await.unwrap(), 50);
    }

    #[tokio::test]
    async fn test_model_info_must_come_first() {
        let input = "{\"result\": {\"classification\": {\"Apple\": 0.99}}}\n";
        let mut lines = BufReader::new(input.as_bytes()).lines();
        assert!(matches!(
            read_model_info(&mut lines).await,
            Err(SourceError::ModelLoad(_))
        ));

        let mut empty = BufReader::new("".as_bytes()).lines();
        assert!(matches!(
            read_model_info(&mut empty).await,
            Err(SourceError::ModelLoad(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_runner_reads_model_then_frames() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("runner.sh");
        std::fs::write(
            &script,
            concat!(
                "echo '{\"project\": {\"owner\": \"store\", \"name\": \"shelf\"}, \"model_parameters\": {\"labels\": [\"Lays\"]}}'\n",
                "echo \"{\\\"result\\\": {\\\"classification\\\": {\\\"Lays\\\": 0.93}}, \\\"camera\\\": \\\"$2\\\"}\"\n",
            ),
        )
        .unwrap();

        let runner = format!("sh {}", script.display());
        let mut source = ClassifierSource::spawn_runner(&runner, Path::new("model.eim"), 3)
            .await
            .unwrap();
        assert_eq!(source.model().unwrap().labels(), ["Lays".to_string()]);

        let frame = source.next_frame().await.unwrap();
        assert_eq!(frame.score("Lays"), Some(0.93));
        assert!(source.next_frame().await.is_none());
        source.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_missing_runner_fails() {
        let result =
            ClassifierSource::spawn_runner("/nonexistent/autobill-runner", Path::new("model.eim"), 0)
                .await;
        assert!(matches!(result, Err(SourceError::Spawn { .. })));
    }
}
