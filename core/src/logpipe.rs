//! Background log persistence.
//!
//! Producers on any thread push [`LogRecord`]s through a cloneable
//! [`LogHandle`]; a single consumer thread owned by [`LogPipeline`] batches
//! whatever is queued on each wake and appends it to the log file. The host
//! stops the pipeline by raising the shared termination flag.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing_subscriber::fmt::MakeWriter;

use crate::error::{CoreError, CoreResult};

pub const DRAIN_INTERVAL: Duration = Duration::from_millis(100);
pub const LOG_PREFIX: &str = ">> ";

/// One newline-terminated log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord(String);

impl LogRecord {
    pub fn line(text: impl Into<String>) -> Self {
        let mut text = text.into();
        if !text.ends_with('\n') {
            text.push('\n');
        }
        Self(text)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Draining,
    Stopped,
}

impl PipelineState {
    fn as_u8(self) -> u8 {
        match self {
            PipelineState::Idle => 0,
            PipelineState::Running => 1,
            PipelineState::Draining => 2,
            PipelineState::Stopped => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => PipelineState::Idle,
            1 => PipelineState::Running,
            2 => PipelineState::Draining,
            _ => PipelineState::Stopped,
        }
    }
}

/// Destination of flushed log batches.
pub trait LogWriter: Send {
    /// Truncates or creates the destination.
    fn reset(&mut self) -> io::Result<()>;
    fn append(&mut self, text: &str) -> io::Result<()>;
}

/// Appends to a UTF-8 file, reopening it on every flush.
#[derive(Debug, Clone)]
pub struct FileAppender {
    path: PathBuf,
}

impl FileAppender {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl LogWriter for FileAppender {
    fn reset(&mut self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        File::create(&self.path).map(|_| ())
    }

    fn append(&mut self, text: &str) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(text.as_bytes())
    }
}

/// Producer side of the pipeline. Cheap to clone; never blocks.
#[derive(Clone)]
pub struct LogHandle {
    tx: Sender<LogRecord>,
    level: u8,
}

impl LogHandle {
    pub fn enqueue(&self, record: LogRecord) {
        // Only fails once the pipeline is gone, at which point there is
        // nowhere left to write.
        let _ = self.tx.send(record);
    }

    pub fn log(&self, text: &str) {
        self.log_at(1, text);
    }

    /// Drops `text` when `level` is above the configured verbosity.
    pub fn log_at(&self, level: u8, text: &str) {
        if level > self.level {
            return;
        }
        self.enqueue(LogRecord::line(format!("{}{}", LOG_PREFIX, text)));
    }

    pub fn level(&self) -> u8 {
        self.level
    }
}

/// `io::Write` adapter so a `tracing_subscriber::fmt` layer can target the
/// pipeline.
pub struct PipelineWriter {
    tx: Sender<LogRecord>,
}

impl Write for PipelineWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(buf).to_string();
        let _ = self.tx.send(LogRecord::line(text));
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogHandle {
    type Writer = PipelineWriter;

    fn make_writer(&'a self) -> Self::Writer {
        PipelineWriter {
            tx: self.tx.clone(),
        }
    }
}

pub struct LogPipeline {
    tx: Sender<LogRecord>,
    rx: Receiver<LogRecord>,
    terminate: Arc<AtomicBool>,
    /// Private to this pipeline; raised on drop so the shared flag is left alone.
    halt: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    writer: Option<Box<dyn LogWriter>>,
    worker: Option<JoinHandle<()>>,
    interval: Duration,
    level: u8,
}

impl LogPipeline {
    pub fn new(writer: Box<dyn LogWriter>) -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            terminate: Arc::new(AtomicBool::new(false)),
            halt: Arc::new(AtomicBool::new(false)),
            state: Arc::new(AtomicU8::new(PipelineState::Idle.as_u8())),
            writer: Some(writer),
            worker: None,
            interval: DRAIN_INTERVAL,
            level: 1,
        }
    }

    pub fn to_file(path: impl Into<PathBuf>) -> Self {
        Self::new(Box::new(FileAppender::new(path)))
    }

    /// Shares the host's process-wide termination flag.
    pub fn with_terminate_flag(mut self, terminate: Arc<AtomicBool>) -> Self {
        self.terminate = terminate;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_level(mut self, level: u8) -> Self {
        self.level = level;
        self
    }

    pub fn handle(&self) -> LogHandle {
        LogHandle {
            tx: self.tx.clone(),
            level: self.level,
        }
    }

    pub fn terminate_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.terminate)
    }

    pub fn state(&self) -> PipelineState {
        PipelineState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Truncates the log file and spawns the consumer thread.
    pub fn start(&mut self) -> CoreResult<()> {
        if self.state() != PipelineState::Idle {
            return Err(CoreError::InvalidState(format!(
                "log pipeline is {:?}",
                self.state()
            )));
        }
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| CoreError::InvalidState("log writer missing".to_string()))?;
        writer
            .reset()
            .map_err(|err| CoreError::Io(err.to_string()))?;

        self.state
            .store(PipelineState::Running.as_u8(), Ordering::SeqCst);
        let rx = self.rx.clone();
        let stop = StopSignal {
            terminate: Arc::clone(&self.terminate),
            halt: Arc::clone(&self.halt),
        };
        let state = Arc::clone(&self.state);
        let interval = self.interval;
        let worker = thread::Builder::new()
            .name("log-pipeline".to_string())
            .spawn(move || run(rx, writer, stop, state, interval))
            .map_err(|err| CoreError::Io(err.to_string()))?;
        self.worker = Some(worker);
        Ok(())
    }

    /// Raises the termination flag and waits for the final flush.
    pub fn shutdown(&mut self) {
        self.terminate.store(true, Ordering::SeqCst);
        self.join();
    }

    fn join(&mut self) {
        match self.worker.take() {
            Some(worker) => {
                let _ = worker.join();
            }
            None => self
                .state
                .store(PipelineState::Stopped.as_u8(), Ordering::SeqCst),
        }
    }
}

impl Drop for LogPipeline {
    fn drop(&mut self) {
        self.halt.store(true, Ordering::SeqCst);
        self.join();
    }
}

struct StopSignal {
    terminate: Arc<AtomicBool>,
    halt: Arc<AtomicBool>,
}

impl StopSignal {
    fn raised(&self) -> bool {
        self.terminate.load(Ordering::SeqCst) || self.halt.load(Ordering::SeqCst)
    }
}

fn run(
    rx: Receiver<LogRecord>,
    mut writer: Box<dyn LogWriter>,
    stop: StopSignal,
    state: Arc<AtomicU8>,
    interval: Duration,
) {
    let mut buffer = String::new();
    loop {
        let terminating = stop.raised();
        if terminating {
            state.store(PipelineState::Draining.as_u8(), Ordering::SeqCst);
        } else {
            // One batch per wake, however many records arrive meanwhile.
            thread::sleep(interval);
        }

        let flushed = drain_cycle(&rx, &mut buffer, writer.as_mut());
        if terminating {
            if !flushed {
                eprintln!(
                    "log pipeline: dropped {} bytes of log on shutdown",
                    buffer.len()
                );
            }
            break;
        }
    }
    state.store(PipelineState::Stopped.as_u8(), Ordering::SeqCst);
}

/// Moves the records queued at call time into `buffer` and appends it.
/// Records arriving meanwhile wait for the next cycle. On a failed write the
/// buffer is kept so the next cycle retries it.
pub(crate) fn drain_cycle(
    rx: &Receiver<LogRecord>,
    buffer: &mut String,
    writer: &mut dyn LogWriter,
) -> bool {
    let pending = rx.len();
    for _ in 0..pending {
        match rx.try_recv() {
            Ok(record) => buffer.push_str(record.as_str()),
            Err(_) => break,
        }
    }
    if buffer.is_empty() {
        return true;
    }
    match writer.append(buffer) {
        Ok(()) => {
            buffer.clear();
            true
        }
        Err(err) => {
            eprintln!("log pipeline: write failed: {}", err);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct MemoryWriter {
        content: Arc<Mutex<String>>,
        failures_left: Arc<Mutex<usize>>,
        appends: Arc<Mutex<usize>>,
    }

    impl MemoryWriter {
        fn failing(times: usize) -> Self {
            let writer = Self::default();
            *writer.failures_left.lock().unwrap() = times;
            writer
        }

        fn content(&self) -> String {
            self.content.lock().unwrap().clone()
        }

        fn appends(&self) -> usize {
            *self.appends.lock().unwrap()
        }
    }

    impl LogWriter for MemoryWriter {
        fn reset(&mut self) -> io::Result<()> {
            self.content.lock().unwrap().clear();
            Ok(())
        }

        fn append(&mut self, text: &str) -> io::Result<()> {
            let mut failures = self.failures_left.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            self.content.lock().unwrap().push_str(text);
            *self.appends.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[test]
    fn record_is_newline_terminated_once() {
        assert_eq!(LogRecord::line("hello").as_str(), "hello\n");
        assert_eq!(LogRecord::line("hello\n").as_str(), "hello\n");
    }

    #[test]
    fn failed_flush_is_retried_next_cycle() {
        let (tx, rx) = unbounded();
        let mut writer = MemoryWriter::failing(1);
        let mut buffer = String::new();

        for index in 0..3 {
            tx.send(LogRecord::line(format!("line {}", index))).unwrap();
        }
        assert!(!drain_cycle(&rx, &mut buffer, &mut writer));
        assert_eq!(writer.content(), "");
        assert_eq!(buffer, "line 0\nline 1\nline 2\n");

        tx.send(LogRecord::line("line 3")).unwrap();
        assert!(drain_cycle(&rx, &mut buffer, &mut writer));
        assert_eq!(writer.content(), "line 0\nline 1\nline 2\nline 3\n");
        assert!(buffer.is_empty());
    }

    #[test]
    fn empty_cycle_does_not_write() {
        let (_tx, rx) = unbounded::<LogRecord>();
        let mut writer = MemoryWriter::failing(1);
        let mut buffer = String::new();
        assert!(drain_cycle(&rx, &mut buffer, &mut writer));
        // the single failure is still armed, so append was never called
        assert_eq!(*writer.failures_left.lock().unwrap(), 1);
    }

    #[test]
    fn records_flushed_in_order_on_shutdown() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("log.txt");
        let mut pipeline = LogPipeline::to_file(&path).with_interval(Duration::from_millis(10));
        assert_eq!(pipeline.state(), PipelineState::Idle);
        pipeline.start().expect("start");
        assert_eq!(pipeline.state(), PipelineState::Running);

        let handle = pipeline.handle();
        for index in 0..250 {
            handle.log(&format!("record {}", index));
        }
        pipeline.shutdown();
        assert_eq!(pipeline.state(), PipelineState::Stopped);

        let text = fs::read_to_string(&path).expect("read log");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 250);
        for (index, line) in lines.iter().enumerate() {
            assert_eq!(*line, format!(">> record {}", index));
        }
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn start_truncates_previous_log() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("log.txt");
        fs::write(&path, "stale\n").expect("seed");
        let mut pipeline = LogPipeline::to_file(&path);
        pipeline.start().expect("start");
        pipeline.shutdown();
        assert_eq!(fs::read_to_string(&path).expect("read log"), "");
    }

    #[test]
    fn concurrent_producers_keep_per_thread_order() {
        let writer = MemoryWriter::default();
        let mut pipeline =
            LogPipeline::new(Box::new(writer.clone())).with_interval(Duration::from_millis(5));
        pipeline.start().expect("start");

        let producers: Vec<_> = (0..4)
            .map(|worker| {
                let handle = pipeline.handle();
                thread::spawn(move || {
                    for index in 0..100 {
                        handle.enqueue(LogRecord::line(format!("{} {}", worker, index)));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }
        pipeline.shutdown();

        let content = writer.content();
        for worker in 0..4 {
            let seen: Vec<usize> = content
                .lines()
                .filter_map(|line| line.split_once(' '))
                .filter(|(id, _)| *id == worker.to_string())
                .map(|(_, index)| index.parse().unwrap())
                .collect();
            assert_eq!(seen, (0..100).collect::<Vec<_>>());
        }
    }

    #[test]
    fn external_terminate_flag_stops_loop() {
        let writer = MemoryWriter::default();
        let flag = Arc::new(AtomicBool::new(false));
        let mut pipeline = LogPipeline::new(Box::new(writer.clone()))
            .with_terminate_flag(Arc::clone(&flag))
            .with_interval(Duration::from_millis(5));
        pipeline.start().expect("start");
        pipeline.handle().log("before flag");
        flag.store(true, Ordering::SeqCst);
        pipeline.shutdown();
        assert_eq!(writer.content(), ">> before flag\n");
        assert_eq!(pipeline.state(), PipelineState::Stopped);
    }

    #[test]
    fn trickle_is_batched_per_interval() {
        let writer = MemoryWriter::default();
        let mut pipeline = LogPipeline::new(Box::new(writer.clone()));
        pipeline.start().expect("start");
        let handle = pipeline.handle();
        for index in 0..200 {
            handle.log(&format!("tick {}", index));
            thread::sleep(Duration::from_millis(2));
        }
        pipeline.shutdown();

        assert_eq!(writer.content().lines().count(), 200);
        let appends = writer.appends();
        assert!(appends <= 12, "{} appends for 200 records", appends);
    }

    #[test]
    fn drop_leaves_shared_flag_alone() {
        let writer = MemoryWriter::default();
        let flag = Arc::new(AtomicBool::new(false));
        {
            let mut pipeline = LogPipeline::new(Box::new(writer.clone()))
                .with_terminate_flag(Arc::clone(&flag))
                .with_interval(Duration::from_millis(5));
            pipeline.start().expect("start");
            pipeline.handle().log("flushed on drop");
        }
        assert!(!flag.load(Ordering::SeqCst));
        assert_eq!(writer.content(), ">> flushed on drop\n");
    }

    #[test]
    fn start_twice_is_rejected() {
        let mut pipeline = LogPipeline::new(Box::new(MemoryWriter::default()));
        pipeline.start().expect("start");
        assert!(matches!(pipeline.start(), Err(CoreError::InvalidState(_))));
    }

    #[test]
    fn level_filter_drops_verbose_lines() {
        let writer = MemoryWriter::default();
        let mut pipeline = LogPipeline::new(Box::new(writer.clone())).with_level(2);
        pipeline.start().expect("start");
        let handle = pipeline.handle();
        handle.log_at(1, "kept");
        handle.log_at(2, "also kept");
        handle.log_at(3, "dropped");
        pipeline.shutdown();
        assert_eq!(writer.content(), ">> kept\n>> also kept\n");
    }

    #[test]
    fn make_writer_feeds_pipeline() {
        let writer = MemoryWriter::default();
        let mut pipeline = LogPipeline::new(Box::new(writer.clone()));
        pipeline.start().expect("start");
        let handle = pipeline.handle();
        handle
            .make_writer()
            .write_all(b" INFO probing headers\n")
            .expect("write");
        pipeline.shutdown();
        assert_eq!(writer.content(), " INFO probing headers\n");
    }
}
