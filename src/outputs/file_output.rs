//! Append rendered ticks to a local file.

use std::fs::File;
use std::fs::OpenOptions;
use std::io::Write;

use chrono::DateTime;
use chrono::Utc;

use crate::errors::PipelineError;
use crate::errors::PipelineResult;
use crate::operators::Snapshot;
use crate::pipeline::OutputTarget;

use super::render;
use super::OutputBuilder;
use super::OutputWriter;

/// Write each tick as a line to a file.
#[derive(Debug, Clone, Default)]
pub struct FileOutputConfig;

impl FileOutputConfig {
    pub fn new() -> Self {
        Self
    }
}

impl OutputBuilder for FileOutputConfig {
    fn build(&self, target: &OutputTarget) -> PipelineResult<Box<dyn OutputWriter>> {
        Ok(Box::new(FileOutput::new(target.clone())))
    }
}

/// The file is opened lazily in append mode on first write and kept
/// open afterwards.
pub struct FileOutput {
    target: OutputTarget,
    file: Option<File>,
}

impl FileOutput {
    pub fn new(target: OutputTarget) -> Self {
        Self { target, file: None }
    }

    fn sink_err(&self, source: std::io::Error) -> PipelineError {
        PipelineError::SinkWrite {
            target: self.target.to_string(),
            source,
        }
    }

    fn file(&mut self) -> PipelineResult<&mut File> {
        let file = match self.file.take() {
            Some(file) => file,
            None => OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.target.path())
                .map_err(|err| self.sink_err(err))?,
        };
        Ok(self.file.insert(file))
    }
}

impl OutputWriter for FileOutput {
    fn append(&mut self, snapshot: &Snapshot, timestamp: DateTime<Utc>) -> PipelineResult<()> {
        let line = render(snapshot, timestamp);
        tracing::info!("{line}");
        tracing::info!("Appending to {}", self.target);

        let file = self.file()?;
        let res = writeln!(file, "{line}")
            .and_then(|_| file.flush())
            .and_then(|_| file.sync_data());
        res.map_err(|err| self.sink_err(err))
    }

    fn reset(&mut self) -> PipelineResult<()> {
        self.file = None;
        let path = self.target.path();
        if path.exists() {
            tracing::warn!("Truncating stale output {}", self.target);
            File::create(path).map_err(|err| self.sink_err(err))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let target = OutputTarget::new(dir.path().join("out.txt"));
        let mut output = FileOutput::new(target.clone());

        let ts = Utc.timestamp_millis_opt(1000).unwrap();
        output
            .append(&Snapshot::from_iter([("a", 2), ("b", 1)]), ts)
            .unwrap();
        output.append(&Snapshot::default(), ts).unwrap();

        let found = std::fs::read_to_string(target.path()).unwrap();
        assert_eq!(
            found,
            "Counts at time 1000 ms [a: 2, b: 1]\nCounts at time 1000 ms []\n"
        );
    }

    #[test]
    fn reset_truncates_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        std::fs::write(&path, "stale\n").unwrap();

        let mut output = FileOutput::new(OutputTarget::new(&path));
        output.reset().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn reset_missing_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never-written.txt");

        let mut output = FileOutput::new(OutputTarget::new(&path));
        output.reset().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn unwritable_target_is_sink_error() {
        let dir = tempfile::tempdir().unwrap();
        // A directory can't be opened for appending.
        let mut output = FileOutput::new(OutputTarget::new(dir.path()));

        let err = output
            .append(&Snapshot::default(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, PipelineError::SinkWrite { .. }));
        assert!(err.to_string().contains(&dir.path().display().to_string()));
    }
}
