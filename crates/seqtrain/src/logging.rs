//! Tracing setup, CSV loss logs and the per-epoch progress bar.

use std::{
    fmt,
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Local};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{error::Result, loss::LossRecord};

const FLUSH_EVERY: usize = 100;
const MISSING_FIELD: &str = "-";

/// Installs the global subscriber. `RUST_LOG` overrides the default `info`
/// filter. Calling it twice is harmless.
pub fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

/// One learning rate, or one per parameter group.
#[derive(Debug, Clone, PartialEq)]
pub enum LrValue {
    Single(f64),
    PerGroup(Vec<f64>),
}

impl From<&[f64]> for LrValue {
    fn from(rates: &[f64]) -> Self {
        match rates {
            [single] => LrValue::Single(*single),
            many => LrValue::PerGroup(many.to_vec()),
        }
    }
}

impl fmt::Display for LrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LrValue::Single(lr) => write!(f, "{lr}"),
            LrValue::PerGroup(rates) => {
                let parts: Vec<_> = rates.iter().map(|lr| lr.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}

/// A row for a [`CsvLogger`]; field order fixes the column order of a new file.
pub trait CsvRecord {
    fn fields(&self) -> Vec<(String, String)>;
}

#[derive(Debug, Clone)]
pub struct StepLogEntry {
    pub chunks: usize,
    /// Seconds since the epoch started.
    pub time: f64,
    pub grad_norm: f64,
    pub lr: LrValue,
    pub scale: f32,
    pub losses: LossRecord,
}

impl CsvRecord for StepLogEntry {
    fn fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("chunks".to_string(), self.chunks.to_string()),
            ("time".to_string(), self.time.to_string()),
            ("grad_norm".to_string(), self.grad_norm.to_string()),
            ("lr".to_string(), self.lr.to_string()),
            ("scale".to_string(), self.scale.to_string()),
        ];
        fields.extend(
            self.losses
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string())),
        );
        fields
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationFields {
    pub loss: f64,
    pub mean: f64,
    pub median: f64,
}

/// One line of `training.csv`.
#[derive(Debug, Clone)]
pub struct EpochRecord {
    pub time: DateTime<Local>,
    pub duration_secs: u64,
    pub epoch: usize,
    pub train_loss: f64,
    pub validation: Option<ValidationFields>,
}

impl CsvRecord for EpochRecord {
    fn fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            (
                "time".to_string(),
                self.time.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
            ),
            ("duration".to_string(), self.duration_secs.to_string()),
            ("epoch".to_string(), self.epoch.to_string()),
            ("train_loss".to_string(), self.train_loss.to_string()),
        ];
        if let Some(validation) = self.validation {
            fields.push(("validation_loss".to_string(), validation.loss.to_string()));
            fields.push(("validation_mean".to_string(), validation.mean.to_string()));
            fields.push(("validation_median".to_string(), validation.median.to_string()));
        }
        fields
    }
}

/// Append-only CSV sink. Columns come from an existing header or from the
/// first appended record; fields a record lacks are written as `-`.
pub struct CsvLogger {
    path: PathBuf,
    writer: csv::Writer<File>,
    columns: Option<Vec<String>>,
    pending: usize,
}

impl CsvLogger {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let has_content = path.metadata().map(|meta| meta.len() > 0).unwrap_or(false);
        let columns = if has_content {
            let mut reader = csv::Reader::from_path(&path)?;
            Some(reader.headers()?.iter().map(str::to_string).collect())
        } else {
            None
        };

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let writer = csv::WriterBuilder::new()
            .has_headers(false)
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(file);

        Ok(Self {
            path,
            writer,
            columns,
            pending: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn columns(&self) -> Option<&[String]> {
        self.columns.as_deref()
    }

    pub fn append<R: CsvRecord + ?Sized>(&mut self, record: &R) -> Result<()> {
        let fields = record.fields();
        if self.columns.is_none() {
            let header: Vec<String> = fields.iter().map(|(name, _)| name.clone()).collect();
            self.writer.write_record(&header)?;
            self.columns = Some(header);
        }
        let columns = self.columns.as_deref().unwrap_or_default();

        let row = columns.iter().map(|column| {
            fields
                .iter()
                .find(|(name, _)| name == column)
                .map(|(_, value)| value.as_str())
                .unwrap_or(MISSING_FIELD)
        });
        self.writer.write_record(row)?;

        self.pending += 1;
        if self.pending >= FLUSH_EVERY {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.pending = 0;
        self.writer.flush()?;
        Ok(())
    }
}

impl Drop for CsvLogger {
    fn drop(&mut self) {
        if let Err(err) = self.writer.flush() {
            tracing::warn!(path = %self.path.display(), %err, "failed to flush csv log");
        }
    }
}

/// Progress bar for one training epoch of `steps` optimizer steps.
pub fn epoch_progress(steps: usize) -> ProgressBar {
    let bar = ProgressBar::new(steps as u64);
    let style = ProgressStyle::with_template(
        "{prefix} {bar:40.cyan/blue} {pos}/{len} [{elapsed_precise}<{eta_precise}] {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("=>-");
    bar.set_style(style);
    bar
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    struct Row(Vec<(&'static str, &'static str)>);

    impl CsvRecord for Row {
        fn fields(&self) -> Vec<(String, String)> {
            self.0
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        }
    }

    #[test]
    fn header_comes_from_first_record() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("losses_1.csv");
        {
            let mut log = CsvLogger::open(&path).unwrap();
            log.append(&Row(vec![("chunks", "64"), ("loss", "1.5")])).unwrap();
            log.append(&Row(vec![("loss", "1.25"), ("extra", "x")])).unwrap();
        }
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "chunks,loss\n64,1.5\n-,1.25\n");
    }

    #[test]
    fn reopening_keeps_existing_columns() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("training.csv");
        {
            let mut log = CsvLogger::open(&path).unwrap();
            log.append(&Row(vec![("epoch", "1"), ("train_loss", "0.5")])).unwrap();
        }
        {
            let mut log = CsvLogger::open(&path).unwrap();
            assert_eq!(log.columns().unwrap(), &["epoch", "train_loss"]);
            log.append(&Row(vec![("train_loss", "0.4"), ("epoch", "2")])).unwrap();
        }
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "epoch,train_loss\n1,0.5\n2,0.4\n");
    }

    #[test]
    fn learning_rate_renders_scalar_for_single_group() {
        assert_eq!(LrValue::from(&[0.002][..]).to_string(), "0.002");
        assert_eq!(
            LrValue::from(&[0.001, 0.0005][..]).to_string(),
            "[0.001, 0.0005]"
        );
    }

    #[test]
    fn epoch_record_omits_validation_in_pre_training() {
        let record = EpochRecord {
            time: Local::now(),
            duration_secs: 12,
            epoch: 3,
            train_loss: 0.25,
            validation: None,
        };
        let names: Vec<_> = record.fields().into_iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["time", "duration", "epoch", "train_loss"]);
    }
}
