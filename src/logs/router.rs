use crate::error::Result;
use crate::logs::sink::{LogSink, OutputStream};
use crate::logs::TimestampFormat;
use crate::process::InstanceId;
use crate::registry::ProcessSpec;
use chrono::Local;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::Mutex;

type SharedSink = Arc<Mutex<LogSink>>;

/// Sinks are per app, or per instance for clustered apps that do not merge
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SinkKey {
    app: String,
    ordinal: Option<u32>,
}

/// How every captured line is decorated before it hits the sink
#[derive(Debug, Clone)]
struct LineFormat {
    timestamp: Option<TimestampFormat>,
    tag: Option<String>,
}

impl LineFormat {
    fn render(&self, line: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(line.len() + 48);

        if let Some(ref format) = self.timestamp {
            out.extend_from_slice(format.format(&Local::now()).as_bytes());
            out.extend_from_slice(b": ");
        }
        if let Some(ref tag) = self.tag {
            out.push(b'[');
            out.extend_from_slice(tag.as_bytes());
            out.extend_from_slice(b"] ");
        }

        out.extend_from_slice(line);
        if !line.ends_with(b"\n") {
            out.push(b'\n');
        }
        out
    }
}

/// Routes child stdout/stderr into log sinks
pub struct LogRouter {
    max_size: u64,
    sinks: Mutex<HashMap<SinkKey, SharedSink>>,
}

impl LogRouter {
    pub fn new(max_size: u64) -> Self {
        Self {
            max_size,
            sinks: Mutex::new(HashMap::new()),
        }
    }

    /// Start capturing the output of one instance.
    ///
    /// Spawns one reader task per stream; each runs until the pipe reaches EOF.
    pub async fn attach<O, E>(
        &self,
        id: &InstanceId,
        spec: &ProcessSpec,
        stdout: Option<O>,
        stderr: Option<E>,
    ) -> Result<()>
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let sink = self.sink_for(id, spec).await?;
        let format = line_format(id, spec)?;

        if let Some(stdout) = stdout {
            tokio::spawn(pump(
                id.clone(),
                stdout,
                Arc::clone(&sink),
                OutputStream::Stdout,
                format.clone(),
            ));
        }
        if let Some(stderr) = stderr {
            tokio::spawn(pump(id.clone(), stderr, sink, OutputStream::Stderr, format));
        }

        Ok(())
    }

    async fn sink_for(&self, id: &InstanceId, spec: &ProcessSpec) -> Result<SharedSink> {
        let key = SinkKey {
            app: spec.name.clone(),
            ordinal: per_instance(spec).then_some(id.ordinal),
        };

        let mut sinks = self.sinks.lock().await;
        if let Some(sink) = sinks.get(&key) {
            return Ok(Arc::clone(sink));
        }

        let (stdout_path, stderr_path) = sink_paths(spec, key.ordinal);
        let sink = Arc::new(Mutex::new(LogSink::open(
            &stdout_path,
            &stderr_path,
            self.max_size,
        )?));
        tracing::debug!(
            app = %spec.name,
            stdout = %stdout_path.display(),
            stderr = %stderr_path.display(),
            "Opened log sink"
        );

        sinks.insert(key, Arc::clone(&sink));
        Ok(sink)
    }

    /// Drop every sink of `app`; reader tasks still holding one finish their pipe first
    pub async fn close(&self, app: &str) {
        let closed: Vec<SharedSink> = {
            let mut sinks = self.sinks.lock().await;
            let keys: Vec<SinkKey> = sinks.keys().filter(|k| k.app == app).cloned().collect();
            keys.iter().filter_map(|k| sinks.remove(k)).collect()
        };

        for sink in closed {
            if let Err(e) = sink.lock().await.flush().await {
                tracing::warn!(app, error = %e, "Failed to flush log sink on close");
            }
        }
    }

    pub async fn flush_all(&self) -> Result<()> {
        let sinks: Vec<SharedSink> = self.sinks.lock().await.values().cloned().collect();
        for sink in sinks {
            sink.lock().await.flush().await?;
        }
        Ok(())
    }

    pub async fn sink_count(&self) -> usize {
        self.sinks.lock().await.len()
    }
}

fn per_instance(spec: &ProcessSpec) -> bool {
    spec.is_clustered() && !spec.logs.merge
}

fn line_format(id: &InstanceId, spec: &ProcessSpec) -> Result<LineFormat> {
    let timestamp = match spec.logs.timestamp_format {
        Some(ref format) => Some(TimestampFormat::parse(format)?),
        None => None,
    };
    let tag = (spec.is_clustered() && spec.logs.merge).then(|| id.to_string());
    Ok(LineFormat { timestamp, tag })
}

/// Log files for an app, suffixed with the ordinal for per-instance sinks
pub fn sink_paths(spec: &ProcessSpec, ordinal: Option<u32>) -> (PathBuf, PathBuf) {
    match ordinal {
        Some(n) => (
            with_ordinal(&spec.logs.stdout, n),
            with_ordinal(&spec.logs.stderr, n),
        ),
        None => (spec.logs.stdout.clone(), spec.logs.stderr.clone()),
    }
}

/// `app-out.log` becomes `app-out-2.log`; device files are left alone
fn with_ordinal(path: &Path, ordinal: u32) -> PathBuf {
    if path.starts_with("/dev") {
        return path.to_path_buf();
    }

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let file_name = match path.extension() {
        Some(ext) => format!("{}-{}.{}", stem, ordinal, ext.to_string_lossy()),
        None => format!("{}-{}", stem, ordinal),
    };
    path.with_file_name(file_name)
}

async fn pump<R>(
    id: InstanceId,
    reader: R,
    sink: SharedSink,
    stream: OutputStream,
    format: LineFormat,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let rendered = format.render(&line);
                if let Err(e) = sink.lock().await.write(stream, &rendered).await {
                    tracing::warn!(instance = %id, error = %e, "Dropping log line");
                }
            }
            Err(e) => {
                tracing::debug!(instance = %id, error = %e, "Output pipe closed with error");
                break;
            }
        }
    }

    if let Err(e) = sink.lock().await.flush().await {
        tracing::debug!(instance = %id, error = %e, "Final log flush failed");
    }
}
