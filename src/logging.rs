use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use tracing_subscriber::fmt::MakeWriter;

/// Mirrors every log line into a broadcast channel so the live `/api/logs`
/// feed sees exactly what lands on stdout.
#[derive(Clone)]
pub(crate) struct LogFeedMakeWriter {
    pub sender: tokio::sync::broadcast::Sender<String>,
}

impl<'a> MakeWriter<'a> for LogFeedMakeWriter {
    type Writer = LogFeedWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogFeedWriter {
            sender: self.sender.clone(),
        }
    }
}

pub(crate) struct LogFeedWriter {
    sender: tokio::sync::broadcast::Sender<String>,
}

impl std::io::Write for LogFeedWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let msg = String::from_utf8_lossy(buf).to_string();
        let _ = self.sender.send(msg); // Ignored if no receivers
        std::io::stdout().write(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stdout().flush()
    }
}

pub(crate) fn init(log_tx: tokio::sync::broadcast::Sender<String>) {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_writer(LogFeedMakeWriter { sender: log_tx })
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
}
