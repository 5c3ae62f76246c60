//! Optional file log sink.
//!
//! `env_logger` formats records as usual but writes them into a channel; a
//! pingora background service drains the channel into the configured file so
//! request handling never blocks on disk I/O.

use std::{
    io::{self, Write},
    path::Path,
};

use async_trait::async_trait;
use env_logger::Builder;
use log::LevelFilter;
use pingora::{
    server::{ListenFds, ShutdownWatch},
    services::Service,
};
use tokio::{
    fs::{create_dir_all, File, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
};

use crate::config;

struct ChannelWriter {
    sender: UnboundedSender<Vec<u8>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sender
            .send(buf.to_vec())
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct Logger {
    sender: UnboundedSender<Vec<u8>>,
    receiver: UnboundedReceiver<Vec<u8>>,
    config: config::Log,
}

impl Logger {
    pub fn new(config: config::Log) -> Self {
        let (sender, receiver) = unbounded_channel::<Vec<u8>>();
        Self {
            sender,
            receiver,
            config,
        }
    }

    /// Installs the global logger; `RUST_LOG` still overrides the info default.
    pub fn init_env_logger(&self) {
        let writer = ChannelWriter {
            sender: self.sender.clone(),
        };
        Builder::new()
            .filter_level(LevelFilter::Info)
            .parse_env(env_logger::Env::default())
            .target(env_logger::Target::Pipe(Box::new(writer)))
            .init();
    }
}

async fn open_log_file(path: &Path) -> io::Result<BufWriter<File>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        create_dir_all(parent).await?;
    }
    let file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .await?;
    Ok(BufWriter::new(file))
}

#[async_trait]
impl Service for Logger {
    async fn start_service(&mut self, _fds: Option<ListenFds>, mut shutdown: ShutdownWatch) {
        let mut file = match open_log_file(Path::new(&self.config.path)).await {
            Ok(file) => file,
            Err(e) => {
                eprintln!("Failed to open log file {}: {e}", self.config.path);
                return;
            }
        };

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                },

                data = self.receiver.recv() => {
                    match data {
                        Some(data) => {
                            if let Err(e) = file.write_all(&data).await {
                                eprintln!("Failed to write to log file: {e}");
                            }
                            // keep the file current between bursts
                            if self.receiver.is_empty() {
                                let _ = file.flush().await;
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        if let Err(e) = file.flush().await {
            eprintln!("Failed to flush log file: {e}");
        }
    }

    fn name(&self) -> &'static str {
        "log sync"
    }

    fn threads(&self) -> Option<usize> {
        Some(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_log_file_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/nested/simrelay.log");

        let mut file = open_log_file(&path).await.unwrap();
        file.write_all(b"line\n").await.unwrap();
        file.flush().await.unwrap();

        assert_eq!("line\n", std::fs::read_to_string(&path).unwrap());
    }

    #[test]
    fn test_channel_writer_forwards_bytes() {
        let (sender, mut receiver) = unbounded_channel();
        let mut writer = ChannelWriter { sender };
        writer.write_all(b"hello").unwrap();
        assert_eq!(b"hello".to_vec(), receiver.try_recv().unwrap());

        drop(receiver);
        assert!(writer.write(b"lost").is_err());
    }
}
