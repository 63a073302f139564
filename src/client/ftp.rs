use super::{join_remote, CommandReply, Connector, FtpSession, RemoteFile, ServerEndpoint, TransferMode};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{Local, NaiveDateTime, TimeZone};
use std::io::{Read, Write};
use std::net::ToSocketAddrs;
use std::time::Duration;
use suppaftp::types::{FileType, Response};
use suppaftp::{FtpError, FtpStream, Mode};
use tracing::debug;

/// Opens blocking suppaftp streams on the blocking thread pool.
pub struct SuppaFtpConnector {
    connect_timeout: Duration,
}

impl SuppaFtpConnector {
    pub const fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for SuppaFtpConnector {
    async fn connect(&self, endpoint: &ServerEndpoint) -> Result<Box<dyn FtpSession>> {
        if endpoint.secure {
            bail!("FTPS is not available: this build has no TLS backend for suppaftp");
        }
        let host = endpoint.host.clone();
        let port = endpoint.port;
        let username = endpoint.username.clone();
        let password = endpoint.password.clone();
        let timeout = self.connect_timeout;

        let stream = tokio::task::spawn_blocking(move || {
            let addr = (host.as_str(), port)
                .to_socket_addrs()
                .with_context(|| format!("cannot resolve {}:{}", host, port))?
                .next()
                .ok_or_else(|| anyhow!("no address for {}:{}", host, port))?;
            let mut ftp = FtpStream::connect_timeout(addr, timeout)?;
            ftp.login(&username, &password)?;
            ftp.transfer_type(FileType::Binary)?;
            Ok::<_, anyhow::Error>(ftp)
        })
        .await??;

        debug!(server = %endpoint.server_key(), "FTP control connection established");
        Ok(Box::new(SuppaFtpSession::new(stream)))
    }
}

/// A persistent suppaftp control connection. Each call moves the stream onto
/// a blocking worker and puts it back afterwards.
pub struct SuppaFtpSession {
    stream: Option<FtpStream>,
}

impl SuppaFtpSession {
    pub const fn new(stream: FtpStream) -> Self {
        Self {
            stream: Some(stream),
        }
    }

    async fn with_stream<T, F>(&mut self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut FtpStream) -> Result<T> + Send + 'static,
    {
        let mut stream = self
            .stream
            .take()
            .ok_or_else(|| anyhow!("FTP session is closed"))?;
        let (stream, result) = tokio::task::spawn_blocking(move || {
            let result = op(&mut stream);
            (stream, result)
        })
        .await?;
        self.stream = Some(stream);
        result
    }

    fn parse_list_line(line: &str) -> Option<RemoteFile> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 9 {
            return None;
        }

        let is_dir = parts[0].starts_with('d');
        let size = parts[4].parse::<u64>().unwrap_or(0);
        let name = parts[8..].join(" ");

        Some(RemoteFile {
            name: name.clone(),
            path: name,
            size,
            modified: None,
            is_dir,
        })
    }

    /// Parses an MLSD line: `type=file;size=12;modify=20240101120000; name`.
    fn parse_mlsd_line(line: &str) -> Option<RemoteFile> {
        let (facts, name) = line.split_once(' ')?;
        let name = name.trim();
        if name.is_empty() || name == "." || name == ".." {
            return None;
        }

        let mut file = RemoteFile {
            name: name.to_string(),
            path: name.to_string(),
            size: 0,
            modified: None,
            is_dir: false,
        };
        for fact in facts.split(';').filter(|f| !f.is_empty()) {
            let Some((key, value)) = fact.split_once('=') else {
                continue;
            };
            match key.to_ascii_lowercase().as_str() {
                "type" => {
                    let value = value.to_ascii_lowercase();
                    if value == "cdir" || value == "pdir" {
                        return None;
                    }
                    file.is_dir = value == "dir";
                }
                "size" => file.size = value.parse().unwrap_or(0),
                "modify" => {
                    let stamp = value.split('.').next().unwrap_or(value);
                    file.modified = NaiveDateTime::parse_from_str(stamp, "%Y%m%d%H%M%S")
                        .ok()
                        .map(|naive| Local.from_utc_datetime(&naive));
                }
                _ => {}
            }
        }
        Some(file)
    }
}

fn reply_from(result: std::result::Result<Response, FtpError>) -> Result<CommandReply> {
    match result {
        Ok(response) | Err(FtpError::UnexpectedResponse(response)) => Ok(CommandReply {
            code: response.status.code(),
            message: String::from_utf8_lossy(&response.body).trim().to_string(),
        }),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl FtpSession for SuppaFtpSession {
    async fn send_command(&mut self, command: &str) -> Result<CommandReply> {
        let command = command.to_string();
        // No expected codes: every reply comes back as data, classification is the caller's.
        self.with_stream(move |ftp| reply_from(ftp.custom_command(command, &[])))
            .await
    }

    async fn list(&mut self, path: &str) -> Result<Vec<RemoteFile>> {
        let path = path.to_string();
        self.with_stream(move |ftp| {
            let lines = ftp.list(Some(path.as_str()))?;
            Ok(lines
                .iter()
                .filter_map(|line| Self::parse_list_line(line))
                .map(|mut file| {
                    file.path = join_remote(&path, &file.name);
                    file
                })
                .collect())
        })
        .await
    }

    async fn machine_list(&mut self, path: &str) -> Result<Vec<RemoteFile>> {
        let path = path.to_string();
        self.with_stream(move |ftp| {
            let lines = ftp.mlsd(Some(path.as_str()))?;
            Ok(lines
                .iter()
                .filter_map(|line| Self::parse_mlsd_line(line))
                .map(|mut file| {
                    file.path = join_remote(&path, &file.name);
                    file
                })
                .collect())
        })
        .await
    }

    async fn upload_from(
        &mut self,
        mut source: Box<dyn Read + Send>,
        remote_path: &str,
        append: bool,
    ) -> Result<u64> {
        let remote_path = remote_path.to_string();
        self.with_stream(move |ftp| {
            let written = if append {
                ftp.append_file(&remote_path, &mut source)?
            } else {
                ftp.put_file(&remote_path, &mut source)?
            };
            Ok(written)
        })
        .await
    }

    async fn download_to(
        &mut self,
        mut sink: Box<dyn Write + Send>,
        remote_path: &str,
        offset: u64,
    ) -> Result<u64> {
        let remote_path = remote_path.to_string();
        self.with_stream(move |ftp| {
            if offset > 0 {
                let offset = usize::try_from(offset).context("resume offset too large")?;
                ftp.resume_transfer(offset)?;
            }
            let mut data = ftp.retr_as_stream(&remote_path)?;
            let copied = std::io::copy(&mut data, &mut sink);
            let finalized = ftp.finalize_retr_stream(data);
            let copied = copied?;
            finalized?;
            sink.flush()?;
            Ok(copied)
        })
        .await
    }

    async fn remove(&mut self, path: &str) -> Result<()> {
        let path = path.to_string();
        self.with_stream(move |ftp| Ok(ftp.rm(&path)?)).await
    }

    async fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        let from = from.to_string();
        let to = to.to_string();
        self.with_stream(move |ftp| Ok(ftp.rename(&from, &to)?)).await
    }

    async fn make_directory(&mut self, path: &str) -> Result<()> {
        let path = path.to_string();
        self.with_stream(move |ftp| Ok(ftp.mkdir(&path)?)).await
    }

    async fn set_transfer_mode(&mut self, mode: TransferMode) -> Result<()> {
        let ftp = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow!("FTP session is closed"))?;
        ftp.set_mode(match mode {
            TransferMode::Passive => Mode::Passive,
            TransferMode::Active => Mode::Active,
        });
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.stream.is_none() {
            return Ok(());
        }
        self.with_stream(|ftp| Ok(ftp.quit()?)).await?;
        self.stream = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list_line_directory() {
        let line = "drwxr-xr-x 2 user group 4096 Nov 15 10:30 Documents";
        let result = SuppaFtpSession::parse_list_line(line);

        assert!(result.is_some());
        let entry = result.unwrap();
        assert_eq!(entry.name, "Documents");
        assert!(entry.is_dir);
        assert_eq!(entry.size, 4096);
    }

    #[test]
    fn test_parse_list_line_with_spaces() {
        let line = "-rw-r--r-- 1 user group 1024 Nov 15 10:30 my file name.txt";
        let entry = SuppaFtpSession::parse_list_line(line).unwrap();
        assert_eq!(entry.name, "my file name.txt");
        assert!(!entry.is_dir);
        assert_eq!(entry.size, 1024);
    }

    #[test]
    fn test_parse_list_line_invalid() {
        assert!(SuppaFtpSession::parse_list_line("total 12").is_none());
    }

    #[test]
    fn test_parse_mlsd_file() {
        let line = "type=file;size=12345;modify=20240315103000; report.pdf";
        let entry = SuppaFtpSession::parse_mlsd_line(line).unwrap();
        assert_eq!(entry.name, "report.pdf");
        assert_eq!(entry.size, 12345);
        assert!(!entry.is_dir);
        assert!(entry.modified.is_some());
    }

    #[test]
    fn test_parse_mlsd_skips_current_and_parent() {
        assert!(SuppaFtpSession::parse_mlsd_line("type=cdir;modify=20240315103000; /pub").is_none());
        assert!(SuppaFtpSession::parse_mlsd_line("type=pdir; ..").is_none());
        let dir = SuppaFtpSession::parse_mlsd_line("type=dir;modify=20240315103000.123; sub dir").unwrap();
        assert!(dir.is_dir);
        assert_eq!(dir.name, "sub dir");
    }

    #[tokio::test]
    async fn test_connector_rejects_secure_endpoint() {
        let connector = SuppaFtpConnector::new(Duration::from_secs(1));
        let mut endpoint = ServerEndpoint::new("127.0.0.1", 990, "user");
        endpoint.secure = true;

        let result = connector.connect(&endpoint).await;
        assert!(result.is_err());
    }
}
