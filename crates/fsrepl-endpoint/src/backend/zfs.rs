//! [`Backend`] driving the `zfs` command-line tool.
//!
//! Every child is spawned with kill-on-drop, so an abandoned call does not
//! leave a `zfs` process behind.

use std::path::PathBuf;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::task::{ready, Context, Poll};

use async_trait::async_trait;
use fsrepl_transport::DataStream;
use std::future::Future;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::process::{ChildStdout, Command};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::{
    is_placeholder_value, placeholder_property_value, Backend, BackendError, PlaceholderState,
    ReceiveOptions, PLACEHOLDER_PROPERTY, REPLICATED_PROPERTY,
};
use crate::dataset::{DatasetPath, FilesystemVersion, VersionKind};
use crate::filter::{PathFilter, VersionFilter};

const NOT_FOUND_MARKER: &str = "dataset does not exist";

/// Engine backed by the `zfs` binary.
#[derive(Debug, Clone)]
pub struct ZfsCli {
    binary: PathBuf,
}

impl Default for ZfsCli {
    fn default() -> Self {
        Self::new("zfs")
    }
}

impl ZfsCli {
    /// Use `binary` as the `zfs` executable.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args).kill_on_drop(true);
        cmd
    }

    fn describe(&self, args: &[String]) -> String {
        format!("{} {}", self.binary.display(), args.join(" "))
    }

    /// Run to completion and return stdout.
    async fn run(&self, args: Vec<String>) -> Result<String, BackendError> {
        debug!(cmd = %self.describe(&args), "running zfs");
        let output = self
            .command(&args)
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            return Err(classify_failure(
                self.describe(&args),
                output.status,
                &String::from_utf8_lossy(&output.stderr),
            ));
        }
        String::from_utf8(output.stdout)
            .map_err(|e| BackendError::Parse(format!("non-UTF-8 output: {}", e)))
    }

    async fn get_property(&self, target: String, property: &str) -> Result<String, BackendError> {
        let out = self
            .run(args(["get", "-H", "-p", "-o", "value", property, &target]))
            .await?;
        Ok(out.trim_end_matches('\n').to_string())
    }
}

fn args<const N: usize>(a: [&str; N]) -> Vec<String> {
    a.iter().map(|s| s.to_string()).collect()
}

fn send_args(
    fs: &DatasetPath,
    from: Option<&FilesystemVersion>,
    to: &FilesystemVersion,
    dry_run: bool,
) -> Result<Vec<String>, BackendError> {
    if to.kind != VersionKind::Snapshot {
        return Err(BackendError::Other(format!(
            "send target {} must be a snapshot",
            to.full_name(fs)
        )));
    }
    let mut a = args(["send"]);
    if dry_run {
        a.extend(args(["-n", "-P"]));
    }
    if let Some(from) = from {
        a.push("-i".to_string());
        a.push(from.full_name(fs));
    }
    a.push(to.full_name(fs));
    Ok(a)
}

/// Map a failed invocation to a [`BackendError`].
fn classify_failure(cmd: String, status: ExitStatus, stderr: &str) -> BackendError {
    let stderr = stderr.trim();
    if stderr.contains(NOT_FOUND_MARKER) {
        // zfs quotes the offending name: cannot open 'pool/x': dataset does not exist
        let path = stderr
            .split('\'')
            .nth(1)
            .map(str::to_string)
            .unwrap_or_else(|| cmd.rsplit(' ').next().unwrap_or_default().to_string());
        return BackendError::DatasetNotFound { path };
    }
    BackendError::Command {
        cmd,
        status: status.to_string(),
        stderr: stderr.to_string(),
    }
}

fn parse_filesystem_list(out: &str) -> Vec<DatasetPath> {
    out.lines()
        .filter(|l| !l.is_empty())
        .filter_map(|l| match DatasetPath::parse(l) {
            Ok(p) => Some(p),
            Err(e) => {
                warn!(name = l, error = %e, "skipping dataset with unsupported name");
                None
            }
        })
        .collect()
}

fn parse_version_list(fs: &DatasetPath, out: &str) -> Result<Vec<FilesystemVersion>, BackendError> {
    let prefix = fs.to_string();
    let mut versions = Vec::new();
    for line in out.lines().filter(|l| !l.is_empty()) {
        let fields: Vec<&str> = line.split('\t').collect();
        let [name, guid, txg] = fields.as_slice() else {
            return Err(BackendError::Parse(format!(
                "expected 3 fields, got {:?}",
                line
            )));
        };
        let rel = name.strip_prefix(prefix.as_str()).ok_or_else(|| {
            BackendError::Parse(format!("{:?} does not belong to {}", name, prefix))
        })?;
        let kind = match rel.chars().next() {
            Some('@') => VersionKind::Snapshot,
            Some('#') => VersionKind::Bookmark,
            _ => {
                return Err(BackendError::Parse(format!(
                    "{:?} is neither a snapshot nor a bookmark",
                    name
                )))
            }
        };
        let num = |s: &str| {
            s.parse::<u64>()
                .map_err(|e| BackendError::Parse(format!("{:?} in {:?}: {}", s, line, e)))
        };
        versions.push(FilesystemVersion {
            kind,
            name: rel[1..].to_string(),
            guid: num(guid)?,
            create_txg: num(txg)?,
        });
    }
    versions.sort_by_key(|v| v.create_txg);
    Ok(versions)
}

/// Extract the total from `zfs send -n -P` output.
fn parse_dry_run_size(out: &str) -> Result<u64, BackendError> {
    out.lines()
        .filter_map(|l| {
            let mut fields = l.split_whitespace();
            match (fields.next(), fields.next()) {
                (Some("size"), Some(n)) => Some(n),
                _ => None,
            }
        })
        .last()
        .ok_or_else(|| BackendError::Parse("dry run printed no size line".to_string()))?
        .parse::<u64>()
        .map_err(|e| BackendError::Parse(format!("dry run size: {}", e)))
}

/// Stdout of a running `zfs send`. At end of file it waits for the child's
/// exit status and turns a failure into a read error, so a truncated stream
/// is never mistaken for a complete one.
struct SendStream {
    stdout: ChildStdout,
    exit: Option<oneshot::Receiver<Result<(), String>>>,
}

impl AsyncRead for SendStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        ready!(Pin::new(&mut self.stdout).poll_read(cx, buf))?;
        if buf.filled().len() > before {
            return Poll::Ready(Ok(()));
        }
        if let Some(exit) = self.exit.as_mut() {
            let result = ready!(Pin::new(exit).poll(cx));
            self.exit = None;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(msg)) => return Poll::Ready(Err(std::io::Error::other(msg))),
                Err(_) => {
                    return Poll::Ready(Err(std::io::Error::other(
                        "zfs send exit status lost",
                    )))
                }
            }
        }
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl Backend for ZfsCli {
    async fn list_filesystems(
        &self,
        filter: &dyn PathFilter,
    ) -> Result<Vec<DatasetPath>, BackendError> {
        let out = self
            .run(args(["list", "-H", "-o", "name", "-t", "filesystem,volume"]))
            .await?;
        let mut visible = Vec::new();
        for fs in parse_filesystem_list(&out) {
            if filter.filter(&fs)? {
                visible.push(fs);
            }
        }
        Ok(visible)
    }

    async fn list_versions(
        &self,
        fs: &DatasetPath,
        filter: &dyn VersionFilter,
    ) -> Result<Vec<FilesystemVersion>, BackendError> {
        let name = fs.to_string();
        let out = self
            .run(args([
                "list",
                "-H",
                "-p",
                "-o",
                "name,guid,createtxg",
                "-t",
                "snapshot,bookmark",
                "-r",
                "-d",
                "1",
                &name,
            ]))
            .await?;
        let mut visible = Vec::new();
        for v in parse_version_list(fs, &out)? {
            if filter.filter(v.kind, &v.name)? {
                visible.push(v);
            }
        }
        Ok(visible)
    }

    async fn send_dry_run(
        &self,
        fs: &DatasetPath,
        from: Option<&FilesystemVersion>,
        to: &FilesystemVersion,
    ) -> Result<u64, BackendError> {
        let out = self.run(send_args(fs, from, to, true)?).await?;
        parse_dry_run_size(&out)
    }

    async fn send(
        &self,
        fs: &DatasetPath,
        from: Option<&FilesystemVersion>,
        to: &FilesystemVersion,
    ) -> Result<DataStream, BackendError> {
        let a = send_args(fs, from, to, false)?;
        let desc = self.describe(&a);
        debug!(cmd = %desc, "starting zfs send");
        let mut child = self
            .command(&a)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Other("zfs send stdout not captured".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| BackendError::Other("zfs send stderr not captured".to_string()))?;
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let mut msg = String::new();
            let _ = stderr.read_to_string(&mut msg).await;
            let result = match child.wait().await {
                Ok(status) if status.success() => Ok(()),
                Ok(status) => Err(classify_failure(desc, status, &msg).to_string()),
                Err(e) => Err(e.to_string()),
            };
            let _ = tx.send(result);
        });
        Ok(Box::new(SendStream {
            stdout,
            exit: Some(rx),
        }))
    }

    async fn receive(
        &self,
        fs: &DatasetPath,
        mut stream: DataStream,
        opts: ReceiveOptions,
    ) -> Result<(), BackendError> {
        let mut a = args(["recv"]);
        if opts.force {
            a.push("-F".to_string());
        }
        a.push(fs.to_string());
        let desc = self.describe(&a);
        debug!(cmd = %desc, "starting zfs recv");
        let mut child = self
            .command(&a)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| BackendError::Other("zfs recv stdin not captured".to_string()))?;
        let copy = async move {
            let copied = tokio::io::copy(&mut stream, &mut stdin).await;
            drop(stdin);
            copied
        };
        let (copied, output) = tokio::join!(copy, child.wait_with_output());
        let output = output?;
        if !output.status.success() {
            return Err(classify_failure(
                desc,
                output.status,
                &String::from_utf8_lossy(&output.stderr),
            ));
        }
        let bytes = copied?;
        debug!(filesystem = %fs, bytes, "zfs recv finished");
        Ok(())
    }

    async fn destroy_snapshot(&self, fs: &DatasetPath, snapshot: &str) -> Result<(), BackendError> {
        self.run(args(["destroy", &format!("{}@{}", fs, snapshot)]))
            .await?;
        Ok(())
    }

    async fn get_replicated(&self, fs: &DatasetPath, snapshot: &str) -> Result<bool, BackendError> {
        let value = self
            .get_property(format!("{}@{}", fs, snapshot), REPLICATED_PROPERTY)
            .await?;
        Ok(value == "yes")
    }

    async fn set_replicated(
        &self,
        fs: &DatasetPath,
        snapshot: &str,
        replicated: bool,
    ) -> Result<(), BackendError> {
        let value = if replicated { "yes" } else { "no" };
        self.run(args([
            "set",
            &format!("{}={}", REPLICATED_PROPERTY, value),
            &format!("{}@{}", fs, snapshot),
        ]))
        .await?;
        Ok(())
    }

    async fn placeholder_state(&self, fs: &DatasetPath) -> Result<PlaceholderState, BackendError> {
        match self.get_property(fs.to_string(), PLACEHOLDER_PROPERTY).await {
            Ok(value) if is_placeholder_value(fs, &value) => Ok(PlaceholderState::Placeholder),
            Ok(_) => Ok(PlaceholderState::Regular),
            Err(BackendError::DatasetNotFound { .. }) => Ok(PlaceholderState::Missing),
            Err(e) => Err(e),
        }
    }

    async fn create_placeholder(&self, fs: &DatasetPath) -> Result<(), BackendError> {
        let marker = format!("{}={}", PLACEHOLDER_PROPERTY, placeholder_property_value(fs));
        self.run(args([
            "create",
            "-o",
            &marker,
            "-o",
            "mountpoint=none",
            &fs.to_string(),
        ]))
        .await?;
        Ok(())
    }
}
