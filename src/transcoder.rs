use std::io;
use std::process::Stdio;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::time::timeout;

use crate::error::{RelayError, Result};

/// Placeholder in the argument template that is replaced by the push destination.
pub const OUTPUT_PLACEHOLDER: &str = "{output}";

#[derive(Debug, Clone)]
pub struct TranscoderConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Push destination prefix; the channel identifier is appended as the last path segment.
    pub output_base: String,
    /// Upper bound for each wait while stopping.
    pub stop_timeout: Duration,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        #[rustfmt::skip]
        let args = [
            "-i", "pipe:0",
            "-c:v", "libx264",
            "-preset", "ultrafast",
            "-tune", "zerolatency",
            "-profile:v", "baseline",
            "-level", "3.0",
            "-pix_fmt", "yuv420p",
            "-r", "30",
            "-g", "60",
            "-c:a", "aac",
            "-ar", "44100",
            "-b:a", "128k",
            "-b:v", "2500k",
            "-maxrate", "2500k",
            "-bufsize", "5000k",
            "-f", "flv",
            OUTPUT_PLACEHOLDER,
        ];
        TranscoderConfig {
            program: "ffmpeg".to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            output_base: "rtmp://localhost/live".to_string(),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

impl TranscoderConfig {
    pub fn output_for(&self, channel: &str) -> String {
        format!("{}/{}", self.output_base, channel)
    }

    fn command_args(&self, channel: &str) -> Vec<String> {
        let output = self.output_for(channel);
        self.args
            .iter()
            .map(|arg| arg.replace(OUTPUT_PLACEHOLDER, &output))
            .collect()
    }
}

/// One running transcoder subprocess, fed through its stdin.
///
/// A handle is never reused: every `start` creates a new one. After `stop` or
/// `terminate` returns the process has been reaped. Dropping a handle with a
/// live process does not kill it: the registry still knows the pid and kills
/// it once the channel has been marked inactive.
pub struct Transcoder {
    channel: String,
    pid: Option<u32>,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stop_timeout: Duration,
}

impl Transcoder {
    /// Spawns the transcoder for `channel`. Only blocks for the spawn itself.
    pub fn start(config: &TranscoderConfig, channel: &str) -> Result<Self> {
        let mut child = Command::new(&config.program)
            .args(config.command_args(channel))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(RelayError::Spawn)?;

        let Some(stdin) = child.stdin.take() else {
            if let Err(e) = child.start_kill() {
                warn!("killing half-started transcoder failed: {}", e);
            }
            return Err(RelayError::Spawn(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "transcoder stdin was not captured",
            )));
        };
        let pid = child.id();

        info!(
            "transcoder started: channel={} pid={:?} output={}",
            channel,
            pid,
            config.output_for(channel)
        );

        Ok(Transcoder {
            channel: channel.to_string(),
            pid,
            child: Some(child),
            stdin: Some(stdin),
            stop_timeout: config.stop_timeout,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Forwards one frame. Any error means the pipe is gone for good.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            RelayError::Write(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "transcoder input already closed",
            ))
        })?;
        stdin.write_all(bytes).await.map_err(RelayError::Write)
    }

    /// Closes input and waits for a voluntary exit, then escalates to SIGTERM
    /// and finally SIGKILL. Calling it again is a no-op.
    pub async fn stop(&mut self) {
        drop(self.stdin.take());
        let Some(mut child) = self.child.take() else {
            return;
        };

        if self.wait_bounded(&mut child, "end of input").await {
            return;
        }

        if send_terminate(&child) && self.wait_bounded(&mut child, "SIGTERM").await {
            return;
        }

        self.force_kill(&mut child).await;
    }

    /// Abnormal teardown: close input and kill without waiting for a flush.
    pub async fn terminate(&mut self) {
        drop(self.stdin.take());
        if let Some(mut child) = self.child.take() {
            self.force_kill(&mut child).await;
        }
    }

    async fn wait_bounded(&mut self, child: &mut Child, after: &str) -> bool {
        match timeout(self.stop_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                info!(
                    "transcoder exited after {}: channel={} pid={:?} status={}",
                    after, self.channel, self.pid, status
                );
                true
            }
            Ok(Err(e)) => {
                warn!(
                    "waiting on transcoder failed: channel={} pid={:?}: {}",
                    self.channel, self.pid, e
                );
                false
            }
            Err(_) => {
                warn!(
                    "transcoder still running {:?} after {}: channel={} pid={:?}",
                    self.stop_timeout, after, self.channel, self.pid
                );
                false
            }
        }
    }

    async fn force_kill(&mut self, child: &mut Child) {
        match child.kill().await {
            Ok(()) => debug!(
                "transcoder killed: channel={} pid={:?}",
                self.channel, self.pid
            ),
            Err(e) => {
                warn!(
                    "killing transcoder failed: channel={} pid={:?}: {}",
                    self.channel, self.pid, e
                );
                // It may have exited on its own between the checks; reap it.
                if let Ok(Ok(status)) = timeout(self.stop_timeout, child.wait()).await {
                    debug!("transcoder reaped with status {}", status);
                }
            }
        }
    }
}

impl Drop for Transcoder {
    fn drop(&mut self) {
        if self.child.is_some() {
            warn!(
                "transcoder handle dropped while running: channel={} pid={:?}",
                self.channel, self.pid
            );
        }
    }
}

/// SIGKILLs a transcoder known only by pid. Used when its handle is gone.
#[cfg(unix)]
pub fn kill_pid(pid: u32) -> bool {
    // SAFETY: plain syscall; the worst case is signalling an exited pid.
    unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) == 0 }
}

#[cfg(not(unix))]
pub fn kill_pid(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn send_terminate(child: &Child) -> bool {
    let Some(pid) = child.id() else {
        return false;
    };
    // SAFETY: plain syscall on a pid we own and have not reaped yet.
    unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn send_terminate(_child: &Child) -> bool {
    false
}

/// True while `pid` exists and is not a zombie waiting to be reaped.
#[cfg(test)]
pub(crate) fn process_alive(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // The state letter follows the parenthesised command name.
    match stat.rsplit_once(") ") {
        Some((_, rest)) => !matches!(rest.chars().next(), Some('Z' | 'X')),
        None => false,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::path::Path;
    use std::time::Duration;

    use super::TranscoderConfig;

    /// A shell "transcoder" that copies stdin into `<dir>/<channel>`.
    pub fn file_sink(dir: &Path) -> TranscoderConfig {
        TranscoderConfig {
            program: "/bin/sh".to_string(),
            args: vec![
                "-c".to_string(),
                "exec cat > \"$0\"".to_string(),
                super::OUTPUT_PLACEHOLDER.to_string(),
            ],
            output_base: dir.to_string_lossy().into_owned(),
            stop_timeout: Duration::from_secs(2),
        }
    }

    /// Ignores its input and keeps running until killed.
    pub fn sleeper() -> TranscoderConfig {
        TranscoderConfig {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "exec sleep 30".to_string()],
            output_base: String::new(),
            stop_timeout: Duration::from_millis(200),
        }
    }

    /// Like `file_sink`, but every spawn appends its pid to `<dir>/spawns`.
    /// The program is a symlink to the shell; removing `<dir>/transcoder`
    /// makes later spawns fail.
    pub fn counting_sink(dir: &Path) -> TranscoderConfig {
        let program = dir.join("transcoder");
        std::os::unix::fs::symlink("/bin/sh", &program).unwrap();
        TranscoderConfig {
            program: program.to_string_lossy().into_owned(),
            args: vec![
                "-c".to_string(),
                "echo $$ >> \"$(dirname \"$0\")/spawns\"; exec cat > \"$0\"".to_string(),
                super::OUTPUT_PLACEHOLDER.to_string(),
            ],
            output_base: dir.to_string_lossy().into_owned(),
            stop_timeout: Duration::from_secs(2),
        }
    }

    /// Pids recorded by `counting_sink` so far.
    pub fn spawned_pids(dir: &Path) -> Vec<u32> {
        std::fs::read_to_string(dir.join("spawns"))
            .unwrap_or_default()
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect()
    }

    /// Waits until `counting_sink` has recorded `count` spawns.
    pub async fn wait_for_spawns(dir: &Path, count: usize) -> Vec<u32> {
        for _ in 0..100 {
            let pids = spawned_pids(dir);
            if pids.len() >= count {
                return pids;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("expected {count} spawns, saw {:?}", spawned_pids(dir));
    }
}
