// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Launching node processes and signalling them by pid.

use std::{
    ffi::OsString,
    fmt, fs,
    fs::OpenOptions,
    io,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
};

use tracing::debug;

/// Pid file the launcher is told to write, relative to the node directory.
pub const PID_FILE: &str = "bin/cassandra.pid";

/// Launcher output, relative to the node directory.
pub const LAUNCHER_LOG: &str = "logs/launcher.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeSignal {
    Terminate,
    Kill,
}

impl fmt::Display for NodeSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                NodeSignal::Terminate => "SIGTERM",
                NodeSignal::Kill => "SIGKILL",
            }
        )
    }
}

/// A handle to a launched node process.
pub trait NodeProcess {
    fn id(&self) -> u32;

    /// Forcibly stop the process and reap it.
    fn destroy(&mut self) -> io::Result<()>;
}

impl NodeProcess for Child {
    fn id(&self) -> u32 {
        Child::id(self)
    }

    fn destroy(&mut self) -> io::Result<()> {
        match self.try_wait()? {
            Some(_) => Ok(()),
            None => {
                self.kill()?;
                self.wait().map(|_| ())
            }
        }
    }
}

/// The command that starts one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub working_dir: PathBuf,
    /// Receives the launcher's stdout and stderr.
    pub log_file: PathBuf,
}

impl LaunchCommand {
    /// `bin/cassandra -p bin/cassandra.pid` on Unix, `bin/cassandra.bat` on Windows.
    pub fn for_node(node_dir: &Path) -> Self {
        let (program, args) = if cfg!(windows) {
            (node_dir.join("bin").join("cassandra.bat"), Vec::new())
        } else {
            (
                node_dir.join("bin").join("cassandra"),
                vec![OsString::from("-p"), pid_file(node_dir).into_os_string()],
            )
        };

        LaunchCommand {
            program,
            args,
            working_dir: node_dir.to_path_buf(),
            log_file: node_dir.join(LAUNCHER_LOG),
        }
    }
}

pub fn pid_file(node_dir: &Path) -> PathBuf {
    node_dir.join(PID_FILE)
}

/// Process and signal access for the cluster manager.
pub trait ProcessControl {
    fn start(&self, command: &LaunchCommand) -> io::Result<Box<dyn NodeProcess>>;

    fn send_signal(&self, pid: u32, signal: NodeSignal) -> io::Result<()>;

    fn read_pid_file(&self, path: &Path) -> io::Result<u32> {
        let contents = fs::read_to_string(path)?;
        contents.trim().parse::<u32>().map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad pid '{}' in '{}': {e}", contents.trim(), path.display()),
            )
        })
    }
}

/// Spawns real processes and delivers real signals.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsProcessControl;

impl ProcessControl for OsProcessControl {
    fn start(&self, command: &LaunchCommand) -> io::Result<Box<dyn NodeProcess>> {
        if let Some(dir) = command.log_file.parent() {
            fs::create_dir_all(dir)?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&command.log_file)?;

        debug!(
            "launching '{}' with args {:?}",
            command.program.display(),
            command.args
        );
        let child = Command::new(&command.program)
            .args(&command.args)
            .current_dir(&command.working_dir)
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log)
            .spawn()?;
        Ok(Box::new(child))
    }

    #[cfg(unix)]
    fn send_signal(&self, pid: u32, signal: NodeSignal) -> io::Result<()> {
        use nix::{
            sys::signal::{kill, Signal},
            unistd::Pid,
        };

        let pid = i32::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        let signal = match signal {
            NodeSignal::Terminate => Signal::SIGTERM,
            NodeSignal::Kill => Signal::SIGKILL,
        };
        kill(Pid::from_raw(pid), signal).map_err(io::Error::from)
    }

    #[cfg(not(unix))]
    fn send_signal(&self, pid: u32, signal: NodeSignal) -> io::Result<()> {
        let mut taskkill = Command::new("taskkill");
        taskkill.args(["/PID", &pid.to_string()]);
        if signal == NodeSignal::Kill {
            taskkill.arg("/F");
        }
        let status = taskkill.status()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!("taskkill exited with {status}")))
        }
    }
}
