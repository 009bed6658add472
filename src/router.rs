//! Packet router collaborator
//!
//! The packet router forwards packets between the virtual interface and the
//! local proxy. It is driven through a narrow API: [`PacketRouter::run`]
//! blocks on a dedicated thread until the cycle's [`RouterShutdown`] is
//! triggered. The router owns (and eventually closes) the descriptor it is
//! given.

use crate::error::{Result, VpnError};
use std::io::{BufRead, BufReader};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, OwnedFd};
use std::process::{Command, Stdio};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

/// Parameters for one routing cycle
#[derive(Debug)]
pub struct RouterParams {
    /// Duplicate of the interface descriptor, consumed by the router
    pub interface_fd: OwnedFd,
    pub mtu: u16,
    /// Gateway and DNS address the router answers on
    pub router_address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub proxy_address: SocketAddrV4,
    pub secondary_proxy_address: SocketAddrV4,
    pub transparent_dns: bool,
}

/// Termination signal for a single routing cycle
#[derive(Debug, Default)]
pub struct RouterShutdown {
    terminated: Mutex<bool>,
    cond: Condvar,
}

impl RouterShutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the router to exit
    pub fn terminate(&self) {
        let mut terminated = self.terminated.lock().unwrap_or_else(PoisonError::into_inner);
        *terminated = true;
        self.cond.notify_all();
    }

    pub fn is_terminated(&self) -> bool {
        *self.terminated.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until terminated
    pub fn wait(&self) {
        let mut terminated = self.terminated.lock().unwrap_or_else(PoisonError::into_inner);
        while !*terminated {
            terminated = self
                .cond
                .wait(terminated)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until terminated or `timeout` elapses; returns whether terminated
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let terminated = self.terminated.lock().unwrap_or_else(PoisonError::into_inner);
        let (terminated, _) = self
            .cond
            .wait_timeout_while(terminated, timeout, |t| !*t)
            .unwrap_or_else(PoisonError::into_inner);
        *terminated
    }
}

/// Packet router driven by the interface manager
pub trait PacketRouter: Send + Sync {
    /// Route packets until `shutdown` is triggered
    fn run(&self, params: RouterParams, shutdown: &RouterShutdown) -> Result<()>;
}

/// Severity of a router log record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterLogLevel {
    Error,
    Warning,
    Notice,
    Info,
    Debug,
}

impl From<RouterLogLevel> for log::Level {
    fn from(level: RouterLogLevel) -> Self {
        match level {
            RouterLogLevel::Error => log::Level::Error,
            RouterLogLevel::Warning => log::Level::Warn,
            RouterLogLevel::Notice | RouterLogLevel::Info => log::Level::Info,
            RouterLogLevel::Debug => log::Level::Debug,
        }
    }
}

/// Forward a structured router record to the `log` facade
pub fn log_record(level: RouterLogLevel, channel: &str, message: &str) {
    log::log!(target: channel, level.into(), "{message}");
}

/// Router that runs an external packet-router executable
///
/// The executable receives the interface descriptor number on its command
/// line and inherits the descriptor itself.
#[derive(Debug, Clone)]
pub struct CommandRouter {
    program: String,
    extra_args: Vec<String>,
    poll_interval: Duration,
}

impl CommandRouter {
    pub fn new(program: impl Into<String>, extra_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            extra_args,
            poll_interval: Duration::from_millis(200),
        }
    }

    /// Command line for one cycle, excluding the program name
    pub fn arguments(&self, params: &RouterParams) -> Vec<String> {
        let mut args = vec![
            "--tunfd".to_string(),
            params.interface_fd.as_raw_fd().to_string(),
            "--tunmtu".to_string(),
            params.mtu.to_string(),
            "--netif-ipaddr".to_string(),
            params.router_address.to_string(),
            "--netif-netmask".to_string(),
            params.netmask.to_string(),
            "--socks-server-addr".to_string(),
            params.proxy_address.to_string(),
            "--udpgw-remote-server-addr".to_string(),
            params.secondary_proxy_address.to_string(),
        ];
        if params.transparent_dns {
            args.push("--udpgw-transparent-dns".to_string());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }

    fn command(&self, params: &RouterParams) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(self.arguments(params))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;

            let fd = params.interface_fd.as_raw_fd();
            // SAFETY: only async-signal-safe fcntl calls run in the child
            unsafe {
                command.pre_exec(move || {
                    let flags = libc::fcntl(fd, libc::F_GETFD);
                    if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        command
    }
}

impl PacketRouter for CommandRouter {
    fn run(&self, params: RouterParams, shutdown: &RouterShutdown) -> Result<()> {
        if shutdown.is_terminated() {
            return Ok(());
        }

        let channel = "router";
        let mut child = self.command(&params).spawn().map_err(|e| {
            VpnError::Router(format!("Failed to launch '{}': {e}", self.program))
        })?;
        log_record(
            RouterLogLevel::Notice,
            channel,
            &format!("started '{}' (pid {})", self.program, child.id()),
        );

        let stderr_reader = child.stderr.take().map(|stderr| {
            std::thread::spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(std::io::Result::ok) {
                    log_record(RouterLogLevel::Info, "router", &line);
                }
            })
        });

        let result = loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    break Err(VpnError::Router(format!(
                        "'{}' exited unexpectedly: {status}",
                        self.program
                    )));
                }
                Ok(None) => {}
                Err(e) => break Err(VpnError::Router(format!("Failed to poll router: {e}"))),
            }

            if shutdown.wait_timeout(self.poll_interval) {
                if let Err(e) = child.kill() {
                    log_record(RouterLogLevel::Warning, channel, &format!("kill failed: {e}"));
                }
                let _ = child.wait();
                log_record(RouterLogLevel::Notice, channel, "terminated");
                break Ok(());
            }
        };

        if let Some(reader) = stderr_reader {
            let _ = reader.join();
        }

        // The descriptor copy handed to this cycle closes here
        drop(params);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    fn params() -> RouterParams {
        let file = tempfile::tempfile().unwrap();
        RouterParams {
            interface_fd: OwnedFd::from(file),
            mtu: 1500,
            router_address: Ipv4Addr::new(10, 0, 0, 2),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            proxy_address: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1080),
            secondary_proxy_address: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 7300),
            transparent_dns: true,
        }
    }

    #[test]
    fn test_shutdown_wakes_waiter() {
        let shutdown = Arc::new(RouterShutdown::new());
        let waiter = {
            let shutdown = Arc::clone(&shutdown);
            std::thread::spawn(move || shutdown.wait())
        };
        assert!(!shutdown.is_terminated());
        shutdown.terminate();
        waiter.join().unwrap();
        assert!(shutdown.is_terminated());
    }

    #[test]
    fn test_wait_timeout_expires() {
        let shutdown = RouterShutdown::new();
        let started = Instant::now();
        assert!(!shutdown.wait_timeout(Duration::from_millis(20)));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_command_arguments() {
        let router = CommandRouter::new("tun2socks", vec!["--loglevel".into(), "3".into()]);
        let params = params();
        let args = router.arguments(&params);
        let fd = params.interface_fd.as_raw_fd().to_string();

        assert_eq!(args[0..2], ["--tunfd".to_string(), fd]);
        assert!(args.windows(2).any(|w| w == ["--netif-ipaddr", "10.0.0.2"]));
        assert!(args.windows(2).any(|w| w == ["--socks-server-addr", "127.0.0.1:1080"]));
        assert!(args
            .windows(2)
            .any(|w| w == ["--udpgw-remote-server-addr", "127.0.0.1:7300"]));
        assert!(args.contains(&"--udpgw-transparent-dns".to_string()));
        assert_eq!(args[args.len() - 2..], ["--loglevel".to_string(), "3".to_string()]);
    }

    #[test]
    fn test_missing_program_fails() {
        let router = CommandRouter::new("/nonexistent/packet-router", Vec::new());
        let shutdown = RouterShutdown::new();
        let result = router.run(params(), &shutdown);
        assert!(matches!(result, Err(VpnError::Router(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_unexpected_exit_is_reported() {
        // `true` ignores its arguments and exits at once
        let router = CommandRouter::new("true", Vec::new());
        let shutdown = RouterShutdown::new();
        let result = router.run(params(), &shutdown);
        assert!(matches!(result, Err(VpnError::Router(msg)) if msg.contains("exited")));
    }

    #[cfg(unix)]
    #[test]
    fn test_command_router_terminates_child() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-router");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut router = CommandRouter::new(script.to_string_lossy(), Vec::new());
        router.poll_interval = Duration::from_millis(10);
        let shutdown = Arc::new(RouterShutdown::new());

        let handle = {
            let shutdown = Arc::clone(&shutdown);
            std::thread::spawn(move || router.run(params(), &shutdown))
        };

        std::thread::sleep(Duration::from_millis(100));
        shutdown.terminate();
        let result = handle.join().unwrap();
        assert!(result.is_ok(), "router did not stop cleanly: {result:?}");
    }

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(log::Level::from(RouterLogLevel::Warning), log::Level::Warn);
        assert_eq!(log::Level::from(RouterLogLevel::Notice), log::Level::Info);
        log_record(RouterLogLevel::Debug, "router", "probe");
    }
}
