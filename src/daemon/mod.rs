//! Profile daemon - serves settings queries to local clients
//!
//! One thread, one `poll(2)` set: the shutdown pipe, the listening socket and
//! every client connection. Requests are handled strictly one at a time, so
//! the daemon state needs no locking.

mod dispatch;

pub use dispatch::handle_request;

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::collections::BTreeMap;
use std::io::{ErrorKind, Read};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use tracing::{debug, error, info, warn};

use crate::config::{DaemonState, ServicePaths};
use crate::constants::wire;
use crate::ipc::{write_message, FrameDecoder, ProfileServer};

/// Wakes the event loop so it can flush state and exit
pub struct ShutdownHandle {
    tx: UnixStream,
}

impl ShutdownHandle {
    #[cfg(test)]
    pub fn trigger(&self) -> Result<()> {
        use std::io::Write;
        match (&self.tx).write(&[1]) {
            Ok(_) => Ok(()),
            // Pipe already full means a wakeup is pending
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e).context("Failed to signal shutdown"),
        }
    }

    /// Route SIGINT and SIGTERM into the shutdown pipe
    pub fn register_signals(&self) -> Result<()> {
        use signal_hook::consts::{SIGINT, SIGTERM};
        for signal in [SIGINT, SIGTERM] {
            let tx = self.tx.try_clone().context("Failed to clone shutdown pipe")?;
            signal_hook::low_level::pipe::register(signal, tx)
                .context(format!("Failed to register handler for signal {signal}"))?;
        }
        debug!("Signal handlers installed");
        Ok(())
    }
}

/// One client connection and its partially received frame
struct Connection {
    stream: UnixStream,
    decoder: FrameDecoder,
}

/// What `poll` reported for one pass of the loop
struct Readiness {
    shutdown: bool,
    listener: bool,
    clients: Vec<(RawFd, PollFlags)>,
}

pub struct ProfileDaemon {
    state: DaemonState,
    server: ProfileServer,
    shutdown_rx: UnixStream,
    clients: BTreeMap<RawFd, Connection>,
}

impl ProfileDaemon {
    pub fn new(state: DaemonState, server: ProfileServer) -> Result<(Self, ShutdownHandle)> {
        let (tx, rx) = UnixStream::pair().context("Failed to create shutdown pipe")?;
        tx.set_nonblocking(true)
            .context("Failed to make shutdown pipe non-blocking")?;
        let daemon = Self {
            state,
            server,
            shutdown_rx: rx,
            clients: BTreeMap::new(),
        };
        Ok((daemon, ShutdownHandle { tx }))
    }

    /// Serve until shutdown is triggered, then flush state one last time
    pub fn run(&mut self) -> Result<()> {
        info!(socket = %self.server.path().display(), "Profile daemon running");

        loop {
            let Some(ready) = self.wait()? else {
                continue;
            };

            if ready.shutdown {
                info!(clients = self.clients.len(), "Shutdown requested");
                break;
            }

            if ready.listener {
                self.accept();
            }

            for (fd, flags) in ready.clients {
                self.service(fd, flags);
            }
        }

        for (fd, _) in std::mem::take(&mut self.clients) {
            debug!(fd = fd, "Closing client at shutdown");
        }
        self.state.save().context("Failed to flush state at shutdown")?;
        info!("Profile daemon stopped");
        Ok(())
    }

    /// Block until something is ready; `None` if interrupted by a signal
    fn wait(&self) -> Result<Option<Readiness>> {
        let mut fds = Vec::with_capacity(self.clients.len() + 2);
        fds.push(PollFd::new(self.shutdown_rx.as_fd(), PollFlags::POLLIN));
        fds.push(PollFd::new(self.server.listener().as_fd(), PollFlags::POLLIN));
        for conn in self.clients.values() {
            fds.push(PollFd::new(conn.stream.as_fd(), PollFlags::POLLIN));
        }

        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(None),
            Err(e) => return Err(e).context("Failed to poll connections"),
        }

        let flags: Vec<PollFlags> = fds
            .iter()
            .map(|fd| fd.revents().unwrap_or(PollFlags::empty()))
            .collect();

        Ok(Some(Readiness {
            shutdown: !flags[0].is_empty(),
            listener: flags[1].contains(PollFlags::POLLIN),
            clients: self
                .clients
                .keys()
                .copied()
                .zip(flags[2..].iter().copied())
                .filter(|(_, f)| !f.is_empty())
                .collect(),
        }))
    }

    fn accept(&mut self) {
        match self.server.accept() {
            Ok(stream) => {
                let fd = stream.as_raw_fd();
                info!(fd = fd, clients = self.clients.len() + 1, "Client connected");
                self.clients.insert(
                    fd,
                    Connection {
                        stream,
                        decoder: FrameDecoder::new(),
                    },
                );
            }
            Err(e) => warn!(error = ?e, "Accept failed"),
        }
    }

    fn service(&mut self, fd: RawFd, flags: PollFlags) {
        let mut keep = true;

        if flags.contains(PollFlags::POLLIN) {
            keep = match self.receive(fd) {
                Ok(open) => open,
                Err(e) => {
                    warn!(fd = fd, error = ?e, "Dropping client");
                    false
                }
            };
        }

        if flags.intersects(PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL) {
            keep = false;
        }

        if !keep {
            self.clients.remove(&fd);
            info!(fd = fd, clients = self.clients.len(), "Client disconnected");
        }
    }

    /// Read what is available, answer every complete request
    ///
    /// `Ok(false)` on orderly disconnect, `Err` on framing, protocol or
    /// persistence failure.
    fn receive(&mut self, fd: RawFd) -> Result<bool> {
        let Some(conn) = self.clients.get_mut(&fd) else {
            return Ok(false);
        };

        let mut buf = [0u8; wire::READ_CHUNK];
        let n = match conn.stream.read(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(true),
            Err(e) => return Err(e).context("Failed to read from client"),
        };

        if n == 0 {
            if !conn.decoder.is_idle() {
                bail!("Client disconnected mid-message ({:?})", conn.decoder.phase());
            }
            debug!(fd = fd, "Client closed connection");
            return Ok(false);
        }

        conn.decoder.extend(&buf[..n]);
        while let Some(msg) = conn.decoder.next_message()? {
            let rsp = handle_request(&mut self.state, &msg)?;
            write_message(&mut conn.stream, &rsp)?;
        }
        Ok(true)
    }
}

/// Load state from the service root and serve until SIGINT/SIGTERM
pub fn run_profile_daemon(paths: ServicePaths) -> Result<()> {
    paths
        .ensure_dirs()
        .context("Failed to prepare service root")?;

    let state = DaemonState::load(paths.clone());
    info!(
        profile = %state.current_profile(),
        profiles = state.profiles().len(),
        keys = state.known_keys().len(),
        "Loaded daemon state"
    );

    let server = ProfileServer::bind_to(paths.socket.clone())
        .context("Failed to start IPC server")?;
    let (mut daemon, shutdown) = ProfileDaemon::new(state, server)?;
    shutdown.register_signals()?;

    daemon.run().inspect_err(|e| error!(error = ?e, "Profile daemon failed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{Message, ProfileClient};
    use std::fs;
    use std::io::Write;
    use std::thread::{self, JoinHandle};
    use tempfile::TempDir;

    fn start(paths: &ServicePaths) -> (ShutdownHandle, JoinHandle<Result<()>>) {
        let state = DaemonState::load(paths.clone());
        let server = ProfileServer::bind_to(paths.socket.clone()).unwrap();
        let (mut daemon, shutdown) = ProfileDaemon::new(state, server).unwrap();
        let handle = thread::spawn(move || daemon.run());
        (shutdown, handle)
    }

    fn stop(shutdown: ShutdownHandle, handle: JoinHandle<Result<()>>) {
        shutdown.trigger().unwrap();
        handle.join().unwrap().unwrap();
    }

    fn service_root() -> (TempDir, ServicePaths) {
        let dir = TempDir::new().unwrap();
        let paths = ServicePaths::from_root(dir.path());
        paths.ensure_dirs().unwrap();
        (dir, paths)
    }

    #[test]
    fn test_end_to_end_value_survives_restart() {
        let (_dir, paths) = service_root();
        fs::write(paths.config_dir.join("defaults.ini"), "[fallback]\nvol=5\n").unwrap();

        let (shutdown, handle) = start(&paths);
        let mut client = ProfileClient::connect_to(&paths.socket).unwrap();
        assert_eq!(client.get_value("general", "vol").unwrap(), "5");
        assert_eq!(client.set_value("general", "vol", "8").unwrap(), "8");
        assert_eq!(client.get_value("general", "vol").unwrap(), "8");
        drop(client);
        stop(shutdown, handle);

        assert_eq!(fs::read_to_string(&paths.values_file).unwrap(), "[general]\nvol=8\n");
        assert!(!paths.socket.exists());

        let (shutdown, handle) = start(&paths);
        let mut client = ProfileClient::connect_to(&paths.socket).unwrap();
        assert_eq!(client.get_value("general", "vol").unwrap(), "8");
        drop(client);
        stop(shutdown, handle);
    }

    #[test]
    fn test_profile_requests_over_socket() {
        let (_dir, paths) = service_root();
        fs::write(
            paths.config_dir.join("car.ini"),
            "[car]\nvol=9\n[datatype]\nvol=INTEGER\n",
        )
        .unwrap();

        let (shutdown, handle) = start(&paths);
        let mut client = ProfileClient::connect_to(&paths.socket).unwrap();

        assert!(client.get_profiles().unwrap().contains(&"car".to_string()));
        assert!(client.has_profile("car").unwrap());
        assert!(!client.has_profile("ghost").unwrap());
        assert_eq!(client.get_profile().unwrap(), "general");
        assert_eq!(client.set_profile("ghost").unwrap(), "general");
        assert_eq!(client.set_profile("car").unwrap(), "car");
        assert_eq!(client.get_keys().unwrap(), vec!["vol".to_string()]);
        assert_eq!(client.get_datatype("vol").unwrap(), "INTEGER");
        assert_eq!(
            client.get_values("").unwrap(),
            vec![("vol".to_string(), "9".to_string(), "INTEGER".to_string())]
        );
        drop(client);
        stop(shutdown, handle);

        assert_eq!(fs::read_to_string(&paths.profile_tag).unwrap(), "car");
    }

    #[test]
    fn test_unknown_request_closes_only_that_connection() {
        let (_dir, paths) = service_root();
        let (shutdown, handle) = start(&paths);

        let mut good = ProfileClient::connect_to(&paths.socket).unwrap();
        let mut bad = ProfileClient::connect_to(&paths.socket).unwrap();

        bad.send(&Message::request("format_disk", vec![])).unwrap();
        assert!(bad.recv().is_err());

        assert_eq!(good.get_profile().unwrap(), "general");
        drop(good);
        stop(shutdown, handle);
    }

    #[test]
    fn test_partial_frame_then_disconnect() {
        let (_dir, paths) = service_root();
        let (shutdown, handle) = start(&paths);

        let mut raw = UnixStream::connect(&paths.socket).unwrap();
        raw.write_all(&100u32.to_be_bytes()).unwrap();
        raw.write_all(b"{\"tag\"").unwrap();
        drop(raw);

        let mut client = ProfileClient::connect_to(&paths.socket).unwrap();
        assert_eq!(client.get_profile().unwrap(), "general");
        drop(client);
        stop(shutdown, handle);
    }

    #[test]
    fn test_connection_churn() {
        let (_dir, paths) = service_root();
        let (shutdown, handle) = start(&paths);

        let mut clients: Vec<ProfileClient> = (0..8)
            .map(|_| ProfileClient::connect_to(&paths.socket).unwrap())
            .collect();
        for client in clients.iter_mut() {
            assert_eq!(client.get_profile().unwrap(), "general");
        }

        // Abruptly close every other connection
        let mut survivors = Vec::new();
        for (i, client) in clients.into_iter().enumerate() {
            if i % 2 == 0 {
                survivors.push(client);
            }
        }

        for client in survivors.iter_mut() {
            assert!(client.has_profile("silent").unwrap());
        }

        let mut late = ProfileClient::connect_to(&paths.socket).unwrap();
        assert_eq!(late.set_value("silent", "vol", "0").unwrap(), "0");
        for client in survivors.iter_mut() {
            assert_eq!(client.get_value("silent", "vol").unwrap(), "0");
        }

        drop(survivors);
        drop(late);
        stop(shutdown, handle);
    }
}
