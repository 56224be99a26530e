//! Daemon assembly and lifecycle.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{info, warn};

use super::DaemonError;
use super::container::ServiceContainer;
use super::server::ServerConnection;
use crate::config::DaemonConfig;
use crate::event_loop::Loop;

/// One bus daemon: loop, container and server connection wired together.
///
/// Daemon code adds its services through [`Daemon::container`] before (or
/// while) [`Daemon::run`] drives the loop.
pub struct Daemon {
    event_loop: Loop,
    container: Rc<RefCell<ServiceContainer>>,
    server: ServerConnection,
}

impl Daemon {
    /// Bind the bus socket and prepare an empty container.
    pub fn new(config: DaemonConfig) -> Result<Self, DaemonError> {
        let mut event_loop = Loop::new();
        let container = Rc::new(RefCell::new(ServiceContainer::new()));
        let server = ServerConnection::start(&mut event_loop, Rc::clone(&container), &config)?;
        Ok(Self {
            event_loop,
            container,
            server,
        })
    }

    pub fn container(&self) -> Rc<RefCell<ServiceContainer>> {
        Rc::clone(&self.container)
    }

    pub fn event_loop(&mut self) -> &mut Loop {
        &mut self.event_loop
    }

    /// Drive the loop until a quit request, then unlink the socket.
    pub fn run(mut self) -> Result<(), DaemonError> {
        info!("bus running");
        self.event_loop.run();
        info!("bus stopped");
        if let Err(err) = std::fs::remove_file(self.server.socket_path()) {
            warn!(error = %err, "could not remove socket file");
        }
        Ok(())
    }
}
