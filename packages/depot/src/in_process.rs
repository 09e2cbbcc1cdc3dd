//! A transport that calls straight into a server in the same process.

use std::sync::Arc;

use color_eyre::Result;
use derive_more::Debug;
use protocol::{ConnectionId, MessageType, NetworkClient};

use crate::CacheServer;

/// Client side of a connection to a [`CacheServer`] living in this process.
///
/// Each instance is its own connection; dropping it closes the connection
/// and discards anything it staged.
#[derive(Debug)]
#[debug("InProcessClient({connection})")]
pub struct InProcessClient {
    server: Arc<CacheServer>,
    connection: ConnectionId,
}

impl InProcessClient {
    pub fn new(server: Arc<CacheServer>) -> Self {
        let connection = server.open_connection();
        Self { server, connection }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn server(&self) -> &Arc<CacheServer> {
        &self.server
    }
}

impl NetworkClient for InProcessClient {
    fn send(&self, message: MessageType, body: &[u8]) -> Result<Vec<u8>> {
        self.server.handle_request(self.connection, message, body)
    }
}

impl Drop for InProcessClient {
    fn drop(&mut self) {
        self.server.close_connection(self.connection);
    }
}
