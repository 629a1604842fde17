//! A bag of executor addresses the dispatcher can hand to a waiting task.
//! No priority and no identity tracking across round trips — a task takes
//! whichever backend is available and the backend goes back in the bag
//! once the task stops.

use std::net::SocketAddr;

use tokio::sync::mpsc;

use crate::transport::{Connection, EXECUTOR_SUBPROTOCOL};

#[derive(Debug, Clone, Copy)]
pub struct Backend {
    pub addr: SocketAddr,
}

impl Backend {
    pub async fn dial(&self) -> Result<Connection, tokio_tungstenite::tungstenite::Error> {
        Connection::dial(self.addr, EXECUTOR_SUBPROTOCOL).await
    }
}

pub struct BackendPool {
    tx: mpsc::Sender<Backend>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Backend>>,
}

impl BackendPool {
    pub fn new(addrs: &[SocketAddr]) -> Self {
        let (tx, rx) = mpsc::channel(addrs.len().max(1));
        for addr in addrs {
            let _ = tx.try_send(Backend { addr: *addr });
        }
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    pub async fn take(&self) -> Backend {
        let mut rx = self.rx.lock().await;
        rx.recv().await.expect("backend pool sender never dropped while pool is alive")
    }

    pub async fn put(&self, backend: Backend) {
        let _ = self.tx.send(backend).await;
    }
}
