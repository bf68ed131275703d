//! Accept loop for one proxy: cipher handshake, target dial, pipe launch.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;

use crate::cipher::{CipherError, CipherSpec, CipherStream};
use crate::common::{read_target_addr, AddrError, Dialer};
use crate::hook::TrafficHook;
use crate::packet::Direction;
use crate::pipe::{forward_decrypt, forward_encrypt, PipeEndpoints};

#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("failed to bind {0}: {1}")]
    Bind(SocketAddr, std::io::Error),
    #[error("accept failed: {0}")]
    Accept(#[from] std::io::Error),
}

/// `conn_id -> TrafficHook`, built by the owning app at `start_proxy` time.
pub type HookFactory = Arc<dyn Fn(String) -> TrafficHook + Send + Sync>;

/// One running accept loop for one configured proxy.
pub struct Listener {
    proxy_id: String,
    listen_addr: SocketAddr,
    tcp: TokioTcpListener,
    cipher_spec: CipherSpec,
    dialer: Arc<dyn Dialer>,
    hook_factory: HookFactory,
    closed: Arc<AtomicBool>,
    close_tx: watch::Sender<bool>,
    close_rx: watch::Receiver<bool>,
    tasks: Mutex<JoinSet<()>>,
}

impl Listener {
    pub async fn bind(
        proxy_id: String,
        listen_addr: SocketAddr,
        cipher_spec: CipherSpec,
        dialer: Arc<dyn Dialer>,
        hook_factory: HookFactory,
    ) -> Result<Self, ListenerError> {
        let tcp = TokioTcpListener::bind(listen_addr)
            .await
            .map_err(|e| ListenerError::Bind(listen_addr, e))?;
        let (close_tx, close_rx) = watch::channel(false);
        Ok(Self {
            proxy_id,
            listen_addr,
            tcp,
            cipher_spec,
            dialer,
            hook_factory,
            closed: Arc::new(AtomicBool::new(false)),
            close_tx,
            close_rx,
            tasks: Mutex::new(JoinSet::new()),
        })
    }

    pub fn proxy_id(&self) -> &str {
        &self.proxy_id
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Accept loop. Returns once `close()` has been called (or the `TcpListener`
    /// errors for a reason unrelated to close). Accept errors observed after
    /// `close()` was called are swallowed.
    pub async fn serve(&self) -> Result<(), ListenerError> {
        loop {
            let mut close_rx = self.close_rx.clone();
            tokio::select! {
                biased;
                _ = close_rx.changed() => {
                    return Ok(());
                }
                accepted = self.tcp.accept() => {
                    match accepted {
                        Ok((stream, _peer_addr)) => {
                            if self.closed.load(Ordering::SeqCst) {
                                continue;
                            }
                            self.spawn_connection(stream).await;
                        }
                        Err(e) => {
                            if self.closed.load(Ordering::SeqCst) {
                                continue;
                            }
                            return Err(e.into());
                        }
                    }
                }
            }
        }
    }

    async fn spawn_connection(&self, stream: TcpStream) {
        let proxy_id = self.proxy_id.clone();
        let cipher_spec = self.cipher_spec.clone();
        let dialer = Arc::clone(&self.dialer);
        let hook_factory = Arc::clone(&self.hook_factory);
        let close_rx = self.close_rx.clone();
        let mut tasks = self.tasks.lock().await;
        tasks.spawn(async move {
            if let Err(e) =
                handle_connection(stream, proxy_id, cipher_spec, dialer, hook_factory, close_rx).await
            {
                tracing::debug!(error = %e, "connection terminated");
            }
        });
    }

    /// Idempotent and single-shot: the first call closes the accept loop and
    /// waits for every in-flight connection task to finish; later calls are
    /// no-ops.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.close_tx.send(true);
        let mut tasks = self.tasks.lock().await;
        while tasks.join_next().await.is_some() {}
    }
}

#[derive(Error, Debug)]
enum ConnectionError {
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error(transparent)]
    Addr(#[from] AddrError),
    #[error("dial failed: {0}")]
    Dial(std::io::Error),
}

async fn handle_connection(
    stream: TcpStream,
    proxy_id: String,
    cipher_spec: CipherSpec,
    dialer: Arc<dyn Dialer>,
    hook_factory: HookFactory,
    mut close_rx: watch::Receiver<bool>,
) -> Result<(), ConnectionError> {
    let client_addr = stream.peer_addr().ok();
    stream.set_nodelay(true).ok();

    let cipher = CipherStream::wrap(stream, &cipher_spec)?;
    let (mut cipher_read, mut cipher_write) = cipher.split();

    let target = read_target_addr(&mut cipher_read).await?;
    let dest = dialer
        .dial(&target.host(), target.port())
        .await
        .map_err(ConnectionError::Dial)?;
    let dest_addr = dest.peer_addr().ok();
    dest.set_nodelay(true).ok();
    let (mut dest_read, mut dest_write) = dest.into_split();

    let conn_id = uuid::Uuid::new_v4().to_string();
    let hook = Arc::new(hook_factory(conn_id.clone()));

    let out_endpoints = PipeEndpoints {
        conn_id: conn_id.clone(),
        direction: Direction::Out,
        src_ip: client_addr.map(|a| a.ip()),
        src_port: client_addr.map(|a| a.port()),
        dst_ip: dest_addr.map(|a| a.ip()),
        dst_port: dest_addr.map(|a| a.port()),
    };
    let in_endpoints = PipeEndpoints {
        conn_id: conn_id.clone(),
        direction: Direction::In,
        src_ip: dest_addr.map(|a| a.ip()),
        src_port: dest_addr.map(|a| a.port()),
        dst_ip: client_addr.map(|a| a.ip()),
        dst_port: client_addr.map(|a| a.port()),
    };

    tracing::debug!(proxy_id = %proxy_id, conn_id = %conn_id, target = %target, "connection established");

    let out_hook = Arc::clone(&hook);
    let in_hook = hook;
    tokio::select! {
        _ = forward_decrypt(&mut cipher_read, &mut dest_write, out_endpoints, out_hook) => {}
        _ = forward_encrypt(&mut dest_read, &mut cipher_write, in_endpoints, in_hook) => {}
        _ = close_rx.changed() => {
            tracing::debug!(proxy_id = %proxy_id, conn_id = %conn_id, "connection closed by listener shutdown");
        }
    }

    dest_write.shutdown().await.ok();
    cipher_write.shutdown().await.ok();
    Ok(())
}
