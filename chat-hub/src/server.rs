use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream},
    select,
    time::timeout,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use crate::{
    client::Client,
    connection::TcpConnection,
    message::{DEFAULT_ROOM, read_frame, write_message},
    registry::Registry,
    session::{Authenticator, GuestAuthenticator, LoginRejected, LoginRequest, Session},
};

/// How long a fresh connection may take to send its login frame.
const LOGIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Accept loop in front of the hub: logs peers in, then hands each one to a
/// [`Client`] placed in the default room.
pub struct Server {
    listener: TcpListener,
    registry: Arc<Registry>,
    authenticator: Arc<dyn Authenticator>,
}

impl Server {
    pub fn new(listener: TcpListener, registry: Arc<Registry>) -> Self {
        Self {
            listener,
            registry,
            authenticator: Arc::new(GuestAuthenticator),
        }
    }

    pub fn with_authenticator<A>(mut self, authenticator: A) -> Self
    where
        A: Authenticator + 'static,
    {
        self.authenticator = Arc::new(authenticator);
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            registry,
            authenticator,
        } = self;
        tokio::pin!(shutdown);
        let handlers = TaskTracker::new();
        let closing = CancellationToken::new();

        loop {
            select! {
                _ = &mut shutdown => break,
                accept_result = listener.accept() => {
                    let context = HandlerContext {
                        registry: Arc::clone(&registry),
                        authenticator: Arc::clone(&authenticator),
                        closing: closing.clone(),
                    };
                    handle_accept_result(accept_result, context, &handlers);
                }
            }
        }

        // Cancelled before the directory sweep so late logins back out themselves.
        closing.cancel();
        handlers.close();
        handle_shutdown(&registry).await;
        handlers.wait().await;

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_shutdown(registry: &Registry) {
    let clients = registry.clients();
    info!(clients = clients.len(), "hub shutting down");
    for client in clients {
        client.stop().await;
    }
}

/// What each connection handler needs from the accept loop.
struct HandlerContext {
    registry: Arc<Registry>,
    authenticator: Arc<dyn Authenticator>,
    closing: CancellationToken,
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    context: HandlerContext,
    handlers: &TaskTracker,
) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, context, handlers),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(
    stream: TcpStream,
    peer: SocketAddr,
    context: HandlerContext,
    handlers: &TaskTracker,
) {
    handlers.spawn(async move {
        if let Err(err) = handle_connection(stream, peer, context).await {
            warn!(peer = %peer, error = ?err, "connection closed with error");
        }
    });
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    context: HandlerContext,
) -> Result<()> {
    let HandlerContext {
        registry,
        authenticator,
        closing,
    } = context;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let session = select! {
        _ = closing.cancelled() => anyhow::bail!("hub shut down during login"),
        login = timeout(
            LOGIN_TIMEOUT,
            perform_login(&mut reader, &mut writer, authenticator.as_ref()),
        ) => login.context("login timed out")??,
    };

    let connection = Arc::new(TcpConnection::from_parts(peer, reader, writer));
    let client = Client::new(session.clone(), Arc::clone(&connection), &registry);
    if !registry.add_client(&client) {
        client.stop().await;
        anyhow::bail!("session {} is already connected", session.id);
    }
    // Registered before this check, so a shutdown either sees the client in
    // the directory or is seen here.
    if closing.is_cancelled() {
        client.stop().await;
        anyhow::bail!("hub shut down during login");
    }

    // Joined before the reply goes out, so the peer misses nothing it sends
    // right after logging in.
    let outcome = registry.add_client_to_room(DEFAULT_ROOM, &client);
    debug!(peer = %peer, ?outcome, "joined default room");

    if let Err(err) = connection.send_frame(&session).await {
        client.stop().await;
        return Err(err).context("failed to send login reply");
    }

    client.start()?;
    info!(peer = %peer, user = %session.user.name, "client connected");

    select! {
        _ = client.wait_stopped() => {}
        _ = closing.cancelled() => client.stop().await,
    }
    info!(peer = %peer, user = %session.user.name, "client disconnected");
    Ok(())
}

async fn perform_login<R, W>(
    reader: &mut R,
    writer: &mut W,
    authenticator: &dyn Authenticator,
) -> Result<Session>
where
    R: tokio::io::AsyncBufRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let frame = match read_frame(reader).await? {
        Some(frame) => frame,
        None => anyhow::bail!("connection closed before login"),
    };
    let request: LoginRequest =
        serde_json::from_slice(&frame).context("malformed login request")?;

    match authenticator.authenticate(&request) {
        Ok(session) => Ok(session),
        Err(err) => {
            write_message(
                writer,
                &LoginRejected {
                    error: err.to_string(),
                },
            )
            .await?;
            Err(err.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::AuthError;

    #[tokio::test]
    async fn login_returns_a_session_for_valid_names() {
        let (client, server) = tokio::io::duplex(1024);
        let (server_read, mut server_write) = tokio::io::split(server);
        let mut server_read = BufReader::new(server_read);
        let (_client_read, mut client_write) = tokio::io::split(client);

        write_message(&mut client_write, &LoginRequest { name: "alice".into() })
            .await
            .unwrap();
        let session = perform_login(&mut server_read, &mut server_write, &GuestAuthenticator)
            .await
            .unwrap();

        assert_eq!(session.user.name, "alice");
    }

    #[tokio::test]
    async fn rejected_login_is_reported_to_the_peer() {
        let (client, server) = tokio::io::duplex(1024);
        let (server_read, mut server_write) = tokio::io::split(server);
        let mut server_read = BufReader::new(server_read);
        let (client_read, mut client_write) = tokio::io::split(client);
        let mut client_read = BufReader::new(client_read);

        write_message(&mut client_write, &LoginRequest { name: " ".into() })
            .await
            .unwrap();
        let result = perform_login(&mut server_read, &mut server_write, &GuestAuthenticator).await;
        assert!(result.is_err());

        let frame = read_frame(&mut client_read).await.unwrap().unwrap();
        let reply: LoginRejected = serde_json::from_slice(&frame).unwrap();
        assert_eq!(reply.error, AuthError::EmptyName.to_string());
    }

    #[tokio::test]
    async fn login_requires_a_login_frame() {
        let (client, server) = tokio::io::duplex(1024);
        let (server_read, mut server_write) = tokio::io::split(server);
        let mut server_read = BufReader::new(server_read);
        drop(client);

        let result = perform_login(&mut server_read, &mut server_write, &GuestAuthenticator).await;
        assert!(result.is_err());
    }
}
