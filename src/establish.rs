//! Orchestrates dial + handshake + auth for a single connection. The three collaborators are
//! supplied externally (§6 of the design document); this module only sequences them.

use std::sync::Arc;

use crate::{
    collab::{Authenticator, Credential, Dialer, Handshaker},
    conn::{Connection, PendingConnection},
    error::Result,
    event::{ConnectionClosedReason, ConnectionReadyEvent, PoolEvent},
};

pub(crate) struct ConnectionEstablisher<D, H, A> {
    dialer: Arc<D>,
    handshaker: Arc<H>,
    authenticator: Arc<A>,
    connect_timeout: std::time::Duration,
    app_name: Option<String>,
}

impl<D, H, A> Clone for ConnectionEstablisher<D, H, A> {
    fn clone(&self) -> Self {
        Self {
            dialer: self.dialer.clone(),
            handshaker: self.handshaker.clone(),
            authenticator: self.authenticator.clone(),
            connect_timeout: self.connect_timeout,
            app_name: self.app_name.clone(),
        }
    }
}

impl<D, H, A> ConnectionEstablisher<D, H, A>
where
    D: Dialer,
    H: Handshaker<D::Stream>,
    A: Authenticator<D::Stream>,
{
    pub(crate) fn new(
        dialer: Arc<D>,
        handshaker: Arc<H>,
        authenticator: Arc<A>,
        connect_timeout: std::time::Duration,
        app_name: Option<String>,
    ) -> Self {
        Self {
            dialer,
            handshaker,
            authenticator,
            connect_timeout,
            app_name,
        }
    }

    /// Dials, handshakes, and (unless speculative auth already satisfied it) authenticates a
    /// connection described by `pending`. On any failure the partially-built connection (if
    /// any) is closed and a `ConnectionClosed { Error }` event is emitted before the error
    /// propagates.
    pub(crate) async fn establish(
        &self,
        pending: PendingConnection,
        credential: Option<&Credential>,
    ) -> Result<Connection<D::Stream>> {
        let emitter = pending.event_emitter.clone();

        let stream = match self.dialer.dial(&pending.address, self.connect_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                let address = pending.address.clone();
                let id = pending.id;
                emitter.emit(move || {
                    PoolEvent::ConnectionClosed(crate::event::ConnectionClosedEvent {
                        address,
                        connection_id: id,
                        reason: ConnectionClosedReason::Error,
                    })
                });
                return Err(e);
            }
        };

        let mut connection = Connection::new(&pending, stream);

        if let Err(e) = self.run_handshake_and_auth(&mut connection, credential).await {
            connection.close(Some(ConnectionClosedReason::Error), &emitter);
            return Err(e);
        }

        let address = connection.address.clone();
        let id = connection.id;
        let duration = connection.time_created.elapsed();
        emitter.emit(move || {
            PoolEvent::ConnectionReady(ConnectionReadyEvent {
                address,
                connection_id: id,
                duration,
            })
        });

        Ok(connection)
    }

    async fn run_handshake_and_auth(
        &self,
        connection: &mut Connection<D::Stream>,
        credential: Option<&Credential>,
    ) -> Result<()> {
        let stream = connection
            .stream
            .as_mut()
            .expect("stream present on a freshly dialed connection");

        let reply = self
            .handshaker
            .handshake(stream, self.app_name.as_deref())
            .await?;
        let speculative_auth_completed = reply.speculative_auth_completed;
        connection.apply_handshake(reply);

        if !speculative_auth_completed {
            if let Some(credential) = credential {
                let stream = connection
                    .stream
                    .as_mut()
                    .expect("stream present after handshake");
                self.authenticator.authenticate(stream, credential).await?;
            }
        }

        Ok(())
    }
}
