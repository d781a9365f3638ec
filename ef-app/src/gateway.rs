//! Inbound multiplexer: every socket frame funnels through one queue and
//! comes out as a resolved identity plus a dispatched turn.

use crate::identity::{normalize_phone, IdentityResolver};
use crate::orchestrator::Orchestrator;
use crate::registry::ChannelRegistry;
use anyhow::Result;
use ef_channels::{InboundEvent, InboundKind, ReplyPayload, UserId};
use ef_stores::UserStore;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct Gateway {
    resolver: Arc<IdentityResolver>,
    users: Arc<dyn UserStore>,
    registry: Arc<ChannelRegistry>,
    orchestrator: Arc<Orchestrator>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<InboundEvent>>,
}

impl Gateway {
    pub fn new(
        resolver: Arc<IdentityResolver>,
        users: Arc<dyn UserStore>,
        registry: Arc<ChannelRegistry>,
        orchestrator: Arc<Orchestrator>,
        inbound_rx: mpsc::Receiver<InboundEvent>,
    ) -> Self {
        Self {
            resolver,
            users,
            registry,
            orchestrator,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
        }
    }

    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run_loop(shutdown).await {
                tracing::error!(%e, "gateway loop exited");
            }
        })
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn run_loop(&self, shutdown: CancellationToken) -> Result<()> {
        loop {
            let event = {
                let mut rx = self.inbound_rx.lock().await;
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    event = rx.recv() => event,
                }
            };
            let Some(event) = event else {
                return Ok(());
            };

            if let Err(e) = self.handle_inbound(event).await {
                tracing::warn!(%e, "handle_inbound failed");
            }
        }
    }

    pub(crate) async fn handle_inbound(&self, event: InboundEvent) -> Result<()> {
        match event.kind {
            InboundKind::Message { ref text } => {
                let identity = self.resolve_and_register(&event).await?;
                // A direct turn means this user is driving locally again;
                // any conversation mirrored into this channel stops.
                self.registry.unpair_all_for(&identity);

                let reply = self.orchestrator.handle_turn(&identity, text, None).await;
                self.registry.deliver(&identity, &reply).await;
            }
            InboundKind::Remote { ref phone } => {
                let identity = self.resolve_and_register(&event).await?;
                let phone_identity = UserId::new(normalize_phone(phone));
                self.registry.pair(phone_identity.clone(), identity.clone());
                self.registry
                    .deliver(
                        &identity,
                        &ReplyPayload::Msg {
                            text: format!("Now following the conversation for {phone_identity}."),
                            username: None,
                        },
                    )
                    .await;
            }
            InboundKind::Disconnected => {
                self.registry.unregister_channel(event.channel.id());
            }
        }
        Ok(())
    }

    async fn resolve_and_register(&self, event: &InboundEvent) -> Result<UserId> {
        let resolved = self.resolver.resolve(&event.token).await?;
        if resolved.newly_minted {
            // Best effort: a failed profile insert only costs the token
            // mapping a restart would rebuild anyway.
            if let Err(e) = self
                .users
                .create(resolved.user_id.as_str(), event.token.as_str())
                .await
            {
                tracing::warn!(%e, user_id = %resolved.user_id, "user create failed");
            }
        }
        self.resolver
            .remember(event.token.clone(), resolved.user_id.clone());
        self.registry
            .register(resolved.user_id.clone(), event.channel.clone());
        Ok(resolved.user_id)
    }
}
