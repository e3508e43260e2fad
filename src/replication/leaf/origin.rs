//! Origin side of leaf federation
//!
//! A leaf connects with an API token, registers its version and zone, and
//! from then on receives every change visible to its tenant through the
//! session hub. On request the origin streams a full snapshot: groups,
//! roles, the leaf's own user, templates, template vars and scripts,
//! closed by `FullSyncEnd`.

use crate::domain::entities::User;
use crate::domain::ports::{EntityStore, EntityStores, StoreError};
use crate::domain::value_objects::Version;
use crate::replication::entity::{LeafContext, Replicated};
use crate::replication::leaf::protocol::{
    control_frame, decode_frame, decode_payload, encode_frame, LeafError, LeafMessageType,
    Register, RegisterResponse,
};
use crate::replication::leaf::session::{LeafHub, LeafSession, LeafSink, LeafStream};
use chrono::Utc;
use std::sync::Arc;

/// Records per frame in the full-sync stream.
const FULL_SYNC_CHUNK: usize = 256;

/// Everything the origin needs to serve leaves.
pub struct OriginState {
    pub version: Version,
    pub stores: EntityStores,
    pub hub: Arc<LeafHub>,
}

#[derive(Debug, thiserror::Error)]
pub enum LeafAuthError {
    #[error("unknown, deleted or expired token")]
    InvalidToken,
    #[error("token owner is deleted or inactive")]
    InactiveUser,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Resolve a bearer token to the user it authenticates.
pub async fn authenticate_leaf(stores: &EntityStores, bearer: &str) -> Result<User, LeafAuthError> {
    let token = match stores.tokens.get(bearer).await? {
        Some(token) if !token.is_deleted && !token.is_expired(Utc::now()) => token,
        _ => return Err(LeafAuthError::InvalidToken),
    };

    match stores.users.get(&token.user_id).await? {
        Some(user) if !user.is_deleted && user.active => Ok(user),
        _ => Err(LeafAuthError::InactiveUser),
    }
}

/// Drive one authenticated leaf connection until it closes.
///
/// A version mismatch is reported to the leaf and ends this connection only.
pub async fn serve_leaf<S, K>(
    state: Arc<OriginState>,
    user: User,
    mut stream: S,
    mut sink: K,
) -> Result<(), LeafError>
where
    S: LeafStream,
    K: LeafSink + 'static,
{
    let frame = stream.recv().await.ok_or(LeafError::Closed)??;
    let (kind, payload) = decode_frame(&frame)?;
    if kind != LeafMessageType::Register {
        return Err(LeafError::Unexpected(kind));
    }
    let register: Register = decode_payload(payload)?;

    let compatible = Version::parse(&register.leaf_version)
        .map(|v| v.compatible_with(&state.version))
        .unwrap_or(false);
    if !compatible {
        let reason = format!(
            "leaf version {} is not compatible with origin version {}",
            register.leaf_version, state.version
        );
        tracing::warn!("rejecting leaf for user {}: {}", user.id, reason);
        sink.send(encode_frame(LeafMessageType::Register, &RegisterResponse::failed(&reason))?)
            .await?;
        sink.close().await;
        return Err(LeafError::VersionMismatch(reason));
    }
    sink.send(encode_frame(LeafMessageType::Register, &RegisterResponse::ok())?)
        .await?;

    let context = LeafContext {
        zone: register.zone,
        user_id: user.id,
    };
    let session = state.hub.register(context, Box::new(sink));

    loop {
        match stream.recv().await {
            Some(Ok(frame)) => match decode_frame(&frame) {
                Ok((LeafMessageType::FullSync, _)) => {
                    let stores = state.stores.clone();
                    let session = session.clone();
                    tokio::spawn(async move {
                        if let Err(e) = stream_full_sync(&stores, &session).await {
                            tracing::warn!("full sync to leaf session {} aborted: {}", session.id, e);
                        }
                    });
                }
                Ok((kind, _)) => {
                    tracing::debug!("ignoring {:?} from leaf session {}", kind, session.id);
                }
                Err(e) => tracing::warn!("bad frame from leaf session {}: {}", session.id, e),
            },
            Some(Err(e)) => {
                tracing::warn!("leaf session {} read error: {}", session.id, e);
                break;
            }
            None => break,
        }
    }

    state.hub.unregister(&session.id);
    Ok(())
}

/// Stream the snapshot a freshly connected leaf needs.
pub async fn stream_full_sync(stores: &EntityStores, session: &LeafSession) -> Result<(), LeafError> {
    tracing::info!("streaming full sync to leaf session {}", session.id);

    push_all(&*stores.groups, session).await?;
    push_all(&*stores.roles, session).await?;

    match stores.users.get(&session.context.user_id).await {
        Ok(Some(user)) => push_batch(vec![user], session).await?,
        Ok(None) => tracing::warn!("leaf user {} not found", session.context.user_id),
        Err(e) => tracing::error!("failed to read leaf user {}: {}", session.context.user_id, e),
    }

    push_all(&*stores.templates, session).await?;
    push_all(&*stores.template_vars, session).await?;
    push_all(&*stores.scripts, session).await?;

    session.send(control_frame(LeafMessageType::FullSyncEnd)).await
}

async fn push_all<E: Replicated>(
    store: &dyn EntityStore<E>,
    session: &LeafSession,
) -> Result<(), LeafError> {
    match store.get_all().await {
        Ok(records) => push_batch(records, session).await,
        Err(e) => {
            tracing::error!("failed to read {} for leaf full sync: {}", E::KIND, e);
            Ok(())
        }
    }
}

async fn push_batch<E: Replicated>(records: Vec<E>, session: &LeafSession) -> Result<(), LeafError> {
    let Some(kind) = E::LEAF_MESSAGE else {
        return Ok(());
    };

    let visible: Vec<E> = records
        .iter()
        .filter(|e| e.replicable())
        .filter_map(|e| e.leaf_view(&session.context))
        .collect();

    for chunk in visible.chunks(FULL_SYNC_CHUNK) {
        session.send(encode_frame(kind, chunk)?).await?;
    }
    Ok(())
}
