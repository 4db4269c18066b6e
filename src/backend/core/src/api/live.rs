//! Server-sent event stream of experiment snapshots.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::{Stream, StreamExt};
use tracing::debug;
use uuid::Uuid;

use super::AppState;
use crate::error::VantageError;
use crate::experiment::ExperimentId;
use crate::live::{LiveEvent, LiveSubscription};

/// `GET /experiments/{id}/live`
///
/// Opens a persistent, unidirectional event stream. The first event is the
/// current snapshot; subsequent events follow every state-affecting mutation
/// while the experiment runs. The stream ends when the broadcaster closes
/// the channel (terminal transition or delete) or the client disconnects.
pub async fn live_stream(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>, VantageError> {
    let id = ExperimentId(id);
    let experiment = state.lifecycle.get(id).await?;

    let mut subscription = state.broadcaster.subscribe(id).await;
    // get() already derived the statistics; seed covers the case where
    // nothing has been published on this channel yet.
    subscription.seed(Arc::new(experiment));
    debug!(experiment = %id, "Live subscriber attached");

    Ok(Sse::new(snapshot_events(subscription)).keep_alive(KeepAlive::default()))
}

/// Turn a subscription into a stream of SSE events carrying the tagged
/// `{"type":"experiment",...}` envelope.
fn snapshot_events(
    subscription: LiveSubscription,
) -> impl Stream<Item = std::result::Result<Event, Infallible>> {
    futures::stream::unfold(subscription, |mut subscription| async move {
        subscription
            .next_snapshot()
            .await
            .map(|snapshot| (snapshot, subscription))
    })
    .filter_map(|snapshot| async move {
        let envelope = LiveEvent::Experiment {
            experiment: snapshot.as_ref().clone(),
        };
        match Event::default().json_data(&envelope) {
            Ok(event) => Some(Ok(event)),
            Err(err) => {
                // A snapshot that fails to serialize is dropped, not fatal.
                tracing::error!(error = %err, "Failed to serialize live snapshot");
                None
            }
        }
    })
}
