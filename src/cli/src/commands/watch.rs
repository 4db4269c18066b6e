//! Live watch command.
//!
//! Opens a live subscription through the view synchronizer and renders each
//! snapshot as it arrives, until interrupted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use clap::Args;
use colored::*;
use uuid::Uuid;
use futures::stream::{BoxStream, StreamExt};

use crate::client::{ApiClient, Experiment, LiveEvent};
use crate::output;
use crate::sync::{FeedError, LinkState, LiveFeed, ViewSynchronizer};

#[derive(Args)]
pub struct WatchArgs {
    /// Experiment ID
    pub id: Uuid,

    /// Refresh interval for the rendered view, in milliseconds
    #[arg(long, default_value = "500")]
    pub interval_ms: u64,
}

/// Live feed backed by the server's SSE endpoint.
struct SseFeed {
    base_url: String,
}

#[async_trait]
impl LiveFeed for SseFeed {
    async fn subscribe(
        &self,
        experiment_id: &str,
    ) -> Result<BoxStream<'static, Result<Experiment, FeedError>>, FeedError> {
        let client = ApiClient::new(&self.base_url)
            .map_err(|e| FeedError::Transport(e.to_string()))?;
        let events = client
            .live_events(experiment_id)
            .await
            .map_err(|e| FeedError::Transport(e.to_string()))?;

        let stream = events.filter_map(|event| async move {
            match event {
                Ok(LiveEvent::Experiment { experiment }) => Some(Ok(experiment)),
                // Server-side stream errors are transient; surface them as
                // transport failures so the synchronizer reconnects.
                Ok(LiveEvent::Error { message }) => Some(Err(FeedError::Transport(message))),
                Err(err) => Some(Err(FeedError::Transport(err.to_string()))),
            }
        });
        Ok(stream.boxed())
    }
}

pub async fn execute(args: WatchArgs, client: &ApiClient) -> Result<()> {
    // Seed the cache with current state so there is something to show even
    // before the first snapshot arrives.
    let id = args.id.to_string();
    let current: Experiment = client.get(&format!("/experiments/{}", id)).await?;

    let feed = Arc::new(SseFeed {
        base_url: client.base_url().to_string(),
    });
    let synchronizer = ViewSynchronizer::new(feed);
    let cache = synchronizer.cache();
    cache.insert(current);

    synchronizer.enable_live(&id).await;
    output::print_info(&format!("Watching experiment {} (ctrl-c to stop)", id));

    let mut shown_version = 0;
    let mut shown_link = None;
    let mut ticker = tokio::time::interval(Duration::from_millis(args.interval_ms.max(100)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let Some(cached) = cache.get(&id) else { continue };
                let link_changed = shown_link != Some(cached.link);
                let version_changed = cached.experiment.version > shown_version;
                if link_changed || version_changed {
                    shown_link = Some(cached.link);
                    shown_version = cached.experiment.version;
                    render(&cached.experiment, cached.link);
                }
                // A terminal snapshot ends the watch once rendered.
                if cached.link == LinkState::Off
                    && matches!(cached.experiment.status.as_str(), "completed" | "stopped")
                {
                    break;
                }
            }
        }
    }

    synchronizer.disable_live(&id).await;
    Ok(())
}

fn render(experiment: &Experiment, link: LinkState) {
    let indicator = match link {
        LinkState::Live => "live".green().bold(),
        LinkState::Disconnected => "disconnected".yellow().bold(),
        LinkState::Off => "ended".dimmed().bold(),
    };
    println!(
        "{} [{}] {} v{} ({}) significance {:.1}%",
        chrono::Local::now().format("%H:%M:%S"),
        indicator,
        experiment.name,
        experiment.version,
        experiment.status,
        experiment.statistical_significance
    );
    for variant in &experiment.variants {
        let marker = if variant.is_control { "*" } else { " " };
        println!(
            "  {}{:<20} {:>8} visitors {:>7} conversions {:>7.2}% rate {:>6.1}% confidence",
            marker,
            variant.name,
            variant.visitors,
            variant.conversions,
            variant.conversion_rate * 100.0,
            variant.confidence
        );
    }
}
