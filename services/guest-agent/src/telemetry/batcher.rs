//! Telemetry batcher loop.
//!
//! Drains the event queue on a fixed cadence, groups events per provider
//! into XML batches kept under [`MAX_BATCH_BYTES`], and posts them to the
//! wire server. Runs independently of reconciliation.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use quick_xml::escape::escape;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use vmagent_wire::TransportClient;

use super::event::{EventQueue, Operation, TelemetryEvent};
use super::identity::SystemIdentity;
use crate::context::AgentContext;

pub const TELEMETRY_PATH: &str = "/machine/?comp=telemetrydata";
/// Ceiling for one posted document.
pub const MAX_BATCH_BYTES: usize = 63 * 1024;

#[derive(Debug, Clone)]
pub struct BatcherConfig {
    pub interval: Duration,
    pub heartbeat_interval: Duration,
    /// Pause after this many posts within one pass.
    pub throttle_every: usize,
    pub throttle_delay: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30 * 60),
            throttle_every: 3,
            throttle_delay: Duration::from_secs(15),
        }
    }
}

/// Serialize one event as `<Event id=".."><![CDATA[...]]></Event>`.
pub fn encode_event(event: &TelemetryEvent) -> String {
    let params: String = event
        .params
        .iter()
        .map(|p| {
            format!(
                r#"<Param Name="{}" Value="{}" T="{}" />"#,
                escape(p.name.as_str()),
                escape(p.value.render().as_str()),
                p.value.type_tag()
            )
        })
        .collect();
    format!(r#"<Event id="{}"><![CDATA[{}]]></Event>"#, event.event_id, params)
}

pub fn wrap_batch(provider_id: &str, events: &str) -> String {
    format!(
        r#"<?xml version="1.0"?><TelemetryData version="1.0"><Provider id="{}">{}</Provider></TelemetryData>"#,
        escape(provider_id),
        events
    )
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PushResult {
    /// A completed batch document that must be sent before continuing.
    pub flushed: Option<String>,
    /// The event alone would exceed the ceiling and was discarded.
    pub dropped: bool,
}

/// Per-provider batch accumulator. Every document it produces is strictly
/// smaller than the ceiling.
#[derive(Debug)]
pub struct BatchBuilder {
    limit: usize,
    pending: BTreeMap<String, String>,
}

impl BatchBuilder {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            pending: BTreeMap::new(),
        }
    }

    fn overhead(provider_id: &str) -> usize {
        wrap_batch(provider_id, "").len()
    }

    pub fn push(&mut self, provider_id: &str, event_xml: &str) -> PushResult {
        let overhead = Self::overhead(provider_id);
        let mut result = PushResult::default();

        let pending_len = self.pending.get(provider_id).map_or(0, String::len);
        if pending_len > 0 && pending_len + event_xml.len() + overhead >= self.limit {
            result.flushed = self
                .pending
                .remove(provider_id)
                .map(|events| wrap_batch(provider_id, &events));
        }

        if event_xml.len() + overhead >= self.limit {
            result.dropped = true;
            return result;
        }

        self.pending
            .entry(provider_id.to_string())
            .or_default()
            .push_str(event_xml);
        result
    }

    /// All remaining non-empty batches.
    pub fn finish(self) -> Vec<String> {
        self.pending
            .into_iter()
            .filter(|(_, events)| !events.is_empty())
            .map(|(provider, events)| wrap_batch(&provider, &events))
            .collect()
    }
}

pub struct TelemetryBatcher {
    queue: EventQueue,
    transport: Arc<TransportClient>,
    config: BatcherConfig,
    lib_dir: PathBuf,
    identity: Option<SystemIdentity>,
    last_heartbeat: Option<Instant>,
}

impl TelemetryBatcher {
    pub fn new(ctx: &AgentContext, config: BatcherConfig) -> Self {
        Self {
            queue: ctx.events.clone(),
            transport: ctx.transport.clone(),
            config,
            lib_dir: ctx.config.lib_dir.clone(),
            identity: None,
            last_heartbeat: None,
        }
    }

    /// Run until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.config.interval.as_secs(), "Starting telemetry batcher");
        let mut ticker = tokio::time::interval(self.config.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let sent = self.run_once().await;
                    debug!(batches = sent, "Telemetry pass complete");
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Telemetry batcher shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One pass: queue a heartbeat when due, then drain and send. Returns
    /// the number of batches posted successfully.
    pub async fn run_once(&mut self) -> usize {
        self.maybe_heartbeat();
        self.collect_and_send().await
    }

    fn maybe_heartbeat(&mut self) {
        let due = self
            .last_heartbeat
            .is_none_or(|at| at.elapsed() >= self.config.heartbeat_interval);
        if due {
            self.queue
                .add_extension_event("WALA", Operation::HeartBeat, true, 0, "1.0", "");
            self.last_heartbeat = Some(Instant::now());
        }
    }

    async fn collect_and_send(&mut self) -> usize {
        let files = match self.queue.pending() {
            Ok(files) => files,
            Err(e) => {
                error!(error = %e, "Unable to list telemetry events");
                return 0;
            }
        };
        if files.is_empty() {
            return 0;
        }

        let lib_dir = self.lib_dir.clone();
        let identity = self
            .identity
            .get_or_insert_with(|| SystemIdentity::resolve(&lib_dir))
            .clone();

        let mut builder = BatchBuilder::new(MAX_BATCH_BYTES);
        let mut posts = 0usize;
        let mut sent = 0usize;

        for path in files {
            let mut event = match self.queue.take(&path) {
                Ok(event) => event,
                Err(e) => {
                    error!(path = %path.display(), error = %e, "Discarding unreadable telemetry event");
                    continue;
                }
            };
            if event.provider_id.is_empty() || event.event_id == 0 || event.params.is_empty() {
                error!(path = %path.display(), "Discarding incomplete telemetry event");
                continue;
            }
            identity.decorate(&mut event);

            let result = builder.push(&event.provider_id, &encode_event(&event));
            if result.dropped {
                warn!(provider = %event.provider_id, "Dropping telemetry event larger than the batch limit");
            }
            if let Some(batch) = result.flushed {
                sent += self.send(&batch, &mut posts).await;
            }
        }

        for batch in builder.finish() {
            sent += self.send(&batch, &mut posts).await;
        }
        sent
    }

    async fn send(&self, batch: &str, posts: &mut usize) -> usize {
        let delivered = match self
            .transport
            .post_with_agent_headers(TELEMETRY_PATH, batch.as_bytes())
            .await
        {
            Ok(_) => 1,
            Err(e) => {
                error!(error = %e, len = batch.len(), "Failed to send telemetry batch");
                0
            }
        };

        *posts += 1;
        if self.config.throttle_every > 0 && *posts % self.config.throttle_every == 0 {
            tokio::time::sleep(self.config.throttle_delay).await;
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::event::EXTENSION_EVENT_PROVIDER;
    use proptest::prelude::*;

    #[test]
    fn event_encoding_escapes_values() {
        let event = TelemetryEvent::extension("Foo", Operation::Install, true, 5, "1.0", "a<b & \"c\"");
        let xml = encode_event(&event);
        assert!(xml.starts_with(r#"<Event id="1"><![CDATA["#));
        assert!(xml.ends_with("]]></Event>"));
        assert!(xml.contains(r#"<Param Name="Name" Value="Foo" T="mt:wstr" />"#));
        assert!(xml.contains(r#"<Param Name="Duration" Value="5" T="mt:uint64" />"#));
        assert!(xml.contains(r#"<Param Name="OperationSuccess" Value="True" T="mt:bool" />"#));
        assert!(xml.contains("a&lt;b &amp; &quot;c&quot;"));
    }

    #[test]
    fn batches_wrap_events_per_provider() {
        let mut builder = BatchBuilder::new(MAX_BATCH_BYTES);
        assert_eq!(builder.push("p1", "<Event id=\"1\"/>"), PushResult::default());
        builder.push("p2", "<Event id=\"2\"/>");
        let batches = builder.finish();
        assert_eq!(
            batches,
            vec![
                wrap_batch("p1", "<Event id=\"1\"/>"),
                wrap_batch("p2", "<Event id=\"2\"/>"),
            ]
        );
        assert!(batches[0].starts_with(r#"<?xml version="1.0"?><TelemetryData version="1.0"><Provider id="p1">"#));
    }

    #[test]
    fn oversized_event_is_dropped() {
        let mut builder = BatchBuilder::new(MAX_BATCH_BYTES);
        builder.push(EXTENSION_EVENT_PROVIDER, "small");
        let result = builder.push(EXTENSION_EVENT_PROVIDER, &"x".repeat(MAX_BATCH_BYTES));
        assert!(result.dropped);
        // The pending batch is flushed first; it is still delivered.
        assert_eq!(
            result.flushed,
            Some(wrap_batch(EXTENSION_EVENT_PROVIDER, "small"))
        );
        assert!(builder.finish().is_empty());
    }

    proptest! {
        #[test]
        fn batches_stay_under_the_ceiling(sizes in prop::collection::vec(1usize..(MAX_BATCH_BYTES + 2048), 1..40)) {
            let mut builder = BatchBuilder::new(MAX_BATCH_BYTES);
            let mut produced = Vec::new();
            let mut kept = 0usize;
            let mut delivered = 0usize;
            let overhead = wrap_batch("p", "").len();

            for size in &sizes {
                let event = "e".repeat(*size);
                let result = builder.push("p", &event);
                produced.extend(result.flushed);
                if !result.dropped {
                    kept += size;
                }
                prop_assert_eq!(result.dropped, size + overhead >= MAX_BATCH_BYTES);
            }
            produced.extend(builder.finish());

            for batch in &produced {
                prop_assert!(batch.len() < MAX_BATCH_BYTES);
                delivered += batch.len() - overhead;
            }
            prop_assert_eq!(delivered, kept);
        }
    }
}
