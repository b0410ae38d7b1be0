//! Orchestrator-native events surfaced on reloaded workloads.

use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use log::warn;

use crate::matcher::MatchChannel;
use crate::source::ConfigObject;
use crate::workload::{Workload, WorkloadAdapter};

const CONTROLLER_NAME: &str = "reloader";

#[derive(Clone)]
pub struct EventPublisher {
    client: Client,
    reporter: Reporter,
}

impl EventPublisher {
    pub fn new(client: Client) -> Self {
        EventPublisher {
            client,
            reporter: Reporter {
                controller: CONTROLLER_NAME.to_string(),
                instance: None,
            },
        }
    }

    /// Best-effort: a failed event write never fails the reload it
    /// describes.
    pub async fn config_changed(
        &self,
        adapter: &dyn WorkloadAdapter,
        workload: &Workload,
        source: &ConfigObject,
        channel: MatchChannel,
    ) {
        let recorder = Recorder::new(
            self.client.clone(),
            self.reporter.clone(),
            adapter.object_reference(workload),
        );
        let event = Event {
            type_: EventType::Normal,
            reason: "ConfigChanged".to_string(),
            note: Some(format!(
                "Reloaded after a change to {} ({} match)",
                source.qualified_name(),
                channel.as_str()
            )),
            action: "Reload".to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(event).await {
            warn!("Failed to publish event for {}: {e}", workload.key());
        }
    }

    pub async fn reload_failed(
        &self,
        adapter: &dyn WorkloadAdapter,
        workload: &Workload,
        source: &ConfigObject,
        error: &str,
    ) {
        let recorder = Recorder::new(
            self.client.clone(),
            self.reporter.clone(),
            adapter.object_reference(workload),
        );
        let event = Event {
            type_: EventType::Warning,
            reason: "ReloadFailed".to_string(),
            note: Some(format!(
                "Failed to reload after a change to {}: {error}",
                source.qualified_name()
            )),
            action: "Reload".to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(event).await {
            warn!("Failed to publish event for {}: {e}", workload.key());
        }
    }
}
