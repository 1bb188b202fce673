//! Console writer: logs every call through `tracing`.

use async_trait::async_trait;

use super::{MessageStore, MessageWriter};
use crate::{CauseElimination, Error, MessageRef, MessageUpsert, MetricsUpdate, Preset, Result};

/// Writer for dry runs and headless deployments.
#[derive(Debug, Clone)]
pub struct ConsoleWriter {
    name: String,
    enabled: bool,
    preset: Option<Preset>,
}

impl ConsoleWriter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            preset: None,
        }
    }

    /// Attach the preset whose title is logged with each message.
    pub fn with_preset(mut self, preset: Preset) -> Self {
        self.preset = Some(preset);
        self
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    fn check_enabled(&self) -> Result<()> {
        if self.enabled {
            Ok(())
        } else {
            Err(Error::WriterDisabled(self.name.clone()))
        }
    }

    fn title(&self) -> &str {
        self.preset
            .as_ref()
            .map(|p| p.message.title.as_str())
            .unwrap_or("")
    }
}

#[async_trait]
impl MessageWriter for ConsoleWriter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_upsert(&self, message_ref: &MessageRef, upsert: &MessageUpsert) -> Result<bool> {
        self.check_enabled()?;
        let metrics = serde_json::to_string(&upsert.metrics).unwrap_or_default();
        tracing::info!(
            writer = %self.name,
            message_ref = %message_ref,
            title = self.title(),
            metrics = %metrics,
            actions = upsert.actions.len(),
            "Message opened"
        );
        Ok(true)
    }

    async fn on_metrics(&self, message_ref: &MessageRef, update: &MetricsUpdate) -> Result<bool> {
        self.check_enabled()?;
        let metrics = serde_json::to_string(&update.set).unwrap_or_default();
        tracing::info!(writer = %self.name, message_ref = %message_ref, metrics = %metrics, "Message metrics updated");
        Ok(true)
    }

    async fn on_close(&self, message_ref: &MessageRef) -> Result<bool> {
        self.check_enabled()?;
        tracing::info!(writer = %self.name, message_ref = %message_ref, "Message closed");
        Ok(true)
    }
}

#[async_trait]
impl MessageStore for ConsoleWriter {
    async fn complete_after_cause_eliminated(
        &self,
        message_ref: &MessageRef,
        elimination: &CauseElimination,
    ) -> Result<bool> {
        self.check_enabled()?;
        tracing::info!(
            writer = %self.name,
            message_ref = %message_ref,
            reason = %elimination.reason,
            at = %elimination.at,
            "Message completed after cause elimination"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::InstanceKey;

    #[tokio::test]
    async fn test_disabled_writer_fails() {
        let mut writer = ConsoleWriter::new("console");
        let message_ref = InstanceKey::new("cycle", "pump").message_ref();

        assert!(writer.on_close(&message_ref).await.unwrap());
        writer.disable();
        assert!(matches!(
            writer.on_close(&message_ref).await,
            Err(Error::WriterDisabled(_))
        ));
    }
}
