use async_trait::async_trait;

use crate::{CloudError, CloudProvider, CloudResult};
use sentinel_proto::InstanceStatus;

/// Always reports `running` and a fixed IP. Selected when the process runs
/// outside a real cloud — local development and unit tests.
#[derive(Debug, Clone)]
pub struct NoopProvider {
    instance_ip: String,
}

impl NoopProvider {
    pub fn new(instance_ip: impl Into<String>) -> Self {
        Self {
            instance_ip: instance_ip.into(),
        }
    }
}

#[async_trait]
impl CloudProvider for NoopProvider {
    fn name(&self) -> &str {
        "noop"
    }

    async fn get_instance_status(&self) -> CloudResult<InstanceStatus> {
        Ok(InstanceStatus::Running)
    }

    async fn get_instance_ip(&self) -> CloudResult<String> {
        Ok(self.instance_ip.clone())
    }

    async fn start_instance(&self) -> CloudResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_reports_running_and_configured_ip() {
        let provider = NoopProvider::new("10.0.0.9");
        assert_eq!(
            provider.get_instance_status().await.unwrap(),
            InstanceStatus::Running
        );
        assert_eq!(provider.get_instance_ip().await.unwrap(), "10.0.0.9");
        assert!(provider.start_instance().await.is_ok());
        assert!(!provider.supports_events());
    }

    #[test]
    fn noop_has_error_variant_available_for_other_callers() {
        let _ = CloudError::Api("unused".to_string());
    }
}
