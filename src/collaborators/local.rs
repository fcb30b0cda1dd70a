//! In-process collaborators: passthrough processing and time authorities

use super::{ImageProcessor, ProcessingError, TimeAuthority};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};

/// Forwards camera bytes unchanged (camera already produces the delivery format)
#[derive(Debug, Default, Clone)]
pub struct PassthroughProcessor;

#[async_trait]
impl ImageProcessor for PassthroughProcessor {
    async fn process(&self, data: Vec<u8>) -> Result<Vec<u8>, ProcessingError> {
        if data.is_empty() {
            return Err(ProcessingError::Decode("empty image".to_string()));
        }
        Ok(data)
    }
}

/// Trusts the system clock unconditionally
#[derive(Debug, Default, Clone)]
pub struct SystemTimeAuthority;

impl TimeAuthority for SystemTimeAuthority {
    fn is_time_healthy(&self) -> bool {
        true
    }
}

/// Clock health flag driven by an external SNTP drift check
#[derive(Debug)]
pub struct ManualTimeAuthority {
    healthy: AtomicBool,
}

impl ManualTimeAuthority {
    pub fn new(healthy: bool) -> Self {
        Self {
            healthy: AtomicBool::new(healthy),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        let prev = self.healthy.swap(healthy, Ordering::SeqCst);
        if prev != healthy {
            tracing::info!(time_healthy = healthy, "Time health changed");
        }
    }
}

impl TimeAuthority for ManualTimeAuthority {
    fn is_time_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_passthrough_rejects_empty() {
        let processor = PassthroughProcessor;
        assert!(processor.process(Vec::new()).await.is_err());
        assert_eq!(processor.process(vec![1, 2, 3]).await.unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_manual_authority_toggle() {
        let authority = ManualTimeAuthority::new(true);
        assert!(authority.is_time_healthy());
        authority.set_healthy(false);
        assert!(!authority.is_time_healthy());
    }
}
