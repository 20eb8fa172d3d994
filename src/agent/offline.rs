//! Advisor stand-in for running without a language model

use async_trait::async_trait;

use super::collaborators::{Advisor, AnalysisRequest};
use crate::decision::AdvisorError;

/// Always unavailable, so every decision takes the technical fallback
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineAdvisor;

#[async_trait]
impl Advisor for OfflineAdvisor {
    async fn analyze(&self, _request: &AnalysisRequest) -> Result<String, AdvisorError> {
        Err(AdvisorError::Unavailable("no advisor configured".to_string()))
    }

    async fn reflect(&self, _prompt: &str) -> Result<String, AdvisorError> {
        Err(AdvisorError::Unavailable("no advisor configured".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_always_unavailable() {
        let advisor = OfflineAdvisor;
        assert!(matches!(
            tokio_test::block_on(advisor.reflect("how did it go?")),
            Err(AdvisorError::Unavailable(_))
        ));
    }
}
