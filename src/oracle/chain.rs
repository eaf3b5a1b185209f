//! Ordered fallback over polled adapters
//!
//! One cycle walks the adapters in order and stops at the first one that
//! writes at least one row. Failures and empty batches fall through to the
//! next adapter in the same cycle.

use std::sync::Arc;
use tracing::{error, info, warn};

use crate::oracle::sources::PriceAdapter;
use crate::oracle::{IngestSink, IngestState};

/// Result of one polling cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Progress {
        /// Position of the adapter in the chain
        index: usize,
        adapter: &'static str,
        written: usize,
    },
    Exhausted,
}

impl CycleOutcome {
    /// State label for this outcome
    pub fn state(&self) -> IngestState {
        match self {
            CycleOutcome::Progress { index: 0, .. } => IngestState::PollingPrimary,
            CycleOutcome::Progress { .. } => IngestState::PollingSecondary,
            CycleOutcome::Exhausted => IngestState::Exhausted,
        }
    }

    pub fn written(&self) -> usize {
        match self {
            CycleOutcome::Progress { written, .. } => *written,
            CycleOutcome::Exhausted => 0,
        }
    }
}

#[derive(Clone)]
pub struct FallbackChain {
    adapters: Vec<Arc<dyn PriceAdapter>>,
}

impl FallbackChain {
    pub fn new(adapters: Vec<Arc<dyn PriceAdapter>>) -> Self {
        Self { adapters }
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.adapters.iter().map(|a| a.name()).collect()
    }

    /// Attempt each adapter in order until one reports progress
    pub async fn run_cycle(&self, sink: &IngestSink) -> CycleOutcome {
        for (index, adapter) in self.adapters.iter().enumerate() {
            match adapter.poll(sink).await {
                Ok(written) if written > 0 => {
                    info!(source = %adapter.name(), written, "Polling cycle stored prices");
                    return CycleOutcome::Progress {
                        index,
                        adapter: adapter.name(),
                        written,
                    };
                }
                Ok(_) => {
                    warn!(source = %adapter.name(), "No prices returned, trying next source");
                }
                Err(e) => {
                    warn!(source = %adapter.name(), error = %e, "Source failed, trying next source");
                }
            }
        }

        error!(sources = ?self.names(), "All polled sources failed this cycle");
        CycleOutcome::Exhausted
    }
}
