//! Shadow testing of large parameter changes
//!
//! A large proposal is not applied. Instead each following controller run
//! records the latest realized P&L next to a simulated P&L scaled by
//! `proposed / live`. After the configured number of samples the change is
//! promoted only if the simulated average beats the real one.

use serde::{Deserialize, Serialize};

use crate::risk::ParamKey;
use crate::utils::helpers::mean;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShadowSample {
    pub cycle: u64,
    pub real_pl: f64,
    pub simulated_pl: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowTest {
    pub param: ParamKey,
    pub proposed_value: f64,
    pub start_cycle: u64,
    pub samples: Vec<ShadowSample>,
}

/// Result of a completed test
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ShadowVerdict {
    Promote { avg_simulated: f64, avg_real: f64 },
    Reject { avg_simulated: f64, avg_real: f64 },
}

impl ShadowTest {
    pub fn new(param: ParamKey, proposed_value: f64, start_cycle: u64) -> Self {
        Self {
            param,
            proposed_value,
            start_cycle,
            samples: Vec::new(),
        }
    }

    /// Record one run. `live_value` is the parameter's current live value.
    pub fn record(&mut self, cycle: u64, real_pl: f64, live_value: f64) {
        let ratio = if live_value != 0.0 { self.proposed_value / live_value } else { 1.0 };
        self.samples.push(ShadowSample {
            cycle,
            real_pl,
            simulated_pl: real_pl * ratio,
        });
    }

    pub fn is_complete(&self, required: usize) -> bool {
        self.samples.len() >= required
    }

    pub fn verdict(&self) -> ShadowVerdict {
        let real: Vec<f64> = self.samples.iter().map(|s| s.real_pl).collect();
        let simulated: Vec<f64> = self.samples.iter().map(|s| s.simulated_pl).collect();
        let avg_real = mean(&real).unwrap_or(0.0);
        let avg_simulated = mean(&simulated).unwrap_or(0.0);
        if avg_simulated > avg_real {
            ShadowVerdict::Promote { avg_simulated, avg_real }
        } else {
            ShadowVerdict::Reject { avg_simulated, avg_real }
        }
    }
}
