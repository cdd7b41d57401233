//! Numeric emotional state and the factor model that drives it
//!
//! Emotions are a deterministic summary of the situation, not a simulation:
//! each factor yields a signal in `[-1, 1]`, a fixed contribution matrix maps
//! signals onto the four dimensions, and every dimension decays
//! exponentially toward a baseline between updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Emotional dimensions, in tie-break order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Happiness,
    Worry,
    Boredom,
    Excitement,
}

impl Dimension {
    pub const ALL: [Dimension; 4] = [
        Dimension::Happiness,
        Dimension::Worry,
        Dimension::Boredom,
        Dimension::Excitement,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Dimension::Happiness => "happiness",
            Dimension::Worry => "worry",
            Dimension::Boredom => "boredom",
            Dimension::Excitement => "excitement",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Situation factors, in tie-break order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Factor {
    SystemHealth,
    Interaction,
    Comfort,
    TaskCompletion,
    LearningProgress,
    Novelty,
}

impl Factor {
    pub const ALL: [Factor; 6] = [
        Factor::SystemHealth,
        Factor::Interaction,
        Factor::Comfort,
        Factor::TaskCompletion,
        Factor::LearningProgress,
        Factor::Novelty,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Factor::SystemHealth => "system_health",
            Factor::Interaction => "interaction",
            Factor::Comfort => "comfort",
            Factor::TaskCompletion => "task_completion",
            Factor::LearningProgress => "learning_progress",
            Factor::Novelty => "novelty",
        }
    }

    /// Effect of a +1 signal on `[happiness, worry, boredom, excitement]`
    pub fn contribution_row(&self) -> [f64; 4] {
        match self {
            Factor::SystemHealth => [0.5, -0.8, 0.0, 0.0],
            Factor::Interaction => [0.6, 0.0, -0.7, 0.3],
            Factor::Comfort => [0.7, -0.4, 0.0, 0.0],
            Factor::TaskCompletion => [0.5, -0.5, -0.2, 0.2],
            Factor::LearningProgress => [0.2, 0.0, -0.3, 0.6],
            Factor::Novelty => [0.0, 0.5, -0.6, 0.6],
        }
    }
}

impl fmt::Display for Factor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Weight per factor; missing factors weigh 1.0
pub type FactorWeights = BTreeMap<Factor, f64>;

/// One factor's part in an update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorContribution {
    pub factor: Factor,
    pub signal: f64,
    pub weight: f64,
    /// Total absolute change this factor applied across dimensions
    pub magnitude: f64,
}

/// The four-dimension emotional vector of one scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionalState {
    pub happiness: f64,
    pub worry: f64,
    pub boredom: f64,
    pub excitement: f64,
    pub primary: Dimension,
    pub intensity: f64,
    pub reasoning: String,
    /// What produced the latest update
    pub trigger: String,
    pub updated_at: DateTime<Utc>,
}

impl EmotionalState {
    pub fn at_baseline(baseline: f64, now: DateTime<Utc>) -> Self {
        let b = baseline.clamp(0.0, 1.0);
        let mut state = Self {
            happiness: b,
            worry: b,
            boredom: b,
            excitement: b,
            primary: Dimension::Happiness,
            intensity: b,
            reasoning: "at rest".to_string(),
            trigger: "init".to_string(),
            updated_at: now,
        };
        state.refresh_primary();
        state
    }

    pub fn get(&self, dimension: Dimension) -> f64 {
        match dimension {
            Dimension::Happiness => self.happiness,
            Dimension::Worry => self.worry,
            Dimension::Boredom => self.boredom,
            Dimension::Excitement => self.excitement,
        }
    }

    pub fn set(&mut self, dimension: Dimension, value: f64) {
        let value = if value.is_finite() { value.clamp(0.0, 1.0) } else { 0.0 };
        match dimension {
            Dimension::Happiness => self.happiness = value,
            Dimension::Worry => self.worry = value,
            Dimension::Boredom => self.boredom = value,
            Dimension::Excitement => self.excitement = value,
        }
    }

    /// Move every dimension toward `baseline` for the time elapsed until `now`.
    ///
    /// `d = b + (d - b) * exp(-rate * dt)`. Time never runs backwards: an
    /// older `now` is a no-op.
    pub fn decay_to(&mut self, now: DateTime<Utc>, baseline: f64, rate_per_sec: f64) {
        let elapsed = (now - self.updated_at).num_milliseconds();
        if elapsed <= 0 {
            return;
        }
        let factor = (-rate_per_sec.max(0.0) * elapsed as f64 / 1000.0).exp();
        for dimension in Dimension::ALL {
            let value = self.get(dimension);
            self.set(dimension, baseline + (value - baseline) * factor);
        }
        self.updated_at = now;
        self.refresh_primary();
    }

    /// Apply factor signals. Returns each factor's contribution, in factor order.
    pub fn apply(
        &mut self,
        signals: &[(Factor, f64)],
        weights: &FactorWeights,
        step_gain: f64,
    ) -> Vec<FactorContribution> {
        let mut deltas = [0.0f64; 4];
        let mut contributions = Vec::with_capacity(signals.len());

        for (factor, signal) in signals {
            let signal = signal.clamp(-1.0, 1.0);
            let weight = weights.get(factor).copied().unwrap_or(1.0);
            let row = factor.contribution_row();
            let mut magnitude = 0.0;
            for (i, coefficient) in row.iter().enumerate() {
                let delta = coefficient * signal * weight * step_gain;
                deltas[i] += delta;
                magnitude += delta.abs();
            }
            contributions.push(FactorContribution {
                factor: *factor,
                signal,
                weight,
                magnitude,
            });
        }

        for dimension in Dimension::ALL {
            let value = self.get(dimension) + deltas[dimension.index()];
            self.set(dimension, value);
        }
        self.refresh_primary();
        self.reasoning = reasoning(self.primary, self.intensity, &contributions);
        contributions
    }

    /// Primary is the strongest dimension; ties go to declaration order
    pub fn refresh_primary(&mut self) {
        let mut primary = Dimension::Happiness;
        for dimension in Dimension::ALL {
            if self.get(dimension) > self.get(primary) {
                primary = dimension;
            }
        }
        self.primary = primary;
        self.intensity = self.get(primary);
    }
}

/// The factors ranked by magnitude, ties in factor order
pub fn rank_factors(contributions: &[FactorContribution]) -> Vec<&FactorContribution> {
    let mut ranked: Vec<&FactorContribution> = contributions.iter().collect();
    ranked.sort_by(|a, b| {
        b.magnitude
            .partial_cmp(&a.magnitude)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.factor.cmp(&b.factor))
    });
    ranked
}

fn reasoning(primary: Dimension, intensity: f64, contributions: &[FactorContribution]) -> String {
    let drivers: Vec<String> = rank_factors(contributions)
        .into_iter()
        .filter(|c| c.magnitude > 0.0)
        .take(2)
        .map(|c| format!("{} ({:+.2})", c.factor, c.signal))
        .collect();

    if drivers.is_empty() {
        format!("{} {:.2}, no active factors", primary, intensity)
    } else {
        format!("{} {:.2}, driven by {}", primary, intensity, drivers.join(" and "))
    }
}
