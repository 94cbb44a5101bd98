//! Performance profiles: probabilistic delay and fault injection.
//!
//! The evaluator only decides whether an interaction is degraded and which
//! fault applies. Callers turn the outcome into concrete behavior.

use crate::config::PerformanceProfileConfig;
use crate::error::{EngineError, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Abstract fault outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    /// Answer with this status and an empty body
    Status(u16),
    /// Reset the connection (`RST`)
    ConnectionReset,
    /// Close the connection without answering (`FIN`)
    ConnectionClosed,
    /// Answer 200 with an empty body (`EMPTY`)
    Empty,
    /// Explicit "no fault" weight (`PASS`)
    Pass,
}

impl FromStr for Fault {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "RST" => Ok(Fault::ConnectionReset),
            "FIN" => Ok(Fault::ConnectionClosed),
            "EMPTY" => Ok(Fault::Empty),
            "PASS" => Ok(Fault::Pass),
            other => match other.parse::<u16>() {
                Ok(status) if (100..=599).contains(&status) => Ok(Fault::Status(status)),
                _ => Err(EngineError::config(format!("unknown fault {:?}", s))),
            },
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Status(status) => write!(f, "{}", status),
            Fault::ConnectionReset => f.write_str("RST"),
            Fault::ConnectionClosed => f.write_str("FIN"),
            Fault::Empty => f.write_str("EMPTY"),
            Fault::Pass => f.write_str("PASS"),
        }
    }
}

/// Source of uniform numbers in `[0, 1)`.
pub trait RandomSource: Send + Sync {
    fn next_unit(&self) -> f64;
}

/// Thread-local RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_unit(&self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }
}

/// Reproducible RNG seeded once.
#[derive(Debug)]
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for SeededRandom {
    fn next_unit(&self) -> f64 {
        match self.rng.lock() {
            Ok(mut rng) => rng.gen::<f64>(),
            Err(poisoned) => poisoned.into_inner().gen::<f64>(),
        }
    }
}

/// Replays a fixed sequence of draws, cycling when exhausted.
#[derive(Debug)]
pub struct SequenceRandom {
    values: Vec<f64>,
    next: AtomicUsize,
}

impl SequenceRandom {
    pub fn new(values: Vec<f64>) -> Self {
        Self {
            values,
            next: AtomicUsize::new(0),
        }
    }
}

impl RandomSource for SequenceRandom {
    fn next_unit(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.values.len();
        self.values[i].clamp(0.0, 1.0 - f64::EPSILON)
    }
}

/// A resolved performance profile.
#[derive(Debug, Clone)]
pub struct PerformanceProfile {
    pub name: String,
    pub ratio: f64,
    pub delay: Duration,
    /// Faults with positive weight, ordered by name
    faults: Vec<(Fault, f64)>,
}

impl PerformanceProfile {
    pub fn from_config(name: &str, config: &PerformanceProfileConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| EngineError::config(format!("performance profile {}: {}", name, e)))?;
        let mut named: Vec<(&String, f64)> = config
            .faults
            .iter()
            .filter(|(_, weight)| **weight > 0.0)
            .map(|(fault, weight)| (fault, *weight))
            .collect();
        named.sort_by(|a, b| a.0.cmp(b.0));
        let faults = named
            .into_iter()
            .map(|(fault, weight)| Ok((fault.parse::<Fault>()?, weight)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            name: name.to_string(),
            ratio: config.ratio,
            delay: Duration::from_millis(config.delay_ms),
            faults,
        })
    }
}

/// Result of evaluating a profile for one interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Outcome {
    pub affected: bool,
    pub delay: Duration,
    pub fault: Option<Fault>,
}

impl Outcome {
    pub fn unaffected() -> Self {
        Self::default()
    }
}

/// Decides per interaction whether to inject delay and which fault.
#[derive(Clone)]
pub struct PerformanceEvaluator {
    random: Arc<dyn RandomSource>,
}

impl PerformanceEvaluator {
    pub fn new(random: Arc<dyn RandomSource>) -> Self {
        Self { random }
    }

    pub fn evaluate(&self, profile: &PerformanceProfile) -> Outcome {
        let r = self.random.next_unit();
        if r >= profile.ratio {
            return Outcome::unaffected();
        }

        Outcome {
            affected: true,
            delay: profile.delay,
            fault: self.pick_fault(profile),
        }
    }

    fn pick_fault(&self, profile: &PerformanceProfile) -> Option<Fault> {
        let total: f64 = profile.faults.iter().map(|(_, w)| w).sum();
        if profile.faults.is_empty() || total <= 0.0 {
            return None;
        }

        let target = self.random.next_unit() * total;
        let mut cumulative = 0.0;
        let mut chosen = profile.faults.last().map(|(fault, _)| *fault);
        for (fault, weight) in &profile.faults {
            cumulative += weight;
            if target < cumulative {
                chosen = Some(*fault);
                break;
            }
        }

        chosen.filter(|fault| *fault != Fault::Pass)
    }
}

impl Default for PerformanceEvaluator {
    fn default() -> Self {
        Self::new(Arc::new(ThreadRandom))
    }
}

/// All named profiles plus the global default.
#[derive(Debug, Clone, Default)]
pub struct ProfileSet {
    profiles: HashMap<String, Arc<PerformanceProfile>>,
    default: Option<String>,
}

impl ProfileSet {
    pub fn from_config(
        configs: &HashMap<String, PerformanceProfileConfig>,
        default: Option<&str>,
    ) -> Result<Self> {
        let profiles = configs
            .iter()
            .map(|(name, config)| {
                PerformanceProfile::from_config(name, config).map(|p| (name.clone(), Arc::new(p)))
            })
            .collect::<Result<HashMap<_, _>>>()?;
        if let Some(name) = default {
            if !profiles.contains_key(name) {
                return Err(EngineError::config(format!(
                    "unknown performance profile {}",
                    name
                )));
            }
        }
        Ok(Self {
            profiles,
            default: default.map(String::from),
        })
    }

    /// Resolve `specific > service > global default`.
    pub fn resolve(
        &self,
        specific: Option<&str>,
        service: Option<&str>,
    ) -> Result<Option<Arc<PerformanceProfile>>> {
        let Some(name) = specific.or(service).or(self.default.as_deref()) else {
            return Ok(None);
        };
        self.profiles
            .get(name)
            .cloned()
            .map(Some)
            .ok_or_else(|| EngineError::config(format!("unknown performance profile {}", name)))
    }
}
