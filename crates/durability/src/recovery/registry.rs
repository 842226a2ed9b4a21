//! Recovery strategy registry
//!
//! Each segment records the tag of the strategy that must be used to recover
//! it. A process opening the segment looks the tag up here; an unknown tag
//! is an error rather than a silent fallback to some other strategy.

use rustc_hash::FxHashMap;
use std::sync::Arc;

use strata_queue_core::{Error, RecoveryConfig, SharedClock, SharedWarnSink};
use strata_queue_storage::{MappedSegment, SharedValue};

use super::error::{RecoveryError, RecoveryResult};
use super::timed::TimedStoreRecovery;
use super::StoreRecovery;

/// Everything a strategy needs to bind to one segment.
#[derive(Clone)]
pub struct RecoveryContext {
    /// Segment slot reserved for the strategy's lock
    pub timestamp: SharedValue,
    /// Wall clock for lock deadlines
    pub clock: SharedClock,
    /// Where warnings go
    pub warnings: SharedWarnSink,
    /// Padding and retry settings
    pub config: RecoveryConfig,
}

impl RecoveryContext {
    /// Context bound to `segment`'s recovery slot
    pub fn for_segment(
        segment: &MappedSegment,
        clock: SharedClock,
        warnings: SharedWarnSink,
        config: RecoveryConfig,
    ) -> Self {
        RecoveryContext {
            timestamp: segment.recovery_timestamp(),
            clock,
            warnings,
            config,
        }
    }
}

/// Builds a strategy for one segment.
pub type RecoveryFactory = fn(&RecoveryContext) -> RecoveryResult<Arc<dyn StoreRecovery>>;

struct Registration {
    name: String,
    factory: RecoveryFactory,
}

/// Tag -> strategy constructor.
pub struct RecoveryRegistry {
    by_tag: FxHashMap<u32, Registration>,
    by_name: FxHashMap<String, u32>,
}

impl RecoveryRegistry {
    /// Registry with nothing registered
    pub fn new() -> Self {
        RecoveryRegistry {
            by_tag: FxHashMap::default(),
            by_name: FxHashMap::default(),
        }
    }

    /// Registry with the built-in strategies
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.by_name.insert(TimedStoreRecovery::NAME.to_string(), TimedStoreRecovery::TAG);
        registry.by_tag.insert(
            TimedStoreRecovery::TAG,
            Registration {
                name: TimedStoreRecovery::NAME.to_string(),
                factory: timed_factory,
            },
        );
        registry
    }

    /// Add a strategy. Tags and names must be unique.
    pub fn register(
        &mut self,
        tag: u32,
        name: impl Into<String>,
        factory: RecoveryFactory,
    ) -> RecoveryResult<()> {
        let name = name.into();
        if self.by_tag.contains_key(&tag) {
            return Err(Error::invalid(format!("recovery tag {} already registered", tag)).into());
        }
        if self.by_name.contains_key(&name) {
            return Err(
                Error::invalid(format!("recovery strategy '{}' already registered", name)).into(),
            );
        }
        self.by_name.insert(name.clone(), tag);
        self.by_tag.insert(tag, Registration { name, factory });
        Ok(())
    }

    /// Build the strategy registered under `tag`
    pub fn resolve(&self, tag: u32, ctx: &RecoveryContext) -> RecoveryResult<Arc<dyn StoreRecovery>> {
        let registration = self
            .by_tag
            .get(&tag)
            .ok_or(RecoveryError::UnknownStrategy(tag))?;
        (registration.factory)(ctx)
    }

    /// Tag registered under `name`
    pub fn tag_for_name(&self, name: &str) -> RecoveryResult<u32> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| RecoveryError::UnknownStrategyName(name.to_string()))
    }

    /// Name registered under `tag`
    pub fn name_for_tag(&self, tag: u32) -> Option<&str> {
        self.by_tag.get(&tag).map(|r| r.name.as_str())
    }

    /// Registered tags, ascending
    pub fn tags(&self) -> Vec<u32> {
        let mut tags: Vec<u32> = self.by_tag.keys().copied().collect();
        tags.sort_unstable();
        tags
    }
}

impl Default for RecoveryRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for RecoveryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.tags().into_iter().map(|t| (t, self.name_for_tag(t))))
            .finish()
    }
}

fn timed_factory(ctx: &RecoveryContext) -> RecoveryResult<Arc<dyn StoreRecovery>> {
    Ok(Arc::new(TimedStoreRecovery::new(
        ctx.timestamp.clone(),
        Arc::clone(&ctx.clock),
        Arc::clone(&ctx.warnings),
        ctx.config.padding,
        ctx.config.max_attempts,
    )))
}
