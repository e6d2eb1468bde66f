//! Rule engine — event-driven plus scheduled evaluation.
//!
//! Every bus event (the engine subscribes at the variant root) and a
//! periodic tick run the same pipeline: rules ordered by descending
//! priority then registration order, each gated by enablement, daily quota
//! and cooldown, evaluated under its own mutex so a rule never runs
//! concurrently with itself. A higher-priority rule's side effects are
//! visible to lower-priority rules within the same pass.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{NaiveDate, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::bus::{handler, EventBus};
use super::events::{Event, EventKind};
use super::rules::{CtxValue, Rule, RuleContext, Services};

#[derive(Debug, Clone)]
pub struct RuleEngineConfig {
    /// Interval of the scheduled evaluation pass.
    pub eval_interval: Duration,
}

impl Default for RuleEngineConfig {
    fn default() -> Self {
        Self {
            eval_interval: Duration::from_secs(1),
        }
    }
}

// ─────────────────────────────────────────────────────────
// Per-rule runtime state
// ─────────────────────────────────────────────────────────

struct RuleState {
    enabled: bool,
    last_exec: Option<Instant>,
    execs_today: u32,
    day: NaiveDate,
    total_execs: u64,
}

struct RuleSlot {
    def: Rule,
    seq: usize,
    /// Prevents concurrent evaluation of the same rule.
    eval_lock: tokio::sync::Mutex<()>,
    state: Mutex<RuleState>,
}

#[derive(Debug, Default)]
struct Stats {
    passes: u64,
    fired: u64,
    failed: u64,
    skipped_cooldown: u64,
    skipped_quota: u64,
    skipped_busy: u64,
}

// ─────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────

pub struct RuleEngine {
    cfg: RuleEngineConfig,
    bus: Arc<EventBus>,
    services: Services,
    slots: Mutex<Vec<Arc<RuleSlot>>>,
    global_ctx: Mutex<HashMap<String, CtxValue>>,
    periodic: Mutex<Option<JoinHandle<()>>>,
    next_seq: AtomicUsize,
    stats: Mutex<Stats>,
}

impl RuleEngine {
    pub fn new(cfg: RuleEngineConfig, bus: Arc<EventBus>, services: Services) -> Self {
        Self {
            cfg,
            bus,
            services,
            slots: Mutex::new(Vec::new()),
            global_ctx: Mutex::new(HashMap::new()),
            periodic: Mutex::new(None),
            next_seq: AtomicUsize::new(0),
            stats: Mutex::new(Stats::default()),
        }
    }

    // ─────────────────────────────────────────────────
    // Registry
    // ─────────────────────────────────────────────────

    pub fn register_rule(&self, rule: Rule) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        debug!(
            "rule registered: {} '{}' prio={} cooldown={:?}",
            rule.rule_id, rule.name, rule.priority, rule.cooldown
        );
        let slot = Arc::new(RuleSlot {
            state: Mutex::new(RuleState {
                enabled: rule.enabled,
                last_exec: None,
                execs_today: 0,
                day: Utc::now().date_naive(),
                total_execs: 0,
            }),
            def: rule,
            seq,
            eval_lock: tokio::sync::Mutex::new(()),
        });
        self.slots.lock().expect("rule registry poisoned").push(slot);
    }

    pub fn unregister_rule(&self, rule_id: &str) -> bool {
        let mut slots = self.slots.lock().expect("rule registry poisoned");
        let before = slots.len();
        slots.retain(|s| s.def.rule_id != rule_id);
        slots.len() < before
    }

    pub fn set_enabled(&self, rule_id: &str, enabled: bool) -> bool {
        let slots = self.slots.lock().expect("rule registry poisoned");
        for slot in slots.iter() {
            if slot.def.rule_id == rule_id {
                slot.state.lock().expect("rule state poisoned").enabled = enabled;
                return true;
            }
        }
        false
    }

    pub fn set_context(&self, key: impl Into<String>, value: CtxValue) {
        self.global_ctx
            .lock()
            .expect("global context poisoned")
            .insert(key.into(), value);
    }

    pub fn update_context(&self, values: HashMap<String, CtxValue>) {
        self.global_ctx
            .lock()
            .expect("global context poisoned")
            .extend(values);
    }

    /// Clear the cooldown clock of every rule scoped to `symbol`. Returns
    /// how many rules were reset.
    pub fn reset_cooldown_for_symbol(&self, symbol: &str) -> usize {
        let slots = self.slots.lock().expect("rule registry poisoned");
        let mut reset = 0;
        for slot in slots.iter() {
            let scoped = slot
                .def
                .scoped_context
                .get("symbol")
                .and_then(|v| v.as_str());
            if scoped == Some(symbol) {
                slot.state.lock().expect("rule state poisoned").last_exec = None;
                reset += 1;
            }
        }
        reset
    }

    // ─────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────

    /// Subscribe to the event root and start the scheduled pass. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut periodic = self.periodic.lock().expect("periodic handle poisoned");
        if periodic.is_some() {
            return;
        }

        let engine = Arc::clone(self);
        self.bus.subscribe(
            EventKind::Any,
            "rule-engine",
            handler(move |evt| {
                let engine = engine.clone();
                async move {
                    engine.process(Some(evt)).await;
                    Ok(())
                }
            }),
        );

        let engine = Arc::clone(self);
        *periodic = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.cfg.eval_interval);
            loop {
                ticker.tick().await;
                engine.process(None).await;
            }
        }));

        info!(
            "rule engine started | {} rule(s), scheduled every {:?}",
            self.slots.lock().expect("rule registry poisoned").len(),
            self.cfg.eval_interval,
        );
    }

    /// Cancel the scheduled pass and unsubscribe. In-flight evaluations
    /// finish on their own.
    pub fn stop(&self) {
        if let Some(handle) = self
            .periodic
            .lock()
            .expect("periodic handle poisoned")
            .take()
        {
            handle.abort();
        }
        self.bus.unsubscribe(EventKind::Any, "rule-engine");

        let stats = self.stats.lock().expect("stats poisoned");
        info!(
            "rule engine stopped | passes={} fired={} failed={} skip(cooldown={} quota={} busy={})",
            stats.passes,
            stats.fired,
            stats.failed,
            stats.skipped_cooldown,
            stats.skipped_quota,
            stats.skipped_busy,
        );
    }

    // ─────────────────────────────────────────────────
    // Evaluation
    // ─────────────────────────────────────────────────

    /// One pass over every rule. `event` is absent on scheduled passes,
    /// where event conditions evaluate false.
    pub async fn process(&self, event: Option<Event>) {
        let mut slots: Vec<Arc<RuleSlot>> = self
            .slots
            .lock()
            .expect("rule registry poisoned")
            .clone();
        slots.sort_by(|a, b| {
            b.def
                .priority
                .cmp(&a.def.priority)
                .then(a.seq.cmp(&b.seq))
        });

        let global: HashMap<String, CtxValue> = self
            .global_ctx
            .lock()
            .expect("global context poisoned")
            .clone();

        self.stats.lock().expect("stats poisoned").passes += 1;

        for slot in slots {
            // Gates under the state lock, then release before evaluating.
            {
                let mut st = slot.state.lock().expect("rule state poisoned");
                if !st.enabled {
                    continue;
                }
                let today = Utc::now().date_naive();
                if st.day != today {
                    st.day = today;
                    st.execs_today = 0;
                }
                if let Some(max) = slot.def.max_per_day {
                    if st.execs_today >= max {
                        self.stats.lock().expect("stats poisoned").skipped_quota += 1;
                        continue;
                    }
                }
                if let (Some(cooldown), Some(last)) = (slot.def.cooldown, st.last_exec) {
                    if last.elapsed() < cooldown {
                        self.stats.lock().expect("stats poisoned").skipped_cooldown += 1;
                        continue;
                    }
                }
            }

            // A rule never evaluates concurrently with itself.
            let Ok(_guard) = slot.eval_lock.try_lock() else {
                self.stats.lock().expect("stats poisoned").skipped_busy += 1;
                continue;
            };

            let mut vars = global.clone();
            vars.extend(slot.def.scoped_context.clone());
            let ctx = RuleContext {
                event: event.clone(),
                services: self.services.clone(),
                vars,
            };

            if !slot.def.condition.evaluate(&ctx).await {
                continue;
            }

            debug!("rule fired: {} '{}'", slot.def.rule_id, slot.def.name);
            if slot.def.action.execute(&ctx).await {
                let mut st = slot.state.lock().expect("rule state poisoned");
                st.last_exec = Some(Instant::now());
                st.execs_today += 1;
                st.total_execs += 1;
                self.stats.lock().expect("stats poisoned").fired += 1;
            } else {
                warn!("rule action failed: {} '{}'", slot.def.rule_id, slot.def.name);
                self.stats.lock().expect("stats poisoned").failed += 1;
            }
        }
    }
}
